//! Dense symmetric solvers for the step equation `$\mathbf{M}\vec{h} = -\vec{g}$`.
//!
//! Two modes are offered, matching the two ways the optimizer can be
//! configured: an LDLᵀ factorization with back-substitution for the default
//! path, and a truncated self-adjoint eigendecomposition which deflates
//! near-zero eigenvalues and therefore tolerates rank-deficient systems.

#[cfg(test)]
use approx::assert_relative_eq;
use nalgebra::{DMatrix, DVector, RealField};
use num_traits::Float;

/// LDLᵀ factorization of a symmetric matrix, with storage allocated once.
///
/// The factorization runs without pivoting and without a singularity test.
/// A numerically indefinite or singular input still factors; it merely
/// yields non-finite entries in the solution, which the caller's step
/// acceptance test rejects. The Levenberg-Marquardt damping `$\mu$` or the
/// positive definiteness of the BFGS matrix is what keeps the input
/// well-conditioned in practice.
pub(crate) struct LdltFactor<F> {
    /// `$\mathbf{L}$` strictly below the diagonal, `$\mathbf{D}$` on it.
    ld: DMatrix<F>,
}

impl<F: RealField + Float + Copy> LdltFactor<F> {
    pub fn new(n: usize) -> Self {
        Self {
            ld: DMatrix::zeros(n, n),
        }
    }

    /// Factor the symmetric matrix `m`, reading only its lower triangle.
    pub fn compute(&mut self, m: &DMatrix<F>) {
        let n = self.ld.nrows();
        for j in 0..n {
            let mut d = m[(j, j)];
            for k in 0..j {
                let l_jk = self.ld[(j, k)];
                d -= l_jk * l_jk * self.ld[(k, k)];
            }
            self.ld[(j, j)] = d;
            for i in (j + 1)..n {
                let mut sum = m[(i, j)];
                for k in 0..j {
                    sum -= self.ld[(i, k)] * self.ld[(j, k)] * self.ld[(k, k)];
                }
                self.ld[(i, j)] = sum / d;
            }
        }
    }

    /// Solve `$\mathbf{M}\vec{x} = \vec{b}$` in place using the current factorization.
    pub fn solve_into(&self, rhs: &mut DVector<F>) {
        let n = self.ld.nrows();
        // L z = b, with L unit lower triangular
        for i in 0..n {
            let mut sum = rhs[i];
            for k in 0..i {
                sum -= self.ld[(i, k)] * rhs[k];
            }
            rhs[i] = sum;
        }
        for i in 0..n {
            rhs[i] /= self.ld[(i, i)];
        }
        // L^T x = D^-1 z
        for i in (0..n).rev() {
            let mut sum = rhs[i];
            for k in (i + 1)..n {
                sum -= self.ld[(k, i)] * rhs[k];
            }
            rhs[i] = sum;
        }
    }
}

/// Solve `$\mathbf{M}\vec{h} = -\vec{g}$` through a truncated eigendecomposition.
///
/// Eigenvalues below `$\lambda_{\max}\cdot\varepsilon$` are deflated, where
/// `$\lambda_{\max}$` is the algebraically largest eigenvalue and
/// `$\varepsilon$` the machine epsilon. The solution is the minimum-norm one
/// over the retained eigenpairs, so a rank-deficient `$\mathbf{M}$` still
/// produces a finite step. Returns the effective rank.
pub(crate) fn deflated_eigen_solve<F: RealField + Float + Copy>(
    m: &DMatrix<F>,
    g: &DVector<F>,
    h: &mut DVector<F>,
) -> usize {
    let eigh = m.clone().symmetric_eigen();
    let lambda_max = eigh
        .eigenvalues
        .iter()
        .fold(F::neg_infinity(), |max, &lambda| Float::max(max, lambda));
    let threshold = lambda_max * F::default_epsilon();
    let mut rank = 0;
    h.fill(F::zero());
    for (i, &lambda) in eigh.eigenvalues.iter().enumerate() {
        // written so that a NaN eigenvalue is kept and poisons the step,
        // which the acceptance test then rejects
        if !(lambda < threshold) {
            rank += 1;
            let column = eigh.eigenvectors.column(i);
            h.axpy(-(column.dot(g)) / lambda, &column, F::one());
        }
    }
    rank
}

#[test]
fn ldlt_solves_spd_system() {
    #[rustfmt::skip]
    let m = DMatrix::<f64>::from_row_slice(3, 3, &[
        4.0,  1.0,  0.5,
        1.0,  3.0, -1.0,
        0.5, -1.0,  2.5,
    ]);
    let mut factor = LdltFactor::new(3);
    factor.compute(&m);
    let b = DVector::from_column_slice(&[1.0, -2.0, 0.5]);
    let mut x = b.clone();
    factor.solve_into(&mut x);
    assert_relative_eq!(&m * &x, b, epsilon = 1e-12);
}

#[test]
fn ldlt_solves_indefinite_system() {
    // one negative eigenvalue; the factorization proceeds regardless
    #[rustfmt::skip]
    let m = DMatrix::<f64>::from_row_slice(2, 2, &[
        2.0, 3.0,
        3.0, 1.0,
    ]);
    let mut factor = LdltFactor::new(2);
    factor.compute(&m);
    let b = DVector::from_column_slice(&[1.0, 4.0]);
    let mut x = b.clone();
    factor.solve_into(&mut x);
    assert_relative_eq!(&m * &x, b, epsilon = 1e-12);
}

#[test]
fn ldlt_singular_system_yields_non_finite_solution() {
    #[rustfmt::skip]
    let m = DMatrix::<f64>::from_row_slice(2, 2, &[
        1.0, 1.0,
        1.0, 1.0,
    ]);
    let mut factor = LdltFactor::new(2);
    factor.compute(&m);
    let mut x = DVector::from_column_slice(&[1.0, 2.0]);
    factor.solve_into(&mut x);
    assert!(x.iter().any(|v| !v.is_finite()));
}

#[test]
fn eigen_solve_of_identity_is_negated_gradient() {
    let m = DMatrix::<f64>::identity(3, 3);
    let g = DVector::from_column_slice(&[1.0, -2.0, 0.5]);
    let mut h = DVector::zeros(3);
    let rank = deflated_eigen_solve(&m, &g, &mut h);
    assert_eq!(rank, 3);
    assert_relative_eq!(h, -g, epsilon = 1e-14);
}

#[test]
fn eigen_solve_deflates_a_singular_matrix() {
    // m = v v^T has rank one
    let v = DVector::from_column_slice(&[1.0, 1.0]);
    let m = &v * v.transpose();
    // gradient in the range of m, so the retained eigenpair solves exactly
    let g = &v * 3.0;
    let mut h = DVector::zeros(2);
    let rank = deflated_eigen_solve(&m, &g, &mut h);
    assert_eq!(rank, 1);
    assert!(h.iter().all(|x| x.is_finite()));
    assert_relative_eq!(&m * &h, -g, epsilon = 1e-12);
}

#[test]
fn eigen_solve_drops_everything_below_the_threshold() {
    // all eigenvalues negative: nothing reaches lambda_max * eps
    let m = DMatrix::<f64>::identity(2, 2) * -1.0;
    let g = DVector::from_column_slice(&[1.0, 2.0]);
    let mut h = DVector::from_column_slice(&[9.0, 9.0]);
    let rank = deflated_eigen_solve(&m, &g, &mut h);
    assert_eq!(rank, 0);
    assert_relative_eq!(h, DVector::zeros(2));
}
