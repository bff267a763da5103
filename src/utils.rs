//! Small numeric helpers.

use nalgebra::{DMatrix, DVector, RealField};
use num_traits::Float;

use crate::Objective;

/// Infinity norm `$\max_i |v_i|$` of a vector.
pub(crate) fn norm_inf<F: RealField + Float + Copy>(v: &DVector<F>) -> F {
    v.iter()
        .fold(F::zero(), |max, &x| Float::max(max, Float::abs(x)))
}

/// Compute a [numerical approximation](https://en.wikipedia.org/wiki/Numerical_differentiation)
/// to the Jacobian of an objective, for testing.
///
/// Use this to check a hand-written [`Objective::compute_jacobian`] against
/// central difference quotients. Numerical differentiation is inherently
/// less accurate than the floating point precision, so compare with a
/// tolerance well above `$10^{-15}$` for `f64`; if possible use `f64` for
/// the comparison.
///
/// # Example
///
/// ```
/// # use approx::assert_relative_eq;
/// # use hybrid_optimizer::{differentiate_numerically, Objective};
/// # use nalgebra::{DMatrix, DVector};
/// struct Himmelblau;
///
/// impl Objective<f64> for Himmelblau {
///     fn residual_count(&self) -> usize { 2 }
///     fn parameter_count(&self) -> usize { 2 }
///
///     fn compute_residuals(&mut self, x: &DVector<f64>, f: &mut DVector<f64>) {
///         f[0] = x[0] * x[0] + x[1] - 11.0;
///         f[1] = x[0] + x[1] * x[1] - 7.0;
///     }
///
///     fn compute_jacobian(&mut self, x: &DVector<f64>, _f: &DVector<f64>, j: &mut DMatrix<f64>) {
///         j[(0, 0)] = 2.0 * x[0];
///         j[(0, 1)] = 1.0;
///         j[(1, 0)] = 1.0;
///         j[(1, 1)] = 2.0 * x[1];
///     }
/// }
///
/// let x = DVector::from_column_slice(&[0.6, -1.9]);
/// let jacobian_numerical = differentiate_numerically(&x, &mut Himmelblau);
///
/// let mut f = DVector::zeros(2);
/// let mut jacobian = DMatrix::zeros(2, 2);
/// Himmelblau.compute_residuals(&x, &mut f);
/// Himmelblau.compute_jacobian(&x, &f, &mut jacobian);
/// assert_relative_eq!(jacobian_numerical, jacobian, epsilon = 1e-7);
/// ```
pub fn differentiate_numerically<F, O>(x: &DVector<F>, objective: &mut O) -> DMatrix<F>
where
    F: RealField + Float + Copy,
    O: Objective<F>,
{
    let m = objective.residual_count();
    let n = objective.parameter_count();
    assert_eq!(x.len(), n, "parameter vector length mismatch");

    let step_scale = Float::cbrt(F::default_epsilon());
    let mut jacobian = DMatrix::zeros(m, n);
    let mut x_perturbed = x.clone();
    let mut f_plus = DVector::zeros(m);
    let mut f_minus = DVector::zeros(m);
    for j in 0..n {
        let step = step_scale * Float::max(Float::abs(x[j]), F::one());
        x_perturbed[j] = x[j] + step;
        objective.compute_residuals(&x_perturbed, &mut f_plus);
        x_perturbed[j] = x[j] - step;
        objective.compute_residuals(&x_perturbed, &mut f_minus);
        x_perturbed[j] = x[j];
        let two_step = step + step;
        for i in 0..m {
            jacobian[(i, j)] = (f_plus[i] - f_minus[i]) / two_step;
        }
    }
    jacobian
}
