//! The hybrid Levenberg-Marquardt / BFGS iteration engine.
//!
//! Levenberg-Marquardt has strong global convergence on least-squares
//! problems but slows to linear convergence near a minimum where the
//! residuals do not vanish; a quasi-Newton BFGS iteration is superlinear
//! there but has no comparable global behavior. The engine therefore runs
//! Levenberg-Marquardt by default and switches to BFGS when the damped
//! steps look nearly linear (or when rejections drive the damping growth
//! factor past its limit), falling back to Levenberg-Marquardt whenever
//! BFGS stops making gradient progress.
//!
//! The method follows Madsen, Nielsen and Tingleff, *Methods for Non-Linear
//! Least Squares Problems*, chapter 5 (the hybrid L-M/quasi-Newton method).

use bitflags::bitflags;
use log::{debug, trace};
use nalgebra::{convert, DMatrix, DVector, RealField};
use num_traits::Float;

use crate::solver::{deflated_eigen_solve, LdltFactor};
use crate::utils::norm_inf;
use crate::{Objective, StepResult};

#[cfg(test)]
mod test_step;

bitflags! {
    /// Progress and termination flags of an optimization.
    ///
    /// The `STEP_*` flags describe the most recent step and may be set and
    /// cleared from one [`step`](HybridOptimization::step) to the next. The
    /// `SUCCESS_*` and `FAILURE_*` flags are sticky: once set they are never
    /// cleared, and any of them stops [`run`](HybridOptimization::run).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct State: u32 {
        /// The last step improved the objective and was committed.
        const STEP_ACCEPTED = 1 << 0;
        /// The last proposal was overwritten by the objective's `try_step`.
        const STEP_MODIFIED = 1 << 1;
        /// The last proposal was rejected unevaluated by `try_step`.
        const STEP_INVALID = 1 << 2;
        /// The residual infinity norm dropped to `ftol` or below.
        const SUCCESS_FTOL = 1 << 3;
        /// The gradient infinity norm dropped to `gtol` or below.
        const SUCCESS_GTOL = 1 << 4;
        /// The step length collapsed below the `min_step` floor.
        const FAILURE_MINSTEP = 1 << 5;
        /// The trust radius collapsed below the `min_step` floor.
        const FAILURE_MINTRUST = 1 << 6;
        /// The driver exhausted `max_iter` iterations.
        const FAILURE_MAXITER = 1 << 7;

        /// Any successful termination.
        const SUCCESS = Self::SUCCESS_FTOL.bits() | Self::SUCCESS_GTOL.bits();
        /// Any failed termination.
        const FAILURE = Self::FAILURE_MINSTEP.bits()
            | Self::FAILURE_MINTRUST.bits()
            | Self::FAILURE_MAXITER.bits();
        /// Any terminal flag.
        const FINISHED = Self::SUCCESS.bits() | Self::FAILURE.bits();
    }
}

/// The step strategy currently driving the iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// Damped Gauss-Newton steps from `$(\mathbf{J}^\top\mathbf{J} + \mu\mathbf{I})\vec{h} = -\vec{g}$`.
    LevenbergMarquardt,
    /// Quasi-Newton steps from `$\mathbf{B}\vec{h} = -\vec{g}$`, clipped to the trust radius `$\delta$`.
    Bfgs,
}

/// Hyperparameters of the hybrid optimizer.
///
/// The runtime and termination behavior can be controlled with the `with_*`
/// builder methods; see [`optimize`](HybridOptimizer::optimize) and
/// [`minimize`](HybridOptimizer::minimize) to start an optimization.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HybridOptimizer<F> {
    ftol: F,
    gtol: F,
    min_step: F,
    delta0: F,
    tau: F,
    max_iter: usize,
    use_cholesky: bool,
}

impl<F: RealField + Float + Copy> Default for HybridOptimizer<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: RealField + Float + Copy> HybridOptimizer<F> {
    pub fn new() -> Self {
        Self {
            ftol: convert(1e-8),
            gtol: convert(1e-8),
            min_step: convert(1e-8),
            delta0: F::one(),
            tau: convert(1e-3),
            max_iter: 200,
            use_cholesky: true,
        }
    }

    /// Set the residual infinity-norm threshold for convergence.
    ///
    /// # Panics
    ///
    /// Panics if `$\mathtt{ftol} \leq 0$`.
    pub fn with_ftol(self, ftol: F) -> Self {
        assert!(ftol > F::zero(), "ftol must be > 0");
        Self { ftol, ..self }
    }

    /// Set the gradient infinity-norm threshold for convergence.
    ///
    /// # Panics
    ///
    /// Panics if `$\mathtt{gtol} \leq 0$`.
    pub fn with_gtol(self, gtol: F) -> Self {
        assert!(gtol > F::zero(), "gtol must be > 0");
        Self { gtol, ..self }
    }

    /// Set the minimum relative step length below which the optimization
    /// gives up with [`State::FAILURE_MINSTEP`].
    ///
    /// # Panics
    ///
    /// Panics if `$\mathtt{min\_step} \leq 0$`.
    pub fn with_min_step(self, min_step: F) -> Self {
        assert!(min_step > F::zero(), "min_step must be > 0");
        Self { min_step, ..self }
    }

    /// Set the initial BFGS trust radius `$\delta_0$`.
    ///
    /// # Panics
    ///
    /// Panics if `$\mathtt{delta0} \leq 0$`.
    pub fn with_delta0(self, delta0: F) -> Self {
        assert!(delta0 > F::zero(), "delta0 must be > 0");
        Self { delta0, ..self }
    }

    /// Set the scale factor for the initial damping,
    /// `$\mu_0 = \tau\cdot\max_i (\mathbf{J}^\top\mathbf{J})_{ii}$`.
    ///
    /// Typical values lie between `$10^{-3}$` (good initial guess) and `$1$`.
    ///
    /// # Panics
    ///
    /// Panics if `$\mathtt{tau} \leq 0$`.
    pub fn with_tau(self, tau: F) -> Self {
        assert!(tau > F::zero(), "tau must be > 0");
        Self { tau, ..self }
    }

    /// Set the iteration bound for [`run`](HybridOptimization::run).
    ///
    /// # Panics
    ///
    /// Panics if `$\mathtt{max\_iter} = 0$`.
    pub fn with_max_iter(self, max_iter: usize) -> Self {
        assert!(max_iter > 0, "max_iter must be > 0");
        Self { max_iter, ..self }
    }

    /// Choose between the LDLᵀ solve (`true`, the default) and the deflated
    /// eigendecomposition solve (`false`) for the step equation.
    pub fn with_cholesky(self, use_cholesky: bool) -> Self {
        Self {
            use_cholesky,
            ..self
        }
    }

    /// Start an optimization of `objective` at `initial_x`.
    ///
    /// The returned engine borrows the objective for its lifetime and owns
    /// every buffer it needs; stepping does not allocate.
    pub fn optimize<'a, O: Objective<F>>(
        &self,
        initial_x: DVector<F>,
        objective: &'a mut O,
    ) -> HybridOptimization<'a, F, O> {
        HybridOptimization::new(*self, initial_x, objective)
    }

    /// Run an optimization of `objective` to completion.
    ///
    /// Returns the final parameters together with the final [`State`]; check
    /// `state.intersects(State::SUCCESS)` to see whether a tolerance was
    /// reached.
    pub fn minimize<O: Objective<F>>(
        &self,
        initial_x: DVector<F>,
        objective: &mut O,
    ) -> (DVector<F>, State) {
        let mut optimization = self.optimize(initial_x, objective);
        let state = optimization.run();
        (optimization.x, state)
    }
}

/// A running optimization: the current iterate and every derived quantity.
///
/// Use [`step`](Self::step) to advance one iteration at a time and inspect
/// the intermediate state, or [`run`](Self::run) to iterate until a terminal
/// flag is set. All buffers are allocated at construction and reused.
pub struct HybridOptimization<'a, F, O> {
    ctrl: HybridOptimizer<F>,
    objective: &'a mut O,
    method: Method,
    state: State,
    /// Consecutive near-linear accepted L-M steps, for the switch heuristic.
    count: u32,
    /// Effective rank reported by the last eigen-mode solve.
    rank: usize,
    x: DVector<F>,
    x_new: DVector<F>,
    f: DVector<F>,
    f_new: DVector<F>,
    j: DMatrix<F>,
    j_new: DMatrix<F>,
    g: DVector<F>,
    g_new: DVector<F>,
    /// Last computed step direction.
    h: DVector<F>,
    y: DVector<F>,
    v: DVector<F>,
    /// Scratch of length `$m$` for products `$\mathbf{J}\vec{h}$`.
    jh: DVector<F>,
    /// `$\mathbf{J}^\top\mathbf{J} + \mu\mathbf{I}$` while the L-M method is active.
    a: DMatrix<F>,
    /// BFGS approximation of the Hessian of `$Q$`; kept across method switches.
    b: DMatrix<F>,
    ldlt: LdltFactor<F>,
    norm_inf_f: F,
    norm_inf_g: F,
    q: F,
    q_new: F,
    mu: F,
    nu: F,
    delta: F,
}

impl<'a, F, O> HybridOptimization<'a, F, O>
where
    F: RealField + Float + Copy,
    O: Objective<F>,
{
    fn new(ctrl: HybridOptimizer<F>, initial_x: DVector<F>, objective: &'a mut O) -> Self {
        let n = objective.parameter_count();
        let m = objective.residual_count();
        assert!(n > 0, "objective has no parameters");
        assert!(m > 0, "objective has no residuals");
        assert_eq!(initial_x.len(), n, "initial parameter vector length mismatch");

        let x = initial_x;
        let x_new = x.clone();
        let mut f_new = DVector::zeros(m);
        objective.compute_residuals(&x_new, &mut f_new);
        let f = f_new.clone();
        let mut j_new = DMatrix::zeros(m, n);
        objective.compute_jacobian(&x_new, &f_new, &mut j_new);
        let j = j_new.clone();

        let mut a = DMatrix::zeros(n, n);
        j.tr_mul_to(&j, &mut a);
        let mut g = DVector::zeros(n);
        j.tr_mul_to(&f, &mut g);

        let norm_inf_f = norm_inf(&f);
        let norm_inf_g = norm_inf(&g);
        let q = f.norm_squared() * convert(0.5);
        let mu = ctrl.tau
            * (0..n).fold(F::zero(), |max, i| Float::max(max, Float::abs(a[(i, i)])));
        for i in 0..n {
            a[(i, i)] += mu;
        }

        Self {
            objective,
            method: Method::LevenbergMarquardt,
            state: State::empty(),
            count: 0,
            rank: n,
            x,
            x_new,
            f,
            f_new,
            j,
            j_new,
            g,
            g_new: DVector::zeros(n),
            h: DVector::zeros(n),
            y: DVector::zeros(n),
            v: DVector::zeros(n),
            jh: DVector::zeros(m),
            a,
            b: DMatrix::identity(n, n),
            ldlt: LdltFactor::new(n),
            norm_inf_f,
            norm_inf_g,
            q,
            q_new: q,
            mu,
            nu: convert(2.0),
            delta: ctrl.delta0,
            ctrl,
        }
    }

    /// Execute a single iteration and return the updated state.
    pub fn step(&mut self) -> State {
        let sqrt_eps = Float::sqrt(F::default_epsilon());
        let half: F = convert(0.5);
        let two: F = convert(2.0);
        let mut is_better = false;
        let mut should_switch = false;

        match self.method {
            Method::LevenbergMarquardt => self.solve_direction(true),
            Method::Bfgs => self.solve_direction(false),
        }

        let mut norm_h = self.h.norm();
        if !self.check_step(norm_h, State::FAILURE_MINSTEP) {
            return self.state;
        }
        if self.method == Method::Bfgs && norm_h > self.delta {
            self.h *= self.delta / norm_h;
        }
        self.x_new.copy_from(&self.x);
        self.x_new += &self.h;

        let vetted = self.objective.try_step(&self.x, &mut self.x_new);
        match vetted {
            StepResult::Modified => {
                // Proceed with the objective's replacement as if it were the
                // proposal, but first check that it goes anywhere at all.
                self.state.insert(State::STEP_MODIFIED);
                self.h.copy_from(&self.x_new);
                self.h -= &self.x;
                norm_h = self.h.norm();
                if !self.check_step(norm_h, State::FAILURE_MINSTEP) {
                    return self.state;
                }
            }
            StepResult::Invalid => {
                // No evaluation, but the trust region parameters (delta or
                // mu, nu) are still updated below. Without an evaluation the
                // BFGS matrix cannot be updated this step.
                self.state.insert(State::STEP_INVALID);
                self.q_new = F::infinity();
            }
            StepResult::Valid => {
                self.state.remove(State::STEP_MODIFIED | State::STEP_INVALID);
            }
        }
        let evaluated = vetted != StepResult::Invalid;
        if evaluated {
            self.objective.compute_residuals(&self.x_new, &mut self.f_new);
            self.q_new = self.f_new.norm_squared() * half;
            self.objective
                .compute_jacobian(&self.x_new, &self.f_new, &mut self.j_new);
        }

        let mut norm_inf_g_new = F::zero();
        if evaluated && (self.method == Method::Bfgs || self.q_new < self.q) {
            self.j_new.tr_mul_to(&self.f_new, &mut self.g_new);
            norm_inf_g_new = norm_inf(&self.g_new);
        }

        match self.method {
            Method::Bfgs => {
                is_better = self.q_new < self.q
                    || (self.q_new <= (F::one() + sqrt_eps) * self.q
                        && norm_inf_g_new < self.norm_inf_g);
                should_switch = norm_inf_g_new >= self.norm_inf_g;
                if self.q_new < self.q {
                    self.jh.gemv(F::one(), &self.j, &self.h, F::zero());
                    let predicted = -(self.h.dot(&self.g) - self.jh.norm_squared() * half);
                    let rho = (self.q - self.q_new) / predicted;
                    trace!(
                        "bfgs step: |h| = {:?}, gain ratio = {:?}, delta = {:?}",
                        norm_h,
                        rho,
                        self.delta
                    );
                    if rho > convert(0.75) {
                        self.delta = Float::max(self.delta, convert::<_, F>(3.0) * norm_h);
                    } else if rho < convert(0.25) {
                        self.delta /= two;
                        if !self.check_step(self.delta, State::FAILURE_MINTRUST) {
                            return self.state;
                        }
                    }
                } else {
                    self.delta /= two;
                    if !self.check_step(self.delta, State::FAILURE_MINTRUST) {
                        return self.state;
                    }
                }
            }
            Method::LevenbergMarquardt => {
                if self.q_new < self.q {
                    is_better = true;
                    let predicted = (self.h.dot(&self.g) - self.mu * self.h.norm_squared()) * -half;
                    let rho = (self.q - self.q_new) / predicted;
                    self.mu *= Float::max(
                        convert(1.0 / 3.0),
                        F::one() - Float::powi(two * rho - F::one(), 3),
                    );
                    self.nu = two;
                    trace!(
                        "lm step accepted: |h| = {:?}, gain ratio = {:?}, mu = {:?}",
                        norm_h,
                        rho,
                        self.mu
                    );
                    // A nearly linear model predicts both a small gradient and
                    // a small gain; three such steps in a row suggest we are
                    // close to a minimum with nonzero residuals, where BFGS
                    // converges faster.
                    if Float::min(norm_inf_g_new, self.q - self.q_new)
                        < convert::<_, F>(0.02) * self.q_new
                    {
                        self.count += 1;
                        if self.count == 3 {
                            should_switch = true;
                        }
                    } else {
                        self.count = 0;
                    }
                    if self.count != 3 {
                        self.j_new.tr_mul_to(&self.j_new, &mut self.a);
                        self.bump_lm_diagonal(self.mu);
                    }
                } else {
                    // In-place damping bump: the diagonal becomes
                    // J^T J + mu * nu, which equals the new mu below.
                    self.bump_lm_diagonal(self.mu * (self.nu - F::one()));
                    self.mu *= self.nu;
                    self.nu *= two;
                    trace!("lm step rejected: |h| = {:?}, mu = {:?}", norm_h, self.mu);
                    should_switch = self.nu >= convert(32.0);
                }
            }
        }
        if !evaluated {
            return self.state;
        }

        // Curvature update of B on every evaluated step, whichever method is
        // active, so that BFGS resumes with meaningful information. The
        // rank-two update is applied only under the curvature condition
        // h^T y > 0, which preserves positive definiteness.
        self.jh.gemv(F::one(), &self.j_new, &self.h, F::zero());
        self.j_new.tr_mul_to(&self.jh, &mut self.y);
        self.y += &self.g_new;
        self.y -= &self.g;
        let hy = self.h.dot(&self.y);
        if hy > F::zero() {
            self.v.gemv(F::one(), &self.b, &self.h, F::zero());
            let hv = self.h.dot(&self.v);
            self.b.ger(-(F::one() / hv), &self.v, &self.v, F::one());
            self.b.ger(F::one() / hy, &self.y, &self.y, F::one());
        }

        if is_better {
            self.x.copy_from(&self.x_new);
            self.f.copy_from(&self.f_new);
            self.q = self.q_new;
            self.j.copy_from(&self.j_new);
            self.g.copy_from(&self.g_new);
            self.norm_inf_f = norm_inf(&self.f);
            self.norm_inf_g = norm_inf_g_new;
            // NaN-safe polarity: a NaN norm fails the > test and terminates
            if !(self.norm_inf_f > self.ctrl.ftol) {
                self.state.insert(State::SUCCESS_FTOL);
            }
            if !(self.norm_inf_g > self.ctrl.gtol) {
                self.state.insert(State::SUCCESS_GTOL);
            }
        }

        if should_switch {
            match self.method {
                Method::Bfgs => {
                    self.j.tr_mul_to(&self.j, &mut self.a);
                    self.bump_lm_diagonal(self.mu);
                    self.method = Method::LevenbergMarquardt;
                    debug!("switching to Levenberg-Marquardt, mu = {:?}", self.mu);
                }
                Method::LevenbergMarquardt => {
                    self.delta = Float::max(
                        convert::<_, F>(1.5)
                            * self.ctrl.min_step
                            * (self.f.norm_squared() + self.ctrl.min_step),
                        convert::<_, F>(0.2) * norm_h,
                    );
                    self.method = Method::Bfgs;
                    debug!("switching to BFGS, delta = {:?}", self.delta);
                }
            }
        }

        if is_better {
            self.state.insert(State::STEP_ACCEPTED);
        } else {
            self.state.remove(State::STEP_ACCEPTED);
        }
        self.state
    }

    /// Iterate until a terminal flag is set, at most `max_iter` times.
    ///
    /// If no terminal flag is reached within the bound,
    /// [`State::FAILURE_MAXITER`] is set.
    pub fn run(&mut self) -> State {
        for iteration in 0..self.ctrl.max_iter {
            self.step();
            if self.state.intersects(State::FINISHED) {
                debug!(
                    "finished after {} iterations: {:?}",
                    iteration + 1,
                    self.state
                );
                return self.state;
            }
        }
        self.state.insert(State::FAILURE_MAXITER);
        self.state
    }

    /// Solve `$\mathbf{M}\vec{h} = -\vec{g}$` for the step direction, with
    /// `$\mathbf{M}$` the L-M matrix or the BFGS matrix.
    fn solve_direction(&mut self, use_lm_matrix: bool) {
        let matrix = if use_lm_matrix { &self.a } else { &self.b };
        if self.ctrl.use_cholesky {
            self.ldlt.compute(matrix);
            self.h.copy_from(&self.g);
            self.h.neg_mut();
            self.ldlt.solve_into(&mut self.h);
        } else {
            self.rank = deflated_eigen_solve(matrix, &self.g, &mut self.h);
        }
    }

    /// NaN-safe guard against step lengths (or trust radii) below the
    /// minimum-step floor; sets `bad` and returns `false` on violation.
    fn check_step(&mut self, step_norm: F, bad: State) -> bool {
        if !(step_norm > self.ctrl.min_step * (self.x.norm() + self.ctrl.min_step)) {
            self.state.insert(bad);
            false
        } else {
            true
        }
    }

    fn bump_lm_diagonal(&mut self, amount: F) {
        for i in 0..self.a.nrows() {
            self.a[(i, i)] += amount;
        }
    }

    /// Current state flags.
    pub fn state(&self) -> State {
        self.state
    }

    /// The step strategy currently in use.
    pub fn method(&self) -> Method {
        self.method
    }

    /// Current accepted parameters `$\vec{x}$`.
    pub fn parameters(&self) -> &DVector<F> {
        &self.x
    }

    /// Most recently proposed parameters.
    pub fn trial_parameters(&self) -> &DVector<F> {
        &self.x_new
    }

    /// Residuals at the current parameters.
    pub fn residuals(&self) -> &DVector<F> {
        &self.f
    }

    /// Residuals at the most recent proposal.
    pub fn trial_residuals(&self) -> &DVector<F> {
        &self.f_new
    }

    /// `$\chi^2 = \|\vec{f}(\vec{x})\|^2$` at the current parameters.
    pub fn chi_squared(&self) -> F {
        self.q * convert(2.0)
    }

    /// `$\chi^2$` at the most recent proposal; infinite after an invalid step.
    pub fn trial_chi_squared(&self) -> F {
        self.q_new * convert(2.0)
    }

    /// Infinity norm of the current residuals, tested against `ftol`.
    pub fn residual_inf_norm(&self) -> F {
        self.norm_inf_f
    }

    /// Infinity norm of the current gradient, tested against `gtol`.
    pub fn gradient_inf_norm(&self) -> F {
        self.norm_inf_g
    }

    /// Current Levenberg-Marquardt damping `$\mu$`.
    pub fn mu(&self) -> F {
        self.mu
    }

    /// Current BFGS trust radius `$\delta$`.
    pub fn delta(&self) -> F {
        self.delta
    }

    /// Effective rank reported by the last eigen-mode solve.
    ///
    /// Stays at `$n$` while the LDLᵀ solve is selected.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// The objective being minimized.
    pub fn objective(&self) -> &O {
        &*self.objective
    }
}
