use nalgebra::{DMatrix, DVector, RealField};

/// Verdict of an objective on a proposed step, returned by [`Objective::try_step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepResult {
    /// The proposed parameters can be evaluated as they are.
    Valid,
    /// The objective overwrote the proposal with a nearby feasible point.
    ///
    /// The optimizer recomputes the step from the overwritten value and
    /// proceeds as if this had been the proposed step all along.
    Modified,
    /// The proposal cannot be evaluated at all (for example a negative
    /// radius). The optimizer skips the evaluation, treats the trial
    /// objective value as `$+\infty$` and shrinks its trust region.
    Invalid,
}

/// A nonlinear least-squares objective.
///
/// This is what [`HybridOptimizer`](crate::HybridOptimizer) needs to compute
/// residuals and Jacobians. The optimizer minimizes
/// `$Q(\vec{x}) = \frac{1}{2}\|\vec{f}(\vec{x})\|^2$` for a residual function
/// `$\vec{f}\!:\R^n\to\R^m$` whose Jacobian
/// `$\mathbf{J}_{ij} = \partial f_i/\partial x_j$` you must also provide.
///
/// Both evaluators fill caller-owned buffers so that no allocation happens
/// while the optimizer iterates. They are expected to be deterministic and
/// infallible; an objective that cannot evaluate somewhere should express
/// that through [`try_step`](Objective::try_step) or by writing non-finite
/// residuals, which the optimizer rejects naturally.
pub trait Objective<F: RealField> {
    /// Number of residuals `$m$`.
    fn residual_count(&self) -> usize;

    /// Number of parameters `$n$`.
    fn parameter_count(&self) -> usize;

    /// Fill `residuals` with `$\vec{f}(\vec{x})$`.
    fn compute_residuals(&mut self, x: &DVector<F>, residuals: &mut DVector<F>);

    /// Fill `jacobian` with `$\mathbf{J}(\vec{x})$`.
    ///
    /// The residual vector already computed at `x` is passed in so shared
    /// subexpressions do not have to be evaluated twice.
    fn compute_jacobian(&mut self, x: &DVector<F>, residuals: &DVector<F>, jacobian: &mut DMatrix<F>);

    /// Inspect a step proposed by the optimizer, from `x` to `x_new`.
    ///
    /// This is a hook for simple domain constraints, like clamping a radius
    /// to stay positive; it does not turn the optimizer into a general
    /// constrained solver. On [`StepResult::Modified`] the implementation
    /// must have overwritten `x_new` with a nearby feasible value.
    fn try_step(&mut self, _x: &DVector<F>, _x_new: &mut DVector<F>) -> StepResult {
        StepResult::Valid
    }
}
