//! A hybrid [Levenberg-Marquardt](https://en.wikipedia.org/wiki/Levenberg%E2%80%93Marquardt_algorithm)
//! / [BFGS](https://en.wikipedia.org/wiki/Broyden%E2%80%93Fletcher%E2%80%93Goldfarb%E2%80%93Shanno_algorithm)
//! optimizer for nonlinear least-squares problems, using [nalgebra](https://nalgebra.org).
//!
//! The optimizer solves
//! ```math
//! \min_{\vec{x}\in\R^n} Q(\vec{x})\quad\text{where}\quad
//!   Q(\vec{x}) = \frac{1}{2}\|\vec{f}(\vec{x})\|^2
//! ```
//! for a differentiable residual function `$\vec{f}\!:\R^n\to\R^m$`.
//!
//! Levenberg-Marquardt is globally robust on such problems but converges
//! only linearly near minima where the residuals do not vanish. The engine
//! therefore watches its own progress and switches between damped
//! Gauss-Newton steps and quasi-Newton BFGS steps: Levenberg-Marquardt runs
//! first, BFGS takes over once the damped steps look nearly linear (or once
//! rejections pile up), and control falls back to Levenberg-Marquardt when
//! BFGS stops making gradient progress. The BFGS curvature estimate is
//! updated on every evaluated step, so it is warm whenever the switch
//! happens.
//!
//! # Inputs
//!
//! You must implement [`Objective`] for your problem: the residual vector,
//! its Jacobian `$\mathbf{J}_{ij} = \partial f_i/\partial x_j$`, and
//! optionally a step-vetting hook for simple domain constraints. An initial
//! guess for `$\vec{x}$` is also required, and the optimization result
//! typically depends on it.
//!
//! # Usage example
//!
//! The classic Rosenbrock function written with residuals
//! `$f_1 = 10(x_2 - x_1^2)$` and `$f_2 = 1 - x_1$`:
//!
//! ```
//! use hybrid_optimizer::{HybridOptimizer, Objective, State};
//! use nalgebra::{DMatrix, DVector};
//!
//! struct Rosenbrock;
//!
//! impl Objective<f64> for Rosenbrock {
//!     fn residual_count(&self) -> usize { 2 }
//!     fn parameter_count(&self) -> usize { 2 }
//!
//!     fn compute_residuals(&mut self, x: &DVector<f64>, f: &mut DVector<f64>) {
//!         f[0] = 10.0 * (x[1] - x[0] * x[0]);
//!         f[1] = 1.0 - x[0];
//!     }
//!
//!     fn compute_jacobian(&mut self, x: &DVector<f64>, _f: &DVector<f64>, j: &mut DMatrix<f64>) {
//!         j[(0, 0)] = -20.0 * x[0];
//!         j[(0, 1)] = 10.0;
//!         j[(1, 0)] = -1.0;
//!         j[(1, 1)] = 0.0;
//!     }
//! }
//!
//! let mut objective = Rosenbrock;
//! let (x, state) = HybridOptimizer::new()
//!     .with_max_iter(100)
//!     .minimize(DVector::from_column_slice(&[-1.2, 1.0]), &mut objective);
//! assert!(state.intersects(State::SUCCESS));
//! assert!((x[0] - 1.0).abs() < 1e-6 && (x[1] - 1.0).abs() < 1e-6);
//! ```
//!
//! For finer control, [`HybridOptimizer::optimize`] returns a
//! [`HybridOptimization`] engine that can be stepped one iteration at a time
//! and inspected between steps.
//!
//! # Reference
//!
//! > Madsen K., Nielsen H.B., Tingleff O. (2004). Methods for Non-Linear
//! > Least Squares Problems. 2nd edition, IMM, Technical University of
//! > Denmark. Chapter 5 describes the hybrid method.

mod hybrid;
mod problem;
mod solver;
mod utils;

pub use hybrid::{HybridOptimization, HybridOptimizer, Method, State};
pub use problem::{Objective, StepResult};
pub use utils::differentiate_numerically;
