use approx::assert_relative_eq;
use nalgebra::{DMatrix, DVector};

use super::test_helpers::{LinearLeastSquares, MockObjective, Rosenbrock, StepLimited};
use super::{HybridOptimizer, Method, State};
use crate::StepResult;

#[test]
fn invalid_step_in_lm_mode_bumps_damping_without_evaluating() {
    let mut problem = MockObjective::new(
        DMatrix::identity(2, 2),
        vec![DVector::from_column_slice(&[1.0, 1.0])],
    )
    .with_vettings(vec![StepResult::Invalid]);
    let mut optimization = HybridOptimizer::new().optimize(DVector::zeros(2), &mut problem);

    let state = optimization.step();
    assert!(state.contains(State::STEP_INVALID));
    assert!(!state.contains(State::STEP_ACCEPTED));
    assert!(!state.intersects(State::FINISHED));
    assert!(optimization.trial_chi_squared().is_infinite());

    // damping grew as for an evaluated rejection
    assert_relative_eq!(optimization.mu, 2.0e-3, epsilon = 1e-15);
    assert_relative_eq!(optimization.nu, 4.0);
    // the in-place diagonal bump kept A = J^T J + mu I
    assert_relative_eq!(optimization.a[(0, 0)], 1.0 + optimization.mu, epsilon = 1e-12);
    assert_relative_eq!(optimization.a[(1, 1)], 1.0 + optimization.mu, epsilon = 1e-12);

    // only the initialization evaluated the objective
    assert_eq!(optimization.objective().evaluations(), 1);
    assert_eq!(optimization.method(), Method::LevenbergMarquardt);
    assert_relative_eq!(optimization.parameters().clone(), DVector::zeros(2));
}

#[test]
fn modified_step_is_recomputed_and_optimization_continues() {
    let mut problem = StepLimited {
        inner: LinearLeastSquares::overdetermined_consistent(),
        max_norm: 0.3,
        modifications: 0,
    };
    let mut optimization = HybridOptimizer::new()
        .optimize(DVector::from_column_slice(&[-1.0, -1.0]), &mut problem);

    let x_before = optimization.parameters().clone();
    let state = optimization.step();
    assert!(state.contains(State::STEP_MODIFIED | State::STEP_ACCEPTED));
    assert_eq!(optimization.objective().modifications, 1);
    // the step was recomputed from the shortened proposal before committing
    let step_norm = (optimization.parameters() - &x_before).norm();
    assert_relative_eq!(step_norm, 0.3, epsilon = 1e-12);

    let state = optimization.run();
    assert!(state.intersects(State::SUCCESS));
    // the modified flag clears once proposals pass vetting unchanged
    assert!(!state.contains(State::STEP_MODIFIED));
    assert_relative_eq!(
        optimization.parameters().clone(),
        DVector::from_column_slice(&[1.0, 1.0]),
        epsilon = 1e-6
    );
}

#[test]
fn repeated_lm_rejections_switch_to_bfgs() {
    // the first script entry feeds the initialization; every step after that
    // sees a much worse residual and is rejected
    let mut problem = MockObjective::new(
        DMatrix::identity(2, 2),
        vec![
            DVector::from_column_slice(&[1.0, 1.0]),
            DVector::from_column_slice(&[10.0, 10.0]),
        ],
    )
    .with_vettings(vec![
        StepResult::Valid,
        StepResult::Valid,
        StepResult::Valid,
        StepResult::Valid,
        StepResult::Invalid,
    ]);
    let mut optimization = HybridOptimizer::new().optimize(DVector::zeros(2), &mut problem);

    for expected_mu in [2.0e-3, 8.0e-3, 64.0e-3] {
        let state = optimization.step();
        assert!(!state.contains(State::STEP_ACCEPTED));
        assert_eq!(optimization.method(), Method::LevenbergMarquardt);
        assert_relative_eq!(optimization.mu, expected_mu, epsilon = 1e-15);
        assert_relative_eq!(optimization.a[(0, 0)], 1.0 + expected_mu, epsilon = 1e-12);
        assert_relative_eq!(optimization.a[(1, 1)], 1.0 + expected_mu, epsilon = 1e-12);
    }

    // fourth rejection drives nu to 32 and switches the method
    let state = optimization.step();
    assert!(!state.contains(State::STEP_ACCEPTED));
    assert_eq!(optimization.method(), Method::Bfgs);
    assert_relative_eq!(optimization.mu, 1.024, epsilon = 1e-12);
    assert_relative_eq!(optimization.nu, 32.0);
    assert_relative_eq!(optimization.delta, 0.2 * optimization.h.norm());
    assert_eq!(optimization.objective().evaluations(), 5);

    // an invalid proposal in BFGS mode halves the trust radius unevaluated
    let delta_before = optimization.delta;
    let state = optimization.step();
    assert!(state.contains(State::STEP_INVALID));
    assert_eq!(optimization.method(), Method::Bfgs);
    assert!(optimization.trial_chi_squared().is_infinite());
    assert_relative_eq!(optimization.delta, delta_before / 2.0);
    assert_eq!(optimization.objective().evaluations(), 5);
}

#[test]
fn near_linear_lm_steps_switch_to_bfgs() {
    // nonzero residuals at the minimum keep Q_new bounded away from zero,
    // which is what the near-linear detector looks for
    let mut problem = LinearLeastSquares::overdetermined_inconsistent();
    let mut optimization = HybridOptimizer::new()
        .with_gtol(1e-15)
        .optimize(DVector::zeros(2), &mut problem);

    let mut switched = false;
    for _ in 0..20 {
        optimization.step();
        if optimization.method() == Method::Bfgs {
            switched = true;
            break;
        }
        if optimization.state().intersects(State::FINISHED) {
            break;
        }
    }
    assert!(switched, "LM never handed over to BFGS");
    assert_eq!(optimization.count, 3);
}

#[test]
fn terminal_flags_are_sticky() {
    let mut problem = LinearLeastSquares::overdetermined_consistent();
    let mut optimization = HybridOptimizer::new().optimize(DVector::zeros(2), &mut problem);
    let state = optimization.run();
    let terminal = state & State::FINISHED;
    assert!(!terminal.is_empty());

    optimization.step();
    optimization.step();
    assert!(optimization.state().contains(terminal));
}

#[test]
fn accepted_steps_never_increase_the_objective() {
    let sqrt_eps = f64::EPSILON.sqrt();
    let mut problem = Rosenbrock;
    let mut optimization = HybridOptimizer::new()
        .optimize(DVector::from_column_slice(&[-1.2, 1.0]), &mut problem);

    for _ in 0..100 {
        let q_before = optimization.q;
        let state = optimization.step();
        if state.contains(State::STEP_ACCEPTED) {
            assert!(optimization.q <= q_before * (1.0 + sqrt_eps));
        } else {
            assert_eq!(optimization.q, q_before);
        }
        if state.intersects(State::FINISHED) {
            break;
        }
    }
    assert!(optimization.state().intersects(State::SUCCESS));
    assert_relative_eq!(
        optimization.parameters().clone(),
        DVector::from_column_slice(&[1.0, 1.0]),
        epsilon = 1e-6
    );
}

#[test]
fn matrices_stay_symmetric_and_buffers_stay_put() {
    let mut problem = Rosenbrock;
    let mut optimization = HybridOptimizer::new()
        .optimize(DVector::from_column_slice(&[-1.2, 1.0]), &mut problem);

    let x_ptr = optimization.x.as_slice().as_ptr();
    let f_ptr = optimization.f.as_slice().as_ptr();
    let a_ptr = optimization.a.as_slice().as_ptr();
    let b_ptr = optimization.b.as_slice().as_ptr();

    for _ in 0..30 {
        let state = optimization.step();
        for i in 0..2 {
            for j in 0..2 {
                assert_relative_eq!(
                    optimization.a[(i, j)],
                    optimization.a[(j, i)],
                    epsilon = 1e-9
                );
                assert_relative_eq!(
                    optimization.b[(i, j)],
                    optimization.b[(j, i)],
                    epsilon = 1e-9
                );
            }
        }
        if state.intersects(State::FINISHED) {
            break;
        }
    }

    assert_eq!(optimization.x.as_slice().as_ptr(), x_ptr);
    assert_eq!(optimization.f.as_slice().as_ptr(), f_ptr);
    assert_eq!(optimization.a.as_slice().as_ptr(), a_ptr);
    assert_eq!(optimization.b.as_slice().as_ptr(), b_ptr);
}

#[test]
fn eigen_mode_reports_rank_deficiency_and_stays_finite() {
    // two identical columns: J^T J has rank one, and with a negligible mu the
    // damped system stays numerically rank deficient
    let mut problem = LinearLeastSquares {
        a: DMatrix::from_row_slice(3, 2, &[1.0, 1.0, 1.0, 1.0, 1.0, 1.0]),
        b: DVector::from_column_slice(&[1.0, 2.0, 3.0]),
    };
    let mut optimization = HybridOptimizer::new()
        .with_tau(1e-18)
        .with_cholesky(false)
        .optimize(DVector::zeros(2), &mut problem);

    let state = optimization.step();
    assert_eq!(optimization.rank(), 1);
    assert!(state.contains(State::STEP_ACCEPTED));
    assert!(optimization.parameters().iter().all(|x| x.is_finite()));
    // the minimum-norm step lands on the least-squares solution
    assert_relative_eq!(
        optimization.parameters().clone(),
        DVector::from_column_slice(&[1.0, 1.0]),
        epsilon = 1e-9
    );
    assert!(state.contains(State::SUCCESS_GTOL));
}
