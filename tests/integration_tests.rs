//! End-to-end scenarios driving the public solver API.

use arbalest_solver::{
    ConstrDecomp, ConstraintModel, CostModel, DynamicsModel, GoalConstraint, IterativeLqr,
    IterativeLqrConfig, KktDecomp, LinearConstraint, LinearDynamics, QuadraticCost,
    TerminationReason,
};
use nalgebra::{dmatrix, dvector, DMatrix, DVector};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

type TestResult = Result<(), Box<dyn std::error::Error>>;

/// Roll a dynamics model out from `x0` under the inputs `utrj`, producing a
/// defect-free state trajectory seed.
fn rollout(model: &dyn DynamicsModel, x0: &DVector<f64>, utrj: &DMatrix<f64>) -> DMatrix<f64> {
    let n = utrj.ncols();
    let mut xtrj = DMatrix::zeros(x0.len(), n + 1);
    xtrj.set_column(0, x0);
    for k in 0..n {
        let x = xtrj.column(k).clone_owned();
        let u = utrj.column(k).clone_owned();
        let xnext = model.eval(&x, &u);
        xtrj.set_column(k + 1, &xnext);
    }
    xtrj
}

fn double_integrator(dt: f64) -> LinearDynamics {
    LinearDynamics::new(dmatrix![1.0, dt; 0.0, 1.0], dmatrix![0.0; dt])
}

/// Unicycle kinematics: state (x, y, θ), inputs (v, ω).
struct Unicycle {
    dt: f64,
}

impl DynamicsModel for Unicycle {
    fn nx(&self) -> usize {
        3
    }

    fn nu(&self) -> usize {
        2
    }

    fn eval(&self, x: &DVector<f64>, u: &DVector<f64>) -> DVector<f64> {
        let theta = x[2];
        dvector![
            x[0] + self.dt * u[0] * theta.cos(),
            x[1] + self.dt * u[0] * theta.sin(),
            x[2] + self.dt * u[1]
        ]
    }

    fn linearize(&self, x: &DVector<f64>, u: &DVector<f64>) -> (DMatrix<f64>, DMatrix<f64>) {
        let theta = x[2];
        let a = dmatrix![
            1.0, 0.0, -self.dt * u[0] * theta.sin();
            0.0, 1.0,  self.dt * u[0] * theta.cos();
            0.0, 0.0,  1.0
        ];
        let b = dmatrix![
            self.dt * theta.cos(), 0.0;
            self.dt * theta.sin(), 0.0;
            0.0, self.dt
        ];
        (a, b)
    }
}

/// Double integrator driven to the origin: the terminal state lands within
/// 1e-3 of zero and the cost settles to 1e-6 across the last iterations.
#[test]
fn double_integrator_to_origin() -> TestResult {
    let n = 30;
    let mut solver = IterativeLqr::new(Arc::new(double_integrator(0.1)), n);
    solver.set_intermediate_cost_all(Arc::new(QuadraticCost::new(
        DMatrix::zeros(2, 2),
        dmatrix![2.0],
    )));
    solver.set_final_cost(Arc::new(QuadraticCost::new(
        dmatrix![20000.0, 0.0; 0.0, 20000.0],
        dmatrix![0.0],
    )))?;
    solver.set_initial_state(&dvector![1.0, 0.0])?;

    let converged = solver.solve(50)?;
    assert!(converged, "solver did not converge");

    let x_n = solver.state(n);
    assert!(
        x_n.norm() < 1e-3,
        "terminal state too far from origin: {}",
        x_n.norm()
    );

    let history = &solver.profiling_info().history;
    assert!(history.len() >= 2);
    let last = &history[history.len() - 1];
    let prev = &history[history.len() - 2];
    assert!(
        (last.cost - prev.cost).abs() < 1e-6,
        "cost still moving: {:.3e}",
        (last.cost - prev.cost).abs()
    );
    Ok(())
}

/// Unicycle with a terminal equality: endpoint reached to constraint and
/// defect tolerances.
#[test]
fn unicycle_with_endpoint_equality() -> TestResult {
    let n = 40;
    let model = Unicycle { dt: 0.1 };
    let mut solver = IterativeLqr::new(Arc::new(Unicycle { dt: 0.1 }), n);

    solver.set_intermediate_cost_all(Arc::new(QuadraticCost::new(
        DMatrix::zeros(3, 3),
        dmatrix![0.02, 0.0; 0.0, 0.02],
    )));
    solver.set_final_cost(Arc::new(QuadraticCost::new(
        DMatrix::zeros(3, 3),
        DMatrix::zeros(2, 2),
    )))?;
    let goal = dvector![1.0, 1.0, 0.0];
    solver.set_final_constraint(Arc::new(GoalConstraint::new(goal.clone(), 2)))?;

    let x0 = dvector![0.0, 0.0, 0.0];
    solver.set_initial_state(&x0)?;

    // seed with a curving rollout so the heading direction is excited
    let mut u_seed = DMatrix::zeros(2, n);
    for k in 0..n {
        u_seed[(0, k)] = 0.5;
        u_seed[(1, k)] = if k < n / 2 { 0.5 } else { -0.5 };
    }
    solver.set_input_trajectory(&u_seed)?;
    solver.set_state_trajectory(&rollout(&model, &x0, &u_seed))?;

    let converged = solver.solve(300)?;
    assert!(converged, "solver did not converge");

    let endpoint_err = (solver.state(n).clone_owned() - &goal).amax();
    assert!(endpoint_err < 1e-4, "endpoint error {endpoint_err:.3e}");

    let last = solver.profiling_info().history.last().ok_or("no history")?;
    assert!(last.constraint_violation < 1e-6);
    assert!(last.defect_norm < 1e-6);
    Ok(())
}

/// Scalar integrator with |u| ≤ 0.5 enforced by the augmented-Lagrangian
/// outer loop: the input saturates at the bound.
#[test]
fn bound_active_input_saturation() -> TestResult {
    let n = 20;
    let dynamics = LinearDynamics::new(dmatrix![1.0], dmatrix![0.1]);
    let config = IterativeLqrConfig::new().with_auglag(10.0, 10.0);
    let mut solver = IterativeLqr::with_config(Arc::new(dynamics), n, config);

    solver.set_intermediate_cost_all(Arc::new(QuadraticCost::new(
        dmatrix![0.0],
        dmatrix![0.02],
    )));
    solver.set_final_cost(Arc::new(QuadraticCost::with_targets(
        dmatrix![400.0],
        dmatrix![0.0],
        dvector![1.5],
        dvector![0.0],
    )))?;
    solver.set_initial_state(&dvector![0.0])?;

    let lb = DMatrix::from_element(1, n, -0.5);
    let ub = DMatrix::from_element(1, n, 0.5);
    solver.set_input_bounds(&lb, &ub)?;

    let converged = solver.solve(300)?;
    assert!(converged, "solver did not converge");

    let u_max = solver
        .input_trajectory()
        .iter()
        .fold(0.0_f64, |m, v| m.max(v.abs()));
    assert!(u_max <= 0.5 + 1e-4, "bound exceeded: max|u| = {u_max:.6}");

    let profile = solver.profiling_info();
    assert!(profile.auglag_updates >= 1, "no outer updates ran");
    assert!(
        profile.auglag_updates <= 5,
        "too many outer updates: {}",
        profile.auglag_updates
    );
    let last = profile.history.last().ok_or("no history")?;
    assert!(last.bound_violation < 1e-6);
    Ok(())
}

/// Two identical terminal rows: one is dropped as linearly dependent and
/// the solve proceeds as if a single row were present.
#[test]
fn rank_deficient_duplicate_constraint_rows() -> TestResult {
    let n = 20;
    let mut solver = IterativeLqr::new(Arc::new(double_integrator(0.1)), n);
    solver.set_intermediate_cost_all(Arc::new(QuadraticCost::new(
        DMatrix::zeros(2, 2),
        dmatrix![2.0],
    )));
    solver.set_final_cost(Arc::new(QuadraticCost::new(
        DMatrix::zeros(2, 2),
        dmatrix![0.0],
    )))?;
    solver.set_final_constraint(Arc::new(LinearConstraint::new(
        dmatrix![1.0, 0.0; 1.0, 0.0],
        DMatrix::zeros(2, 1),
        dvector![0.3, 0.3],
    )))?;
    solver.set_initial_state(&dvector![0.0, 0.0])?;

    let converged = solver.solve(100)?;
    assert!(converged, "solver did not converge");
    assert!(
        solver.profiling_info().dropped_dependent_rows >= 1,
        "duplicate row was never dropped"
    );
    assert!((solver.state(n)[0] - 0.3).abs() < 1e-5);
    Ok(())
}

/// A terminal equality unreachable from a fixed initial state under
/// uncontrollable dynamics: the solver warns, keeps iterating, and the
/// callback observes a constraint-violation plateau.
#[test]
fn infeasible_initial_state_is_diagnosed_not_fatal() -> TestResult {
    let n = 5;
    // x⁺ = x with zero input authority
    let dynamics = LinearDynamics::new(dmatrix![1.0], dmatrix![0.0]);
    let mut solver = IterativeLqr::new(Arc::new(dynamics), n);
    solver.set_intermediate_cost_all(Arc::new(QuadraticCost::new(
        dmatrix![0.0],
        dmatrix![2.0],
    )));
    solver.set_final_cost(Arc::new(QuadraticCost::new(dmatrix![0.0], dmatrix![0.0])))?;
    solver.set_final_constraint(Arc::new(GoalConstraint::new(dvector![1.0], 1)))?;
    solver.set_initial_state(&dvector![0.0])?;

    let violations: Rc<RefCell<Vec<f64>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&violations);
    solver.set_iteration_callback(move |report| {
        sink.borrow_mut().push(report.constraint_violation);
        true
    });

    let converged = solver.solve(10)?;
    assert!(!converged, "an unreachable goal cannot converge");

    let profile = solver.profiling_info();
    assert!(profile.infeasibility_warnings >= 1);
    assert!((profile.max_infeasibility_residual - 1.0).abs() < 1e-9);
    assert_eq!(
        profile.termination,
        TerminationReason::IterationBudgetExhausted
    );

    // the violation plateaus at |x_N − 1| / N = 0.2
    let violations = violations.borrow();
    assert!(violations.len() >= 2);
    let last = violations[violations.len() - 1];
    let prev = violations[violations.len() - 2];
    assert!((last - 0.2).abs() < 1e-9, "unexpected plateau {last}");
    assert!((last - prev).abs() < 1e-12);
    Ok(())
}

/// A structurally singular input Hessian triggers the regularization retry
/// and the solve recovers.
#[test]
fn regularization_retry_recovers_at_solve_level() -> TestResult {
    let a = dmatrix![1.0, 1.0; 0.0, 1.0];
    let b = dmatrix![0.0; 1.0];
    let mut solver = IterativeLqr::new(Arc::new(LinearDynamics::new(a, b)), 5);
    solver.set_intermediate_cost_all(Arc::new(QuadraticCost::new(
        DMatrix::zeros(2, 2),
        dmatrix![0.0],
    )));
    solver.set_final_cost(Arc::new(QuadraticCost::new(
        dmatrix![100.0, 0.0; 0.0, 0.0],
        dmatrix![0.0],
    )))?;
    solver.set_initial_state(&dvector![1.0, 0.0])?;

    solver.solve(20)?;
    assert!(
        solver.profiling_info().reg_retries >= 1,
        "expected a regularization retry"
    );
    Ok(())
}

/// Re-solving from the optimum terminates almost immediately.
#[test]
fn idempotence_from_the_optimum() -> TestResult {
    let n = 30;
    let build = || {
        let mut solver = IterativeLqr::new(Arc::new(double_integrator(0.1)), n);
        solver.set_intermediate_cost_all(Arc::new(QuadraticCost::new(
            DMatrix::zeros(2, 2),
            dmatrix![2.0],
        )));
        solver
            .set_final_cost(Arc::new(QuadraticCost::new(
                dmatrix![200.0, 0.0; 0.0, 200.0],
                dmatrix![0.0],
            )))
            .unwrap();
        solver.set_initial_state(&dvector![1.0, 0.0]).unwrap();
        solver
    };

    let mut first = build();
    assert!(first.solve(50)?);

    let mut second = build();
    second.set_state_trajectory(&first.state_trajectory().clone())?;
    second.set_input_trajectory(&first.input_trajectory().clone())?;

    let converged = second.solve(5)?;
    assert!(converged);
    assert!(
        second.profiling_info().iterations <= 2,
        "took {} iterations from the optimum",
        second.profiling_info().iterations
    );
    Ok(())
}

/// Every KKT and constraint factorization option solves the same
/// equality-constrained problem to the same answer.
#[test]
fn decomposition_options_agree() -> TestResult {
    let n = 15;
    let goal = dvector![0.4, 0.0];

    let solve_with = |kkt: KktDecomp, constr: ConstrDecomp| -> Result<DVector<f64>, Box<dyn std::error::Error>> {
        let config = IterativeLqrConfig::new()
            .with_kkt_decomp(kkt)
            .with_constr_decomp(constr);
        let mut solver =
            IterativeLqr::with_config(Arc::new(double_integrator(0.1)), n, config);
        solver.set_intermediate_cost_all(Arc::new(QuadraticCost::new(
            DMatrix::zeros(2, 2),
            dmatrix![2.0],
        )));
        solver.set_final_cost(Arc::new(QuadraticCost::new(
            DMatrix::zeros(2, 2),
            dmatrix![0.0],
        )))?;
        solver.set_final_constraint(Arc::new(GoalConstraint::new(goal.clone(), 1)))?;
        solver.set_initial_state(&dvector![1.0, 0.5])?;
        assert!(solver.solve(100)?, "{kkt}/{constr} did not converge");
        Ok(solver.state(n).clone_owned())
    };

    let reference = solve_with(KktDecomp::Lu, ConstrDecomp::Svd)?;
    assert!((reference.clone() - &goal).amax() < 1e-5);

    for kkt in [KktDecomp::Lu, KktDecomp::Qr, KktDecomp::Ldlt] {
        for constr in [ConstrDecomp::Svd, ConstrDecomp::Qr, ConstrDecomp::Cod] {
            let endpoint = solve_with(kkt, constr)?;
            assert!(
                (endpoint - &reference).amax() < 1e-6,
                "{kkt}/{constr} disagrees with the reference"
            );
        }
    }
    Ok(())
}

/// The iteration callback sees monotone merit behaviour and can halt the
/// solve early.
#[test]
fn callback_observes_and_stops() -> TestResult {
    let mut solver = IterativeLqr::new(Arc::new(double_integrator(0.1)), 20);
    solver.set_initial_state(&dvector![1.0, 0.0])?;

    let count = Rc::new(RefCell::new(0usize));
    let counter = Rc::clone(&count);
    solver.set_iteration_callback(move |report| {
        assert!(report.cost.is_finite());
        assert!(report.xtrj.ncols() == 21);
        let mut c = counter.borrow_mut();
        *c += 1;
        *c < 3
    });

    let converged = solver.solve(50)?;
    assert!(!converged);
    assert_eq!(
        solver.profiling_info().termination,
        TerminationReason::CallbackRequested
    );
    assert_eq!(*count.borrow(), 3);
    Ok(())
}

/// Constraint models are honored at intermediate nodes too.
#[test]
fn intermediate_equality_constraint() -> TestResult {
    let n = 20;
    let mut solver = IterativeLqr::new(Arc::new(double_integrator(0.1)), n);
    solver.set_intermediate_cost_all(Arc::new(QuadraticCost::new(
        DMatrix::zeros(2, 2),
        dmatrix![2.0],
    )));
    solver.set_final_cost(Arc::new(QuadraticCost::new(
        dmatrix![200.0, 0.0; 0.0, 200.0],
        dmatrix![0.0],
    )))?;
    // waypoint at mid-horizon: velocity pinned to zero
    solver.set_intermediate_constraint(
        10,
        Arc::new(LinearConstraint::new(
            dmatrix![0.0, 1.0],
            DMatrix::zeros(1, 1),
            dvector![0.0],
        )),
    )?;
    solver.set_initial_state(&dvector![1.0, 0.0])?;

    assert!(solver.solve(100)?);
    assert!(solver.state(10)[1].abs() < 1e-5, "waypoint velocity not met");
    Ok(())
}

/// `ConstraintModel::dim` mismatches are fatal at linearization time.
#[test]
fn dimension_mismatch_is_fatal() -> TestResult {
    struct BrokenConstraint;
    impl ConstraintModel for BrokenConstraint {
        fn dim(&self) -> usize {
            2
        }
        fn eval(&self, _x: &DVector<f64>, _u: &DVector<f64>) -> DVector<f64> {
            dvector![0.0] // wrong length
        }
        fn jacobian(&self, _x: &DVector<f64>, _u: &DVector<f64>) -> (DMatrix<f64>, DMatrix<f64>) {
            (DMatrix::zeros(2, 2), DMatrix::zeros(2, 1))
        }
    }

    let mut solver = IterativeLqr::new(Arc::new(double_integrator(0.1)), 5);
    solver.set_final_constraint(Arc::new(BrokenConstraint))?;
    solver.set_initial_state(&dvector![0.0, 0.0])?;

    let err = solver.solve(5).unwrap_err();
    assert!(err.to_string().contains("dimension mismatch"));
    Ok(())
}

/// Cost models can be shared across stages and replaced between solves.
#[test]
fn oracle_replacement_between_solves() -> TestResult {
    let n = 20;
    let mut solver = IterativeLqr::new(Arc::new(double_integrator(0.1)), n);
    solver.set_initial_state(&dvector![1.0, 0.0])?;

    let _ = solver.solve(30)?;
    let first_cost = solver.profiling_info().history.last().ok_or("no history")?.cost;

    // steer to a different target with a fresh terminal cost
    solver.set_final_cost(Arc::new(QuadraticCost::with_targets(
        dmatrix![400.0, 0.0; 0.0, 400.0],
        dmatrix![0.0],
        dvector![-1.0, 0.0],
        dvector![0.0],
    )))?;
    let _ = solver.solve(60)?;

    assert!((solver.state(n)[0] - (-1.0)).abs() < 0.1);
    let second_cost = solver.profiling_info().history.last().ok_or("no history")?.cost;
    assert!(second_cost.is_finite() && first_cost.is_finite());
    Ok(())
}

/// A CostModel implemented outside the crate works (trait extensibility).
#[test]
fn custom_cost_model() -> TestResult {
    /// ℓ(x, u) = ½‖u‖² + q·(1 − cos(x₀)), a pendulum-style running cost
    struct SwingCost;
    impl CostModel for SwingCost {
        fn eval(&self, x: &DVector<f64>, u: &DVector<f64>) -> f64 {
            0.5 * u.norm_squared() + 4.0 * (1.0 - x[0].cos())
        }
        fn gradient(&self, x: &DVector<f64>, u: &DVector<f64>) -> (DVector<f64>, DVector<f64>) {
            (dvector![4.0 * x[0].sin(), 0.0], u.clone())
        }
        fn hessian(
            &self,
            x: &DVector<f64>,
            _u: &DVector<f64>,
        ) -> (DMatrix<f64>, DMatrix<f64>, DMatrix<f64>) {
            (
                dmatrix![4.0 * x[0].cos(), 0.0; 0.0, 0.0],
                DMatrix::identity(1, 1),
                DMatrix::zeros(1, 2),
            )
        }
    }

    let mut solver = IterativeLqr::new(Arc::new(double_integrator(0.1)), 25);
    solver.set_intermediate_cost_all(Arc::new(SwingCost));
    solver.set_final_cost(Arc::new(QuadraticCost::new(
        dmatrix![100.0, 0.0; 0.0, 100.0],
        dmatrix![0.0],
    )))?;
    solver.set_initial_state(&dvector![0.8, 0.0])?;

    solver.solve(100)?;
    // the nonlinear attitude term pulls x₀ toward a multiple of 2π
    assert!(solver.state(25)[0].abs() < 0.5);
    Ok(())
}
