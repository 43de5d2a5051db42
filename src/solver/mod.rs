//! Multiple-shooting iterative LQR solver.
//!
//! [`IterativeLqr`] solves discrete-time optimal control problems
//!
//! ```text
//! minimize   Σₖ ℓₖ(xₖ, uₖ) + ℓ_N(x_N)
//! subject to xₖ₊₁ = fₖ(xₖ, uₖ)         k = 0 … N−1
//!            hₖ(xₖ, uₖ) = 0             k = 0 … N
//!            lb ≤ (xₖ, uₖ) ≤ ub
//! ```
//!
//! with a Riccati-style backward sweep over a multiple-shooting
//! transcription: both state and input trajectories are decision variables,
//! and dynamics gaps ("defects") between consecutive shooting nodes are
//! closed progressively by the line search rather than assumed zero.
//!
//! # Algorithm, per outer iteration
//!
//! 1. **Linearize-quadratize** the oracle models along the current
//!    trajectories.
//! 2. **Backward pass**: a Riccati recursion augmented with a
//!    constraint-to-go accumulator. At each stage the equality rows that
//!    the stage input can satisfy are absorbed into a KKT system whose
//!    solution yields the affine policy `δu = l + L·δx` plus multipliers;
//!    the remaining rows bubble backwards through the dynamics. A
//!    non-finite KKT solution raises the recoverable indefinite-Hessian
//!    condition, grows the regularization shift and restarts the sweep.
//! 3. **Initial-state optimization**: a small KKT solve spends whatever
//!    freedom `x₀` has on the rows that reached stage 0; leftover rows are
//!    reported as an infeasibility diagnostic.
//! 4. **Line search** on an ℓ₁ merit function with adaptive weights:
//!    backtracking forward passes roll the closed-loop policy at step
//!    length α, closing defects in proportion to α.
//! 5. Optionally an **augmented-Lagrangian update** lifts violated
//!    inequality bounds further into the cost and re-enters the loop.
//!
//! # Example
//!
//! ```no_run
//! use arbalest_solver::{IterativeLqr, LinearDynamics, QuadraticCost};
//! use nalgebra::{dmatrix, dvector};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let dynamics = LinearDynamics::new(dmatrix![1.0, 0.1; 0.0, 1.0], dmatrix![0.0; 0.1]);
//! let mut solver = IterativeLqr::new(Arc::new(dynamics), 30);
//!
//! solver.set_final_cost(Arc::new(QuadraticCost::new(
//!     dmatrix![100.0, 0.0; 0.0, 100.0],
//!     dmatrix![0.0],
//! )))?;
//! solver.set_initial_state(&dvector![1.0, 0.0])?;
//!
//! let converged = solver.solve(50)?;
//! assert!(converged);
//! # Ok(())
//! # }
//! ```

use nalgebra::{DMatrix, DVector, DVectorView};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error};

use crate::error::SolverError;
use crate::linalg::{ConstrDecomp, KktDecomp, LinAlgError};
use crate::model::{
    check_len, check_shape, ConstraintModel, CostModel, DynamicsModel, ModelError, QuadraticCost,
};

mod auglag;
mod backward;
mod data;
mod forward;

use auglag::BoundPenalty;
use data::{
    BackwardPassResult, BoxBounds, ConstraintData, ConstraintToGo, CostData, DynamicsData,
    ForwardPassResult, StageWorkspace, ValueFunction,
};

/// Fixed safety factor on the merit weights (Nocedal & Wright §18).
pub(crate) const MERIT_SAFETY_FACTOR: f64 = 2.0;
/// Multiplicative backtracking shrink.
pub(crate) const STEP_SHRINK: f64 = 0.5;
/// Smallest step length tried by the line search.
pub(crate) const ALPHA_MIN: f64 = 1e-3;
/// Armijo sufficient-decrease coefficient.
pub(crate) const ARMIJO_ETA: f64 = 1e-4;
/// Feasibility tolerance of the stopping test (defects and constraints).
pub(crate) const FEASIBILITY_TOL: f64 = 1e-6;
/// Relative merit-slope / step-length tolerance of the stopping test.
pub(crate) const STATIONARITY_TOL: f64 = 1e-9;
/// Infeasible rows below this size in both residual and gradient are
/// linearly dependent and get dropped.
pub(crate) const DEPENDENT_ROW_TOL: f64 = 1e-9;

/// Solve-loop error types.
#[derive(Debug, Clone, Error)]
pub enum SolveError {
    /// KKT solve produced non-finite values; caught by the regularization
    /// retry loop inside the backward pass
    #[error("indefinite stage Hessian at stage {stage}")]
    HessianIndefinite { stage: usize },

    /// The backward pass kept failing after the retry budget
    #[error("backward pass failed after {retries} regularization retries")]
    RegularizationExhausted { retries: usize },

    /// The constraint-to-go accumulator ran out of rows
    #[error("constraint-to-go buffer full ({capacity} rows)")]
    ConstraintBufferFull { capacity: usize },

    /// Linear algebra failure outside the KKT retry path
    #[error(transparent)]
    LinAlg(#[from] LinAlgError),
}

impl SolveError {
    /// Log the error with `tracing::error` and return self for chaining.
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }
}

/// Configuration for [`IterativeLqr`].
///
/// Built with the `with_*` methods:
///
/// ```
/// use arbalest_solver::{IterativeLqrConfig, KktDecomp, ConstrDecomp};
///
/// let config = IterativeLqrConfig::new()
///     .with_kkt_decomp(KktDecomp::Ldlt)
///     .with_constr_decomp(ConstrDecomp::Qr)
///     .with_auglag(10.0, 10.0);
/// ```
#[derive(Debug, Clone)]
pub struct IterativeLqrConfig {
    /// Factorization for the stage and initial-state KKT systems
    pub kkt_decomp: KktDecomp,
    /// Factorization for the constraint feasible/infeasible split
    pub constr_decomp: ConstrDecomp,
    /// Pivot threshold for rank detection (max pivot below it means rank 0)
    pub rank_threshold: f64,
    /// Floor of the state-Hessian regularization shift
    pub hxx_reg_base: f64,
    /// Growth factor applied to the shift on every backward-pass retry
    pub hxx_reg_growth: f64,
    /// Additive input-Hessian regularization shift
    pub huu_reg: f64,
    /// Tikhonov shift ε on the dual block of the stage KKT matrix
    pub kkt_reg: f64,
    /// Lift strict inequality bounds into the cost via augmented Lagrangian
    pub enable_auglag: bool,
    /// Initial penalty weight ρ₀
    pub rho_initial: f64,
    /// Penalty growth per outer update
    pub rho_growth: f64,
    /// Merit-slope flatness gate for the outer update
    pub merit_der_threshold: f64,
    /// Feasibility threshold for bounds and the initial-state residual scan
    pub constraint_violation_threshold: f64,
    /// Row capacity of the constraint-to-go accumulator (default 10·nx)
    pub constraint_to_go_capacity: Option<usize>,
    /// Cap on regularization retries within one backward pass
    pub max_reg_retries: usize,
}

impl Default for IterativeLqrConfig {
    fn default() -> Self {
        Self {
            kkt_decomp: KktDecomp::default(),
            constr_decomp: ConstrDecomp::default(),
            rank_threshold: 1e-12,
            hxx_reg_base: 0.0,
            hxx_reg_growth: 10.0,
            huu_reg: 0.0,
            kkt_reg: 0.0,
            enable_auglag: false,
            rho_initial: 1.0,
            rho_growth: 10.0,
            merit_der_threshold: 1e-6,
            constraint_violation_threshold: 1e-6,
            constraint_to_go_capacity: None,
            max_reg_retries: 20,
        }
    }
}

impl IterativeLqrConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_kkt_decomp(mut self, decomp: KktDecomp) -> Self {
        self.kkt_decomp = decomp;
        self
    }

    pub fn with_constr_decomp(mut self, decomp: ConstrDecomp) -> Self {
        self.constr_decomp = decomp;
        self
    }

    pub fn with_rank_threshold(mut self, threshold: f64) -> Self {
        self.rank_threshold = threshold;
        self
    }

    /// Set the regularization floor and its retry growth factor.
    pub fn with_regularization(mut self, hxx_base: f64, growth: f64, huu: f64) -> Self {
        self.hxx_reg_base = hxx_base;
        self.hxx_reg_growth = growth;
        self.huu_reg = huu;
        self
    }

    pub fn with_kkt_reg(mut self, kkt_reg: f64) -> Self {
        self.kkt_reg = kkt_reg;
        self
    }

    /// Enable the augmented-Lagrangian bound handling.
    pub fn with_auglag(mut self, rho_initial: f64, rho_growth: f64) -> Self {
        self.enable_auglag = true;
        self.rho_initial = rho_initial;
        self.rho_growth = rho_growth;
        self
    }

    pub fn with_merit_der_threshold(mut self, threshold: f64) -> Self {
        self.merit_der_threshold = threshold;
        self
    }

    pub fn with_constraint_violation_threshold(mut self, threshold: f64) -> Self {
        self.constraint_violation_threshold = threshold;
        self
    }

    pub fn with_constraint_to_go_capacity(mut self, capacity: usize) -> Self {
        self.constraint_to_go_capacity = Some(capacity);
        self
    }

    /// Print configuration parameters (debug level only)
    pub fn print_configuration(&self) {
        debug!(
            "configuration:\n  KKT decomposition:        {}\n  constraint decomposition: {}\n  rank threshold:           {:.2e}\n  hxx_reg base / growth:    {:.2e} / {:.2}\n  huu_reg:                  {:.2e}\n  kkt_reg:                  {:.2e}\n  auglag:                   {} (rho0 = {:.2e}, growth = {:.2})",
            self.kkt_decomp,
            self.constr_decomp,
            self.rank_threshold,
            self.hxx_reg_base,
            self.hxx_reg_growth,
            self.huu_reg,
            self.kkt_reg,
            if self.enable_auglag { "on" } else { "off" },
            self.rho_initial,
            self.rho_growth,
        );
    }
}

/// Why the last `solve` call returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TerminationReason {
    /// The stopping criteria were met
    Converged,
    /// The iteration budget ran out first
    IterationBudgetExhausted,
    /// The iteration callback returned `false`
    CallbackRequested,
    /// `solve` has not run yet
    #[default]
    NotRun,
}

/// Snapshot handed to the iteration callback after every line-search attempt.
///
/// The trajectory views borrow from the solver and are only valid for the
/// duration of the call; the callback must not mutate solver state and must
/// return promptly. Returning `false` requests early termination.
#[derive(Debug)]
pub struct IterationReport<'a> {
    pub xtrj: &'a DMatrix<f64>,
    pub utrj: &'a DMatrix<f64>,
    pub alpha: f64,
    pub step_length: f64,
    pub cost: f64,
    pub defect_norm: f64,
    pub constraint_violation: f64,
    pub bound_violation: f64,
    pub merit: f64,
    pub accepted: bool,
}

/// Iteration callback type; see [`IterationReport`].
pub type IterationCallback = Box<dyn FnMut(&IterationReport<'_>) -> bool>;

/// Per-iteration statistics kept in the profiling record.
#[derive(Debug, Clone)]
pub struct IterationStats {
    pub iteration: usize,
    pub alpha: f64,
    pub cost: f64,
    pub defect_norm: f64,
    pub constraint_violation: f64,
    pub bound_violation: f64,
    pub merit: f64,
    pub merit_der: f64,
    pub step_length: f64,
    pub accepted: bool,
}

impl IterationStats {
    /// Print the table header (debug level).
    pub fn print_header() {
        debug!(
            "{:>4}  {:>9}  {:>13}  {:>11}  {:>11}  {:>11}  {:>13}  {:>11}  {:>9}  {:>6}",
            "iter",
            "alpha",
            "cost",
            "defect",
            "constr",
            "bound",
            "merit",
            "merit_der",
            "step",
            "status"
        );
    }

    /// Print one table line (debug level).
    pub fn print_line(&self) {
        debug!(
            "{:>4}  {:>9.2e}  {:>13.6e}  {:>11.2e}  {:>11.2e}  {:>11.2e}  {:>13.6e}  {:>11.2e}  {:>9.2e}  {:>6}",
            self.iteration,
            self.alpha,
            self.cost,
            self.defect_norm,
            self.constraint_violation,
            self.bound_violation,
            self.merit,
            self.merit_der,
            self.step_length,
            if self.accepted { "ok" } else { "rej" },
        );
    }
}

/// Counters, accumulated phase timings and per-iteration history of the
/// last `solve` call.
#[derive(Debug, Clone, Default)]
pub struct ProfilingInfo {
    pub iterations: usize,
    pub backward_passes: usize,
    pub forward_passes: usize,
    pub reg_retries: usize,
    pub auglag_updates: usize,
    /// Line searches that ran out of step lengths and soft-accepted
    pub soft_accepts: usize,
    /// Linearly dependent constraint rows discarded during backward passes
    pub dropped_dependent_rows: usize,
    /// Times the initial-state residual scan left rows unsatisfied
    pub infeasibility_warnings: usize,
    /// Largest unsatisfied initial-state residual (∞-norm) observed
    pub max_infeasibility_residual: f64,
    pub linearize_time: Duration,
    pub backward_time: Duration,
    pub line_search_time: Duration,
    pub termination: TerminationReason,
    pub history: Vec<IterationStats>,
}

/// Multiple-shooting iterative LQR solver; see the [module docs](self).
pub struct IterativeLqr {
    nx: usize,
    nu: usize,
    n: usize,

    dynamics: Arc<dyn DynamicsModel>,
    cost: Vec<Arc<dyn CostModel>>,
    constraint: Vec<Option<Arc<dyn ConstraintModel>>>,

    xtrj: DMatrix<f64>,
    utrj: DMatrix<f64>,
    bounds: BoxBounds,

    dyn_data: Vec<DynamicsData>,
    cost_data: Vec<CostData>,
    con_data: Vec<Option<ConstraintData>>,
    value: Vec<ValueFunction>,
    bp_res: Vec<BackwardPassResult>,
    dx0: DVector<f64>,
    ctg: ConstraintToGo,
    fp_res: ForwardPassResult,
    ws: Vec<StageWorkspace>,
    penalty: BoundPenalty,

    hxx_reg: f64,
    config: IterativeLqrConfig,
    callback: Option<IterationCallback>,
    profile: ProfilingInfo,
}

impl IterativeLqr {
    /// Create a solver for an `n`-interval horizon over the given dynamics.
    ///
    /// State and input dimensions are taken from the dynamics model. A
    /// default cost (½‖u‖² running, ½‖x‖² final) is installed so the solver
    /// works out of the box.
    ///
    /// # Panics
    /// Panics if `n == 0` or the dynamics reports a zero dimension.
    pub fn new(dynamics: Arc<dyn DynamicsModel>, n: usize) -> Self {
        Self::with_config(dynamics, n, IterativeLqrConfig::default())
    }

    /// Create a solver with an explicit configuration.
    pub fn with_config(
        dynamics: Arc<dyn DynamicsModel>,
        n: usize,
        config: IterativeLqrConfig,
    ) -> Self {
        let nx = dynamics.nx();
        let nu = dynamics.nu();
        assert!(n >= 1, "horizon must have at least one interval");
        assert!(nx >= 1 && nu >= 1, "state and input must be non-empty");

        let capacity = config.constraint_to_go_capacity.unwrap_or(10 * nx);

        let running: Arc<dyn CostModel> = Arc::new(QuadraticCost::new(
            DMatrix::zeros(nx, nx),
            DMatrix::identity(nu, nu),
        ));
        let terminal: Arc<dyn CostModel> = Arc::new(QuadraticCost::new(
            DMatrix::identity(nx, nx),
            DMatrix::zeros(nu, nu),
        ));
        let mut cost: Vec<Arc<dyn CostModel>> =
            (0..n).map(|_| Arc::clone(&running)).collect();
        cost.push(terminal);

        Self {
            nx,
            nu,
            n,
            dynamics,
            cost,
            constraint: vec![None; n + 1],
            xtrj: DMatrix::zeros(nx, n + 1),
            utrj: DMatrix::zeros(nu, n),
            bounds: BoxBounds::new(nx, nu, n),
            dyn_data: (0..n).map(|_| DynamicsData::new(nx, nu)).collect(),
            cost_data: (0..=n).map(|_| CostData::new(nx, nu)).collect(),
            con_data: (0..=n).map(|_| None).collect(),
            value: (0..=n).map(|_| ValueFunction::new(nx)).collect(),
            bp_res: (0..n)
                .map(|_| BackwardPassResult::new(nx, nu, capacity))
                .collect(),
            dx0: DVector::zeros(nx),
            ctg: ConstraintToGo::new(nx, nu, capacity),
            fp_res: ForwardPassResult::new(nx, nu, n),
            ws: (0..n).map(|_| StageWorkspace::new(nx, nu)).collect(),
            penalty: BoundPenalty::new(nx, nu, n, config.rho_initial),
            hxx_reg: config.hxx_reg_base,
            config,
            callback: None,
            profile: ProfilingInfo::default(),
        }
    }

    pub fn nx(&self) -> usize {
        self.nx
    }

    pub fn nu(&self) -> usize {
        self.nu
    }

    /// Number of shooting intervals.
    pub fn horizon(&self) -> usize {
        self.n
    }

    pub fn config(&self) -> &IterativeLqrConfig {
        &self.config
    }

    /// Replace the configuration between solves. Buffers that depend on the
    /// constraint-to-go capacity are re-sized.
    pub fn set_config(&mut self, config: IterativeLqrConfig) {
        let capacity = config.constraint_to_go_capacity.unwrap_or(10 * self.nx);
        self.ctg = ConstraintToGo::new(self.nx, self.nu, capacity);
        self.bp_res = (0..self.n)
            .map(|_| BackwardPassResult::new(self.nx, self.nu, capacity))
            .collect();
        self.hxx_reg = config.hxx_reg_base;
        self.config = config;
    }

    /// Set the running cost at node `k`.
    pub fn set_intermediate_cost(
        &mut self,
        k: usize,
        model: Arc<dyn CostModel>,
    ) -> Result<(), SolverError> {
        self.check_intermediate_node(k)?;
        self.cost[k] = model;
        Ok(())
    }

    /// Set the same running cost at every node `0 … N−1`.
    pub fn set_intermediate_cost_all(&mut self, model: Arc<dyn CostModel>) {
        for k in 0..self.n {
            self.cost[k] = Arc::clone(&model);
        }
    }

    /// Set the final cost; evaluated state-only.
    pub fn set_final_cost(&mut self, model: Arc<dyn CostModel>) -> Result<(), SolverError> {
        self.cost[self.n] = model;
        Ok(())
    }

    /// Set the equality constraint at node `k`.
    pub fn set_intermediate_constraint(
        &mut self,
        k: usize,
        model: Arc<dyn ConstraintModel>,
    ) -> Result<(), SolverError> {
        self.check_intermediate_node(k)?;
        self.con_data[k] = Some(ConstraintData::new(model.dim(), self.nx, self.nu));
        self.constraint[k] = Some(model);
        Ok(())
    }

    /// Set the same equality constraint at every node `0 … N−1`.
    pub fn set_intermediate_constraint_all(&mut self, model: Arc<dyn ConstraintModel>) {
        for k in 0..self.n {
            self.con_data[k] = Some(ConstraintData::new(model.dim(), self.nx, self.nu));
            self.constraint[k] = Some(Arc::clone(&model));
        }
    }

    /// Set the final equality constraint; evaluated state-only.
    pub fn set_final_constraint(
        &mut self,
        model: Arc<dyn ConstraintModel>,
    ) -> Result<(), SolverError> {
        self.con_data[self.n] = Some(ConstraintData::new(model.dim(), self.nx, self.nu));
        self.constraint[self.n] = Some(model);
        Ok(())
    }

    /// Set per-stage state bounds, `nx × (N+1)` each.
    pub fn set_state_bounds(
        &mut self,
        lb: &DMatrix<f64>,
        ub: &DMatrix<f64>,
    ) -> Result<(), SolverError> {
        check_shape("state lower bound", lb, self.nx, self.n + 1)?;
        check_shape("state upper bound", ub, self.nx, self.n + 1)?;
        self.bounds.x_lb.copy_from(lb);
        self.bounds.x_ub.copy_from(ub);
        Ok(())
    }

    /// Set per-stage input bounds, `nu × N` each.
    pub fn set_input_bounds(
        &mut self,
        lb: &DMatrix<f64>,
        ub: &DMatrix<f64>,
    ) -> Result<(), SolverError> {
        check_shape("input lower bound", lb, self.nu, self.n)?;
        check_shape("input upper bound", ub, self.nu, self.n)?;
        self.bounds.u_lb.copy_from(lb);
        self.bounds.u_ub.copy_from(ub);
        Ok(())
    }

    /// Set the initial state. Also pins the stage-0 state bounds to `x0`,
    /// declaring the initial state fixed.
    pub fn set_initial_state(&mut self, x0: &DVector<f64>) -> Result<(), SolverError> {
        check_len("initial state", x0, self.nx)?;
        self.xtrj.set_column(0, x0);
        self.bounds.x_lb.set_column(0, x0);
        self.bounds.x_ub.set_column(0, x0);
        Ok(())
    }

    /// Warm-start the state trajectory, `nx × (N+1)`.
    pub fn set_state_trajectory(&mut self, x: &DMatrix<f64>) -> Result<(), SolverError> {
        check_shape("state trajectory", x, self.nx, self.n + 1)?;
        self.xtrj.copy_from(x);
        Ok(())
    }

    /// Warm-start the input trajectory, `nu × N`.
    pub fn set_input_trajectory(&mut self, u: &DMatrix<f64>) -> Result<(), SolverError> {
        check_shape("input trajectory", u, self.nu, self.n)?;
        self.utrj.copy_from(u);
        Ok(())
    }

    /// Install the iteration callback; see [`IterationReport`].
    pub fn set_iteration_callback<F>(&mut self, cb: F)
    where
        F: FnMut(&IterationReport<'_>) -> bool + 'static,
    {
        self.callback = Some(Box::new(cb));
    }

    pub fn state_trajectory(&self) -> &DMatrix<f64> {
        &self.xtrj
    }

    pub fn input_trajectory(&self) -> &DMatrix<f64> {
        &self.utrj
    }

    pub fn state(&self, k: usize) -> DVectorView<'_, f64> {
        self.xtrj.column(k)
    }

    pub fn input(&self, k: usize) -> DVectorView<'_, f64> {
        self.utrj.column(k)
    }

    pub fn profiling_info(&self) -> &ProfilingInfo {
        &self.profile
    }

    /// Run the solver for at most `max_iter` outer iterations.
    ///
    /// Returns `Ok(true)` if the stopping criteria were met within the
    /// budget, `Ok(false)` on budget exhaustion or callback-requested
    /// termination. Fatal conditions (non-finite inputs, oracle shape
    /// mismatches, exhausted regularization retries) abort with an error.
    pub fn solve(&mut self, max_iter: usize) -> Result<bool, SolverError> {
        self.validate_inputs()?;

        self.profile = ProfilingInfo::default();
        self.hxx_reg = self.config.hxx_reg_base;
        if self.config.enable_auglag {
            self.penalty.reset(self.config.rho_initial);
        }

        if tracing::enabled!(tracing::Level::DEBUG) {
            self.config.print_configuration();
            IterationStats::print_header();
        }

        for iter in 0..max_iter {
            let t0 = Instant::now();
            self.linearize_quadratize()?;
            self.profile.linearize_time += t0.elapsed();

            let t0 = Instant::now();
            self.backward_pass()?;
            self.profile.backward_time += t0.elapsed();
            self.reduce_regularization();

            let t0 = Instant::now();
            let keep_going = self.line_search(iter)?;
            self.profile.line_search_time += t0.elapsed();
            self.profile.iterations = iter + 1;

            if !keep_going {
                self.profile.termination = TerminationReason::CallbackRequested;
                return Ok(false);
            }

            if self.auglag_update() {
                continue;
            }

            if self.should_stop() {
                self.profile.termination = TerminationReason::Converged;
                return Ok(true);
            }
        }

        self.profile.termination = TerminationReason::IterationBudgetExhausted;
        Ok(false)
    }

    fn check_intermediate_node(&self, k: usize) -> Result<(), SolverError> {
        if k >= self.n {
            return Err(ModelError::DimensionMismatch {
                what: "intermediate node index",
                expected_rows: self.n,
                expected_cols: 1,
                actual_rows: k,
                actual_cols: 1,
            }
            .log()
            .into());
        }
        Ok(())
    }

    fn validate_inputs(&self) -> Result<(), SolverError> {
        if self.xtrj.column(0).iter().any(|v| !v.is_finite()) {
            return Err(ModelError::NonFiniteInput {
                what: "initial state",
            }
            .log()
            .into());
        }

        let bounds = [
            ("state bounds", &self.bounds.x_lb, &self.bounds.x_ub),
            ("input bounds", &self.bounds.u_lb, &self.bounds.u_ub),
        ];
        for (what, lb, ub) in bounds {
            if lb.iter().chain(ub.iter()).any(|v| v.is_nan()) {
                return Err(ModelError::NonFiniteInput { what }.log().into());
            }
            if lb.iter().zip(ub.iter()).any(|(l, u)| l > u) {
                return Err(ModelError::InvalidBounds { what }.log().into());
            }
        }
        Ok(())
    }

    /// Refresh every stage linearization along the current trajectories.
    fn linearize_quadratize(&mut self) -> Result<(), SolverError> {
        let (nx, nu) = (self.nx, self.nu);

        for i in 0..self.n {
            let x = self.xtrj.column(i).clone_owned();
            let u = self.utrj.column(i).clone_owned();

            let (a, b) = self.dynamics.linearize(&x, &u);
            check_shape("dynamics jacobian A", &a, nx, nx)?;
            check_shape("dynamics jacobian B", &b, nx, nu)?;
            let f = self.dynamics.eval(&x, &u);
            check_len("dynamics value", &f, nx)?;

            let dd = &mut self.dyn_data[i];
            dd.a.copy_from(&a);
            dd.b.copy_from(&b);
            dd.d.copy_from(&f);
            dd.d -= self.xtrj.column(i + 1);

            self.quadratize_cost(i, &x, &u)?;
            self.linearize_constraint(i, &x, &u)?;

            if self.config.enable_auglag {
                self.penalty.add_quadratization(
                    i,
                    &x,
                    Some(&u),
                    &self.bounds,
                    &mut self.cost_data[i],
                );
            }
        }

        // final node: state-only cost and constraint, input slot aliased to
        // the last input by convention
        let x = self.xtrj.column(self.n).clone_owned();
        let u = self.utrj.column(self.n - 1).clone_owned();
        self.quadratize_cost(self.n, &x, &u)?;
        self.linearize_constraint(self.n, &x, &u)?;
        if self.config.enable_auglag {
            self.penalty.add_quadratization(
                self.n,
                &x,
                None,
                &self.bounds,
                &mut self.cost_data[self.n],
            );
        }

        Ok(())
    }

    fn quadratize_cost(
        &mut self,
        k: usize,
        x: &DVector<f64>,
        u: &DVector<f64>,
    ) -> Result<(), SolverError> {
        let (nx, nu) = (self.nx, self.nu);
        let final_node = k == self.n;

        let (qx, ru) = self.cost[k].gradient(x, u);
        check_len("cost gradient q", &qx, nx)?;
        let (qxx, ruu, pux) = self.cost[k].hessian(x, u);
        check_shape("cost hessian Q", &qxx, nx, nx)?;

        let cd = &mut self.cost_data[k];
        cd.qx.copy_from(&qx);
        cd.qxx.copy_from(&qxx);

        if !final_node {
            check_len("cost gradient r", &ru, nu)?;
            check_shape("cost hessian R", &ruu, nu, nu)?;
            check_shape("cost hessian P", &pux, nu, nx)?;
            cd.ru.copy_from(&ru);
            cd.ruu.copy_from(&ruu);
            cd.pux.copy_from(&pux);
        }
        Ok(())
    }

    fn linearize_constraint(
        &mut self,
        k: usize,
        x: &DVector<f64>,
        u: &DVector<f64>,
    ) -> Result<(), SolverError> {
        let Some(model) = self.constraint[k].as_ref() else {
            return Ok(());
        };
        let m = model.dim();

        let h = model.eval(x, u);
        check_len("constraint value h", &h, m)?;
        let (c, d) = model.jacobian(x, u);
        check_shape("constraint jacobian C", &c, m, self.nx)?;
        check_shape("constraint jacobian D", &d, m, self.nu)?;

        let cd = self.con_data[k].as_mut().expect("constraint data allocated");
        cd.c.copy_from(&c);
        cd.d.copy_from(&d);
        cd.h.copy_from(&h);
        Ok(())
    }

    /// Feasible and stationary (flat merit slope or negligible step).
    fn should_stop(&self) -> bool {
        let fp = &self.fp_res;

        if fp.constraint_violation > FEASIBILITY_TOL || fp.defect_norm > FEASIBILITY_TOL {
            return false;
        }

        let merit_scale = fp.merit.abs().max(f64::EPSILON);
        if (fp.merit_der.abs() / merit_scale) < STATIONARITY_TOL {
            return true;
        }

        let u_norm = self.utrj.norm();
        if u_norm > 0.0 {
            fp.step_length / u_norm < STATIONARITY_TOL
        } else {
            fp.step_length < STATIONARITY_TOL
        }
    }

    /// Invoke the iteration callback with the current candidate; returns
    /// `false` when the callback requests termination.
    fn report(&mut self) -> bool {
        let Some(mut cb) = self.callback.take() else {
            return true;
        };
        let fp = &self.fp_res;
        let report = IterationReport {
            xtrj: &fp.xtrj,
            utrj: &fp.utrj,
            alpha: fp.alpha,
            step_length: fp.step_length,
            cost: fp.cost,
            defect_norm: fp.defect_norm,
            constraint_violation: fp.constraint_violation,
            bound_violation: fp.bound_violation,
            merit: fp.merit,
            accepted: fp.accepted,
        };
        let keep_going = cb(&report);
        self.callback = Some(cb);
        keep_going
    }
}
