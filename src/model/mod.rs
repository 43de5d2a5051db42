//! Oracle layer: user-supplied dynamics, cost and constraint models.
//!
//! The solver never differentiates anything itself. It consumes a bundle of
//! models that, given a state/input pair, return function values and their
//! first (and, for costs, second) derivatives:
//!
//! - [`DynamicsModel`]: `x_next = f(x, u)` with Jacobians `A = ∂f/∂x`,
//!   `B = ∂f/∂u`
//! - [`CostModel`]: `ℓ(x, u)` with gradient `(q, r)` and quadratization
//!   `(Q, R, P)` (Gauss-Newton or exact)
//! - [`ConstraintModel`]: `h(x, u) = 0` with Jacobians `(C, D)`
//!
//! # Contract
//!
//! Derivatives must be consistent with values to numerical precision,
//! output shapes must match the declared `(nx, nu)` (violations surface as
//! fatal [`ModelError::DimensionMismatch`] during linearization), and
//! evaluations must be pure: the solver is free to call a model any number
//! of times per iteration, in stage order, and caches nothing across model
//! replacement.
//!
//! Models are stored as shared trait objects so a single instance can serve
//! every stage of the horizon. Ready-made linear/quadratic implementations
//! live in [`linear`].

use nalgebra::{DMatrix, DVector};
use thiserror::Error;
use tracing::error;

pub mod linear;

pub use linear::{GoalConstraint, LinearConstraint, LinearDynamics, QuadraticCost};

/// Oracle-layer error types.
#[derive(Debug, Clone, Error)]
pub enum ModelError {
    /// Oracle output shape inconsistent with the declared state/input sizes
    #[error("dimension mismatch in {what}: expected {expected_rows}x{expected_cols}, got {actual_rows}x{actual_cols}")]
    DimensionMismatch {
        what: &'static str,
        expected_rows: usize,
        expected_cols: usize,
        actual_rows: usize,
        actual_cols: usize,
    },

    /// User-supplied data contains NaN or an unexpected infinity
    #[error("non-finite value in {what}")]
    NonFiniteInput { what: &'static str },

    /// A lower bound exceeds the matching upper bound
    #[error("invalid bounds for {what}: lower bound exceeds upper bound")]
    InvalidBounds { what: &'static str },
}

impl ModelError {
    /// Log the error with `tracing::error` and return self for chaining.
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }
}

/// Result type for oracle-layer operations
pub type ModelResult<T> = Result<T, ModelError>;

/// Discrete-time dynamics oracle `x_next = f(x, u)`.
pub trait DynamicsModel {
    /// State dimension
    fn nx(&self) -> usize;

    /// Input dimension
    fn nu(&self) -> usize;

    /// Integrate one step: `f(x, u)`
    fn eval(&self, x: &DVector<f64>, u: &DVector<f64>) -> DVector<f64>;

    /// Jacobians `(A, B)` of `f` at `(x, u)`
    fn linearize(&self, x: &DVector<f64>, u: &DVector<f64>) -> (DMatrix<f64>, DMatrix<f64>);
}

/// Stage cost oracle `ℓ(x, u)`.
///
/// The final-stage cost is evaluated with the last input by convention, but
/// must depend on the state only; its `R` and `P` blocks and `r` gradient
/// are ignored by the solver.
pub trait CostModel {
    /// Cost value
    fn eval(&self, x: &DVector<f64>, u: &DVector<f64>) -> f64;

    /// Gradient `(q, r)` = `(∂ℓ/∂x, ∂ℓ/∂u)`
    fn gradient(&self, x: &DVector<f64>, u: &DVector<f64>) -> (DVector<f64>, DVector<f64>);

    /// Quadratization `(Q, R, P)` = `(∂²ℓ/∂x², ∂²ℓ/∂u², ∂²ℓ/∂u∂x)`
    fn hessian(
        &self,
        x: &DVector<f64>,
        u: &DVector<f64>,
    ) -> (DMatrix<f64>, DMatrix<f64>, DMatrix<f64>);
}

/// Stage equality constraint oracle `h(x, u) = 0`.
pub trait ConstraintModel {
    /// Number of constraint rows
    fn dim(&self) -> usize;

    /// Residual `h(x, u)`
    fn eval(&self, x: &DVector<f64>, u: &DVector<f64>) -> DVector<f64>;

    /// Jacobians `(C, D)` = `(∂h/∂x, ∂h/∂u)`
    fn jacobian(&self, x: &DVector<f64>, u: &DVector<f64>) -> (DMatrix<f64>, DMatrix<f64>);
}

/// Check that an oracle output matrix has the expected shape.
pub(crate) fn check_shape(
    what: &'static str,
    m: &DMatrix<f64>,
    rows: usize,
    cols: usize,
) -> ModelResult<()> {
    if m.nrows() != rows || m.ncols() != cols {
        return Err(ModelError::DimensionMismatch {
            what,
            expected_rows: rows,
            expected_cols: cols,
            actual_rows: m.nrows(),
            actual_cols: m.ncols(),
        }
        .log());
    }
    Ok(())
}

/// Check that an oracle output vector has the expected length.
pub(crate) fn check_len(what: &'static str, v: &DVector<f64>, len: usize) -> ModelResult<()> {
    if v.len() != len {
        return Err(ModelError::DimensionMismatch {
            what,
            expected_rows: len,
            expected_cols: 1,
            actual_rows: v.len(),
            actual_cols: 1,
        }
        .log());
    }
    Ok(())
}
