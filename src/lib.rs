//! # Arbalest Solver
//!
//! A Rust library for constrained discrete-time trajectory optimization,
//! built around a multiple-shooting variant of the iterative LQR algorithm
//! in the spirit of "A Family of Iterative Gauss-Newton Shooting Methods
//! for Nonlinear Optimal Control" (Giftthaler et al.).
//!
//! ## Features
//!
//! - **Multiple shooting**: state and input trajectories are both decision
//!   variables; dynamics gaps are closed progressively by the line search,
//!   so infeasible initializations are fine
//! - **Equality constraints by projection**: stage constraints are rotated
//!   into the part the stage input can satisfy and a remainder that
//!   propagates backwards in time (the constraint-to-go), preserving the
//!   Riccati sweep's complexity
//! - **Box bounds**: equality rows become hard constraints, strict rows go
//!   through an augmented-Lagrangian outer loop
//! - **Configurable linear algebra**: LU/QR/LDLT for the stage KKT systems,
//!   SVD / column-pivoted QR / COD for constraint rank detection, built on
//!   the `faer` library
//! - **Robustness**: ℓ₁ merit line search with adaptive weights, and
//!   automatic regularization retries on indefinite stage Hessians
//!
//! ## Quick start
//!
//! ```no_run
//! use arbalest_solver::{IterativeLqr, LinearDynamics, QuadraticCost};
//! use nalgebra::{dmatrix, dvector};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // double integrator, 30 shooting intervals
//! let dynamics = LinearDynamics::new(dmatrix![1.0, 0.1; 0.0, 1.0], dmatrix![0.0; 0.1]);
//! let mut solver = IterativeLqr::new(Arc::new(dynamics), 30);
//!
//! solver.set_final_cost(Arc::new(QuadraticCost::new(
//!     dmatrix![100.0, 0.0; 0.0, 100.0],
//!     dmatrix![0.0],
//! )))?;
//! solver.set_initial_state(&dvector![1.0, 0.0])?;
//!
//! if solver.solve(50)? {
//!     println!("final state: {}", solver.state(30));
//! }
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod linalg;
pub mod logger;
pub mod model;
pub mod solver;

pub use error::{SolverError, SolverResult};
pub use linalg::{ConstrDecomp, KktDecomp, LinAlgError};
pub use logger::{init_logger, init_logger_with_level};
pub use model::{
    ConstraintModel, CostModel, DynamicsModel, GoalConstraint, LinearConstraint, LinearDynamics,
    ModelError, QuadraticCost,
};
pub use solver::{
    IterationCallback, IterationReport, IterationStats, IterativeLqr, IterativeLqrConfig,
    ProfilingInfo, SolveError, TerminationReason,
};
