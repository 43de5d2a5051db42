//! Error types for the arbalest-solver library
//!
//! The library uses a hierarchical error system:
//! - **`SolverError`** is the top-level error exposed to users via public APIs
//! - **Module errors** (`ModelError`, `SolveError`, `LinAlgError`) are wrapped
//!   inside `SolverError` with their sources preserved, allowing full error
//!   chain inspection.
//!
//! All errors use the `thiserror` crate for trait implementations.
//!
//! Note that not every numerical failure is an error: an indefinite stage
//! Hessian is caught inside the backward pass and handled by the
//! regularization retry loop, and an infeasible initial-state constraint
//! block only produces a warning and a profiling counter.

use crate::{linalg::LinAlgError, model::ModelError, solver::SolveError};
use std::error::Error as StdError;
use thiserror::Error;

/// Main result type used throughout the arbalest-solver library
pub type SolverResult<T> = Result<T, SolverError>;

/// Top-level error type exposed by public APIs.
///
/// Wraps module-specific errors while preserving the full error chain for
/// debugging. Use [`SolverError::chain`] to render the chain for logs.
#[derive(Debug, Error)]
pub enum SolverError {
    /// Oracle/model errors (dimension mismatches, non-finite inputs)
    #[error(transparent)]
    Model(#[from] ModelError),

    /// Solve-loop errors (regularization exhaustion, constraint overflow)
    #[error(transparent)]
    Solve(#[from] SolveError),

    /// Linear algebra errors
    #[error(transparent)]
    LinAlg(#[from] LinAlgError),
}

impl SolverError {
    /// Get the full error chain as a multi-line string for logging.
    pub fn chain(&self) -> String {
        let mut chain = vec![self.to_string()];
        let mut source = self.source();

        while let Some(err) = source {
            chain.push(format!("  -> {}", err));
            source = err.source();
        }

        chain.join("\n")
    }

    /// Get a compact single-line error chain.
    pub fn chain_compact(&self) -> String {
        let mut chain = vec![self.to_string()];
        let mut source = self.source();

        while let Some(err) = source {
            chain.push(err.to_string());
            source = err.source();
        }

        chain.join(" -> ")
    }
}
