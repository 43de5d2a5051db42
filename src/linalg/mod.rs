//! Dense linear algebra backends for the stage subproblems.
//!
//! The solver's outer arithmetic (Riccati recursions, rollouts) lives on
//! `nalgebra` types; the two factorization-heavy spots are delegated to the
//! `faer` library:
//!
//! - [`kkt`]: the per-stage saddle-point solve, by LU (fast default), QR
//!   (more robust), or LDLT (exploits symmetry);
//! - [`decomp`]: the rank-revealing orthogonal split of the constraint
//!   input Jacobian, by full-U SVD (most robust rank detection),
//!   column-pivoted QR (faster), or complete orthogonal decomposition.

use faer::{Mat, MatRef};
use nalgebra::DMatrix;
use std::fmt;
use std::fmt::{Display, Formatter};
use thiserror::Error;
use tracing::error;

pub mod decomp;
pub mod kkt;

pub use decomp::{rank_revealing_split, RankSplit};
pub use kkt::solve_kkt;

/// Factorization used for the stage KKT systems.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum KktDecomp {
    /// Partial-pivoting LU
    #[default]
    Lu,
    /// Householder QR
    Qr,
    /// Symmetric-indefinite LDLT (Bunch-Kaufman)
    Ldlt,
}

impl Display for KktDecomp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            KktDecomp::Lu => write!(f, "LU"),
            KktDecomp::Qr => write!(f, "QR"),
            KktDecomp::Ldlt => write!(f, "LDLT"),
        }
    }
}

/// Factorization used to split constraints into feasible/infeasible parts.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ConstrDecomp {
    /// Full-U singular value decomposition
    #[default]
    Svd,
    /// Column-pivoted QR
    Qr,
    /// Complete orthogonal decomposition
    Cod,
}

impl Display for ConstrDecomp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ConstrDecomp::Svd => write!(f, "SVD"),
            ConstrDecomp::Qr => write!(f, "column-pivoted QR"),
            ConstrDecomp::Cod => write!(f, "COD"),
        }
    }
}

/// Linear algebra error types.
#[derive(Debug, Clone, Error)]
pub enum LinAlgError {
    /// Matrix factorization failed
    #[error("matrix factorization failed: {0}")]
    FactorizationFailed(String),

    /// A solve produced NaN or infinite entries
    #[error("linear solve produced non-finite values")]
    NonFiniteSolution,
}

impl LinAlgError {
    /// Log the error with `tracing::error` and return self for chaining.
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log the error together with the underlying third-party error.
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | source: {:?}", self, source_error);
        self
    }
}

/// Result type for linear algebra operations
pub type LinAlgResult<T> = Result<T, LinAlgError>;

/// Copy a nalgebra matrix into a faer matrix.
pub(crate) fn to_faer(m: &DMatrix<f64>) -> Mat<f64> {
    Mat::from_fn(m.nrows(), m.ncols(), |i, j| m[(i, j)])
}

/// Copy a faer matrix view into a nalgebra matrix.
pub(crate) fn from_faer(m: MatRef<'_, f64>) -> DMatrix<f64> {
    DMatrix::from_fn(m.nrows(), m.ncols(), |i, j| m[(i, j)])
}
