//! Dense saddle-point solves for the stage KKT systems.
//!
//! The backward pass produces, per stage, a symmetric indefinite system
//!
//! ```text
//! [ Huu  Dfᵀ ] [ u ]   [ rhs ]
//! [ Df  −εI  ] [ λ ] =
//! ```
//!
//! solved against a block right-hand side carrying the feedback (state)
//! columns and the feedforward (constant) column at once. The same routine
//! serves the initial-state KKT system.
//!
//! A factorization that reports failure, or a solution containing NaN or
//! infinities, is reported as an error; the backward pass maps it to its
//! recoverable indefinite-Hessian condition and retries under increased
//! regularization.

use faer::linalg::solvers::Solve;
use faer::Side;
use nalgebra::DMatrix;

use super::{from_faer, to_faer, KktDecomp, LinAlgError, LinAlgResult};

/// Solve `k · x = rhs` with the configured factorization.
///
/// `rhs` may have any number of columns; the solution has the same shape.
pub fn solve_kkt(
    k: &DMatrix<f64>,
    rhs: &DMatrix<f64>,
    decomp: KktDecomp,
) -> LinAlgResult<DMatrix<f64>> {
    let k_f = to_faer(k);
    let rhs_f = to_faer(rhs);

    let sol_f = match decomp {
        KktDecomp::Lu => k_f.as_ref().partial_piv_lu().solve(rhs_f.as_ref()),
        KktDecomp::Qr => k_f.as_ref().qr().solve(rhs_f.as_ref()),
        KktDecomp::Ldlt => k_f.as_ref().lblt(Side::Lower).solve(rhs_f.as_ref()),
    };

    let sol = from_faer(sol_f.as_ref());
    if sol.iter().any(|v| !v.is_finite()) {
        return Err(LinAlgError::NonFiniteSolution);
    }
    Ok(sol)
}
