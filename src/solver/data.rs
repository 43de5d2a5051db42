//! Per-stage storage for the solver.
//!
//! Everything here is pre-sized at construction from `(nx, nu, N)` and
//! reused every iteration; only the constraint-to-go accumulator has a
//! moving row count, and its capacity is fixed.

use nalgebra::{DMatrix, DMatrixView, DVector, DVectorView, RowDVector};

use super::SolveError;

/// Linearized dynamics at one stage: `δx⁺ = A·δx + B·δu + d`.
#[derive(Debug, Clone)]
pub(crate) struct DynamicsData {
    pub a: DMatrix<f64>,
    pub b: DMatrix<f64>,
    /// Defect `d = f(x, u) − x_next`; zero iff the trajectory is a closed rollout
    pub d: DVector<f64>,
}

impl DynamicsData {
    pub fn new(nx: usize, nu: usize) -> Self {
        Self {
            a: DMatrix::zeros(nx, nx),
            b: DMatrix::zeros(nx, nu),
            d: DVector::zeros(nx),
        }
    }
}

/// Quadratized cost at one stage.
///
/// The final stage uses only `qxx` and `qx`; the input blocks stay zero.
#[derive(Debug, Clone)]
pub(crate) struct CostData {
    pub qxx: DMatrix<f64>,
    pub ruu: DMatrix<f64>,
    pub pux: DMatrix<f64>,
    pub qx: DVector<f64>,
    pub ru: DVector<f64>,
}

impl CostData {
    pub fn new(nx: usize, nu: usize) -> Self {
        Self {
            qxx: DMatrix::zeros(nx, nx),
            ruu: DMatrix::zeros(nu, nu),
            pux: DMatrix::zeros(nu, nx),
            qx: DVector::zeros(nx),
            ru: DVector::zeros(nu),
        }
    }
}

/// Linearized stage constraint `C·δx + D·δu + h = 0`.
#[derive(Debug, Clone)]
pub(crate) struct ConstraintData {
    pub c: DMatrix<f64>,
    pub d: DMatrix<f64>,
    pub h: DVector<f64>,
}

impl ConstraintData {
    pub fn new(dim: usize, nx: usize, nu: usize) -> Self {
        Self {
            c: DMatrix::zeros(dim, nx),
            d: DMatrix::zeros(dim, nu),
            h: DVector::zeros(dim),
        }
    }
}

/// Quadratic cost-to-go model `½δxᵀSδx + sᵀδx`.
#[derive(Debug, Clone)]
pub(crate) struct ValueFunction {
    pub s_mat: DMatrix<f64>,
    pub s_vec: DVector<f64>,
}

impl ValueFunction {
    pub fn new(nx: usize) -> Self {
        Self {
            s_mat: DMatrix::zeros(nx, nx),
            s_vec: DVector::zeros(nx),
        }
    }
}

/// Affine policy and multipliers produced by the backward pass at one stage:
/// `δu = l + L·δx`.
#[derive(Debug, Clone)]
pub(crate) struct BackwardPassResult {
    pub l_fb: DMatrix<f64>,
    pub l_ff: DVector<f64>,
    /// Multipliers of the feasible constraint rows; first `nc_feas` entries live
    pub lam: DVector<f64>,
    /// Constraint rows seen at this stage (after propagation and lifting)
    pub nc: usize,
    /// Rows absorbed here; the remaining `nc − nc_feas` bubbled backwards
    pub nc_feas: usize,
}

impl BackwardPassResult {
    pub fn new(nx: usize, nu: usize, capacity: usize) -> Self {
        Self {
            l_fb: DMatrix::zeros(nu, nx),
            l_ff: DVector::zeros(nu),
            lam: DVector::zeros(capacity),
            nc: 0,
            nc_feas: 0,
        }
    }
}

/// Equality rows that could not be absorbed at a later stage and bubble
/// backwards through the dynamics.
///
/// Owned exclusively by the solver: reset at the start of every backward
/// pass, mutated only inside it. Capacity is fixed at construction;
/// overflowing it is an error rather than a reallocation.
#[derive(Debug, Clone)]
pub(crate) struct ConstraintToGo {
    c: DMatrix<f64>,
    d: DMatrix<f64>,
    h: DVector<f64>,
    scratch: DMatrix<f64>,
    dim: usize,
    capacity: usize,
}

impl ConstraintToGo {
    pub fn new(nx: usize, nu: usize, capacity: usize) -> Self {
        Self {
            c: DMatrix::zeros(capacity, nx),
            d: DMatrix::zeros(capacity, nu),
            h: DVector::zeros(capacity),
            scratch: DMatrix::zeros(capacity, nx),
            dim: 0,
            capacity,
        }
    }

    pub fn clear(&mut self) {
        self.dim = 0;
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn c(&self) -> DMatrixView<'_, f64> {
        self.c.rows(0, self.dim)
    }

    pub fn d(&self) -> DMatrixView<'_, f64> {
        self.d.rows(0, self.dim)
    }

    pub fn h(&self) -> DVectorView<'_, f64> {
        self.h.rows(0, self.dim)
    }

    fn reserve(&mut self, rows: usize) -> Result<usize, SolveError> {
        if self.dim + rows > self.capacity {
            return Err(SolveError::ConstraintBufferFull {
                capacity: self.capacity,
            });
        }
        let at = self.dim;
        self.dim += rows;
        Ok(at)
    }

    /// Append a constraint block; a missing `d` stands for a zero input Jacobian.
    pub fn add_block(
        &mut self,
        c: &DMatrix<f64>,
        d: Option<&DMatrix<f64>>,
        h: &DVector<f64>,
    ) -> Result<(), SolveError> {
        let rows = h.len();
        if rows == 0 {
            return Ok(());
        }
        let at = self.reserve(rows)?;
        self.c.rows_mut(at, rows).copy_from(c);
        match d {
            Some(d) => self.d.rows_mut(at, rows).copy_from(d),
            None => self.d.rows_mut(at, rows).fill(0.0),
        }
        self.h.rows_mut(at, rows).copy_from(h);
        Ok(())
    }

    /// Append a single row.
    pub fn add_row(
        &mut self,
        c: &RowDVector<f64>,
        d: Option<&RowDVector<f64>>,
        h: f64,
    ) -> Result<(), SolveError> {
        let at = self.reserve(1)?;
        self.c.row_mut(at).copy_from(c);
        match d {
            Some(d) => self.d.row_mut(at).copy_from(d),
            None => self.d.row_mut(at).fill(0.0),
        }
        self.h[at] = h;
        Ok(())
    }

    /// Reinterpret the accumulated rows, currently constraining `δx_{i+1}`,
    /// as rows on `(δx_i, δu_i)` through the linearized dynamics:
    /// `C ← C·A`, `D ← C·B`, `h ← h − C·d`.
    pub fn propagate(&mut self, a: &DMatrix<f64>, b: &DMatrix<f64>, defect: &DVector<f64>) {
        let m = self.dim;
        if m == 0 {
            return;
        }
        self.scratch.rows_mut(0, m).copy_from(&self.c.rows(0, m));
        self.h
            .rows_mut(0, m)
            .gemv(-1.0, &self.scratch.rows(0, m), defect, 1.0);
        self.d
            .rows_mut(0, m)
            .gemm(1.0, &self.scratch.rows(0, m), b, 0.0);
        self.c
            .rows_mut(0, m)
            .gemm(1.0, &self.scratch.rows(0, m), a, 0.0);
    }
}

/// Candidate trajectory and its merit-relevant statistics.
#[derive(Debug, Clone)]
pub(crate) struct ForwardPassResult {
    pub xtrj: DMatrix<f64>,
    pub utrj: DMatrix<f64>,
    pub alpha: f64,
    pub cost: f64,
    pub defect_norm: f64,
    pub constraint_violation: f64,
    pub bound_violation: f64,
    pub step_length: f64,
    pub merit: f64,
    pub merit_der: f64,
    pub mu_f: f64,
    pub mu_c: f64,
    pub mu_b: f64,
    pub accepted: bool,
}

impl ForwardPassResult {
    pub fn new(nx: usize, nu: usize, n: usize) -> Self {
        Self {
            xtrj: DMatrix::zeros(nx, n + 1),
            utrj: DMatrix::zeros(nu, n),
            alpha: 0.0,
            cost: 0.0,
            defect_norm: 0.0,
            constraint_violation: 0.0,
            bound_violation: 0.0,
            step_length: 0.0,
            merit: 0.0,
            merit_der: 0.0,
            mu_f: 0.0,
            mu_c: 0.0,
            mu_b: 0.0,
            accepted: false,
        }
    }
}

/// Per-stage box bounds on states and inputs.
///
/// Entries default to ±∞ (inactive). Rows with `lb == ub` (finite) are
/// equalities and get lifted into hard stage constraints; rows with
/// `lb < ub` are handled by the augmented-Lagrangian outer loop.
#[derive(Debug, Clone)]
pub(crate) struct BoxBounds {
    pub x_lb: DMatrix<f64>,
    pub x_ub: DMatrix<f64>,
    pub u_lb: DMatrix<f64>,
    pub u_ub: DMatrix<f64>,
}

impl BoxBounds {
    pub fn new(nx: usize, nu: usize, n: usize) -> Self {
        Self {
            x_lb: DMatrix::from_element(nx, n + 1, f64::NEG_INFINITY),
            x_ub: DMatrix::from_element(nx, n + 1, f64::INFINITY),
            u_lb: DMatrix::from_element(nu, n, f64::NEG_INFINITY),
            u_ub: DMatrix::from_element(nu, n, f64::INFINITY),
        }
    }

    /// All components of the initial state pinned by an equality bound.
    pub fn fixed_initial_state(&self) -> bool {
        (0..self.x_lb.nrows()).all(|i| {
            let lb = self.x_lb[(i, 0)];
            lb.is_finite() && lb == self.x_ub[(i, 0)]
        })
    }

    pub fn state_equality(&self, i: usize, k: usize) -> Option<f64> {
        let lb = self.x_lb[(i, k)];
        (lb.is_finite() && lb == self.x_ub[(i, k)]).then_some(lb)
    }

    pub fn input_equality(&self, i: usize, k: usize) -> Option<f64> {
        let lb = self.u_lb[(i, k)];
        (lb.is_finite() && lb == self.u_ub[(i, k)]).then_some(lb)
    }

    /// Upper bound of a strict-inequality state row, if active.
    pub fn state_upper(&self, i: usize, k: usize) -> Option<f64> {
        let ub = self.x_ub[(i, k)];
        (ub.is_finite() && self.x_lb[(i, k)] < ub).then_some(ub)
    }

    pub fn state_lower(&self, i: usize, k: usize) -> Option<f64> {
        let lb = self.x_lb[(i, k)];
        (lb.is_finite() && lb < self.x_ub[(i, k)]).then_some(lb)
    }

    pub fn input_upper(&self, i: usize, k: usize) -> Option<f64> {
        let ub = self.u_ub[(i, k)];
        (ub.is_finite() && self.u_lb[(i, k)] < ub).then_some(ub)
    }

    pub fn input_lower(&self, i: usize, k: usize) -> Option<f64> {
        let lb = self.u_lb[(i, k)];
        (lb.is_finite() && lb < self.u_ub[(i, k)]).then_some(lb)
    }
}

/// Scratch space for one stage of the backward/forward sweeps.
#[derive(Debug, Clone)]
pub(crate) struct StageWorkspace {
    pub s_plus_s_d: DVector<f64>,
    pub s_a: DMatrix<f64>,
    pub s_b: DMatrix<f64>,
    pub hx: DVector<f64>,
    pub hxx: DMatrix<f64>,
    pub hu: DVector<f64>,
    pub huu: DMatrix<f64>,
    pub hux: DMatrix<f64>,
    pub tmp_ux: DMatrix<f64>,
    pub tmp_u: DVector<f64>,
    pub dx: DVector<f64>,
}

impl StageWorkspace {
    pub fn new(nx: usize, nu: usize) -> Self {
        Self {
            s_plus_s_d: DVector::zeros(nx),
            s_a: DMatrix::zeros(nx, nx),
            s_b: DMatrix::zeros(nx, nu),
            hx: DVector::zeros(nx),
            hxx: DMatrix::zeros(nx, nx),
            hu: DVector::zeros(nu),
            huu: DMatrix::zeros(nu, nu),
            hux: DMatrix::zeros(nu, nx),
            tmp_ux: DMatrix::zeros(nu, nx),
            tmp_u: DVector::zeros(nu),
            dx: DVector::zeros(nx),
        }
    }
}
