//! Backward pass: Riccati recursion with constraint-to-go handling.
//!
//! The recursion runs from the final node to node 0. At each stage the
//! constraint handler first decides which of the accumulated equality rows
//! the stage input can satisfy; those enter the stage KKT system, the rest
//! bubble backwards through the dynamics. The KKT solution gives the affine
//! policy `δu = l + L·δx` together with the multipliers of the absorbed
//! rows, and the quadratic cost-to-go model is updated.
//!
//! A non-finite KKT solution means the (regularized) Hessian was not
//! positive definite on the constraint nullspace. The driver catches it,
//! raises the regularization shift and restarts the entire sweep from the
//! final node, so that one retry counter governs the conditioning of every
//! stage.

use nalgebra::{DMatrix, DVector, RowDVector};
use tracing::{debug, warn};

use super::{IterativeLqr, SolveError, DEPENDENT_ROW_TOL};
use crate::error::SolverError;
use crate::linalg::{rank_revealing_split, solve_kkt};

/// Constraint rows the current stage can absorb, with `d` of full row rank.
struct FeasibleBlock {
    c: DMatrix<f64>,
    d: DMatrix<f64>,
    h: DVector<f64>,
}

impl IterativeLqr {
    /// Run the backward recursion, retrying under increased regularization
    /// when a stage Hessian turns out indefinite.
    pub(super) fn backward_pass(&mut self) -> Result<(), SolverError> {
        let mut retries = 0;
        loop {
            self.profile.backward_passes += 1;
            match self.backward_pass_once() {
                Ok(()) => return Ok(()),
                Err(SolveError::HessianIndefinite { stage }) => {
                    retries += 1;
                    self.profile.reg_retries += 1;
                    if retries > self.config.max_reg_retries {
                        return Err(SolveError::RegularizationExhausted { retries }.log().into());
                    }
                    self.increase_regularization();
                    debug!(
                        "stage {stage}: indefinite Hessian, retrying with hxx_reg = {:.3e}",
                        self.hxx_reg
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn backward_pass_once(&mut self) -> Result<(), SolveError> {
        let n = self.n;

        // seed the recursion with the final cost..
        {
            let vf = &mut self.value[n];
            let cd = &self.cost_data[n];
            vf.s_mat.copy_from(&cd.qxx);
            for j in 0..self.nx {
                vf.s_mat[(j, j)] += self.hxx_reg;
            }
            vf.s_vec.copy_from(&cd.qx);
        }

        // ..and the constraint-to-go with the final constraint and bounds.
        // The final constraint is state-only: its input block is dropped.
        self.ctg.clear();
        if let Some(cd) = &self.con_data[n] {
            self.ctg.add_block(&cd.c, None, &cd.h)?;
        }
        self.add_bound_rows(n)?;

        for i in (0..n).rev() {
            self.backward_pass_stage(i)?;
        }

        self.optimize_initial_state()
    }

    fn backward_pass_stage(&mut self, i: usize) -> Result<(), SolveError> {
        let feas = self.handle_constraints(i)?;
        let nc = feas.h.len();
        let (nx, nu) = (self.nx, self.nu);

        let (value_head, value_tail) = self.value.split_at_mut(i + 1);
        let value = &mut value_head[i];
        let value_next = &value_tail[0];
        let ws = &mut self.ws[i];
        let dd = &self.dyn_data[i];
        let cd = &self.cost_data[i];

        // next node's value function as seen through the dynamics
        ws.s_plus_s_d.copy_from(&value_next.s_vec);
        ws.s_plus_s_d.gemv(1.0, &value_next.s_mat, &dd.d, 1.0);
        ws.s_a.gemm(1.0, &value_next.s_mat, &dd.a, 0.0);
        ws.s_b.gemm(1.0, &value_next.s_mat, &dd.b, 0.0);

        ws.hx.copy_from(&cd.qx);
        ws.hx.gemv_tr(1.0, &dd.a, &ws.s_plus_s_d, 1.0);
        ws.hxx.copy_from(&cd.qxx);
        ws.hxx.gemm_tr(1.0, &dd.a, &ws.s_a, 1.0);
        for j in 0..nx {
            ws.hxx[(j, j)] += self.hxx_reg;
        }

        ws.hu.copy_from(&cd.ru);
        ws.hu.gemv_tr(1.0, &dd.b, &ws.s_plus_s_d, 1.0);
        ws.huu.copy_from(&cd.ruu);
        ws.huu.gemm_tr(1.0, &dd.b, &ws.s_b, 1.0);
        for j in 0..nu {
            ws.huu[(j, j)] += self.config.huu_reg;
        }
        ws.hux.copy_from(&cd.pux);
        ws.hux.gemm_tr(1.0, &dd.b, &ws.s_a, 1.0);

        // stage KKT system, solved against the feedback and feedforward
        // columns at once
        let n_tot = nu + nc;
        let mut kkt = DMatrix::zeros(n_tot, n_tot);
        kkt.view_mut((0, 0), (nu, nu)).copy_from(&ws.huu);
        if nc > 0 {
            kkt.view_mut((0, nu), (nu, nc)).copy_from(&feas.d.transpose());
            kkt.view_mut((nu, 0), (nc, nu)).copy_from(&feas.d);
            for j in 0..nc {
                kkt[(nu + j, nu + j)] -= self.config.kkt_reg;
            }
        }

        let mut rhs = DMatrix::zeros(n_tot, nx + 1);
        rhs.view_mut((0, 0), (nu, nx)).copy_from(&(-&ws.hux));
        rhs.view_mut((0, nx), (nu, 1)).copy_from(&(-&ws.hu));
        if nc > 0 {
            rhs.view_mut((nu, 0), (nc, nx)).copy_from(&(-&feas.c));
            rhs.view_mut((nu, nx), (nc, 1)).copy_from(&(-&feas.h));
        }

        let sol = solve_kkt(&kkt, &rhs, self.config.kkt_decomp)
            .map_err(|_| SolveError::HessianIndefinite { stage: i })?;

        let res = &mut self.bp_res[i];
        res.l_fb.copy_from(&sol.view((0, 0), (nu, nx)));
        res.l_ff.copy_from(&sol.view((0, nx), (nu, 1)));
        for j in 0..nc {
            res.lam[j] = sol[(nu + j, nx)];
        }
        res.nc_feas = nc;

        // cost-to-go under the optimal affine policy
        ws.tmp_ux.copy_from(&ws.hux);
        ws.tmp_ux.gemm(1.0, &ws.huu, &res.l_fb, 1.0);
        value.s_mat.copy_from(&ws.hxx);
        value.s_mat.gemm_tr(1.0, &res.l_fb, &ws.tmp_ux, 1.0);
        value.s_mat.gemm_tr(1.0, &ws.hux, &res.l_fb, 1.0);
        let s_t = value.s_mat.transpose();
        value.s_mat += s_t;
        value.s_mat *= 0.5;

        ws.tmp_u.copy_from(&ws.hu);
        ws.tmp_u.gemv(1.0, &ws.huu, &res.l_ff, 1.0);
        value.s_vec.copy_from(&ws.hx);
        value.s_vec.gemv_tr(1.0, &ws.hux, &res.l_ff, 1.0);
        value.s_vec.gemv_tr(1.0, &res.l_fb, &ws.tmp_u, 1.0);

        let finite = value.s_mat.iter().all(|v| v.is_finite())
            && value.s_vec.iter().all(|v| v.is_finite());
        if !finite {
            return Err(SolveError::HessianIndefinite { stage: i });
        }

        Ok(())
    }

    /// Split the accumulated constraints into the block the stage input can
    /// satisfy and the remainder bubbling to stage `i − 1`.
    fn handle_constraints(&mut self, i: usize) -> Result<FeasibleBlock, SolveError> {
        {
            let dd = &self.dyn_data[i];
            self.ctg.propagate(&dd.a, &dd.b, &dd.d);
        }
        if let Some(cd) = &self.con_data[i] {
            self.ctg.add_block(&cd.c, Some(&cd.d), &cd.h)?;
        }
        self.add_bound_rows(i)?;

        let nc = self.ctg.dim();
        self.bp_res[i].nc = nc;
        self.bp_res[i].nc_feas = 0;

        if nc == 0 {
            return Ok(FeasibleBlock {
                c: DMatrix::zeros(0, self.nx),
                d: DMatrix::zeros(0, self.nu),
                h: DVector::zeros(0),
            });
        }

        let d_block = self.ctg.d().clone_owned();
        let split = rank_revealing_split(
            &d_block,
            self.config.constr_decomp,
            self.config.rank_threshold,
        )?;
        let rank = split.rank;

        let q1 = split.q.columns(0, rank);
        let q2 = split.q.columns(rank, nc - rank);

        let feas = FeasibleBlock {
            c: q1.transpose() * self.ctg.c(),
            d: q1.transpose() * self.ctg.d(),
            h: q1.transpose() * self.ctg.h(),
        };

        let c_inf: DMatrix<f64> = q2.transpose() * self.ctg.c();
        let h_inf: DVector<f64> = q2.transpose() * self.ctg.h();

        self.ctg.clear();
        for j in 0..(nc - rank) {
            // a row of the form 0·δx = 0 is linearly dependent
            if h_inf[j].abs() < DEPENDENT_ROW_TOL && c_inf.row(j).amax() < DEPENDENT_ROW_TOL {
                warn!("stage {i}: removing linearly dependent constraint row");
                self.profile.dropped_dependent_rows += 1;
                continue;
            }
            let row = c_inf.row(j).clone_owned();
            self.ctg.add_row(&row, None, h_inf[j])?;
        }

        Ok(feas)
    }

    /// Lift equality rows of the box bounds (`lb == ub`) into the
    /// constraint-to-go at node `k`.
    fn add_bound_rows(&mut self, k: usize) -> Result<(), SolveError> {
        // a fixed initial state is handled by the initial-state step instead
        if !(k == 0 && self.bounds.fixed_initial_state()) {
            for i in 0..self.nx {
                if let Some(v) = self.bounds.state_equality(i, k) {
                    let mut c = RowDVector::zeros(self.nx);
                    c[i] = 1.0;
                    self.ctg.add_row(&c, None, self.xtrj[(i, k)] - v)?;
                    debug!("stage {k}: lifting state equality bound on component {i}");
                }
            }
        }

        if k < self.n {
            for i in 0..self.nu {
                if let Some(v) = self.bounds.input_equality(i, k) {
                    let c = RowDVector::zeros(self.nx);
                    let mut d = RowDVector::zeros(self.nu);
                    d[i] = 1.0;
                    self.ctg.add_row(&c, Some(&d), self.utrj[(i, k)] - v)?;
                    debug!("stage {k}: lifting input equality bound on component {i}");
                }
            }
        }
        Ok(())
    }

    /// Spend whatever freedom the initial state has on the rows that
    /// reached stage 0, then scan for leftovers.
    fn optimize_initial_state(&mut self) -> Result<(), SolveError> {
        let nx = self.nx;
        let m = self.ctg.dim();

        if self.bounds.fixed_initial_state() {
            self.dx0.copy_from(&self.bounds.x_lb.column(0));
            self.dx0 -= self.xtrj.column(0);
        } else {
            let n_tot = nx + m;
            let mut kkt = DMatrix::zeros(n_tot, n_tot);
            kkt.view_mut((0, 0), (nx, nx))
                .copy_from(&self.value[0].s_mat);
            if m > 0 {
                kkt.view_mut((0, nx), (nx, m))
                    .copy_from(&self.ctg.c().transpose());
                kkt.view_mut((nx, 0), (m, nx)).copy_from(&self.ctg.c());
            }
            let mut rhs = DMatrix::zeros(n_tot, 1);
            rhs.view_mut((0, 0), (nx, 1))
                .copy_from(&(-&self.value[0].s_vec));
            if m > 0 {
                rhs.view_mut((nx, 0), (m, 1))
                    .copy_from(&(-self.ctg.h().clone_owned()));
            }

            let sol = solve_kkt(&kkt, &rhs, self.config.kkt_decomp)
                .map_err(|_| SolveError::HessianIndefinite { stage: 0 })?;
            for j in 0..nx {
                self.dx0[j] = sol[(j, 0)];
            }
        }

        // rows the initial state still violates stay in the accumulator and
        // surface as a (non-fatal) infeasibility diagnostic
        if m > 0 {
            let c = self.ctg.c().clone_owned();
            let h = self.ctg.h().clone_owned();
            let residual = &c * &self.dx0 + &h;

            self.ctg.clear();
            let mut worst = 0.0_f64;
            for j in 0..m {
                if residual[j].abs() < self.config.constraint_violation_threshold {
                    continue;
                }
                worst = worst.max(residual[j].abs());
                let row = c.row(j).clone_owned();
                self.ctg.add_row(&row, None, h[j])?;
            }

            if self.ctg.dim() > 0 {
                warn!(
                    "{} constraints not satisfied at the initial node, residual inf-norm {:.3e}",
                    self.ctg.dim(),
                    worst
                );
                self.profile.infeasibility_warnings += 1;
                if worst > self.profile.max_infeasibility_residual {
                    self.profile.max_infeasibility_residual = worst;
                }
            }
        }

        Ok(())
    }

    fn increase_regularization(&mut self) {
        if self.hxx_reg < 1e-6 {
            self.hxx_reg = 1.0;
        }
        self.hxx_reg *= self.config.hxx_reg_growth;
        if self.hxx_reg < self.config.hxx_reg_base {
            self.hxx_reg = self.config.hxx_reg_base;
        }
    }

    /// Geometric cool-down after a successful pass, floored at the base.
    pub(super) fn reduce_regularization(&mut self) {
        self.hxx_reg /= self.config.hxx_reg_growth.powf(1.0 / 3.0);
        if self.hxx_reg < self.config.hxx_reg_base {
            self.hxx_reg = self.config.hxx_reg_base;
        }
    }
}
