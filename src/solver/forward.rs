//! Forward pass, merit function and line search.
//!
//! The forward pass rolls the closed-loop policy at step length α:
//!
//! ```text
//! ûᵢ   = uᵢ + α·lᵢ + Lᵢ·δxᵢ
//! x̂ᵢ₊₁ = xᵢ₊₁ + (Aᵢ + Bᵢ·Lᵢ)·δxᵢ + Bᵢ·α·lᵢ + α·dᵢ
//! ```
//!
//! The α multiplying the defect implements the multiple-shooting closure:
//! gaps between shooting nodes are closed linearly in proportion to the
//! step length instead of all at once.
//!
//! Candidate steps are scored by an ℓ₁ merit function
//! `m(α) = J + μ_f·‖D‖₁ + μ_c·‖G‖₁ + μ_b·bound_violation` whose weights
//! are refreshed from multiplier estimates before each search (safety
//! factor 2, assuming δx = 0). The directional derivative follows the
//! construction of Nocedal & Wright, Theorem 18.2. Backtracking starts at
//! α = 1 and shrinks by half down to α = 10⁻³; if Armijo never fires the
//! last candidate is soft-accepted and the non-acceptance recorded.

use nalgebra::DMatrix;
use tracing::debug;

use super::{
    IterationStats, IterativeLqr, ALPHA_MIN, ARMIJO_ETA, MERIT_SAFETY_FACTOR, STEP_SHRINK,
};
use crate::error::SolverError;

impl IterativeLqr {
    /// Roll the closed-loop policy at step length `alpha` into the
    /// candidate buffers and evaluate its statistics.
    pub(super) fn forward_pass(&mut self, alpha: f64) {
        self.profile.forward_passes += 1;
        let n = self.n;

        {
            let mut x0 = self.fp_res.xtrj.column_mut(0);
            x0.copy_from(&self.xtrj.column(0));
            x0.axpy(alpha, &self.dx0, 1.0);
        }

        let mut step_length = 0.0;
        {
            let Self {
                ref mut fp_res,
                ref xtrj,
                ref utrj,
                ref dyn_data,
                ref bp_res,
                ref mut ws,
                ..
            } = *self;

            for i in 0..n {
                let dd = &dyn_data[i];
                let res = &bp_res[i];
                let w = &mut ws[i];

                w.dx.copy_from(&fp_res.xtrj.column(i));
                w.dx -= xtrj.column(i);

                {
                    let mut u_col = fp_res.utrj.column_mut(i);
                    u_col.copy_from(&utrj.column(i));
                    u_col.axpy(alpha, &res.l_ff, 1.0);
                    u_col.gemv(1.0, &res.l_fb, &w.dx, 1.0);
                }

                w.tmp_u.copy_from(&fp_res.utrj.column(i));
                w.tmp_u -= utrj.column(i);

                {
                    let mut x_col = fp_res.xtrj.column_mut(i + 1);
                    x_col.copy_from(&xtrj.column(i + 1));
                    x_col.gemv(1.0, &dd.a, &w.dx, 1.0);
                    x_col.gemv(1.0, &dd.b, &w.tmp_u, 1.0);
                    x_col.axpy(alpha, &dd.d, 1.0);
                }

                step_length += alpha.abs() * res.l_ff.iter().map(|v| v.abs()).sum::<f64>();
            }
        }

        self.fp_res.alpha = alpha;
        self.fp_res.step_length = step_length;

        let cost = self.compute_cost(&self.fp_res.xtrj, &self.fp_res.utrj);
        let defect = self.compute_defect_norm(&self.fp_res.xtrj, &self.fp_res.utrj);
        let constr = self.compute_constraint_violation(&self.fp_res.xtrj, &self.fp_res.utrj);
        let bound = self.compute_bound_violation(&self.fp_res.xtrj, &self.fp_res.utrj);
        self.fp_res.cost = cost;
        self.fp_res.defect_norm = defect;
        self.fp_res.constraint_violation = constr;
        self.fp_res.bound_violation = bound;
    }

    /// Total cost of a trajectory pair, normalized by the horizon length.
    /// Includes the augmented-Lagrangian penalty when active.
    pub(super) fn compute_cost(&self, xtrj: &DMatrix<f64>, utrj: &DMatrix<f64>) -> f64 {
        let mut cost = 0.0;
        for i in 0..self.n {
            let x = xtrj.column(i).clone_owned();
            let u = utrj.column(i).clone_owned();
            cost += self.cost[i].eval(&x, &u);
            if self.config.enable_auglag {
                cost += self.penalty.stage_cost(i, &x, Some(&u), &self.bounds);
            }
        }

        let x = xtrj.column(self.n).clone_owned();
        let u = utrj.column(self.n - 1).clone_owned();
        cost += self.cost[self.n].eval(&x, &u);
        if self.config.enable_auglag {
            cost += self.penalty.stage_cost(self.n, &x, None, &self.bounds);
        }

        cost / self.n as f64
    }

    /// Dynamics gap 1-norm of a trajectory pair, normalized by the horizon.
    pub(super) fn compute_defect_norm(&self, xtrj: &DMatrix<f64>, utrj: &DMatrix<f64>) -> f64 {
        let mut defect = 0.0;
        for i in 0..self.n {
            let x = xtrj.column(i).clone_owned();
            let u = utrj.column(i).clone_owned();
            let f = self.dynamics.eval(&x, &u);
            defect += (f - xtrj.column(i + 1))
                .iter()
                .map(|v| v.abs())
                .sum::<f64>();
        }
        defect / self.n as f64
    }

    /// Equality-constraint violation 1-norm, normalized by the horizon.
    pub(super) fn compute_constraint_violation(
        &self,
        xtrj: &DMatrix<f64>,
        utrj: &DMatrix<f64>,
    ) -> f64 {
        let mut violation = 0.0;
        for i in 0..self.n {
            if let Some(model) = &self.constraint[i] {
                let x = xtrj.column(i).clone_owned();
                let u = utrj.column(i).clone_owned();
                violation += model.eval(&x, &u).iter().map(|v| v.abs()).sum::<f64>();
            }
        }
        if let Some(model) = &self.constraint[self.n] {
            let x = xtrj.column(self.n).clone_owned();
            let u = utrj.column(self.n - 1).clone_owned();
            violation += model.eval(&x, &u).iter().map(|v| v.abs()).sum::<f64>();
        }
        violation / self.n as f64
    }

    /// Box-bound violation 1-norm over the strict-inequality rows,
    /// normalized by the horizon.
    pub(super) fn compute_bound_violation(
        &self,
        xtrj: &DMatrix<f64>,
        utrj: &DMatrix<f64>,
    ) -> f64 {
        let mut violation = 0.0;
        for k in 0..=self.n {
            for i in 0..self.nx {
                if let Some(ub) = self.bounds.state_upper(i, k) {
                    violation += (xtrj[(i, k)] - ub).max(0.0);
                }
                if let Some(lb) = self.bounds.state_lower(i, k) {
                    violation += (lb - xtrj[(i, k)]).max(0.0);
                }
            }
        }
        for k in 0..self.n {
            for i in 0..self.nu {
                if let Some(ub) = self.bounds.input_upper(i, k) {
                    violation += (utrj[(i, k)] - ub).max(0.0);
                }
                if let Some(lb) = self.bounds.input_lower(i, k) {
                    violation += (lb - utrj[(i, k)]).max(0.0);
                }
            }
        }
        violation / self.n as f64
    }

    /// Merit weights from multiplier estimates at δx = 0: the co-state is
    /// read off the value gradient, the constraint multiplier off the stage
    /// KKT solution.
    fn compute_merit_weights(&self) -> (f64, f64) {
        let mut lam_x_max = 0.0_f64;
        for k in 0..self.n {
            lam_x_max = lam_x_max.max(self.value[k].s_vec.amax());
        }

        let mut lam_g_max = 0.0_f64;
        for res in &self.bp_res {
            if res.nc_feas > 0 {
                lam_g_max = lam_g_max.max(res.lam.rows(0, res.nc_feas).amax());
            }
        }

        (
            MERIT_SAFETY_FACTOR * lam_x_max,
            MERIT_SAFETY_FACTOR * lam_g_max,
        )
    }

    /// Directional derivative of the merit along the computed step
    /// (Nocedal & Wright, Theorem 18.2).
    fn compute_merit_slope(&self, mu_f: f64, mu_c: f64, defect: f64, constr: f64) -> f64 {
        let mut der = 0.0;
        for i in 0..self.n {
            der += self.bp_res[i].l_ff.dot(&self.ws[i].hu);
        }
        der - mu_f * defect - mu_c * constr
    }

    /// Backtracking line search over forward passes. Returns `Ok(false)`
    /// when the iteration callback requests termination.
    pub(super) fn line_search(&mut self, iter: usize) -> Result<bool, SolverError> {
        // merit baseline on the current trajectories
        let cost0 = self.compute_cost(&self.xtrj, &self.utrj);
        let defect0 = self.compute_defect_norm(&self.xtrj, &self.utrj);
        let constr0 = self.compute_constraint_violation(&self.xtrj, &self.utrj);
        let bound0 = self.compute_bound_violation(&self.xtrj, &self.utrj);

        let (mu_f, mu_c) = self.compute_merit_weights();
        let mu_b = self.penalty.multiplier_mass();
        let merit0 = cost0 + mu_f * defect0 + mu_c * constr0 + mu_b * bound0;
        let slope = self.compute_merit_slope(mu_f, mu_c, defect0, constr0);

        self.fp_res.mu_f = mu_f;
        self.fp_res.mu_c = mu_c;
        self.fp_res.mu_b = mu_b;
        self.fp_res.merit_der = slope;

        if iter == 0 {
            // report the starting point before any step is taken
            self.fp_res.xtrj.copy_from(&self.xtrj);
            self.fp_res.utrj.copy_from(&self.utrj);
            self.fp_res.alpha = 0.0;
            self.fp_res.step_length = 0.0;
            self.fp_res.cost = cost0;
            self.fp_res.defect_norm = defect0;
            self.fp_res.constraint_violation = constr0;
            self.fp_res.bound_violation = bound0;
            self.fp_res.merit = merit0;
            self.fp_res.accepted = true;
            if !self.report() {
                return Ok(false);
            }
        }

        let mut alpha = 1.0;
        let mut accepted = false;
        while alpha >= ALPHA_MIN {
            self.forward_pass(alpha);

            let fp = &mut self.fp_res;
            fp.merit = fp.cost
                + mu_f * fp.defect_norm
                + mu_c * fp.constraint_violation
                + mu_b * fp.bound_violation;
            fp.merit_der = slope;
            accepted = fp.merit <= merit0 + ARMIJO_ETA * alpha * slope;
            fp.accepted = accepted;

            if !self.report() {
                self.accept_candidate(iter);
                return Ok(false);
            }
            if accepted {
                break;
            }
            alpha *= STEP_SHRINK;
        }

        if !accepted {
            // Armijo never fired above α_min: soft-accept the last candidate
            debug!(
                "line search exhausted at alpha = {:.3e}, soft-accepting",
                self.fp_res.alpha
            );
            self.profile.soft_accepts += 1;
            self.fp_res.accepted = true;
            if !self.report() {
                self.accept_candidate(iter);
                return Ok(false);
            }
        }

        self.accept_candidate(iter);
        Ok(true)
    }

    /// Promote the candidate trajectories and record the iteration.
    fn accept_candidate(&mut self, iter: usize) {
        self.xtrj.copy_from(&self.fp_res.xtrj);
        self.utrj.copy_from(&self.fp_res.utrj);

        let fp = &self.fp_res;
        let stats = IterationStats {
            iteration: iter,
            alpha: fp.alpha,
            cost: fp.cost,
            defect_norm: fp.defect_norm,
            constraint_violation: fp.constraint_violation,
            bound_violation: fp.bound_violation,
            merit: fp.merit,
            merit_der: fp.merit_der,
            step_length: fp.step_length,
            accepted: fp.accepted,
        };
        if tracing::enabled!(tracing::Level::DEBUG) {
            stats.print_line();
        }
        self.profile.history.push(stats);
    }
}
