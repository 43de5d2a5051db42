//! Augmented-Lagrangian handling of strict inequality bounds.
//!
//! Equality rows of the box bounds become hard constraints in the backward
//! pass; the strict rows (`lb < ub`) are lifted into the stage cost with a
//! Powell-Hestenes-Rockafellar penalty, per bounded entry and side:
//!
//! ```text
//! ψ(g) = (max(0, λ + ρ·g)² − λ²) / (2ρ),    g = x − ub  or  lb − x
//! ```
//!
//! Its gradient is `max(0, λ + ρ·g)·∇g` and its Gauss-Newton curvature is
//! `ρ` on the active side. Once the inner loop flattens while bounds remain
//! violated, the outer update sets `λ ← max(0, λ + ρ·g)` and grows `ρ`; the
//! primal trajectory is kept.
//!
//! The total multiplier mass `Σ‖λ‖₁` doubles as the merit weight of the
//! bound-violation term, so the merit function starts caring about bounds
//! exactly when the outer loop does.

use nalgebra::{DMatrix, DVector};
use tracing::info;

use super::data::{BoxBounds, CostData};
use super::IterativeLqr;

/// PHR penalty value for one side of one bounded entry.
fn phr_value(lam: f64, rho: f64, g: f64) -> f64 {
    let t = lam + rho * g;
    if t > 0.0 {
        (t * t - lam * lam) / (2.0 * rho)
    } else {
        -lam * lam / (2.0 * rho)
    }
}

/// Multiplier and penalty state for the box bounds.
#[derive(Debug, Clone)]
pub(crate) struct BoundPenalty {
    rho: f64,
    lam_x_lo: DMatrix<f64>,
    lam_x_hi: DMatrix<f64>,
    lam_u_lo: DMatrix<f64>,
    lam_u_hi: DMatrix<f64>,
}

impl BoundPenalty {
    pub fn new(nx: usize, nu: usize, n: usize, rho: f64) -> Self {
        Self {
            rho,
            lam_x_lo: DMatrix::zeros(nx, n + 1),
            lam_x_hi: DMatrix::zeros(nx, n + 1),
            lam_u_lo: DMatrix::zeros(nu, n),
            lam_u_hi: DMatrix::zeros(nu, n),
        }
    }

    pub fn reset(&mut self, rho: f64) {
        self.rho = rho;
        self.lam_x_lo.fill(0.0);
        self.lam_x_hi.fill(0.0);
        self.lam_u_lo.fill(0.0);
        self.lam_u_hi.fill(0.0);
    }

    pub fn rho(&self) -> f64 {
        self.rho
    }

    pub fn grow(&mut self, factor: f64) {
        self.rho *= factor;
    }

    /// Penalty contribution of node `k`; `u` is absent at the final node.
    pub fn stage_cost(
        &self,
        k: usize,
        x: &DVector<f64>,
        u: Option<&DVector<f64>>,
        bounds: &BoxBounds,
    ) -> f64 {
        let mut cost = 0.0;
        for i in 0..x.len() {
            if let Some(ub) = bounds.state_upper(i, k) {
                cost += phr_value(self.lam_x_hi[(i, k)], self.rho, x[i] - ub);
            }
            if let Some(lb) = bounds.state_lower(i, k) {
                cost += phr_value(self.lam_x_lo[(i, k)], self.rho, lb - x[i]);
            }
        }
        if let Some(u) = u {
            for i in 0..u.len() {
                if let Some(ub) = bounds.input_upper(i, k) {
                    cost += phr_value(self.lam_u_hi[(i, k)], self.rho, u[i] - ub);
                }
                if let Some(lb) = bounds.input_lower(i, k) {
                    cost += phr_value(self.lam_u_lo[(i, k)], self.rho, lb - u[i]);
                }
            }
        }
        cost
    }

    /// Add the penalty gradient and Gauss-Newton curvature of node `k` to
    /// the quadratized stage cost.
    pub fn add_quadratization(
        &self,
        k: usize,
        x: &DVector<f64>,
        u: Option<&DVector<f64>>,
        bounds: &BoxBounds,
        cost: &mut CostData,
    ) {
        for i in 0..x.len() {
            if let Some(ub) = bounds.state_upper(i, k) {
                let t = self.lam_x_hi[(i, k)] + self.rho * (x[i] - ub);
                if t > 0.0 {
                    cost.qx[i] += t;
                    cost.qxx[(i, i)] += self.rho;
                }
            }
            if let Some(lb) = bounds.state_lower(i, k) {
                let t = self.lam_x_lo[(i, k)] + self.rho * (lb - x[i]);
                if t > 0.0 {
                    cost.qx[i] -= t;
                    cost.qxx[(i, i)] += self.rho;
                }
            }
        }
        let Some(u) = u else {
            return;
        };
        for i in 0..u.len() {
            if let Some(ub) = bounds.input_upper(i, k) {
                let t = self.lam_u_hi[(i, k)] + self.rho * (u[i] - ub);
                if t > 0.0 {
                    cost.ru[i] += t;
                    cost.ruu[(i, i)] += self.rho;
                }
            }
            if let Some(lb) = bounds.input_lower(i, k) {
                let t = self.lam_u_lo[(i, k)] + self.rho * (lb - u[i]);
                if t > 0.0 {
                    cost.ru[i] -= t;
                    cost.ruu[(i, i)] += self.rho;
                }
            }
        }
    }

    /// Outer multiplier update `λ ← max(0, λ + ρ·g)` along a trajectory.
    pub fn update(&mut self, xtrj: &DMatrix<f64>, utrj: &DMatrix<f64>, bounds: &BoxBounds) {
        let n = utrj.ncols();
        for k in 0..=n {
            for i in 0..xtrj.nrows() {
                if let Some(ub) = bounds.state_upper(i, k) {
                    let t = self.lam_x_hi[(i, k)] + self.rho * (xtrj[(i, k)] - ub);
                    self.lam_x_hi[(i, k)] = t.max(0.0);
                }
                if let Some(lb) = bounds.state_lower(i, k) {
                    let t = self.lam_x_lo[(i, k)] + self.rho * (lb - xtrj[(i, k)]);
                    self.lam_x_lo[(i, k)] = t.max(0.0);
                }
            }
        }
        for k in 0..n {
            for i in 0..utrj.nrows() {
                if let Some(ub) = bounds.input_upper(i, k) {
                    let t = self.lam_u_hi[(i, k)] + self.rho * (utrj[(i, k)] - ub);
                    self.lam_u_hi[(i, k)] = t.max(0.0);
                }
                if let Some(lb) = bounds.input_lower(i, k) {
                    let t = self.lam_u_lo[(i, k)] + self.rho * (lb - utrj[(i, k)]);
                    self.lam_u_lo[(i, k)] = t.max(0.0);
                }
            }
        }
    }

    /// Total multiplier 1-norm; the merit weight of the bound term.
    pub fn multiplier_mass(&self) -> f64 {
        let sum = |m: &DMatrix<f64>| m.iter().map(|v| v.abs()).sum::<f64>();
        sum(&self.lam_x_lo) + sum(&self.lam_x_hi) + sum(&self.lam_u_lo) + sum(&self.lam_u_hi)
    }
}

impl IterativeLqr {
    /// Run the outer multiplier/penalty update when the inner loop has
    /// flattened while bounds are still violated. Returns `true` when an
    /// update happened and the solve should continue.
    pub(super) fn auglag_update(&mut self) -> bool {
        if !self.config.enable_auglag {
            return false;
        }

        let fp = &self.fp_res;
        // inner solution still moving
        if fp.merit_der.abs() > self.config.merit_der_threshold * (1.0 + fp.merit.abs()) {
            return false;
        }
        // bounds already satisfied
        if fp.bound_violation < self.config.constraint_violation_threshold {
            return false;
        }

        self.penalty.update(&self.xtrj, &self.utrj, &self.bounds);
        self.penalty.grow(self.config.rho_growth);
        self.profile.auglag_updates += 1;
        info!(
            "augmented-lagrangian update: rho = {:.3e}, multiplier mass = {:.3e}",
            self.penalty.rho(),
            self.penalty.multiplier_mass()
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::dvector;

    fn scalar_bounds(n: usize) -> BoxBounds {
        let mut bounds = BoxBounds::new(1, 1, n);
        for k in 0..n {
            bounds.u_lb[(0, k)] = -0.5;
            bounds.u_ub[(0, k)] = 0.5;
        }
        bounds
    }

    #[test]
    fn test_penalty_zero_inside_bounds_without_multipliers() {
        let penalty = BoundPenalty::new(1, 1, 4, 1.0);
        let bounds = scalar_bounds(4);
        let cost = penalty.stage_cost(0, &dvector![0.0], Some(&dvector![0.2]), &bounds);
        assert_eq!(cost, 0.0);
    }

    #[test]
    fn test_penalty_grows_quadratically_outside() {
        let penalty = BoundPenalty::new(1, 1, 4, 2.0);
        let bounds = scalar_bounds(4);
        // g = 0.5 above the upper bound: psi = rho/2 * g^2
        let cost = penalty.stage_cost(0, &dvector![0.0], Some(&dvector![1.0]), &bounds);
        assert!((cost - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_quadratization_matches_penalty_derivative() {
        let penalty = BoundPenalty::new(1, 1, 4, 3.0);
        let bounds = scalar_bounds(4);
        let mut cost = CostData::new(1, 1);

        let u = dvector![0.8];
        penalty.add_quadratization(0, &dvector![0.0], Some(&u), &bounds, &mut cost);

        // finite-difference derivative of the stage penalty in u
        let eps = 1e-7;
        let up = dvector![0.8 + eps];
        let fd = (penalty.stage_cost(0, &dvector![0.0], Some(&up), &bounds)
            - penalty.stage_cost(0, &dvector![0.0], Some(&u), &bounds))
            / eps;
        assert!((fd - cost.ru[0]).abs() < 1e-5, "{} vs {}", fd, cost.ru[0]);
        assert!((cost.ruu[(0, 0)] - 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_multiplier_update_accumulates_on_violation() {
        let mut penalty = BoundPenalty::new(1, 1, 2, 10.0);
        let bounds = scalar_bounds(2);
        let xtrj = DMatrix::zeros(1, 3);
        let utrj = DMatrix::from_row_slice(1, 2, &[0.9, 0.5]);

        penalty.update(&xtrj, &utrj, &bounds);
        // violated at k = 0 only: lam = rho * 0.4
        assert!((penalty.lam_u_hi[(0, 0)] - 4.0).abs() < 1e-12);
        assert_eq!(penalty.lam_u_hi[(0, 1)], 0.0);
        assert!(penalty.multiplier_mass() > 0.0);
    }

    #[test]
    fn test_multiplier_update_relaxes_when_feasible() {
        let mut penalty = BoundPenalty::new(1, 1, 1, 1.0);
        let bounds = scalar_bounds(1);
        penalty.lam_u_hi[(0, 0)] = 0.3;

        // far inside the bound: lam + rho*g goes negative and clamps to zero
        let utrj = DMatrix::from_row_slice(1, 1, &[-0.4]);
        penalty.update(&DMatrix::zeros(1, 2), &utrj, &bounds);
        assert_eq!(penalty.lam_u_hi[(0, 0)], 0.0);
    }
}
