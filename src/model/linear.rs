//! Ready-made linear/quadratic models.
//!
//! These cover the LQ corner of the problem class directly and double as
//! building blocks for tests. Nonlinear problems implement the oracle
//! traits themselves.

use nalgebra::{DMatrix, DVector};

use super::{ConstraintModel, CostModel, DynamicsModel};

/// Linear time-invariant dynamics `x_next = A·x + B·u`.
#[derive(Debug, Clone)]
pub struct LinearDynamics {
    a: DMatrix<f64>,
    b: DMatrix<f64>,
}

impl LinearDynamics {
    /// Create from the state and input matrices.
    ///
    /// # Panics
    /// Panics if `a` is not square or `b` has a different row count.
    pub fn new(a: DMatrix<f64>, b: DMatrix<f64>) -> Self {
        assert!(a.is_square(), "state matrix must be square");
        assert_eq!(a.nrows(), b.nrows(), "A and B row counts differ");
        Self { a, b }
    }
}

impl DynamicsModel for LinearDynamics {
    fn nx(&self) -> usize {
        self.a.nrows()
    }

    fn nu(&self) -> usize {
        self.b.ncols()
    }

    fn eval(&self, x: &DVector<f64>, u: &DVector<f64>) -> DVector<f64> {
        &self.a * x + &self.b * u
    }

    fn linearize(&self, _x: &DVector<f64>, _u: &DVector<f64>) -> (DMatrix<f64>, DMatrix<f64>) {
        (self.a.clone(), self.b.clone())
    }
}

/// Quadratic stage cost
/// `ℓ(x, u) = ½(x − x_ref)ᵀQ(x − x_ref) + ½(u − u_ref)ᵀR(u − u_ref)`.
///
/// For a final cost pass a zero `R` of size `nu × nu`; the solver ignores
/// the input blocks at the last stage either way.
#[derive(Debug, Clone)]
pub struct QuadraticCost {
    q: DMatrix<f64>,
    r: DMatrix<f64>,
    x_ref: DVector<f64>,
    u_ref: DVector<f64>,
}

impl QuadraticCost {
    /// Quadratic cost centered at the origin.
    pub fn new(q: DMatrix<f64>, r: DMatrix<f64>) -> Self {
        assert!(q.is_square() && r.is_square());
        let x_ref = DVector::zeros(q.nrows());
        let u_ref = DVector::zeros(r.nrows());
        Self { q, r, x_ref, u_ref }
    }

    /// Quadratic cost centered at `(x_ref, u_ref)`.
    pub fn with_targets(
        q: DMatrix<f64>,
        r: DMatrix<f64>,
        x_ref: DVector<f64>,
        u_ref: DVector<f64>,
    ) -> Self {
        assert!(q.is_square() && r.is_square());
        assert_eq!(q.nrows(), x_ref.len());
        assert_eq!(r.nrows(), u_ref.len());
        Self { q, r, x_ref, u_ref }
    }
}

impl CostModel for QuadraticCost {
    fn eval(&self, x: &DVector<f64>, u: &DVector<f64>) -> f64 {
        let ex = x - &self.x_ref;
        let eu = u - &self.u_ref;
        0.5 * (ex.dot(&(&self.q * &ex)) + eu.dot(&(&self.r * &eu)))
    }

    fn gradient(&self, x: &DVector<f64>, u: &DVector<f64>) -> (DVector<f64>, DVector<f64>) {
        (&self.q * (x - &self.x_ref), &self.r * (u - &self.u_ref))
    }

    fn hessian(
        &self,
        _x: &DVector<f64>,
        _u: &DVector<f64>,
    ) -> (DMatrix<f64>, DMatrix<f64>, DMatrix<f64>) {
        let p = DMatrix::zeros(self.r.nrows(), self.q.nrows());
        (self.q.clone(), self.r.clone(), p)
    }
}

/// Linear equality constraint `C·x + D·u − e = 0`.
#[derive(Debug, Clone)]
pub struct LinearConstraint {
    c: DMatrix<f64>,
    d: DMatrix<f64>,
    e: DVector<f64>,
}

impl LinearConstraint {
    pub fn new(c: DMatrix<f64>, d: DMatrix<f64>, e: DVector<f64>) -> Self {
        assert_eq!(c.nrows(), d.nrows());
        assert_eq!(c.nrows(), e.len());
        Self { c, d, e }
    }
}

impl ConstraintModel for LinearConstraint {
    fn dim(&self) -> usize {
        self.c.nrows()
    }

    fn eval(&self, x: &DVector<f64>, u: &DVector<f64>) -> DVector<f64> {
        &self.c * x + &self.d * u - &self.e
    }

    fn jacobian(&self, _x: &DVector<f64>, _u: &DVector<f64>) -> (DMatrix<f64>, DMatrix<f64>) {
        (self.c.clone(), self.d.clone())
    }
}

/// State-space goal `x − x_goal = 0`, typically used as a final constraint.
#[derive(Debug, Clone)]
pub struct GoalConstraint {
    goal: DVector<f64>,
    nu: usize,
}

impl GoalConstraint {
    pub fn new(goal: DVector<f64>, nu: usize) -> Self {
        Self { goal, nu }
    }
}

impl ConstraintModel for GoalConstraint {
    fn dim(&self) -> usize {
        self.goal.len()
    }

    fn eval(&self, x: &DVector<f64>, _u: &DVector<f64>) -> DVector<f64> {
        x - &self.goal
    }

    fn jacobian(&self, x: &DVector<f64>, _u: &DVector<f64>) -> (DMatrix<f64>, DMatrix<f64>) {
        (
            DMatrix::identity(x.len(), x.len()),
            DMatrix::zeros(self.goal.len(), self.nu),
        )
    }
}
