use nalgebra::{DMatrix, DVector};
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};

/// Selects the argument a tangent map is taken with respect to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Wrt {
    First,
    Second,
    Both,
}

/// Tangent maps of a two-argument manifold operation. A side that was not
/// requested is `None`.
#[derive(Debug, Clone)]
pub struct JacPair {
    pub first: Option<DMatrix<f64>>,
    pub second: Option<DMatrix<f64>>,
}

/// A smooth manifold used as the state space of an optimal control problem.
///
/// `nx` is the size of the ambient representation, `ndx` the dimension of the
/// tangent space (`ndx <= nx`; equal for flat vector spaces). `diff` and
/// `integrate` form an inverse pair: `integrate(x1, diff(x1, x2)) == x2` and
/// `diff(x, integrate(x, v)) == v`. Tangent vectors are expressed at the
/// first argument.
///
/// Implementations are stateless after construction and may be shared freely
/// between action models and solvers.
pub trait StateSpace {
    fn nx(&self) -> usize;
    fn ndx(&self) -> usize;

    /// Canonical reference configuration (the group identity for Lie groups).
    fn zero(&self) -> DVector<f64>;

    /// A sample on the manifold. Used for tests and warm starts only.
    fn rand(&self, rng: &mut dyn RngCore) -> DVector<f64>;

    /// Tangent vector `v` at `x1` such that `integrate(x1, v) = x2`.
    fn diff(&self, x1: &DVector<f64>, x2: &DVector<f64>) -> DVector<f64>;

    /// Geodesic composition `x [+] dx`. `dx` must be expressed in the tangent
    /// space at `x`.
    fn integrate(&self, x: &DVector<f64>, dx: &DVector<f64>) -> DVector<f64>;

    /// Tangent map of `diff` with respect to its first argument.
    fn jdiff_first(&self, x1: &DVector<f64>, x2: &DVector<f64>) -> DMatrix<f64>;

    /// Tangent map of `diff` with respect to its second argument.
    fn jdiff_second(&self, x1: &DVector<f64>, x2: &DVector<f64>) -> DMatrix<f64>;

    /// Tangent map of `integrate` with respect to the base point.
    fn jintegrate_first(&self, x: &DVector<f64>, dx: &DVector<f64>) -> DMatrix<f64>;

    /// Tangent map of `integrate` with respect to the tangent argument.
    fn jintegrate_second(&self, x: &DVector<f64>, dx: &DVector<f64>) -> DMatrix<f64>;

    fn jdiff(&self, x1: &DVector<f64>, x2: &DVector<f64>, wrt: Wrt) -> JacPair {
        match wrt {
            Wrt::First => JacPair {
                first: Some(self.jdiff_first(x1, x2)),
                second: None,
            },
            Wrt::Second => JacPair {
                first: None,
                second: Some(self.jdiff_second(x1, x2)),
            },
            Wrt::Both => JacPair {
                first: Some(self.jdiff_first(x1, x2)),
                second: Some(self.jdiff_second(x1, x2)),
            },
        }
    }

    fn jintegrate(&self, x: &DVector<f64>, dx: &DVector<f64>, wrt: Wrt) -> JacPair {
        match wrt {
            Wrt::First => JacPair {
                first: Some(self.jintegrate_first(x, dx)),
                second: None,
            },
            Wrt::Second => JacPair {
                first: None,
                second: Some(self.jintegrate_second(x, dx)),
            },
            Wrt::Both => JacPair {
                first: Some(self.jintegrate_first(x, dx)),
                second: Some(self.jintegrate_second(x, dx)),
            },
        }
    }
}

/// Flat Cartesian state space: `nx == ndx`, difference and integration are
/// plain vector arithmetic.
#[derive(Debug, Clone, Copy)]
pub struct StateVector {
    nx: usize,
}

impl StateVector {
    pub fn new(nx: usize) -> Self {
        Self { nx }
    }
}

impl StateSpace for StateVector {
    fn nx(&self) -> usize {
        self.nx
    }

    fn ndx(&self) -> usize {
        self.nx
    }

    fn zero(&self) -> DVector<f64> {
        DVector::zeros(self.nx)
    }

    fn rand(&self, rng: &mut dyn RngCore) -> DVector<f64> {
        DVector::from_fn(self.nx, |_, _| rng.gen::<f64>())
    }

    fn diff(&self, x1: &DVector<f64>, x2: &DVector<f64>) -> DVector<f64> {
        x2 - x1
    }

    fn integrate(&self, x: &DVector<f64>, dx: &DVector<f64>) -> DVector<f64> {
        x + dx
    }

    fn jdiff_first(&self, _x1: &DVector<f64>, _x2: &DVector<f64>) -> DMatrix<f64> {
        -DMatrix::identity(self.nx, self.nx)
    }

    fn jdiff_second(&self, _x1: &DVector<f64>, _x2: &DVector<f64>) -> DMatrix<f64> {
        DMatrix::identity(self.nx, self.nx)
    }

    fn jintegrate_first(&self, _x: &DVector<f64>, _dx: &DVector<f64>) -> DMatrix<f64> {
        DMatrix::identity(self.nx, self.nx)
    }

    fn jintegrate_second(&self, _x: &DVector<f64>, _dx: &DVector<f64>) -> DMatrix<f64> {
        DMatrix::identity(self.nx, self.nx)
    }
}

/// Planar rigid placement SE(2) stored as `(a, b, cos th, sin th)`.
///
/// Keeping the heading as a unit complex avoids angle wrapping in the ambient
/// representation; tangent vectors are `(da, db, dth)` in the local frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct StateUnicycle;

impl StateUnicycle {
    pub fn new() -> Self {
        Self
    }
}

impl StateSpace for StateUnicycle {
    fn nx(&self) -> usize {
        4
    }

    fn ndx(&self) -> usize {
        3
    }

    fn zero(&self) -> DVector<f64> {
        DVector::from_vec(vec![0.0, 0.0, 1.0, 0.0])
    }

    fn rand(&self, rng: &mut dyn RngCore) -> DVector<f64> {
        let a = rng.gen::<f64>();
        let b = rng.gen::<f64>();
        let th = rng.gen::<f64>();
        DVector::from_vec(vec![a, b, th.cos(), th.sin()])
    }

    fn diff(&self, x1: &DVector<f64>, x2: &DVector<f64>) -> DVector<f64> {
        // log(x1^-1 x2): rotate the position difference into the frame of x1
        // and recover the relative heading from the unit complex product.
        let (c1, s1) = (x1[2], x1[3]);
        let (c2, s2) = (x2[2], x2[3]);
        let da = x2[0] - x1[0];
        let db = x2[1] - x1[1];
        DVector::from_vec(vec![
            da * c1 + db * s1,
            -da * s1 + db * c1,
            (c1 * s2 - s1 * c2).atan2(c1 * c2 + s1 * s2),
        ])
    }

    fn integrate(&self, x: &DVector<f64>, dx: &DVector<f64>) -> DVector<f64> {
        let (c1, s1) = (x[2], x[3]);
        let (c2, s2) = (dx[2].cos(), dx[2].sin());
        let (da, db) = (dx[0], dx[1]);
        DVector::from_vec(vec![
            x[0] + c1 * da - s1 * db,
            x[1] + s1 * da + c1 * db,
            c1 * c2 - s1 * s2,
            c1 * s2 + s1 * c2,
        ])
    }

    fn jdiff_first(&self, x1: &DVector<f64>, x2: &DVector<f64>) -> DMatrix<f64> {
        // Minus the adjoint of the relative placement.
        let d = self.diff(x1, x2);
        let (a, b) = (d[0], d[1]);
        DMatrix::from_row_slice(3, 3, &[-1.0, 0.0, b, 0.0, -1.0, -a, 0.0, 0.0, -1.0])
    }

    fn jdiff_second(&self, x1: &DVector<f64>, x2: &DVector<f64>) -> DMatrix<f64> {
        let th = self.diff(x1, x2)[2];
        let (c, s) = (th.cos(), th.sin());
        DMatrix::from_row_slice(3, 3, &[c, -s, 0.0, s, c, 0.0, 0.0, 0.0, 1.0])
    }

    fn jintegrate_first(&self, _x: &DVector<f64>, dx: &DVector<f64>) -> DMatrix<f64> {
        let (a, b, th) = (dx[0], dx[1], dx[2]);
        let (c, s) = (th.cos(), th.sin());
        DMatrix::from_row_slice(
            3,
            3,
            &[
                c,
                s,
                -c * b + s * a,
                -s,
                c,
                s * b + c * a,
                0.0,
                0.0,
                1.0,
            ],
        )
    }

    fn jintegrate_second(&self, _x: &DVector<f64>, dx: &DVector<f64>) -> DMatrix<f64> {
        let th = dx[2];
        let (c, s) = (th.cos(), th.sin());
        DMatrix::from_row_slice(3, 3, &[c, s, 0.0, -s, c, 0.0, 0.0, 0.0, 1.0])
    }
}
