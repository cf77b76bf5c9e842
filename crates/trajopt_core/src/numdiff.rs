use std::rc::Rc;

use anyhow::{bail, Result};
use nalgebra::{DMatrix, DVector};
use rand::RngCore;

use crate::action::{ActionData, ActionModel};
use crate::state::StateSpace;

/// Wraps a [`StateSpace`] and replaces the analytical tangent maps by
/// one-sided finite differences, composing `integrate`/`diff` along the
/// tangent basis. Used to validate hand-written Jacobians.
pub struct StateNumDiff<S> {
    inner: S,
    pub disturbance: f64,
}

impl<S: StateSpace> StateNumDiff<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            disturbance: 1e-6,
        }
    }
}

impl<S: StateSpace> StateSpace for StateNumDiff<S> {
    fn nx(&self) -> usize {
        self.inner.nx()
    }

    fn ndx(&self) -> usize {
        self.inner.ndx()
    }

    fn zero(&self) -> DVector<f64> {
        self.inner.zero()
    }

    fn rand(&self, rng: &mut dyn RngCore) -> DVector<f64> {
        self.inner.rand(rng)
    }

    fn diff(&self, x1: &DVector<f64>, x2: &DVector<f64>) -> DVector<f64> {
        self.inner.diff(x1, x2)
    }

    fn integrate(&self, x: &DVector<f64>, dx: &DVector<f64>) -> DVector<f64> {
        self.inner.integrate(x, dx)
    }

    fn jdiff_first(&self, x1: &DVector<f64>, x2: &DVector<f64>) -> DMatrix<f64> {
        let ndx = self.ndx();
        let h = self.disturbance;
        let d0 = self.inner.diff(x1, x2);
        let mut jac = DMatrix::zeros(ndx, ndx);
        let mut e = DVector::zeros(ndx);
        for k in 0..ndx {
            e[k] = h;
            let column = (self.inner.diff(&self.inner.integrate(x1, &e), x2) - &d0) / h;
            jac.set_column(k, &column);
            e[k] = 0.0;
        }
        jac
    }

    fn jdiff_second(&self, x1: &DVector<f64>, x2: &DVector<f64>) -> DMatrix<f64> {
        let ndx = self.ndx();
        let h = self.disturbance;
        let d0 = self.inner.diff(x1, x2);
        let mut jac = DMatrix::zeros(ndx, ndx);
        let mut e = DVector::zeros(ndx);
        for k in 0..ndx {
            e[k] = h;
            let column = (self.inner.diff(x1, &self.inner.integrate(x2, &e)) - &d0) / h;
            jac.set_column(k, &column);
            e[k] = 0.0;
        }
        jac
    }

    fn jintegrate_first(&self, x: &DVector<f64>, dx: &DVector<f64>) -> DMatrix<f64> {
        let ndx = self.ndx();
        let h = self.disturbance;
        let x0 = self.inner.integrate(x, dx);
        let mut jac = DMatrix::zeros(ndx, ndx);
        let mut e = DVector::zeros(ndx);
        for k in 0..ndx {
            e[k] = h;
            let perturbed = self.inner.integrate(&self.inner.integrate(x, &e), dx);
            jac.set_column(k, &(self.inner.diff(&x0, &perturbed) / h));
            e[k] = 0.0;
        }
        jac
    }

    fn jintegrate_second(&self, x: &DVector<f64>, dx: &DVector<f64>) -> DMatrix<f64> {
        let ndx = self.ndx();
        let h = self.disturbance;
        let x0 = self.inner.integrate(x, dx);
        let mut jac = DMatrix::zeros(ndx, ndx);
        let mut e = DVector::zeros(ndx);
        for k in 0..ndx {
            e[k] = h;
            let perturbed = self.inner.integrate(x, &(dx + &e));
            jac.set_column(k, &(self.inner.diff(&x0, &perturbed) / h));
            e[k] = 0.0;
        }
        jac
    }
}

/// Finite-difference derivatives of an [`ActionModel`].
///
/// State perturbations are taken in the tangent space through `integrate`,
/// and the change of the next state is pulled back with `diff`, so the
/// wrapper works for manifold states as well. With `with_gauss_approx`
/// enabled (requires a residual cost, `ncost > 1`) the second-order blocks
/// are assembled as `R'R` from the finite-differenced residual Jacobians.
pub struct ActionModelNumDiff {
    model: Rc<dyn ActionModel>,
    pub disturbance: f64,
    with_gauss_approx: bool,
}

impl std::fmt::Debug for ActionModelNumDiff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionModelNumDiff")
            .field("disturbance", &self.disturbance)
            .field("with_gauss_approx", &self.with_gauss_approx)
            .finish()
    }
}

/// Workspace of [`ActionModelNumDiff`]: the nominal evaluation plus one
/// scratch [`ActionData`] per perturbed direction.
pub struct NumDiffData {
    pub data0: ActionData,
    datax: Vec<ActionData>,
    datau: Vec<ActionData>,
    pub fx: DMatrix<f64>,
    pub fu: DMatrix<f64>,
    pub lx: DVector<f64>,
    pub lu: DVector<f64>,
    pub rx: DMatrix<f64>,
    pub ru: DMatrix<f64>,
    pub lxx: DMatrix<f64>,
    pub lxu: DMatrix<f64>,
    pub luu: DMatrix<f64>,
}

impl ActionModelNumDiff {
    pub fn new(model: Rc<dyn ActionModel>, with_gauss_approx: bool) -> Result<Self> {
        if with_gauss_approx && model.ncost() <= 1 {
            bail!("Gauss-Newton approximation requires a residual cost (ncost > 1).");
        }
        Ok(Self {
            model,
            disturbance: 1e-5,
            with_gauss_approx,
        })
    }

    pub fn create_data(&self) -> NumDiffData {
        let (ndx, nu, ncost) = (self.model.ndx(), self.model.nu(), self.model.ncost());
        NumDiffData {
            data0: self.model.create_data(),
            datax: (0..ndx).map(|_| self.model.create_data()).collect(),
            datau: (0..nu).map(|_| self.model.create_data()).collect(),
            fx: DMatrix::zeros(ndx, ndx),
            fu: DMatrix::zeros(ndx, nu),
            lx: DVector::zeros(ndx),
            lu: DVector::zeros(nu),
            rx: DMatrix::zeros(ncost, ndx),
            ru: DMatrix::zeros(ncost, nu),
            lxx: DMatrix::zeros(ndx, ndx),
            lxu: DMatrix::zeros(ndx, nu),
            luu: DMatrix::zeros(nu, nu),
        }
    }

    pub fn calc(&self, data: &mut NumDiffData, x: &DVector<f64>, u: Option<&DVector<f64>>) -> f64 {
        self.model.calc(&mut data.data0, x, u)
    }

    pub fn calc_diff(
        &self,
        data: &mut NumDiffData,
        x: &DVector<f64>,
        u: Option<&DVector<f64>>,
    ) -> f64 {
        let h = self.disturbance;
        let state = self.model.state();
        let (ndx, nu, ncost) = (self.model.ndx(), self.model.nu(), self.model.ncost());

        let c0 = self.model.calc(&mut data.data0, x, u);
        let xn0 = data.data0.xnext.clone();
        let res0 = data.data0.cost_residuals.clone();

        let mut e = DVector::zeros(ndx);
        for k in 0..ndx {
            e[k] = h;
            let xk = state.integrate(x, &e);
            let ck = self.model.calc(&mut data.datax[k], &xk, u);
            data.fx
                .set_column(k, &(state.diff(&xn0, &data.datax[k].xnext) / h));
            data.lx[k] = (ck - c0) / h;
            if ncost > 1 {
                data.rx
                    .set_column(k, &((&data.datax[k].cost_residuals - &res0) / h));
            }
            e[k] = 0.0;
        }

        let u0 = match u {
            Some(u) => u.clone_owned(),
            None => DVector::zeros(nu),
        };
        for k in 0..nu {
            let mut uk = u0.clone();
            uk[k] += h;
            let ck = self.model.calc(&mut data.datau[k], x, Some(&uk));
            data.fu
                .set_column(k, &(state.diff(&xn0, &data.datau[k].xnext) / h));
            data.lu[k] = (ck - c0) / h;
            if ncost > 1 {
                data.ru
                    .set_column(k, &((&data.datau[k].cost_residuals - &res0) / h));
            }
        }

        if self.with_gauss_approx {
            data.lxx = data.rx.tr_mul(&data.rx);
            data.lxu = data.rx.tr_mul(&data.ru);
            data.luu = data.ru.tr_mul(&data.ru);
        }
        c0
    }
}
