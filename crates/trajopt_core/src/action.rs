use nalgebra::{DMatrix, DVector};

use crate::state::StateSpace;

/// Per-step workspace of an action model.
///
/// Every derivative block is expressed in the tangent basis of the model's
/// state: `lx`/`lxx` have `ndx` rows and `fx`/`fu` map tangent perturbations
/// to tangent perturbations. `rx`/`ru` hold the residual Jacobians when the
/// model has a least-squares cost (`ncost > 1`) and stay zero otherwise.
#[derive(Debug, Clone)]
pub struct ActionData {
    pub xnext: DVector<f64>,
    pub cost: f64,
    pub cost_residuals: DVector<f64>,
    pub lx: DVector<f64>,
    pub lu: DVector<f64>,
    pub lxx: DMatrix<f64>,
    pub lxu: DMatrix<f64>,
    pub luu: DMatrix<f64>,
    pub fx: DMatrix<f64>,
    pub fu: DMatrix<f64>,
    pub rx: DMatrix<f64>,
    pub ru: DMatrix<f64>,
}

impl ActionData {
    pub fn zeros(nx: usize, ndx: usize, nu: usize, ncost: usize) -> Self {
        Self {
            xnext: DVector::zeros(nx),
            cost: f64::NAN,
            cost_residuals: DVector::zeros(ncost),
            lx: DVector::zeros(ndx),
            lu: DVector::zeros(nu),
            lxx: DMatrix::zeros(ndx, ndx),
            lxu: DMatrix::zeros(ndx, nu),
            luu: DMatrix::zeros(nu, nu),
            fx: DMatrix::zeros(ndx, ndx),
            fu: DMatrix::zeros(ndx, nu),
            rx: DMatrix::zeros(ncost, ndx),
            ru: DMatrix::zeros(ncost, nu),
        }
    }
}

/// One step of an optimal control problem: transition dynamics plus running
/// cost, with first-order (and Gauss-Newton second-order) derivatives.
///
/// Models are immutable and shareable; all per-step scratch lives in the
/// [`ActionData`] owned by the shooting problem slot the model is bound to.
/// Passing `None` as the control evaluates the model at `u = 0`, the
/// convention used for terminal-cost evaluation.
pub trait ActionModel {
    fn state(&self) -> &dyn StateSpace;

    fn nu(&self) -> usize;

    /// Dimension of the cost residual; 1 when the model has no residual form.
    fn ncost(&self) -> usize {
        1
    }

    fn nx(&self) -> usize {
        self.state().nx()
    }

    fn ndx(&self) -> usize {
        self.state().ndx()
    }

    fn create_data(&self) -> ActionData {
        ActionData::zeros(self.nx(), self.ndx(), self.nu(), self.ncost())
    }

    /// Evaluate the transition and the cost at `(x, u)`, writing `data.xnext`
    /// and `data.cost` (and the residuals when `ncost > 1`). Returns the cost.
    fn calc(&self, data: &mut ActionData, x: &DVector<f64>, u: Option<&DVector<f64>>) -> f64;

    /// Run [`ActionModel::calc`], then fill every derivative block of `data`.
    /// Returns the cost.
    fn calc_diff(&self, data: &mut ActionData, x: &DVector<f64>, u: Option<&DVector<f64>>)
        -> f64;
}
