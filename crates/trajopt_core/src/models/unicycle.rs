use nalgebra::{DMatrix, DVector};

use crate::action::{ActionData, ActionModel};
use crate::state::{StateSpace, StateUnicycle, StateVector};

const UNICYCLE_DT: f64 = 0.1;
const UNICYCLE_WEIGHTS: [f64; 2] = [1.0, 0.03];

/// Planar unicycle with the pose kept as a plain vector `(a, b, th)`.
///
/// Controls are `(v, w)` (forward and angular velocity); the cost is the
/// squared residual `(w0 x, w1 u)`, which drives the vehicle to the origin.
pub struct UnicycleModel {
    state: StateVector,
    pub dt: f64,
    pub cost_weights: [f64; 2],
}

impl UnicycleModel {
    pub fn new() -> Self {
        Self {
            state: StateVector::new(3),
            dt: UNICYCLE_DT,
            cost_weights: UNICYCLE_WEIGHTS,
        }
    }
}

impl Default for UnicycleModel {
    fn default() -> Self {
        Self::new()
    }
}

impl ActionModel for UnicycleModel {
    fn state(&self) -> &dyn StateSpace {
        &self.state
    }

    fn nu(&self) -> usize {
        2
    }

    fn ncost(&self) -> usize {
        5
    }

    fn calc(&self, data: &mut ActionData, x: &DVector<f64>, u: Option<&DVector<f64>>) -> f64 {
        let zero_u;
        let u = match u {
            Some(u) => u,
            None => {
                zero_u = DVector::zeros(2);
                &zero_u
            }
        };
        let (v, w) = (u[0], u[1]);
        let (c, s) = (x[2].cos(), x[2].sin());
        data.xnext = DVector::from_vec(vec![
            x[0] + c * v * self.dt,
            x[1] + s * v * self.dt,
            x[2] + w * self.dt,
        ]);
        let [wx, wu] = self.cost_weights;
        data.cost_residuals.rows_mut(0, 3).copy_from(&(x * wx));
        data.cost_residuals.rows_mut(3, 2).copy_from(&(u * wu));
        data.cost = 0.5 * data.cost_residuals.norm_squared();
        data.cost
    }

    fn calc_diff(
        &self,
        data: &mut ActionData,
        x: &DVector<f64>,
        u: Option<&DVector<f64>>,
    ) -> f64 {
        let cost = self.calc(data, x, u);
        let zero_u;
        let u = match u {
            Some(u) => u,
            None => {
                zero_u = DVector::zeros(2);
                &zero_u
            }
        };
        let [wx, wu] = self.cost_weights;

        data.lx = x * (wx * wx);
        data.lu = u * (wu * wu);
        data.lxx = DMatrix::identity(3, 3) * (wx * wx);
        data.lxu.fill(0.0);
        data.luu = DMatrix::identity(2, 2) * (wu * wu);
        data.rx.fill(0.0);
        data.ru.fill(0.0);
        data.rx
            .view_mut((0, 0), (3, 3))
            .copy_from(&(DMatrix::identity(3, 3) * wx));
        data.ru
            .view_mut((3, 0), (2, 2))
            .copy_from(&(DMatrix::identity(2, 2) * wu));

        let (v, _w) = (u[0], u[1]);
        let (c, s) = (x[2].cos(), x[2].sin());
        let dt = self.dt;
        data.fx = DMatrix::from_row_slice(
            3,
            3,
            &[
                1.0,
                0.0,
                -s * v * dt,
                0.0,
                1.0,
                c * v * dt,
                0.0,
                0.0,
                1.0,
            ],
        );
        data.fu = DMatrix::from_row_slice(3, 2, &[c * dt, 0.0, s * dt, 0.0, 0.0, dt]);
        cost
    }
}

/// Planar unicycle living on SE(2): same controls, time step and cost
/// weights as [`UnicycleModel`], but the pose is a group element and the
/// position error is measured in the tangent space at a reference placement.
pub struct UnicycleSe2Model {
    state: StateUnicycle,
    pub dt: f64,
    pub cost_weights: [f64; 2],
    pub xref: DVector<f64>,
}

impl UnicycleSe2Model {
    pub fn new() -> Self {
        let state = StateUnicycle::new();
        let xref = state.zero();
        Self {
            state,
            dt: UNICYCLE_DT,
            cost_weights: UNICYCLE_WEIGHTS,
            xref,
        }
    }

    fn control_displacement(&self, u: &DVector<f64>) -> DVector<f64> {
        DVector::from_vec(vec![u[0] * self.dt, 0.0, u[1] * self.dt])
    }
}

impl Default for UnicycleSe2Model {
    fn default() -> Self {
        Self::new()
    }
}

impl ActionModel for UnicycleSe2Model {
    fn state(&self) -> &dyn StateSpace {
        &self.state
    }

    fn nu(&self) -> usize {
        2
    }

    fn ncost(&self) -> usize {
        5
    }

    fn calc(&self, data: &mut ActionData, x: &DVector<f64>, u: Option<&DVector<f64>>) -> f64 {
        let zero_u;
        let u = match u {
            Some(u) => u,
            None => {
                zero_u = DVector::zeros(2);
                &zero_u
            }
        };
        let [wx, wu] = self.cost_weights;
        data.xnext = self.state.integrate(x, &self.control_displacement(u));
        data.cost_residuals
            .rows_mut(0, 3)
            .copy_from(&(self.state.diff(&self.xref, x) * wx));
        data.cost_residuals.rows_mut(3, 2).copy_from(&(u * wu));
        data.cost = 0.5 * data.cost_residuals.norm_squared();
        data.cost
    }

    fn calc_diff(
        &self,
        data: &mut ActionData,
        x: &DVector<f64>,
        u: Option<&DVector<f64>>,
    ) -> f64 {
        let cost = self.calc(data, x, u);
        let zero_u;
        let u = match u {
            Some(u) => u,
            None => {
                zero_u = DVector::zeros(2);
                &zero_u
            }
        };
        let [wx, wu] = self.cost_weights;

        // Gauss-Newton blocks from the stacked residual Jacobian.
        data.rx.fill(0.0);
        data.ru.fill(0.0);
        data.rx
            .view_mut((0, 0), (3, 3))
            .copy_from(&(self.state.jdiff_second(&self.xref, x) * wx));
        data.ru
            .view_mut((3, 0), (2, 2))
            .copy_from(&(DMatrix::identity(2, 2) * wu));
        data.lx = data.rx.tr_mul(&data.cost_residuals);
        data.lu = data.ru.tr_mul(&data.cost_residuals);
        data.lxx = data.rx.tr_mul(&data.rx);
        data.lxu = data.rx.tr_mul(&data.ru);
        data.luu = data.ru.tr_mul(&data.ru);

        let dxu = self.control_displacement(u);
        data.fx = self.state.jintegrate_first(x, &dxu);
        let ju = self.state.jintegrate_second(x, &dxu);
        data.fu.set_column(0, &(ju.column(0) * self.dt));
        data.fu.set_column(1, &(ju.column(2) * self.dt));
        cost
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::numdiff::ActionModelNumDiff;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::rc::Rc;

    #[test]
    fn flat_unicycle_steps_as_expected() {
        let model = UnicycleModel::new();
        let mut data = model.create_data();
        let x = DVector::from_vec(vec![0.0, 0.0, 0.0]);
        let u = DVector::from_vec(vec![1.0, 2.0]);
        let cost = model.calc(&mut data, &x, Some(&u));
        assert!((&data.xnext - DVector::from_vec(vec![0.1, 0.0, 0.2])).norm() < 1e-12);
        // Residual is (0, 0, 0, 0.03, 0.06).
        assert!((cost - 0.5 * (0.03f64.powi(2) + 0.06f64.powi(2))).abs() < 1e-12);
    }

    #[test]
    fn flat_unicycle_derivatives_match_finite_differences() {
        let mut rng = StdRng::seed_from_u64(220);
        let model = UnicycleModel::new();
        let mut data = model.create_data();
        let x = model.state().rand(&mut rng);
        let u = DVector::from_fn(2, |_, _| rng.gen::<f64>());
        model.calc_diff(&mut data, &x, Some(&u));

        let numdiff =
            ActionModelNumDiff::new(Rc::new(UnicycleModel::new()), true).expect("residual model");
        let mut ndata = numdiff.create_data();
        numdiff.calc_diff(&mut ndata, &x, Some(&u));

        let tol = 10.0 * numdiff.disturbance;
        assert!((&data.fx - &ndata.fx).amax() < tol, "Fx mismatch");
        assert!((&data.fu - &ndata.fu).amax() < tol, "Fu mismatch");
        assert!((&data.lx - &ndata.lx).amax() < tol, "Lx mismatch");
        assert!((&data.lu - &ndata.lu).amax() < tol, "Lu mismatch");
        assert!((&data.lxx - &ndata.lxx).amax() < tol, "Lxx mismatch");
        assert!((&data.lxu - &ndata.lxu).amax() < tol, "Lxu mismatch");
        assert!((&data.luu - &ndata.luu).amax() < tol, "Luu mismatch");
    }

    #[test]
    fn se2_unicycle_derivatives_match_finite_differences() {
        let mut rng = StdRng::seed_from_u64(220);
        let model = UnicycleSe2Model::new();
        let mut data = model.create_data();
        let x = model.state().rand(&mut rng);
        let u = DVector::from_fn(2, |_, _| rng.gen::<f64>());
        model.calc_diff(&mut data, &x, Some(&u));

        let numdiff = ActionModelNumDiff::new(Rc::new(UnicycleSe2Model::new()), true)
            .expect("residual model");
        let mut ndata = numdiff.create_data();
        numdiff.calc_diff(&mut ndata, &x, Some(&u));

        let tol = 10.0 * numdiff.disturbance;
        assert!((&data.fx - &ndata.fx).amax() < tol, "Fx mismatch");
        assert!((&data.fu - &ndata.fu).amax() < tol, "Fu mismatch");
        assert!((&data.lx - &ndata.lx).amax() < tol, "Lx mismatch");
        assert!((&data.lu - &ndata.lu).amax() < tol, "Lu mismatch");
        assert!((&data.rx - &ndata.rx).amax() < tol, "Rx mismatch");
        assert!((&data.ru - &ndata.ru).amax() < tol, "Ru mismatch");
        assert!((&data.lxx - &ndata.lxx).amax() < tol, "Lxx mismatch");
        assert!((&data.lxu - &ndata.lxu).amax() < tol, "Lxu mismatch");
        assert!((&data.luu - &ndata.luu).amax() < tol, "Luu mismatch");
    }

    #[test]
    fn se2_unicycle_agrees_with_flat_model_through_the_log_map() {
        let mut rng = StdRng::seed_from_u64(220);
        let se2 = UnicycleSe2Model::new();
        let flat = UnicycleModel::new();
        let state = StateUnicycle::new();

        let x = state.rand(&mut rng);
        let u = DVector::from_fn(2, |_, _| rng.gen::<f64>());
        let x_flat = state.diff(&state.zero(), &x);

        let mut data_se2 = se2.create_data();
        let mut data_flat = flat.create_data();
        let cost_se2 = se2.calc(&mut data_se2, &x, Some(&u));
        let cost_flat = flat.calc(&mut data_flat, &x_flat, Some(&u));

        assert!((cost_se2 - cost_flat).abs() < 1e-9);
        let lifted = state.integrate(&state.zero(), &data_flat.xnext);
        assert!((lifted - &data_se2.xnext).norm() < 1e-9);
    }
}
