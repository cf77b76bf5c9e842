use nalgebra::{DMatrix, DVector};
use rand::{Rng, RngCore};

use crate::action::{ActionData, ActionModel};
use crate::state::{StateSpace, StateVector};

/// Linear-quadratic action model on a flat state space.
///
/// Transition: `xnext = fx x + fu u + f0`.
/// Cost: `1/2 [x;u]' [lxx lxu; lxu' luu] [x;u] + lx.x + lu.u`.
pub struct LqrModel {
    state: StateVector,
    nu: usize,
    pub lx: DVector<f64>,
    pub lu: DVector<f64>,
    pub lxx: DMatrix<f64>,
    pub lxu: DMatrix<f64>,
    pub luu: DMatrix<f64>,
    pub fx: DMatrix<f64>,
    pub fu: DMatrix<f64>,
    pub f0: DVector<f64>,
}

impl LqrModel {
    /// A zero-initialized model; fill the public matrices before use.
    pub fn new(nx: usize, nu: usize) -> Self {
        Self {
            state: StateVector::new(nx),
            nu,
            lx: DVector::zeros(nx),
            lu: DVector::zeros(nu),
            lxx: DMatrix::zeros(nx, nx),
            lxu: DMatrix::zeros(nx, nu),
            luu: DMatrix::zeros(nu, nu),
            fx: DMatrix::zeros(nx, nx),
            fu: DMatrix::zeros(nx, nu),
            f0: DVector::zeros(nx),
        }
    }

    /// A model with random dynamics and a random convex cost: the quadratic
    /// block is `1/2 A'A` for `A` uniform in [-1, 1), so it is symmetric
    /// positive semidefinite.
    pub fn random(nx: usize, nu: usize, rng: &mut dyn RngCore) -> Self {
        let n = nx + nu;
        let a = DMatrix::from_fn(n, n, |_, _| rng.gen::<f64>() * 2.0 - 1.0);
        let l = a.tr_mul(&a) * 0.5;
        Self {
            state: StateVector::new(nx),
            nu,
            lx: DVector::from_fn(nx, |_, _| rng.gen::<f64>()),
            lu: DVector::from_fn(nu, |_, _| rng.gen::<f64>()),
            lxx: l.view((0, 0), (nx, nx)).into_owned(),
            lxu: l.view((0, nx), (nx, nu)).into_owned(),
            luu: l.view((nx, nx), (nu, nu)).into_owned(),
            fx: DMatrix::from_fn(nx, nx, |_, _| rng.gen::<f64>() * 2.0 - 1.0),
            fu: DMatrix::from_fn(nx, nu, |_, _| rng.gen::<f64>() * 2.0 - 1.0),
            f0: DVector::from_fn(nx, |_, _| rng.gen::<f64>()),
        }
    }
}

impl ActionModel for LqrModel {
    fn state(&self) -> &dyn StateSpace {
        &self.state
    }

    fn nu(&self) -> usize {
        self.nu
    }

    fn calc(&self, data: &mut ActionData, x: &DVector<f64>, u: Option<&DVector<f64>>) -> f64 {
        let zero_u;
        let u = match u {
            Some(u) => u,
            None => {
                zero_u = DVector::zeros(self.nu);
                &zero_u
            }
        };
        data.xnext = &self.fx * x + &self.fu * u + &self.f0;
        data.cost = 0.5 * x.dot(&(&self.lxx * x))
            + x.dot(&(&self.lxu * u))
            + 0.5 * u.dot(&(&self.luu * u))
            + self.lx.dot(x)
            + self.lu.dot(u);
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
                zero_u = DVector::zeros(self.nu);
                &zero_u
            }
        };
        data.lx = &self.lx + &self.lxx * x + &self.lxu * u;
        data.lu = &self.lu + self.lxu.tr_mul(x) + &self.luu * u;
        data.lxx.copy_from(&self.lxx);
        data.lxu.copy_from(&self.lxu);
        data.luu.copy_from(&self.luu);
        data.fx.copy_from(&self.fx);
        data.fu.copy_from(&self.fu);
        cost
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn random_quadratic_block_is_symmetric() {
        let mut rng = StdRng::seed_from_u64(220);
        let model = LqrModel::random(4, 2, &mut rng);
        assert!((&model.lxx - model.lxx.transpose()).norm() < 1e-12);
        assert!((&model.luu - model.luu.transpose()).norm() < 1e-12);
    }

    #[test]
    fn calc_matches_the_quadratic_form() {
        let mut rng = StdRng::seed_from_u64(220);
        let model = LqrModel::random(3, 2, &mut rng);
        let mut data = model.create_data();
        let x = DVector::from_fn(3, |_, _| rng.gen::<f64>());
        let u = DVector::from_fn(2, |_, _| rng.gen::<f64>());

        let cost = model.calc(&mut data, &x, Some(&u));

        // Evaluate through the stacked form 1/2 z'Lz + g.z with z = [x; u].
        let mut z = DVector::zeros(5);
        z.rows_mut(0, 3).copy_from(&x);
        z.rows_mut(3, 2).copy_from(&u);
        let mut l = DMatrix::zeros(5, 5);
        l.view_mut((0, 0), (3, 3)).copy_from(&model.lxx);
        l.view_mut((0, 3), (3, 2)).copy_from(&model.lxu);
        l.view_mut((3, 0), (2, 3)).copy_from(&model.lxu.transpose());
        l.view_mut((3, 3), (2, 2)).copy_from(&model.luu);
        let mut g = DVector::zeros(5);
        g.rows_mut(0, 3).copy_from(&model.lx);
        g.rows_mut(3, 2).copy_from(&model.lu);
        let expected = 0.5 * z.dot(&(&l * &z)) + g.dot(&z);

        assert!((cost - expected).abs() < 1e-12);
        assert!((&data.xnext - (&model.fx * &x + &model.fu * &u + &model.f0)).norm() < 1e-12);
    }

    #[test]
    fn omitted_control_evaluates_at_zero() {
        let mut rng = StdRng::seed_from_u64(220);
        let model = LqrModel::random(3, 2, &mut rng);
        let mut data = model.create_data();
        let x = DVector::from_fn(3, |_, _| rng.gen::<f64>());

        let cost_none = model.calc(&mut data, &x, None);
        let cost_zero = model.calc(&mut data, &x, Some(&DVector::zeros(2)));
        assert_eq!(cost_none, cost_zero);
    }
}
