use anyhow::{bail, Result};
use nalgebra::{DMatrix, DVector};

use crate::error::SolverError;
use crate::problem::ShootingProblem;
use crate::solvers::{ShootingSolver, SolverSettings};
use crate::state::StateSpace;

/// Direct solver for the shooting problem: one Newton step on the full
/// primal-dual KKT system per iteration.
///
/// The system is assembled in the tangent space (`ndx` rows per state slot),
/// so the primal vector is `[dx_0 .. dx_T, du_0 .. du_{T-1}]` and the dual
/// carries one multiplier block per constraint: the initial-state anchor
/// followed by one dynamics constraint per running step. For flat states this
/// coincides with an ambient-space assembly; for manifold states it keeps
/// every block square.
pub struct KktSolver {
    problem: ShootingProblem,
    pub settings: SolverSettings,
    ndx_total: usize,
    nu_total: usize,
    kkt: DMatrix<f64>,
    kktref: DVector<f64>,
    primal: DVector<f64>,
    dual: DVector<f64>,
    pub dxs: Vec<DVector<f64>>,
    pub dus: Vec<DVector<f64>>,
    pub lambdas: Vec<DVector<f64>>,
    xs: Vec<DVector<f64>>,
    us: Vec<DVector<f64>>,
    pub xs_try: Vec<DVector<f64>>,
    pub us_try: Vec<DVector<f64>>,
    is_feasible: bool,
    pub cost: f64,
    pub cost_try: f64,
}

impl KktSolver {
    pub fn new(problem: ShootingProblem) -> Self {
        let ndx_total: usize = problem.models().map(|m| m.ndx()).sum();
        let nu_total: usize = problem.running_models.iter().map(|m| m.nu()).sum();
        let nd = 2 * ndx_total + nu_total;
        let xs = problem.models().map(|m| m.state().zero()).collect();
        let us = problem
            .running_models
            .iter()
            .map(|m| DVector::zeros(m.nu()))
            .collect();
        Self {
            problem,
            settings: SolverSettings {
                th_grad: 1e-9,
                ..SolverSettings::default()
            },
            ndx_total,
            nu_total,
            kkt: DMatrix::zeros(nd, nd),
            kktref: DVector::zeros(nd),
            primal: DVector::zeros(ndx_total + nu_total),
            dual: DVector::zeros(ndx_total),
            dxs: Vec::new(),
            dus: Vec::new(),
            lambdas: Vec::new(),
            xs,
            us,
            xs_try: Vec::new(),
            us_try: Vec::new(),
            is_feasible: false,
            cost: f64::NAN,
            cost_try: f64::NAN,
        }
    }

    /// Stationarity and feasibility residuals of the constrained Lagrangian,
    /// assembled blockwise along the horizon from the last direction
    /// computation: `(|grad + J' lambda|^2, |c|^2)`.
    pub fn stopping_terms(&self) -> (f64, f64) {
        let n = self.ndx_total + self.nu_total;
        let mut stationarity = self.kktref.rows(0, n).into_owned();
        let mut ix = 0;
        let mut iu = 0;
        for (t, (model, data)) in self
            .problem
            .running_models
            .iter()
            .zip(&self.problem.running_datas)
            .enumerate()
        {
            let (ndx, nu) = (model.ndx(), model.nu());
            let lk = &self.lambdas[t];
            let lk_next = &self.lambdas[t + 1];
            let mut xblock = stationarity.rows_mut(ix, ndx);
            xblock += lk - data.fx.tr_mul(lk_next);
            let mut ublock = stationarity.rows_mut(self.ndx_total + iu, nu);
            ublock -= data.fu.tr_mul(lk_next);
            ix += ndx;
            iu += nu;
        }
        let terminal_ndx = self.problem.terminal_model.ndx();
        let mut xblock = stationarity.rows_mut(ix, terminal_ndx);
        xblock += self.lambdas.last().expect("direction computed");

        let feasibility = self.kktref.rows(n, self.ndx_total).norm_squared();
        (stationarity.norm_squared(), feasibility)
    }
}

impl ShootingSolver for KktSolver {
    fn problem(&self) -> &ShootingProblem {
        &self.problem
    }

    fn settings(&self) -> &SolverSettings {
        &self.settings
    }

    fn xs(&self) -> &[DVector<f64>] {
        &self.xs
    }

    fn us(&self) -> &[DVector<f64>] {
        &self.us
    }

    fn is_feasible(&self) -> bool {
        self.is_feasible
    }

    fn set_candidate(
        &mut self,
        xs: Option<Vec<DVector<f64>>>,
        us: Option<Vec<DVector<f64>>>,
        is_feasible: bool,
    ) -> Result<()> {
        let xs = xs.unwrap_or_else(|| self.problem.models().map(|m| m.state().zero()).collect());
        let us = us.unwrap_or_else(|| {
            self.problem
                .running_models
                .iter()
                .map(|m| DVector::zeros(m.nu()))
                .collect()
        });
        if xs.len() != self.problem.horizon() + 1 {
            bail!(
                "State trajectory length mismatch. Expected {}, got {}.",
                self.problem.horizon() + 1,
                xs.len()
            );
        }
        if us.len() != self.problem.horizon() {
            bail!(
                "Control trajectory length mismatch. Expected {}, got {}.",
                self.problem.horizon(),
                us.len()
            );
        }
        self.xs = xs;
        self.us = us;
        self.is_feasible = is_feasible;
        Ok(())
    }

    fn calc(&mut self) -> Result<f64> {
        self.cost = self.problem.calc_diff(&self.xs, &self.us)?;

        let n = self.ndx_total + self.nu_total;
        self.kkt.fill(0.0);
        self.kktref.fill(0.0);

        // Diagonal identities of the constraint Jacobian: the initial-state
        // anchor on dx_0 and each dynamics row on its dx_{t+1} slot.
        self.kkt
            .view_mut((n, 0), (self.ndx_total, self.ndx_total))
            .fill_diagonal(1.0);

        let cx0 = self.problem.running_models[0].ndx();
        let mut ix = 0;
        let mut iu = 0;
        for (t, (model, data)) in self
            .problem
            .running_models
            .iter()
            .zip(&self.problem.running_datas)
            .enumerate()
        {
            let (ndx, nu) = (model.ndx(), model.nu());
            self.kkt.view_mut((ix, ix), (ndx, ndx)).copy_from(&data.lxx);
            self.kkt
                .view_mut((ix, self.ndx_total + iu), (ndx, nu))
                .copy_from(&data.lxu);
            self.kkt
                .view_mut((self.ndx_total + iu, ix), (nu, ndx))
                .copy_from(&data.lxu.transpose());
            self.kkt
                .view_mut(
                    (self.ndx_total + iu, self.ndx_total + iu),
                    (nu, nu),
                )
                .copy_from(&data.luu);

            self.kktref.rows_mut(ix, ndx).copy_from(&data.lx);
            self.kktref
                .rows_mut(self.ndx_total + iu, nu)
                .copy_from(&data.lu);

            self.kkt
                .view_mut((n + cx0 + ix, ix), (ndx, ndx))
                .copy_from(&(-&data.fx));
            self.kkt
                .view_mut((n + cx0 + ix, self.ndx_total + iu), (ndx, nu))
                .copy_from(&(-&data.fu));

            // Constraint value: gap between the predicted next state and the
            // guessed one, expressed in the tangent space at the prediction.
            let gap = model.state().diff(&data.xnext, &self.xs[t + 1]);
            self.kktref.rows_mut(n + cx0 + ix, ndx).copy_from(&gap);

            ix += ndx;
            iu += nu;
        }

        let terminal_ndx = self.problem.terminal_model.ndx();
        self.kkt
            .view_mut((ix, ix), (terminal_ndx, terminal_ndx))
            .copy_from(&self.problem.terminal_data.lxx);
        self.kktref
            .rows_mut(ix, terminal_ndx)
            .copy_from(&self.problem.terminal_data.lx);

        let anchor = self.problem.running_models[0]
            .state()
            .diff(&self.problem.initial_state, &self.xs[0]);
        self.kktref.rows_mut(n, cx0).copy_from(&anchor);

        // Mirror the constraint Jacobian into the upper-right block so the
        // full matrix stays symmetric.
        let jac_t = self
            .kkt
            .view((n, 0), (self.ndx_total, n))
            .into_owned()
            .transpose();
        self.kkt
            .view_mut((0, n), (n, self.ndx_total))
            .copy_from(&jac_t);

        Ok(self.cost)
    }

    fn compute_direction(&mut self, recalc: bool) -> Result<()> {
        if recalc {
            self.calc()?;
        }
        let rhs = -&self.kktref;
        let primaldual = self
            .kkt
            .clone()
            .lu()
            .solve(&rhs)
            .ok_or(SolverError::SingularKkt)?;

        let n = self.ndx_total + self.nu_total;
        self.primal = primaldual.rows(0, n).into_owned();
        self.dual = primaldual.rows(n, self.ndx_total).into_owned();

        self.dxs.clear();
        self.dus.clear();
        self.lambdas.clear();
        let mut ix = 0;
        let mut iu = 0;
        for model in &self.problem.running_models {
            let (ndx, nu) = (model.ndx(), model.nu());
            self.dxs.push(self.primal.rows(ix, ndx).into_owned());
            self.dus
                .push(self.primal.rows(self.ndx_total + iu, nu).into_owned());
            self.lambdas.push(self.dual.rows(ix, ndx).into_owned());
            ix += ndx;
            iu += nu;
        }
        let terminal_ndx = self.problem.terminal_model.ndx();
        self.dxs.push(self.primal.rows(ix, terminal_ndx).into_owned());
        self.lambdas.push(self.dual.rows(ix, terminal_ndx).into_owned());
        Ok(())
    }

    fn try_step(&mut self, step_length: f64) -> Result<f64> {
        self.xs_try = self
            .problem
            .models()
            .zip(self.xs.iter().zip(&self.dxs))
            .map(|(model, (x, dx))| model.state().integrate(x, &(dx * step_length)))
            .collect();
        self.us_try = self
            .us
            .iter()
            .zip(&self.dus)
            .map(|(u, du)| u + du * step_length)
            .collect();
        self.cost_try = self.problem.calc(&self.xs_try, &self.us_try)?;
        Ok(self.cost - self.cost_try)
    }

    fn accept_candidate(&mut self) {
        std::mem::swap(&mut self.xs, &mut self.xs_try);
        std::mem::swap(&mut self.us, &mut self.us_try);
        self.cost = self.cost_try;
        self.is_feasible = true;
    }

    fn expected_improvement(&self) -> (f64, f64) {
        let n = self.ndx_total + self.nu_total;
        let grad = self.kktref.rows(0, n);
        let hess = self.kkt.view((0, 0), (n, n));
        let d1 = -grad.dot(&self.primal);
        let d2 = -(&hess * &self.primal).dot(&self.primal);
        (d1, d2)
    }

    fn stopping_criteria(&self) -> f64 {
        let (stationarity, feasibility) = self.stopping_terms();
        stationarity + feasibility
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionModel;
    use crate::models::{LqrModel, UnicycleModel};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::rc::Rc;

    fn unicycle_problem(horizon: usize, x0: DVector<f64>) -> ShootingProblem {
        let model: Rc<dyn ActionModel> = Rc::new(UnicycleModel::new());
        ShootingProblem::new(x0, vec![model.clone(); horizon], model)
            .expect("consistent dimensions")
    }

    fn lqr_problem(
        nx: usize,
        nu: usize,
        horizon: usize,
        x0: DVector<f64>,
        rng: &mut StdRng,
    ) -> (ShootingProblem, Rc<LqrModel>) {
        let model = Rc::new(LqrModel::random(nx, nu, rng));
        let dyn_model: Rc<dyn ActionModel> = model.clone();
        let problem = ShootingProblem::new(x0, vec![dyn_model.clone(); horizon], dyn_model)
            .expect("consistent dimensions");
        (problem, model)
    }

    fn rand_vec(n: usize, rng: &mut StdRng) -> DVector<f64> {
        DVector::from_fn(n, |_, _| rng.gen::<f64>())
    }

    #[test]
    fn kkt_matrix_is_symmetric_with_expected_inertia() {
        let problem = unicycle_problem(2, DVector::from_vec(vec![1.0, 1.0, 1.0]));
        let mut kkt = KktSolver::new(problem);
        kkt.set_candidate(None, None, false).unwrap();
        kkt.calc().unwrap();

        let n = kkt.ndx_total + kkt.nu_total;
        let hess = kkt.kkt.view((0, 0), (n, n)).into_owned();
        assert!((&hess - hess.transpose()).norm() < 1e-9);
        assert!((&kkt.kkt - kkt.kkt.transpose()).norm() < 1e-9);

        let eigenvalues = kkt.kkt.clone().symmetric_eigen().eigenvalues;
        let positive = eigenvalues.iter().filter(|&&l| l > 0.0).count();
        let negative = eigenvalues.iter().filter(|&&l| l < 0.0).count();
        assert_eq!(positive, kkt.ndx_total + kkt.nu_total);
        assert_eq!(negative, kkt.ndx_total);
    }

    #[test]
    fn direction_respects_the_initial_state_anchor() {
        let x0 = DVector::from_vec(vec![1.0, 1.0, 1.0]);
        let problem = unicycle_problem(2, x0.clone());
        let mut kkt = KktSolver::new(problem);

        // From the zero candidate the first correction must be the anchor.
        kkt.set_candidate(None, None, false).unwrap();
        kkt.compute_direction(true).unwrap();
        assert!((&kkt.dxs[0] - &x0).norm() < 1e-9);

        // From a random candidate, x0 + dx0 must land on the anchor.
        let mut rng = StdRng::seed_from_u64(220);
        let xs: Vec<DVector<f64>> = (0..3).map(|_| rand_vec(3, &mut rng)).collect();
        let us: Vec<DVector<f64>> = (0..2).map(|_| rand_vec(2, &mut rng)).collect();
        kkt.set_candidate(Some(xs.clone()), Some(us), false).unwrap();
        kkt.compute_direction(true).unwrap();
        assert!((&xs[0] + &kkt.dxs[0] - &x0).norm() < 1e-9);
    }

    #[test]
    fn lqr_direction_satisfies_the_linearized_dynamics() {
        let mut rng = StdRng::seed_from_u64(220);
        let (problem, model) = lqr_problem(3, 2, 2, DVector::from_element(3, 1.0), &mut rng);
        let mut kkt = KktSolver::new(problem);

        let xs: Vec<DVector<f64>> = (0..3).map(|_| rand_vec(3, &mut rng)).collect();
        let us: Vec<DVector<f64>> = (0..2).map(|_| rand_vec(2, &mut rng)).collect();
        kkt.set_candidate(Some(xs.clone()), Some(us.clone()), false)
            .unwrap();
        kkt.compute_direction(true).unwrap();

        let mut data = model.create_data();
        for t in 0..2 {
            let x_new = &xs[t] + &kkt.dxs[t];
            let u_new = &us[t] + &kkt.dus[t];
            model.calc(&mut data, &x_new, Some(&u_new));
            let next = &xs[t + 1] + &kkt.dxs[t + 1];
            assert!(
                (&data.xnext - next).norm() < 1e-9,
                "LQR Newton step must satisfy the (linear) dynamics at step {t}"
            );
        }
    }

    #[test]
    fn lqr_converges_in_at_most_two_iterations() {
        let mut rng = StdRng::seed_from_u64(220);
        let (problem, model) = lqr_problem(3, 3, 1, DVector::from_element(3, 2.0), &mut rng);
        let mut kkt = KktSolver::new(problem);

        let init_xs: Vec<DVector<f64>> = (0..2).map(|_| rand_vec(3, &mut rng)).collect();
        let init_us: Vec<DVector<f64>> = (0..1).map(|_| rand_vec(3, &mut rng)).collect();
        let (xs, us, converged) = kkt
            .solve(2, Some(init_xs), Some(init_us), false)
            .expect("valid candidate");
        assert!(converged, "KKT must converge on an LQR problem in <= 2 iterations");

        let mut data = model.create_data();
        for t in 0..1 {
            model.calc(&mut data, &xs[t], Some(&us[t]));
            assert!((&data.xnext - &xs[t + 1]).norm() < 1e-9);
        }
    }

    #[test]
    fn expected_improvement_is_exact_for_lqr_steps() {
        let mut rng = StdRng::seed_from_u64(220);
        let (problem, _) = lqr_problem(3, 2, 1, DVector::from_element(3, 2.0), &mut rng);
        let mut kkt = KktSolver::new(problem);

        let us: Vec<DVector<f64>> = (0..1).map(|_| rand_vec(2, &mut rng)).collect();
        let xs = kkt.problem.rollout(&us).unwrap();
        kkt.set_candidate(Some(xs), Some(us), true).unwrap();
        kkt.compute_direction(true).unwrap();
        let (d1, d2) = kkt.expected_improvement();

        for &a in &[1.0, 0.1, 0.01] {
            let dv = kkt.try_step(a).unwrap();
            assert!(
                (dv - (d1 * a + 0.5 * d2 * a * a)).abs() < 1e-9,
                "quadratic model must be exact on LQR at alpha = {a}"
            );
        }
    }

    #[test]
    fn stopping_criteria_vanish_at_the_optimum() {
        let mut rng = StdRng::seed_from_u64(220);
        let (problem, _) = lqr_problem(3, 3, 1, DVector::from_element(3, 2.0), &mut rng);
        let mut kkt = KktSolver::new(problem);

        let (xs, us, converged) = kkt.solve(10, None, None, false).expect("valid candidate");
        assert!(converged);

        kkt.set_candidate(Some(xs), Some(us), true).unwrap();
        kkt.compute_direction(true).unwrap();
        let (stationarity, feasibility) = kkt.stopping_terms();
        assert!(stationarity < 1e-9);
        assert!(feasibility < 1e-9);
    }

    #[test]
    fn qp_solution_is_optimal_in_the_constraint_null_space() {
        let mut rng = StdRng::seed_from_u64(220);
        let problem = unicycle_problem(2, DVector::from_vec(vec![1.0, 1.0, 1.0]));
        let mut kkt = KktSolver::new(problem);

        let xs: Vec<DVector<f64>> = (0..3).map(|_| rand_vec(3, &mut rng)).collect();
        let us: Vec<DVector<f64>> = (0..2).map(|_| rand_vec(2, &mut rng)).collect();
        kkt.set_candidate(Some(xs), Some(us), false).unwrap();
        kkt.compute_direction(true).unwrap();

        let n = kkt.ndx_total + kkt.nu_total;
        let hess = kkt.kkt.view((0, 0), (n, n)).into_owned();
        let grad = kkt.kktref.rows(0, n).into_owned();
        let jac = kkt.kkt.view((n, 0), (kkt.ndx_total, n)).into_owned();
        let jac_pinv = jac.clone().pseudo_inverse(1e-10).expect("full row rank");

        let qp_cost =
            |p: &DVector<f64>| (0.5 * (&hess * p) + &grad).dot(p);
        let optimum = qp_cost(&kkt.primal);
        for _ in 0..100 {
            let eps = DVector::from_fn(n, |_, _| rng.gen::<f64>() * 0.1);
            let projected = &eps - &jac_pinv * (&jac * &eps);
            let perturbed = qp_cost(&(&kkt.primal + &projected));
            assert!(
                optimum <= perturbed + 1e-9,
                "primal must minimize the QP over the constraint null space"
            );
        }
    }

    #[test]
    fn unicycle_reaches_the_origin() {
        // Running cost penalizes controls heavily, terminal cost the state.
        let mut runcost = UnicycleModel::new();
        runcost.cost_weights[1] = 10.0;
        let mut termcost = UnicycleModel::new();
        termcost.cost_weights[0] = 1000.0;
        let running: Rc<dyn ActionModel> = Rc::new(runcost);
        let terminal: Rc<dyn ActionModel> = Rc::new(termcost);
        let problem = ShootingProblem::new(
            DVector::from_vec(vec![1.0, 0.0, 3.0]),
            vec![running; 10],
            terminal,
        )
        .expect("consistent dimensions");

        let mut kkt = KktSolver::new(problem);
        let (xs, _us, _converged) = kkt.solve(100, None, None, false).expect("valid candidate");
        assert!(
            xs.last().unwrap().norm() < 1e-2,
            "terminal weight must drive the final state to the origin"
        );
    }

    #[test]
    fn rejects_bad_trajectory_lengths() {
        let problem = unicycle_problem(2, DVector::zeros(3));
        let mut kkt = KktSolver::new(problem);
        let err = kkt
            .set_candidate(Some(vec![DVector::zeros(3); 2]), None, false)
            .expect_err("xs must have T + 1 entries");
        assert!(err.to_string().contains("length mismatch"));
        let err = kkt
            .set_candidate(None, Some(vec![DVector::zeros(2); 3]), false)
            .expect_err("us must have T entries");
        assert!(err.to_string().contains("length mismatch"));
    }
}
