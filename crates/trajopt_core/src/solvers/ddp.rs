use anyhow::{bail, Result};
use nalgebra::{DMatrix, DVector};

use crate::error::SolverError;
use crate::problem::ShootingProblem;
use crate::solvers::{ShootingSolver, SolverSettings};
use crate::state::StateSpace;

/// Differential Dynamic Programming solver: a Riccati backward sweep computes
/// feedback gains and a feedforward term, a forward rollout applies them
/// under the true dynamics.
///
/// When the candidate is not feasible the backward pass folds the defect
/// between the predicted and the guessed next state into `Qx`/`Qu`
/// (relinearization), which makes the sweep equivalent to the KKT Newton
/// step on the linearized dynamics even for non-rolled-out warm starts.
pub struct DdpSolver {
    problem: ShootingProblem,
    pub settings: SolverSettings,
    xs: Vec<DVector<f64>>,
    us: Vec<DVector<f64>>,
    pub xs_try: Vec<DVector<f64>>,
    pub us_try: Vec<DVector<f64>>,
    is_feasible: bool,
    pub cost: f64,
    pub cost_try: f64,
    pub vx: Vec<DVector<f64>>,
    pub vxx: Vec<DMatrix<f64>>,
    pub qx: Vec<DVector<f64>>,
    pub qu: Vec<DVector<f64>>,
    pub qxx: Vec<DMatrix<f64>>,
    pub qxu: Vec<DMatrix<f64>>,
    pub quu: Vec<DMatrix<f64>>,
    /// Feedforward terms, one per running step.
    pub k: Vec<DVector<f64>>,
    /// Feedback gain matrices (`nu x ndx`), one per running step.
    pub gains: Vec<DMatrix<f64>>,
}

impl DdpSolver {
    pub fn new(problem: ShootingProblem) -> Self {
        // Workspace shapes are fixed by the problem; reallocate only by
        // rebuilding the solver.
        let vx = problem.models().map(|m| DVector::zeros(m.ndx())).collect();
        let vxx = problem
            .models()
            .map(|m| DMatrix::zeros(m.ndx(), m.ndx()))
            .collect();
        let running = &problem.running_models;
        let qx = running.iter().map(|m| DVector::zeros(m.ndx())).collect();
        let qu = running.iter().map(|m| DVector::zeros(m.nu())).collect();
        let qxx = running
            .iter()
            .map(|m| DMatrix::zeros(m.ndx(), m.ndx()))
            .collect();
        let qxu = running
            .iter()
            .map(|m| DMatrix::zeros(m.ndx(), m.nu()))
            .collect();
        let quu = running
            .iter()
            .map(|m| DMatrix::zeros(m.nu(), m.nu()))
            .collect();
        let k = running.iter().map(|m| DVector::zeros(m.nu())).collect();
        let gains = running
            .iter()
            .map(|m| DMatrix::zeros(m.nu(), m.ndx()))
            .collect();
        let xs = problem.models().map(|m| m.state().zero()).collect();
        let us = running.iter().map(|m| DVector::zeros(m.nu())).collect();
        Self {
            problem,
            settings: SolverSettings::default(),
            xs,
            us,
            xs_try: Vec::new(),
            us_try: Vec::new(),
            is_feasible: false,
            cost: f64::NAN,
            cost_try: f64::NAN,
            vx,
            vxx,
            qx,
            qu,
            qxx,
            qxu,
            quu,
            k,
            gains,
        }
    }

    fn backward_pass(&mut self) -> Result<()> {
        let horizon = self.problem.horizon();
        self.vx[horizon] = self.problem.terminal_data.lx.clone();
        self.vxx[horizon] = self.problem.terminal_data.lxx.clone();

        for t in (0..horizon).rev() {
            let model = &self.problem.running_models[t];
            let data = &self.problem.running_datas[t];
            let vx_next = &self.vx[t + 1];
            let vxx_next = &self.vxx[t + 1];

            let fx_t_v = data.fx.tr_mul(vxx_next);
            self.qxx[t] = &data.lxx + &fx_t_v * &data.fx;
            self.qxu[t] = &data.lxu + &fx_t_v * &data.fu;
            self.quu[t] = &data.luu + data.fu.tr_mul(vxx_next) * &data.fu;
            self.qx[t] = &data.lx + data.fx.tr_mul(vx_next);
            self.qu[t] = &data.lu + data.fu.tr_mul(vx_next);

            if !self.is_feasible {
                // Defect between the guessed and the predicted next state;
                // folding it here is what keeps the sweep exact under
                // infeasible warm starts.
                let gap = model.state().diff(&self.xs[t + 1], &data.xnext);
                let relinearization = vxx_next * gap;
                self.qx[t] += data.fx.tr_mul(&relinearization);
                self.qu[t] += data.fu.tr_mul(&relinearization);
            }

            let quu_lu = self.quu[t].clone().lu();
            self.gains[t] = quu_lu
                .solve(&self.qxu[t].transpose())
                .ok_or(SolverError::SingularQuu { t })?;
            self.k[t] = quu_lu
                .solve(&self.qu[t])
                .ok_or(SolverError::SingularQuu { t })?;

            self.vx[t] = &self.qx[t] - self.gains[t].tr_mul(&self.qu[t]);
            self.vxx[t] = &self.qxx[t] - &self.qxu[t] * &self.gains[t];
        }
        Ok(())
    }

    fn forward_pass(&mut self, step_length: f64) -> f64 {
        let horizon = self.problem.horizon();
        let mut xs_try = Vec::with_capacity(horizon + 1);
        xs_try.push(self.problem.initial_state.clone());
        let mut us_try = Vec::with_capacity(horizon);
        let mut cost_try = 0.0;
        for t in 0..horizon {
            let model = &self.problem.running_models[t];
            let feedback = model.state().diff(&self.xs[t], &xs_try[t]);
            let u = &self.us[t] - &self.k[t] * step_length - &self.gains[t] * feedback;
            cost_try += model.calc(&mut self.problem.running_datas[t], &xs_try[t], Some(&u));
            xs_try.push(self.problem.running_datas[t].xnext.clone());
            us_try.push(u);
        }
        cost_try += self.problem.terminal_model.calc(
            &mut self.problem.terminal_data,
            &xs_try[horizon],
            None,
        );
        self.xs_try = xs_try;
        self.us_try = us_try;
        self.cost_try = cost_try;
        cost_try
    }
}

impl ShootingSolver for DdpSolver {
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
        Ok(self.cost)
    }

    fn compute_direction(&mut self, recalc: bool) -> Result<()> {
        if recalc {
            self.calc()?;
        }
        self.backward_pass()
    }

    fn try_step(&mut self, step_length: f64) -> Result<f64> {
        self.forward_pass(step_length);
        Ok(self.cost - self.cost_try)
    }

    fn accept_candidate(&mut self) {
        std::mem::swap(&mut self.xs, &mut self.xs_try);
        std::mem::swap(&mut self.us, &mut self.us_try);
        self.cost = self.cost_try;
        self.is_feasible = true;
    }

    fn expected_improvement(&self) -> (f64, f64) {
        let d1 = self
            .qu
            .iter()
            .zip(&self.k)
            .map(|(qu, k)| qu.dot(k))
            .sum();
        let d2 = -self
            .quu
            .iter()
            .zip(&self.k)
            .map(|(quu, k)| k.dot(&(quu * k)))
            .sum::<f64>();
        (d1, d2)
    }

    fn stopping_criteria(&self) -> f64 {
        self.qu.iter().map(|qu| qu.norm_squared()).sum()
    }
}
