use std::rc::Rc;

use anyhow::{bail, Result};
use nalgebra::DVector;

use crate::action::{ActionData, ActionModel};

/// Multiple-shooting formulation of an optimal control problem: a fixed
/// initial state, `T` running action models and a terminal model, with one
/// exclusively-owned [`ActionData`] per slot. Models are shared references
/// and never mutated.
pub struct ShootingProblem {
    pub initial_state: DVector<f64>,
    pub running_models: Vec<Rc<dyn ActionModel>>,
    pub running_datas: Vec<ActionData>,
    pub terminal_model: Rc<dyn ActionModel>,
    pub terminal_data: ActionData,
}

impl std::fmt::Debug for ShootingProblem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShootingProblem")
            .field("initial_state", &self.initial_state)
            .field("num_running_models", &self.running_models.len())
            .field("running_datas", &self.running_datas)
            .field("terminal_data", &self.terminal_data)
            .finish()
    }
}

impl ShootingProblem {
    pub fn new(
        initial_state: DVector<f64>,
        running_models: Vec<Rc<dyn ActionModel>>,
        terminal_model: Rc<dyn ActionModel>,
    ) -> Result<Self> {
        if running_models.is_empty() {
            bail!("A shooting problem needs at least one running model.");
        }
        if initial_state.len() != running_models[0].nx() {
            bail!(
                "Initial state dimension mismatch. Expected {}, got {}.",
                running_models[0].nx(),
                initial_state.len()
            );
        }
        let running_datas = running_models.iter().map(|m| m.create_data()).collect();
        let terminal_data = terminal_model.create_data();
        Ok(Self {
            initial_state,
            running_models,
            running_datas,
            terminal_model,
            terminal_data,
        })
    }

    /// Horizon length `T` (number of running steps).
    pub fn horizon(&self) -> usize {
        self.running_models.len()
    }

    /// Running models followed by the terminal model (`T + 1` entries).
    pub fn models(&self) -> impl Iterator<Item = &dyn ActionModel> {
        self.running_models
            .iter()
            .map(|m| m.as_ref())
            .chain(std::iter::once(self.terminal_model.as_ref()))
    }

    fn check_lengths(&self, xs: &[DVector<f64>], us: &[DVector<f64>]) -> Result<()> {
        if xs.len() != self.horizon() + 1 {
            bail!(
                "State trajectory length mismatch. Expected {}, got {}.",
                self.horizon() + 1,
                xs.len()
            );
        }
        if us.len() != self.horizon() {
            bail!(
                "Control trajectory length mismatch. Expected {}, got {}.",
                self.horizon(),
                us.len()
            );
        }
        Ok(())
    }

    /// Total cost of the candidate pair `(xs, us)`: running costs plus the
    /// terminal cost. The dynamics are evaluated but not enforced.
    pub fn calc(&mut self, xs: &[DVector<f64>], us: &[DVector<f64>]) -> Result<f64> {
        self.check_lengths(xs, us)?;
        let horizon = self.horizon();
        let mut cost = 0.0;
        for (t, (model, data)) in self
            .running_models
            .iter()
            .zip(self.running_datas.iter_mut())
            .enumerate()
        {
            cost += model.calc(data, &xs[t], Some(&us[t]));
        }
        cost += self
            .terminal_model
            .calc(&mut self.terminal_data, &xs[horizon], None);
        Ok(cost)
    }

    /// Evaluate cost and dynamics together with all derivative blocks along
    /// `(xs, us)`, populating every running data and the terminal data.
    pub fn calc_diff(&mut self, xs: &[DVector<f64>], us: &[DVector<f64>]) -> Result<f64> {
        self.check_lengths(xs, us)?;
        let horizon = self.horizon();
        let mut cost = 0.0;
        for (t, (model, data)) in self
            .running_models
            .iter()
            .zip(self.running_datas.iter_mut())
            .enumerate()
        {
            cost += model.calc_diff(data, &xs[t], Some(&us[t]));
        }
        cost += self
            .terminal_model
            .calc_diff(&mut self.terminal_data, &xs[horizon], None);
        Ok(cost)
    }

    /// Integrate the dynamics from the initial state under the given control
    /// trajectory, producing a feasible state trajectory of `T + 1` entries.
    pub fn rollout(&mut self, us: &[DVector<f64>]) -> Result<Vec<DVector<f64>>> {
        if us.len() != self.horizon() {
            bail!(
                "Control trajectory length mismatch. Expected {}, got {}.",
                self.horizon(),
                us.len()
            );
        }
        let mut xs = Vec::with_capacity(self.horizon() + 1);
        xs.push(self.initial_state.clone());
        for (t, (model, data)) in self
            .running_models
            .iter()
            .zip(self.running_datas.iter_mut())
            .enumerate()
        {
            model.calc(data, &xs[t], Some(&us[t]));
            xs.push(data.xnext.clone());
        }
        Ok(xs)
    }
}
