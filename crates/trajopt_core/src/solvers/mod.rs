pub mod ddp;
pub mod kkt;

use anyhow::Result;
use nalgebra::DVector;
use serde::{Deserialize, Serialize};

use crate::problem::ShootingProblem;

pub use ddp::DdpSolver;
pub use kkt::KktSolver;

/// Line-search and termination configuration shared by both solvers.
///
/// `alphas` is the geometric step-length sweep; a candidate step is accepted
/// when the gradient slope `d1` is already below `th_grad`, when the current
/// trajectory is not feasible (any step helps drive feasibility), or when the
/// actual improvement exceeds `th_accept_step` times the expected quadratic
/// improvement `d1 a + d2 a^2 / 2`. The solve loop terminates once the summed
/// stopping criteria drop below `th_stop`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolverSettings {
    pub alphas: Vec<f64>,
    pub th_accept_step: f64,
    pub th_stop: f64,
    pub th_grad: f64,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            alphas: (0..7).map(|n| 10f64.powi(-n)).collect(),
            th_accept_step: 0.1,
            th_stop: 1e-9,
            th_grad: 1e-12,
        }
    }
}

/// Common surface of the trajectory solvers.
///
/// `solve` is the shared outer loop: compute a search direction, sweep the
/// step lengths until a step is accepted, and stop once the stationarity
/// measure is small enough. A direction failure (singular system) or a sweep
/// where every step is rejected terminates with `success = false`, leaving
/// the candidate at the last accepted iterate.
pub trait ShootingSolver {
    fn problem(&self) -> &ShootingProblem;

    fn settings(&self) -> &SolverSettings;

    /// Current candidate state trajectory (`T + 1` entries).
    fn xs(&self) -> &[DVector<f64>];

    /// Current candidate control trajectory (`T` entries).
    fn us(&self) -> &[DVector<f64>];

    /// Whether the candidate is known to satisfy the dynamics.
    fn is_feasible(&self) -> bool;

    /// Replace the candidate trajectories. `None` selects the defaults (the
    /// state's zero configuration and zero controls). Trajectory lengths are
    /// validated against the problem horizon.
    fn set_candidate(
        &mut self,
        xs: Option<Vec<DVector<f64>>>,
        us: Option<Vec<DVector<f64>>>,
        is_feasible: bool,
    ) -> Result<()>;

    /// Evaluate the derivatives of the problem along the candidate and
    /// refresh the solver's linearization. Returns the candidate cost.
    fn calc(&mut self) -> Result<f64>;

    /// Compute the descent direction, running [`ShootingSolver::calc`] first
    /// when `recalc` is set.
    fn compute_direction(&mut self, recalc: bool) -> Result<()>;

    /// Evaluate a trial point at the given step length, storing it as the
    /// pending trial pair. Returns the cost improvement `cost - cost_try`.
    fn try_step(&mut self, step_length: f64) -> Result<f64>;

    /// Promote the pending trial pair to the current candidate. The candidate
    /// is relabeled feasible, matching the forward integration both solvers
    /// perform while stepping.
    fn accept_candidate(&mut self);

    /// Expected-improvement model `(d1, d2)`: the predicted cost change at
    /// step length `a` is `d1 a + d2 a^2 / 2`.
    fn expected_improvement(&self) -> (f64, f64);

    /// Summed stationarity measure from the last direction computation.
    fn stopping_criteria(&self) -> f64;

    fn solve(
        &mut self,
        maxiter: usize,
        init_xs: Option<Vec<DVector<f64>>>,
        init_us: Option<Vec<DVector<f64>>>,
        is_feasible: bool,
    ) -> Result<(Vec<DVector<f64>>, Vec<DVector<f64>>, bool)> {
        self.set_candidate(init_xs, init_us, is_feasible)?;
        for _ in 0..maxiter {
            if self.compute_direction(true).is_err() {
                return Ok((self.xs().to_vec(), self.us().to_vec(), false));
            }
            let (d1, d2) = self.expected_improvement();

            let alphas = self.settings().alphas.clone();
            let th_accept_step = self.settings().th_accept_step;
            let th_grad = self.settings().th_grad;
            let mut accepted = false;
            for a in alphas {
                let dv = match self.try_step(a) {
                    Ok(dv) if dv.is_finite() => dv,
                    _ => continue,
                };
                let dv_expected = a * (d1 + 0.5 * d2 * a);
                if d1 < th_grad || !self.is_feasible() || dv > th_accept_step * dv_expected {
                    self.accept_candidate();
                    accepted = true;
                    break;
                }
            }
            if !accepted {
                return Ok((self.xs().to_vec(), self.us().to_vec(), false));
            }

            if self.stopping_criteria() < self.settings().th_stop {
                return Ok((self.xs().to_vec(), self.us().to_vec(), true));
            }
        }
        Ok((self.xs().to_vec(), self.us().to_vec(), false))
    }
}
