//! The `trajopt_core` crate is a trajectory optimization engine for
//! discrete-time optimal control problems whose states may live on a smooth
//! manifold (not only R^n).
//!
//! Key components:
//! - **State spaces**: `StateSpace` (manifold abstraction with `diff`,
//!   `integrate` and their tangent maps), flat vectors and planar SE(2).
//! - **Action models**: per-step dynamics plus cost with analytical
//!   first-order and Gauss-Newton second-order derivatives (LQR and two
//!   unicycle variants), and finite-difference wrappers for validation.
//! - **Shooting problem**: the multiple-shooting bundle of an initial state,
//!   running models and a terminal model.
//! - **Solvers**: a direct sparse-free KKT solver (Newton step on the full
//!   primal-dual system) and a DDP solver (Riccati sweeps), sharing one
//!   line-search and termination rule.
pub mod action;
pub mod error;
pub mod models;
pub mod numdiff;
pub mod problem;
pub mod solvers;
pub mod state;
