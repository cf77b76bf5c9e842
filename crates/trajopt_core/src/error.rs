use thiserror::Error;

/// Numerical failure modes of the trajectory solvers. Shape violations are
/// reported through `anyhow` at the call site instead; these are the
/// conditions a caller may want to match on.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SolverError {
    #[error("KKT system is singular")]
    SingularKkt,
    #[error("Quu is not invertible at step {t}")]
    SingularQuu { t: usize },
}
