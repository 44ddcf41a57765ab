use thiserror::Error;

/// Errors surfaced by the numeric core.
///
/// `InvalidParams` and `DimensionMismatch` are caller mistakes and leave the
/// solver untouched. `NumericNonFinite` means the iteration itself produced
/// NaN/Inf; the solver halts and must be re-initialised before the next solve.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SolverError {
    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    #[error("dimension mismatch: {0}")]
    DimensionMismatch(String),

    #[error("non-finite value produced at iteration {iteration}")]
    NumericNonFinite { iteration: u32 },
}
