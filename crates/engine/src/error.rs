use spiketune_solver::SolverError;
use thiserror::Error;

/// Host-side error taxonomy. Solver failures pass through; ingress and
/// schema problems gate the session before any solver sees the data.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("worker pool unavailable: {0}")]
    WorkerUnavailable(String),

    #[error("input format: {0}")]
    IoFormat(String),

    #[error("unsupported schema version {found} (expected {expected})")]
    SchemaVersion { found: String, expected: String },

    #[error("serialization: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Solver(#[from] SolverError),
}
