//! Host ↔ worker wire types. All numeric payloads are owned vectors so a
//! send is a move: after a message crosses the channel the sending side no
//! longer holds the buffer.

use serde::{Deserialize, Serialize};

/// Full parameter set a solve runs under.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SolveParams {
    pub tau_rise: f64,
    pub tau_decay: f64,
    pub lambda: f64,
    pub fs: f64,
    pub filter_enabled: bool,
}

impl Default for SolveParams {
    fn default() -> Self {
        SolveParams {
            tau_rise: 0.02,
            tau_decay: 0.4,
            lambda: 0.01,
            fs: 30.0,
            filter_enabled: false,
        }
    }
}

/// How a worker initialises its solver for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarmStrategy {
    /// Zero initialiser.
    Cold,
    /// Restore the snapshot as-is.
    Warm,
    /// Restore the snapshot, then drop FISTA momentum (kernel changed).
    WarmNoMomentum,
}

/// One solve job. `max_iterations` is a soft quantum: the worker returns an
/// unconverged `Complete` once it is exhausted, letting the manager
/// time-slice cells across the pool.
#[derive(Debug)]
pub struct SolveRequest {
    pub job_id: u64,
    pub trace: Vec<f32>,
    pub params: SolveParams,
    pub warm_state: Option<Vec<u8>>,
    pub warm_strategy: WarmStrategy,
    pub max_iterations: Option<u32>,
}

/// Commands accepted by a worker.
#[derive(Debug)]
pub enum WorkerCommand {
    Solve(SolveRequest),
    /// Advisory but prompt: observed between iteration batches. Unknown or
    /// already-finished job ids are ignored.
    Cancel { job_id: u64 },
    Shutdown,
}

/// Messages a worker emits. Exactly one of `Complete`/`Cancelled`/`Error`
/// terminates each accepted job; `Intermediate` messages precede it.
#[derive(Debug)]
pub enum WorkerMsg {
    /// Emitted once per worker at startup.
    Ready { worker: usize },
    Intermediate {
        job_id: u64,
        solution: Vec<f32>,
        reconvolution: Vec<f32>,
        iteration: u32,
    },
    Complete {
        job_id: u64,
        solution: Vec<f32>,
        reconvolution: Vec<f32>,
        state: Vec<u8>,
        iterations: u32,
        converged: bool,
        filtered: Option<Vec<f32>>,
    },
    Cancelled { job_id: u64 },
    Error { job_id: u64, message: String },
}

impl WorkerMsg {
    /// Job this message belongs to, if any.
    pub fn job_id(&self) -> Option<u64> {
        match self {
            WorkerMsg::Ready { .. } => None,
            WorkerMsg::Intermediate { job_id, .. }
            | WorkerMsg::Complete { job_id, .. }
            | WorkerMsg::Cancelled { job_id }
            | WorkerMsg::Error { job_id, .. } => Some(*job_id),
        }
    }

    /// Whether this message ends its job.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkerMsg::Complete { .. } | WorkerMsg::Cancelled { .. } | WorkerMsg::Error { .. }
        )
    }
}
