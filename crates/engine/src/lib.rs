//! Host engine for interactive calcium-trace deconvolution.
//!
//! Owns everything on the host side of the solver boundary: the worker pool
//! ([`pool::WorkerPool`]), the per-cell scheduling state
//! ([`manager::CellSolveManager`]), the warm-start cache, the synthetic demo
//! data path and the thin I/O adapters (ingress validation, settings
//! export). All engine state lives in values constructed at startup; there
//! are no globals; tests build a fresh manager per case.
//!
//! The manager is single-threaded and cooperative: drive it by calling
//! [`manager::CellSolveManager::tick`] from the host event loop. Everything
//! crossing to the workers goes through channels with moved buffers.

pub mod cache;
pub mod config;
pub mod error;
pub mod export;
pub mod ingress;
pub mod manager;
pub mod pool;
pub mod protocol;
pub mod synth;

pub use cache::{WarmStartCache, TAU_CHANGE_THRESHOLD};
pub use config::EngineConfig;
pub use error::EngineError;
pub use manager::{CellSolveManager, CellStatus, Dataset};
pub use protocol::{SolveParams, WarmStrategy};

// Solver-side constants re-exported so host configuration and the numeric
// core can never drift apart.
pub use spiketune_solver::kernel::{
    MARGIN_FACTOR_HP, MARGIN_FACTOR_LP, PADDING_TAU_MULTIPLIER,
};
pub use spiketune_solver::{CONVERGENCE_RTOL, MAX_ITERATIONS};
