use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Worker-count clamp bounds.
pub const WORKER_COUNT_MIN: usize = 2;
pub const WORKER_COUNT_MAX: usize = 8;

/// Engine tuning knobs. Every scheduling and convergence constant is
/// overridable here; the JSON round-trip keeps one config surface across
/// hosts and tests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of solver workers, clamped to [2, 8] at pool spawn.
    pub worker_count: usize,
    /// Trailing debounce applied to parameter changes before dispatch.
    pub solve_debounce_ms: u64,
    /// Minimum spacing of intermediate result emission during a solve.
    pub intermediate_interval_ms: u64,
    /// Inner iterations per worker batch; cancellation is observed between
    /// batches.
    pub batch_size: u32,
    /// Initial per-dispatch iteration quantum under contention.
    pub quantum_initial_iterations: u32,
    /// Relative objective-change convergence tolerance.
    pub convergence_rtol: f64,
    /// Hard iteration cap per solve.
    pub max_iterations: u32,
    /// Relative τ change below which a warm start keeps the old solution.
    pub tau_change_threshold: f64,
    /// Oversampled simulation rate of the synthetic spike chain, Hz.
    pub sim_spike_hz: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            worker_count: default_worker_count(),
            solve_debounce_ms: 30,
            intermediate_interval_ms: 100,
            batch_size: 15,
            quantum_initial_iterations: 200,
            convergence_rtol: 1e-6,
            max_iterations: 2000,
            tau_change_threshold: 0.20,
            sim_spike_hz: 300.0,
        }
    }
}

impl EngineConfig {
    pub fn solve_debounce(&self) -> Duration {
        Duration::from_millis(self.solve_debounce_ms)
    }

    pub fn intermediate_interval(&self) -> Duration {
        Duration::from_millis(self.intermediate_interval_ms)
    }

    /// Worker count after the [2, 8] clamp.
    pub fn clamped_worker_count(&self) -> usize {
        self.worker_count.clamp(WORKER_COUNT_MIN, WORKER_COUNT_MAX)
    }
}

/// Hardware parallelism clamped to [2, 8].
pub fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(WORKER_COUNT_MIN)
        .clamp(WORKER_COUNT_MIN, WORKER_COUNT_MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.solve_debounce_ms, 30);
        assert_eq!(cfg.intermediate_interval_ms, 100);
        assert_eq!(cfg.batch_size, 15);
        assert_eq!(cfg.quantum_initial_iterations, 200);
        assert_eq!(cfg.max_iterations, 2000);
        assert!((cfg.tau_change_threshold - 0.20).abs() < 1e-12);
        assert!((cfg.sim_spike_hz - 300.0).abs() < 1e-12);
    }

    #[test]
    fn worker_count_is_clamped() {
        let clamp = |n| {
            EngineConfig {
                worker_count: n,
                ..EngineConfig::default()
            }
            .clamped_worker_count()
        };
        assert_eq!(clamp(1), 2);
        assert_eq!(clamp(64), 8);
        assert_eq!(clamp(4), 4);
    }

    #[test]
    fn config_round_trips_as_json() {
        let cfg = EngineConfig {
            worker_count: 3,
            solve_debounce_ms: 50,
            ..EngineConfig::default()
        };
        let json = serde_json::to_string(&cfg).unwrap();
        let back: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cfg);

        // Missing fields fall back to defaults
        let sparse: EngineConfig = serde_json::from_str(r#"{"batch_size": 7}"#).unwrap();
        assert_eq!(sparse.batch_size, 7);
        assert_eq!(sparse.max_iterations, 2000);
    }
}
