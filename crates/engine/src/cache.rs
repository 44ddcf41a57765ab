//! Per-cell warm-start cache. One entry per cell, overwritten on each
//! completed solve; the classifier decides whether a new dispatch can reuse
//! the cached solver state and in what form.

use crate::protocol::{SolveParams, WarmStrategy};
use spiketune_solver::window::WindowPlan;
use std::collections::HashMap;

/// Default relative τ change below which a snapshot is still useful with
/// momentum dropped. Exposed so tests can override it through the config.
pub const TAU_CHANGE_THRESHOLD: f64 = 0.20;

/// Cached result of one completed solve.
#[derive(Debug, Clone)]
pub struct WarmStartEntry {
    pub state: Vec<u8>,
    pub params: SolveParams,
    pub window: WindowPlan,
}

#[derive(Debug)]
pub struct WarmStartCache {
    entries: HashMap<usize, WarmStartEntry>,
    tau_change_threshold: f64,
}

impl WarmStartCache {
    pub fn new(tau_change_threshold: f64) -> Self {
        WarmStartCache {
            entries: HashMap::new(),
            tau_change_threshold,
        }
    }

    /// Pick the warm-start strategy for re-solving `cell` under new
    /// parameters and window:
    ///
    /// - no entry, changed window, changed fs, toggled filter, or τ moved
    ///   by ≥ the threshold → `Cold`
    /// - τ unchanged (λ-only change, or nothing changed) → `Warm`
    /// - both τ within the threshold relative change → `WarmNoMomentum`
    pub fn classify(
        &self,
        cell: usize,
        params: &SolveParams,
        window: &WindowPlan,
    ) -> WarmStrategy {
        let Some(entry) = self.entries.get(&cell) else {
            return WarmStrategy::Cold;
        };

        if entry.window != *window
            || entry.params.fs != params.fs
            || entry.params.filter_enabled != params.filter_enabled
        {
            return WarmStrategy::Cold;
        }

        if entry.params.tau_rise == params.tau_rise
            && entry.params.tau_decay == params.tau_decay
        {
            return WarmStrategy::Warm;
        }

        let rel_rise = ((params.tau_rise - entry.params.tau_rise) / entry.params.tau_rise).abs();
        let rel_decay =
            ((params.tau_decay - entry.params.tau_decay) / entry.params.tau_decay).abs();
        if rel_rise < self.tau_change_threshold && rel_decay < self.tau_change_threshold {
            WarmStrategy::WarmNoMomentum
        } else {
            WarmStrategy::Cold
        }
    }

    pub fn get(&self, cell: usize) -> Option<&WarmStartEntry> {
        self.entries.get(&cell)
    }

    pub fn store(&mut self, cell: usize, entry: WarmStartEntry) {
        self.entries.insert(cell, entry);
    }

    pub fn invalidate(&mut self, cell: usize) {
        self.entries.remove(&cell);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> SolveParams {
        SolveParams::default()
    }

    fn window() -> WindowPlan {
        WindowPlan::full(1000)
    }

    fn cache_with_entry() -> WarmStartCache {
        let mut cache = WarmStartCache::new(TAU_CHANGE_THRESHOLD);
        cache.store(
            0,
            WarmStartEntry {
                state: vec![0; 24],
                params: params(),
                window: window(),
            },
        );
        cache
    }

    #[test]
    fn no_entry_is_cold() {
        let cache = WarmStartCache::new(TAU_CHANGE_THRESHOLD);
        assert_eq!(cache.classify(0, &params(), &window()), WarmStrategy::Cold);
    }

    #[test]
    fn identical_params_and_window_is_warm() {
        let cache = cache_with_entry();
        assert_eq!(cache.classify(0, &params(), &window()), WarmStrategy::Warm);
    }

    #[test]
    fn lambda_only_change_is_warm() {
        let cache = cache_with_entry();
        let mut p = params();
        p.lambda = 0.05;
        assert_eq!(cache.classify(0, &p, &window()), WarmStrategy::Warm);
    }

    #[test]
    fn changed_window_is_cold() {
        let cache = cache_with_entry();
        let other = WindowPlan::plan(100, 900, 1000, 0.4, 30.0);
        assert_eq!(cache.classify(0, &params(), &other), WarmStrategy::Cold);
    }

    #[test]
    fn changed_fs_is_cold() {
        let cache = cache_with_entry();
        let mut p = params();
        p.fs = 60.0;
        assert_eq!(cache.classify(0, &p, &window()), WarmStrategy::Cold);
    }

    #[test]
    fn toggled_filter_is_cold() {
        let cache = cache_with_entry();
        let mut p = params();
        p.filter_enabled = true;
        assert_eq!(cache.classify(0, &p, &window()), WarmStrategy::Cold);
    }

    #[test]
    fn small_tau_change_keeps_solution_drops_momentum() {
        let cache = cache_with_entry();
        let mut p = params();
        p.tau_rise *= 1.10;
        p.tau_decay *= 0.90;
        assert_eq!(
            cache.classify(0, &p, &window()),
            WarmStrategy::WarmNoMomentum
        );
    }

    #[test]
    fn large_tau_change_is_cold() {
        let cache = cache_with_entry();
        let mut p = params();
        p.tau_decay *= 1.25;
        assert_eq!(cache.classify(0, &p, &window()), WarmStrategy::Cold);

        // One τ inside the threshold does not save it if the other is out
        let mut q = params();
        q.tau_rise *= 1.05;
        q.tau_decay *= 0.5;
        assert_eq!(cache.classify(0, &q, &window()), WarmStrategy::Cold);
    }

    #[test]
    fn threshold_is_overridable() {
        let mut cache = WarmStartCache::new(0.5);
        cache.store(
            0,
            WarmStartEntry {
                state: vec![],
                params: params(),
                window: window(),
            },
        );
        let mut p = params();
        p.tau_decay *= 1.4;
        assert_eq!(
            cache.classify(0, &p, &window()),
            WarmStrategy::WarmNoMomentum
        );
    }

    #[test]
    fn entries_overwrite_and_invalidate() {
        let mut cache = cache_with_entry();
        let mut p = params();
        p.lambda = 0.9;
        cache.store(
            0,
            WarmStartEntry {
                state: vec![1],
                params: p,
                window: window(),
            },
        );
        assert_eq!(cache.get(0).unwrap().state, vec![1]);

        cache.invalidate(0);
        assert!(cache.get(0).is_none());
    }
}
