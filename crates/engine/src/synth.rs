//! Seed-reproducible synthetic calcium traces: a two-state Markov spike
//! chain simulated at an oversampled rate, binned to the imaging frame rate,
//! convolved with the double-exponential kernel, then degraded with slow
//! sinusoidal drift and Gaussian noise. Used as the demo data path and as a
//! ground-truth fixture for diagnostics.

use crate::error::EngineError;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, LogNormal, Normal};
use spiketune_solver::kernel::build_kernel;
use spiketune_solver::SolverError;

#[derive(Debug, Clone, PartialEq)]
pub struct SynthConfig {
    pub num_frames: usize,
    pub fs: f64,
    pub tau_rise: f64,
    pub tau_decay: f64,
    /// Oversampled simulation rate of the spike chain, Hz.
    pub sim_spike_hz: f64,
    /// Per-frame probability of entering the active (bursting) state.
    pub p_activate: f64,
    /// Per-frame probability of leaving the active state.
    pub p_deactivate: f64,
    /// Per-frame spike probability while active / silent.
    pub p_spike_active: f64,
    pub p_spike_silent: f64,
    /// Log-normal amplitude spread: each frame's spike count is scaled by
    /// exp(σ·N(0,1)).
    pub amp_sigma: f64,
    /// Peak-to-noise ratio; noise σ = peak / snr.
    pub snr: f64,
    /// Drift amplitude as a fraction of the clean-trace peak.
    pub drift_amplitude: f64,
    /// Drift period is uniform in [num_frames/cycles_max, num_frames/cycles_min].
    pub drift_cycles_min: f64,
    pub drift_cycles_max: f64,
}

impl Default for SynthConfig {
    fn default() -> Self {
        SynthConfig {
            num_frames: 3000,
            fs: 30.0,
            tau_rise: 0.02,
            tau_decay: 0.4,
            sim_spike_hz: 300.0,
            p_activate: 0.02,
            p_deactivate: 0.25,
            p_spike_active: 0.6,
            p_spike_silent: 0.002,
            amp_sigma: 0.35,
            snr: 5.0,
            drift_amplitude: 0.15,
            drift_cycles_min: 2.0,
            drift_cycles_max: 8.0,
        }
    }
}

/// One simulated cell: the degraded recording, the ground-truth spike train
/// (per-frame amplitudes) and the noiseless reconvolution.
#[derive(Debug, Clone)]
pub struct CellTrace {
    pub raw: Vec<f32>,
    pub spikes: Vec<f32>,
    pub clean: Vec<f32>,
}

/// A full synthetic dataset in the row-major [cells × time] layout the
/// manager consumes, with per-cell ground truth kept for overlays.
#[derive(Debug, Clone)]
pub struct SynthDataset {
    pub data: Vec<f32>,
    pub num_cells: usize,
    pub num_frames: usize,
    pub spikes: Vec<Vec<f32>>,
    pub clean: Vec<Vec<f32>>,
}

/// Convert a per-frame probability into the per-oversampled-step probability
/// that reproduces it: p_step = 1 - (1 - p_frame)^(1/oversample).
fn per_step(p_frame: f64, oversample: usize) -> f64 {
    1.0 - (1.0 - p_frame).powf(1.0 / oversample as f64)
}

/// Simulate one cell. Fully determined by `rng`.
pub fn generate_cell(config: &SynthConfig, rng: &mut ChaCha8Rng) -> Result<CellTrace, EngineError> {
    let n = config.num_frames;
    let kernel = build_kernel(config.tau_rise, config.tau_decay, config.fs)?;

    let oversample = ((config.sim_spike_hz / config.fs).round() as usize).max(1);
    let p_activate = per_step(config.p_activate, oversample);
    let p_deactivate = per_step(config.p_deactivate, oversample);
    let p_spike_active = per_step(config.p_spike_active, oversample);
    let p_spike_silent = per_step(config.p_spike_silent, oversample);

    // 1+2. Markov chain at the oversampled rate, spike counts binned per frame
    let mut counts = vec![0u32; n];
    let mut active = false;
    for frame_count in counts.iter_mut() {
        for _ in 0..oversample {
            if active {
                if rng.gen::<f64>() < p_deactivate {
                    active = false;
                }
            } else if rng.gen::<f64>() < p_activate {
                active = true;
            }

            let p_spike = if active { p_spike_active } else { p_spike_silent };
            if rng.gen::<f64>() < p_spike {
                *frame_count += 1;
            }
        }
    }

    // Log-normal amplitudes per frame
    let amp = LogNormal::new(0.0, config.amp_sigma)
        .map_err(|e| SolverError::InvalidParams(format!("amp_sigma: {e}")))?;
    let mut spikes = vec![0.0_f32; n];
    for (s, &c) in spikes.iter_mut().zip(counts.iter()) {
        if c > 0 {
            *s = (c as f64 * amp.sample(rng)) as f32;
        }
    }

    // 3. Convolve with the kernel
    let mut clean = vec![0.0_f32; n];
    for (t, &s) in spikes.iter().enumerate() {
        if s == 0.0 {
            continue;
        }
        for (k, &kv) in kernel.iter().enumerate() {
            if t + k < n {
                clean[t + k] += s * kv;
            }
        }
    }

    // 4. Drift + noise scaled to the clean peak. The drift period (not the
    //    cycle count) is uniform in [N/cycles_max, N/cycles_min].
    let peak = clean.iter().cloned().fold(0.0_f32, f32::max).max(1.0) as f64;
    let period = rng.gen_range(
        (n as f64 / config.drift_cycles_max)..=(n as f64 / config.drift_cycles_min),
    );
    let phase = rng.gen_range(0.0..(2.0 * std::f64::consts::PI));
    let noise = Normal::new(0.0, peak / config.snr)
        .map_err(|e| SolverError::InvalidParams(format!("snr: {e}")))?;

    let mut raw = vec![0.0_f32; n];
    for t in 0..n {
        let drift = config.drift_amplitude
            * peak
            * (2.0 * std::f64::consts::PI * t as f64 / period + phase).sin();
        raw[t] = clean[t] + drift as f32 + noise.sample(rng) as f32;
    }

    Ok(CellTrace { raw, spikes, clean })
}

/// Simulate a dataset of independent cells. Each cell runs on its own
/// ChaCha8 stream of the same seed, so per-cell traces are stable under
/// changes to the cell count.
pub fn generate_dataset(
    config: &SynthConfig,
    num_cells: usize,
    seed: u64,
) -> Result<SynthDataset, EngineError> {
    let n = config.num_frames;
    let mut data = Vec::with_capacity(num_cells * n);
    let mut spikes = Vec::with_capacity(num_cells);
    let mut clean = Vec::with_capacity(num_cells);

    for cell in 0..num_cells {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        rng.set_stream(cell as u64 + 1);
        let trace = generate_cell(config, &mut rng)?;
        data.extend_from_slice(&trace.raw);
        spikes.push(trace.spikes);
        clean.push(trace.clean);
    }

    Ok(SynthDataset {
        data,
        num_cells,
        num_frames: n,
        spikes,
        clean,
    })
}
