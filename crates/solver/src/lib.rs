//! Numeric core for interactive sparse deconvolution of calcium traces.
//!
//! The [`Solver`] minimizes (1/2)||y - K*s - b||² + λ·G_dc·||s||₁ subject to
//! s ≥ 0, where K is the causal convolution with a double-exponential kernel,
//! b is a scalar baseline estimated jointly, and G_dc = Σh scales λ so the
//! sparsity slider behaves consistently across kernel shapes. Iteration is
//! FISTA with adaptive restart (`step_batch`); hosts drive it in slices so
//! they can stream intermediate solutions and observe cancellation between
//! slices.

pub mod downsample;
pub mod error;
pub mod filter;
pub mod kernel;
pub mod window;

mod fft;
mod fista;

pub use error::SolverError;

use filter::BandpassFilter;
use kernel::{build_kernel, compute_lipschitz, validate_params};
use std::io::{Cursor, Read};
use tracing::warn;

/// Default relative-change convergence tolerance on the objective.
pub const CONVERGENCE_RTOL: f64 = 1e-6;
/// Default hard iteration cap per solve.
pub const MAX_ITERATIONS: u32 = 2000;

/// FISTA solver for calcium deconvolution.
///
/// Pre-allocated working buffers grow to the largest active trace observed
/// and never shrink, amortizing allocation over an interactive session.
pub struct Solver {
    // Parameters
    tau_rise: f64,
    tau_decay: f64,
    lambda: f64,
    fs: f64,

    // Working buffers (f32 to halve memory per worker)
    pub(crate) trace: Vec<f32>,
    pub(crate) solution: Vec<f32>,
    pub(crate) solution_prev: Vec<f32>,
    pub(crate) gradient: Vec<f32>,
    pub(crate) reconvolution: Vec<f32>,
    pub(crate) residual_buf: Vec<f32>,
    pub(crate) kernel: Vec<f32>,

    // FISTA state
    pub(crate) iteration: u32,
    pub(crate) t_fista: f64,
    pub(crate) converged: bool,
    pub(crate) active_len: usize,

    // Convergence tracking
    pub(crate) prev_objective: f64,
    pub(crate) tolerance: f64,
    pub(crate) max_iterations: u32,
    pub(crate) lipschitz_constant: f64,

    // Baseline and kernel scaling
    pub(crate) baseline: f64,
    pub(crate) kernel_dc_gain: f64,

    // FFT convolution engine (plans, scratch, kernel spectrum)
    pub(crate) fft: fft::FftConvolver,
    pub(crate) reconvolution_stale: bool,

    // Set once a step produced NaN/Inf; cleared by set_trace
    pub(crate) poisoned: bool,

    bandpass: BandpassFilter,
}

impl Default for Solver {
    fn default() -> Self {
        Self::new()
    }
}

impl Solver {
    /// Create a solver with default parameters (τ_rise 0.02 s, τ_decay
    /// 0.4 s, λ 0.01, fs 30 Hz).
    pub fn new() -> Solver {
        let mut solver = Solver {
            tau_rise: 0.02,
            tau_decay: 0.4,
            lambda: 0.01,
            fs: 30.0,
            trace: Vec::new(),
            solution: Vec::new(),
            solution_prev: Vec::new(),
            gradient: Vec::new(),
            reconvolution: Vec::new(),
            residual_buf: Vec::new(),
            kernel: Vec::new(),
            iteration: 0,
            t_fista: 1.0,
            converged: false,
            active_len: 0,
            prev_objective: f64::INFINITY,
            tolerance: CONVERGENCE_RTOL,
            max_iterations: MAX_ITERATIONS,
            lipschitz_constant: 1.0,
            baseline: 0.0,
            kernel_dc_gain: 1.0,
            fft: fft::FftConvolver::new(),
            reconvolution_stale: true,
            poisoned: false,
            bandpass: BandpassFilter::new(),
        };

        // Defaults are valid by construction.
        solver
            .set_params(solver.tau_rise, solver.tau_decay, solver.lambda, solver.fs)
            .expect("default parameters are valid");
        solver
    }

    /// Update parameters and rebuild the kernel, Lipschitz bound and filter
    /// cutoffs. τ_rise ≥ τ_decay is repaired by swapping (with a warning)
    /// rather than rejected, so slider crossings stay interactive.
    pub fn set_params(
        &mut self,
        tau_rise: f64,
        tau_decay: f64,
        lambda: f64,
        fs: f64,
    ) -> Result<(), SolverError> {
        validate_params(tau_rise, tau_decay, fs)?;
        if !lambda.is_finite() || lambda <= 0.0 {
            return Err(SolverError::InvalidParams(format!("lambda = {lambda}")));
        }

        let (tau_rise, tau_decay) = if tau_rise >= tau_decay {
            warn!(
                target: "solver.params",
                tau_rise, tau_decay,
                "tau_rise >= tau_decay, swapping"
            );
            (tau_decay, tau_rise)
        } else {
            (tau_rise, tau_decay)
        };

        self.tau_rise = tau_rise;
        self.tau_decay = tau_decay;
        self.lambda = lambda;
        self.fs = fs;
        self.kernel = build_kernel(tau_rise, tau_decay, fs)?;
        self.lipschitz_constant = compute_lipschitz(&self.kernel);
        self.kernel_dc_gain = self.kernel.iter().map(|&k| k as f64).sum();
        self.bandpass.update_cutoffs(tau_rise, tau_decay, fs);

        // Re-enqueued quanta keep the trace length; re-FFT just the kernel
        // when the padded length still fits, otherwise force a rebuild.
        if self.active_len > 0 {
            if self.fft.fits(self.active_len, self.kernel.len()) {
                self.fft.prepare_kernel(&self.kernel);
            } else {
                self.fft.invalidate();
                self.fft.prepare(self.active_len, &self.kernel);
            }
        }

        Ok(())
    }

    /// Load a trace for deconvolution and reset the iteration state for a
    /// fresh (cold) solve. Buffers grow but never shrink.
    pub fn set_trace(&mut self, trace: &[f32]) -> Result<(), SolverError> {
        if trace.len() < self.kernel.len() {
            return Err(SolverError::DimensionMismatch(format!(
                "trace length {} shorter than kernel length {}",
                trace.len(),
                self.kernel.len()
            )));
        }

        self.active_len = trace.len();

        let n = trace.len();
        if self.trace.len() < n {
            self.trace.resize(n, 0.0);
            self.solution.resize(n, 0.0);
            self.solution_prev.resize(n, 0.0);
            self.gradient.resize(n, 0.0);
            self.reconvolution.resize(n, 0.0);
            self.residual_buf.resize(n, 0.0);
        }

        self.trace[..n].copy_from_slice(trace);
        self.solution[..n].fill(0.0);
        self.solution_prev[..n].fill(0.0);
        self.gradient[..n].fill(0.0);
        self.reconvolution[..n].fill(0.0);
        self.residual_buf[..n].fill(0.0);

        self.iteration = 0;
        self.t_fista = 1.0;
        self.converged = false;
        self.prev_objective = f64::INFINITY;
        self.baseline = 0.0;
        self.reconvolution_stale = true;
        self.poisoned = false;

        self.fft.prepare(self.active_len, &self.kernel);
        Ok(())
    }

    /// Convergence tolerance override (relative objective change).
    pub fn set_tolerance(&mut self, tolerance: f64) {
        self.tolerance = tolerance;
    }

    /// Hard iteration cap override.
    pub fn set_max_iterations(&mut self, max_iterations: u32) {
        self.max_iterations = max_iterations;
    }

    /// Returns a copy of the kernel.
    pub fn get_kernel(&self) -> Vec<f32> {
        self.kernel.clone()
    }

    /// Current solution (spike train) for the active region.
    pub fn get_solution(&self) -> Vec<f32> {
        self.solution[..self.active_len].to_vec()
    }

    /// Reconvolution K*s for the active region, recomputed lazily when the
    /// iteration left it stale.
    pub fn get_reconvolution(&mut self) -> Vec<f32> {
        if self.reconvolution_stale {
            self.refresh_reconvolution();
        }
        self.reconvolution[..self.active_len].to_vec()
    }

    /// Reconvolution with baseline added: K*s + b.
    pub fn get_reconvolution_with_baseline(&mut self) -> Vec<f32> {
        if self.reconvolution_stale {
            self.refresh_reconvolution();
        }
        let b = self.baseline as f32;
        self.reconvolution[..self.active_len]
            .iter()
            .map(|&v| v + b)
            .collect()
    }

    /// Estimated scalar baseline.
    pub fn get_baseline(&self) -> f64 {
        self.baseline
    }

    /// Current trace for the active region. After `apply_filter` this is the
    /// filtered trace.
    pub fn get_trace(&self) -> Vec<f32> {
        self.trace[..self.active_len].to_vec()
    }

    pub fn converged(&self) -> bool {
        self.converged
    }

    pub fn iteration_count(&self) -> u32 {
        self.iteration
    }

    pub fn active_len(&self) -> usize {
        self.active_len
    }

    /// Reset FISTA momentum: t = 1 and extrapolation point = solution. Used
    /// for warm-starts after a kernel change where the solution magnitude is
    /// still useful but the momentum direction is not.
    pub fn reset_momentum(&mut self) {
        self.t_fista = 1.0;
        let n = self.active_len;
        self.solution_prev[..n].copy_from_slice(&self.solution[..n]);
    }

    /// λ scaled by kernel DC gain.
    pub(crate) fn effective_lambda(&self) -> f64 {
        self.lambda * self.kernel_dc_gain
    }

    /// Recompute K*s and refresh the baseline at the current solution.
    fn refresh_reconvolution(&mut self) {
        let n = self.active_len;
        if n == 0 {
            return;
        }

        if self.fft.is_ready() {
            self.fft.convolve(
                fft::Pass::Forward,
                &self.solution[..n],
                n,
                &mut self.reconvolution[..n],
            );
        } else {
            let k_len = self.kernel.len();
            for t in 0..n {
                let mut sum = 0.0;
                for k in 0..k_len.min(t + 1) {
                    sum += self.kernel[k] * self.solution[t - k];
                }
                self.reconvolution[t] = sum;
            }
        }

        let mut sum = 0.0_f64;
        for i in 0..n {
            sum += (self.trace[i] - self.reconvolution[i]) as f64;
        }
        self.baseline = sum / n as f64;

        self.reconvolution_stale = false;
    }

    // --- Bandpass filter ---

    pub fn set_filter_enabled(&mut self, enabled: bool) {
        self.bandpass.set_enabled(enabled);
    }

    pub fn filter_enabled(&self) -> bool {
        self.bandpass.is_enabled()
    }

    /// Apply the kernel-derived bandpass to the active trace in place.
    /// Returns true if filtering ran (enabled, valid band, long enough).
    pub fn apply_filter(&mut self) -> bool {
        let n = self.active_len;
        self.bandpass.apply(&mut self.trace[..n])
    }

    /// Power spectrum of the current trace (N/2+1 bins), computed on demand
    /// when no filtered spectrum is cached.
    pub fn get_power_spectrum(&mut self) -> Vec<f32> {
        let n = self.active_len;
        if n < 8 {
            return Vec::new();
        }
        if self.bandpass.power_spectrum(n).is_empty() {
            self.bandpass.compute_spectrum_only(&self.trace[..n]);
        }
        self.bandpass.power_spectrum(n).to_vec()
    }

    /// Frequency axis in Hz for the spectrum bins.
    pub fn get_spectrum_frequencies(&self) -> Vec<f32> {
        self.bandpass.spectrum_frequencies(self.active_len)
    }

    /// Filter cutoffs as (f_hp, f_lp) in Hz.
    pub fn get_filter_cutoffs(&self) -> (f64, f64) {
        self.bandpass.cutoffs()
    }

    // --- State snapshots (warm-start) ---

    /// Serialize solver state for the warm-start cache.
    /// Layout: [active_len:u32][t_fista:f64][iteration:u32][baseline:f64]
    /// [solution:f32×n][solution_prev:f32×n], little-endian.
    pub fn export_state(&self) -> Vec<u8> {
        let n = self.active_len;
        let mut buf = Vec::with_capacity(4 + 8 + 4 + 8 + 2 * n * 4);

        buf.extend_from_slice(&(n as u32).to_le_bytes());
        buf.extend_from_slice(&self.t_fista.to_le_bytes());
        buf.extend_from_slice(&self.iteration.to_le_bytes());
        buf.extend_from_slice(&self.baseline.to_le_bytes());

        for i in 0..n {
            buf.extend_from_slice(&self.solution[i].to_le_bytes());
        }
        for i in 0..n {
            buf.extend_from_slice(&self.solution_prev[i].to_le_bytes());
        }

        buf
    }

    /// Restore a warm-start snapshot. A blob whose recorded length disagrees
    /// with the current active length leaves the cold-start state from
    /// `set_trace` in place. Returns true when the snapshot was applied.
    pub fn load_state(&mut self, state: &[u8]) -> bool {
        // Header: active_len (u32) + t_fista (f64) + iteration (u32) + baseline (f64)
        if state.len() < 24 {
            return false;
        }

        let mut cur = Cursor::new(state);
        let saved_len = read_u32_le(&mut cur) as usize;
        let expected_size = 4 + 8 + 4 + 8 + 2 * saved_len * 4;

        if state.len() != expected_size || saved_len != self.active_len {
            return false;
        }

        self.t_fista = read_f64_le(&mut cur);
        self.iteration = read_u32_le(&mut cur);
        self.baseline = read_f64_le(&mut cur);
        self.converged = false;
        self.prev_objective = f64::INFINITY;

        for i in 0..saved_len {
            self.solution[i] = read_f32_le(&mut cur);
        }
        for i in 0..saved_len {
            self.solution_prev[i] = read_f32_le(&mut cur);
        }
        self.reconvolution_stale = true;
        true
    }
}

// Little-endian cursor read helpers. Each panics on short reads, which
// cannot occur once the caller has validated the total buffer length.

fn read_u32_le(cur: &mut Cursor<&[u8]>) -> u32 {
    let mut buf = [0u8; 4];
    cur.read_exact(&mut buf).unwrap();
    u32::from_le_bytes(buf)
}

fn read_f32_le(cur: &mut Cursor<&[u8]>) -> f32 {
    let mut buf = [0u8; 4];
    cur.read_exact(&mut buf).unwrap();
    f32::from_le_bytes(buf)
}

fn read_f64_le(cur: &mut Cursor<&[u8]>) -> f64 {
    let mut buf = [0u8; 8];
    cur.read_exact(&mut buf).unwrap();
    f64::from_le_bytes(buf)
}
