use crate::kernel::filter_cutoffs;
use realfft::RealFftPlanner;
use rustfft::num_complex::Complex;
use std::f64::consts::FRAC_1_SQRT_2;

/// Total order of the bandpass cascade: one 2nd-order high-pass and one
/// 2nd-order low-pass section. Also the reflection-padding length used by
/// the zero-phase pass.
pub const FILTER_ORDER: usize = 4;

/// Traces shorter than this skip filtering (not enough samples to reflect).
const MIN_FILTER_LEN: usize = 8;

/// Quantile used to re-zero the floor after filtering. The high-pass zeros
/// the mean, not the floor; a low percentile tracks the quiet-region floor
/// so the non-negativity constraint in the solver stays meaningful.
const FLOOR_QUANTILE: f64 = 0.02;

/// Normalized biquad section (a0 = 1), RBJ cookbook form, Q = 1/√2
/// (Butterworth). State is reset per pass; zero-phase comes from running
/// the same coefficients forward and then over the reversed sequence.
#[derive(Clone, Copy, Default)]
struct Biquad {
    b0: f64,
    b1: f64,
    b2: f64,
    a1: f64,
    a2: f64,
}

impl Biquad {
    fn lowpass(freq: f64, fs: f64) -> Biquad {
        let w0 = 2.0 * std::f64::consts::PI * freq / fs;
        let (sin_w, cos_w) = w0.sin_cos();
        let alpha = sin_w / (2.0 * FRAC_1_SQRT_2);
        let a0 = 1.0 + alpha;
        Biquad {
            b0: ((1.0 - cos_w) / 2.0) / a0,
            b1: (1.0 - cos_w) / a0,
            b2: ((1.0 - cos_w) / 2.0) / a0,
            a1: (-2.0 * cos_w) / a0,
            a2: (1.0 - alpha) / a0,
        }
    }

    fn highpass(freq: f64, fs: f64) -> Biquad {
        let w0 = 2.0 * std::f64::consts::PI * freq / fs;
        let (sin_w, cos_w) = w0.sin_cos();
        let alpha = sin_w / (2.0 * FRAC_1_SQRT_2);
        let a0 = 1.0 + alpha;
        Biquad {
            b0: ((1.0 + cos_w) / 2.0) / a0,
            b1: (-(1.0 + cos_w)) / a0,
            b2: ((1.0 + cos_w) / 2.0) / a0,
            a1: (-2.0 * cos_w) / a0,
            a2: (1.0 - alpha) / a0,
        }
    }

    /// One causal pass over `x`, direct form II transposed, f64 state.
    fn run(&self, x: &mut [f32]) {
        let mut z1 = 0.0_f64;
        let mut z2 = 0.0_f64;
        for v in x.iter_mut() {
            let xin = *v as f64;
            let y = self.b0 * xin + z1;
            z1 = self.b1 * xin - self.a1 * y + z2;
            z2 = self.b2 * xin - self.a2 * y;
            *v = y as f32;
        }
    }
}

/// Zero-phase bandpass derived from the kernel time constants.
///
/// Cutoffs come from `kernel::filter_cutoffs` so the filter and the spectrum
/// overlay always agree. The forward pass runs HP then LP; the backward pass
/// runs the same sections over the reversed sequence, cancelling the phase
/// shift. Reflection padding of [`FILTER_ORDER`] samples on each end absorbs
/// the startup transients and is discarded afterwards.
///
/// Scratch buffers grow but never shrink (matching the `Solver` convention).
pub struct BandpassFilter {
    enabled: bool,
    f_hp: f64,
    f_lp: f64,
    fs: f64,
    valid: bool,

    hp: Biquad,
    lp: Biquad,
    padded: Vec<f32>,
    sort_scratch: Vec<f32>,

    // Spectrum overlay infrastructure
    planner: RealFftPlanner<f32>,
    planned_len: usize,
    fft_input: Vec<f32>,
    spectrum: Vec<Complex<f32>>,
    power: Vec<f32>,
    scratch_fwd: Vec<Complex<f32>>,
}

impl Default for BandpassFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl BandpassFilter {
    pub fn new() -> Self {
        BandpassFilter {
            enabled: false,
            f_hp: 0.0,
            f_lp: 0.0,
            fs: 30.0,
            valid: false,
            hp: Biquad::default(),
            lp: Biquad::default(),
            padded: Vec::new(),
            sort_scratch: Vec::new(),
            planner: RealFftPlanner::new(),
            planned_len: 0,
            fft_input: Vec::new(),
            spectrum: Vec::new(),
            power: Vec::new(),
            scratch_fwd: Vec::new(),
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Recompute cutoffs and biquad coefficients from kernel time constants.
    pub fn update_cutoffs(&mut self, tau_rise: f64, tau_decay: f64, fs: f64) {
        self.fs = fs;
        let Ok((f_hp, f_lp)) = filter_cutoffs(tau_rise, tau_decay, fs) else {
            self.valid = false;
            return;
        };
        self.f_hp = f_hp;
        self.f_lp = f_lp;
        self.valid = f_hp < f_lp;
        if self.valid {
            self.hp = Biquad::highpass(f_hp, fs);
            self.lp = Biquad::lowpass(f_lp, fs);
        }
        // fs may have changed, so the cached spectrum's frequency axis is
        // stale; recompute on next request
        self.planned_len = 0;
    }

    /// Filter `trace` in place (zero-phase) and re-zero its floor. Caches the
    /// pre-filter power spectrum for the overlay. Returns false if skipped.
    pub fn apply(&mut self, trace: &mut [f32]) -> bool {
        if !self.enabled || !self.valid || trace.len() < MIN_FILTER_LEN {
            return false;
        }
        let n = trace.len();

        // The overlay shows what the filter removes, so the spectrum is of
        // the unfiltered trace.
        self.compute_spectrum_only(trace);

        // Reflection padding on both ends
        let pad = FILTER_ORDER;
        let padded_len = n + 2 * pad;
        if self.padded.len() < padded_len {
            self.padded.resize(padded_len, 0.0);
        }
        for j in 0..pad {
            self.padded[j] = trace[pad - j];
            self.padded[pad + n + j] = trace[n - 2 - j];
        }
        self.padded[pad..pad + n].copy_from_slice(trace);

        // Forward pass, then the same sections over the reversed sequence
        let section = &mut self.padded[..padded_len];
        self.hp.run(section);
        self.lp.run(section);
        section.reverse();
        self.hp.run(section);
        self.lp.run(section);
        section.reverse();

        trace.copy_from_slice(&self.padded[pad..pad + n]);

        // Shift so the FLOOR_QUANTILE percentile sits at zero.
        let k = ((n as f64 * FLOOR_QUANTILE).round() as usize).min(n - 1);
        if self.sort_scratch.len() < n {
            self.sort_scratch.resize(n, 0.0);
        }
        self.sort_scratch[..n].copy_from_slice(trace);
        self.sort_scratch[..n].select_nth_unstable_by(k, |a, b| {
            a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal)
        });
        let floor = self.sort_scratch[k];
        for v in trace.iter_mut() {
            *v -= floor;
        }

        true
    }

    /// Compute and cache the power spectrum without filtering (overlay view
    /// when the filter is off).
    pub fn compute_spectrum_only(&mut self, trace: &[f32]) {
        let n = trace.len();
        if n < MIN_FILTER_LEN {
            return;
        }
        self.ensure_spectrum_buffers(n);
        let spectrum_len = n / 2 + 1;

        self.fft_input[..n].copy_from_slice(trace);
        let fwd = self.planner.plan_fft_forward(n);
        fwd.process_with_scratch(
            &mut self.fft_input[..n],
            &mut self.spectrum[..spectrum_len],
            &mut self.scratch_fwd,
        )
        .expect("buffer lengths match plan");

        for i in 0..spectrum_len {
            let c = self.spectrum[i];
            self.power[i] = c.re * c.re + c.im * c.im;
        }
        self.planned_len = n;
    }

    /// Cached power spectrum (N/2+1 bins of |FFT|²), empty if none computed
    /// for this length yet.
    pub fn power_spectrum(&self, n: usize) -> &[f32] {
        let spectrum_len = n / 2 + 1;
        if self.planned_len == n && self.power.len() >= spectrum_len {
            &self.power[..spectrum_len]
        } else {
            &[]
        }
    }

    /// Frequency axis in Hz for the spectrum bins.
    pub fn spectrum_frequencies(&self, n: usize) -> Vec<f32> {
        if n == 0 {
            return Vec::new();
        }
        let spectrum_len = n / 2 + 1;
        let df = (self.fs / n as f64) as f32;
        (0..spectrum_len).map(|i| i as f32 * df).collect()
    }

    /// Cutoffs (f_hp, f_lp) in Hz.
    pub fn cutoffs(&self) -> (f64, f64) {
        (self.f_hp, self.f_lp)
    }

    fn ensure_spectrum_buffers(&mut self, n: usize) {
        let spectrum_len = n / 2 + 1;
        if self.fft_input.len() < n {
            self.fft_input.resize(n, 0.0);
        }
        if self.spectrum.len() < spectrum_len {
            self.spectrum.resize(spectrum_len, Complex::new(0.0, 0.0));
        }
        if self.power.len() < spectrum_len {
            self.power.resize(spectrum_len, 0.0);
        }
        let fwd = self.planner.plan_fft_forward(n);
        let need = fwd.get_scratch_len();
        if self.scratch_fwd.len() < need {
            self.scratch_fwd.resize(need, Complex::new(0.0, 0.0));
        }
    }
}
