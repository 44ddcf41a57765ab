use realfft::{ComplexToReal, RealFftPlanner, RealToComplex};
use rustfft::num_complex::Complex;
use std::sync::Arc;

/// Which precomputed kernel spectrum a pass multiplies with: H(ω) for the
/// causal convolution K·s, conj(H(ω)) for the adjoint Kᵀ·r (correlation).
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum Pass {
    Forward,
    Adjoint,
}

/// FFT convolution engine for the solver's inner loop.
///
/// Owns the realfft plans, the zero-padded scratch buffers and the kernel
/// spectrum (plus its conjugate), so one struct borrow gives the iteration
/// both convolution directions without reallocating. Buffers grow to the
/// largest trace seen and never shrink, matching the solver's buffer policy.
///
/// Traces shorter than [`MIN_FFT_LEN`] skip the FFT path entirely; the
/// time-domain loops in `fista.rs` win below that size.
pub(crate) struct FftConvolver {
    planner: RealFftPlanner<f32>,
    fft_len: usize, // padded power-of-two length, 0 = not prepared

    plan_fwd: Option<Arc<dyn RealToComplex<f32>>>,
    plan_inv: Option<Arc<dyn ComplexToReal<f32>>>,

    kernel_fft: Vec<Complex<f32>>,
    kernel_conj_fft: Vec<Complex<f32>>,

    time_buf: Vec<f32>,
    spectrum_buf: Vec<Complex<f32>>,
    scratch_fwd: Vec<Complex<f32>>,
    scratch_inv: Vec<Complex<f32>>,
}

/// Below this trace length the O(n·k) loops beat FFT setup + three
/// transforms per iteration.
pub(crate) const MIN_FFT_LEN: usize = 64;

impl FftConvolver {
    pub(crate) fn new() -> Self {
        FftConvolver {
            planner: RealFftPlanner::new(),
            fft_len: 0,
            plan_fwd: None,
            plan_inv: None,
            kernel_fft: Vec::new(),
            kernel_conj_fft: Vec::new(),
            time_buf: Vec::new(),
            spectrum_buf: Vec::new(),
            scratch_fwd: Vec::new(),
            scratch_inv: Vec::new(),
        }
    }

    /// Whether plans and kernel spectra are prepared.
    pub(crate) fn is_ready(&self) -> bool {
        self.fft_len > 0
    }

    pub(crate) fn fft_len(&self) -> usize {
        self.fft_len
    }

    /// Drop the cached plans so the next `prepare` rebuilds from scratch.
    pub(crate) fn invalidate(&mut self) {
        self.fft_len = 0;
        self.plan_fwd = None;
        self.plan_inv = None;
    }

    /// Whether a kernel re-FFT alone suffices after a parameter change, i.e.
    /// the current padded length still covers `signal_len + k_len - 1`.
    pub(crate) fn fits(&self, signal_len: usize, k_len: usize) -> bool {
        self.fft_len > 0 && signal_len + k_len - 1 <= self.fft_len
    }

    /// Set up plans and buffers for a signal/kernel pair and FFT the kernel.
    /// No-op when the padded length is unchanged (the kernel spectrum is
    /// assumed current in that case; use `prepare_kernel` after kernel-only
    /// changes). Short signals leave the engine unprepared on purpose.
    pub(crate) fn prepare(&mut self, signal_len: usize, kernel: &[f32]) {
        let k_len = kernel.len();
        if signal_len < MIN_FFT_LEN || k_len == 0 {
            self.invalidate();
            return;
        }

        let padded_len = (signal_len + k_len - 1).next_power_of_two();
        if padded_len == self.fft_len {
            return;
        }

        self.fft_len = padded_len;
        let spectrum_len = padded_len / 2 + 1;

        grow(&mut self.time_buf, padded_len, 0.0);
        grow(&mut self.spectrum_buf, spectrum_len, Complex::new(0.0, 0.0));
        grow(&mut self.kernel_fft, spectrum_len, Complex::new(0.0, 0.0));
        grow(&mut self.kernel_conj_fft, spectrum_len, Complex::new(0.0, 0.0));

        let fwd = self.planner.plan_fft_forward(padded_len);
        let inv = self.planner.plan_fft_inverse(padded_len);
        grow(&mut self.scratch_fwd, fwd.get_scratch_len(), Complex::new(0.0, 0.0));
        grow(&mut self.scratch_inv, inv.get_scratch_len(), Complex::new(0.0, 0.0));
        self.plan_fwd = Some(fwd);
        self.plan_inv = Some(inv);

        self.prepare_kernel(kernel);
    }

    /// FFT the kernel into the cached spectra at the current padded length.
    pub(crate) fn prepare_kernel(&mut self, kernel: &[f32]) {
        let padded_len = self.fft_len;
        if padded_len == 0 {
            return;
        }
        let spectrum_len = padded_len / 2 + 1;

        for (i, slot) in self.time_buf[..padded_len].iter_mut().enumerate() {
            *slot = if i < kernel.len() { kernel[i] } else { 0.0 };
        }

        let fwd = self.plan_fwd.as_ref().expect("plans prepared").clone();
        fwd.process_with_scratch(
            &mut self.time_buf[..padded_len],
            &mut self.kernel_fft[..spectrum_len],
            &mut self.scratch_fwd,
        )
        .expect("buffer lengths match plan");

        for i in 0..spectrum_len {
            self.kernel_conj_fft[i] = self.kernel_fft[i].conj();
        }
    }

    /// Run one convolution pass: output[..signal_len] = (K ∗ source) or
    /// (Kᵀ ∗ source) depending on `pass`.
    pub(crate) fn convolve(
        &mut self,
        pass: Pass,
        source: &[f32],
        signal_len: usize,
        output: &mut [f32],
    ) {
        let padded_len = self.fft_len;
        let spectrum_len = padded_len / 2 + 1;

        for (i, slot) in self.time_buf[..padded_len].iter_mut().enumerate() {
            *slot = if i < signal_len { source[i] } else { 0.0 };
        }

        let fwd = self.plan_fwd.as_ref().expect("plans prepared").clone();
        fwd.process_with_scratch(
            &mut self.time_buf[..padded_len],
            &mut self.spectrum_buf[..spectrum_len],
            &mut self.scratch_fwd,
        )
        .expect("buffer lengths match plan");

        let kernel_spectrum = match pass {
            Pass::Forward => &self.kernel_fft,
            Pass::Adjoint => &self.kernel_conj_fft,
        };
        for i in 0..spectrum_len {
            self.spectrum_buf[i] *= kernel_spectrum[i];
        }

        let inv = self.plan_inv.as_ref().expect("plans prepared").clone();
        inv.process_with_scratch(
            &mut self.spectrum_buf[..spectrum_len],
            &mut self.time_buf[..padded_len],
            &mut self.scratch_inv,
        )
        .expect("buffer lengths match plan");

        // realfft leaves the inverse unnormalized
        let scale = 1.0 / padded_len as f32;
        for i in 0..signal_len {
            output[i] = self.time_buf[i] * scale;
        }
    }
}

fn grow<T: Clone>(buf: &mut Vec<T>, len: usize, fill: T) {
    if buf.len() < len {
        buf.resize(len, fill);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::build_kernel;

    /// Convolving an impulse at t=0 recovers the kernel.
    #[test]
    fn impulse_recovers_kernel() {
        let kernel = build_kernel(0.02, 0.4, 30.0).unwrap();
        let n = 128;

        let mut conv = FftConvolver::new();
        conv.prepare(n, &kernel);
        assert!(conv.is_ready());

        let mut impulse = vec![0.0_f32; n];
        impulse[0] = 1.0;

        let mut output = vec![0.0_f32; n];
        conv.convolve(Pass::Forward, &impulse, n, &mut output);

        for i in 0..kernel.len() {
            let diff = (output[i] - kernel[i]).abs();
            assert!(
                diff < 1e-5,
                "Impulse response differs from kernel at {}: got {} expected {}",
                i,
                output[i],
                kernel[i]
            );
        }
    }

    /// Adjoint identity: <Kx, y> == <x, Kᵀy> for deterministic vectors.
    #[test]
    fn adjoint_identity() {
        let kernel = build_kernel(0.02, 0.4, 30.0).unwrap();
        let n = 96;

        let mut conv = FftConvolver::new();
        conv.prepare(n, &kernel);

        let x: Vec<f32> = (0..n).map(|i| (i as f32 * 0.3).sin()).collect();
        let y: Vec<f32> = (0..n).map(|i| (i as f32 * 0.7 + 1.0).cos()).collect();

        let mut kx = vec![0.0_f32; n];
        conv.convolve(Pass::Forward, &x, n, &mut kx);
        let mut kty = vec![0.0_f32; n];
        conv.convolve(Pass::Adjoint, &y, n, &mut kty);

        let lhs: f64 = kx.iter().zip(&y).map(|(&a, &b)| a as f64 * b as f64).sum();
        let rhs: f64 = x.iter().zip(&kty).map(|(&a, &b)| a as f64 * b as f64).sum();

        let rel_err = (lhs - rhs).abs() / lhs.abs().max(1e-10);
        assert!(
            rel_err < 1e-4,
            "Adjoint identity violated: <Kx,y>={} vs <x,KᵀY>={}",
            lhs,
            rhs
        );
    }

    #[test]
    fn short_signals_stay_unprepared() {
        let kernel = build_kernel(0.02, 0.4, 30.0).unwrap();
        let mut conv = FftConvolver::new();
        conv.prepare(MIN_FFT_LEN - 1, &kernel);
        assert!(!conv.is_ready());
    }

    #[test]
    fn refit_keeps_padded_length_when_it_still_fits() {
        let short = build_kernel(0.02, 0.2, 30.0).unwrap();
        let long = build_kernel(0.02, 0.4, 30.0).unwrap();
        let n = 1000;

        let mut conv = FftConvolver::new();
        conv.prepare(n, &long);
        let len_before = conv.fft_len();

        assert!(conv.fits(n, short.len()));
        conv.prepare_kernel(&short);
        assert_eq!(conv.fft_len(), len_before);

        // The re-FFT'd kernel is actually in effect.
        let mut impulse = vec![0.0_f32; n];
        impulse[0] = 1.0;
        let mut output = vec![0.0_f32; n];
        conv.convolve(Pass::Forward, &impulse, n, &mut output);
        for i in 0..short.len() {
            assert!((output[i] - short[i]).abs() < 1e-5);
        }
    }
}
