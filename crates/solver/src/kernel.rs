use crate::error::SolverError;

/// Kernel support and window padding extent, in units of `tau_decay * fs`.
/// Shared by `build_kernel` and the window planner so the overlap-discard
/// padding always covers the kernel support.
pub const PADDING_TAU_MULTIPLIER: f64 = 5.0;

/// Margin factors for deriving bandpass cutoffs from kernel time constants.
/// HP cutoff = 1/(2π·τ_decay·M_HP), LP cutoff = M_LP/(2π·τ_rise).
/// HP uses 16× to preserve the slow calcium decay tail (~40 s period for
/// typical τ_decay = 0.4 s) while still removing sub-calcium baseline drift.
/// LP uses 4× for tighter noise rejection above the kernel's rise band.
pub const MARGIN_FACTOR_HP: f64 = 16.0;
pub const MARGIN_FACTOR_LP: f64 = 4.0;

/// AR(2) representation of the double-exponential kernel, reported in
/// settings exports for downstream pipelines. Not used by the FISTA loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ar2Coeffs {
    pub decay_root: f64,
    pub rise_root: f64,
    pub g1: f64,
    pub g2: f64,
    pub dt: f64,
}

/// Reject non-finite or non-positive kernel parameters.
pub fn validate_params(tau_rise: f64, tau_decay: f64, fs: f64) -> Result<(), SolverError> {
    for (name, v) in [("tau_rise", tau_rise), ("tau_decay", tau_decay), ("fs", fs)] {
        if !v.is_finite() || v <= 0.0 {
            return Err(SolverError::InvalidParams(format!("{name} = {v}")));
        }
    }
    Ok(())
}

/// Number of kernel samples for the given decay constant and sampling rate.
pub fn kernel_len(tau_decay: f64, fs: f64) -> usize {
    ((PADDING_TAU_MULTIPLIER * tau_decay * fs).ceil() as usize).max(2)
}

/// Build a double-exponential calcium kernel normalized to peak = 1.0.
///
/// h(t) = exp(-t/tau_decay) - exp(-t/tau_rise) over ⌈5·tau_decay·fs⌉ samples
/// (at least 2). Computed in f64 for precision, returned as Vec<f32>.
pub fn build_kernel(tau_rise: f64, tau_decay: f64, fs: f64) -> Result<Vec<f32>, SolverError> {
    validate_params(tau_rise, tau_decay, fs)?;

    let dt = 1.0 / fs;
    let len = kernel_len(tau_decay, fs);

    let mut kernel_f64 = Vec::with_capacity(len);
    let mut peak = 0.0_f64;
    for i in 0..len {
        let t = (i as f64) * dt;
        let val = (-t / tau_decay).exp() - (-t / tau_rise).exp();
        kernel_f64.push(val);
        if val > peak {
            peak = val;
        }
    }

    if peak > 0.0 {
        for v in kernel_f64.iter_mut() {
            *v /= peak;
        }
    }

    Ok(kernel_f64.iter().map(|&v| v as f32).collect())
}

/// Derive AR(2) coefficients from the tau parameters.
///
/// The AR(2) process c[t] = g1·c[t-1] + g2·c[t-2] + s[t] has characteristic
/// roots d = exp(-dt/tau_decay) and r = exp(-dt/tau_rise):
/// g1 = d + r (sum of roots), g2 = -(d·r) (negative product of roots).
pub fn tau_to_ar2(tau_rise: f64, tau_decay: f64, fs: f64) -> Result<Ar2Coeffs, SolverError> {
    validate_params(tau_rise, tau_decay, fs)?;

    let dt = 1.0 / fs;
    let decay_root = (-dt / tau_decay).exp();
    let rise_root = (-dt / tau_rise).exp();

    Ok(Ar2Coeffs {
        decay_root,
        rise_root,
        g1: decay_root + rise_root,
        g2: -(decay_root * rise_root),
        dt,
    })
}

/// Bandpass cutoffs (f_hp, f_lp) in Hz derived from the kernel time
/// constants, both clamped to (0, fs/2). The same pair feeds the filter and
/// the spectrum overlay so the two never disagree.
pub fn filter_cutoffs(tau_rise: f64, tau_decay: f64, fs: f64) -> Result<(f64, f64), SolverError> {
    validate_params(tau_rise, tau_decay, fs)?;

    let nyquist = fs / 2.0;
    let f_hp = (1.0 / (2.0 * std::f64::consts::PI * tau_decay * MARGIN_FACTOR_HP)).min(nyquist);
    let f_lp = (MARGIN_FACTOR_LP / (2.0 * std::f64::consts::PI * tau_rise)).min(nyquist);

    Ok((f_hp, f_lp))
}

/// Upper bound on the Lipschitz constant of the gradient of
/// (1/2)||y - K*s||²: ‖h‖₁².
///
/// For this kernel the spectrum is DC-dominant (h ≥ 0), so the spectral
/// bound max|H(ω)|² attains its maximum at ω = 0 where |H(0)| = Σh = ‖h‖₁;
/// the closed form is therefore as tight as the DFT scan it replaces.
pub fn compute_lipschitz(kernel: &[f32]) -> f64 {
    let l1: f64 = kernel.iter().map(|&k| (k as f64).abs()).sum();
    (l1 * l1).max(1e-10)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_peak_is_one_typical_params() {
        let kernel = build_kernel(0.02, 0.4, 30.0).unwrap();
        let peak = kernel.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        assert!((peak - 1.0).abs() < 1e-6, "Peak should be 1.0, got {}", peak);
    }

    #[test]
    fn kernel_peak_is_one_extreme_params() {
        let kernel = build_kernel(0.001, 2.0, 100.0).unwrap();
        let peak = kernel.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        assert!(
            (peak - 1.0).abs() < 1e-6,
            "Peak should be 1.0 for extreme params, got {}",
            peak
        );
    }

    #[test]
    fn kernel_first_sample_is_zero() {
        let kernel = build_kernel(0.02, 0.4, 30.0).unwrap();
        assert!(
            kernel[0].abs() < 1e-7,
            "First sample should be 0.0, got {}",
            kernel[0]
        );
    }

    #[test]
    fn kernel_values_non_negative() {
        let kernel = build_kernel(0.02, 0.4, 30.0).unwrap();
        for (i, &v) in kernel.iter().enumerate() {
            assert!(v >= -1e-7, "Kernel value at index {} is negative: {}", i, v);
        }
    }

    #[test]
    fn kernel_length_follows_decay_support() {
        // ceil(5 * 0.4 * 30) = 60
        assert_eq!(build_kernel(0.02, 0.4, 30.0).unwrap().len(), 60);
        // ceil(5 * 0.8 * 30) = 120
        assert_eq!(build_kernel(0.02, 0.8, 30.0).unwrap().len(), 120);
        // degenerate short kernels are floored at 2 samples
        assert_eq!(build_kernel(0.001, 0.002, 30.0).unwrap().len(), 2);
    }

    #[test]
    fn invalid_params_rejected() {
        assert!(build_kernel(0.0, 0.4, 30.0).is_err());
        assert!(build_kernel(0.02, -1.0, 30.0).is_err());
        assert!(build_kernel(0.02, 0.4, f64::NAN).is_err());
        assert!(filter_cutoffs(f64::INFINITY, 0.4, 30.0).is_err());
        assert!(tau_to_ar2(0.02, 0.4, 0.0).is_err());
    }

    #[test]
    fn ar2_coefficients_match_known_values() {
        let tau_rise: f64 = 0.02;
        let tau_decay: f64 = 0.4;
        let fs: f64 = 30.0;
        let dt: f64 = 1.0 / fs;

        let d: f64 = (-dt / tau_decay).exp();
        let r: f64 = (-dt / tau_rise).exp();

        let c = tau_to_ar2(tau_rise, tau_decay, fs).unwrap();

        assert!((c.g1 - (d + r)).abs() < 1e-15, "g1 should be d + r");
        assert!((c.g2 - (-(d * r))).abs() < 1e-15, "g2 should be -(d*r)");
        assert!((c.decay_root - d).abs() < 1e-15);
        assert!((c.rise_root - r).abs() < 1e-15);
    }

    #[test]
    fn ar2_roots_recoverable_and_in_unit_interval() {
        let c = tau_to_ar2(0.02, 0.4, 30.0).unwrap();

        let discriminant = c.g1 * c.g1 + 4.0 * c.g2;
        assert!(
            discriminant >= 0.0,
            "Discriminant should be non-negative, got {}",
            discriminant
        );

        let d = (c.g1 + discriminant.sqrt()) / 2.0;
        let r = (c.g1 - discriminant.sqrt()) / 2.0;

        assert!(d > 0.0 && d < 1.0, "Decay root d = {} not in (0,1)", d);
        assert!(r > 0.0 && r < 1.0, "Rise root r = {} not in (0,1)", r);
    }

    #[test]
    fn cutoffs_ordered_and_clamped() {
        let (f_hp, f_lp) = filter_cutoffs(0.02, 0.4, 30.0).unwrap();
        // f_hp = 1/(2π·0.4·16) ≈ 0.0249 Hz
        assert!((f_hp - 0.0249).abs() < 0.005);
        // f_lp = 4/(2π·0.02) ≈ 31.8 Hz, clamped to Nyquist = 15 Hz
        assert!((f_lp - 15.0).abs() < 1e-9);
        assert!(f_hp < f_lp);
        assert!(f_hp > 0.0 && f_lp <= 15.0);
    }

    #[test]
    fn cutoffs_invert_with_inverted_taus() {
        // tau_rise > tau_decay pushes f_hp above f_lp (invalid band).
        let (f_hp, f_lp) = filter_cutoffs(10.0, 0.001, 1000.0).unwrap();
        assert!(f_hp > f_lp);
    }

    #[test]
    fn lipschitz_is_l1_norm_squared() {
        let kernel = build_kernel(0.02, 0.4, 30.0).unwrap();
        let l1: f64 = kernel.iter().map(|&k| k as f64).sum();
        let lipschitz = compute_lipschitz(&kernel);

        assert!(lipschitz > 0.0);
        assert!((lipschitz - l1 * l1).abs() < 1e-9 * l1 * l1);

        // Parseval sanity: the bound dominates the kernel energy.
        let sum_squares: f64 = kernel.iter().map(|&k| (k as f64) * (k as f64)).sum();
        assert!(lipschitz >= sum_squares * 0.99);
    }
}
