//! End-to-end solver scenarios on literal inputs: impulse recovery, noise
//! suppression, spike localisation, windowed-vs-full agreement, warm-start
//! speedup.

use spiketune_solver::kernel::build_kernel;
use spiketune_solver::window::WindowPlan;
use spiketune_solver::Solver;

/// Deterministic pseudo-Gaussian noise (xorshift64* + Box-Muller), so the
/// scenarios never depend on an RNG crate or a global seed.
struct NoiseGen {
    state: u64,
}

impl NoiseGen {
    fn new(seed: u64) -> Self {
        NoiseGen {
            state: seed.max(1),
        }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    fn uniform(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    fn gaussian(&mut self) -> f64 {
        let u1 = self.uniform().max(1e-12);
        let u2 = self.uniform();
        (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
    }
}

fn run_to_convergence(solver: &mut Solver, max_batches: u32) {
    for _ in 0..max_batches {
        if solver.step_batch(15).unwrap() {
            return;
        }
    }
    panic!(
        "no convergence after {} iterations",
        solver.iteration_count()
    );
}

fn spike_trace(kernel: &[f32], n: usize, spikes: &[usize]) -> Vec<f32> {
    let mut trace = vec![0.0_f32; n];
    for &s in spikes {
        for (k, &kv) in kernel.iter().enumerate() {
            if s + k < n {
                trace[s + k] += kv;
            }
        }
    }
    trace
}

/// Scenario A: a single unit spike at t=0 (trace = kernel response, length
/// 128). The recovered train concentrates at t=0 with near-unit amplitude.
#[test]
fn impulse_at_origin_recovered() {
    let mut solver = Solver::new();
    solver.set_params(0.02, 0.4, 0.01, 30.0).unwrap();

    let kernel = build_kernel(0.02, 0.4, 30.0).unwrap();
    let trace = spike_trace(&kernel, 128, &[0]);
    solver.set_trace(&trace).unwrap();

    run_to_convergence(&mut solver, 500);

    let s = solver.get_solution();
    assert!(
        (0.8_f32..=1.0).contains(&s[0]),
        "s[0] should be in [0.8, 1.0], got {}",
        s[0]
    );
    for (i, &v) in s.iter().enumerate().skip(5) {
        assert!(v.abs() < 0.05, "s[{}] = {} should be < 0.05", i, v);
    }
}

/// Scenario B: pure noise with a heavy sparsity weight yields an (almost)
/// empty spike train.
#[test]
fn high_lambda_suppresses_noise() {
    let mut solver = Solver::new();
    solver.set_params(0.02, 0.4, 1.0, 30.0).unwrap();

    let mut noise = NoiseGen::new(0xCA1C_1043);
    let trace: Vec<f32> = (0..1000).map(|_| (0.1 * noise.gaussian()) as f32).collect();
    solver.set_trace(&trace).unwrap();

    run_to_convergence(&mut solver, 2000);

    let l1: f32 = solver.get_solution().iter().sum();
    assert!(l1 < 5.0, "||s||_1 = {} should be < 5 under lambda = 1", l1);
}

/// Scenario C: two well-separated spikes localise to within ±2 samples and
/// keep ≥ 0.9 of their mass inside a 5-sample window.
#[test]
fn two_spikes_localised() {
    let mut solver = Solver::new();
    solver.set_params(0.02, 0.4, 0.001, 30.0).unwrap();

    let kernel = build_kernel(0.02, 0.4, 30.0).unwrap();
    let trace = spike_trace(&kernel, 500, &[100, 300]);
    solver.set_trace(&trace).unwrap();

    run_to_convergence(&mut solver, 500);

    let s = solver.get_solution();
    for &spike in &[100_usize, 300] {
        let window_mass: f32 = s[spike.saturating_sub(2)..=spike + 2].iter().sum();
        assert!(
            window_mass >= 0.9,
            "mass near t={} is {} (< 0.9)",
            spike,
            window_mass
        );
        // Nothing substantial outside the window
        let outside: f32 = s
            .iter()
            .enumerate()
            .filter(|(i, _)| {
                (*i as i64 - 100).abs() > 2 && (*i as i64 - 300).abs() > 2
            })
            .map(|(_, v)| v)
            .sum();
        assert!(outside < 0.2, "stray mass {} outside spike windows", outside);
    }
}

/// Scenario D: solving the padded window for visible [400, 1600) matches the
/// full-trace solve on the inner region to ‖·‖∞ ≤ 1e-3.
#[test]
fn windowed_solve_matches_full_trace() {
    let kernel = build_kernel(0.02, 0.4, 30.0).unwrap();
    let spikes = [120, 450, 700, 1000, 1300, 1700, 1900];
    let trace = spike_trace(&kernel, 2000, &spikes);

    let tolerance = 1e-9; // tight convergence so window error dominates

    let mut full = Solver::new();
    full.set_params(0.02, 0.4, 0.01, 30.0).unwrap();
    full.set_tolerance(tolerance);
    full.set_trace(&trace).unwrap();
    run_to_convergence(&mut full, 5000);
    let full_s = full.get_solution();
    let full_r = full.get_reconvolution_with_baseline();

    let plan = WindowPlan::plan(400, 1600, trace.len(), 0.4, 30.0);
    assert_eq!(plan.padded_start, 340);
    assert_eq!(plan.padded_end, 1660);

    let mut windowed = Solver::new();
    windowed.set_params(0.02, 0.4, 0.01, 30.0).unwrap();
    windowed.set_tolerance(tolerance);
    windowed
        .set_trace(&trace[plan.padded_start..plan.padded_end])
        .unwrap();
    run_to_convergence(&mut windowed, 5000);
    let win_s = windowed.get_solution();
    let win_r = windowed.get_reconvolution_with_baseline();

    let mut max_err_s = 0.0_f32;
    let mut max_err_r = 0.0_f32;
    for i in 0..plan.result_length {
        let full_idx = plan.visible_start() + i;
        let win_idx = plan.result_offset + i;
        max_err_s = max_err_s.max((full_s[full_idx] - win_s[win_idx]).abs());
        max_err_r = max_err_r.max((full_r[full_idx] - win_r[win_idx]).abs());
    }

    assert!(max_err_s <= 1e-3, "spike train L∞ error {}", max_err_s);
    assert!(max_err_r <= 1e-3, "reconvolution L∞ error {}", max_err_r);
}

/// Scenario E: after convergence at λ, re-solving at 2λ from the exported
/// state takes at most half the iterations of a cold start, across several
/// noisy traces.
#[test]
fn warm_start_halves_iterations() {
    let kernel = build_kernel(0.02, 0.4, 30.0).unwrap();

    for seed in [11_u64, 23, 47] {
        let mut noise = NoiseGen::new(seed);
        let mut trace = spike_trace(&kernel, 600, &[50, 180, 320, 500]);
        for v in trace.iter_mut() {
            *v += (0.02 * noise.gaussian()) as f32;
        }

        // Cold solve at lambda = 0.01, export
        let mut first = Solver::new();
        first.set_params(0.02, 0.4, 0.01, 30.0).unwrap();
        first.set_trace(&trace).unwrap();
        run_to_convergence(&mut first, 2000);
        let state = first.export_state();

        // Warm re-solve at lambda = 0.02
        let mut warm = Solver::new();
        warm.set_params(0.02, 0.4, 0.02, 30.0).unwrap();
        warm.set_trace(&trace).unwrap();
        assert!(warm.load_state(&state));
        let resumed_from = warm.iteration_count();
        run_to_convergence(&mut warm, 2000);
        let warm_iters = warm.iteration_count() - resumed_from;

        // Cold solve at lambda = 0.02
        let mut cold = Solver::new();
        cold.set_params(0.02, 0.4, 0.02, 30.0).unwrap();
        cold.set_trace(&trace).unwrap();
        run_to_convergence(&mut cold, 2000);
        let cold_iters = cold.iteration_count();

        assert!(
            2 * warm_iters <= cold_iters,
            "seed {}: warm {} iters vs cold {} iters",
            seed,
            warm_iters,
            cold_iters
        );
    }
}
