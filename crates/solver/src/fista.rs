use crate::fft::Pass;
use crate::{Solver, SolverError};

impl Solver {
    /// Run up to `n_steps` FISTA iterations. Returns Ok(true) once converged.
    ///
    /// Standard Beck & Teboulle FISTA with two sequences:
    /// - x_k (`solution`): the proximal update point
    /// - y_k (`solution_prev`): the extrapolated point where the gradient is
    ///   evaluated
    ///
    /// Each iteration evaluates the gradient at y_k, takes the proximal step
    /// to x_{k+1}, refreshes the scalar baseline b = mean(y - K·x_{k+1}),
    /// and extrapolates to y_{k+1}. Adaptive restart (O'Donoghue & Candes
    /// 2015): when the objective increases, momentum is dropped to stop the
    /// oscillation the non-negativity projection otherwise feeds.
    ///
    /// A NaN/Inf objective halts the solve with `NumericNonFinite`; the
    /// solver stays poisoned until the next `set_trace`.
    pub fn step_batch(&mut self, n_steps: u32) -> Result<bool, SolverError> {
        if self.poisoned {
            return Err(SolverError::NumericNonFinite {
                iteration: self.iteration,
            });
        }

        let n = self.active_len;
        if n == 0 {
            self.converged = true;
            return Ok(true);
        }

        let step_size = 1.0 / self.lipschitz_constant;
        let step_f32 = step_size as f32;
        let threshold = (step_size * self.effective_lambda()) as f32;

        for _ in 0..n_steps {
            if self.converged {
                return Ok(true);
            }

            // 1. Forward convolution at the extrapolated point:
            //    reconvolution = K * y_k  (y_0 = x_0 = zeros on a cold start)
            self.convolve_forward_from_prev();

            // 2. Residual at y_k including the current baseline
            let b = self.baseline as f32;
            for i in 0..n {
                self.residual_buf[i] = self.reconvolution[i] + b - self.trace[i];
            }

            // 3. Adjoint convolution: gradient = K^T * residual
            self.convolve_adjoint();

            // 4. Save x_k (residual_buf is free again) and take the proximal
            //    step: x_{k+1} = max(0, y_k - step·grad - step·λ·G_dc)
            for i in 0..n {
                self.residual_buf[i] = self.solution[i];
                let z = self.solution_prev[i] - step_f32 * self.gradient[i];
                self.solution[i] = (z - threshold).max(0.0);
            }

            // 5. Closed-form baseline at the new solution:
            //    b = mean(trace - K * x_{k+1})
            self.convolve_forward();
            let mut sum = 0.0_f64;
            for i in 0..n {
                sum += (self.trace[i] - self.reconvolution[i]) as f64;
            }
            self.baseline = sum / n as f64;

            // 6. Objective at x_{k+1} for the restart and convergence checks
            let objective = self.objective_at_solution();
            self.iteration += 1;

            if !objective.is_finite() {
                self.poisoned = true;
                return Err(SolverError::NumericNonFinite {
                    iteration: self.iteration,
                });
            }

            // 7. Adaptive restart: objective went up, drop momentum
            if objective > self.prev_objective && self.iteration > 1 {
                self.t_fista = 1.0;
            }

            // 8. Momentum extrapolation, projected back to the feasible set:
            //    y_{k+1} = max(0, x_{k+1} + m·(x_{k+1} - x_k))
            //    With t = 1 (fresh or restarted) m = 0, so y_{k+1} = x_{k+1}.
            let t_new = (1.0 + (1.0 + 4.0 * self.t_fista * self.t_fista).sqrt()) / 2.0;
            let momentum = ((self.t_fista - 1.0) / t_new) as f32;
            for i in 0..n {
                let x_old = self.residual_buf[i];
                let x_new = self.solution[i];
                self.solution_prev[i] = (x_new + momentum * (x_new - x_old)).max(0.0);
            }
            self.t_fista = t_new;

            // 9. Convergence: relative objective change below tolerance
            //    (after a short floor so the first momentum ramp-up cannot
            //    fake convergence), or the hard iteration cap.
            if self.iteration > 5 {
                let rel_change =
                    (self.prev_objective - objective).abs() / (self.prev_objective.abs() + 1e-10);
                if rel_change < self.tolerance {
                    self.converged = true;
                }
            }
            if self.iteration >= self.max_iterations {
                self.converged = true;
            }
            self.prev_objective = objective;

            // reconvolution currently holds K*x_{k+1} and the baseline is
            // current, so the getters need no recompute
            self.reconvolution_stale = false;
        }

        Ok(self.converged)
    }

    /// Objective at the current solution:
    /// (1/2)||y - K·s - b||² + λ·G_dc·||s||₁.
    pub fn objective(&mut self) -> f64 {
        if self.reconvolution_stale {
            let _ = self.get_reconvolution();
        }
        self.objective_at_solution()
    }

    /// Objective assuming `reconvolution` holds K·s for the current s.
    fn objective_at_solution(&self) -> f64 {
        let n = self.active_len;
        let mut data_fidelity = 0.0_f64;
        let mut l1_penalty = 0.0_f64;

        for i in 0..n {
            let residual =
                self.reconvolution[i] as f64 + self.baseline - self.trace[i] as f64;
            data_fidelity += residual * residual;
            // solution is non-negative, so ||s||_1 = sum(s)
            l1_penalty += self.solution[i] as f64;
        }

        0.5 * data_fidelity + self.effective_lambda() * l1_penalty
    }

    /// Forward (causal) convolution of the current solution:
    /// reconvolution[t] = Σ_k kernel[k] · solution[t-k].
    fn convolve_forward(&mut self) {
        let n = self.active_len;
        if self.fft.is_ready() {
            self.fft.convolve(
                Pass::Forward,
                &self.solution[..n],
                n,
                &mut self.reconvolution[..n],
            );
            return;
        }

        let k_len = self.kernel.len();
        for t in 0..n {
            let mut sum = 0.0;
            for k in 0..k_len.min(t + 1) {
                sum += self.kernel[k] * self.solution[t - k];
            }
            self.reconvolution[t] = sum;
        }
    }

    /// Forward convolution of the extrapolated point y_k (`solution_prev`).
    fn convolve_forward_from_prev(&mut self) {
        let n = self.active_len;
        if self.fft.is_ready() {
            self.fft.convolve(
                Pass::Forward,
                &self.solution_prev[..n],
                n,
                &mut self.reconvolution[..n],
            );
            return;
        }

        let k_len = self.kernel.len();
        for t in 0..n {
            let mut sum = 0.0;
            for k in 0..k_len.min(t + 1) {
                sum += self.kernel[k] * self.solution_prev[t - k];
            }
            self.reconvolution[t] = sum;
        }
    }

    /// Adjoint (correlation) convolution of the residual:
    /// gradient[t] = Σ_k kernel[k] · residual_buf[t+k].
    fn convolve_adjoint(&mut self) {
        let n = self.active_len;
        if self.fft.is_ready() {
            self.fft.convolve(
                Pass::Adjoint,
                &self.residual_buf[..n],
                n,
                &mut self.gradient[..n],
            );
            return;
        }

        let k_len = self.kernel.len();
        for t in 0..n {
            let mut sum = 0.0;
            for k in 0..k_len.min(n - t) {
                sum += self.kernel[k] * self.residual_buf[t + k];
            }
            self.gradient[t] = sum;
        }
    }
}
