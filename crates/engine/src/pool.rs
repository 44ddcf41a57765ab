//! Long-lived solver worker pool.
//!
//! Each worker is an OS thread owning one [`Solver`] and its buffers; the
//! host talks to it exclusively through channels. Between iteration batches
//! the worker drains its command queue, which is where cancellation is
//! observed, so cancel latency is bounded by one batch. Every accepted job
//! is terminated by exactly one of `Complete`, `Cancelled` or `Error`.

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::protocol::{SolveRequest, WarmStrategy, WorkerCommand, WorkerMsg};
use crossbeam_channel::{unbounded, Receiver, Sender};
use spiketune_solver::Solver;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Per-worker copy of the solve tuning knobs.
#[derive(Clone, Copy)]
struct WorkerCfg {
    batch_size: u32,
    intermediate_interval: Duration,
    convergence_rtol: f64,
    max_iterations: u32,
}

struct WorkerHandle {
    commands: Sender<WorkerCommand>,
    thread: Option<JoinHandle<()>>,
}

pub struct WorkerPool {
    workers: Vec<WorkerHandle>,
    results: Receiver<WorkerMsg>,
}

impl WorkerPool {
    /// Spawn the configured number of workers (clamped to [2, 8]). Spawn
    /// failures degrade the pool toward a single worker; only a pool with
    /// zero workers is an error.
    pub fn spawn(config: &EngineConfig) -> Result<WorkerPool, EngineError> {
        let requested = config.clamped_worker_count();
        let cfg = WorkerCfg {
            batch_size: config.batch_size.max(1),
            intermediate_interval: config.intermediate_interval(),
            convergence_rtol: config.convergence_rtol,
            max_iterations: config.max_iterations,
        };

        let (result_tx, result_rx) = unbounded();
        let mut workers = Vec::with_capacity(requested);
        let mut last_spawn_error = None;

        for id in 0..requested {
            let (cmd_tx, cmd_rx) = unbounded();
            let tx = result_tx.clone();
            let spawned = thread::Builder::new()
                .name(format!("spiketune-worker-{id}"))
                .spawn(move || worker_loop(id, cmd_rx, tx, cfg));
            match spawned {
                Ok(handle) => workers.push(WorkerHandle {
                    commands: cmd_tx,
                    thread: Some(handle),
                }),
                Err(e) => {
                    warn!(target: "pool.spawn", worker = id, error = %e, "worker spawn failed");
                    last_spawn_error = Some(e);
                }
            }
        }

        if workers.is_empty() {
            let reason = last_spawn_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no workers requested".into());
            return Err(EngineError::WorkerUnavailable(reason));
        }

        debug!(target: "pool.spawn", workers = workers.len(), "pool ready");
        Ok(WorkerPool {
            workers,
            results: result_rx,
        })
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Shared result stream for all workers.
    pub fn results(&self) -> &Receiver<WorkerMsg> {
        &self.results
    }

    /// Send a command to one worker. A send to a dead worker is logged and
    /// dropped; its in-flight job already ended in an `Error` or silence and
    /// the manager-side bookkeeping recovers via the result stream.
    pub fn send(&self, worker: usize, command: WorkerCommand) {
        if let Some(handle) = self.workers.get(worker) {
            if handle.commands.send(command).is_err() {
                warn!(target: "pool.send", worker, "worker channel disconnected");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        for handle in &self.workers {
            let _ = handle.commands.send(WorkerCommand::Shutdown);
        }
        for handle in &mut self.workers {
            if let Some(thread) = handle.thread.take() {
                let _ = thread.join();
            }
        }
    }
}

enum LoopCtl {
    Continue,
    Shutdown,
}

fn worker_loop(
    id: usize,
    commands: Receiver<WorkerCommand>,
    results: Sender<WorkerMsg>,
    cfg: WorkerCfg,
) {
    let mut solver = Solver::new();
    solver.set_tolerance(cfg.convergence_rtol);
    solver.set_max_iterations(cfg.max_iterations);
    // Set after a numeric failure: the next job gets a fresh solver with
    // newly allocated buffers.
    let mut needs_reset = false;

    if results.send(WorkerMsg::Ready { worker: id }).is_err() {
        return;
    }
    debug!(target: "pool.worker", worker = id, "started");

    loop {
        match commands.recv() {
            Err(_) => break, // host dropped the pool
            Ok(WorkerCommand::Shutdown) => break,
            // Cancel for a job that already finished: ignored by contract.
            Ok(WorkerCommand::Cancel { job_id }) => {
                debug!(target: "pool.worker", worker = id, job_id, "stale cancel ignored");
            }
            Ok(WorkerCommand::Solve(req)) => {
                let ctl = run_job(&mut solver, &mut needs_reset, req, &commands, &results, cfg);
                if matches!(ctl, LoopCtl::Shutdown) {
                    break;
                }
            }
        }
    }
    debug!(target: "pool.worker", worker = id, "stopped");
}

fn run_job(
    solver: &mut Solver,
    needs_reset: &mut bool,
    req: SolveRequest,
    commands: &Receiver<WorkerCommand>,
    results: &Sender<WorkerMsg>,
    cfg: WorkerCfg,
) -> LoopCtl {
    let job_id = req.job_id;

    if *needs_reset {
        *solver = Solver::new();
        solver.set_tolerance(cfg.convergence_rtol);
        solver.set_max_iterations(cfg.max_iterations);
        *needs_reset = false;
    }

    let p = req.params;
    if let Err(e) = solver.set_params(p.tau_rise, p.tau_decay, p.lambda, p.fs) {
        let _ = results.send(WorkerMsg::Error {
            job_id,
            message: e.to_string(),
        });
        return LoopCtl::Continue;
    }
    solver.set_filter_enabled(p.filter_enabled);
    if let Err(e) = solver.set_trace(&req.trace) {
        let _ = results.send(WorkerMsg::Error {
            job_id,
            message: e.to_string(),
        });
        return LoopCtl::Continue;
    }

    let filtered = solver.apply_filter().then(|| solver.get_trace());

    match req.warm_strategy {
        WarmStrategy::Cold => {}
        WarmStrategy::Warm => {
            if let Some(state) = req.warm_state.as_deref() {
                solver.load_state(state);
            }
        }
        WarmStrategy::WarmNoMomentum => {
            if let Some(state) = req.warm_state.as_deref() {
                if solver.load_state(state) {
                    solver.reset_momentum();
                }
            }
        }
    }

    let start_iteration = solver.iteration_count();
    let mut last_emit = Instant::now();

    // Iterations per slice. Starts at 1 to probe the per-iteration cost of
    // this trace length, then grows toward the configured batch size while a
    // slice stays under the latency budget. Keeps cancel latency bounded in
    // wall-clock terms even for very long traces.
    let mut batch = 1u32;
    const SLICE_BUDGET: Duration = Duration::from_millis(15);

    loop {
        // Drain inbound commands between batches; this is the cancellation point.
        loop {
            match commands.try_recv() {
                Err(_) => break,
                Ok(WorkerCommand::Cancel { job_id: id }) if id == job_id => {
                    let _ = results.send(WorkerMsg::Cancelled { job_id });
                    return LoopCtl::Continue;
                }
                Ok(WorkerCommand::Cancel { .. }) => {}
                Ok(WorkerCommand::Shutdown) => {
                    let _ = results.send(WorkerMsg::Cancelled { job_id });
                    return LoopCtl::Shutdown;
                }
                Ok(WorkerCommand::Solve(other)) => {
                    // One job at a time per worker; a second solve is a
                    // protocol violation and is refused, not queued.
                    let _ = results.send(WorkerMsg::Error {
                        job_id: other.job_id,
                        message: "worker busy".into(),
                    });
                }
            }
        }

        let slice_started = Instant::now();
        let converged = match solver.step_batch(batch) {
            Ok(converged) => converged,
            Err(e) => {
                *needs_reset = true;
                let _ = results.send(WorkerMsg::Error {
                    job_id,
                    message: e.to_string(),
                });
                return LoopCtl::Continue;
            }
        };
        let slice_elapsed = slice_started.elapsed();
        if slice_elapsed > SLICE_BUDGET {
            batch = (batch / 2).max(1);
        } else if slice_elapsed < SLICE_BUDGET / 3 && batch < cfg.batch_size {
            batch = (batch * 2).min(cfg.batch_size);
        }

        let used = solver.iteration_count() - start_iteration;
        let quantum_exhausted = req.max_iterations.is_some_and(|q| used >= q);

        if converged || quantum_exhausted {
            let msg = WorkerMsg::Complete {
                job_id,
                solution: solver.get_solution(),
                reconvolution: solver.get_reconvolution_with_baseline(),
                state: solver.export_state(),
                iterations: solver.iteration_count(),
                converged,
                filtered,
            };
            let _ = results.send(msg);
            return LoopCtl::Continue;
        }

        if last_emit.elapsed() >= cfg.intermediate_interval {
            let _ = results.send(WorkerMsg::Intermediate {
                job_id,
                solution: solver.get_solution(),
                reconvolution: solver.get_reconvolution_with_baseline(),
                iteration: solver.iteration_count(),
            });
            last_emit = Instant::now();
        }
    }
}
