//! Per-cell solver lifecycle manager.
//!
//! Single-owner, single-threaded: the host event loop calls [`CellSolveManager::tick`]
//! to drain worker results, expire the parameter debounce and dispatch work.
//! Workers never see this state; everything crosses the boundary through
//! the pool's channels with moved buffers.
//!
//! Scheduling: the ready queue is ordered by (active cell first, visible
//! cells next, admission order last). Under contention (more stale cells
//! than workers) jobs carry a bounded iteration quantum so workers cycle
//! through cells; an unconverged quantum requeues the cell at the tail of
//! its priority class as a warm start.

use crate::cache::{WarmStartCache, WarmStartEntry};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::pool::WorkerPool;
use crate::protocol::{SolveParams, SolveRequest, WarmStrategy, WorkerCommand, WorkerMsg};
use spiketune_solver::window::WindowPlan;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Solution change below which a completed-but-unconverged quantum counts as
/// "no visible progress" and earns a doubled quantum.
const PROGRESS_EPSILON: f32 = 1e-6;

/// Row-major [cells × time] trace matrix. Owned by the session; the manager
/// copies per-job window slices out of it so workers never share it.
#[derive(Debug)]
pub struct Dataset {
    data: Vec<f32>,
    num_cells: usize,
    num_timepoints: usize,
}

impl Dataset {
    pub fn new(data: Vec<f32>, num_cells: usize, num_timepoints: usize) -> Result<Self, EngineError> {
        if data.len() != num_cells * num_timepoints {
            return Err(EngineError::IoFormat(format!(
                "buffer holds {} samples, expected {} ({} cells × {} timepoints)",
                data.len(),
                num_cells * num_timepoints,
                num_cells,
                num_timepoints
            )));
        }
        Ok(Dataset {
            data,
            num_cells,
            num_timepoints,
        })
    }

    pub fn num_cells(&self) -> usize {
        self.num_cells
    }

    pub fn num_timepoints(&self) -> usize {
        self.num_timepoints
    }

    pub fn trace(&self, cell: usize) -> &[f32] {
        let start = cell * self.num_timepoints;
        &self.data[start..start + self.num_timepoints]
    }
}

/// Lifecycle state of a selected cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CellStatus {
    /// Parameters or window changed; awaiting (re)dispatch.
    Stale,
    /// A job for this cell is running on a worker.
    Solving,
    /// The stored result matches the current parameters and window.
    Fresh,
    /// The last solve failed; cleared by the next successful dispatch.
    Error(String),
}

#[derive(Debug)]
struct Cell {
    status: CellStatus,
    visible: bool,
    view: Option<(usize, usize)>,
    plan: WindowPlan,
    iteration: u32,
    solution: Vec<f32>,
    reconvolution: Vec<f32>,
    filtered: Option<Vec<f32>>,
    quantum: u32,
    /// In-flight job id; a cell has at most one job at a time, which is what
    /// guarantees per-cell result ordering.
    job: Option<u64>,
    last_strategy: Option<WarmStrategy>,
    cancel_requested: bool,
    /// Ready-queue admission ticket; None when not queued. Larger = later,
    /// so requeues land at the tail of their priority class.
    queued_seq: Option<u64>,
}

impl Cell {
    fn new(plan: WindowPlan, quantum: u32) -> Cell {
        Cell {
            status: CellStatus::Stale,
            visible: false,
            view: None,
            plan,
            iteration: 0,
            solution: Vec::new(),
            reconvolution: Vec::new(),
            filtered: None,
            quantum,
            job: None,
            last_strategy: None,
            cancel_requested: false,
            queued_seq: None,
        }
    }
}

struct JobInfo {
    cell: usize,
    worker: usize,
    plan: WindowPlan,
    params: SolveParams,
    param_version: u64,
    quantum: Option<u32>,
}

pub struct CellSolveManager {
    config: EngineConfig,
    pool: WorkerPool,
    dataset: Option<Arc<Dataset>>,

    params: SolveParams,
    param_version: u64,
    /// Trailing-debounce state: the latest requested parameters and when
    /// they were last touched.
    pending_params: Option<(SolveParams, Instant)>,

    cells: HashMap<usize, Cell>,
    selection: Vec<usize>,
    active_cell: Option<usize>,

    cache: WarmStartCache,
    jobs: HashMap<u64, JobInfo>,
    idle_workers: Vec<usize>,
    next_job_id: u64,
    queue_seq: u64,
}

impl CellSolveManager {
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        let pool = WorkerPool::spawn(&config)?;
        let idle_workers = (0..pool.worker_count()).collect();
        let cache = WarmStartCache::new(config.tau_change_threshold);
        Ok(CellSolveManager {
            config,
            pool,
            dataset: None,
            params: SolveParams::default(),
            param_version: 0,
            pending_params: None,
            cells: HashMap::new(),
            selection: Vec::new(),
            active_cell: None,
            cache,
            jobs: HashMap::new(),
            idle_workers,
            next_job_id: 0,
            queue_seq: 0,
        })
    }

    pub fn worker_count(&self) -> usize {
        self.pool.worker_count()
    }

    pub fn params(&self) -> SolveParams {
        self.pending_params
            .as_ref()
            .map(|(p, _)| *p)
            .unwrap_or(self.params)
    }

    /// Swap in a new dataset. Drops all cell state, selection and caches;
    /// in-flight jobs are cancelled and their late results ignored.
    pub fn set_dataset(&mut self, dataset: Arc<Dataset>) {
        let selected: Vec<usize> = self.selection.clone();
        for cell in selected {
            self.evict_cell(cell);
        }
        self.selection.clear();
        self.active_cell = None;
        self.cache.clear();
        self.dataset = Some(dataset);
    }

    pub fn dataset(&self) -> Option<&Arc<Dataset>> {
        self.dataset.as_ref()
    }

    /// Request new solve parameters. Changes are coalesced behind a trailing
    /// debounce; nothing is dispatched until the debounce expires in `tick`.
    pub fn set_params(&mut self, params: SolveParams) {
        self.pending_params = Some((params, Instant::now()));
    }

    /// Toggle the bandpass filter (debounced like any parameter change).
    pub fn set_filter_enabled(&mut self, enabled: bool) {
        let mut p = self.params();
        p.filter_enabled = enabled;
        self.set_params(p);
    }

    /// Replace the selected-cell set: newly selected cells are admitted as
    /// stale, deselected cells are dropped (their in-flight work cancelled
    /// and warm-start entries invalidated).
    pub fn select_cells(&mut self, cells: &[usize]) {
        let Some(dataset) = self.dataset.clone() else {
            warn!(target: "manager.select", "selection before dataset ignored");
            return;
        };

        let previous = self.selection.clone();
        for cell in previous {
            if !cells.contains(&cell) {
                self.evict_cell(cell);
            }
        }

        // Admit in index order so equal-priority cells keep a stable order.
        let mut admitted: Vec<usize> = cells
            .iter()
            .copied()
            .filter(|&c| c < dataset.num_cells())
            .collect();
        admitted.sort_unstable();
        admitted.dedup();

        for &cell in &admitted {
            if !self.cells.contains_key(&cell) {
                let plan = WindowPlan::full(dataset.num_timepoints());
                let mut state = Cell::new(plan, self.config.quantum_initial_iterations);
                state.queued_seq = Some(self.next_seq());
                self.cells.insert(cell, state);
            }
        }
        self.selection = admitted;

        if let Some(active) = self.active_cell {
            if !self.selection.contains(&active) {
                self.active_cell = None;
            }
        }
    }

    pub fn selected_cells(&self) -> &[usize] {
        &self.selection
    }

    /// Mark the cell whose parameters the user is editing; it schedules
    /// ahead of everything else.
    pub fn set_active_cell(&mut self, cell: Option<usize>) {
        self.active_cell = cell.filter(|c| self.selection.contains(c));
    }

    /// Visibility feeds scheduling priority only; the view range feeds the
    /// window planner.
    pub fn set_cell_visibility(&mut self, cell: usize, visible: bool) {
        if let Some(state) = self.cells.get_mut(&cell) {
            state.visible = visible;
        }
    }

    /// Re-plan the solve window for a cell around its visible sample range.
    /// A changed plan invalidates the current result.
    pub fn set_visible_window(&mut self, cell: usize, start: usize, end: usize) {
        let Some(dataset) = self.dataset.clone() else {
            return;
        };
        let params = self.params();
        let Some(state) = self.cells.get_mut(&cell) else {
            return;
        };
        state.visible = true;
        state.view = Some((start, end));

        let plan = WindowPlan::plan(
            start,
            end,
            dataset.num_timepoints(),
            params.tau_decay,
            params.fs,
        );
        if plan != state.plan {
            state.plan = plan;
            self.invalidate_cell(cell);
        }
    }

    pub fn status(&self, cell: usize) -> Option<&CellStatus> {
        self.cells.get(&cell).map(|c| &c.status)
    }

    pub fn iteration(&self, cell: usize) -> Option<u32> {
        self.cells.get(&cell).map(|c| c.iteration)
    }

    /// Latest emitted spike-train slice for the cell's visible region.
    pub fn solution(&self, cell: usize) -> Option<&[f32]> {
        self.cells.get(&cell).map(|c| c.solution.as_slice())
    }

    pub fn reconvolution(&self, cell: usize) -> Option<&[f32]> {
        self.cells.get(&cell).map(|c| c.reconvolution.as_slice())
    }

    pub fn filtered_trace(&self, cell: usize) -> Option<&[f32]> {
        self.cells
            .get(&cell)
            .and_then(|c| c.filtered.as_deref())
    }

    /// Total jobs handed to the pool since startup (observable dispatch
    /// counter).
    pub fn dispatched_jobs(&self) -> u64 {
        self.next_job_id
    }

    /// Warm-start strategy the cell's most recent dispatch used.
    pub fn last_strategy(&self, cell: usize) -> Option<WarmStrategy> {
        self.cells.get(&cell).and_then(|c| c.last_strategy)
    }

    /// True when nothing is pending: no debounce in flight, no queued cells,
    /// no running jobs.
    pub fn is_quiescent(&self) -> bool {
        self.pending_params.is_none()
            && self.jobs.is_empty()
            && self.cells.values().all(|c| c.queued_seq.is_none())
    }

    /// Pump the engine: drain worker results, expire the parameter debounce,
    /// dispatch ready cells to idle workers. Hosts call this from their
    /// event loop.
    pub fn tick(&mut self) {
        self.tick_at(Instant::now());
    }

    pub fn tick_at(&mut self, now: Instant) {
        self.drain_results();
        self.apply_debounced_params(now);
        self.dispatch();
    }

    // --- internals ---

    fn next_seq(&mut self) -> u64 {
        self.queue_seq += 1;
        self.queue_seq
    }

    fn enqueue(&mut self, cell: usize) {
        let seq = self.next_seq();
        if let Some(state) = self.cells.get_mut(&cell) {
            if state.queued_seq.is_none() {
                state.queued_seq = Some(seq);
            }
        }
    }

    /// Invalidate a cell's current result: queue it for re-solve, cancelling
    /// any in-flight job first. Status flips to Stale either immediately or
    /// when the worker acknowledges the cancel.
    fn invalidate_cell(&mut self, cell: usize) {
        let Some(state) = self.cells.get_mut(&cell) else {
            return;
        };
        if let Some(job_id) = state.job {
            if !state.cancel_requested {
                state.cancel_requested = true;
                if let Some(job) = self.jobs.get(&job_id) {
                    self.pool
                        .send(job.worker, WorkerCommand::Cancel { job_id });
                }
            }
        } else {
            state.status = CellStatus::Stale;
            self.enqueue(cell);
        }
    }

    fn evict_cell(&mut self, cell: usize) {
        if let Some(state) = self.cells.remove(&cell) {
            if let Some(job_id) = state.job {
                if let Some(job) = self.jobs.get(&job_id) {
                    self.pool
                        .send(job.worker, WorkerCommand::Cancel { job_id });
                }
            }
        }
        self.cache.invalidate(cell);
        self.selection.retain(|&c| c != cell);
    }

    fn apply_debounced_params(&mut self, now: Instant) {
        let Some((params, touched)) = self.pending_params else {
            return;
        };
        if now.duration_since(touched) < self.config.solve_debounce() {
            return;
        }
        self.pending_params = None;

        if params == self.params {
            return;
        }
        self.params = params;
        self.param_version += 1;
        debug!(
            target: "manager.params",
            version = self.param_version,
            tau_rise = params.tau_rise,
            tau_decay = params.tau_decay,
            lambda = params.lambda,
            fs = params.fs,
            "parameters applied"
        );

        // Re-plan windows (padding depends on τ_decay and fs) and mark every
        // selected cell stale.
        let timepoints = self.dataset.as_ref().map(|d| d.num_timepoints());
        let selected = self.selection.clone();
        for cell in selected {
            if let (Some(state), Some(n)) = (self.cells.get_mut(&cell), timepoints) {
                if let Some((start, end)) = state.view {
                    state.plan = WindowPlan::plan(start, end, n, params.tau_decay, params.fs);
                }
                state.quantum = self.config.quantum_initial_iterations;
            }
            self.invalidate_cell(cell);
        }
    }

    fn dispatch(&mut self) {
        let Some(dataset) = self.dataset.clone() else {
            return;
        };

        loop {
            if self.idle_workers.is_empty() {
                return;
            }
            let Some(cell) = self.pop_ready_cell() else {
                return;
            };

            let stale_backlog = 1 + self
                .cells
                .values()
                .filter(|c| c.queued_seq.is_some())
                .count();
            let contended = stale_backlog > self.pool.worker_count();

            let state = self.cells.get_mut(&cell).expect("ready cell exists");
            let plan = state.plan;
            let quantum = contended.then_some(state.quantum);

            let params = self.params;
            let strategy = self.cache.classify(cell, &params, &plan);
            let warm_state = match strategy {
                WarmStrategy::Cold => None,
                // The cache keeps its entry; the job gets its own copy and
                // moves it to the worker.
                _ => self.cache.get(cell).map(|e| e.state.clone()),
            };

            let job_id = self.next_job_id;
            self.next_job_id += 1;
            let worker = self.idle_workers.pop().expect("checked non-empty");

            let state = self.cells.get_mut(&cell).expect("ready cell exists");
            state.job = Some(job_id);
            state.last_strategy = Some(strategy);
            state.cancel_requested = false;
            state.status = CellStatus::Solving;

            self.jobs.insert(
                job_id,
                JobInfo {
                    cell,
                    worker,
                    plan,
                    params,
                    param_version: self.param_version,
                    quantum,
                },
            );

            debug!(
                target: "manager.dispatch",
                cell, job_id, worker,
                strategy = ?strategy,
                quantum = ?quantum,
                "dispatch"
            );

            let trace = dataset.trace(cell)[plan.padded_start..plan.padded_end].to_vec();
            self.pool.send(
                worker,
                WorkerCommand::Solve(SolveRequest {
                    job_id,
                    trace,
                    params,
                    warm_state,
                    warm_strategy: strategy,
                    max_iterations: quantum,
                }),
            );
        }
    }

    /// Take the highest-priority queued cell: active first, then visible,
    /// then admission order (which doubles as the requeue tail).
    fn pop_ready_cell(&mut self) -> Option<usize> {
        let mut best: Option<(bool, bool, u64, usize)> = None;
        for (&cell, state) in &self.cells {
            let Some(seq) = state.queued_seq else {
                continue;
            };
            if state.job.is_some() {
                continue;
            }
            let key = (
                Some(cell) != self.active_cell, // false sorts first
                !state.visible,
                seq,
                cell,
            );
            if best.map_or(true, |b| key < b) {
                best = Some(key);
            }
        }
        let (_, _, _, cell) = best?;
        if let Some(state) = self.cells.get_mut(&cell) {
            state.queued_seq = None;
        }
        Some(cell)
    }

    fn drain_results(&mut self) {
        while let Ok(msg) = self.pool.results().try_recv() {
            match msg {
                WorkerMsg::Ready { worker } => {
                    debug!(target: "manager.pool", worker, "worker ready");
                }
                WorkerMsg::Intermediate {
                    job_id,
                    solution,
                    reconvolution,
                    iteration,
                } => {
                    let Some(job) = self.jobs.get(&job_id) else {
                        continue;
                    };
                    let plan = job.plan;
                    let cell = job.cell;
                    if let Some(state) = self.cells.get_mut(&cell) {
                        state.solution = emit_slice(&solution, &plan);
                        state.reconvolution = emit_slice(&reconvolution, &plan);
                        state.iteration = iteration;
                    }
                }
                WorkerMsg::Complete {
                    job_id,
                    solution,
                    reconvolution,
                    state,
                    iterations,
                    converged,
                    filtered,
                } => {
                    let Some(job) = self.jobs.remove(&job_id) else {
                        continue;
                    };
                    self.idle_workers.push(job.worker);

                    if !self.cells.contains_key(&job.cell) {
                        continue; // evicted while in flight; drop the result
                    }
                    self.cache.store(
                        job.cell,
                        WarmStartEntry {
                            state,
                            params: job.params,
                            window: job.plan,
                        },
                    );

                    let cell_state = self
                        .cells
                        .get_mut(&job.cell)
                        .expect("checked above");
                    cell_state.job = None;
                    cell_state.cancel_requested = false;
                    cell_state.iteration = iterations;

                    let new_solution = emit_slice(&solution, &job.plan);
                    let progressed = max_abs_diff(&cell_state.solution, &new_solution)
                        > PROGRESS_EPSILON;
                    cell_state.solution = new_solution;
                    cell_state.reconvolution = emit_slice(&reconvolution, &job.plan);
                    if let Some(filtered) = filtered {
                        cell_state.filtered = Some(emit_slice(&filtered, &job.plan));
                    } else {
                        cell_state.filtered = None;
                    }

                    let current = job.param_version == self.param_version
                        && job.plan == cell_state.plan;
                    if !current {
                        cell_state.status = CellStatus::Stale;
                        self.enqueue(job.cell);
                    } else if converged {
                        cell_state.status = CellStatus::Fresh;
                        cell_state.quantum = self.config.quantum_initial_iterations;
                    } else {
                        // Quantum exhausted: requeue at the tail of its
                        // class as a warm start; a no-progress quantum earns
                        // a doubled budget to cut dispatch overhead.
                        if job.quantum.is_some() && !progressed {
                            cell_state.quantum = (cell_state.quantum.saturating_mul(2))
                                .min(self.config.max_iterations);
                        }
                        cell_state.status = CellStatus::Stale;
                        self.enqueue(job.cell);
                    }
                }
                WorkerMsg::Cancelled { job_id } => {
                    let Some(job) = self.jobs.remove(&job_id) else {
                        continue;
                    };
                    self.idle_workers.push(job.worker);
                    if let Some(state) = self.cells.get_mut(&job.cell) {
                        state.job = None;
                        state.cancel_requested = false;
                        state.status = CellStatus::Stale;
                        self.enqueue(job.cell);
                    }
                }
                WorkerMsg::Error { job_id, message } => {
                    let Some(job) = self.jobs.remove(&job_id) else {
                        continue;
                    };
                    self.idle_workers.push(job.worker);
                    warn!(target: "manager.job", cell = job.cell, job_id, %message, "solve failed");
                    self.cache.invalidate(job.cell);
                    if let Some(state) = self.cells.get_mut(&job.cell) {
                        state.job = None;
                        state.cancel_requested = false;
                        state.status = CellStatus::Error(message);
                    }
                }
            }
        }
    }
}

/// Cut the emitted (visible) slice out of a padded-window result.
fn emit_slice(padded: &[f32], plan: &WindowPlan) -> Vec<f32> {
    let start = plan.result_offset.min(padded.len());
    let end = (plan.result_offset + plan.result_length).min(padded.len());
    padded[start..end].to_vec()
}

fn max_abs_diff(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return f32::INFINITY;
    }
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y).abs())
        .fold(0.0, f32::max)
}
