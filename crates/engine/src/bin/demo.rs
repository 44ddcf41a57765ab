//! No-UI demo driver: generate a synthetic dataset, tune all cells to
//! convergence through the full manager/pool stack, and print the outcome.
//!
//! Run with `RUST_LOG=debug` for dispatch-level detail.

use spiketune_engine::export::{ExportDocument, Metadata};
use spiketune_engine::synth::{generate_dataset, SynthConfig};
use spiketune_engine::{CellSolveManager, CellStatus, Dataset, EngineConfig, SolveParams};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = EngineConfig::default();

    let num_cells = 8;
    let synth_config = SynthConfig {
        num_frames: 6000,
        sim_spike_hz: config.sim_spike_hz,
        ..SynthConfig::default()
    };
    let synth = generate_dataset(&synth_config, num_cells, 20240117)?;
    info!(num_cells, num_frames = synth.num_frames, "synthetic dataset ready");

    let mut manager = CellSolveManager::new(config)?;
    info!(workers = manager.worker_count(), "pool spawned");

    manager.set_dataset(Arc::new(Dataset::new(
        synth.data,
        synth.num_cells,
        synth.num_frames,
    )?));

    let cells: Vec<usize> = (0..num_cells).collect();
    manager.select_cells(&cells);
    manager.set_active_cell(Some(0));

    let params = SolveParams::default();
    manager.set_params(params);

    let started = Instant::now();
    while !manager.is_quiescent() {
        manager.tick();
        std::thread::sleep(Duration::from_millis(2));
        if started.elapsed() > Duration::from_secs(120) {
            return Err("engine did not quiesce within 120 s".into());
        }
    }

    for &cell in &cells {
        let status = manager.status(cell).cloned();
        let iterations = manager.iteration(cell).unwrap_or(0);
        let spike_mass: f32 = manager
            .solution(cell)
            .map(|s| s.iter().sum())
            .unwrap_or(0.0);
        let true_mass: f32 = synth.spikes[cell].iter().sum();
        info!(
            cell,
            ?status,
            iterations,
            spike_mass,
            true_mass,
            "cell finished"
        );
        if !matches!(status, Some(CellStatus::Fresh)) {
            return Err(format!("cell {cell} did not reach Fresh").into());
        }
    }
    info!(elapsed_ms = started.elapsed().as_millis() as u64, "all cells fresh");

    let doc = ExportDocument::new(
        &params,
        Metadata {
            source_filename: None,
            num_cells: Some(num_cells),
            num_timepoints: Some(synth.num_frames),
        },
    )?;
    println!("{}", doc.to_json()?);

    Ok(())
}
