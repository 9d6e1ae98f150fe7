//! sched-sim - carrier scheduler simulation
//!
//! Starts a carrier pool, runs busy tasks in CPU-limited and unlimited
//! containers, then prints pool statistics and container snapshots as JSON.

use anyhow::Result;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;
mod workload;

const SIM_VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!(version = SIM_VERSION, "Starting sched-sim");

    let config = config::SimConfig::load()?;
    info!(
        carriers = config.scheduler.carriers,
        cpu_cores = config.scheduler.cpu_cores,
        containers = config.containers.len(),
        duration_ms = config.duration_ms,
        "Simulation configured"
    );

    let report = workload::run(&config)?;
    info!(
        elapsed_ms = report.elapsed_ms,
        completed_tasks = report.pool.completed_tasks,
        quota_delays = report.pool.quota_delays,
        "Simulation finished"
    );

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
