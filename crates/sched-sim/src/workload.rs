//! Simulated workload: busy tasks in throttled and unlimited containers

use crate::config::SimConfig;
use anyhow::{Context, Result};
use sched_lib::{
    CarrierPool, ContainerConfig, ContainerSnapshot, PoolStats, SchedulerContext, Step,
    TaskContext, TaskOutcome,
};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Extra time allowed for tasks to observe the deadline and finish
const JOIN_GRACE: Duration = Duration::from_secs(10);

/// Outcome of a simulation run
#[derive(Debug, Serialize)]
pub struct Report {
    pub elapsed_ms: u64,
    pub pool: PoolStats,
    pub tasks: Vec<TaskReport>,
    pub containers: Vec<ContainerSnapshot>,
}

#[derive(Debug, Serialize)]
pub struct TaskReport {
    pub id: u64,
    pub container: String,
    pub outcome: String,
    pub slices: u64,
}

/// Run the configured containers and tasks until the deadline passes
pub fn run(config: &SimConfig) -> Result<Report> {
    let started = Instant::now();
    let ctx = SchedulerContext::new(config.scheduler.clone());
    let pool = CarrierPool::start(ctx.clone()).context("Failed to start carrier pool")?;

    let duration_ns = i64::try_from(config.duration_ms.saturating_mul(1_000_000)).unwrap_or(i64::MAX);
    let deadline = ctx.clock().now_ns().saturating_add(duration_ns);
    let slice = Duration::from_micros(config.slice_us);

    let mut spawned = Vec::new();
    for entry in &config.containers {
        let mut container_config = ContainerConfig::new(entry.name.clone());
        if let Some(percent) = entry.cpu_percent {
            container_config = container_config.cpu_percent(percent);
        }
        let container = ctx
            .create_container(container_config)
            .with_context(|| format!("Invalid container '{}'", entry.name))?;

        for _ in 0..entry.tasks {
            let slices = Arc::new(AtomicU64::new(0));
            let counter = slices.clone();
            let handle = pool.spawn(&container, move |cx: &mut TaskContext<'_>| {
                busy(slice);
                counter.fetch_add(1, Ordering::Relaxed);
                if cx.now_ns() >= deadline {
                    Step::Done
                } else {
                    Step::Yield
                }
            })?;
            spawned.push((entry.name.clone(), handle, slices));
        }
    }
    info!(
        containers = config.containers.len(),
        tasks = spawned.len(),
        duration_ms = config.duration_ms,
        "Workload started"
    );

    let mut tasks = Vec::with_capacity(spawned.len());
    for (container, handle, slices) in spawned {
        let outcome = match handle.join(Duration::from_millis(config.duration_ms) + JOIN_GRACE) {
            Ok(TaskOutcome::Completed) => "completed".to_string(),
            Ok(TaskOutcome::Cancelled) => "cancelled".to_string(),
            Ok(TaskOutcome::Failed(reason)) => format!("failed: {reason}"),
            Err(err) => {
                warn!(task_id = handle.id(), error = %err, "Task did not finish");
                "unfinished".to_string()
            }
        };
        tasks.push(TaskReport {
            id: handle.id(),
            container,
            outcome,
            slices: slices.load(Ordering::Relaxed),
        });
    }

    let stats = pool.stats();
    pool.shutdown();

    Ok(Report {
        elapsed_ms: started.elapsed().as_millis() as u64,
        pool: stats,
        tasks,
        containers: ctx.snapshots(),
    })
}

fn busy(duration: Duration) {
    let start = Instant::now();
    while start.elapsed() < duration {
        std::hint::spin_loop();
    }
}
