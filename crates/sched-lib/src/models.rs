//! Monitoring data models

use crate::container::ContainerState;
use serde::{Deserialize, Serialize};

/// Read-only view of one container
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSnapshot {
    pub id: u64,
    pub name: String,
    pub state: ContainerState,
    pub constraints: Vec<ConstraintSnapshot>,
    pub cpu_consumed_ns: i64,
    pub cpu_limit_reached: u64,
    pub active_carriers: Vec<u64>,
    pub taken_at: i64,
}

/// Resource name and values of one constraint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstraintSnapshot {
    pub resource: String,
    pub values: Vec<i64>,
}

/// Counters of the carrier pool
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolStats {
    pub carriers: usize,
    pub runnable: usize,
    pub pending_timers: usize,
    pub live_tasks: usize,
    pub completed_tasks: u64,
    pub quota_delays: u64,
}
