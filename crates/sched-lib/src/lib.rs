//! Scheduler library for CPU-quota resource containers
//!
//! This crate provides the core functionality for:
//! - Resource containers with an attach/detach state machine per carrier
//! - CFS-style CPU quota groups (token bucket with prorated refill)
//! - A carrier pool running cooperative tasks under quota admission
//! - A deadline-ordered timer queue with arbitrary removal
//! - Typed, validated resource constraints
//! - Metrics and structured logging

pub mod clock;
pub mod config;
pub mod constraint;
pub mod container;
pub mod error;
pub mod models;
pub mod observability;
pub mod quota;
pub mod scheduler;
pub mod timer;

pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::SchedulerConfig;
pub use constraint::{Constraint, ResourceType, CPU_PERCENT, HEAP_RETAINED};
pub use container::{
    ContainerConfig, ContainerHooks, ContainerLocal, ContainerState, ResourceContainer,
    SchedulerContext, ROOT_CONTAINER_ID,
};
pub use error::{ConstraintError, ContainerError, QuotaError, SchedulerError};
pub use models::*;
pub use observability::{SchedMetrics, StructuredLogger};
pub use quota::{CpuQuotaGroup, TaskAccount};
pub use scheduler::{CarrierPool, Step, TaskBody, TaskContext, TaskHandle, TaskOutcome};
pub use timer::{TimerAction, TimerEntry, TimerId, TimerQueue};
