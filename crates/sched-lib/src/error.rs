//! Error types for the scheduler library
//!
//! Validation failures (bad constraint data) and state failures (caller
//! protocol violations) are kept in separate enums so callers can tell
//! them apart.

use thiserror::Error;

/// A constraint was rejected by its resource type's validation rule
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConstraintError {
    #[error("{resource} expects {expected} value(s), got {actual}")]
    Arity {
        resource: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("{resource} value {value} is outside [{min}, {max}]")]
    OutOfRange {
        resource: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },

    #[error("{resource}: {reason}")]
    Invalid {
        resource: &'static str,
        reason: String,
    },
}

/// A quota group could not be built from the supplied parameters
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuotaError {
    #[error("quota and period must be positive (quota={quota_ns}ns, period={period_ns}ns)")]
    NonPositive { quota_ns: i64, period_ns: i64 },
}

/// Errors raised by resource container operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContainerError {
    /// The container has been destroyed
    #[error("container {id} is destroyed")]
    Destroyed { id: u64 },

    /// The carrier is attached to another non-root container
    #[error("carrier {carrier_id} is attached to container {current}, cannot attach to {requested}")]
    NestedAttach {
        carrier_id: u64,
        current: u64,
        requested: u64,
    },

    /// The operation is not available on the root container
    #[error("operation '{0}' is not supported on the root container")]
    Unsupported(&'static str),

    #[error(transparent)]
    Constraint(#[from] ConstraintError),

    #[error(transparent)]
    Quota(#[from] QuotaError),
}

impl ContainerError {
    /// True for caller protocol violations (as opposed to bad data)
    pub fn is_illegal_state(&self) -> bool {
        matches!(
            self,
            ContainerError::Destroyed { .. }
                | ContainerError::NestedAttach { .. }
                | ContainerError::Unsupported(_)
        )
    }
}

/// Errors surfaced by the carrier pool
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    #[error("carrier pool is shut down")]
    ShutDown,

    #[error("timed out waiting for task {0}")]
    JoinTimeout(u64),

    #[error("unknown task {0}")]
    UnknownTask(u64),

    #[error("failed to spawn carrier thread: {0}")]
    Spawn(String),
}

/// Result type for container operations
pub type Result<T> = std::result::Result<T, ContainerError>;
