//! Observability infrastructure for the scheduler
//!
//! Provides:
//! - Prometheus metrics (attach/detach counts, quota delays, slice usage, carriers)
//! - Structured logging of container and carrier lifecycle events with tracing

use prometheus::{
    register_histogram, register_int_counter, register_int_gauge, Histogram, IntCounter,
    IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for quota delays and slice usage (in seconds)
const DURATION_BUCKETS: &[f64] = &[
    0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<SchedMetricsInner> = OnceLock::new();

struct SchedMetricsInner {
    containers_created: IntCounter,
    containers_destroyed: IntCounter,
    attaches: IntCounter,
    detaches: IntCounter,
    quota_rejections: IntCounter,
    quota_delay_seconds: Histogram,
    slice_usage_seconds: Histogram,
    live_carriers: IntGauge,
    tasks_spawned: IntCounter,
    tasks_completed: IntCounter,
}

impl SchedMetricsInner {
    fn new() -> Self {
        Self {
            containers_created: register_int_counter!(
                "sched_containers_created_total",
                "Resource containers created"
            )
            .expect("Failed to register containers_created"),

            containers_destroyed: register_int_counter!(
                "sched_containers_destroyed_total",
                "Resource containers destroyed"
            )
            .expect("Failed to register containers_destroyed"),

            attaches: register_int_counter!(
                "sched_container_attach_total",
                "Carrier attaches to non-root containers"
            )
            .expect("Failed to register attaches"),

            detaches: register_int_counter!(
                "sched_container_detach_total",
                "Carrier detaches from non-root containers"
            )
            .expect("Failed to register detaches"),

            quota_rejections: register_int_counter!(
                "sched_quota_rejections_total",
                "Admissions delayed because a CPU quota group was in debt"
            )
            .expect("Failed to register quota_rejections"),

            quota_delay_seconds: register_histogram!(
                "sched_quota_delay_seconds",
                "Delay imposed by CPU quota groups",
                DURATION_BUCKETS.to_vec()
            )
            .expect("Failed to register quota_delay_seconds"),

            slice_usage_seconds: register_histogram!(
                "sched_slice_usage_seconds",
                "CPU time accounted to quota groups per slice",
                DURATION_BUCKETS.to_vec()
            )
            .expect("Failed to register slice_usage_seconds"),

            live_carriers: register_int_gauge!(
                "sched_live_carriers",
                "Carrier threads currently registered"
            )
            .expect("Failed to register live_carriers"),

            tasks_spawned: register_int_counter!(
                "sched_tasks_spawned_total",
                "Tasks spawned on the carrier pool"
            )
            .expect("Failed to register tasks_spawned"),

            tasks_completed: register_int_counter!(
                "sched_tasks_completed_total",
                "Tasks that finished on the carrier pool"
            )
            .expect("Failed to register tasks_completed"),
        }
    }
}

fn ns_to_secs(ns: i64) -> f64 {
    ns.max(0) as f64 / 1_000_000_000.0
}

/// Scheduler metrics for Prometheus exposition
///
/// A lightweight handle to the global metrics instance; clones share the
/// same underlying metrics.
#[derive(Debug, Clone)]
pub struct SchedMetrics {
    _private: (),
}

impl Default for SchedMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl SchedMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(SchedMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &SchedMetricsInner {
        GLOBAL_METRICS.get_or_init(SchedMetricsInner::new)
    }

    pub fn inc_containers_created(&self) {
        self.inner().containers_created.inc();
    }

    pub fn inc_containers_destroyed(&self) {
        self.inner().containers_destroyed.inc();
    }

    pub fn inc_attach(&self) {
        self.inner().attaches.inc();
    }

    pub fn inc_detach(&self) {
        self.inner().detaches.inc();
    }

    pub fn inc_quota_rejections(&self) {
        self.inner().quota_rejections.inc();
    }

    pub fn observe_quota_delay(&self, delay_ns: i64) {
        self.inner().quota_delay_seconds.observe(ns_to_secs(delay_ns));
    }

    pub fn observe_slice_usage(&self, usage_ns: i64) {
        self.inner().slice_usage_seconds.observe(ns_to_secs(usage_ns));
    }

    pub fn inc_live_carriers(&self) {
        self.inner().live_carriers.inc();
    }

    pub fn dec_live_carriers(&self) {
        self.inner().live_carriers.dec();
    }

    /// Carriers registered across every context in this process
    pub fn live_carriers(&self) -> i64 {
        self.inner().live_carriers.get()
    }

    pub fn inc_tasks_spawned(&self) {
        self.inner().tasks_spawned.inc();
    }

    pub fn inc_tasks_completed(&self) {
        self.inner().tasks_completed.inc();
    }

    /// Total quota rejections recorded in this process
    pub fn quota_rejections(&self) -> u64 {
        self.inner().quota_rejections.get()
    }

    pub fn attaches(&self) -> u64 {
        self.inner().attaches.get()
    }
}

/// Structured logger for scheduler lifecycle events
#[derive(Debug, Clone)]
pub struct StructuredLogger {
    scope: String,
}

impl StructuredLogger {
    pub fn new(scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Log container creation; `quota` is `(quota_ns, period_ns)` if CPU-limited
    pub fn log_container_created(&self, container_id: u64, name: &str, quota: Option<(i64, i64)>) {
        info!(
            event = "container_created",
            scope = %self.scope,
            container_id = container_id,
            name = %name,
            quota_ns = ?quota.map(|(q, _)| q),
            period_ns = ?quota.map(|(_, p)| p),
            "Resource container created"
        );
    }

    pub fn log_container_destroyed(&self, container_id: u64, name: &str, active_carriers: usize) {
        info!(
            event = "container_destroyed",
            scope = %self.scope,
            container_id = container_id,
            name = %name,
            active_carriers = active_carriers,
            "Resource container destroyed"
        );
    }

    pub fn log_quota_limit_reached(&self, container_id: u64, task_id: u64, delay_ns: i64) {
        info!(
            event = "quota_limit_reached",
            scope = %self.scope,
            container_id = container_id,
            task_id = task_id,
            delay_ns = delay_ns,
            "Task delayed by CPU quota"
        );
    }

    pub fn log_carrier_started(&self, carrier_id: u64, name: &str) {
        info!(
            event = "carrier_started",
            scope = %self.scope,
            carrier_id = carrier_id,
            name = %name,
            "Carrier started"
        );
    }

    pub fn log_carrier_stopped(&self, carrier_id: u64, slices: u64) {
        info!(
            event = "carrier_stopped",
            scope = %self.scope,
            carrier_id = carrier_id,
            slices = slices,
            "Carrier stopped"
        );
    }

    pub fn log_task_failed(&self, task_id: u64, container_id: u64, reason: &str) {
        warn!(
            event = "task_failed",
            scope = %self.scope,
            task_id = task_id,
            container_id = container_id,
            reason = %reason,
            "Task failed"
        );
    }

    pub fn log_pool_shutdown(&self, cancelled_tasks: usize) {
        info!(
            event = "pool_shutdown",
            scope = %self.scope,
            cancelled_tasks = cancelled_tasks,
            "Carrier pool shut down"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = SchedMetrics::new();
        let before = metrics.attaches();
        metrics.inc_attach();
        metrics.inc_detach();
        metrics.observe_quota_delay(5_000_000);
        metrics.observe_slice_usage(-1);
        metrics.inc_live_carriers();
        metrics.dec_live_carriers();
        assert!(metrics.attaches() > before);

        // A second handle shares the registered metrics
        let other = SchedMetrics::default();
        other.inc_quota_rejections();
        assert!(metrics.quota_rejections() >= 1);
    }

    #[test]
    fn test_ns_to_secs() {
        assert_eq!(ns_to_secs(1_500_000_000), 1.5);
        assert_eq!(ns_to_secs(-10), 0.0);
    }

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("test-scope");
        assert_eq!(logger.scope(), "test-scope");
        logger.log_container_created(1, "tenant", Some((40, 100)));
    }
}
