//! Scheduler configuration

use serde::Deserialize;

/// Default CFS accounting period (100ms)
pub const DEFAULT_CFS_PERIOD_NS: i64 = 100_000_000;

/// Shortest accounting period a quota group may use (10ms)
pub const DEFAULT_MIN_PERIOD_NS: i64 = 10_000_000;

/// Longest accounting period a quota group may use (1s)
pub const DEFAULT_MAX_PERIOD_NS: i64 = 1_000_000_000;

/// Nominal scheduler time slice (1ms)
pub const DEFAULT_SCHED_QUANTUM_NS: i64 = 1_000_000;

/// Scheduler configuration shared by the context, containers and the pool
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Number of carrier threads started by the pool
    #[serde(default = "default_parallelism")]
    pub carriers: usize,

    /// Core count used to validate CPU_PERCENT constraints
    #[serde(default = "default_parallelism")]
    pub cpu_cores: usize,

    /// CFS period override in nanoseconds
    #[serde(default = "default_cfs_period")]
    pub cfs_period_ns: i64,

    /// Lower clamp for derived periods
    #[serde(default = "default_min_period")]
    pub min_period_ns: i64,

    /// Upper clamp for derived periods
    #[serde(default = "default_max_period")]
    pub max_period_ns: i64,

    /// Scheduler quantum used to size small-percentage periods
    #[serde(default = "default_sched_quantum")]
    pub sched_quantum_ns: i64,

    /// Minimum number of quanta a group must get per period
    #[serde(default = "default_min_quanta")]
    pub min_quanta_per_period: i64,

    /// Heap limit applied to containers that do not declare one
    #[serde(default)]
    pub heap_retained_default: Option<i64>,
}

fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_cfs_period() -> i64 {
    DEFAULT_CFS_PERIOD_NS
}

fn default_min_period() -> i64 {
    DEFAULT_MIN_PERIOD_NS
}

fn default_max_period() -> i64 {
    DEFAULT_MAX_PERIOD_NS
}

fn default_sched_quantum() -> i64 {
    DEFAULT_SCHED_QUANTUM_NS
}

fn default_min_quanta() -> i64 {
    4
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            carriers: default_parallelism(),
            cpu_cores: default_parallelism(),
            cfs_period_ns: default_cfs_period(),
            min_period_ns: default_min_period(),
            max_period_ns: default_max_period(),
            sched_quantum_ns: default_sched_quantum(),
            min_quanta_per_period: default_min_quanta(),
            heap_retained_default: None,
        }
    }
}

impl SchedulerConfig {
    /// Configuration with a fixed number of carriers
    pub fn with_carriers(carriers: usize) -> Self {
        Self {
            carriers: carriers.max(1),
            ..Default::default()
        }
    }

    /// Derive `(quota_ns, period_ns)` for a CPU percentage
    ///
    /// Small percentages get a longer period so the group still receives at
    /// least `min_quanta_per_period` quanta per window. The period is then
    /// clamped to `[min_period_ns, max_period_ns]`.
    pub fn quota_for_percent(&self, percent: i64) -> (i64, i64) {
        let percent = percent.max(1);
        let min_quota = self.sched_quantum_ns.saturating_mul(self.min_quanta_per_period);

        let mut period = self.cfs_period_ns;
        if period.saturating_mul(percent) / 100 < min_quota {
            // ceil(min_quota * 100 / percent)
            period = (min_quota.saturating_mul(100) + percent - 1) / percent;
        }
        let period = period.clamp(
            self.min_period_ns,
            self.max_period_ns.max(self.min_period_ns),
        );
        let quota = (period.saturating_mul(percent) / 100).max(1);
        (quota, period)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SchedulerConfig::default();
        assert!(config.carriers >= 1);
        assert_eq!(config.cfs_period_ns, 100_000_000);
        assert_eq!(config.min_quanta_per_period, 4);
        assert!(config.heap_retained_default.is_none());
    }

    #[test]
    fn test_deserialize_partial() {
        let config: SchedulerConfig =
            serde_json::from_str(r#"{"carriers": 3, "cfs_period_ns": 50000000}"#).unwrap();
        assert_eq!(config.carriers, 3);
        assert_eq!(config.cfs_period_ns, 50_000_000);
        assert_eq!(config.max_period_ns, DEFAULT_MAX_PERIOD_NS);
    }

    #[test]
    fn test_quota_for_regular_percent() {
        let config = SchedulerConfig::default();
        assert_eq!(config.quota_for_percent(40), (40_000_000, 100_000_000));
        assert_eq!(config.quota_for_percent(200), (200_000_000, 100_000_000));
    }

    #[test]
    fn test_quota_for_small_percent_stretches_period() {
        let config = SchedulerConfig::default();
        // 1% of 100ms is 1ms, below 4 quanta: the period grows to 400ms
        let (quota, period) = config.quota_for_percent(1);
        assert_eq!(period, 400_000_000);
        assert_eq!(quota, 4_000_000);
    }

    #[test]
    fn test_quota_for_percent_respects_max_period() {
        let config = SchedulerConfig {
            max_period_ns: 200_000_000,
            ..Default::default()
        };
        let (quota, period) = config.quota_for_percent(1);
        assert_eq!(period, 200_000_000);
        assert_eq!(quota, 2_000_000);
    }
}
