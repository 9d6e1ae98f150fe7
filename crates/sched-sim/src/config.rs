//! Simulation configuration

use anyhow::{Context, Result};
use sched_lib::SchedulerConfig;
use serde::Deserialize;
use std::path::Path;

/// Environment variable naming an optional TOML config file
pub const CONFIG_FILE_ENV: &str = "SCHED_SIM_CONFIG";

/// Simulation configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SimConfig {
    /// Scheduler settings (carriers, periods, core count)
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// How long tasks keep running, in milliseconds
    #[serde(default = "default_duration_ms")]
    pub duration_ms: u64,

    /// Busy time per task slice, in microseconds
    #[serde(default = "default_slice_us")]
    pub slice_us: u64,

    /// Containers to create, each with its own tasks
    #[serde(default = "default_containers")]
    pub containers: Vec<SimContainer>,
}

/// One simulated container
#[derive(Debug, Clone, Deserialize)]
pub struct SimContainer {
    pub name: String,

    /// CPU limit in percent of one core; unlimited when absent
    #[serde(default)]
    pub cpu_percent: Option<i64>,

    #[serde(default = "default_tasks")]
    pub tasks: usize,
}

fn default_duration_ms() -> u64 {
    2_000
}

fn default_slice_us() -> u64 {
    2_000
}

fn default_tasks() -> usize {
    2
}

fn default_containers() -> Vec<SimContainer> {
    vec![
        SimContainer {
            name: "throttled".to_string(),
            cpu_percent: Some(20),
            tasks: default_tasks(),
        },
        SimContainer {
            name: "unlimited".to_string(),
            cpu_percent: None,
            tasks: default_tasks(),
        },
    ]
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            duration_ms: default_duration_ms(),
            slice_us: default_slice_us(),
            containers: default_containers(),
        }
    }
}

impl SimConfig {
    /// Load configuration from the optional config file and environment
    pub fn load() -> Result<Self> {
        let file = std::env::var(CONFIG_FILE_ENV).ok();
        Self::load_from(file.as_deref().map(Path::new))
    }

    /// Load from `file` (if any), then `SCHED_*` environment variables
    ///
    /// Nested keys use `__`, e.g. `SCHED_SCHEDULER__CARRIERS=4`.
    pub fn load_from(file: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix("SCHED")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to read sched-sim configuration")?;

        config
            .try_deserialize()
            .context("Failed to parse sched-sim configuration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = SimConfig::default();
        assert_eq!(config.duration_ms, 2_000);
        assert_eq!(config.containers.len(), 2);
        assert_eq!(config.containers[0].cpu_percent, Some(20));
        assert!(config.containers[1].cpu_percent.is_none());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
duration_ms = 150

[scheduler]
carriers = 3
cfs_period_ns = 50000000

[[containers]]
name = "batch"
cpu_percent = 10
tasks = 4
"#
        )
        .unwrap();

        let config = SimConfig::load_from(Some(file.path())).unwrap();
        assert_eq!(config.duration_ms, 150);
        assert_eq!(config.slice_us, 2_000);
        assert_eq!(config.scheduler.carriers, 3);
        assert_eq!(config.scheduler.cfs_period_ns, 50_000_000);
        assert_eq!(config.scheduler.min_quanta_per_period, 4);
        assert_eq!(config.containers.len(), 1);
        assert_eq!(config.containers[0].name, "batch");
        assert_eq!(config.containers[0].tasks, 4);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.toml");
        assert!(SimConfig::load_from(Some(&missing)).is_err());
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "duration_ms = \"soon\"").unwrap();
        assert!(SimConfig::load_from(Some(file.path())).is_err());
    }
}
