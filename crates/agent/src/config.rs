//! Agent configuration

use anyhow::{Context, Result};
use prm_lib::detector::MemoryBwPolicy;
use prm_lib::regulator::RegulatorConfig;
use prm_lib::resource::LEVEL_MIN;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Environment variable naming an optional configuration file
pub const CONFIG_FILE_ENV: &str = "PRM_CONFIG_FILE";

/// Agent configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Node name, used to tag structured log events
    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// API server port for health/metrics/state
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Snapshot file written by the host before each tick
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: PathBuf,

    /// JSON lines file receiving one record per cycle
    #[serde(default = "default_allocations_path")]
    pub allocations_path: PathBuf,

    /// Directory backing the threshold store
    #[serde(default = "default_model_store_dir")]
    pub model_store_dir: PathBuf,

    /// Where workload metadata is persisted, disabled when unset
    #[serde(default)]
    pub workload_meta_path: Option<PathBuf>,

    #[serde(default = "default_action_delay")]
    pub action_delay_secs: f64,

    #[serde(default = "default_agg_period")]
    pub agg_period_secs: f64,

    /// Aggregation periods between threshold pulls
    #[serde(default = "default_model_pull_cycle")]
    pub model_pull_cycle: u32,

    /// Timeout for one threshold pull
    #[serde(default = "default_pull_timeout")]
    pub pull_timeout_secs: u64,

    #[serde(default = "default_history_depth")]
    pub history_depth: usize,

    #[serde(default)]
    pub exclusive_cat: bool,

    /// Disable to run in detect-only mode
    #[serde(default = "default_enable_control")]
    pub enable_control: bool,

    #[serde(default)]
    pub memory_bw_policy: MemoryBwPolicy,

    #[serde(default)]
    pub threshold_metrics: bool,

    #[serde(default = "default_cpu_dwell")]
    pub cpu_dwell_cycles: u32,

    #[serde(default = "default_cache_dwell")]
    pub llc_dwell_cycles: u32,

    #[serde(default = "default_cache_dwell")]
    pub mb_dwell_cycles: u32,

    #[serde(default = "default_min_margin_ratio")]
    pub min_margin_ratio: f64,

    #[serde(default)]
    pub cpu_quota_floor: f64,
}

fn default_node_name() -> String {
    std::env::var("NODE_NAME").unwrap_or_else(|_| "unknown".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_snapshot_path() -> PathBuf {
    PathBuf::from("/var/run/prm/snapshot.json")
}

fn default_allocations_path() -> PathBuf {
    PathBuf::from("/var/run/prm/allocations.jsonl")
}

fn default_model_store_dir() -> PathBuf {
    PathBuf::from("/var/lib/prm/thresholds")
}

fn default_action_delay() -> f64 {
    1.0
}

fn default_agg_period() -> f64 {
    20.0
}

fn default_model_pull_cycle() -> u32 {
    prm_lib::regulator::DEFAULT_MODEL_PULL_CYCLE
}

fn default_pull_timeout() -> u64 {
    10
}

fn default_history_depth() -> usize {
    prm_lib::metrics::DEFAULT_HISTORY_DEPTH
}

fn default_enable_control() -> bool {
    true
}

fn default_cpu_dwell() -> u32 {
    15
}

fn default_cache_dwell() -> u32 {
    4
}

fn default_min_margin_ratio() -> f64 {
    prm_lib::resource::DEFAULT_MIN_MARGIN_RATIO
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            node_name: default_node_name(),
            api_port: default_api_port(),
            snapshot_path: default_snapshot_path(),
            allocations_path: default_allocations_path(),
            model_store_dir: default_model_store_dir(),
            workload_meta_path: None,
            action_delay_secs: default_action_delay(),
            agg_period_secs: default_agg_period(),
            model_pull_cycle: default_model_pull_cycle(),
            pull_timeout_secs: default_pull_timeout(),
            history_depth: default_history_depth(),
            exclusive_cat: false,
            enable_control: default_enable_control(),
            memory_bw_policy: MemoryBwPolicy::default(),
            threshold_metrics: false,
            cpu_dwell_cycles: default_cpu_dwell(),
            llc_dwell_cycles: default_cache_dwell(),
            mb_dwell_cycles: default_cache_dwell(),
            min_margin_ratio: default_min_margin_ratio(),
            cpu_quota_floor: 0.0,
        }
    }
}

impl AgentConfig {
    /// Load configuration from the optional config file and environment
    pub fn load() -> Result<Self> {
        let file = std::env::var(CONFIG_FILE_ENV).ok().map(PathBuf::from);
        Self::load_from(file.as_deref())
    }

    /// Load from `file` (if any) layered under `PRM_` environment variables
    pub fn load_from(file: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path.to_path_buf()).required(true));
        }
        let config = builder
            .add_source(config::Environment::with_prefix("PRM").try_parsing(true))
            .build()
            .context("Failed to read agent configuration")?;

        Ok(config.try_deserialize().unwrap_or_else(|e| {
            warn!(error = %e, "Invalid agent configuration, using defaults");
            AgentConfig::default()
        }))
    }

    /// Regulator tuning derived from this configuration
    pub fn regulator_config(&self) -> RegulatorConfig {
        RegulatorConfig {
            action_delay: secs(self.action_delay_secs, default_action_delay()),
            agg_period: secs(self.agg_period_secs, default_agg_period()),
            model_pull_cycle: self.model_pull_cycle.max(1),
            history_depth: self.history_depth,
            exclusive_cat: self.exclusive_cat,
            enable_control: self.enable_control,
            initial_level: LEVEL_MIN,
            cpu_dwell_cycles: self.cpu_dwell_cycles,
            llc_dwell_cycles: self.llc_dwell_cycles,
            mb_dwell_cycles: self.mb_dwell_cycles,
            min_margin_ratio: self.min_margin_ratio,
            cpu_quota_floor: self.cpu_quota_floor,
            memory_bw_policy: self.memory_bw_policy,
            threshold_metrics: self.threshold_metrics,
            lc_util_max: 0.0,
        }
    }

    pub fn pull_timeout(&self) -> Duration {
        Duration::from_secs(self.pull_timeout_secs)
    }
}

fn secs(value: f64, fallback: f64) -> Duration {
    if value.is_finite() && value > 0.0 {
        Duration::from_secs_f64(value)
    } else {
        warn!(value, fallback, "Non-positive interval, using default");
        Duration::from_secs_f64(fallback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_file_overrides_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("agent.toml");
        std::fs::write(
            &path,
            r#"
api_port = 9100
snapshot_path = "/tmp/snap.json"
agg_period_secs = 10.0
exclusive_cat = true
memory_bw_policy = "bandwidth_starvation"
"#,
        )
        .unwrap();

        let config = AgentConfig::load_from(Some(&path)).unwrap();
        assert_eq!(config.api_port, 9100);
        assert_eq!(config.snapshot_path, PathBuf::from("/tmp/snap.json"));
        assert!(config.exclusive_cat);
        assert!(config.enable_control);
        assert_eq!(config.memory_bw_policy, MemoryBwPolicy::BandwidthStarvation);
        assert_eq!(config.cpu_dwell_cycles, 15);

        let regulator = config.regulator_config();
        assert_eq!(regulator.agg_period, Duration::from_secs(10));
        assert_eq!(regulator.aggregation_count(), 10);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("absent.toml");
        assert!(AgentConfig::load_from(Some(&path)).is_err());
    }

    #[test]
    fn test_regulator_config_rejects_zero_interval() {
        let config = AgentConfig {
            action_delay_secs: 0.0,
            model_pull_cycle: 0,
            ..Default::default()
        };
        let regulator = config.regulator_config();
        assert_eq!(regulator.action_delay, Duration::from_secs(1));
        assert_eq!(regulator.model_pull_cycle, 1);
        assert_eq!(regulator.initial_level, LEVEL_MIN);
    }
}
