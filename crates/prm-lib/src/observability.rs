//! Observability infrastructure for the regulation agent
//!
//! Provides:
//! - Prometheus metrics (cycle latency, resource levels, contentions, utilization)
//! - Structured JSON logging with tracing

use crate::error::ModelError;
use crate::models::{ContendedResource, ContentionAnomaly};
use prometheus::{
    register_gauge, register_histogram, register_int_counter, register_int_counter_vec,
    register_int_gauge, register_int_gauge_vec, Gauge, Histogram, IntCounter, IntCounterVec,
    IntGauge, IntGaugeVec,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Default histogram buckets for latency measurements (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<AgentMetricsInner> = OnceLock::new();

struct AgentMetricsInner {
    cycle_latency_seconds: Histogram,
    tasks_tracked: IntGauge,
    contentions_detected: IntCounterVec,
    resource_level: IntGaugeVec,
    lc_utilization_max: Gauge,
    system_utilization: Gauge,
    threshold_refresh_errors: IntCounter,
    allocation_updates: IntCounter,
    snapshot_errors: IntCounter,
}

impl AgentMetricsInner {
    fn new() -> Self {
        Self {
            cycle_latency_seconds: register_histogram!(
                "prm_agent_cycle_latency_seconds",
                "Time spent in one regulation cycle",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register cycle_latency_seconds"),

            tasks_tracked: register_int_gauge!(
                "prm_agent_tasks_tracked",
                "Number of tasks with a metric store"
            )
            .expect("Failed to register tasks_tracked"),

            contentions_detected: register_int_counter_vec!(
                "prm_agent_contentions_detected_total",
                "Contention findings by resource",
                &["resource"]
            )
            .expect("Failed to register contentions_detected"),

            resource_level: register_int_gauge_vec!(
                "prm_agent_resource_level",
                "Current budget level per resource (-1 is unrestricted)",
                &["resource"]
            )
            .expect("Failed to register resource_level"),

            lc_utilization_max: register_gauge!(
                "prm_agent_lc_utilization_max",
                "Highest aggregate LC utilization observed"
            )
            .expect("Failed to register lc_utilization_max"),

            system_utilization: register_gauge!(
                "prm_agent_system_utilization",
                "Aggregate utilization of all tracked tasks"
            )
            .expect("Failed to register system_utilization"),

            threshold_refresh_errors: register_int_counter!(
                "prm_agent_threshold_refresh_errors_total",
                "Failed threshold model pulls"
            )
            .expect("Failed to register threshold_refresh_errors"),

            allocation_updates: register_int_counter!(
                "prm_agent_allocation_updates_total",
                "Task allocation changes handed to the sink"
            )
            .expect("Failed to register allocation_updates"),

            snapshot_errors: register_int_counter!(
                "prm_agent_snapshot_errors_total",
                "Failed snapshot reads"
            )
            .expect("Failed to register snapshot_errors"),
        }
    }
}

/// Agent metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct AgentMetrics {
    _private: (),
}

impl Default for AgentMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(AgentMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &AgentMetricsInner {
        GLOBAL_METRICS.get().expect("Metrics not initialized")
    }

    pub fn observe_cycle_latency(&self, duration_secs: f64) {
        self.inner().cycle_latency_seconds.observe(duration_secs);
    }

    pub fn set_tasks_tracked(&self, count: i64) {
        self.inner().tasks_tracked.set(count);
    }

    pub fn inc_contentions(&self, resource: ContendedResource) {
        self.inner()
            .contentions_detected
            .with_label_values(&[resource.as_str()])
            .inc();
    }

    pub fn set_resource_level(&self, resource: ContendedResource, level: i32) {
        self.inner()
            .resource_level
            .with_label_values(&[resource.as_str()])
            .set(level as i64);
    }

    pub fn set_lc_utilization_max(&self, value: f64) {
        self.inner().lc_utilization_max.set(value);
    }

    pub fn set_system_utilization(&self, value: f64) {
        self.inner().system_utilization.set(value);
    }

    pub fn inc_threshold_refresh_errors(&self) {
        self.inner().threshold_refresh_errors.inc();
    }

    pub fn inc_allocation_updates(&self, count: u64) {
        self.inner().allocation_updates.inc_by(count);
    }

    pub fn inc_snapshot_errors(&self) {
        self.inner().snapshot_errors.inc();
    }
}

/// Structured logger for agent events
///
/// Provides consistent JSON-formatted logging for contention findings,
/// level changes and other significant events.
#[derive(Clone)]
pub struct StructuredLogger {
    node_name: String,
}

impl StructuredLogger {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
        }
    }

    /// Log a contention finding
    pub fn log_contention(&self, anomaly: &ContentionAnomaly) {
        let contender = anomaly
            .contending_task_ids
            .first()
            .map(String::as_str)
            .unwrap_or("");
        warn!(
            event = "contention_detected",
            node = %self.node_name,
            resource = %anomaly.resource,
            contended_task_id = %anomaly.contended_task_id,
            contending_task_id = %contender,
            evidence = anomaly.metrics.len(),
            "Contention detected"
        );
    }

    /// Log a budget level change of one resource
    pub fn log_level_change(&self, resource: ContendedResource, old_level: i32, new_level: i32) {
        info!(
            event = "resource_level_changed",
            node = %self.node_name,
            resource = %resource,
            old_level = old_level,
            new_level = new_level,
            "Resource level changed"
        );
    }

    /// Log the outcome of a threshold model pull
    pub fn log_threshold_refresh(&self, cpu_model: &str, result: &Result<bool, ModelError>) {
        match result {
            Ok(updated) => {
                info!(
                    event = "thresholds_refreshed",
                    node = %self.node_name,
                    cpu_model = %cpu_model,
                    updated = *updated,
                    "Threshold model pull finished"
                );
            }
            Err(e) => {
                warn!(
                    event = "thresholds_refreshed",
                    node = %self.node_name,
                    cpu_model = %cpu_model,
                    updated = false,
                    error = %e,
                    "Threshold model pull failed, keeping previous snapshot"
                );
            }
        }
    }

    /// Log agent startup
    pub fn log_startup(&self, version: &str, enable_control: bool) {
        info!(
            event = "agent_started",
            node = %self.node_name,
            agent_version = %version,
            enable_control = enable_control,
            "Regulation agent started"
        );
    }

    /// Log agent shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "agent_shutdown",
            node = %self.node_name,
            reason = %reason,
            "Regulation agent shutting down"
        );
    }
}
