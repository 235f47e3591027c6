//! Core data models for the platform resource manager
//!
//! Everything the host hands to a regulation cycle and everything the cycle
//! hands back lives here. Allocation types are in [`crate::resource`].

use crate::resource::TasksAllocations;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Opaque task (container) identifier supplied by the host
pub type TaskId = String;

/// Task labels as provided by the orchestration framework
pub type TaskLabels = HashMap<String, String>;

/// Label carrying the application name
pub const LABEL_APPLICATION: &str = "application";
/// Label carrying the application version
pub const LABEL_APPLICATION_VERSION: &str = "application_version_name";
/// Label carrying the workload type
pub const LABEL_TYPE: &str = "type";
/// Value of [`LABEL_TYPE`] marking a best-effort task
pub const BEST_EFFORTS: &str = "best_efforts";

/// Raw cumulative counters sampled for one task in one cycle
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskMeasurements {
    /// Cumulative CPU time consumed, in nanoseconds
    pub cpu_usage_ns: f64,
    pub cycles: f64,
    pub instructions: f64,
    pub cache_misses: f64,
    /// Cycles stalled on L2 misses
    pub l2_stalls: f64,
    /// Cycles stalled on memory loads
    pub memory_stalls: f64,
    /// Instant LLC occupancy in bytes
    pub llc_occupancy_bytes: f64,
    /// Cumulative memory traffic in bytes
    pub memory_bandwidth_bytes: f64,
    pub memory_bandwidth_local_bytes: f64,
    pub memory_bandwidth_remote_bytes: f64,
}

/// Resources assigned to a task (e.g. its cpu count)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskResources {
    #[serde(default)]
    pub cpus: f64,
    /// Any other resource the host reports, carried through untouched
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl TaskResources {
    pub fn with_cpus(cpus: f64) -> Self {
        Self {
            cpus,
            extra: BTreeMap::new(),
        }
    }
}

/// RDT capabilities of the platform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RdtInformation {
    /// Cache capacity bitmask, hexadecimal without prefix (e.g. `fffff`)
    pub cbm_mask: String,
    #[serde(default)]
    pub mb_control_enabled: bool,
    #[serde(default = "default_mb_min_bandwidth")]
    pub mb_min_bandwidth: u32,
    #[serde(default = "default_mb_bandwidth_gran")]
    pub mb_bandwidth_gran: u32,
}

fn default_mb_min_bandwidth() -> u32 {
    10
}

fn default_mb_bandwidth_gran() -> u32 {
    10
}

/// Platform descriptor for the machine being regulated
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Platform {
    pub cpu_model: String,
    pub sockets: u32,
    /// Total logical cpus
    pub cpus: u32,
    #[serde(default)]
    pub rdt: Option<RdtInformation>,
}

/// Everything the host provides for one regulation cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleInput {
    /// Wall-clock seconds since the epoch
    pub timestamp: f64,
    pub platform: Platform,
    pub tasks_measurements: HashMap<TaskId, TaskMeasurements>,
    #[serde(default)]
    pub tasks_resources: HashMap<TaskId, TaskResources>,
    #[serde(default)]
    pub tasks_labels: HashMap<TaskId, TaskLabels>,
    /// Allocations currently in force, used to suppress no-op writes
    #[serde(default)]
    pub tasks_allocations: TasksAllocations,
}

/// Workload classification derived from task labels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadClass {
    LatencyCritical,
    BestEffort,
}

impl WorkloadClass {
    /// Anything not explicitly labelled best-effort is latency critical
    pub fn from_labels(labels: Option<&TaskLabels>) -> Self {
        match labels.and_then(|l| l.get(LABEL_TYPE)) {
            Some(t) if t == BEST_EFFORTS => WorkloadClass::BestEffort,
            _ => WorkloadClass::LatencyCritical,
        }
    }
}

/// Model key of a task: `<application>.<application_version_name>`
pub fn application_key(labels: Option<&TaskLabels>) -> Option<String> {
    let labels = labels?;
    let app = labels.get(LABEL_APPLICATION)?;
    let version = labels.get(LABEL_APPLICATION_VERSION)?;
    Some(format!("{}.{}", app, version))
}

/// Shared platform resource a task can contend on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContendedResource {
    CpuCycles,
    Llc,
    MemoryBw,
    Tdp,
    Unknown,
}

impl ContendedResource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContendedResource::CpuCycles => "cpu_cycles",
            ContendedResource::Llc => "llc",
            ContendedResource::MemoryBw => "memory_bw",
            ContendedResource::Tdp => "tdp",
            ContendedResource::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ContendedResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named observability value with a label set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub name: String,
    pub value: f64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl MetricRecord {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
            labels: BTreeMap::new(),
        }
    }

    /// Attach a label
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// One contention episode found during a detection pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentionAnomaly {
    pub resource: ContendedResource,
    pub contended_task_id: TaskId,
    /// Zero or one suspected contender
    pub contending_task_ids: Vec<TaskId>,
    /// Offending metric values and the thresholds they crossed
    pub metrics: Vec<MetricRecord>,
}
