//! Per-task performance metrics
//!
//! [`TaskMetricStore`] keeps the raw counters of one task and derives ratio
//! metrics (CPI, MPKI, normalized frequency, ...) at every aggregation
//! boundary. [`MetricSnapshot`] is the typed result of one derivation.

mod store;

pub use store::{TaskMetricStore, DEFAULT_HISTORY_DEPTH};

use serde::{Deserialize, Serialize};

/// Metric identifiers, named as they are exported
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Cycles,
    Instructions,
    CacheMisses,
    L2Stalls,
    MemoryStalls,
    LlcOccupancy,
    MemoryBandwidth,
    MemoryBandwidthLocal,
    MemoryBandwidthRemote,
    Cpi,
    Mpki,
    L2Spki,
    Mspki,
    NormalizedFrequency,
    Utilization,
}

impl Metric {
    pub const ALL: [Metric; 15] = [
        Metric::Cycles,
        Metric::Instructions,
        Metric::CacheMisses,
        Metric::L2Stalls,
        Metric::MemoryStalls,
        Metric::LlcOccupancy,
        Metric::MemoryBandwidth,
        Metric::MemoryBandwidthLocal,
        Metric::MemoryBandwidthRemote,
        Metric::Cpi,
        Metric::Mpki,
        Metric::L2Spki,
        Metric::Mspki,
        Metric::NormalizedFrequency,
        Metric::Utilization,
    ];

    /// Exported metric name
    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Cycles => "cycle",
            Metric::Instructions => "instruction",
            Metric::CacheMisses => "cache_miss",
            Metric::L2Stalls => "stalls_l2_miss",
            Metric::MemoryStalls => "stalls_mem_load",
            Metric::LlcOccupancy => "cache_occupancy",
            Metric::MemoryBandwidth => "memory_bandwidth_total",
            Metric::MemoryBandwidthLocal => "memory_bandwidth_local",
            Metric::MemoryBandwidthRemote => "memory_bandwidth_remote",
            Metric::Cpi => "cycles_per_instruction",
            Metric::Mpki => "cache_miss_per_kilo_instruction",
            Metric::L2Spki => "stalls_l2miss_per_kilo_instruction",
            Metric::Mspki => "stalls_memory_load_per_kilo_instruction",
            Metric::NormalizedFrequency => "normalized_frequency",
            Metric::Utilization => "cpu_utilization",
        }
    }
}

/// Headroom metric: capacity assigned to LC tasks (cpus * 100)
pub const LC_CAPACITY: &str = "latency_critical_utilization_capacity";
/// Headroom metric: historical peak of aggregate LC utilization
pub const LC_UTIL_MAX: &str = "latency_critical_utilization_max";
/// Headroom metric: aggregate utilization of every tracked task
pub const SYSTEM_UTIL: &str = "system_utilization";

/// Derived metrics over one aggregation period
///
/// Counter fields hold deltas over the period; occupancy is the time-averaged
/// value in KiB, bandwidths are MiB/s and utilization is a percentage of one
/// cpu.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricSnapshot {
    pub cycles: f64,
    pub instructions: f64,
    pub cache_misses: f64,
    pub l2_stalls: f64,
    pub memory_stalls: f64,
    pub llc_occupancy: f64,
    pub memory_bandwidth: f64,
    pub memory_bandwidth_local: f64,
    pub memory_bandwidth_remote: f64,
    pub cpi: f64,
    pub mpki: f64,
    pub l2spki: f64,
    pub mspki: f64,
    pub normalized_frequency: f64,
    pub utilization: f64,
}

impl MetricSnapshot {
    pub fn get(&self, metric: Metric) -> f64 {
        match metric {
            Metric::Cycles => self.cycles,
            Metric::Instructions => self.instructions,
            Metric::CacheMisses => self.cache_misses,
            Metric::L2Stalls => self.l2_stalls,
            Metric::MemoryStalls => self.memory_stalls,
            Metric::LlcOccupancy => self.llc_occupancy,
            Metric::MemoryBandwidth => self.memory_bandwidth,
            Metric::MemoryBandwidthLocal => self.memory_bandwidth_local,
            Metric::MemoryBandwidthRemote => self.memory_bandwidth_remote,
            Metric::Cpi => self.cpi,
            Metric::Mpki => self.mpki,
            Metric::L2Spki => self.l2spki,
            Metric::Mspki => self.mspki,
            Metric::NormalizedFrequency => self.normalized_frequency,
            Metric::Utilization => self.utilization,
        }
    }

    /// All metrics paired with their identifiers
    pub fn iter(&self) -> impl Iterator<Item = (Metric, f64)> + '_ {
        Metric::ALL.iter().map(move |m| (*m, self.get(*m)))
    }

    /// Local plus remote bandwidth, falling back to the total when the host
    /// does not split traffic by node
    pub fn node_bandwidth(&self) -> f64 {
        let split = self.memory_bandwidth_local + self.memory_bandwidth_remote;
        if split > 0.0 {
            split
        } else {
            self.memory_bandwidth
        }
    }
}
