//! Metric store for a single task
//!
//! Ratios are derived from counter deltas between aggregation boundaries,
//! never from consecutive short cycles, so one noisy sample cannot flip a
//! detection decision.

use super::{Metric, MetricSnapshot};
use crate::models::{MetricRecord, TaskId, TaskMeasurements};
use std::collections::VecDeque;

/// Default number of past snapshots kept besides the latest one
pub const DEFAULT_HISTORY_DEPTH: usize = 5;

const NANOS_PER_SEC: f64 = 1e9;
const BYTES_PER_MIB: f64 = 1024.0 * 1024.0;

/// Raw counters captured at the previous aggregation boundary
#[derive(Debug, Clone)]
struct Baseline {
    timestamp: f64,
    measurements: TaskMeasurements,
}

/// Metric state of one task
#[derive(Debug, Clone)]
pub struct TaskMetricStore {
    task_id: TaskId,
    /// Capacity of `history` (depth + 1)
    capacity: usize,
    /// Last cumulative CPU usage, 0 until the first non-zero sample
    cpu_usage_ns: f64,
    usage_timestamp: f64,
    util: f64,
    baseline: Option<Baseline>,
    metrics: Option<MetricSnapshot>,
    history: VecDeque<MetricSnapshot>,
    llc_occupancy_sum: f64,
    llc_occupancy_samples: u32,
}

impl TaskMetricStore {
    /// Create a store keeping `history_depth + 1` snapshots
    pub fn new(task_id: impl Into<TaskId>, history_depth: usize) -> Self {
        let capacity = history_depth + 1;
        Self {
            task_id: task_id.into(),
            capacity,
            cpu_usage_ns: 0.0,
            usage_timestamp: 0.0,
            util: 0.0,
            baseline: None,
            metrics: None,
            history: VecDeque::with_capacity(capacity),
            llc_occupancy_sum: 0.0,
            llc_occupancy_samples: 0,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Instant utilization (percent of one cpu) since the previous call
    pub fn util(&self) -> f64 {
        self.util
    }

    /// Derived metrics of the latest completed aggregation period
    pub fn metrics(&self) -> Option<&MetricSnapshot> {
        self.metrics.as_ref()
    }

    /// Snapshots oldest first
    pub fn history(&self) -> impl Iterator<Item = &MetricSnapshot> {
        self.history.iter()
    }

    /// Feed one cycle of raw counters
    ///
    /// Utilization and the LLC occupancy accumulator update on every call;
    /// ratio metrics are recomputed only when `aggregate` is set.
    pub fn update_measurement(
        &mut self,
        timestamp: f64,
        measurements: &TaskMeasurements,
        aggregate: bool,
    ) {
        if self.cpu_usage_ns != 0.0 {
            let elapsed = timestamp - self.usage_timestamp;
            if elapsed > 0.0 {
                self.util = (measurements.cpu_usage_ns - self.cpu_usage_ns) * 100.0
                    / (elapsed * NANOS_PER_SEC);
            }
        }
        self.cpu_usage_ns = measurements.cpu_usage_ns;
        self.usage_timestamp = timestamp;

        if measurements.llc_occupancy_bytes > 0.0 {
            self.llc_occupancy_sum += measurements.llc_occupancy_bytes;
            self.llc_occupancy_samples += 1;
        }

        if aggregate {
            if let Some(baseline) = self.baseline.take() {
                let snapshot = self.derive(&baseline, timestamp, measurements);
                self.push_history(snapshot);
                self.metrics = Some(snapshot);
                self.llc_occupancy_sum = 0.0;
                self.llc_occupancy_samples = 0;
            }
        }

        if aggregate || self.baseline.is_none() {
            self.baseline = Some(Baseline {
                timestamp,
                measurements: measurements.clone(),
            });
        }
    }

    fn derive(
        &self,
        baseline: &Baseline,
        timestamp: f64,
        current: &TaskMeasurements,
    ) -> MetricSnapshot {
        let prev = &baseline.measurements;
        let elapsed = timestamp - baseline.timestamp;

        let mut snapshot = MetricSnapshot {
            cycles: current.cycles - prev.cycles,
            instructions: current.instructions - prev.instructions,
            cache_misses: current.cache_misses - prev.cache_misses,
            l2_stalls: current.l2_stalls - prev.l2_stalls,
            memory_stalls: current.memory_stalls - prev.memory_stalls,
            ..Default::default()
        };

        snapshot.llc_occupancy = if self.llc_occupancy_samples == 0 {
            0.0
        } else {
            self.llc_occupancy_sum / self.llc_occupancy_samples as f64 / 1024.0
        };

        if snapshot.instructions != 0.0 {
            snapshot.cpi = snapshot.cycles / snapshot.instructions;
            snapshot.mpki = snapshot.cache_misses * 1000.0 / snapshot.instructions;
            snapshot.l2spki = snapshot.l2_stalls * 1000.0 / snapshot.instructions;
            snapshot.mspki = snapshot.memory_stalls * 1000.0 / snapshot.instructions;
        }

        if elapsed > 0.0 {
            snapshot.utilization =
                (current.cpu_usage_ns - prev.cpu_usage_ns) * 100.0 / (elapsed * NANOS_PER_SEC);
            snapshot.memory_bandwidth = (current.memory_bandwidth_bytes
                - prev.memory_bandwidth_bytes)
                / BYTES_PER_MIB
                / elapsed;
            snapshot.memory_bandwidth_local = (current.memory_bandwidth_local_bytes
                - prev.memory_bandwidth_local_bytes)
                / BYTES_PER_MIB
                / elapsed;
            snapshot.memory_bandwidth_remote = (current.memory_bandwidth_remote_bytes
                - prev.memory_bandwidth_remote_bytes)
                / BYTES_PER_MIB
                / elapsed;
            if snapshot.utilization != 0.0 {
                snapshot.normalized_frequency =
                    snapshot.cycles / elapsed / 10000.0 / snapshot.utilization;
            }
        }

        snapshot
    }

    fn push_history(&mut self, snapshot: MetricSnapshot) {
        if self.history.len() == self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(snapshot);
    }

    /// Latest value minus the mean of all older entries in history
    ///
    /// Returns 0 with no history and the latest value when only one entry
    /// exists.
    pub fn history_delta(&self, metric: Metric) -> f64 {
        let Some(latest) = self.history.back() else {
            return 0.0;
        };
        let older = self.history.len() - 1;
        if older == 0 {
            return latest.get(metric);
        }

        let sum: f64 = self.history.iter().take(older).map(|s| s.get(metric)).sum();
        latest.get(metric) - sum / older as f64
    }

    /// Recent jump of averaged LLC occupancy
    pub fn llc_occupancy_delta(&self) -> f64 {
        self.history_delta(Metric::LlcOccupancy)
    }

    /// Recent jump of normalized frequency
    pub fn freq_delta(&self) -> f64 {
        self.history_delta(Metric::NormalizedFrequency)
    }

    /// Current total memory bandwidth, 0 before the first derivation
    pub fn latest_memory_bandwidth(&self) -> f64 {
        self.metrics.map(|m| m.memory_bandwidth).unwrap_or(0.0)
    }

    /// Export derived metrics, labelled with task and application
    pub fn metric_records(&self, application: Option<&str>, vcpus: Option<f64>) -> Vec<MetricRecord> {
        let Some(metrics) = &self.metrics else {
            return Vec::new();
        };

        metrics
            .iter()
            .map(|(metric, value)| {
                let mut record =
                    MetricRecord::new(metric.as_str(), value).with_label("task_id", &self.task_id);
                if let Some(app) = application {
                    record = record.with_label("application", app);
                    if let Some(cpus) = vcpus {
                        record = record.with_label("initial_task_cpu_assignment", cpus.to_string());
                    }
                }
                record
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(cpu_usage_ns: f64, cycles: f64, instructions: f64) -> TaskMeasurements {
        TaskMeasurements {
            cpu_usage_ns,
            cycles,
            instructions,
            ..Default::default()
        }
    }

    fn store_with_history(values: &[f64]) -> TaskMetricStore {
        let mut store = TaskMetricStore::new("t1", DEFAULT_HISTORY_DEPTH);
        for v in values {
            store.push_history(MetricSnapshot {
                llc_occupancy: *v,
                ..Default::default()
            });
        }
        store
    }

    #[test]
    fn test_history_delta_empty_is_zero() {
        let store = store_with_history(&[]);
        assert_eq!(store.history_delta(Metric::LlcOccupancy), 0.0);
    }

    #[test]
    fn test_history_delta_single_entry_is_value() {
        let store = store_with_history(&[42.0]);
        assert_eq!(store.history_delta(Metric::LlcOccupancy), 42.0);
    }

    #[test]
    fn test_history_delta_latest_minus_mean_of_older() {
        let store = store_with_history(&[10.0, 20.0, 30.0, 50.0]);
        // mean(10, 20, 30) = 20
        assert_eq!(store.llc_occupancy_delta(), 30.0);
    }

    #[test]
    fn test_history_is_bounded() {
        let store = store_with_history(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]);
        let kept: Vec<f64> = store.history().map(|s| s.llc_occupancy).collect();
        assert_eq!(kept, vec![3.0, 4.0, 5.0, 6.0, 7.0, 8.0]);
    }

    #[test]
    fn test_first_measurement_sets_baseline_only() {
        let mut store = TaskMetricStore::new("t1", DEFAULT_HISTORY_DEPTH);
        store.update_measurement(100.0, &sample(1e9, 1e9, 1e9), true);

        assert!(store.metrics().is_none());
        assert_eq!(store.util(), 0.0);
    }

    #[test]
    fn test_derived_metrics_on_aggregation() {
        let mut store = TaskMetricStore::new("t1", DEFAULT_HISTORY_DEPTH);
        store.update_measurement(100.0, &sample(1e9, 0.0, 0.0), true);

        let current = TaskMeasurements {
            cpu_usage_ns: 1e9 + 4e9,
            cycles: 8e9,
            instructions: 4e9,
            cache_misses: 8e6,
            memory_stalls: 4e8,
            memory_bandwidth_bytes: 2.0 * 1024.0 * 1024.0 * 1024.0,
            ..Default::default()
        };
        store.update_measurement(102.0, &current, true);

        let m = store.metrics().unwrap();
        assert_eq!(m.cpi, 2.0);
        assert_eq!(m.mpki, 2.0);
        assert_eq!(m.mspki, 100.0);
        assert_eq!(m.utilization, 200.0);
        assert_eq!(m.memory_bandwidth, 1024.0);
        // 8e9 cycles / 2 s / 10000 / 200 %
        assert_eq!(m.normalized_frequency, 2000.0);
        assert_eq!(store.util(), 200.0);
    }

    #[test]
    fn test_zero_instructions_yield_zero_ratios() {
        let mut store = TaskMetricStore::new("t1", DEFAULT_HISTORY_DEPTH);
        store.update_measurement(0.0, &sample(0.0, 0.0, 5.0), true);
        store.update_measurement(1.0, &sample(0.0, 100.0, 5.0), true);

        let m = store.metrics().unwrap();
        assert_eq!(m.cpi, 0.0);
        assert_eq!(m.mpki, 0.0);
        assert_eq!(m.mspki, 0.0);
        assert_eq!(m.utilization, 0.0);
        assert_eq!(m.normalized_frequency, 0.0);
    }

    #[test]
    fn test_metrics_only_change_on_aggregation() {
        let mut store = TaskMetricStore::new("t1", DEFAULT_HISTORY_DEPTH);
        store.update_measurement(0.0, &sample(1e9, 0.0, 0.0), true);
        store.update_measurement(1.0, &sample(2e9, 10.0, 10.0), true);
        let before = *store.metrics().unwrap();

        store.update_measurement(2.0, &sample(4e9, 100.0, 20.0), false);
        assert_eq!(store.metrics(), Some(&before));
        // instant utilization still follows every sample
        assert_eq!(store.util(), 200.0);
        assert_eq!(store.history().count(), 1);
    }

    #[test]
    fn test_llc_occupancy_is_time_averaged() {
        let mut store = TaskMetricStore::new("t1", DEFAULT_HISTORY_DEPTH);
        let occupancy = |bytes: f64| TaskMeasurements {
            llc_occupancy_bytes: bytes,
            ..Default::default()
        };

        store.update_measurement(0.0, &occupancy(1024.0), true);
        store.update_measurement(1.0, &occupancy(2048.0), false);
        store.update_measurement(2.0, &occupancy(0.0), false);
        store.update_measurement(3.0, &occupancy(3072.0), true);

        // (1024 + 2048 + 3072) / 3 samples / 1024
        assert_eq!(store.metrics().unwrap().llc_occupancy, 2.0);

        store.update_measurement(4.0, &occupancy(0.0), true);
        assert_eq!(store.metrics().unwrap().llc_occupancy, 0.0);
    }

    #[test]
    fn test_latest_memory_bandwidth_defaults_to_zero() {
        let store = TaskMetricStore::new("t1", DEFAULT_HISTORY_DEPTH);
        assert_eq!(store.latest_memory_bandwidth(), 0.0);
    }

    #[test]
    fn test_metric_records_labels() {
        let mut store = TaskMetricStore::new("t1", DEFAULT_HISTORY_DEPTH);
        assert!(store.metric_records(Some("redis.v6"), Some(4.0)).is_empty());

        store.update_measurement(0.0, &sample(1e9, 0.0, 0.0), true);
        store.update_measurement(1.0, &sample(2e9, 10.0, 10.0), true);

        let records = store.metric_records(Some("redis.v6"), Some(4.0));
        assert_eq!(records.len(), Metric::ALL.len());
        let cpi = records
            .iter()
            .find(|r| r.name == "cycles_per_instruction")
            .unwrap();
        assert_eq!(cpi.value, 1.0);
        assert_eq!(cpi.labels["task_id"], "t1");
        assert_eq!(cpi.labels["application"], "redis.v6");
        assert_eq!(cpi.labels["initial_task_cpu_assignment"], "4");
    }
}
