//! Utilization-bucketed threshold model
//!
//! Thresholds are produced offline per (cpu model, application, vcpu count)
//! and consumed here as an immutable snapshot. The snapshot is replaced as a
//! whole when a fresh model is pulled, see [`ThresholdHandle`].

mod refresh;
mod store;

pub use refresh::{ThresholdHandle, ThresholdRefresher, DEFAULT_PULL_TIMEOUT};
pub use store::{correct_key_characters, LocalModelStore, ModelStore, LC_UTIL_MAX_KEY};

use crate::error::ModelError;
use crate::models::MetricRecord;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Default width of one utilization bucket (half a logical cpu)
pub const DEFAULT_BUCKET_STEP: f64 = 50.0;

/// Metric thresholds for one utilization range
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketThreshold {
    pub util_start: f64,
    pub util_end: f64,
    pub cpi: f64,
    pub mpki: f64,
    pub mb: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub l2spki: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mspki: Option<f64>,
}

/// Frequency threshold used to flag TDP throttling near saturation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TdpThreshold {
    /// Utilization above which the check applies (95% of the cpu request)
    pub util: f64,
    pub mean: f64,
    pub std: f64,
    /// Normalized frequency below which the task is considered throttled
    pub bar: f64,
}

/// Thresholds of one (application, vcpu count) workload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkloadThresholds {
    #[serde(default)]
    pub metrics_threshold: Vec<BucketThreshold>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tdp_threshold: Option<TdpThreshold>,
}

/// vcpu count key -> thresholds
pub type ApplicationThresholds = BTreeMap<String, WorkloadThresholds>;

/// application key -> vcpu count key -> thresholds
pub type CpuModelThresholds = BTreeMap<String, ApplicationThresholds>;

/// Kind of threshold requested from the model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThreshType {
    #[serde(rename = "metrics_threshold")]
    Metrics,
    #[serde(rename = "tdp_threshold")]
    Tdp,
}

/// Borrowed result of a threshold lookup
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Threshold<'a> {
    Metrics(&'a [BucketThreshold]),
    Tdp(&'a TdpThreshold),
}

/// Immutable nested threshold lookup
///
/// Keys are stored with [`correct_key_characters`] applied so that models
/// pulled from a key/value store and models loaded from a file resolve the
/// same way.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThresholdModel {
    models: BTreeMap<String, CpuModelThresholds>,
}

impl ThresholdModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a full document (`cpu_model -> application -> vcpus -> ...`)
    pub fn from_json(json: &str) -> Result<Self, ModelError> {
        let raw: BTreeMap<String, CpuModelThresholds> = serde_json::from_str(json)?;
        let mut model = Self::new();
        for (cpu_model, workloads) in raw {
            model.insert_cpu_model(&cpu_model, workloads);
        }
        Ok(model)
    }

    /// Parse the per cpu model record kept in a model store
    /// (`application -> vcpus -> ...`)
    pub fn from_cpu_model_document(cpu_model: &str, json: &str) -> Result<Self, ModelError> {
        let workloads: CpuModelThresholds = serde_json::from_str(json)?;
        let mut model = Self::new();
        model.insert_cpu_model(cpu_model, workloads);
        Ok(model)
    }

    pub fn insert_cpu_model(&mut self, cpu_model: &str, workloads: CpuModelThresholds) {
        self.models
            .insert(correct_key_characters(cpu_model), workloads);
    }

    pub fn is_empty(&self) -> bool {
        self.models.values().all(|apps| apps.is_empty())
    }

    pub fn cpu_models(&self) -> impl Iterator<Item = &str> {
        self.models.keys().map(String::as_str)
    }

    /// All workloads known for a cpu model
    pub fn workloads(&self, cpu_model: &str) -> Option<&CpuModelThresholds> {
        self.models.get(&correct_key_characters(cpu_model))
    }

    fn workload(&self, cpu_model: &str, vcpus: f64, application: &str) -> Option<&WorkloadThresholds> {
        self.workloads(cpu_model)?
            .get(application)?
            .get(&vcpu_key(vcpus))
    }

    /// Threshold of the requested kind, `None` when the key is unknown or
    /// the workload carries no such threshold
    pub fn get_thresh(
        &self,
        cpu_model: &str,
        vcpus: f64,
        application: &str,
        kind: ThreshType,
    ) -> Option<Threshold<'_>> {
        let workload = self.workload(cpu_model, vcpus, application)?;
        match kind {
            ThreshType::Metrics if !workload.metrics_threshold.is_empty() => {
                Some(Threshold::Metrics(&workload.metrics_threshold))
            }
            ThreshType::Metrics => None,
            ThreshType::Tdp => workload.tdp_threshold.as_ref().map(Threshold::Tdp),
        }
    }

    pub fn metrics_thresholds(
        &self,
        cpu_model: &str,
        vcpus: f64,
        application: &str,
    ) -> Option<&[BucketThreshold]> {
        match self.get_thresh(cpu_model, vcpus, application, ThreshType::Metrics)? {
            Threshold::Metrics(buckets) => Some(buckets),
            Threshold::Tdp(_) => None,
        }
    }

    pub fn tdp_threshold(&self, cpu_model: &str, vcpus: f64, application: &str) -> Option<&TdpThreshold> {
        match self.get_thresh(cpu_model, vcpus, application, ThreshType::Tdp)? {
            Threshold::Tdp(tdp) => Some(tdp),
            Threshold::Metrics(_) => None,
        }
    }

    /// Every threshold of a cpu model as metric records
    pub fn threshold_records(&self, cpu_model: &str) -> Vec<MetricRecord> {
        let mut records = Vec::new();
        let Some(workloads) = self.workloads(cpu_model) else {
            return records;
        };

        for (application, by_vcpus) in workloads {
            for (vcpus, thresholds) in by_vcpus {
                if let Some(tdp) = &thresholds.tdp_threshold {
                    for (name, value) in [("threshold_tdp_bar", tdp.bar), ("threshold_tdp_util", tdp.util)] {
                        records.push(
                            MetricRecord::new(name, value)
                                .with_label("application", application)
                                .with_label("vcpus", vcpus),
                        );
                    }
                }
                for bucket in &thresholds.metrics_threshold {
                    for (name, value) in [
                        ("threshold_cpi", bucket.cpi),
                        ("threshold_mpki", bucket.mpki),
                        ("threshold_mb", bucket.mb),
                    ] {
                        records.push(
                            MetricRecord::new(name, value)
                                .with_label("application", application)
                                .with_label("vcpus", vcpus)
                                .with_label("start", format!("{}", bucket.util_start as i64))
                                .with_label("end", format!("{}", bucket.util_end as i64)),
                        );
                    }
                }
            }
        }
        records
    }
}

/// Key used for a vcpu count: `4` for 4.0, `2.5` for 2.5
pub fn vcpu_key(vcpus: f64) -> String {
    vcpus.to_string()
}

/// Lower edges of the utilization buckets for a workload with `cpus` cpus
///
/// Edges run from `cpus * 50` up to, but excluding, `(cpus + 1) * 100`.
pub fn partition_utilization(cpus: f64, step: f64) -> Vec<f64> {
    let upper = (cpus + 1.0) * 100.0;
    let mut edges = Vec::new();
    if step <= 0.0 {
        return edges;
    }
    let mut edge = cpus * 50.0;
    while edge < upper {
        edges.push(edge);
        edge += step;
    }
    edges
}

/// Pick the bucket matching `util`
///
/// Below the first bucket nothing is selected. A value falling between two
/// buckets uses the lower one and anything past the last edge uses the last.
pub fn select_bucket(buckets: &[BucketThreshold], util: f64) -> Option<&BucketThreshold> {
    let last = buckets.len().checked_sub(1)?;
    for (i, bucket) in buckets.iter().enumerate() {
        if util < bucket.util_start {
            return if i == 0 { None } else { Some(&buckets[i - 1]) };
        }
        if util < bucket.util_end || i == last {
            return Some(bucket);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bucket(start: f64, end: f64) -> BucketThreshold {
        BucketThreshold {
            util_start: start,
            util_end: end,
            cpi: 1.0,
            mpki: 1.0,
            mb: 1.0,
            l2spki: None,
            mspki: Some(1.0),
        }
    }

    fn buckets_for(cpus: f64) -> Vec<BucketThreshold> {
        partition_utilization(cpus, DEFAULT_BUCKET_STEP)
            .into_iter()
            .map(|start| bucket(start, start + DEFAULT_BUCKET_STEP))
            .collect()
    }

    const DOCUMENT: &str = r#"{
        "Intel(R) Xeon(R) Gold 6140": {
            "redis.v6": {
                "4": {
                    "metrics_threshold": [
                        {"util_start": 200, "util_end": 250, "cpi": 1.2, "mpki": 3.0, "mb": 900},
                        {"util_start": 250, "util_end": 300, "cpi": 1.4, "mpki": 3.5, "mb": 950, "mspki": 40.0}
                    ],
                    "tdp_threshold": {"util": 380, "mean": 2200, "std": 50, "bar": 2050}
                }
            }
        }
    }"#;

    #[test]
    fn test_partition_utilization() {
        assert_eq!(
            partition_utilization(4.0, 50.0),
            vec![200.0, 250.0, 300.0, 350.0, 400.0, 450.0]
        );
        assert_eq!(partition_utilization(1.0, 50.0), vec![50.0, 100.0, 150.0]);
        assert!(partition_utilization(1.0, 0.0).is_empty());
    }

    #[test]
    fn test_select_bucket_below_first_is_none() {
        let buckets = buckets_for(4.0);
        assert!(select_bucket(&buckets, 199.9).is_none());
        assert!(select_bucket(&[], 500.0).is_none());
    }

    #[test]
    fn test_select_bucket_is_total_above_first_start() {
        let buckets = buckets_for(4.0);
        for util in [200.0, 249.9, 250.0, 333.0, 499.9, 500.0, 10_000.0] {
            let selected = select_bucket(&buckets, util).unwrap();
            assert!(selected.util_start <= util);
            assert!(util < selected.util_end || selected == buckets.last().unwrap());
        }
        assert_eq!(select_bucket(&buckets, 260.0).unwrap().util_start, 250.0);
        assert_eq!(select_bucket(&buckets, 9999.0).unwrap().util_start, 450.0);
    }

    #[test]
    fn test_select_bucket_gap_uses_lower_bucket() {
        let buckets = vec![bucket(100.0, 150.0), bucket(200.0, 250.0)];
        assert_eq!(select_bucket(&buckets, 175.0).unwrap().util_start, 100.0);
    }

    #[test]
    fn test_model_lookup() {
        let model = ThresholdModel::from_json(DOCUMENT).unwrap();
        let cpu = "Intel(R) Xeon(R) Gold 6140";

        let buckets = model.metrics_thresholds(cpu, 4.0, "redis.v6").unwrap();
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].mspki, None);
        assert_eq!(buckets[1].mspki, Some(40.0));

        let tdp = model.tdp_threshold(cpu, 4.0, "redis.v6").unwrap();
        assert_eq!(tdp.bar, 2050.0);

        assert!(matches!(
            model.get_thresh(cpu, 4.0, "redis.v6", ThreshType::Metrics),
            Some(Threshold::Metrics(_))
        ));
    }

    #[test]
    fn test_model_lookup_missing_keys() {
        let model = ThresholdModel::from_json(DOCUMENT).unwrap();
        let cpu = "Intel(R) Xeon(R) Gold 6140";

        assert!(model.metrics_thresholds(cpu, 8.0, "redis.v6").is_none());
        assert!(model.metrics_thresholds(cpu, 4.0, "nginx.v1").is_none());
        assert!(model.metrics_thresholds("EPYC", 4.0, "redis.v6").is_none());
        assert!(ThresholdModel::new().is_empty());
    }

    #[test]
    fn test_cpu_model_keys_are_sanitised() {
        let model = ThresholdModel::from_json(DOCUMENT).unwrap();
        assert_eq!(
            model.cpu_models().collect::<Vec<_>>(),
            vec!["Intel_R__Xeon_R__Gold_6140"]
        );
        assert!(model.workloads("Intel_R__Xeon_R__Gold_6140").is_some());
    }

    #[test]
    fn test_cpu_model_document() {
        let json = r#"{"redis.v6": {"2.5": {"metrics_threshold": []}}}"#;
        let model = ThresholdModel::from_cpu_model_document("Xeon", json).unwrap();

        assert!(model.workloads("Xeon").is_some());
        assert!(model.metrics_thresholds("Xeon", 2.5, "redis.v6").is_none());
        assert!(model.tdp_threshold("Xeon", 2.5, "redis.v6").is_none());
    }

    #[test]
    fn test_malformed_document_is_an_error() {
        let err = ThresholdModel::from_json("{\"x\": [1, 2]}").unwrap_err();
        assert!(matches!(err, ModelError::Parse(_)));
    }

    #[test]
    fn test_threshold_records() {
        let model = ThresholdModel::from_json(DOCUMENT).unwrap();
        let records = model.threshold_records("Intel(R) Xeon(R) Gold 6140");

        // 2 tdp records + 3 per bucket
        assert_eq!(records.len(), 8);
        let cpi = records
            .iter()
            .find(|r| r.name == "threshold_cpi" && r.labels["start"] == "250")
            .unwrap();
        assert_eq!(cpi.value, 1.4);
        assert_eq!(cpi.labels["end"], "300");
        assert_eq!(cpi.labels["vcpus"], "4");
    }

    #[test]
    fn test_vcpu_key() {
        assert_eq!(vcpu_key(4.0), "4");
        assert_eq!(vcpu_key(2.5), "2.5");
    }
}
