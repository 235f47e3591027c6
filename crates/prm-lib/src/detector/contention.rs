//! Threshold based contention detection for one task

use crate::metrics::{Metric, MetricSnapshot};
use crate::models::{ContendedResource, MetricRecord};
use crate::threshold::{select_bucket, BucketThreshold, TdpThreshold};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// How memory bandwidth contention is recognised
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryBwPolicy {
    /// Memory stalls per kilo instruction above the bucket's `mspki`
    #[default]
    StallBased,
    /// Local plus remote bandwidth below the bucket's `mb`
    BandwidthStarvation,
}

/// Outcome of one detection pass over one task
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Detection {
    /// Contended resources in evaluation order
    pub resources: Vec<ContendedResource>,
    /// Offending metric values next to their thresholds
    pub evidence: Vec<MetricRecord>,
}

impl Detection {
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    fn push_evidence(&mut self, task_id: &str, name: &str, value: f64) {
        self.evidence
            .push(MetricRecord::new(name, value).with_label("task_id", task_id));
    }
}

/// Contention detector
#[derive(Debug, Clone, Copy, Default)]
pub struct ContentionDetector {
    policy: MemoryBwPolicy,
}

impl ContentionDetector {
    pub fn new(policy: MemoryBwPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> MemoryBwPolicy {
        self.policy
    }

    /// Evaluate `metrics` against one bucket
    ///
    /// CPI gates everything: at or below its threshold nothing is reported.
    /// Above it LLC is checked first, then memory bandwidth, and `Unknown`
    /// is reported when neither explains the slowdown.
    pub fn detect_in_bucket(
        &self,
        task_id: &str,
        metrics: &MetricSnapshot,
        bucket: &BucketThreshold,
    ) -> Detection {
        let mut detection = Detection::default();
        if metrics.cpi <= bucket.cpi {
            return detection;
        }

        detection.push_evidence(task_id, Metric::Cpi.as_str(), metrics.cpi);
        detection.push_evidence(task_id, "cpi_threshold", bucket.cpi);

        if metrics.mpki > bucket.mpki {
            info!(
                task_id = %task_id,
                cpi = metrics.cpi,
                mpki = metrics.mpki,
                "Last level cache contention detected"
            );
            detection.push_evidence(task_id, Metric::Mpki.as_str(), metrics.mpki);
            detection.push_evidence(task_id, "mpki_threshold", bucket.mpki);
            detection.resources.push(ContendedResource::Llc);
        }

        if self.memory_bw_contended(task_id, metrics, bucket, &mut detection) {
            detection.resources.push(ContendedResource::MemoryBw);
        }

        if detection.resources.is_empty() {
            info!(
                task_id = %task_id,
                cpi = metrics.cpi,
                "CPI over threshold for unknown reason"
            );
            detection.resources.push(ContendedResource::Unknown);
        }

        detection
    }

    fn memory_bw_contended(
        &self,
        task_id: &str,
        metrics: &MetricSnapshot,
        bucket: &BucketThreshold,
        detection: &mut Detection,
    ) -> bool {
        match self.policy {
            MemoryBwPolicy::StallBased => {
                let Some(mspki) = bucket.mspki else {
                    debug!(task_id = %task_id, "Bucket has no mspki threshold");
                    return false;
                };
                if metrics.mspki <= mspki {
                    return false;
                }
                info!(
                    task_id = %task_id,
                    cpi = metrics.cpi,
                    mspki = metrics.mspki,
                    "Memory bandwidth contention detected"
                );
                detection.push_evidence(task_id, Metric::Mspki.as_str(), metrics.mspki);
                detection.push_evidence(task_id, "mspki_threshold", mspki);
                true
            }
            MemoryBwPolicy::BandwidthStarvation => {
                let bandwidth = metrics.node_bandwidth();
                if bandwidth >= bucket.mb {
                    return false;
                }
                info!(
                    task_id = %task_id,
                    cpi = metrics.cpi,
                    bandwidth = bandwidth,
                    "Memory bandwidth starvation detected"
                );
                detection.push_evidence(task_id, Metric::MemoryBandwidth.as_str(), bandwidth);
                detection.push_evidence(task_id, "mb_threshold", bucket.mb);
                true
            }
        }
    }

    /// Select the bucket for the task's utilization and evaluate it
    ///
    /// Utilization below the first bucket means low confidence, so nothing
    /// is evaluated.
    pub fn contention_detect(
        &self,
        task_id: &str,
        metrics: &MetricSnapshot,
        buckets: &[BucketThreshold],
    ) -> Detection {
        match select_bucket(buckets, metrics.utilization) {
            Some(bucket) => self.detect_in_bucket(task_id, metrics, bucket),
            None => Detection::default(),
        }
    }

    /// Flag frequency collapse while the task runs near its cpu ceiling
    pub fn tdp_contention_detect(
        &self,
        task_id: &str,
        metrics: &MetricSnapshot,
        tdp: &TdpThreshold,
    ) -> Option<Detection> {
        debug!(
            task_id = %task_id,
            util = metrics.utilization,
            frequency = metrics.normalized_frequency,
            util_threshold = tdp.util,
            frequency_bar = tdp.bar,
            "Checking TDP contention"
        );

        if metrics.utilization < tdp.util || metrics.normalized_frequency >= tdp.bar {
            return None;
        }

        info!(task_id = %task_id, "TDP contention detected");
        let mut detection = Detection {
            resources: vec![ContendedResource::Tdp],
            evidence: Vec::new(),
        };
        detection.push_evidence(
            task_id,
            Metric::NormalizedFrequency.as_str(),
            metrics.normalized_frequency,
        );
        detection.push_evidence(task_id, "nf_threshold", tdp.bar);
        detection.push_evidence(task_id, Metric::Utilization.as_str(), metrics.utilization);
        detection.push_evidence(task_id, "util_threshold", tdp.util);
        Some(detection)
    }
}
