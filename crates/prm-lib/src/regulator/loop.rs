//! Regulation loop
//!
//! Pulls a snapshot from the host every tick, runs one regulator cycle and
//! hands the result to the allocation sink. Threshold pulls and persistence
//! run in spawned tasks so a slow store never delays a cycle.

use super::{CycleOutput, RegulatorStatus, ResourceLevels, ResourceRegulator};
use crate::health::{components, HealthRegistry};
use crate::host::{AllocationSink, SnapshotSource};
use crate::metrics::SYSTEM_UTIL;
use crate::models::{ContendedResource, CycleInput};
use crate::observability::{AgentMetrics, StructuredLogger};
use crate::threshold::{ModelStore, ThresholdRefresher};
use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Regulator status shared with the HTTP API
pub type SharedStatus = Arc<RwLock<RegulatorStatus>>;

/// Drives a [`ResourceRegulator`] at a fixed cadence
pub struct RegulationLoop {
    regulator: ResourceRegulator,
    source: Arc<dyn SnapshotSource>,
    sink: Arc<dyn AllocationSink>,
    refresher: Option<ThresholdRefresher>,
    model_store: Option<Arc<dyn ModelStore>>,
    health: HealthRegistry,
    metrics: AgentMetrics,
    logger: StructuredLogger,
    status: SharedStatus,
    workload_meta_path: Option<PathBuf>,
    interval: Duration,
}

impl RegulationLoop {
    /// Start the loop, returning when `shutdown` fires
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            "Starting regulation loop"
        );

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                _ = shutdown.recv() => {
                    info!("Shutting down regulation loop");
                    break;
                }
            }
        }
    }

    pub fn status(&self) -> SharedStatus {
        Arc::clone(&self.status)
    }

    /// Run one cycle if the host has a new snapshot
    pub async fn tick(&mut self) -> Option<CycleOutput> {
        let input = match self.source.next_snapshot().await {
            Ok(Some(input)) => input,
            Ok(None) => return None,
            Err(e) => {
                self.metrics.inc_snapshot_errors();
                warn!(error = %e, "Failed to read snapshot");
                self.health
                    .record_failure(components::SNAPSHOT_SOURCE, e.to_string())
                    .await;
                return None;
            }
        };
        self.health.record_success(components::SNAPSHOT_SOURCE).await;

        let start = Instant::now();
        let before = self.regulator.levels();
        let output = self.regulator.allocate(&input);
        self.metrics
            .observe_cycle_latency(start.elapsed().as_secs_f64());

        self.record(&input, &output, before).await;
        self.persist(&input, &output).await;

        match self.sink.apply(&output).await {
            Ok(()) => {
                self.metrics
                    .inc_allocation_updates(output.allocations.len() as u64);
                self.health.record_success(components::ALLOCATION_SINK).await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to hand allocations to host");
                self.health
                    .record_failure(components::ALLOCATION_SINK, e.to_string())
                    .await;
            }
        }

        Some(output)
    }

    async fn record(&self, input: &CycleInput, output: &CycleOutput, before: ResourceLevels) {
        let after = self.regulator.levels();
        for (resource, old, new) in [
            (ContendedResource::CpuCycles, before.cpu_cycles, after.cpu_cycles),
            (ContendedResource::Llc, before.llc, after.llc),
            (ContendedResource::MemoryBw, before.memory_bw, after.memory_bw),
        ] {
            self.metrics.set_resource_level(resource, new);
            if old != new {
                self.logger.log_level_change(resource, old, new);
            }
        }

        for anomaly in &output.anomalies {
            self.metrics.inc_contentions(anomaly.resource);
            self.logger.log_contention(anomaly);
        }

        self.metrics
            .set_tasks_tracked(self.regulator.tasks_tracked() as i64);
        self.metrics
            .set_lc_utilization_max(self.regulator.lc_util_max());
        if let Some(record) = output.metrics.iter().find(|r| r.name == SYSTEM_UTIL) {
            self.metrics.set_system_utilization(record.value);
        }

        let mut status = self.status.write().await;
        status.cycles += 1;
        status.last_timestamp = input.timestamp;
        status.tasks_tracked = self.regulator.tasks_tracked();
        status.lc_util_max = self.regulator.lc_util_max();
        status.levels = after;
        status.cpu_model = input.platform.cpu_model.clone();
        if output.aggregated {
            status.last_anomalies = output.anomalies.clone();
        }
    }

    async fn persist(&self, input: &CycleInput, output: &CycleOutput) {
        if output.workload_meta_changed {
            if let Some(path) = &self.workload_meta_path {
                match serde_json::to_vec(self.regulator.workload_meta()) {
                    Ok(body) => {
                        if let Err(e) = tokio::fs::write(path, body).await {
                            warn!(path = %path.display(), error = %e, "Failed to write workload metadata");
                        }
                    }
                    Err(e) => warn!(error = %e, "Failed to encode workload metadata"),
                }
            }
        }

        if let (Some(value), Some(store)) = (output.lc_util_max_updated, &self.model_store) {
            let store = Arc::clone(store);
            tokio::spawn(async move {
                if let Err(e) = store.save_lc_util_max(value).await {
                    warn!(error = %e, "Failed to persist LC utilization peak");
                }
            });
        }

        if output.pull_thresholds {
            if let Some(refresher) = &self.refresher {
                let refresher = refresher.clone();
                let health = self.health.clone();
                let cpu_model = input.platform.cpu_model.clone();
                debug!(cpu_model = %cpu_model, "Threshold pull due");
                tokio::spawn(async move {
                    if refresher.refresh_logged(&cpu_model).await {
                        health.record_success(components::THRESHOLDS).await;
                    } else {
                        health
                            .record_failure(components::THRESHOLDS, "Using previous threshold snapshot")
                            .await;
                    }
                });
            }
        }
    }
}

/// Builder for creating the regulation loop
pub struct RegulationLoopBuilder {
    regulator: Option<ResourceRegulator>,
    source: Option<Arc<dyn SnapshotSource>>,
    sink: Option<Arc<dyn AllocationSink>>,
    refresher: Option<ThresholdRefresher>,
    model_store: Option<Arc<dyn ModelStore>>,
    health: Option<HealthRegistry>,
    metrics: Option<AgentMetrics>,
    logger: Option<StructuredLogger>,
    status: Option<SharedStatus>,
    workload_meta_path: Option<PathBuf>,
    interval: Duration,
}

impl RegulationLoopBuilder {
    pub fn new() -> Self {
        Self {
            regulator: None,
            source: None,
            sink: None,
            refresher: None,
            model_store: None,
            health: None,
            metrics: None,
            logger: None,
            status: None,
            workload_meta_path: None,
            interval: Duration::from_secs(1),
        }
    }

    pub fn regulator(mut self, regulator: ResourceRegulator) -> Self {
        self.interval = regulator.config().action_delay;
        self.regulator = Some(regulator);
        self
    }

    pub fn source(mut self, source: Arc<dyn SnapshotSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn AllocationSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn refresher(mut self, refresher: ThresholdRefresher) -> Self {
        self.refresher = Some(refresher);
        self
    }

    /// Store the LC utilization peak is persisted to
    pub fn model_store(mut self, store: Arc<dyn ModelStore>) -> Self {
        self.model_store = Some(store);
        self
    }

    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn metrics(mut self, metrics: AgentMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn status(mut self, status: SharedStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn workload_meta_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.workload_meta_path = Some(path.into());
        self
    }

    /// Override the tick interval (defaults to the action delay)
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn build(self) -> Result<RegulationLoop> {
        let regulator = self
            .regulator
            .ok_or_else(|| anyhow::anyhow!("Regulator is required"))?;
        let source = self
            .source
            .ok_or_else(|| anyhow::anyhow!("Snapshot source is required"))?;
        let sink = self
            .sink
            .ok_or_else(|| anyhow::anyhow!("Allocation sink is required"))?;

        Ok(RegulationLoop {
            regulator,
            source,
            sink,
            refresher: self.refresher,
            model_store: self.model_store,
            health: self.health.unwrap_or_default(),
            metrics: self.metrics.unwrap_or_default(),
            logger: self
                .logger
                .unwrap_or_else(|| StructuredLogger::new("unknown")),
            status: self.status.unwrap_or_default(),
            workload_meta_path: self.workload_meta_path,
            interval: self.interval,
        })
    }
}

impl Default for RegulationLoopBuilder {
    fn default() -> Self {
        Self::new()
    }
}
