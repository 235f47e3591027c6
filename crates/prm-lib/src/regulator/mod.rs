//! Regulation cycle orchestration
//!
//! [`ResourceRegulator::allocate`] runs one cycle: it updates the per-task
//! metric stores, detects contention on aggregation boundaries, attributes it
//! to a contender and drives one level controller per resource kind. The
//! regulator owns all of its state and is driven by a single caller, see
//! [`RegulationLoop`].

mod r#loop;


pub use r#loop::{RegulationLoop, RegulationLoopBuilder, SharedStatus};

use crate::detector::{find_contender, ContentionDetector, MemoryBwPolicy};
use crate::metrics::{TaskMetricStore, DEFAULT_HISTORY_DEPTH, LC_CAPACITY, LC_UTIL_MAX, SYSTEM_UTIL};
use crate::models::{
    application_key, ContendedResource, ContentionAnomaly, CycleInput, MetricRecord, TaskId,
    TaskResources, WorkloadClass,
};
use crate::resource::{
    AllocationDiff, CpuCycle, LlcOccupancy, MemoryBandwidth, NaiveController, Resource,
    TasksAllocations, DEFAULT_MIN_MARGIN_RATIO, LEVEL_MIN,
};
use crate::threshold::ThresholdHandle;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::time::Duration;
use tracing::{debug, info, warn, Level};

/// Default number of aggregation periods between threshold pulls
pub const DEFAULT_MODEL_PULL_CYCLE: u32 = 180;

/// Regulator tuning
#[derive(Debug, Clone)]
pub struct RegulatorConfig {
    /// Interval between two cycles
    pub action_delay: Duration,
    /// Interval between two aggregation boundaries
    pub agg_period: Duration,
    /// Aggregation periods between threshold pulls
    pub model_pull_cycle: u32,
    pub history_depth: usize,
    /// Give LC tasks their own cache ways
    pub exclusive_cat: bool,
    /// Detect only, never emit allocations
    pub enable_control: bool,
    /// Starting level of every resource
    pub initial_level: i32,
    pub cpu_dwell_cycles: u32,
    pub llc_dwell_cycles: u32,
    pub mb_dwell_cycles: u32,
    pub min_margin_ratio: f64,
    /// BE quota at the minimum CPU level
    pub cpu_quota_floor: f64,
    pub memory_bw_policy: MemoryBwPolicy,
    /// Export threshold records every cycle regardless of log level
    pub threshold_metrics: bool,
    /// Previously observed LC utilization peak
    pub lc_util_max: f64,
}

impl Default for RegulatorConfig {
    fn default() -> Self {
        Self {
            action_delay: Duration::from_secs(1),
            agg_period: Duration::from_secs(20),
            model_pull_cycle: DEFAULT_MODEL_PULL_CYCLE,
            history_depth: DEFAULT_HISTORY_DEPTH,
            exclusive_cat: false,
            enable_control: true,
            initial_level: LEVEL_MIN,
            cpu_dwell_cycles: 15,
            llc_dwell_cycles: 4,
            mb_dwell_cycles: 4,
            min_margin_ratio: DEFAULT_MIN_MARGIN_RATIO,
            cpu_quota_floor: 0.0,
            memory_bw_policy: MemoryBwPolicy::default(),
            threshold_metrics: false,
            lc_util_max: 0.0,
        }
    }
}

impl RegulatorConfig {
    /// Cycles per aggregation period, 1 unless the period is a whole
    /// multiple of the action delay
    pub fn aggregation_count(&self) -> u32 {
        let action = self.action_delay.as_millis();
        let period = self.agg_period.as_millis();
        if action == 0 || period % action != 0 {
            return 1;
        }
        u32::try_from(period / action).unwrap_or(u32::MAX).max(1)
    }
}

/// Current level of each controlled resource
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLevels {
    pub cpu_cycles: i32,
    pub llc: i32,
    pub memory_bw: i32,
}

/// Result of one regulation cycle
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleOutput {
    pub timestamp: f64,
    /// Allocation changes, values already in force are omitted
    pub allocations: TasksAllocations,
    pub anomalies: Vec<ContentionAnomaly>,
    pub metrics: Vec<MetricRecord>,
    /// Whether this cycle was an aggregation boundary
    pub aggregated: bool,
    /// New LC utilization peak to persist
    #[serde(skip)]
    pub lc_util_max_updated: Option<f64>,
    /// The workload metadata map changed and should be persisted
    #[serde(skip)]
    pub workload_meta_changed: bool,
    /// A threshold pull is due
    #[serde(skip)]
    pub pull_thresholds: bool,
}

/// Regulator state exposed to operators
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegulatorStatus {
    pub cycles: u64,
    pub last_timestamp: f64,
    pub tasks_tracked: usize,
    pub lc_util_max: f64,
    pub levels: ResourceLevels,
    pub cpu_model: String,
    pub last_anomalies: Vec<ContentionAnomaly>,
}

/// Aggregate utilization of one cycle, percent of one cpu
#[derive(Debug, Clone, Copy, Default)]
struct Utilization {
    lc: f64,
    be: f64,
    system: f64,
}

/// Closed-loop LC/BE contention regulator
pub struct ResourceRegulator {
    config: RegulatorConfig,
    thresholds: ThresholdHandle,
    detector: ContentionDetector,
    agg_cnt: u32,
    counter: u32,
    pull_cycle: u32,
    stores: HashMap<TaskId, TaskMetricStore>,
    workload_meta: BTreeMap<String, TaskResources>,
    warned_unlabelled: HashSet<TaskId>,
    lc_util_max: f64,
    cpu: NaiveController<CpuCycle>,
    llc: NaiveController<LlcOccupancy>,
    mb: NaiveController<MemoryBandwidth>,
    llc_enabled: bool,
    mb_enabled: bool,
    cbm_warned: bool,
}

impl ResourceRegulator {
    pub fn new(config: RegulatorConfig, thresholds: ThresholdHandle) -> Self {
        let mut cpu = CpuCycle::new(config.lc_util_max, config.min_margin_ratio, 0)
            .with_quota_floor(config.cpu_quota_floor);
        let mut llc = LlcOccupancy::new(config.exclusive_cat);
        let mut mb = MemoryBandwidth::new();
        cpu.set_level(config.initial_level);
        llc.set_level(config.initial_level);
        mb.set_level(config.initial_level);

        info!(
            action_delay_ms = config.action_delay.as_millis() as u64,
            agg_period_ms = config.agg_period.as_millis() as u64,
            exclusive_cat = config.exclusive_cat,
            enable_control = config.enable_control,
            model_pull_cycle = config.model_pull_cycle,
            "Regulator configured"
        );

        Self {
            detector: ContentionDetector::new(config.memory_bw_policy),
            agg_cnt: config.aggregation_count(),
            counter: 0,
            pull_cycle: 0,
            stores: HashMap::new(),
            workload_meta: BTreeMap::new(),
            warned_unlabelled: HashSet::new(),
            lc_util_max: config.lc_util_max,
            cpu: NaiveController::new(cpu, config.cpu_dwell_cycles),
            llc: NaiveController::new(llc, config.llc_dwell_cycles),
            mb: NaiveController::new(mb, config.mb_dwell_cycles),
            llc_enabled: false,
            mb_enabled: false,
            cbm_warned: false,
            thresholds,
            config,
        }
    }

    pub fn config(&self) -> &RegulatorConfig {
        &self.config
    }

    pub fn levels(&self) -> ResourceLevels {
        ResourceLevels {
            cpu_cycles: self.cpu.resource().level(),
            llc: self.llc.resource().level(),
            memory_bw: self.mb.resource().level(),
        }
    }

    pub fn lc_util_max(&self) -> f64 {
        self.lc_util_max
    }

    /// Seed the LC utilization peak, e.g. from a persisted value
    ///
    /// Lower values than the current peak are ignored.
    pub fn restore_lc_util_max(&mut self, value: f64) {
        if value > self.lc_util_max {
            self.lc_util_max = value;
            self.cpu.resource_mut().update_max_sys_util(value);
        }
    }

    /// Application key -> resources of its tasks
    pub fn workload_meta(&self) -> &BTreeMap<String, TaskResources> {
        &self.workload_meta
    }

    pub fn tasks_tracked(&self) -> usize {
        self.stores.len()
    }

    pub fn store(&self, task_id: &str) -> Option<&TaskMetricStore> {
        self.stores.get(task_id)
    }

    fn advance_counter(&mut self) -> bool {
        self.counter += 1;
        if self.counter >= self.agg_cnt {
            self.counter = 0;
            true
        } else {
            false
        }
    }

    /// Run one regulation cycle
    pub fn allocate(&mut self, input: &CycleInput) -> CycleOutput {
        let aggregated = self.advance_counter();
        let mut output = CycleOutput {
            timestamp: input.timestamp,
            aggregated,
            ..Default::default()
        };

        let tasks = Tasks::classify(input, self.config.exclusive_cat);
        output.workload_meta_changed = self.update_workload_meta(input, &tasks);
        self.stores.retain(|id, _| tasks.all.contains(id));
        self.warned_unlabelled.retain(|id| tasks.all.contains(id));

        if self.config.enable_control {
            self.update_platform(input);
        }

        let mut allocs = AllocationDiff::new(&input.tasks_allocations);
        let util = self.process_measurements(input, &tasks, aggregated, &mut allocs, &mut output);

        if aggregated {
            if util.lc > self.lc_util_max {
                info!(old = self.lc_util_max, new = util.lc, "New LC utilization peak");
                self.lc_util_max = util.lc;
                self.cpu.resource_mut().update_max_sys_util(util.lc);
                output.lc_util_max_updated = Some(util.lc);
            }

            output.pull_thresholds = self.pull_cycle == 0;
            self.pull_cycle += 1;
            if self.pull_cycle >= self.config.model_pull_cycle {
                self.pull_cycle = 0;
            }

            output.anomalies = self.detect(input, &tasks);
            if !output.anomalies.is_empty() {
                debug!(anomalies = output.anomalies.len(), "Contention findings");
            }
        }

        output.metrics.extend(self.headroom_records(tasks.assigned_cpus, &util));
        if self.config.threshold_metrics || tracing::enabled!(Level::DEBUG) {
            output.metrics.extend(self.threshold_records(&input.platform.cpu_model));
        }

        if self.config.enable_control {
            self.regulate(&tasks, &util, aggregated, &output.anomalies, &mut allocs);
        }

        output.allocations = allocs.into_pending();
        output
    }

    fn update_workload_meta(&mut self, input: &CycleInput, tasks: &Tasks) -> bool {
        let mut changed = false;
        for id in &tasks.all {
            let labels = input.tasks_labels.get(id);
            let Some(app) = application_key(labels) else {
                continue;
            };
            let Some(resources) = input.tasks_resources.get(id) else {
                continue;
            };
            if self.workload_meta.get(&app) != Some(resources) {
                self.workload_meta.insert(app, resources.clone());
                changed = true;
            }
        }
        changed
    }

    fn update_platform(&mut self, input: &CycleInput) {
        let platform = &input.platform;
        self.cpu.resource_mut().set_ncpu(platform.cpus);

        let Some(rdt) = &platform.rdt else {
            self.llc_enabled = false;
            self.mb_enabled = false;
            return;
        };

        match self.llc.resource_mut().update_platform(&rdt.cbm_mask, platform.sockets) {
            Ok(()) => {
                self.llc_enabled = true;
                self.cbm_warned = false;
            }
            Err(e) => {
                if !self.cbm_warned {
                    warn!(error = %e, "Cache allocation disabled");
                    self.cbm_warned = true;
                }
                self.llc_enabled = false;
            }
        }

        self.mb_enabled = rdt.mb_control_enabled;
        if rdt.mb_control_enabled {
            self.mb.resource_mut().update_platform(
                rdt.mb_min_bandwidth,
                rdt.mb_bandwidth_gran,
                platform.sockets,
            );
        }
    }

    fn process_measurements(
        &mut self,
        input: &CycleInput,
        tasks: &Tasks,
        aggregated: bool,
        allocs: &mut AllocationDiff<'_>,
        output: &mut CycleOutput,
    ) -> Utilization {
        let mut util = Utilization::default();
        let mut ids: Vec<&TaskId> = input.tasks_measurements.keys().collect();
        ids.sort();

        for id in ids {
            let measurements = &input.tasks_measurements[id];
            let is_be = tasks.bes.contains(id);

            if !self.stores.contains_key(id) {
                self.stores.insert(
                    id.clone(),
                    TaskMetricStore::new(id.clone(), self.config.history_depth),
                );
                if self.config.enable_control {
                    self.bootstrap_task(id, is_be, tasks, allocs);
                }
            }

            let Some(store) = self.stores.get_mut(id) else {
                continue;
            };
            store.update_measurement(input.timestamp, measurements, aggregated);

            if is_be {
                util.be += store.util();
            } else {
                util.lc += store.util();
            }
            util.system += store.util();

            if aggregated {
                let app = application_key(input.tasks_labels.get(id));
                let vcpus = app
                    .as_ref()
                    .and_then(|a| self.workload_meta.get(a))
                    .map(|r| r.cpus);
                output.metrics.extend(store.metric_records(app.as_deref(), vcpus));
            }
        }

        util
    }

    /// First allocations of a task seen for the first time
    fn bootstrap_task(
        &self,
        id: &str,
        is_be: bool,
        tasks: &Tasks,
        allocs: &mut AllocationDiff<'_>,
    ) {
        let cpu = self.cpu.resource();
        if is_be {
            debug!(task_id = %id, "New best-effort task");
            cpu.set_share(id, 0.0, allocs);
            cpu.budgeting(&tasks.bes_list, &[], allocs);
            if self.llc_enabled {
                self.llc.resource().budgeting(&tasks.bes_list, &[], allocs);
            }
            if self.mb_enabled {
                self.mb.resource().budgeting(&tasks.bes_list, &[], allocs);
            }
        } else {
            debug!(task_id = %id, "New latency-critical task");
            cpu.set_share(id, 1.0, allocs);
            if self.config.exclusive_cat && self.llc_enabled {
                self.llc.resource().budgeting(&[], &[id.to_string()], allocs);
            }
        }
    }

    fn detect(&mut self, input: &CycleInput, tasks: &Tasks) -> Vec<ContentionAnomaly> {
        let thresholds = self.thresholds.snapshot();
        let cpu_model = input.platform.cpu_model.as_str();
        let mut anomalies = Vec::new();

        let mut ids: Vec<&TaskId> = self.stores.keys().collect();
        ids.sort();

        for id in ids {
            if tasks.bes.contains(id) {
                continue;
            }
            let Some(app) = application_key(input.tasks_labels.get(id)) else {
                if self.warned_unlabelled.insert(id.clone()) {
                    warn!(
                        task_id = %id,
                        "Task has no application labels, excluded from contention detection"
                    );
                }
                continue;
            };
            let Some(vcpus) = self.workload_meta.get(&app).map(|r| r.cpus) else {
                continue;
            };
            let store = &self.stores[id];
            let Some(metrics) = store.metrics() else {
                continue;
            };

            let mut findings = Vec::new();
            if let Some(buckets) = thresholds.metrics_thresholds(cpu_model, vcpus, &app) {
                findings.push(self.detector.contention_detect(id, metrics, buckets));
            } else {
                debug!(task_id = %id, application = %app, vcpus = vcpus, "No metric thresholds");
            }
            if let Some(tdp) = thresholds.tdp_threshold(cpu_model, vcpus, &app) {
                findings.extend(self.detector.tdp_contention_detect(id, metrics, tdp));
            }

            for detection in findings {
                for resource in &detection.resources {
                    let candidates = tasks.all.iter().filter_map(|task| self.stores.get(task));
                    let contender = find_contender(id, *resource, candidates);
                    anomalies.push(ContentionAnomaly {
                        resource: *resource,
                        contended_task_id: id.clone(),
                        contending_task_ids: contender.into_iter().collect(),
                        metrics: detection.evidence.clone(),
                    });
                }
            }
        }

        anomalies
    }

    fn regulate(
        &mut self,
        tasks: &Tasks,
        util: &Utilization,
        aggregated: bool,
        anomalies: &[ContentionAnomaly],
        allocs: &mut AllocationDiff<'_>,
    ) {
        let found = |kind: ContendedResource| anomalies.iter().any(|a| a.resource == kind);
        let llc_found = found(ContendedResource::Llc);
        let mb_found = found(ContendedResource::MemoryBw);
        let tdp_found = found(ContendedResource::Tdp);

        let mut hold = false;
        if !tasks.bes_list.is_empty() {
            let (exceed, margin_hold) = self.cpu.resource().detect_margin_exceed(util.lc, util.be);
            hold = margin_hold;
            let detected = exceed || tdp_found || (mb_found && !self.mb_enabled);
            self.cpu.update(&tasks.bes_list, &[], detected, hold, allocs);
        }

        if !aggregated {
            return;
        }
        if self.llc_enabled {
            self.llc.update(&tasks.bes_list, &tasks.lcs_list, llc_found, hold, allocs);
        }
        if self.mb_enabled {
            self.mb.update(&tasks.bes_list, &tasks.lcs_list, mb_found, hold, allocs);
        }
    }

    fn headroom_records(&self, assigned_cpus: f64, util: &Utilization) -> Vec<MetricRecord> {
        vec![
            MetricRecord::new(LC_CAPACITY, assigned_cpus * 100.0),
            MetricRecord::new(LC_UTIL_MAX, self.lc_util_max),
            MetricRecord::new(SYSTEM_UTIL, util.system),
        ]
    }

    fn threshold_records(&self, cpu_model: &str) -> Vec<MetricRecord> {
        let mut records = vec![MetricRecord::new("threshold_lcutilmax", self.lc_util_max)];
        records.extend(self.thresholds.snapshot().threshold_records(cpu_model));
        records
    }
}

/// Task sets of one cycle
struct Tasks {
    all: BTreeSet<TaskId>,
    bes: BTreeSet<TaskId>,
    bes_list: Vec<TaskId>,
    /// LC tasks that receive cache allocations (exclusive mode only)
    lcs_list: Vec<TaskId>,
    assigned_cpus: f64,
}

impl Tasks {
    fn classify(input: &CycleInput, exclusive_cat: bool) -> Self {
        let all: BTreeSet<TaskId> = input
            .tasks_measurements
            .keys()
            .chain(input.tasks_resources.keys())
            .cloned()
            .collect();

        let mut bes = BTreeSet::new();
        let mut lcs_list = Vec::new();
        let mut assigned_cpus = 0.0;
        for id in &all {
            match WorkloadClass::from_labels(input.tasks_labels.get(id)) {
                WorkloadClass::BestEffort => {
                    bes.insert(id.clone());
                }
                WorkloadClass::LatencyCritical => {
                    if let Some(resources) = input.tasks_resources.get(id) {
                        assigned_cpus += resources.cpus;
                    }
                    if exclusive_cat {
                        lcs_list.push(id.clone());
                    }
                }
            }
        }

        Self {
            bes_list: bes.iter().cloned().collect(),
            bes,
            all,
            lcs_list,
            assigned_cpus,
        }
    }
}
