//! CPU cycle budget enforced through CFS quota

use super::{Allocation, AllocationDiff, Resource, ResourceLevel, LEVEL_MAX};
use crate::models::{ContendedResource, TaskId};
use tracing::{debug, info};

/// Default headroom kept free for LC bursts, in cpus
pub const DEFAULT_MIN_MARGIN_RATIO: f64 = 0.5;

/// CPU quota actuator for best-effort tasks
///
/// The BE budget scales with the largest aggregate LC utilization seen so
/// far (`lc_max`, in percent of one cpu).
#[derive(Debug, Clone)]
pub struct CpuCycle {
    level: ResourceLevel,
    lc_max: f64,
    ncpu: u32,
    min_margin_ratio: f64,
    quota_floor: f64,
    quota_max: f64,
    quota_step: f64,
}

impl CpuCycle {
    pub fn new(lc_max: f64, min_margin_ratio: f64, ncpu: u32) -> Self {
        let mut cpu = Self {
            level: ResourceLevel::default(),
            lc_max,
            ncpu,
            min_margin_ratio,
            quota_floor: 0.0,
            quota_max: 0.0,
            quota_step: 0.0,
        };
        cpu.recompute();
        cpu
    }

    /// Quota granted at the minimum level instead of 0
    pub fn with_quota_floor(mut self, floor: f64) -> Self {
        self.quota_floor = floor;
        self
    }

    fn recompute(&mut self) {
        self.quota_max = if self.ncpu == 0 {
            0.0
        } else {
            self.lc_max / 100.0 / self.ncpu as f64
        };
        self.quota_step = self.quota_max / LEVEL_MAX as f64;
    }

    /// Rescale the budget to a new LC utilization peak
    pub fn update_max_sys_util(&mut self, lc_max: f64) {
        self.lc_max = lc_max;
        self.recompute();
    }

    pub fn set_ncpu(&mut self, ncpu: u32) {
        if self.ncpu != ncpu {
            self.ncpu = ncpu;
            self.recompute();
        }
    }

    pub fn lc_max(&self) -> f64 {
        self.lc_max
    }

    pub fn quota_max(&self) -> f64 {
        self.quota_max
    }

    pub fn quota_step(&self) -> f64 {
        self.quota_step
    }

    /// Quota shared by all BE tasks at the current level
    pub fn quota(&self) -> f64 {
        if self.level.is_full_level() {
            1.0
        } else if self.level.is_min_level() {
            self.quota_floor
        } else {
            self.level.level() as f64 * self.quota_step
        }
    }

    /// Set CPU shares of one task
    pub fn set_share(&self, task_id: &str, share: f64, allocs: &mut AllocationDiff<'_>) {
        allocs.set_alloc(task_id, Allocation::CpuShares(share));
    }

    /// Check aggregate utilization against the BE budget ceiling
    ///
    /// Utilizations are percentages of one cpu. Returns `(exceed, hold)`:
    /// `exceed` when LC plus BE plus margin passes `lc_max` (or LC is idle),
    /// `hold` when one more step would pass it.
    pub fn detect_margin_exceed(&self, lc_util: f64, be_util: f64) -> (bool, bool) {
        let margin = self.min_margin_ratio * 100.0;
        let step = self.lc_max / LEVEL_MAX as f64;
        let used = lc_util + be_util + margin;

        debug!(
            lc_util = lc_util,
            be_util = be_util,
            margin = margin,
            lc_max = self.lc_max,
            "Checking cpu margin"
        );

        let exceed = lc_util == 0.0 || used > self.lc_max;
        let hold = used + step >= self.lc_max;
        (exceed, hold)
    }
}

impl Resource for CpuCycle {
    fn kind(&self) -> ContendedResource {
        ContendedResource::CpuCycles
    }

    fn resource_level(&self) -> &ResourceLevel {
        &self.level
    }

    fn resource_level_mut(&mut self) -> &mut ResourceLevel {
        &mut self.level
    }

    fn budgeting(&self, bes: &[TaskId], _lcs: &[TaskId], allocs: &mut AllocationDiff<'_>) {
        if bes.is_empty() {
            return;
        }
        let quota = self.quota() / bes.len() as f64;
        for task_id in bes {
            allocs.set_alloc(task_id, Allocation::CpuQuota(quota));
        }
        info!(tasks = %bes.join(","), quota = quota, "Set cpu quota");
    }
}
