//! Dwell based level controller
//!
//! Contention clamps a resource to its minimum level immediately; the level
//! is then released one step at a time, each step only after a full dwell
//! period without contention.

use super::{AllocationDiff, Resource};
use crate::models::TaskId;
use tracing::{debug, info};

/// Default number of quiet cycles before a level step
pub const DEFAULT_DWELL_CYCLES: u32 = 3;

/// What a controller did in one update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    /// Contention seen, level clamped to MIN
    Throttled,
    /// Level kept because of a hold signal or because it is already FULL
    Held,
    /// Quiet cycle counted toward the next step
    Waiting { dwell: u32 },
    /// Dwell elapsed, level raised
    Raised { level: i32 },
}

#[derive(Debug, Clone)]
pub struct NaiveController<R: Resource> {
    resource: R,
    cyc_thresh: u32,
    cyc_cnt: u32,
}

impl<R: Resource> NaiveController<R> {
    pub fn new(resource: R, cyc_thresh: u32) -> Self {
        Self {
            resource,
            cyc_thresh,
            cyc_cnt: 0,
        }
    }

    pub fn resource(&self) -> &R {
        &self.resource
    }

    pub fn resource_mut(&mut self) -> &mut R {
        &mut self.resource
    }

    /// Quiet cycles counted since the last step or clamp
    pub fn dwell(&self) -> u32 {
        self.cyc_cnt
    }

    pub fn dwell_threshold(&self) -> u32 {
        self.cyc_thresh
    }

    pub fn update(
        &mut self,
        bes: &[TaskId],
        lcs: &[TaskId],
        detected: bool,
        hold: bool,
        allocs: &mut AllocationDiff<'_>,
    ) -> ControlAction {
        let kind = self.resource.kind();

        if detected {
            self.cyc_cnt = 0;
            if !self.resource.is_min_level() {
                info!(resource = %kind, "Contention detected, throttling to minimum level");
            }
            self.resource.set_level(super::LEVEL_MIN);
            self.resource.budgeting(bes, lcs, allocs);
            return ControlAction::Throttled;
        }

        if hold || self.resource.is_full_level() {
            return ControlAction::Held;
        }

        self.cyc_cnt += 1;
        if self.cyc_cnt < self.cyc_thresh {
            debug!(resource = %kind, dwell = self.cyc_cnt, "Waiting before raising level");
            return ControlAction::Waiting {
                dwell: self.cyc_cnt,
            };
        }

        self.cyc_cnt = 0;
        self.resource.increase_level();
        let level = self.resource.level();
        info!(resource = %kind, level = level, "Raised resource level");
        self.resource.budgeting(bes, lcs, allocs);
        ControlAction::Raised { level }
    }
}
