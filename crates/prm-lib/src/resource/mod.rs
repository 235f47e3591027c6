//! Controllable platform resources
//!
//! Each resource keeps a discrete budget level. [`LEVEL_MIN`] is the
//! tightest budget and [`LEVEL_FULL`] lifts the restriction entirely;
//! budgeting turns the current level into concrete allocations.

mod allocation;
mod controller;
mod cpu;
mod llc;
mod membw;

pub use allocation::{
    Allocation, AllocationDiff, RdtAllocation, RdtGroup, TaskAllocation, TasksAllocations,
};
pub use controller::{ControlAction, NaiveController, DEFAULT_DWELL_CYCLES};
pub use cpu::{CpuCycle, DEFAULT_MIN_MARGIN_RATIO};
pub use llc::LlcOccupancy;
pub use membw::MemoryBandwidth;

use crate::models::{ContendedResource, TaskId};

/// Unrestricted level
pub const LEVEL_FULL: i32 = -1;
/// Most restricted level
pub const LEVEL_MIN: i32 = 0;
/// Default number of levels before a resource is released to FULL
pub const LEVEL_MAX: i32 = 20;

/// Budget level of one resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLevel {
    level: i32,
    level_max: i32,
}

impl Default for ResourceLevel {
    fn default() -> Self {
        Self::new(LEVEL_MIN, LEVEL_MAX)
    }
}

impl ResourceLevel {
    pub fn new(level: i32, level_max: i32) -> Self {
        Self { level, level_max }
    }

    pub fn level(&self) -> i32 {
        self.level
    }

    pub fn level_max(&self) -> i32 {
        self.level_max
    }

    pub fn set_level(&mut self, level: i32) {
        self.level = level;
    }

    pub fn set_level_max(&mut self, level_max: i32) {
        self.level_max = level_max;
    }

    /// Step up one level, reaching `level_max` releases to FULL
    pub fn increase_level(&mut self) {
        self.level += 1;
        if self.level >= self.level_max {
            self.level = LEVEL_FULL;
        }
    }

    pub fn is_min_level(&self) -> bool {
        self.level == LEVEL_MIN
    }

    pub fn is_full_level(&self) -> bool {
        self.level == LEVEL_FULL
    }
}

/// A resource that can be budgeted for BE and LC task groups
pub trait Resource {
    /// Resource axis this actuator controls
    fn kind(&self) -> ContendedResource;

    fn resource_level(&self) -> &ResourceLevel;

    fn resource_level_mut(&mut self) -> &mut ResourceLevel;

    /// Translate the current level into allocations
    ///
    /// Same task sets at the same level always produce the same values.
    fn budgeting(&self, bes: &[TaskId], lcs: &[TaskId], allocs: &mut AllocationDiff<'_>);

    fn level(&self) -> i32 {
        self.resource_level().level()
    }

    fn set_level(&mut self, level: i32) {
        self.resource_level_mut().set_level(level);
    }

    fn increase_level(&mut self) {
        self.resource_level_mut().increase_level();
    }

    fn is_min_level(&self) -> bool {
        self.resource_level().is_min_level()
    }

    fn is_full_level(&self) -> bool {
        self.resource_level().is_full_level()
    }
}
