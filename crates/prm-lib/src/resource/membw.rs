//! Memory bandwidth throttling through RDT MBA

use super::{Allocation, AllocationDiff, RdtGroup, Resource, ResourceLevel, LEVEL_MIN};
use crate::models::{ContendedResource, TaskId};
use tracing::debug;

/// MBA percentage granted to BE tasks
#[derive(Debug, Clone)]
pub struct MemoryBandwidth {
    level: ResourceLevel,
    min_bandwidth: u32,
    bandwidth_gran: u32,
    sockets: u32,
}

impl Default for MemoryBandwidth {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBandwidth {
    pub fn new() -> Self {
        Self {
            level: ResourceLevel::new(LEVEL_MIN, 0),
            min_bandwidth: 0,
            bandwidth_gran: 0,
            sockets: 0,
        }
    }

    pub fn update_platform(&mut self, min_bandwidth: u32, bandwidth_gran: u32, sockets: u32) {
        self.min_bandwidth = min_bandwidth;
        self.bandwidth_gran = bandwidth_gran;
        self.sockets = sockets;

        let level_max = if bandwidth_gran == 0 {
            0
        } else {
            100u32.saturating_sub(min_bandwidth) / bandwidth_gran
        };
        self.level.set_level_max(level_max as i32);
    }

    /// Bandwidth percentage at the current level
    pub fn value(&self) -> u32 {
        if self.level.is_full_level() {
            100
        } else if self.level.is_min_level() {
            self.min_bandwidth
        } else {
            let value = self.min_bandwidth + self.level.level() as u32 * self.bandwidth_gran;
            value.min(100)
        }
    }

    fn schemata(&self) -> String {
        let value = self.value();
        let sockets: Vec<String> = (0..self.sockets)
            .map(|socket| format!("{}={}", socket, value))
            .collect();
        format!("MB:{}", sockets.join(";"))
    }
}

impl Resource for MemoryBandwidth {
    fn kind(&self) -> ContendedResource {
        ContendedResource::MemoryBw
    }

    fn resource_level(&self) -> &ResourceLevel {
        &self.level
    }

    fn resource_level_mut(&mut self) -> &mut ResourceLevel {
        &mut self.level
    }

    fn budgeting(&self, bes: &[TaskId], _lcs: &[TaskId], allocs: &mut AllocationDiff<'_>) {
        let schemata = self.schemata();
        for task_id in bes {
            allocs.set_alloc(
                task_id,
                Allocation::Mb {
                    group: RdtGroup::BestEffort,
                    schemata: schemata.clone(),
                },
            );
        }
        debug!(level = self.level.level(), schemata = %schemata, "Set BE memory bandwidth");
    }
}
