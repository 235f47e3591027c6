//! Last level cache partitioning through RDT cache bit masks

use super::{Allocation, AllocationDiff, RdtGroup, Resource, ResourceLevel, LEVEL_MIN};
use crate::error::ResourceError;
use crate::models::{ContendedResource, TaskId};
use tracing::{debug, info, warn};

/// LLC way allocation for BE tasks, and for LC tasks in exclusive mode
///
/// Level `i` grants BE tasks the `i + 2` highest ways of the platform mask.
/// In exclusive mode LC tasks get the low ways below the BE mask, so the two
/// tables never overlap, and only the first half of the levels is used.
#[derive(Debug, Clone)]
pub struct LlcOccupancy {
    level: ResourceLevel,
    exclusive: bool,
    cbm_mask: Option<u128>,
    sockets: u32,
    be_masks: Vec<u128>,
    lc_masks: Vec<u128>,
}

impl LlcOccupancy {
    pub fn new(exclusive: bool) -> Self {
        Self {
            level: ResourceLevel::new(LEVEL_MIN, 0),
            exclusive,
            cbm_mask: None,
            sockets: 0,
            be_masks: Vec::new(),
            lc_masks: Vec::new(),
        }
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    pub fn is_configured(&self) -> bool {
        !self.be_masks.is_empty()
    }

    /// Apply the platform cache mask and socket count
    ///
    /// Mask tables are only rebuilt when the mask changes.
    pub fn update_platform(&mut self, cbm_mask: &str, sockets: u32) -> Result<(), ResourceError> {
        let mask = parse_cbm(cbm_mask)?;
        self.sockets = sockets;
        if self.cbm_mask == Some(mask) {
            return Ok(());
        }

        let bitcnt = mask.count_ones() as usize;
        if bitcnt < 2 {
            return Err(ResourceError::InvalidCbmMask(cbm_mask.to_string()));
        }
        let mut be_masks = Vec::with_capacity(bitcnt.saturating_sub(1));
        let mut lc_masks = Vec::with_capacity(bitcnt.saturating_sub(1));
        for i in 1..bitcnt {
            be_masks.push(((1u128 << (i + 1)) - 1) << (bitcnt - 1 - i));
            lc_masks.push((1u128 << (bitcnt - 1 - i)) - 1);
        }

        let level_max = if self.exclusive {
            be_masks.truncate(bitcnt / 2);
            lc_masks.truncate(bitcnt / 2);
            (bitcnt / 2) as i32 - 1
        } else {
            bitcnt as i32 - 1
        };

        info!(
            cbm_mask = %cbm_mask,
            bits = bitcnt,
            level_max = level_max,
            exclusive = self.exclusive,
            "Rebuilt cache mask tables"
        );

        self.cbm_mask = Some(mask);
        self.be_masks = be_masks;
        self.lc_masks = lc_masks;
        self.level.set_level_max(level_max.max(0));
        Ok(())
    }

    fn table_index(&self) -> usize {
        let last = self.be_masks.len().saturating_sub(1);
        if self.level.is_full_level() {
            last
        } else {
            (self.level.level().max(0) as usize).min(last)
        }
    }

    fn schemata(&self, mask: u128) -> String {
        let sockets: Vec<String> = (0..self.sockets)
            .map(|socket| format!("{}={:#x}", socket, mask))
            .collect();
        format!("L3:{}", sockets.join(";"))
    }
}

fn parse_cbm(cbm_mask: &str) -> Result<u128, ResourceError> {
    let digits = cbm_mask
        .trim()
        .trim_start_matches("0x")
        .trim_start_matches("0X");
    match u128::from_str_radix(digits, 16) {
        Ok(mask) if mask != 0 => Ok(mask),
        _ => Err(ResourceError::InvalidCbmMask(cbm_mask.to_string())),
    }
}

impl Resource for LlcOccupancy {
    fn kind(&self) -> ContendedResource {
        ContendedResource::Llc
    }

    fn resource_level(&self) -> &ResourceLevel {
        &self.level
    }

    fn resource_level_mut(&mut self) -> &mut ResourceLevel {
        &mut self.level
    }

    fn budgeting(&self, bes: &[TaskId], lcs: &[TaskId], allocs: &mut AllocationDiff<'_>) {
        if !self.is_configured() {
            warn!("Cache mask tables are empty, skipping LLC budgeting");
            return;
        }

        let idx = self.table_index();
        let be_schemata = self.schemata(self.be_masks[idx]);
        for task_id in bes {
            allocs.set_alloc(
                task_id,
                Allocation::L3 {
                    group: RdtGroup::BestEffort,
                    schemata: be_schemata.clone(),
                },
            );
        }
        debug!(level = self.level.level(), schemata = %be_schemata, "Set BE cache ways");

        if self.exclusive {
            let lc_schemata = self.schemata(self.lc_masks[idx]);
            for task_id in lcs {
                allocs.set_alloc(
                    task_id,
                    Allocation::L3 {
                        group: RdtGroup::LatencyCritical,
                        schemata: lc_schemata.clone(),
                    },
                );
            }
            debug!(level = self.level.level(), schemata = %lc_schemata, "Set LC cache ways");
        }
    }
}
