//! Allocation records and the per-cycle allocation diff

use crate::models::TaskId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// RDT class-of-service assignment of a task
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RdtAllocation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Cache schemata, e.g. `L3:0=0xc0000;1=0xc0000`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub l3: Option<String>,
    /// Bandwidth schemata, e.g. `MB:0=10;1=10`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mb: Option<String>,
}

/// Allocations of one task, absent fields are left untouched
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskAllocation {
    /// CFS quota as a fraction of one cpu
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_quota: Option<f64>,
    /// Normalized CPU shares
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_shares: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rdt: Option<RdtAllocation>,
}

/// Task id -> allocations
pub type TasksAllocations = HashMap<TaskId, TaskAllocation>;

/// RDT group a task is placed in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RdtGroup {
    BestEffort,
    LatencyCritical,
}

impl RdtGroup {
    pub fn as_str(&self) -> &'static str {
        match self {
            RdtGroup::BestEffort => "BE_Group",
            RdtGroup::LatencyCritical => "LC_Group",
        }
    }
}

/// One concrete allocation value
#[derive(Debug, Clone, PartialEq)]
pub enum Allocation {
    CpuQuota(f64),
    CpuShares(f64),
    L3 { group: RdtGroup, schemata: String },
    Mb { group: RdtGroup, schemata: String },
}

/// Allocation changes collected during one cycle
///
/// Values equal to what the host already applied are dropped, so the host
/// only ever sees real changes.
#[derive(Debug)]
pub struct AllocationDiff<'a> {
    current: &'a TasksAllocations,
    pending: TasksAllocations,
}

impl<'a> AllocationDiff<'a> {
    pub fn new(current: &'a TasksAllocations) -> Self {
        Self {
            current,
            pending: TasksAllocations::new(),
        }
    }

    fn is_applied(&self, task_id: &str, alloc: &Allocation) -> bool {
        let Some(current) = self.current.get(task_id) else {
            return false;
        };
        let rdt = current.rdt.as_ref();
        match alloc {
            Allocation::CpuQuota(v) => current.cpu_quota == Some(*v),
            Allocation::CpuShares(v) => current.cpu_shares == Some(*v),
            Allocation::L3 { schemata, .. } => {
                rdt.and_then(|r| r.l3.as_deref()) == Some(schemata.as_str())
            }
            Allocation::Mb { schemata, .. } => {
                rdt.and_then(|r| r.mb.as_deref()) == Some(schemata.as_str())
            }
        }
    }

    /// Record `alloc` for `task_id` unless it is already in force
    ///
    /// Cache and bandwidth schemata of one task merge into a single RDT
    /// allocation.
    pub fn set_alloc(&mut self, task_id: &str, alloc: Allocation) {
        if self.is_applied(task_id, &alloc) {
            return;
        }

        let entry = self.pending.entry(task_id.to_string()).or_default();
        match alloc {
            Allocation::CpuQuota(v) => entry.cpu_quota = Some(v),
            Allocation::CpuShares(v) => entry.cpu_shares = Some(v),
            Allocation::L3 { group, schemata } => {
                let rdt = entry.rdt.get_or_insert_with(RdtAllocation::default);
                rdt.name = Some(group.as_str().to_string());
                rdt.l3 = Some(schemata);
            }
            Allocation::Mb { group, schemata } => {
                let rdt = entry.rdt.get_or_insert_with(RdtAllocation::default);
                rdt.name = Some(group.as_str().to_string());
                rdt.mb = Some(schemata);
            }
        }
    }

    pub fn pending(&self) -> &TasksAllocations {
        &self.pending
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn into_pending(self) -> TasksAllocations {
        self.pending
    }
}
