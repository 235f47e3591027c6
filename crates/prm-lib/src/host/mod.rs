//! Boundary to the host orchestration framework
//!
//! The host measures tasks and enforces allocations; the regulator only
//! sees snapshots and hands back allocation diffs.

mod file;

pub use file::{JsonFileSource, JsonLinesSink};

use crate::error::HostError;
use crate::models::CycleInput;
use crate::regulator::CycleOutput;
use async_trait::async_trait;

/// Supplier of per-cycle task snapshots
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Next snapshot, `None` when nothing new is available this tick
    async fn next_snapshot(&self) -> Result<Option<CycleInput>, HostError>;
}

/// Receiver of regulation results
#[async_trait]
pub trait AllocationSink: Send + Sync {
    async fn apply(&self, output: &CycleOutput) -> Result<(), HostError>;
}
