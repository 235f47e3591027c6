//! Platform resource manager library
//!
//! This crate provides the core functionality for:
//! - Per-task hardware metric tracking
//! - Utilization-bucketed threshold models
//! - Contention detection and contender attribution
//! - Level based CPU, cache and memory bandwidth regulation
//! - Health checks and observability

pub mod detector;
pub mod error;
pub mod health;
pub mod host;
pub mod metrics;
pub mod models;
pub mod observability;
pub mod regulator;
pub mod resource;
pub mod threshold;

pub use error::{HostError, ModelError, ResourceError};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{AgentMetrics, StructuredLogger};
pub use regulator::{
    CycleOutput, RegulationLoop, RegulationLoopBuilder, RegulatorConfig, RegulatorStatus,
    ResourceLevels, ResourceRegulator,
};
