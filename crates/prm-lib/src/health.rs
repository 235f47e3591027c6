//! Agent component health
//!
//! Each component of the regulation path reports successes and failures.
//! A failing component is degraded at first and becomes unhealthy after
//! `FAILURES_BEFORE_UNHEALTHY` consecutive failures. Threshold refresh
//! failures never escalate: the regulator keeps running on the last
//! snapshot it pulled.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Consecutive failures after which a component is unhealthy
pub const FAILURES_BEFORE_UNHEALTHY: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Failures reported since the last success
    #[serde(default)]
    pub consecutive_failures: u32,
    pub last_check_timestamp: i64,
}

impl ComponentHealth {
    pub fn healthy() -> Self {
        Self {
            status: ComponentStatus::Healthy,
            message: None,
            consecutive_failures: 0,
            last_check_timestamp: chrono::Utc::now().timestamp(),
        }
    }

    fn failing(name: &str, message: String, consecutive_failures: u32) -> Self {
        let status = if consecutive_failures >= FAILURES_BEFORE_UNHEALTHY
            && components::escalates(name)
        {
            ComponentStatus::Unhealthy
        } else {
            ComponentStatus::Degraded
        };
        Self {
            status,
            message: Some(message),
            consecutive_failures,
            last_check_timestamp: chrono::Utc::now().timestamp(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: HashMap<String, ComponentHealth>,
}

impl HealthResponse {
    /// Worst status among the components, healthy when there are none
    pub fn compute_status(components: &HashMap<String, ComponentHealth>) -> ComponentStatus {
        components
            .values()
            .map(|health| health.status)
            .max()
            .unwrap_or(ComponentStatus::Healthy)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

pub mod components {
    pub const SNAPSHOT_SOURCE: &str = "snapshot_source";
    pub const REGULATOR: &str = "regulator";
    pub const THRESHOLDS: &str = "thresholds";
    pub const ALLOCATION_SINK: &str = "allocation_sink";

    pub const ALL: [&str; 4] = [SNAPSHOT_SOURCE, REGULATOR, THRESHOLDS, ALLOCATION_SINK];

    /// Whether repeated failures make the component unhealthy
    pub fn escalates(name: &str) -> bool {
        name != THRESHOLDS
    }
}

/// Shared health state of the agent components
#[derive(Debug, Clone)]
pub struct HealthRegistry {
    components: Arc<RwLock<HashMap<String, ComponentHealth>>>,
    initialized: Arc<RwLock<bool>>,
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthRegistry {
    /// Registry with every agent component healthy and the regulator not yet
    /// initialized
    pub fn new() -> Self {
        let components = components::ALL
            .iter()
            .map(|name| (name.to_string(), ComponentHealth::healthy()))
            .collect();
        Self {
            components: Arc::new(RwLock::new(components)),
            initialized: Arc::new(RwLock::new(false)),
        }
    }

    pub async fn status_of(&self, name: &str) -> Option<ComponentStatus> {
        self.components.read().await.get(name).map(|h| h.status)
    }

    pub async fn record_success(&self, name: &str) {
        let mut components = self.components.write().await;
        components.insert(name.to_string(), ComponentHealth::healthy());
    }

    pub async fn record_failure(&self, name: &str, message: impl Into<String>) {
        let mut components = self.components.write().await;
        let failures = components
            .get(name)
            .map_or(0, |h| h.consecutive_failures)
            .saturating_add(1);
        components.insert(
            name.to_string(),
            ComponentHealth::failing(name, message.into(), failures),
        );
    }

    /// Mark the regulator as built and running
    pub async fn set_ready(&self, ready: bool) {
        *self.initialized.write().await = ready;
    }

    pub async fn health(&self) -> HealthResponse {
        let components = self.components.read().await.clone();
        let status = HealthResponse::compute_status(&components);
        HealthResponse { status, components }
    }

    /// Ready once the regulator runs and no component is unhealthy
    pub async fn readiness(&self) -> ReadinessResponse {
        if !*self.initialized.read().await {
            return ReadinessResponse {
                ready: false,
                reason: Some("Regulator not yet initialized".to_string()),
            };
        }

        let components = self.components.read().await;
        let mut unhealthy: Vec<&str> = components
            .iter()
            .filter(|(_, h)| h.status == ComponentStatus::Unhealthy)
            .map(|(name, _)| name.as_str())
            .collect();
        unhealthy.sort_unstable();

        if unhealthy.is_empty() {
            ReadinessResponse {
                ready: true,
                reason: None,
            }
        } else {
            ReadinessResponse {
                ready: false,
                reason: Some(format!("Unhealthy: {}", unhealthy.join(", "))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn fail_times(registry: &HealthRegistry, name: &str, times: u32) {
        for _ in 0..times {
            registry.record_failure(name, "failed").await;
        }
    }

    #[tokio::test]
    async fn test_all_components_start_healthy() {
        let registry = HealthRegistry::new();
        let health = registry.health().await;

        assert_eq!(health.status, ComponentStatus::Healthy);
        assert_eq!(health.components.len(), 4);
        for name in components::ALL {
            assert_eq!(registry.status_of(name).await, Some(ComponentStatus::Healthy));
        }
        assert_eq!(registry.status_of("missing").await, None);
    }

    #[tokio::test]
    async fn test_repeated_source_failures_escalate() {
        let registry = HealthRegistry::new();

        fail_times(&registry, components::SNAPSHOT_SOURCE, FAILURES_BEFORE_UNHEALTHY - 1).await;
        assert_eq!(
            registry.status_of(components::SNAPSHOT_SOURCE).await,
            Some(ComponentStatus::Degraded)
        );
        assert_eq!(registry.health().await.status, ComponentStatus::Degraded);

        fail_times(&registry, components::SNAPSHOT_SOURCE, 1).await;
        let health = registry.health().await;
        assert_eq!(health.status, ComponentStatus::Unhealthy);
        assert_eq!(
            health.components[components::SNAPSHOT_SOURCE].consecutive_failures,
            FAILURES_BEFORE_UNHEALTHY
        );
    }

    #[tokio::test]
    async fn test_stale_thresholds_stay_degraded() {
        let registry = HealthRegistry::new();
        fail_times(&registry, components::THRESHOLDS, 10).await;

        let health = registry.health().await;
        assert_eq!(health.status, ComponentStatus::Degraded);
        assert_eq!(health.components[components::THRESHOLDS].consecutive_failures, 10);
    }

    #[tokio::test]
    async fn test_success_resets_failure_streak() {
        let registry = HealthRegistry::new();
        fail_times(&registry, components::ALLOCATION_SINK, 2).await;
        registry.record_success(components::ALLOCATION_SINK).await;
        fail_times(&registry, components::ALLOCATION_SINK, 2).await;

        assert_eq!(
            registry.status_of(components::ALLOCATION_SINK).await,
            Some(ComponentStatus::Degraded)
        );
    }

    #[tokio::test]
    async fn test_readiness_waits_for_regulator() {
        let registry = HealthRegistry::new();
        let readiness = registry.readiness().await;
        assert!(!readiness.ready);
        assert_eq!(readiness.reason.as_deref(), Some("Regulator not yet initialized"));

        registry.set_ready(true).await;
        assert!(registry.readiness().await.ready);
    }

    #[tokio::test]
    async fn test_readiness_names_unhealthy_components() {
        let registry = HealthRegistry::new();
        registry.set_ready(true).await;
        fail_times(&registry, components::SNAPSHOT_SOURCE, FAILURES_BEFORE_UNHEALTHY).await;
        fail_times(&registry, components::ALLOCATION_SINK, FAILURES_BEFORE_UNHEALTHY).await;

        let readiness = registry.readiness().await;
        assert!(!readiness.ready);
        assert_eq!(
            readiness.reason.as_deref(),
            Some("Unhealthy: allocation_sink, snapshot_source")
        );

        registry.record_success(components::SNAPSHOT_SOURCE).await;
        registry.record_success(components::ALLOCATION_SINK).await;
        assert!(registry.readiness().await.ready);
    }
}
