//! Threshold snapshot sharing and periodic refresh
//!
//! Readers clone the current `Arc<ThresholdModel>` and keep using it for the
//! whole detection pass. A refresh builds a complete new model and swaps the
//! pointer, so a slow or failed pull never disturbs detection.

use super::{ModelStore, ThresholdModel};
use crate::error::ModelError;
use crate::observability::{AgentMetrics, StructuredLogger};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{info, warn};

/// Default bound on a single model pull
pub const DEFAULT_PULL_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared, atomically swappable threshold snapshot
#[derive(Debug, Clone, Default)]
pub struct ThresholdHandle {
    current: Arc<RwLock<Arc<ThresholdModel>>>,
}

impl ThresholdHandle {
    pub fn new(model: ThresholdModel) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(model))),
        }
    }

    /// The snapshot in force right now
    pub fn snapshot(&self) -> Arc<ThresholdModel> {
        let guard = self.current.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    /// Swap in a new snapshot
    pub fn replace(&self, model: ThresholdModel) {
        let model = Arc::new(model);
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        *guard = model;
    }
}

/// Pulls the threshold record of a cpu model and swaps it in
#[derive(Clone)]
pub struct ThresholdRefresher {
    store: Arc<dyn ModelStore>,
    handle: ThresholdHandle,
    timeout: Duration,
    metrics: Option<AgentMetrics>,
    logger: Option<StructuredLogger>,
}

impl ThresholdRefresher {
    pub fn new(store: Arc<dyn ModelStore>, handle: ThresholdHandle) -> Self {
        Self {
            store,
            handle,
            timeout: DEFAULT_PULL_TIMEOUT,
            metrics: None,
            logger: None,
        }
    }

    /// Bound each pull by `timeout`
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_metrics(mut self, metrics: AgentMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn handle(&self) -> &ThresholdHandle {
        &self.handle
    }

    /// Pull and swap in the model for `cpu_model`
    ///
    /// Returns `Ok(false)` when the store has nothing for this cpu model or
    /// holds an empty record; the previous snapshot stays in place.
    pub async fn refresh(&self, cpu_model: &str) -> Result<bool, ModelError> {
        let record = tokio::time::timeout(self.timeout, self.store.get(cpu_model))
            .await
            .map_err(|_| ModelError::Timeout(self.timeout))??;

        let Some(record) = record else {
            return Ok(false);
        };

        let model = ThresholdModel::from_cpu_model_document(cpu_model, &record)?;
        if model.is_empty() {
            return Ok(false);
        }

        self.handle.replace(model);
        Ok(true)
    }

    /// [`refresh`](Self::refresh) with failures logged and counted instead
    /// of returned
    pub async fn refresh_logged(&self, cpu_model: &str) -> bool {
        let result = self.refresh(cpu_model).await;
        if let Some(logger) = &self.logger {
            logger.log_threshold_refresh(cpu_model, &result);
        }
        match result {
            Ok(true) => {
                info!(cpu_model = %cpu_model, "Pulled threshold model");
                true
            }
            Ok(false) => {
                warn!(cpu_model = %cpu_model, "No threshold model in store, keeping previous snapshot");
                false
            }
            Err(e) => {
                if let Some(metrics) = &self.metrics {
                    metrics.inc_threshold_refresh_errors();
                }
                warn!(
                    cpu_model = %cpu_model,
                    error = %e,
                    "Failed to pull threshold model, keeping previous snapshot"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::threshold::LocalModelStore;
    use async_trait::async_trait;
    use tempfile::TempDir;

    const RECORD: &str = r#"{"redis.v6": {"4": {"metrics_threshold": [
        {"util_start": 200, "util_end": 250, "cpi": 1.2, "mpki": 3.0, "mb": 900}
    ]}}}"#;

    /// Store that never answers
    struct StalledStore;

    #[async_trait]
    impl ModelStore for StalledStore {
        async fn get(&self, _key: &str) -> Result<Option<String>, ModelError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(None)
        }

        async fn set(&self, _key: &str, _value: &str) -> Result<(), ModelError> {
            Ok(())
        }
    }

    #[test]
    fn test_snapshot_survives_replace() {
        let handle = ThresholdHandle::default();
        let before = handle.snapshot();

        let mut model = ThresholdModel::new();
        model.insert_cpu_model("Xeon", Default::default());
        handle.replace(model.clone());

        assert_eq!(*before, ThresholdModel::new());
        assert_eq!(*handle.snapshot(), model);
    }

    #[tokio::test]
    async fn test_refresh_swaps_model() {
        let dir = TempDir::new().unwrap();
        let store = LocalModelStore::new(dir.path());
        store.set("Xeon Gold", RECORD).await.unwrap();

        let handle = ThresholdHandle::default();
        let refresher = ThresholdRefresher::new(Arc::new(store), handle.clone());

        assert!(refresher.refresh("Xeon Gold").await.unwrap());
        assert!(handle
            .snapshot()
            .metrics_thresholds("Xeon Gold", 4.0, "redis.v6")
            .is_some());
    }

    #[tokio::test]
    async fn test_refresh_missing_record_keeps_snapshot() {
        let dir = TempDir::new().unwrap();
        let handle = ThresholdHandle::default();
        let refresher =
            ThresholdRefresher::new(Arc::new(LocalModelStore::new(dir.path())), handle.clone());

        assert!(!refresher.refresh("Xeon").await.unwrap());
        assert!(handle.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_refresh_malformed_record_keeps_snapshot() {
        let dir = TempDir::new().unwrap();
        let store = LocalModelStore::new(dir.path());
        store.set("Xeon", RECORD).await.unwrap();

        let handle = ThresholdHandle::default();
        let refresher = ThresholdRefresher::new(Arc::new(store.clone()), handle.clone());
        refresher.refresh("Xeon").await.unwrap();

        store.set("Xeon", "{ not json").await.unwrap();
        assert!(matches!(
            refresher.refresh("Xeon").await,
            Err(ModelError::Parse(_))
        ));
        assert!(!refresher.refresh_logged("Xeon").await);
        assert!(handle
            .snapshot()
            .metrics_thresholds("Xeon", 4.0, "redis.v6")
            .is_some());
    }

    #[tokio::test]
    async fn test_refresh_times_out() {
        let handle = ThresholdHandle::default();
        let refresher = ThresholdRefresher::new(Arc::new(StalledStore), handle)
            .with_timeout(Duration::from_millis(50));

        let err = refresher.refresh("Xeon").await.unwrap_err();
        assert!(matches!(err, ModelError::Timeout(_)));
    }
}
