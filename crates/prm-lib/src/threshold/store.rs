//! Key/value stores holding threshold models

use crate::error::ModelError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Store key under which the LC utilization peak is persisted
pub const LC_UTIL_MAX_KEY: &str = "lcutilmax";

/// Replace every character outside `[-_.A-Za-z0-9]` with `_`
pub fn correct_key_characters(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Key/value store the threshold model is pulled from
#[async_trait]
pub trait ModelStore: Send + Sync {
    /// Fetch the value stored under `key`, `None` if absent
    async fn get(&self, key: &str) -> Result<Option<String>, ModelError>;

    /// Store `value` under `key`
    async fn set(&self, key: &str, value: &str) -> Result<(), ModelError>;

    /// Load the persisted LC utilization peak
    async fn load_lc_util_max(&self) -> Result<Option<f64>, ModelError> {
        match self.get(LC_UTIL_MAX_KEY).await? {
            Some(raw) => Ok(Some(serde_json::from_str(raw.trim())?)),
            None => Ok(None),
        }
    }

    /// Persist a new LC utilization peak
    async fn save_lc_util_max(&self, value: f64) -> Result<(), ModelError> {
        self.set(LC_UTIL_MAX_KEY, &serde_json::to_string(&value)?).await
    }
}

/// Directory-backed store, one file per (sanitised) key
#[derive(Debug, Clone)]
pub struct LocalModelStore {
    directory: PathBuf,
}

impl LocalModelStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.directory.join(correct_key_characters(key))
    }
}

#[async_trait]
impl ModelStore for LocalModelStore {
    async fn get(&self, key: &str) -> Result<Option<String>, ModelError> {
        let path = self.path_for(key);
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No model stored for key");
                Ok(None)
            }
            Err(source) => Err(ModelError::Io {
                key: key.to_string(),
                source,
            }),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), ModelError> {
        let io_err = |source| ModelError::Io {
            key: key.to_string(),
            source,
        };
        tokio::fs::create_dir_all(&self.directory)
            .await
            .map_err(io_err)?;
        tokio::fs::write(self.path_for(key), value)
            .await
            .map_err(io_err)
    }
}
