//! File based host boundary
//!
//! The host writes a JSON snapshot file before each tick and tails a JSON
//! lines file for allocation decisions.

use super::{AllocationSink, SnapshotSource};
use crate::error::HostError;
use crate::models::CycleInput;
use crate::regulator::CycleOutput;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Reads the snapshot the host last wrote to a file
///
/// A snapshot whose timestamp was already returned is skipped, so a host
/// that falls behind never makes the regulator count the same sample twice.
#[derive(Debug)]
pub struct JsonFileSource {
    path: PathBuf,
    last_timestamp: Mutex<Option<f64>>,
}

impl JsonFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last_timestamp: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SnapshotSource for JsonFileSource {
    async fn next_snapshot(&self) -> Result<Option<CycleInput>, HostError> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(HostError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let input: CycleInput = serde_json::from_str(&raw)?;

        let mut last = self.last_timestamp.lock().unwrap_or_else(|e| e.into_inner());
        if *last == Some(input.timestamp) {
            debug!(timestamp = input.timestamp, "Snapshot unchanged, skipping");
            return Ok(None);
        }
        *last = Some(input.timestamp);
        Ok(Some(input))
    }
}

/// Appends one JSON record per cycle to a file
#[derive(Debug, Clone)]
pub struct JsonLinesSink {
    path: PathBuf,
}

impl JsonLinesSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl AllocationSink for JsonLinesSink {
    async fn apply(&self, output: &CycleOutput) -> Result<(), HostError> {
        let mut line = serde_json::to_vec(output)?;
        line.push(b'\n');

        let io_err = |source| HostError::Io {
            path: self.path.clone(),
            source,
        };
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(io_err)?;
        file.write_all(&line).await.map_err(io_err)?;
        file.flush().await.map_err(io_err)?;
        Ok(())
    }
}
