//! Error types for the platform resource manager library

use thiserror::Error;

/// Errors raised while loading or refreshing threshold models
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("failed to access model store key {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed threshold document: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("model pull timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Errors raised while configuring a resource actuator
#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("invalid cache capacity bitmask {0:?}")]
    InvalidCbmMask(String),
}

/// Errors raised at the host boundary (snapshot source, allocation sink)
#[derive(Debug, Error)]
pub enum HostError {
    #[error("host I/O error on {}: {source}", path.display())]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid host JSON: {0}")]
    Decode(#[from] serde_json::Error),
}
