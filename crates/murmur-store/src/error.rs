//! Error types for the durable store.

use thiserror::Error;

/// Errors that can occur when talking to a storage backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The write would push the backend over its byte quota.
    #[error("storage quota exceeded: {needed} bytes needed, {available} available")]
    QuotaExceeded { needed: usize, available: usize },

    /// Filesystem error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Key contains characters the backend cannot store.
    #[error("invalid store key: {0:?}")]
    InvalidKey(String),
}

impl StoreError {
    /// Whether this error means "out of space" rather than a real fault.
    pub fn is_quota(&self) -> bool {
        matches!(self, StoreError::QuotaExceeded { .. })
    }
}
