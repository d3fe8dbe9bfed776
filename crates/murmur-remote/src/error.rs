//! Error types for the backend client.

use thiserror::Error;

/// Errors that can occur when talking to the hosted backend.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// The request did not finish within its time bound.
    #[error("request timed out")]
    Timeout,

    /// The backend could not be reached or failed on its side.
    #[error("backend unreachable: {0}")]
    Unreachable(String),

    /// The backend's access policy rejected the request.
    #[error("blocked by backend policy ({status}): {message}")]
    Denied { status: u16, message: String },

    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(reqwest::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Row not found.
    #[error("row not found: {collection}/{id}")]
    NotFound { collection: String, id: String },

    /// Invalid response from the backend.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// No backend credentials are configured.
    #[error("backend not configured")]
    NotConfigured,
}

impl RemoteError {
    /// Whether a later attempt may succeed without any configuration change.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RemoteError::Timeout | RemoteError::Unreachable(_) | RemoteError::WebSocket(_)
        )
    }

    /// Whether the backend refused the request on access-policy grounds.
    pub fn is_denied(&self) -> bool {
        matches!(self, RemoteError::Denied { .. })
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            RemoteError::Timeout
        } else if e.is_connect() {
            RemoteError::Unreachable(e.to_string())
        } else if e.is_decode() {
            RemoteError::InvalidResponse(e.to_string())
        } else {
            RemoteError::Http(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(RemoteError::Timeout.is_transient());
        assert!(RemoteError::Unreachable("dns".into()).is_transient());
        assert!(!RemoteError::NotConfigured.is_transient());

        let denied = RemoteError::Denied {
            status: 403,
            message: "row level security".into(),
        };
        assert!(denied.is_denied());
        assert!(!denied.is_transient());
        assert!(denied.to_string().contains("policy"));
    }
}
