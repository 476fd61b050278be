//! Error types for the hydration engine.

use crate::types::SubscriptionKey;
use thiserror::Error;

/// Main error type for subscription and hydration operations.
///
/// Errors are `Clone` because a captured error is stored on the subscription
/// and handed out to every reader through `current_error()`.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum SyncError {
    /// The store listener reported an error (network loss, permission denial).
    #[error("Transport error ({code}): {message}")]
    Transport { code: String, message: String },

    /// An update expectation was not satisfied in time.
    #[error("Timed out after {waited_ms}ms waiting for `{path}`")]
    Timeout { path: String, waited_ms: u64 },

    /// A derived query could not be built from upstream data.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Nested `acquire` for a key whose factory is still running.
    #[error("Re-entrant acquire for key {0}")]
    Reentrancy(SubscriptionKey),

    /// The record pipeline rejected a document.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Adding a dependency edge would close a cycle.
    #[error("Dependency cycle: node {from} already reachable from node {to}")]
    DependencyCycle { from: u64, to: u64 },

    /// A derived subscription's input failed.
    #[error("Upstream failed: {0}")]
    UpstreamFailed(Box<SyncError>),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// The store rejected a write.
    #[error("Write rejected: {0}")]
    Write(String),
}

impl SyncError {
    /// Build a transport error.
    pub fn transport(code: impl Into<String>, message: impl Into<String>) -> Self {
        SyncError::Transport {
            code: code.into(),
            message: message.into(),
        }
    }

    /// The innermost error, unwrapping any `UpstreamFailed` layers.
    pub fn root_cause(&self) -> &SyncError {
        match self {
            SyncError::UpstreamFailed(inner) => inner.root_cause(),
            other => other,
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Configuration(e.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(e: std::io::Error) -> Self {
        SyncError::Configuration(e.to_string())
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_cause_unwraps_upstream() {
        let err = SyncError::UpstreamFailed(Box::new(SyncError::UpstreamFailed(Box::new(
            SyncError::transport("unavailable", "offline"),
        ))));
        assert_eq!(
            err.root_cause(),
            &SyncError::transport("unavailable", "offline")
        );
    }

    #[test]
    fn test_display() {
        let err = SyncError::Timeout {
            path: "status".to_string(),
            waited_ms: 5000,
        };
        assert_eq!(
            err.to_string(),
            "Timed out after 5000ms waiting for `status`"
        );
    }
}
