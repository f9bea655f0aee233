//! Coordination error types.

use thiserror::Error;

/// Result type for coordination operations.
pub type Result<T> = std::result::Result<T, CoordinationError>;

/// Coordination errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoordinationError {
    /// The connection to the ensemble was lost; the session may still be alive.
    #[error("Connection loss")]
    ConnectionLoss,

    /// The ensemble did not answer in time.
    #[error("Operation timed out")]
    OperationTimeout,

    /// The session is gone and everything it owned went with it.
    #[error("Session expired")]
    SessionExpired,

    /// Protocol misuse, such as an update routed to a stale handle.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A blocking call was interrupted.
    #[error("Interrupted")]
    Interrupted,

    /// Node does not exist.
    #[error("No node: {0}")]
    NoNode(String),

    /// Node already exists.
    #[error("Node exists: {0}")]
    NodeExists(String),

    /// Node still has children.
    #[error("Node not empty: {0}")]
    NotEmpty(String),

    /// Ephemeral nodes may not have children.
    #[error("Ephemeral nodes may not have children: {0}")]
    NoChildrenForEphemerals(String),

    /// The session or client has been closed.
    #[error("Closed")]
    Closed,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl CoordinationError {
    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConnectionLoss | Self::OperationTimeout)
    }

    /// Check if this error means the session itself is gone.
    pub fn is_session_expired(&self) -> bool {
        matches!(self, Self::SessionExpired)
    }

    /// Shorthand for [`CoordinationError::InvalidState`].
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(CoordinationError::ConnectionLoss.is_retryable());
        assert!(CoordinationError::OperationTimeout.is_retryable());
        assert!(!CoordinationError::SessionExpired.is_retryable());
        assert!(!CoordinationError::invalid_state("stale").is_retryable());
        assert!(!CoordinationError::NoNode("/a".into()).is_retryable());
    }

    #[test]
    fn test_display() {
        let err = CoordinationError::NoNode("/foo/bar".to_string());
        assert_eq!(err.to_string(), "No node: /foo/bar");
        assert!(CoordinationError::SessionExpired.is_session_expired());
    }
}
