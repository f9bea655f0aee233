//! Recipe error types.

use thiserror::Error;
use trellis_client::CoordinationError;

/// Result type for recipe operations.
pub type Result<T> = std::result::Result<T, LockError>;

/// Lock and semaphore errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    /// The acquire deadline passed. The waiter's reservation has been removed.
    #[error("Lock timeout")]
    Timeout,

    /// Invalid argument.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Error from the coordination layer.
    #[error("Coordination error: {0}")]
    Coordination(#[from] CoordinationError),
}

impl LockError {
    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Coordination(e) if e.is_retryable())
    }

    pub(crate) fn is_session_expired(&self) -> bool {
        matches!(self, Self::Coordination(e) if e.is_session_expired())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_follows_coordination_error() {
        assert!(LockError::from(CoordinationError::ConnectionLoss).is_retryable());
        assert!(!LockError::from(CoordinationError::SessionExpired).is_retryable());
        assert!(!LockError::Timeout.is_retryable());
    }

    #[test]
    fn test_display() {
        assert_eq!(LockError::Timeout.to_string(), "Lock timeout");
        assert_eq!(
            LockError::from(CoordinationError::NoNode("/a".into())).to_string(),
            "Coordination error: No node: /a"
        );
    }
}
