//! Crate-wide error taxonomy.
//!
//! Five caller-visible categories with distinct propagation rules:
//! - `Transport`: store unreachable/timeout. Retried with backoff at the
//!   connection layer, surfaced only when retries are exhausted.
//! - `Validation`: schema/permission/contract mismatch. Never retried,
//!   rejected synchronously.
//! - `Handler`: consumer logic failed. Contained in the retry/dead-letter
//!   pipeline, never thrown back into broker control flow.
//! - `RateLimit`: rejected synchronously, caller may retry later.
//! - `Security`: stale timestamp or bad signature. Rejected synchronously
//!   and logged as a security event.

use thiserror::Error;

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Handler '{group}' failed: {message}")]
    Handler { group: String, message: String },

    #[error("Rate limit exceeded for project '{0}'")]
    RateLimit(String),

    #[error("Security check failed: {0}")]
    Security(String),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Subscription '{0}' not found")]
    SubscriptionNotFound(String),

    #[error("Shutting down")]
    ShuttingDown,
}

impl BusError {
    /// Transport errors are retried at the connection layer; everything
    /// else is rejected to the caller as-is.
    pub fn is_transient(&self) -> bool {
        matches!(self, BusError::Transport(_))
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for BusError {
    fn from(err: redis::RedisError) -> Self {
        BusError::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BusError::Transport("connection refused".to_string());
        assert!(err.to_string().contains("connection refused"));

        let err = BusError::RateLimit("billing".to_string());
        assert!(err.to_string().contains("billing"));

        let err = BusError::Handler {
            group: "invoices".to_string(),
            message: "boom".to_string(),
        };
        assert!(err.to_string().contains("invoices"));
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(BusError::Transport("timeout".to_string()).is_transient());
        assert!(!BusError::Validation("bad payload".to_string()).is_transient());
        assert!(!BusError::Security("stale message".to_string()).is_transient());
    }
}
