//! Error types for SPA Core
//!
//! Collaborator and transport failures, classified so the coordinator can
//! decide between redelivery and dead-lettering:
//! - `ExternalError`: usage, recommendation, purchase and notification calls
//! - `QueueError`: intent transport operations

use spa_model::{AutopilotError, IntentDecodeError};

/// Failure reported by an external collaborator
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExternalError {
    /// Network, throttling or service-side hiccup
    #[error("transient: {0}")]
    Transient(String),

    /// Request rejected; retrying cannot help
    #[error("rejected: {0}")]
    Permanent(String),

    /// Call did not complete within its bound
    #[error("{operation} timed out after {after_ms}ms")]
    Timeout {
        operation: &'static str,
        after_ms: u64,
    },
}

impl ExternalError {
    /// Create a transient error
    #[inline]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    /// Create a permanent error
    #[inline]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent(message.into())
    }

    /// Check if the call may succeed when repeated
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Permanent(_))
    }

    /// Classify a failure of `operation` in the shared taxonomy
    #[must_use]
    pub fn into_autopilot(self, operation: &str) -> AutopilotError {
        match self {
            Self::Transient(message) => AutopilotError::transient(operation, message),
            Self::Permanent(message) => AutopilotError::rejected(operation, message),
            timeout @ Self::Timeout { .. } => AutopilotError::transient(operation, timeout.to_string()),
        }
    }
}

/// Intent transport errors
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// Storage I/O failed
    #[error("queue i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Envelope could not be encoded or decoded
    #[error("queue serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Intent record could not be decoded
    #[error("intent decode error: {0}")]
    Decode(#[from] IntentDecodeError),

    /// Queue operation did not complete within its bound
    #[error("queue {operation} timed out after {after_ms}ms")]
    Timeout {
        operation: &'static str,
        after_ms: u64,
    },
}

impl QueueError {
    /// Check if the operation may succeed when repeated
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Timeout { .. })
    }
}

/// Errors that can represent an elapsed call bound
pub trait TimedOut {
    /// Build the error for `operation` bounded at `after_ms`
    fn timed_out(operation: &'static str, after_ms: u64) -> Self;
}

impl TimedOut for ExternalError {
    fn timed_out(operation: &'static str, after_ms: u64) -> Self {
        Self::Timeout { operation, after_ms }
    }
}

impl TimedOut for QueueError {
    fn timed_out(operation: &'static str, after_ms: u64) -> Self {
        Self::Timeout { operation, after_ms }
    }
}
