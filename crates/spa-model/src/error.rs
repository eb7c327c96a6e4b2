//! Error taxonomy for planning and execution
//!
//! Per-intent and per-category failures fall into three classes:
//! - skips that settle an intent without buying (`CapExceeded`, `StaleIntent`)
//! - retryable collaborator failures (`TransientExternal`)
//! - failures no redelivery can fix (`InsufficientData`, `RejectedExternal`,
//!   `UnknownCategory`)
//!
//! Invalid configuration (`Configuration`) aborts the invocation before any
//! category is touched.

use crate::execution::ExecutionOutcome;
use crate::ids::{CategoryId, IdempotencyToken};

/// Main autopilot error type
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AutopilotError {
    /// Not enough usage history to plan for a category
    #[error("insufficient data for {category}: {available_days} day(s) available, {required_days} required")]
    InsufficientData {
        category: CategoryId,
        available_days: u32,
        required_days: u32,
    },

    /// Executing the intent would push coverage over the cap
    #[error("cap exceeded for {category}: projected {projected_percent:.2}% > cap {cap_percent:.2}%")]
    CapExceeded {
        category: CategoryId,
        projected_percent: f64,
        cap_percent: f64,
    },

    /// Intent outlived the review window plus grace margin
    #[error("stale intent {token}: {age_hours}h old, threshold {threshold_hours}h")]
    StaleIntent {
        token: IdempotencyToken,
        age_hours: i64,
        threshold_hours: i64,
    },

    /// Network, throttling or timeout failure in a collaborator
    #[error("transient failure in {operation}: {message}")]
    TransientExternal {
        operation: String,
        message: String,
    },

    /// Collaborator refused the request
    #[error("{operation} rejected: {message}")]
    RejectedExternal {
        operation: String,
        message: String,
    },

    /// Intent names a category the configuration no longer has
    #[error("category {0} is no longer configured")]
    UnknownCategory(CategoryId),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),
}

impl AutopilotError {
    /// Check if error may succeed on redelivery
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientExternal { .. })
    }

    /// Outcome that settles the intent without a purchase, for skip errors
    #[must_use]
    pub fn skip_outcome(&self) -> Option<ExecutionOutcome> {
        match self {
            Self::CapExceeded { projected_percent, cap_percent, .. } => Some(ExecutionOutcome::SkippedCapExceeded {
                projected_percent: *projected_percent,
                cap_percent: *cap_percent,
            }),
            Self::StaleIntent { age_hours, .. } => Some(ExecutionOutcome::SkippedStale { age_hours: *age_hours }),
            _ => None,
        }
    }

    /// Create a transient error for the named operation
    #[inline]
    pub fn transient(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TransientExternal {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a rejection for the named operation
    #[inline]
    pub fn rejected(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::RejectedExternal {
            operation: operation.into(),
            message: message.into(),
        }
    }
}

/// Configuration validation errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    /// File could not be read or parsed
    #[error("cannot parse configuration: {0}")]
    Parse(String),

    /// Unsupported configuration file extension
    #[error("unsupported configuration format: {0}")]
    UnsupportedFormat(String),

    /// Numeric field outside its allowed range
    #[error("{field} = {value} is out of range ({expected})")]
    OutOfRange {
        field: String,
        value: String,
        expected: &'static str,
    },

    /// Category id failed validation
    #[error("invalid category id '{0}'")]
    InvalidCategoryId(String),

    /// Category declared twice
    #[error("duplicate category '{0}'")]
    DuplicateCategory(String),

    /// Chosen term or payment option not in the allowed set
    #[error("{category}: {field} '{value}' is not in the allowed set")]
    NotAllowed {
        category: String,
        field: &'static str,
        value: String,
    },

    /// An allowed set is empty
    #[error("{category}: {field} must not be empty")]
    EmptyAllowedSet {
        category: String,
        field: &'static str,
    },

    /// No categories configured
    #[error("no workload categories configured")]
    NoCategories,
}

impl ConfigError {
    /// Create an out-of-range error
    #[inline]
    pub fn out_of_range(field: impl Into<String>, value: impl ToString, expected: &'static str) -> Self {
        Self::OutOfRange {
            field: field.into(),
            value: value.to_string(),
            expected,
        }
    }
}

/// Errors decoding a persisted purchase intent
#[derive(Debug, thiserror::Error)]
pub enum IntentDecodeError {
    /// Payload is not a valid intent record
    #[error("malformed intent record: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Record written by a newer, unknown schema
    #[error("unsupported intent schema version {found} (max supported {supported})")]
    UnsupportedVersion { found: u32, supported: u32 },
}
