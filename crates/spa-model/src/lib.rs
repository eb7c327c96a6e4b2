//! SPA Model - shared domain types
//!
//! Types that flow between the planning and execution halves of the
//! autopilot:
//! - Workload category ids and deterministic idempotency tokens
//! - Existing commitments, usage figures and coverage snapshots
//! - The versioned [`PurchaseIntent`] wire record
//! - Execution outcomes and drain summaries
//! - The error taxonomy shared by every crate
//!
//! Every value here is scoped to exactly one category; nothing in this crate
//! aggregates across categories except [`DrainSummary`].

#![warn(unreachable_pub)]

pub mod commitment;
pub mod error;
pub mod execution;
pub mod ids;
pub mod intent;
pub mod snapshot;

// Re-exports for convenience
pub use commitment::{Commitment, PaymentOption, Term};
pub use error::{AutopilotError, ConfigError, IntentDecodeError};
pub use execution::{DrainSummary, ExecutionOutcome, ExecutionResult, OutcomeCounts};
pub use ids::{CategoryId, IdempotencyToken};
pub use intent::{cycle_start, PurchaseIntent, INTENT_SCHEMA_VERSION};
pub use snapshot::{CoverageSnapshot, UsageFigures};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
