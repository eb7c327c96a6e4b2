//! SPA Core - planning and execution
//!
//! # Overview
//!
//! Two independently triggered halves joined by a durable review queue:
//! - **[`PlanningOrchestrator`]**: measures, resolves and sizes one purchase
//!   per category and queues it as a [`PurchaseIntent`](spa_model::PurchaseIntent)
//! - **[`ExecutionCoordinator`]**: drains the queue after the review window,
//!   re-validates each intent against fresh numbers and buys it through the
//!   idempotent [`PurchaseLedger`]
//!
//! Everything outside the core (usage data, recommendations, the purchase
//! API, notifications) is reached through the traits in [`collaborators`],
//! and every such call is bounded by the configured timeout.

#![warn(missing_docs)]

pub mod collaborators;
pub mod config;
pub mod error;
pub mod executor;
pub mod ledger;
pub mod lockfile;
pub mod orchestrator;
pub mod phase;
pub mod queue;
pub mod report;
pub mod timeout;

// Re-exports
pub use collaborators::{
    notify_best_effort, LogNotifier, Notification, NotificationSink, PurchaseApi, PurchaseReceipt,
    PurchaseRequest, RecommendationSource, UsageSource,
};
pub use config::{AutopilotConfig, CategoryPolicy, PolicyOverrides, WorkloadCategory};
pub use error::{ExternalError, QueueError};
pub use executor::{ExecutionCoordinator, RECEIVE_BATCH_SIZE};
pub use ledger::{LedgerReceipt, PurchaseLedger};
pub use lockfile::LockFile;
pub use orchestrator::PlanningOrchestrator;
pub use phase::{InvalidTransition, Phase, PhaseTrace};
pub use queue::{DeadLetter, Delivery, FileQueue, InMemoryQueue, IntentQueue, QueuedIntent, ReceiptHandle};
pub use report::{CategoryReport, PlanningOutcome, PlanningReport};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for wiring a pipeline
    pub use crate::{
        AutopilotConfig, ExecutionCoordinator, IntentQueue, NotificationSink, PlanningOrchestrator,
        PurchaseApi, PurchaseLedger, RecommendationSource, UsageSource,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
