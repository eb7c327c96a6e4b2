//! Planning pass reports

use crate::phase::Phase;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use spa_model::{CategoryId, PurchaseIntent};
use spa_strategy::SplitLimit;

/// What a planning pass decided for one category
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlanningOutcome {
    /// Intent published to the review queue
    Emitted {
        /// Published intent
        intent: PurchaseIntent,
    },
    /// Intent announced only; nothing queued
    DryRun {
        /// Intent that would have been published
        intent: PurchaseIntent,
    },
    /// No purchase needed or possible this cycle
    NoAction {
        /// Coverage measured
        coverage_percent: f64,
        /// Target resolved
        target_percent: f64,
        /// Ceiling that reduced the plan to zero
        reason: SplitLimit,
    },
    /// Too little usage history
    SkippedInsufficientData {
        /// Days available
        available_days: u32,
        /// Days required
        required_days: u32,
    },
    /// Collaborator or queue failure
    Failed {
        /// Phase that failed
        phase: Phase,
        /// Error detail
        error: String,
        /// Whether a re-run may succeed
        retryable: bool,
    },
}

impl PlanningOutcome {
    /// Stable outcome label
    #[inline]
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Emitted { .. } => "emitted",
            Self::DryRun { .. } => "dry_run",
            Self::NoAction { .. } => "no_action",
            Self::SkippedInsufficientData { .. } => "skipped_insufficient_data",
            Self::Failed { .. } => "failed",
        }
    }

    /// Intent produced, published or not
    #[inline]
    #[must_use]
    pub fn intent(&self) -> Option<&PurchaseIntent> {
        match self {
            Self::Emitted { intent } | Self::DryRun { intent } => Some(intent),
            _ => None,
        }
    }
}

/// One category's planning result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryReport {
    /// Category planned
    pub category_id: CategoryId,
    /// Decision
    pub outcome: PlanningOutcome,
    /// Phases traversed
    pub phases: Vec<Phase>,
}

/// Results of one planning pass across all categories
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanningReport {
    /// Pass start time
    pub started_at: DateTime<Utc>,
    /// Pass end time
    pub finished_at: DateTime<Utc>,
    /// Whether the pass ran in dry-run mode
    pub dry_run: bool,
    /// Per-category results in configuration order
    pub categories: Vec<CategoryReport>,
}

impl PlanningReport {
    /// Result for one category
    #[must_use]
    pub fn for_category(&self, id: &CategoryId) -> Option<&CategoryReport> {
        self.categories.iter().find(|c| &c.category_id == id)
    }

    /// Intents published to the queue
    pub fn emitted(&self) -> impl Iterator<Item = &PurchaseIntent> + '_ {
        self.categories.iter().filter_map(|c| match &c.outcome {
            PlanningOutcome::Emitted { intent } => Some(intent),
            _ => None,
        })
    }

    /// Number of categories with the given outcome label
    #[must_use]
    pub fn count(&self, label: &str) -> usize {
        self.categories.iter().filter(|c| c.outcome.label() == label).count()
    }

    /// Check if any category failed
    #[inline]
    #[must_use]
    pub fn has_failures(&self) -> bool {
        self.count("failed") > 0
    }
}
