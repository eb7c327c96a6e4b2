//! Execution outcomes and drain summaries

use crate::ids::{CategoryId, IdempotencyToken};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What happened to one intent during a drain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    /// Commitment purchased (or a prior purchase for the same token replayed)
    Purchased {
        /// Provider plan identifier
        plan_id: String,
        /// True when the token had already been executed
        replayed: bool,
    },
    /// Fresh coverage plus the amount would breach the current cap
    SkippedCapExceeded {
        /// Coverage the purchase would produce
        projected_percent: f64,
        /// Cap in force at execution time
        cap_percent: f64,
    },
    /// Intent outlived the staleness threshold
    SkippedStale {
        /// Intent age at execution time
        age_hours: i64,
    },
    /// Execution did not succeed
    Failed {
        /// Error detail
        error: String,
        /// Whether the failure may clear on redelivery
        retryable: bool,
        /// Whether the intent was moved to the dead-letter path
        dead_lettered: bool,
    },
}

impl ExecutionOutcome {
    /// Stable outcome label
    #[inline]
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Purchased { .. } => "purchased",
            Self::SkippedCapExceeded { .. } => "skipped-cap-exceeded",
            Self::SkippedStale { .. } => "skipped-stale",
            Self::Failed { .. } => "failed",
        }
    }

    /// Check if the intent is settled and must leave the queue
    #[inline]
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::Failed { retryable, dead_lettered, .. } => !retryable || *dead_lettered,
            _ => true,
        }
    }
}

/// Outcome of attempting to realize one intent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Intent reference
    pub idempotency_token: IdempotencyToken,
    /// Category of the intent
    pub category_id: CategoryId,
    /// Hourly commitment requested
    pub hourly_commitment: f64,
    /// Outcome
    pub outcome: ExecutionOutcome,
}

/// Outcome counts per kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeCounts {
    /// Purchased or replayed
    pub purchased: usize,
    /// Skipped on cap re-validation
    pub skipped_cap_exceeded: usize,
    /// Skipped as stale
    pub skipped_stale: usize,
    /// Failed, retryable or not
    pub failed: usize,
}

/// Aggregated results of one drain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrainSummary {
    /// Drain start time
    pub started_at: DateTime<Utc>,
    /// Drain end time
    pub finished_at: DateTime<Utc>,
    /// Per-intent results in completion order
    pub results: Vec<ExecutionResult>,
    /// Messages that could not be decoded and were dead-lettered
    #[serde(default)]
    pub undecodable: usize,
    /// Set when the drain stopped early because the queue failed
    #[serde(default)]
    pub interrupted: Option<String>,
}

impl DrainSummary {
    /// Create empty summary
    #[inline]
    #[must_use]
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            finished_at: started_at,
            results: Vec::new(),
            undecodable: 0,
            interrupted: None,
        }
    }

    /// Count outcomes by kind
    #[must_use]
    pub fn counts(&self) -> OutcomeCounts {
        let mut counts = OutcomeCounts::default();
        for result in &self.results {
            match result.outcome {
                ExecutionOutcome::Purchased { .. } => counts.purchased += 1,
                ExecutionOutcome::SkippedCapExceeded { .. } => counts.skipped_cap_exceeded += 1,
                ExecutionOutcome::SkippedStale { .. } => counts.skipped_stale += 1,
                ExecutionOutcome::Failed { .. } => counts.failed += 1,
            }
        }
        counts
    }

    /// Total hourly commitment newly purchased (replays excluded)
    #[must_use]
    pub fn purchased_rate(&self) -> f64 {
        self.results
            .iter()
            .filter(|r| matches!(r.outcome, ExecutionOutcome::Purchased { replayed: false, .. }))
            .map(|r| r.hourly_commitment)
            .sum()
    }

    /// Check if every message was settled or left for redelivery cleanly
    #[inline]
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.interrupted.is_none() && self.undecodable == 0
    }

    /// Results for one token
    pub fn for_token<'a>(
        &'a self,
        token: &'a IdempotencyToken,
    ) -> impl Iterator<Item = &'a ExecutionResult> + 'a {
        self.results.iter().filter(move |r| &r.idempotency_token == token)
    }
}
