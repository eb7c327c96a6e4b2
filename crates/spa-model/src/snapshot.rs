//! Usage figures and coverage snapshots

use crate::commitment::Commitment;
use crate::ids::CategoryId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Raw figures returned by the usage/commitment query
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UsageFigures {
    /// Uncovered on-demand spend (currency/hour)
    pub on_demand_rate: f64,
    /// Commitments currently applying to the category
    #[serde(default)]
    pub commitments: Vec<Commitment>,
    /// One spend sample per day of available history, oldest first
    #[serde(default)]
    pub daily_spend: Vec<f64>,
}

impl UsageFigures {
    /// Create figures with no commitments or history
    #[inline]
    #[must_use]
    pub fn new(on_demand_rate: f64) -> Self {
        Self {
            on_demand_rate,
            ..Self::default()
        }
    }

    /// With commitments
    #[inline]
    #[must_use]
    pub fn with_commitments(mut self, commitments: Vec<Commitment>) -> Self {
        self.commitments = commitments;
        self
    }

    /// With daily spend history
    #[inline]
    #[must_use]
    pub fn with_daily_spend(mut self, daily_spend: Vec<f64>) -> Self {
        self.daily_spend = daily_spend;
        self
    }

    /// Days of history available
    #[inline]
    #[must_use]
    pub fn data_days(&self) -> u32 {
        u32::try_from(self.daily_spend.len()).unwrap_or(u32::MAX)
    }
}

/// Point-in-time coverage measurement for one category
///
/// Created fresh each pass and never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageSnapshot {
    /// Category measured
    pub category_id: CategoryId,
    /// Total eligible on-demand-equivalent spend (currency/hour)
    pub total_rate: f64,
    /// Committed spend counted toward coverage (currency/hour)
    pub committed_rate: f64,
    /// Committed spend excluded because it renews soon (currency/hour)
    pub expiring_rate: f64,
    /// `committed_rate / total_rate` as a percentage
    pub coverage_percent: f64,
    /// Days of history behind the measurement
    pub data_days: u32,
    /// Coefficient of variation of daily spend
    pub volatility: f64,
    /// Measurement time
    pub measured_at: DateTime<Utc>,
}

impl CoverageSnapshot {
    /// Convert a coverage percentage into an hourly amount at current spend
    #[inline]
    #[must_use]
    pub fn percent_to_rate(&self, percent: f64) -> f64 {
        self.total_rate * percent / 100.0
    }

    /// Convert an hourly amount into percentage points of current spend
    ///
    /// With no eligible spend, any positive amount is unbounded coverage.
    #[inline]
    #[must_use]
    pub fn rate_to_percent(&self, rate: f64) -> f64 {
        if self.total_rate <= 0.0 {
            return if rate > 0.0 { f64::INFINITY } else { 0.0 };
        }
        rate / self.total_rate * 100.0
    }

    /// Coverage after adding `hourly_commitment`
    #[inline]
    #[must_use]
    pub fn projected_percent(&self, hourly_commitment: f64) -> f64 {
        self.coverage_percent + self.rate_to_percent(hourly_commitment)
    }
}
