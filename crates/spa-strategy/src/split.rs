//! Split Planner
//!
//! Converts the gap between current and target coverage into one bounded
//! hourly purchase. Each strategy only chooses the raw step; the ceilings
//! applied afterwards are shared and applied in a fixed order:
//!
//! 1. per-cycle ceiling (`max_purchase_percent` of current spend)
//! 2. cap headroom (`coverage + step <= cap`, authoritative over the target)
//! 3. purchasable granularity (floor to 0.001/hr)
//! 4. minimum plan size (below it the amount becomes zero, never rounded up)

use serde::{Deserialize, Serialize};
use spa_model::{ConfigError, CoverageSnapshot};

/// Smallest purchasable hourly increment
pub const AMOUNT_GRANULARITY: f64 = 0.001;

/// Default dichotomy fraction
pub const DEFAULT_DICHOTOMY_FRACTION: f64 = 0.5;

/// Default dichotomy step floor in percentage points
pub const DEFAULT_DICHOTOMY_MIN_STEP: f64 = 1.0;

fn default_fraction() -> f64 {
    DEFAULT_DICHOTOMY_FRACTION
}

fn default_min_step() -> f64 {
    DEFAULT_DICHOTOMY_MIN_STEP
}

/// Split strategy
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SplitStrategy {
    /// Constant-size step until the gap closes
    Linear {
        /// Step in percentage points
        step_percent: f64,
    },
    /// Fixed fraction of the remaining gap
    Dichotomy {
        /// Share of the gap closed per cycle
        #[serde(default = "default_fraction")]
        fraction: f64,
        /// Step floor in percentage points
        #[serde(default = "default_min_step")]
        min_step_percent: f64,
    },
    /// Whole gap at once
    OneShot,
}

impl SplitStrategy {
    /// Strategy name
    #[inline]
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            SplitStrategy::Linear { .. } => "linear",
            SplitStrategy::Dichotomy { .. } => "dichotomy",
            SplitStrategy::OneShot => "one_shot",
        }
    }

    /// Validate strategy parameters
    ///
    /// # Errors
    /// Returns [`ConfigError::OutOfRange`] for out-of-range parameters
    pub fn validate(&self) -> Result<(), ConfigError> {
        match *self {
            SplitStrategy::Linear { step_percent } => {
                if !(step_percent > 0.0 && step_percent <= 100.0) {
                    return Err(ConfigError::out_of_range(
                        "split.step_percent",
                        step_percent,
                        "(0, 100]",
                    ));
                }
            }
            SplitStrategy::Dichotomy { fraction, min_step_percent } => {
                if !(fraction > 0.0 && fraction <= 1.0) {
                    return Err(ConfigError::out_of_range("split.fraction", fraction, "(0, 1]"));
                }
                if !(0.0..=100.0).contains(&min_step_percent) {
                    return Err(ConfigError::out_of_range(
                        "split.min_step_percent",
                        min_step_percent,
                        "0..=100",
                    ));
                }
            }
            SplitStrategy::OneShot => {}
        }
        Ok(())
    }

    /// Raw step in percentage points for a positive `gap`, before ceilings
    #[must_use]
    pub fn raw_step(&self, gap: f64) -> f64 {
        if gap <= 0.0 {
            return 0.0;
        }
        match *self {
            SplitStrategy::Linear { step_percent } => step_percent.min(gap),
            SplitStrategy::Dichotomy { fraction, min_step_percent } => {
                (gap * fraction).max(min_step_percent).min(gap)
            }
            SplitStrategy::OneShot => gap,
        }
    }

    /// Plan this cycle's purchase
    #[must_use]
    pub fn plan(
        &self,
        snapshot: &CoverageSnapshot,
        target_percent: f64,
        limits: &SplitLimits,
    ) -> SplitPlan {
        let gap = target_percent - snapshot.coverage_percent;
        if !gap.is_finite() || gap <= 0.0 || snapshot.total_rate <= 0.0 {
            return SplitPlan::none(SplitLimit::NoGap);
        }

        let raw_step_percent = self.raw_step(gap);
        let mut amount = snapshot.percent_to_rate(raw_step_percent);
        let mut limit = None;

        let per_cycle = snapshot.percent_to_rate(limits.max_purchase_percent.max(0.0));
        if amount > per_cycle {
            amount = per_cycle;
            limit = Some(SplitLimit::MaxPurchase);
        }

        let headroom = snapshot
            .percent_to_rate(limits.cap_percent - snapshot.coverage_percent)
            .max(0.0);
        if amount > headroom {
            amount = headroom;
            limit = Some(SplitLimit::Cap);
        }

        amount = floor_to_granularity(amount);
        if amount <= 0.0 || amount < limits.min_commitment {
            return SplitPlan {
                raw_step_percent,
                step_percent: 0.0,
                amount: 0.0,
                limit: Some(match limit {
                    Some(bound) if amount <= 0.0 => bound,
                    _ => SplitLimit::BelowMinimum,
                }),
            };
        }

        SplitPlan {
            raw_step_percent,
            step_percent: snapshot.rate_to_percent(amount),
            amount,
            limit,
        }
    }
}

/// Free-function form of [`SplitStrategy::plan`]
#[inline]
#[must_use]
pub fn plan(
    strategy: &SplitStrategy,
    snapshot: &CoverageSnapshot,
    target_percent: f64,
    limits: &SplitLimits,
) -> SplitPlan {
    strategy.plan(snapshot, target_percent, limits)
}

/// Ceilings shared by every strategy
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SplitLimits {
    /// Coverage cap in percent
    pub cap_percent: f64,
    /// Per-cycle ceiling as a percentage of current spend
    pub max_purchase_percent: f64,
    /// Smallest purchasable plan (currency/hour)
    pub min_commitment: f64,
}

/// Ceiling that bound a plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitLimit {
    /// Coverage already at or above target
    NoGap,
    /// Trimmed to the per-cycle ceiling
    MaxPurchase,
    /// Trimmed to the cap headroom
    Cap,
    /// Too small to purchase
    BelowMinimum,
}

impl SplitLimit {
    /// Stable label
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            SplitLimit::NoGap => "no_gap",
            SplitLimit::MaxPurchase => "max_purchase",
            SplitLimit::Cap => "cap",
            SplitLimit::BelowMinimum => "below_minimum",
        }
    }
}

/// Result of planning one cycle
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SplitPlan {
    /// Step the strategy asked for, in percentage points
    pub raw_step_percent: f64,
    /// Step actually planned, in percentage points
    pub step_percent: f64,
    /// Hourly amount to purchase; zero means no action
    pub amount: f64,
    /// Ceiling that bound the result, if any
    pub limit: Option<SplitLimit>,
}

impl SplitPlan {
    fn none(limit: SplitLimit) -> Self {
        Self {
            raw_step_percent: 0.0,
            step_percent: 0.0,
            amount: 0.0,
            limit: Some(limit),
        }
    }

    /// Check if the plan calls for a purchase
    #[inline]
    #[must_use]
    pub fn is_actionable(&self) -> bool {
        self.amount > 0.0
    }
}

/// Floor an hourly amount to the purchasable granularity
#[inline]
#[must_use]
pub fn floor_to_granularity(amount: f64) -> f64 {
    if !amount.is_finite() || amount <= 0.0 {
        return 0.0;
    }
    // One-ulp relative nudge: representation noise like 29.999999999999996
    // lands on 30.000, a genuine shortfall below a step never rounds up
    (amount / AMOUNT_GRANULARITY * (1.0 + f64::EPSILON)).floor() * AMOUNT_GRANULARITY
}
