//! SPA Strategy - pure planning components
//!
//! # Overview
//!
//! The three leaf stages of a planning pass:
//! - **Coverage Analyzer**: usage figures to a [`CoverageSnapshot`](spa_model::CoverageSnapshot)
//! - **Target Resolver**: snapshot plus recommendation to a target percentage
//! - **Split Planner**: gap to one bounded hourly purchase
//!
//! Nothing here performs I/O or holds state; every function is a pure
//! computation over its inputs.
//!
//! # Example
//!
//! ```rust
//! use chrono::Utc;
//! use spa_model::{CategoryId, UsageFigures};
//! use spa_strategy::{analyze, SplitLimits, SplitStrategy, TargetStrategy};
//!
//! let category = CategoryId::parse("compute").unwrap();
//! let usage = UsageFigures::new(100.0).with_daily_spend(vec![2400.0; 30]);
//! let snapshot = analyze(&category, &usage, 7, 14, Utc::now()).unwrap();
//!
//! let target = TargetStrategy::Fixed { coverage_percent: 80.0 }.resolve(&snapshot, None, 95.0);
//! let plan = SplitStrategy::Linear { step_percent: 10.0 }.plan(
//!     &snapshot,
//!     target,
//!     &SplitLimits { cap_percent: 95.0, max_purchase_percent: 25.0, min_commitment: 0.001 },
//! );
//! assert!((plan.amount - 10.0).abs() < 1e-9);
//! ```

#![warn(missing_docs)]

pub mod analyzer;
pub mod split;
pub mod target;

// Re-exports
pub use analyzer::{analyze, coefficient_of_variation};
pub use split::{floor_to_granularity, plan, SplitLimit, SplitLimits, SplitPlan, SplitStrategy, AMOUNT_GRANULARITY};
pub use target::{resolve, RiskLevel, TargetStrategy, DEFAULT_VOLATILITY_CEILING};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
