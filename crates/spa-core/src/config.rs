//! Autopilot configuration
//!
//! One immutable value, loaded from TOML or YAML and validated before any
//! component sees it. Validation is all-or-nothing: a single violation
//! rejects the whole file.

use serde::{Deserialize, Serialize};
use spa_model::{CategoryId, ConfigError, PaymentOption, Term};
use spa_strategy::{RiskLevel, SplitLimits, SplitStrategy, TargetStrategy, DEFAULT_VOLATILITY_CEILING};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

mod defaults {
    use super::{PaymentOption, Term};

    pub(super) fn dry_run() -> bool {
        true
    }
    pub(super) fn lookback_days() -> u32 {
        30
    }
    pub(super) fn min_data_days() -> u32 {
        14
    }
    pub(super) fn renewal_window_days() -> u32 {
        7
    }
    pub(super) fn review_window_days() -> u32 {
        3
    }
    pub(super) fn stale_grace_days() -> u32 {
        2
    }
    pub(super) fn max_receive_count() -> u32 {
        3
    }
    pub(super) fn external_call_timeout_secs() -> u64 {
        30
    }
    pub(super) fn execution_concurrency() -> usize {
        4
    }
    pub(super) fn max_coverage_cap() -> f64 {
        95.0
    }
    pub(super) fn max_purchase_percent() -> f64 {
        10.0
    }
    pub(super) fn min_commitment_per_plan() -> f64 {
        0.001
    }
    pub(super) fn allowed_terms() -> Vec<Term> {
        vec![Term::OneYear, Term::ThreeYear]
    }
    pub(super) fn allowed_payment_options() -> Vec<PaymentOption> {
        vec![
            PaymentOption::NoUpfront,
            PaymentOption::PartialUpfront,
            PaymentOption::AllUpfront,
        ]
    }
    pub(super) fn term() -> Term {
        Term::OneYear
    }
    pub(super) fn payment_option() -> PaymentOption {
        PaymentOption::NoUpfront
    }
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AutopilotConfig {
    /// Notify instead of queueing; on unless explicitly disabled
    #[serde(default = "defaults::dry_run")]
    pub dry_run: bool,
    /// Days of usage history requested from the usage source
    #[serde(default = "defaults::lookback_days")]
    pub lookback_days: u32,
    /// Minimum days of history required to plan a category
    #[serde(default = "defaults::min_data_days")]
    pub min_data_days: u32,
    /// Commitments expiring within this many days count as expired
    #[serde(default = "defaults::renewal_window_days")]
    pub renewal_window_days: u32,
    /// Delay between planning and execution
    #[serde(default = "defaults::review_window_days")]
    pub review_window_days: u32,
    /// Extra days an intent may wait past the review window
    #[serde(default = "defaults::stale_grace_days")]
    pub stale_grace_days: u32,
    /// Deliveries before a transiently failing intent is dead-lettered
    #[serde(default = "defaults::max_receive_count")]
    pub max_receive_count: u32,
    /// Bound applied to every external call
    #[serde(default = "defaults::external_call_timeout_secs")]
    pub external_call_timeout_secs: u64,
    /// Categories drained in parallel
    #[serde(default = "defaults::execution_concurrency")]
    pub execution_concurrency: usize,
    /// Policy applied to every category unless overridden
    #[serde(default)]
    pub defaults: CategoryPolicy,
    /// Workload categories
    #[serde(default)]
    pub categories: Vec<WorkloadCategory>,
}

/// Strategy and limit settings for one category
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CategoryPolicy {
    /// Target strategy
    #[serde(default = "CategoryPolicy::default_target")]
    pub target: TargetStrategy,
    /// Split strategy
    #[serde(default = "CategoryPolicy::default_split")]
    pub split: SplitStrategy,
    /// Hard coverage ceiling in percent
    #[serde(default = "defaults::max_coverage_cap")]
    pub max_coverage_cap: f64,
    /// Per-cycle purchase ceiling as a percentage of current spend
    #[serde(default = "defaults::max_purchase_percent")]
    pub max_purchase_percent: f64,
    /// Smallest plan worth buying (currency/hour)
    #[serde(default = "defaults::min_commitment_per_plan")]
    pub min_commitment_per_plan: f64,
}

impl CategoryPolicy {
    fn default_target() -> TargetStrategy {
        TargetStrategy::Dynamic {
            risk_level: RiskLevel::Balanced,
            volatility_ceiling: DEFAULT_VOLATILITY_CEILING,
        }
    }

    fn default_split() -> SplitStrategy {
        SplitStrategy::Linear { step_percent: 10.0 }
    }

    /// Ceilings handed to the split planner
    #[inline]
    #[must_use]
    pub fn split_limits(&self) -> SplitLimits {
        SplitLimits {
            cap_percent: self.max_coverage_cap,
            max_purchase_percent: self.max_purchase_percent,
            min_commitment: self.min_commitment_per_plan,
        }
    }

    /// Validate strategies and limits
    ///
    /// # Errors
    /// Returns the first violation found
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.target.validate()?;
        self.split.validate()?;
        if !(0.0..=100.0).contains(&self.max_coverage_cap) {
            return Err(ConfigError::out_of_range(
                "max_coverage_cap",
                self.max_coverage_cap,
                "0..=100",
            ));
        }
        if !(self.max_purchase_percent > 0.0 && self.max_purchase_percent <= 100.0) {
            return Err(ConfigError::out_of_range(
                "max_purchase_percent",
                self.max_purchase_percent,
                "(0, 100]",
            ));
        }
        if !(self.min_commitment_per_plan.is_finite() && self.min_commitment_per_plan >= 0.0) {
            return Err(ConfigError::out_of_range(
                "min_commitment_per_plan",
                self.min_commitment_per_plan,
                ">= 0",
            ));
        }
        Ok(())
    }
}

impl Default for CategoryPolicy {
    fn default() -> Self {
        Self {
            target: Self::default_target(),
            split: Self::default_split(),
            max_coverage_cap: defaults::max_coverage_cap(),
            max_purchase_percent: defaults::max_purchase_percent(),
            min_commitment_per_plan: defaults::min_commitment_per_plan(),
        }
    }
}

/// Per-category replacements for default policy fields
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyOverrides {
    /// Target strategy
    pub target: Option<TargetStrategy>,
    /// Split strategy
    pub split: Option<SplitStrategy>,
    /// Coverage cap
    pub max_coverage_cap: Option<f64>,
    /// Per-cycle ceiling
    pub max_purchase_percent: Option<f64>,
    /// Minimum plan size
    pub min_commitment_per_plan: Option<f64>,
}

/// An independent coverage domain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkloadCategory {
    /// Category id
    pub id: CategoryId,
    /// Terms this category may buy
    #[serde(default = "defaults::allowed_terms")]
    pub allowed_terms: Vec<Term>,
    /// Payment options this category may use
    #[serde(default = "defaults::allowed_payment_options")]
    pub allowed_payment_options: Vec<PaymentOption>,
    /// Term used for purchases
    #[serde(default = "defaults::term")]
    pub term: Term,
    /// Payment option used for purchases
    #[serde(default = "defaults::payment_option")]
    pub payment_option: PaymentOption,
    /// Policy overrides
    #[serde(default)]
    pub overrides: PolicyOverrides,
}

impl WorkloadCategory {
    /// Create a category with default term settings and no overrides
    #[must_use]
    pub fn new(id: CategoryId) -> Self {
        Self {
            id,
            allowed_terms: defaults::allowed_terms(),
            allowed_payment_options: defaults::allowed_payment_options(),
            term: defaults::term(),
            payment_option: defaults::payment_option(),
            overrides: PolicyOverrides::default(),
        }
    }

    /// With overrides
    #[inline]
    #[must_use]
    pub fn with_overrides(mut self, overrides: PolicyOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    /// With term and payment option
    #[inline]
    #[must_use]
    pub fn with_terms(mut self, term: Term, payment_option: PaymentOption) -> Self {
        self.term = term;
        self.payment_option = payment_option;
        self
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let category = self.id.to_string();
        if self.allowed_terms.is_empty() {
            return Err(ConfigError::EmptyAllowedSet { category, field: "allowed_terms" });
        }
        if self.allowed_payment_options.is_empty() {
            return Err(ConfigError::EmptyAllowedSet {
                category,
                field: "allowed_payment_options",
            });
        }
        if !self.allowed_terms.contains(&self.term) {
            return Err(ConfigError::NotAllowed {
                category,
                field: "term",
                value: self.term.to_string(),
            });
        }
        if !self.allowed_payment_options.contains(&self.payment_option) {
            return Err(ConfigError::NotAllowed {
                category,
                field: "payment_option",
                value: self.payment_option.to_string(),
            });
        }
        Ok(())
    }
}

impl AutopilotConfig {
    /// Create a validated-shape configuration with defaults for `categories`
    #[must_use]
    pub fn new(categories: Vec<WorkloadCategory>) -> Self {
        Self {
            dry_run: defaults::dry_run(),
            lookback_days: defaults::lookback_days(),
            min_data_days: defaults::min_data_days(),
            renewal_window_days: defaults::renewal_window_days(),
            review_window_days: defaults::review_window_days(),
            stale_grace_days: defaults::stale_grace_days(),
            max_receive_count: defaults::max_receive_count(),
            external_call_timeout_secs: defaults::external_call_timeout_secs(),
            execution_concurrency: defaults::execution_concurrency(),
            defaults: CategoryPolicy::default(),
            categories,
        }
    }

    /// With dry-run flag
    #[inline]
    #[must_use]
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// With default policy
    #[inline]
    #[must_use]
    pub fn with_defaults(mut self, defaults: CategoryPolicy) -> Self {
        self.defaults = defaults;
        self
    }

    /// Load and validate a configuration file, format chosen by extension
    ///
    /// # Errors
    /// Returns [`ConfigError`] if the file cannot be read, parsed or validated
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Parse(format!("{}: {e}", path.display())))?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml_str(&raw),
            Some("yaml" | "yml") => Self::from_yaml_str(&raw),
            other => Err(ConfigError::UnsupportedFormat(
                other.unwrap_or("<none>").to_string(),
            )),
        }
    }

    /// Parse and validate TOML
    ///
    /// # Errors
    /// Returns [`ConfigError`] on parse or validation failure
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate YAML
    ///
    /// # Errors
    /// Returns [`ConfigError`] on parse or validation failure
    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_yaml::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every field and every category's effective policy
    ///
    /// # Errors
    /// Returns the first violation found
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.categories.is_empty() {
            return Err(ConfigError::NoCategories);
        }
        if self.min_data_days == 0 {
            return Err(ConfigError::out_of_range("min_data_days", self.min_data_days, ">= 1"));
        }
        if self.min_data_days > self.lookback_days {
            return Err(ConfigError::out_of_range(
                "min_data_days",
                self.min_data_days,
                "<= lookback_days",
            ));
        }
        if self.max_receive_count == 0 {
            return Err(ConfigError::out_of_range(
                "max_receive_count",
                self.max_receive_count,
                ">= 1",
            ));
        }
        if self.external_call_timeout_secs == 0 {
            return Err(ConfigError::out_of_range(
                "external_call_timeout_secs",
                self.external_call_timeout_secs,
                ">= 1",
            ));
        }
        if self.execution_concurrency == 0 {
            return Err(ConfigError::out_of_range(
                "execution_concurrency",
                self.execution_concurrency,
                ">= 1",
            ));
        }
        self.defaults.validate()?;

        let mut seen = HashSet::with_capacity(self.categories.len());
        for category in &self.categories {
            if !seen.insert(&category.id) {
                return Err(ConfigError::DuplicateCategory(category.id.to_string()));
            }
            category.validate()?;
            self.policy_for(category).validate()?;
        }
        Ok(())
    }

    /// Effective policy for a category: defaults with its overrides applied
    #[must_use]
    pub fn policy_for(&self, category: &WorkloadCategory) -> CategoryPolicy {
        let overrides = &category.overrides;
        CategoryPolicy {
            target: overrides.target.unwrap_or(self.defaults.target),
            split: overrides.split.unwrap_or(self.defaults.split),
            max_coverage_cap: overrides.max_coverage_cap.unwrap_or(self.defaults.max_coverage_cap),
            max_purchase_percent: overrides
                .max_purchase_percent
                .unwrap_or(self.defaults.max_purchase_percent),
            min_commitment_per_plan: overrides
                .min_commitment_per_plan
                .unwrap_or(self.defaults.min_commitment_per_plan),
        }
    }

    /// Look up a category by id
    #[must_use]
    pub fn category(&self, id: &CategoryId) -> Option<&WorkloadCategory> {
        self.categories.iter().find(|c| &c.id == id)
    }

    /// Age past which an intent is skipped as stale
    #[inline]
    #[must_use]
    pub fn staleness_threshold(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.review_window_days) + i64::from(self.stale_grace_days))
    }

    /// Bound applied to every external call
    #[inline]
    #[must_use]
    pub fn external_call_timeout(&self) -> Duration {
        Duration::from_secs(self.external_call_timeout_secs)
    }
}
