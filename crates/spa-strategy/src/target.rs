//! Target Resolver
//!
//! Closed set of target strategies selected by configuration:
//! - `fixed`: a configured constant
//! - `dynamic`: a risk-level band, pulled toward its low end as daily spend
//!   becomes more volatile
//! - `aws`: the provider's recommended coverage, clamped to the cap

use serde::{Deserialize, Serialize};
use spa_model::{ConfigError, CoverageSnapshot};

/// Default coefficient of variation at which a dynamic target bottoms out
pub const DEFAULT_VOLATILITY_CEILING: f64 = 0.5;

fn default_volatility_ceiling() -> f64 {
    DEFAULT_VOLATILITY_CEILING
}

/// Appetite for committing against spend that may not recur
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    /// Band 50-70%
    Conservative,
    /// Band 60-80%
    Balanced,
    /// Band 70-90%
    Aggressive,
}

impl RiskLevel {
    /// Coverage band `(low, high)` in percent
    #[inline]
    #[must_use]
    pub fn band(&self) -> (f64, f64) {
        match self {
            RiskLevel::Conservative => (50.0, 70.0),
            RiskLevel::Balanced => (60.0, 80.0),
            RiskLevel::Aggressive => (70.0, 90.0),
        }
    }
}

/// Target coverage strategy
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TargetStrategy {
    /// Constant target
    Fixed {
        /// Target coverage in percent
        coverage_percent: f64,
    },
    /// Risk band modulated by spend volatility
    Dynamic {
        /// Selected band
        risk_level: RiskLevel,
        /// Volatility at which the target reaches the band's low end
        #[serde(default = "default_volatility_ceiling")]
        volatility_ceiling: f64,
    },
    /// Provider recommendation
    Aws,
}

impl TargetStrategy {
    /// Strategy name
    #[inline]
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            TargetStrategy::Fixed { .. } => "fixed",
            TargetStrategy::Dynamic { .. } => "dynamic",
            TargetStrategy::Aws => "aws",
        }
    }

    /// Whether the strategy consumes a provider recommendation
    #[inline]
    #[must_use]
    pub fn needs_recommendation(&self) -> bool {
        matches!(self, TargetStrategy::Aws)
    }

    /// Validate strategy parameters
    ///
    /// # Errors
    /// Returns [`ConfigError::OutOfRange`] for out-of-range parameters
    pub fn validate(&self) -> Result<(), ConfigError> {
        match *self {
            TargetStrategy::Fixed { coverage_percent } => {
                if !(0.0..=100.0).contains(&coverage_percent) {
                    return Err(ConfigError::out_of_range(
                        "target.coverage_percent",
                        coverage_percent,
                        "0..=100",
                    ));
                }
            }
            TargetStrategy::Dynamic { volatility_ceiling, .. } => {
                if !(volatility_ceiling.is_finite() && volatility_ceiling > 0.0) {
                    return Err(ConfigError::out_of_range(
                        "target.volatility_ceiling",
                        volatility_ceiling,
                        "> 0",
                    ));
                }
            }
            TargetStrategy::Aws => {}
        }
        Ok(())
    }

    /// Resolve the desired coverage for this cycle
    ///
    /// Always returns a value in `[0, 100]`. An `aws` strategy with no usable
    /// recommendation resolves to the current coverage, i.e. no purchase.
    #[must_use]
    pub fn resolve(
        &self,
        snapshot: &CoverageSnapshot,
        recommendation: Option<f64>,
        cap_percent: f64,
    ) -> f64 {
        let target = match *self {
            TargetStrategy::Fixed { coverage_percent } => coverage_percent,
            TargetStrategy::Dynamic { risk_level, volatility_ceiling } => {
                dynamic_target(risk_level, snapshot.volatility, volatility_ceiling)
            }
            TargetStrategy::Aws => match recommendation.filter(|r| r.is_finite()) {
                Some(recommended) => recommended.clamp(0.0, cap_percent.clamp(0.0, 100.0)),
                None => snapshot.coverage_percent,
            },
        };
        if target.is_finite() {
            target.clamp(0.0, 100.0)
        } else {
            0.0
        }
    }
}

/// Free-function form of [`TargetStrategy::resolve`]
#[inline]
#[must_use]
pub fn resolve(
    strategy: &TargetStrategy,
    snapshot: &CoverageSnapshot,
    recommendation: Option<f64>,
    cap_percent: f64,
) -> f64 {
    strategy.resolve(snapshot, recommendation, cap_percent)
}

/// `high - (high - low) * min(volatility / ceiling, 1)`
fn dynamic_target(risk_level: RiskLevel, volatility: f64, ceiling: f64) -> f64 {
    let (low, high) = risk_level.band();
    if !volatility.is_finite() || ceiling <= 0.0 {
        return low;
    }
    let pressure = (volatility.max(0.0) / ceiling).min(1.0);
    high - (high - low) * pressure
}
