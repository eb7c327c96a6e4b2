//! Coverage Analyzer
//!
//! Pure function from raw usage figures to a [`CoverageSnapshot`].
//! Commitments expiring inside the renewal window are treated as already
//! gone, so their renewal shows up as a coverage gap instead of being masked.

use chrono::{DateTime, Utc};
use spa_model::{AutopilotError, CategoryId, CoverageSnapshot, UsageFigures};

/// Measure current coverage for one category
///
/// # Errors
/// Returns [`AutopilotError::InsufficientData`] when fewer than
/// `min_data_days` days of history are available
pub fn analyze(
    category: &CategoryId,
    usage: &UsageFigures,
    renewal_window_days: u32,
    min_data_days: u32,
    now: DateTime<Utc>,
) -> Result<CoverageSnapshot, AutopilotError> {
    let available_days = usage.data_days();
    if available_days < min_data_days {
        return Err(AutopilotError::InsufficientData {
            category: category.clone(),
            available_days,
            required_days: min_data_days,
        });
    }

    let mut committed_rate = 0.0;
    let mut expiring_rate = 0.0;
    for commitment in usage.commitments.iter().filter(|c| c.is_active(now)) {
        let rate = non_negative(commitment.hourly_commitment);
        if commitment.expires_within(now, renewal_window_days) {
            expiring_rate += rate;
        } else {
            committed_rate += rate;
        }
    }

    // Expiring commitments still back spend today; they count toward the
    // eligible total but not toward coverage.
    let total_rate = non_negative(usage.on_demand_rate) + committed_rate + expiring_rate;
    let coverage_percent = if total_rate > 0.0 {
        committed_rate / total_rate * 100.0
    } else {
        0.0
    };

    Ok(CoverageSnapshot {
        category_id: category.clone(),
        total_rate,
        committed_rate,
        expiring_rate,
        coverage_percent,
        data_days: available_days,
        volatility: coefficient_of_variation(&usage.daily_spend),
        measured_at: now,
    })
}

/// Population coefficient of variation (std-dev / mean)
///
/// Zero for empty, constant or zero-mean series.
#[must_use]
pub fn coefficient_of_variation(samples: &[f64]) -> f64 {
    let finite: Vec<f64> = samples.iter().copied().filter(|s| s.is_finite()).collect();
    if finite.is_empty() {
        return 0.0;
    }
    #[allow(clippy::cast_precision_loss)]
    let n = finite.len() as f64;
    let mean = finite.iter().sum::<f64>() / n;
    if mean <= 0.0 {
        return 0.0;
    }
    let variance = finite.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n;
    variance.sqrt() / mean
}

fn non_negative(value: f64) -> f64 {
    if value.is_finite() && value > 0.0 {
        value
    } else {
        0.0
    }
}
