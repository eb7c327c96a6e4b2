//! Commitment terms, payment options and existing commitments

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// Commitment term length
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Term {
    /// One year
    OneYear,
    /// Three years
    ThreeYear,
}

impl Term {
    /// Term length in days
    #[inline]
    #[must_use]
    pub fn days(&self) -> i64 {
        match self {
            Term::OneYear => 365,
            Term::ThreeYear => 3 * 365,
        }
    }

    /// Stable wire name
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Term::OneYear => "one_year",
            Term::ThreeYear => "three_year",
        }
    }
}

impl Display for Term {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payment option for a commitment
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentOption {
    /// Billed monthly
    NoUpfront,
    /// Part upfront, rest monthly
    PartialUpfront,
    /// Paid in full upfront
    AllUpfront,
}

impl PaymentOption {
    /// Stable wire name
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentOption::NoUpfront => "no_upfront",
            PaymentOption::PartialUpfront => "partial_upfront",
            PaymentOption::AllUpfront => "all_upfront",
        }
    }
}

impl Display for PaymentOption {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An existing commitment reported by the usage source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commitment {
    /// Provider plan identifier
    pub plan_id: String,
    /// Committed spend (currency/hour)
    pub hourly_commitment: f64,
    /// When the commitment stops applying
    pub expires_at: DateTime<Utc>,
}

impl Commitment {
    /// Create new commitment
    #[inline]
    #[must_use]
    pub fn new(plan_id: impl Into<String>, hourly_commitment: f64, expires_at: DateTime<Utc>) -> Self {
        Self {
            plan_id: plan_id.into(),
            hourly_commitment,
            expires_at,
        }
    }

    /// Check if commitment still applies at `now`
    #[inline]
    #[must_use]
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }

    /// Check if commitment expires within `window_days` of `now`
    #[inline]
    #[must_use]
    pub fn expires_within(&self, now: DateTime<Utc>, window_days: u32) -> bool {
        self.expires_at <= now + Duration::days(i64::from(window_days))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn term_serde_names() {
        assert_eq!(serde_json::to_string(&Term::OneYear).unwrap(), "\"one_year\"");
        let parsed: Term = serde_json::from_str("\"three_year\"").unwrap();
        assert_eq!(parsed, Term::ThreeYear);
        assert!(serde_json::from_str::<Term>("\"five_year\"").is_err());
    }

    #[test]
    fn payment_option_display_matches_serde() {
        for option in [
            PaymentOption::NoUpfront,
            PaymentOption::PartialUpfront,
            PaymentOption::AllUpfront,
        ] {
            let json = serde_json::to_string(&option).unwrap();
            assert_eq!(json, format!("\"{option}\""));
        }
    }

    #[test]
    fn commitment_expiry_window() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let soon = Commitment::new("sp-1", 1.0, now + Duration::days(3));
        let later = Commitment::new("sp-2", 1.0, now + Duration::days(30));

        assert!(soon.is_active(now));
        assert!(soon.expires_within(now, 7));
        assert!(!later.expires_within(now, 7));
        assert!(!soon.expires_within(now, 2));
    }
}
