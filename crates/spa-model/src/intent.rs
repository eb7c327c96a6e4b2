//! Purchase intents: the record that crosses the review window
//!
//! The serialized form is a flat JSON object tagged with `schema_version`.
//! It must stay readable across process restarts for as long as a review
//! window lasts, so fields are only ever added, never renamed.

use crate::commitment::{PaymentOption, Term};
use crate::error::IntentDecodeError;
use crate::ids::{CategoryId, IdempotencyToken};
use crate::snapshot::CoverageSnapshot;
use chrono::{DateTime, Duration, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

/// Current intent wire schema version
pub const INTENT_SCHEMA_VERSION: u32 = 1;

/// Start of the planning cycle containing `now` (UTC midnight)
#[inline]
#[must_use]
pub fn cycle_start(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive().and_time(NaiveTime::MIN).and_utc()
}

/// A planned commitment purchase awaiting review and execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurchaseIntent {
    /// Wire schema version
    pub schema_version: u32,
    /// Deterministic key for exactly-effectively-once execution
    pub idempotency_token: IdempotencyToken,
    /// Category the purchase applies to
    pub category_id: CategoryId,
    /// Planning cycle the intent belongs to
    pub cycle: DateTime<Utc>,
    /// Commitment to buy (currency/hour)
    pub hourly_commitment: f64,
    /// Commitment term
    pub term: Term,
    /// Payment option
    pub payment_option: PaymentOption,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Coverage measured when planned
    pub coverage_at_creation: f64,
    /// Target resolved when planned
    pub target_percent: f64,
    /// Cap in force when planned
    pub cap_percent: f64,
}

impl PurchaseIntent {
    /// Build an intent from a planning decision
    ///
    /// The token is derived from the category, the cycle containing `now`
    /// and the amount, so a re-triggered pass re-derives the same token.
    #[must_use]
    pub fn new(
        snapshot: &CoverageSnapshot,
        hourly_commitment: f64,
        term: Term,
        payment_option: PaymentOption,
        target_percent: f64,
        cap_percent: f64,
        now: DateTime<Utc>,
    ) -> Self {
        let cycle = cycle_start(now);
        Self {
            schema_version: INTENT_SCHEMA_VERSION,
            idempotency_token: IdempotencyToken::derive(&snapshot.category_id, cycle, hourly_commitment),
            category_id: snapshot.category_id.clone(),
            cycle,
            hourly_commitment,
            term,
            payment_option,
            created_at: now,
            coverage_at_creation: snapshot.coverage_percent,
            target_percent,
            cap_percent,
        }
    }

    /// Age of the intent at `now`
    #[inline]
    #[must_use]
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.created_at
    }

    /// Check if the intent is older than `threshold`
    #[inline]
    #[must_use]
    pub fn is_stale(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        self.age(now) > threshold
    }

    /// Serialize to the wire format
    ///
    /// # Errors
    /// Returns error if serialization fails
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decode from the wire format, rejecting unknown future versions
    ///
    /// # Errors
    /// Returns [`IntentDecodeError`] on malformed input or unsupported version
    pub fn from_json(bytes: &[u8]) -> Result<Self, IntentDecodeError> {
        #[derive(Deserialize)]
        struct VersionProbe {
            schema_version: u32,
        }

        let probe: VersionProbe = serde_json::from_slice(bytes)?;
        if probe.schema_version > INTENT_SCHEMA_VERSION || probe.schema_version == 0 {
            return Err(IntentDecodeError::UnsupportedVersion {
                found: probe.schema_version,
                supported: INTENT_SCHEMA_VERSION,
            });
        }
        Ok(serde_json::from_slice(bytes)?)
    }
}
