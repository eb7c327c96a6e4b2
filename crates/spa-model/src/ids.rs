//! Identifiers: workload categories and idempotency tokens
//!
//! [`IdempotencyToken`] is content-derived, never random: the same logical
//! intent (category, cycle, amount) always maps to the same token, which is
//! what lets the execution side collapse redeliveries into one purchase.

use crate::error::ConfigError;
use chrono::{DateTime, SecondsFormat, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

/// Domain separator for token derivation
const TOKEN_DOMAIN_SEPARATOR: &[u8] = b"spa:intent:v1\0";

static CATEGORY_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z][a-z0-9_-]{0,62}$").expect("static regex"));

/// Workload category identifier (lowercase, URL-safe)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CategoryId(String);

impl CategoryId {
    /// Parse and validate a category id
    ///
    /// # Errors
    /// Returns [`ConfigError::InvalidCategoryId`] if the id is empty or not
    /// lowercase `[a-z][a-z0-9_-]*`
    pub fn parse(value: impl Into<String>) -> Result<Self, ConfigError> {
        let value = value.into();
        if !CATEGORY_PATTERN.is_match(&value) {
            return Err(ConfigError::InvalidCategoryId(value));
        }
        Ok(Self(value))
    }

    /// Borrow as str
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for CategoryId {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<CategoryId> for String {
    fn from(value: CategoryId) -> Self {
        value.0
    }
}

impl FromStr for CategoryId {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Display for CategoryId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CategoryId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Deterministic purchase idempotency key (64 lowercase hex chars)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyToken(String);

impl IdempotencyToken {
    /// Derive the token for one logical intent
    ///
    /// `sha256(separator || category || 0x00 || cycle || 0x00 || amount)`,
    /// with the cycle in RFC 3339 seconds precision and the amount at the
    /// purchasable granularity of three decimals.
    #[must_use]
    pub fn derive(category: &CategoryId, cycle: DateTime<Utc>, hourly_commitment: f64) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(TOKEN_DOMAIN_SEPARATOR);
        hasher.update(category.as_str().as_bytes());
        hasher.update([0]);
        hasher.update(cycle.to_rfc3339_opts(SecondsFormat::Secs, true).as_bytes());
        hasher.update([0]);
        hasher.update(format!("{hourly_commitment:.3}").as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    /// Wrap an existing token string without validation
    #[inline]
    #[must_use]
    pub fn from_raw(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Borrow as str
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form for logs (first 12 chars)
    #[inline]
    #[must_use]
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}

impl Display for IdempotencyToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
