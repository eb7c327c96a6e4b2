//! Local sandbox backend
//!
//! Stands in for the provider APIs when running the `spa` binary:
//! - a JSON [`Fixture`] supplies usage, commitments and recommendations
//! - a JSON [`FileLedger`] records purchases keyed by idempotency token
//!
//! Purchases recorded in the ledger are read back as commitments, so
//! repeated `plan` / `execute` runs move coverage the way real purchases do.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use spa_core::{
    ExternalError, LockFile, PurchaseApi, PurchaseReceipt, PurchaseRequest, RecommendationSource, UsageSource,
};
use spa_model::{CategoryId, Commitment, IdempotencyToken, PaymentOption, Term, UsageFigures};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Sandbox file errors
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// File could not be read or written
    #[error("sandbox i/o error on {}: {source}", path.display())]
    Io {
        /// File involved
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// File content is not valid JSON for its kind
    #[error("malformed sandbox file {}: {source}", path.display())]
    Malformed {
        /// File involved
        path: PathBuf,
        /// Underlying error
        #[source]
        source: serde_json::Error,
    },
}

impl SandboxError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io { path: path.to_path_buf(), source }
    }

    fn malformed(path: &Path, source: serde_json::Error) -> Self {
        Self::Malformed { path: path.to_path_buf(), source }
    }
}

/// Usage and recommendation for one category
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FixtureCategory {
    /// Current figures
    #[serde(flatten)]
    pub usage: UsageFigures,
    /// Provider-recommended coverage percent, if any
    #[serde(default)]
    pub recommendation: Option<f64>,
}

/// Sandbox usage data, keyed by category id
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Fixture {
    /// Per-category figures
    pub categories: BTreeMap<String, FixtureCategory>,
}

impl Fixture {
    /// Load a fixture file
    ///
    /// # Errors
    /// Returns [`SandboxError`] if the file is missing or malformed
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, SandboxError> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path).await.map_err(|e| SandboxError::io(path, e))?;
        serde_json::from_slice(&bytes).map_err(|e| SandboxError::malformed(path, e))
    }

    fn entry(&self, category: &CategoryId) -> Result<&FixtureCategory, ExternalError> {
        self.categories
            .get(category.as_str())
            .ok_or_else(|| ExternalError::permanent(format!("no fixture data for {category}")))
    }
}

/// One purchase recorded by the sandbox
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerRecord {
    /// Generated plan id
    pub plan_id: String,
    /// Token the purchase was made under
    pub token: IdempotencyToken,
    /// Category covered
    pub category_id: CategoryId,
    /// Hourly commitment bought
    pub hourly_commitment: f64,
    /// Term
    pub term: Term,
    /// Payment option
    pub payment_option: PaymentOption,
    /// Purchase time
    pub purchased_at: DateTime<Utc>,
}

impl LedgerRecord {
    /// The commitment this purchase created
    #[must_use]
    pub fn commitment(&self) -> Commitment {
        Commitment::new(
            self.plan_id.clone(),
            self.hourly_commitment,
            self.purchased_at + Duration::days(self.term.days()),
        )
    }

    fn receipt(&self, replayed: bool) -> PurchaseReceipt {
        PurchaseReceipt {
            plan_id: self.plan_id.clone(),
            token: self.token.clone(),
            purchased_at: self.purchased_at,
            replayed,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LedgerFile {
    #[serde(default)]
    purchases: Vec<LedgerRecord>,
}

/// Purchase API persisted to a JSON file
///
/// A token already present in the file returns the stored receipt flagged
/// as replayed instead of buying again, across process restarts. Purchases
/// hold `<ledger>.lock` while they read and rewrite the file, so overlapping
/// processes record each token once.
#[derive(Debug)]
pub struct FileLedger {
    path: PathBuf,
    write_guard: Mutex<()>,
}

impl FileLedger {
    /// Ledger at `path`; the file is created on first purchase
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_guard: Mutex::new(()),
        }
    }

    /// Backing file
    #[inline]
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every recorded purchase, oldest first
    ///
    /// # Errors
    /// Returns [`SandboxError`] if the file exists but cannot be read
    pub async fn records(&self) -> Result<Vec<LedgerRecord>, SandboxError> {
        Ok(self.load().await?.purchases)
    }

    async fn load(&self) -> Result<LedgerFile, SandboxError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| SandboxError::malformed(&self.path, e)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(LedgerFile::default()),
            Err(e) => Err(SandboxError::io(&self.path, e)),
        }
    }

    async fn lock(&self) -> Result<LockFile, SandboxError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SandboxError::io(parent, e))?;
        }
        let mut name = self.path.as_os_str().to_owned();
        name.push(".lock");
        let path = PathBuf::from(name);
        LockFile::acquire(&path).await.map_err(|e| SandboxError::io(&path, e))
    }

    async fn store(&self, file: &LedgerFile) -> Result<(), SandboxError> {
        let bytes = serde_json::to_vec_pretty(file).map_err(|e| SandboxError::malformed(&self.path, e))?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await.map_err(|e| SandboxError::io(&tmp, e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| SandboxError::io(&self.path, e))
    }
}

#[async_trait]
impl PurchaseApi for FileLedger {
    async fn purchase(&self, request: &PurchaseRequest) -> Result<PurchaseReceipt, ExternalError> {
        if !(request.hourly_commitment.is_finite() && request.hourly_commitment > 0.0) {
            return Err(ExternalError::permanent(format!(
                "invalid hourly commitment {}",
                request.hourly_commitment
            )));
        }

        let _guard = self.write_guard.lock().await;
        let _lock = self.lock().await.map_err(|e| ExternalError::transient(e.to_string()))?;
        let mut file = self.load().await.map_err(|e| ExternalError::transient(e.to_string()))?;
        if let Some(existing) = file.purchases.iter().find(|r| r.token == request.token) {
            tracing::info!(
                token = request.token.short(),
                plan_id = %existing.plan_id,
                "token already in sandbox ledger"
            );
            return Ok(existing.receipt(true));
        }

        let record = LedgerRecord {
            plan_id: format!("sp-{}", Uuid::new_v4().simple()),
            token: request.token.clone(),
            category_id: request.category_id.clone(),
            hourly_commitment: request.hourly_commitment,
            term: request.term,
            payment_option: request.payment_option,
            purchased_at: Utc::now(),
        };
        file.purchases.push(record.clone());
        self.store(&file).await.map_err(|e| ExternalError::transient(e.to_string()))?;
        tracing::info!(
            plan_id = %record.plan_id,
            category = %record.category_id,
            amount = record.hourly_commitment,
            "sandbox purchase recorded"
        );
        Ok(record.receipt(false))
    }

    async fn find(&self, token: &IdempotencyToken) -> Result<Option<PurchaseReceipt>, ExternalError> {
        let records = self.records().await.map_err(|e| ExternalError::transient(e.to_string()))?;
        Ok(records.iter().find(|r| &r.token == token).map(|r| r.receipt(false)))
    }
}

/// Usage and recommendation source over a fixture plus ledger purchases
#[derive(Debug)]
pub struct SandboxUsage {
    fixture: Fixture,
    ledger: Option<Arc<FileLedger>>,
}

impl SandboxUsage {
    /// Serve `fixture`, folding in purchases from `ledger` when given
    #[must_use]
    pub fn new(fixture: Fixture, ledger: Option<Arc<FileLedger>>) -> Self {
        Self { fixture, ledger }
    }
}

#[async_trait]
impl UsageSource for SandboxUsage {
    async fn current_state(
        &self,
        category: &CategoryId,
        _lookback_days: u32,
    ) -> Result<UsageFigures, ExternalError> {
        let mut usage = self.fixture.entry(category)?.usage.clone();
        let Some(ledger) = &self.ledger else {
            return Ok(usage);
        };

        let records = ledger.records().await.map_err(|e| ExternalError::transient(e.to_string()))?;
        for record in records.iter().filter(|r| &r.category_id == category) {
            usage.on_demand_rate = (usage.on_demand_rate - record.hourly_commitment).max(0.0);
            usage.commitments.push(record.commitment());
        }
        Ok(usage)
    }
}

#[async_trait]
impl RecommendationSource for SandboxUsage {
    async fn recommendation(
        &self,
        category: &CategoryId,
        _lookback_days: u32,
    ) -> Result<Option<f64>, ExternalError> {
        Ok(self.fixture.entry(category)?.recommendation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn request(token: &str, amount: f64) -> PurchaseRequest {
        PurchaseRequest {
            token: IdempotencyToken::from_raw(token),
            category_id: CategoryId::parse("compute").unwrap(),
            hourly_commitment: amount,
            term: Term::OneYear,
            payment_option: PaymentOption::NoUpfront,
        }
    }

    #[test]
    fn fixture_parses_flattened_usage() {
        let raw = r#"{
            "categories": {
                "compute": {
                    "on_demand_rate": 40.0,
                    "commitments": [
                        {"plan_id": "sp-1", "hourly_commitment": 60.0, "expires_at": "2030-01-01T00:00:00Z"}
                    ],
                    "daily_spend": [2400.0, 2400.0],
                    "recommendation": 75.0
                },
                "database": {"on_demand_rate": 10.0}
            }
        }"#;
        let fixture: Fixture = serde_json::from_str(raw).unwrap();

        let compute = &fixture.categories["compute"];
        assert_eq!(compute.usage.on_demand_rate, 40.0);
        assert_eq!(compute.usage.commitments.len(), 1);
        assert_eq!(compute.usage.data_days(), 2);
        assert_eq!(compute.recommendation, Some(75.0));
        assert_eq!(fixture.categories["database"].recommendation, None);
    }

    #[tokio::test]
    async fn ledger_replays_known_tokens_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.json");

        let first = FileLedger::new(&path).purchase(&request("tok-a", 5.0)).await.unwrap();
        assert!(!first.replayed);

        // A fresh instance reads the same file
        let again = FileLedger::new(&path).purchase(&request("tok-a", 5.0)).await.unwrap();
        assert!(again.replayed);
        assert_eq!(again.plan_id, first.plan_id);

        let records = FileLedger::new(&path).records().await.unwrap();
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn overlapping_ledgers_record_a_token_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("ledger.json");
        // Separate instances share no in-process guard, like two processes
        let ledgers: Vec<_> = (0..4).map(|_| FileLedger::new(&path)).collect();

        let req = request("tok-d", 5.0);
        let results = futures::future::join_all(ledgers.iter().map(|l| l.purchase(&req))).await;

        let receipts: Vec<_> = results.into_iter().map(Result::unwrap).collect();
        assert_eq!(receipts.iter().filter(|r| !r.replayed).count(), 1);
        assert!(receipts.iter().all(|r| r.plan_id == receipts[0].plan_id));
        assert_eq!(FileLedger::new(&path).records().await.unwrap().len(), 1);
        assert!(!dir.path().join("state").join("ledger.json.lock").exists());
    }

    #[tokio::test]
    async fn find_reports_recorded_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = FileLedger::new(dir.path().join("ledger.json"));
        let token = IdempotencyToken::from_raw("tok-e");
        assert_eq!(ledger.find(&token).await.unwrap(), None);

        let bought = ledger.purchase(&request("tok-e", 5.0)).await.unwrap();
        let found = FileLedger::new(ledger.path()).find(&token).await.unwrap().unwrap();
        assert_eq!(found.plan_id, bought.plan_id);
    }

    #[tokio::test]
    async fn ledger_rejects_non_positive_amounts() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = FileLedger::new(dir.path().join("ledger.json"));

        let err = ledger.purchase(&request("tok-b", 0.0)).await.unwrap_err();
        assert!(!err.is_retryable());
        assert!(ledger.records().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn purchases_become_commitments() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(FileLedger::new(dir.path().join("ledger.json")));
        ledger.purchase(&request("tok-c", 10.0)).await.unwrap();

        let mut fixture = Fixture::default();
        fixture.categories.insert(
            "compute".to_string(),
            FixtureCategory {
                usage: UsageFigures::new(50.0),
                recommendation: None,
            },
        );
        let usage = SandboxUsage::new(fixture, Some(ledger));

        let figures = usage
            .current_state(&CategoryId::parse("compute").unwrap(), 30)
            .await
            .unwrap();
        assert_eq!(figures.on_demand_rate, 40.0);
        assert_eq!(figures.commitments.len(), 1);
        assert_eq!(figures.commitments[0].hourly_commitment, 10.0);
    }

    #[tokio::test]
    async fn unknown_category_is_permanent() {
        let usage = SandboxUsage::new(Fixture::default(), None);
        let err = usage
            .current_state(&CategoryId::parse("compute").unwrap(), 30)
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }
}
