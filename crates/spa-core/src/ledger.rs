//! Idempotent purchase ledger
//!
//! Wraps a [`PurchaseApi`] so that each idempotency token reaches the
//! provider at most once per successful purchase. Concurrent callers with the
//! same token wait on one shared in-flight call; later callers get the
//! stored receipt back flagged as replayed. A failed call stores nothing, so
//! redelivery retries it.
//!
//! The in-process map only knows this process's purchases. [`PurchaseLedger::lookup`]
//! falls back to the provider, so a token bought by an earlier run is
//! recognised before anything re-measures coverage that already includes it.

use crate::collaborators::{PurchaseApi, PurchaseReceipt, PurchaseRequest};
use crate::error::ExternalError;
use crate::timeout::bounded;
use dashmap::DashMap;
use spa_model::IdempotencyToken;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;

/// Receipt plus whether this call performed the purchase
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerReceipt {
    /// Provider receipt
    pub receipt: PurchaseReceipt,
    /// True when an earlier call already bought this token
    pub replayed: bool,
}

/// Token-keyed purchase deduplication
pub struct PurchaseLedger {
    api: Arc<dyn PurchaseApi>,
    call_timeout: Duration,
    entries: DashMap<IdempotencyToken, Arc<OnceCell<PurchaseReceipt>>>,
}

impl std::fmt::Debug for PurchaseLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PurchaseLedger")
            .field("call_timeout", &self.call_timeout)
            .field("entries", &self.entries.len())
            .finish_non_exhaustive()
    }
}

impl PurchaseLedger {
    /// Create a ledger over `api`, bounding each call by `call_timeout`
    #[must_use]
    pub fn new(api: Arc<dyn PurchaseApi>, call_timeout: Duration) -> Self {
        Self {
            api,
            call_timeout,
            entries: DashMap::new(),
        }
    }

    /// Purchase under the request's token, or replay the earlier receipt
    ///
    /// # Errors
    /// Returns the provider's [`ExternalError`]; nothing is recorded on failure
    pub async fn purchase(&self, request: &PurchaseRequest) -> Result<LedgerReceipt, ExternalError> {
        // Clone the cell out so no map guard is held across the await
        let cell = self.entries.entry(request.token.clone()).or_default().clone();

        let performed = AtomicBool::new(false);
        let receipt = cell
            .get_or_try_init(|| async {
                performed.store(true, Ordering::Relaxed);
                tracing::info!(
                    token = request.token.short(),
                    category = %request.category_id,
                    amount = request.hourly_commitment,
                    "submitting purchase"
                );
                bounded("purchase", self.call_timeout, self.api.purchase(request)).await
            })
            .await?
            .clone();

        let replayed = !performed.load(Ordering::Relaxed) || receipt.replayed;
        if replayed {
            metrics::counter!("spa_purchase_replays_total").increment(1);
            tracing::info!(token = request.token.short(), plan_id = %receipt.plan_id, "purchase replayed");
        } else {
            metrics::counter!("spa_purchases_total").increment(1);
        }
        Ok(LedgerReceipt { receipt, replayed })
    }

    /// Receipt of a purchase completed in this process for `token`
    #[must_use]
    pub fn completed(&self, token: &IdempotencyToken) -> Option<PurchaseReceipt> {
        self.entries.get(token).and_then(|cell| cell.get().cloned())
    }

    /// Receipt of any earlier purchase for `token`, asking the provider when
    /// this process has none
    ///
    /// A receipt found at the provider is remembered, so later calls for the
    /// token replay without another round trip.
    ///
    /// # Errors
    /// Returns the provider's [`ExternalError`] if the lookup fails
    pub async fn lookup(&self, token: &IdempotencyToken) -> Result<Option<PurchaseReceipt>, ExternalError> {
        if let Some(receipt) = self.completed(token) {
            return Ok(Some(receipt));
        }
        let Some(receipt) = bounded("lookup", self.call_timeout, self.api.find(token)).await? else {
            return Ok(None);
        };
        tracing::info!(token = token.short(), plan_id = %receipt.plan_id, "token already purchased at provider");
        let cell = self.entries.entry(token.clone()).or_default().clone();
        // An in-flight purchase for the token keeps its own result
        let _ = cell.set(receipt.clone());
        Ok(Some(receipt))
    }

    /// Number of tokens purchased through this ledger
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.value().initialized()).count()
    }

    /// Check if nothing has been purchased
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use parking_lot::Mutex;
    use proptest::prelude::*;
    use spa_model::{CategoryId, PaymentOption, Term};
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingApi {
        calls: AtomicUsize,
        lookups: AtomicUsize,
        failures: Mutex<VecDeque<ExternalError>>,
        delay: Option<Duration>,
        bought: Mutex<Vec<PurchaseReceipt>>,
    }

    #[async_trait]
    impl PurchaseApi for CountingApi {
        async fn purchase(&self, request: &PurchaseRequest) -> Result<PurchaseReceipt, ExternalError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(err) = self.failures.lock().pop_front() {
                return Err(err);
            }
            let receipt = PurchaseReceipt {
                plan_id: format!("plan-{n}"),
                token: request.token.clone(),
                purchased_at: Utc::now(),
                replayed: false,
            };
            self.bought.lock().push(receipt.clone());
            Ok(receipt)
        }

        async fn find(&self, token: &IdempotencyToken) -> Result<Option<PurchaseReceipt>, ExternalError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            Ok(self.bought.lock().iter().find(|r| &r.token == token).cloned())
        }
    }

    fn request(token: &str) -> PurchaseRequest {
        PurchaseRequest {
            token: IdempotencyToken::from_raw(token),
            category_id: CategoryId::parse("compute").unwrap(),
            hourly_commitment: 4.2,
            term: Term::OneYear,
            payment_option: PaymentOption::NoUpfront,
        }
    }

    #[tokio::test]
    async fn sequential_duplicates_replay() {
        let api = Arc::new(CountingApi::default());
        let ledger = PurchaseLedger::new(api.clone(), Duration::from_secs(5));

        let first = ledger.purchase(&request("t1")).await.unwrap();
        let second = ledger.purchase(&request("t1")).await.unwrap();

        assert!(!first.replayed);
        assert!(second.replayed);
        assert_eq!(first.receipt.plan_id, second.receipt.plan_id);
        assert_eq!(api.calls.load(Ordering::SeqCst), 1);
        assert_eq!(ledger.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_duplicates_share_one_call() {
        let api = Arc::new(CountingApi {
            delay: Some(Duration::from_millis(200)),
            ..CountingApi::default()
        });
        let ledger = PurchaseLedger::new(api.clone(), Duration::from_secs(5));

        let req = request("t1");
        let results = futures::future::join_all((0..8).map(|_| ledger.purchase(&req))).await;

        assert_eq!(api.calls.load(Ordering::SeqCst), 1);
        let plan_ids: std::collections::HashSet<_> = results
            .into_iter()
            .map(|r| r.unwrap().receipt.plan_id)
            .collect();
        assert_eq!(plan_ids.len(), 1);
    }

    #[tokio::test]
    async fn failure_is_not_recorded() {
        let api = Arc::new(CountingApi::default());
        api.failures.lock().push_back(ExternalError::transient("throttled"));
        let ledger = PurchaseLedger::new(api.clone(), Duration::from_secs(5));

        assert!(ledger.purchase(&request("t1")).await.is_err());
        assert!(ledger.completed(&IdempotencyToken::from_raw("t1")).is_none());

        let retry = ledger.purchase(&request("t1")).await.unwrap();
        assert!(!retry.replayed);
        assert_eq!(api.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_provider_times_out() {
        let api = Arc::new(CountingApi {
            delay: Some(Duration::from_secs(3600)),
            ..CountingApi::default()
        });
        let ledger = PurchaseLedger::new(api, Duration::from_secs(10));

        let err = ledger.purchase(&request("t1")).await.unwrap_err();
        assert_eq!(err, ExternalError::Timeout { operation: "purchase", after_ms: 10_000 });
        assert!(ledger.is_empty());
    }

    #[tokio::test]
    async fn lookup_recognises_purchase_from_earlier_run() {
        let api = Arc::new(CountingApi::default());
        let token = IdempotencyToken::from_raw("t1");
        let earlier = PurchaseLedger::new(api.clone(), Duration::from_secs(5));
        let bought = earlier.purchase(&request("t1")).await.unwrap();

        // A fresh process knows nothing locally
        let ledger = PurchaseLedger::new(api.clone(), Duration::from_secs(5));
        assert!(ledger.completed(&token).is_none());

        let found = ledger.lookup(&token).await.unwrap().unwrap();
        assert_eq!(found.plan_id, bought.receipt.plan_id);
        assert_eq!(ledger.completed(&token), Some(found));

        // Remembered: neither another lookup nor another purchase reaches the provider
        ledger.lookup(&token).await.unwrap();
        let replay = ledger.purchase(&request("t1")).await.unwrap();
        assert!(replay.replayed);
        assert_eq!(api.lookups.load(Ordering::SeqCst), 1);
        assert_eq!(api.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn lookup_of_unknown_token_is_none() {
        let api = Arc::new(CountingApi::default());
        let ledger = PurchaseLedger::new(api.clone(), Duration::from_secs(5));
        assert_eq!(ledger.lookup(&IdempotencyToken::from_raw("t9")).await.unwrap(), None);
        assert!(ledger.is_empty());
    }

    #[tokio::test]
    async fn distinct_tokens_purchase_separately() {
        let api = Arc::new(CountingApi::default());
        let ledger = PurchaseLedger::new(api.clone(), Duration::from_secs(5));
        ledger.purchase(&request("t1")).await.unwrap();
        ledger.purchase(&request("t2")).await.unwrap();
        assert_eq!(api.calls.load(Ordering::SeqCst), 2);
    }

    proptest! {
        #[test]
        fn each_token_reaches_the_provider_once(picks in proptest::collection::vec(0u8..6, 1..40)) {
            let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            let api = Arc::new(CountingApi::default());
            let ledger = PurchaseLedger::new(api.clone(), Duration::from_secs(5));

            let replays = runtime.block_on(async {
                let mut replays = 0usize;
                for pick in &picks {
                    if ledger.purchase(&request(&format!("t{pick}"))).await.unwrap().replayed {
                        replays += 1;
                    }
                }
                replays
            });

            let distinct: std::collections::HashSet<_> = picks.iter().collect();
            prop_assert_eq!(api.calls.load(Ordering::SeqCst), distinct.len());
            prop_assert_eq!(ledger.len(), distinct.len());
            prop_assert_eq!(replays, picks.len() - distinct.len());
        }
    }
}
