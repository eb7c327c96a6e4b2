//! Testing utilities for SPA workspace
//!
//! Fakes for every collaborator plus fixture builders.

#![allow(missing_docs)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use spa_core::{
    AutopilotConfig, CategoryPolicy, ExternalError, Notification, NotificationSink, PurchaseApi,
    PurchaseReceipt, PurchaseRequest, RecommendationSource, UsageSource, WorkloadCategory,
};
use spa_model::{
    CategoryId, Commitment, CoverageSnapshot, DrainSummary, IdempotencyToken, PaymentOption,
    PurchaseIntent, Term, UsageFigures,
};
use spa_strategy::{SplitStrategy, TargetStrategy};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// Fixed reference time (mid-morning, so the cycle is the same day)
pub fn fixed_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
}

pub fn category(id: &str) -> CategoryId {
    CategoryId::parse(id).unwrap()
}

/// Usage with `total` spend of which `coverage_percent` is committed long-term
pub fn usage_with_coverage(total: f64, coverage_percent: f64, days: usize) -> UsageFigures {
    let committed = total * coverage_percent / 100.0;
    let mut usage = UsageFigures::new(total - committed).with_daily_spend(vec![total * 24.0; days]);
    if committed > 0.0 {
        usage = usage.with_commitments(vec![Commitment::new(
            "sp-existing",
            committed,
            fixed_now() + Duration::days(700),
        )]);
    }
    usage
}

pub fn snapshot(id: &str, total: f64, coverage_percent: f64) -> CoverageSnapshot {
    CoverageSnapshot {
        category_id: category(id),
        total_rate: total,
        committed_rate: total * coverage_percent / 100.0,
        expiring_rate: 0.0,
        coverage_percent,
        data_days: 30,
        volatility: 0.0,
        measured_at: fixed_now(),
    }
}

/// Intent for `amount`/hr planned at `created_at` against 100/hr of spend
pub fn intent_at(id: &str, amount: f64, coverage_percent: f64, created_at: DateTime<Utc>) -> PurchaseIntent {
    PurchaseIntent::new(
        &snapshot(id, 100.0, coverage_percent),
        amount,
        Term::OneYear,
        PaymentOption::NoUpfront,
        90.0,
        95.0,
        created_at,
    )
}

/// Policy: fixed 80% target, linear 10pt steps, 95% cap, no per-cycle ceiling
pub fn test_policy() -> CategoryPolicy {
    CategoryPolicy {
        target: TargetStrategy::Fixed { coverage_percent: 80.0 },
        split: SplitStrategy::Linear { step_percent: 10.0 },
        max_coverage_cap: 95.0,
        max_purchase_percent: 100.0,
        min_commitment_per_plan: 0.001,
    }
}

/// Live (non dry-run) configuration over `ids` using [`test_policy`]
pub fn live_config(ids: &[&str]) -> AutopilotConfig {
    AutopilotConfig::new(ids.iter().map(|id| WorkloadCategory::new(category(id))).collect())
        .with_dry_run(false)
        .with_defaults(test_policy())
}

// ---------------------------------------------------------------------------
// Usage source
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct FakeUsageSource {
    figures: DashMap<CategoryId, UsageFigures>,
    failures: Mutex<HashMap<CategoryId, VecDeque<ExternalError>>>,
    delay: Mutex<Option<StdDuration>>,
    calls: AtomicUsize,
}

impl FakeUsageSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, id: &str, figures: UsageFigures) -> Self {
        self.set(id, figures);
        self
    }

    pub fn set(&self, id: &str, figures: UsageFigures) {
        self.figures.insert(category(id), figures);
    }

    /// Shift spend into commitments, as a completed purchase would
    pub fn add_commitment(&self, id: &str, hourly: f64) {
        if let Some(mut figures) = self.figures.get_mut(&category(id)) {
            figures.on_demand_rate = (figures.on_demand_rate - hourly).max(0.0);
            figures
                .commitments
                .push(Commitment::new("sp-added", hourly, fixed_now() + Duration::days(365)));
        }
    }

    /// Queue errors returned before figures for `id`
    pub fn fail_next(&self, id: &str, errors: impl IntoIterator<Item = ExternalError>) {
        self.failures.lock().entry(category(id)).or_default().extend(errors);
    }

    pub fn set_delay(&self, delay: StdDuration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UsageSource for FakeUsageSource {
    async fn current_state(
        &self,
        category: &CategoryId,
        _lookback_days: u32,
    ) -> Result<UsageFigures, ExternalError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let scripted = self.failures.lock().get_mut(category).and_then(VecDeque::pop_front);
        if let Some(err) = scripted {
            return Err(err);
        }
        self.figures
            .get(category)
            .map(|f| f.clone())
            .ok_or_else(|| ExternalError::permanent(format!("no usage for {category}")))
    }
}

// ---------------------------------------------------------------------------
// Recommendations
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct FakeRecommendations {
    values: DashMap<CategoryId, f64>,
    calls: AtomicUsize,
}

impl FakeRecommendations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, id: &str, percent: f64) -> Self {
        self.values.insert(category(id), percent);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecommendationSource for FakeRecommendations {
    async fn recommendation(
        &self,
        category: &CategoryId,
        _lookback_days: u32,
    ) -> Result<Option<f64>, ExternalError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.values.get(category).map(|v| *v))
    }
}

// ---------------------------------------------------------------------------
// Purchase API
// ---------------------------------------------------------------------------

/// Purchase API that records every call and never deduplicates by itself
#[derive(Debug, Default)]
pub struct FakePurchaseApi {
    linked_usage: Option<Arc<FakeUsageSource>>,
    calls: AtomicUsize,
    per_token: DashMap<IdempotencyToken, usize>,
    receipts: DashMap<IdempotencyToken, PurchaseReceipt>,
    lookups: AtomicUsize,
    purchased: Mutex<Vec<PurchaseRequest>>,
    failures: Mutex<VecDeque<ExternalError>>,
    delay: Mutex<Option<StdDuration>>,
}

impl FakePurchaseApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Purchases move spend into commitments on `usage`
    pub fn linked(usage: Arc<FakeUsageSource>) -> Self {
        Self {
            linked_usage: Some(usage),
            ..Self::default()
        }
    }

    /// Fail the next calls with `errors`, in order
    pub fn fail_next(&self, errors: impl IntoIterator<Item = ExternalError>) {
        self.failures.lock().extend(errors);
    }

    pub fn set_delay(&self, delay: StdDuration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Token lookups made through [`PurchaseApi::find`]
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    pub fn calls_for(&self, token: &IdempotencyToken) -> usize {
        self.per_token.get(token).map_or(0, |n| *n)
    }

    /// Successful purchases, in order
    pub fn purchased(&self) -> Vec<PurchaseRequest> {
        self.purchased.lock().clone()
    }
}

#[async_trait]
impl PurchaseApi for FakePurchaseApi {
    async fn purchase(&self, request: &PurchaseRequest) -> Result<PurchaseReceipt, ExternalError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        *self.per_token.entry(request.token.clone()).or_default() += 1;
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let scripted = self.failures.lock().pop_front();
        if let Some(err) = scripted {
            return Err(err);
        }
        self.purchased.lock().push(request.clone());
        if let Some(usage) = &self.linked_usage {
            usage.add_commitment(request.category_id.as_str(), request.hourly_commitment);
        }
        let receipt = PurchaseReceipt {
            plan_id: format!("sp-{n:04}"),
            token: request.token.clone(),
            purchased_at: Utc::now(),
            replayed: false,
        };
        self.receipts.insert(request.token.clone(), receipt.clone());
        Ok(receipt)
    }

    async fn find(&self, token: &IdempotencyToken) -> Result<Option<PurchaseReceipt>, ExternalError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.receipts.get(token).map(|r| r.clone()))
    }
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct RecordingNotifier {
    received: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<Notification> {
        self.received.lock().clone()
    }

    pub fn would_purchase(&self) -> Vec<PurchaseIntent> {
        self.received
            .lock()
            .iter()
            .filter_map(|n| match n {
                Notification::WouldPurchase { intent } => Some(intent.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn drains(&self) -> Vec<DrainSummary> {
        self.received
            .lock()
            .iter()
            .filter_map(|n| match n {
                Notification::Drain { summary } => Some(summary.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn planning_reports(&self) -> usize {
        self.received
            .lock()
            .iter()
            .filter(|n| matches!(n, Notification::Planning { .. }))
            .count()
    }
}

#[async_trait]
impl NotificationSink for RecordingNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), ExternalError> {
        self.received.lock().push(notification.clone());
        Ok(())
    }
}

/// Sink whose every delivery fails
#[derive(Debug, Default)]
pub struct FailingNotifier {
    attempts: AtomicUsize,
}

impl FailingNotifier {
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NotificationSink for FailingNotifier {
    async fn notify(&self, _notification: &Notification) -> Result<(), ExternalError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(ExternalError::transient("notification channel unavailable"))
    }
}
