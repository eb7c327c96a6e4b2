//! External collaborators
//!
//! The usage source, recommendation source, purchase API and notification
//! sink sit outside the core. Callers bound every call with
//! [`crate::timeout::bounded`]; implementations need not time themselves out.

use crate::error::ExternalError;
use crate::report::PlanningReport;
use crate::timeout::bounded;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use spa_model::{
    CategoryId, DrainSummary, IdempotencyToken, PaymentOption, PurchaseIntent, Term, UsageFigures,
};
use std::time::Duration;

/// Usage and commitment query
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UsageSource: Send + Sync {
    /// Current on-demand spend, active commitments and daily history
    async fn current_state(
        &self,
        category: &CategoryId,
        lookback_days: u32,
    ) -> Result<UsageFigures, ExternalError>;
}

/// Provider coverage recommendation query
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RecommendationSource: Send + Sync {
    /// Recommended coverage percent, if the provider has one
    async fn recommendation(
        &self,
        category: &CategoryId,
        lookback_days: u32,
    ) -> Result<Option<f64>, ExternalError>;
}

/// One purchase call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurchaseRequest {
    /// Idempotency token forwarded to the provider
    pub token: IdempotencyToken,
    /// Category the plan covers
    pub category_id: CategoryId,
    /// Hourly commitment
    pub hourly_commitment: f64,
    /// Term
    pub term: Term,
    /// Payment option
    pub payment_option: PaymentOption,
}

impl From<&PurchaseIntent> for PurchaseRequest {
    fn from(intent: &PurchaseIntent) -> Self {
        Self {
            token: intent.idempotency_token.clone(),
            category_id: intent.category_id.clone(),
            hourly_commitment: intent.hourly_commitment,
            term: intent.term,
            payment_option: intent.payment_option,
        }
    }
}

/// Provider acknowledgement of a purchase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurchaseReceipt {
    /// Provider plan identifier
    pub plan_id: String,
    /// Token the plan was bought under
    pub token: IdempotencyToken,
    /// Purchase time
    pub purchased_at: DateTime<Utc>,
    /// Provider recognised the token and returned the earlier plan
    #[serde(default)]
    pub replayed: bool,
}

/// Commitment purchasing API
#[async_trait]
pub trait PurchaseApi: Send + Sync {
    /// Buy a plan under the request's idempotency token
    async fn purchase(&self, request: &PurchaseRequest) -> Result<PurchaseReceipt, ExternalError>;

    /// Plan already bought under `token`, if any
    async fn find(&self, token: &IdempotencyToken) -> Result<Option<PurchaseReceipt>, ExternalError>;
}

/// Message handed to the notification sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    /// Dry-run announcement of an intent that was not queued
    WouldPurchase {
        /// Intent that would have been queued
        intent: PurchaseIntent,
    },
    /// Planning pass finished
    Planning {
        /// Pass report
        report: PlanningReport,
    },
    /// Execution drain finished
    Drain {
        /// Drain summary
        summary: DrainSummary,
    },
}

impl Notification {
    /// Notification kind
    #[inline]
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::WouldPurchase { .. } => "would_purchase",
            Self::Planning { .. } => "planning",
            Self::Drain { .. } => "drain",
        }
    }
}

/// Notification delivery
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Deliver one notification
    async fn notify(&self, notification: &Notification) -> Result<(), ExternalError>;
}

/// Deliver a notification without letting its failure escape
pub async fn notify_best_effort(
    sink: &dyn NotificationSink,
    notification: &Notification,
    limit: Duration,
) {
    if let Err(e) = bounded("notify", limit, sink.notify(notification)).await {
        tracing::warn!(kind = notification.kind(), error = %e, "notification failed");
        metrics::counter!("spa_notification_failures_total").increment(1);
    }
}

/// Sink that writes notifications to the log
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl NotificationSink for LogNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), ExternalError> {
        match notification {
            Notification::WouldPurchase { intent } => tracing::info!(
                category = %intent.category_id,
                token = intent.idempotency_token.short(),
                amount = intent.hourly_commitment,
                term = %intent.term,
                "dry run: would purchase"
            ),
            Notification::Planning { report } => tracing::info!(
                dry_run = report.dry_run,
                emitted = report.count("emitted"),
                dry_runs = report.count("dry_run"),
                no_action = report.count("no_action"),
                insufficient_data = report.count("skipped_insufficient_data"),
                failed = report.count("failed"),
                "planning pass complete"
            ),
            Notification::Drain { summary } => {
                let counts = summary.counts();
                tracing::info!(
                    purchased = counts.purchased,
                    skipped_cap_exceeded = counts.skipped_cap_exceeded,
                    skipped_stale = counts.skipped_stale,
                    failed = counts.failed,
                    undecodable = summary.undecodable,
                    purchased_rate = summary.purchased_rate(),
                    "execution drain complete"
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn best_effort_swallows_failures() {
        let mut sink = MockNotificationSink::new();
        sink.expect_notify()
            .times(1)
            .returning(|_| Err(ExternalError::transient("smtp down")));

        let summary = DrainSummary::new(Utc::now());
        notify_best_effort(&sink, &Notification::Drain { summary }, Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn best_effort_bounds_hung_sinks() {
        struct Hung;

        #[async_trait]
        impl NotificationSink for Hung {
            async fn notify(&self, _: &Notification) -> Result<(), ExternalError> {
                futures::future::pending().await
            }
        }

        let summary = DrainSummary::new(Utc::now());
        notify_best_effort(&Hung, &Notification::Drain { summary }, Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn log_notifier_accepts_everything() {
        let summary = DrainSummary::new(Utc::now());
        assert!(LogNotifier.notify(&Notification::Drain { summary }).await.is_ok());
    }

    #[test]
    fn notification_serde_is_tagged() {
        let summary = DrainSummary::new(Utc::now());
        let value = serde_json::to_value(Notification::Drain { summary }).unwrap();
        assert_eq!(value["kind"], "drain");
    }
}
