//! Execution Coordinator
//!
//! Drains the review queue and settles every intent it receives:
//!
//! 1. tokens already bought, here or by an earlier run, replay their receipt
//! 2. intents older than the staleness threshold are skipped
//! 3. coverage is re-measured and the *current* cap re-checked
//! 4. the purchase goes through the [`PurchaseLedger`]
//!
//! Every way of not buying is an [`AutopilotError`]: skips settle the
//! message, retryable failures leave it for redelivery and the rest
//! dead-letter it.
//!
//! Categories drain concurrently; intents within one category drain in
//! order, so two intents for the same category never pass the cap check
//! against the same stale measurement.

use crate::collaborators::{notify_best_effort, Notification, NotificationSink, PurchaseRequest, UsageSource};
use crate::config::AutopilotConfig;
use crate::ledger::PurchaseLedger;
use crate::queue::{Delivery, IntentQueue, ReceiptHandle};
use crate::timeout::bounded;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use spa_model::{
    AutopilotError, CategoryId, DrainSummary, ExecutionOutcome, ExecutionResult,
    PurchaseIntent,
};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::Instrument;

/// Messages requested per receive call
pub const RECEIVE_BATCH_SIZE: usize = 10;

/// Tolerance applied to the cap comparison
const CAP_EPSILON: f64 = 1e-9;

/// A decoded delivery
#[derive(Debug)]
struct Received {
    receipt: ReceiptHandle,
    receive_count: u32,
    intent: PurchaseIntent,
}

/// Drains the review queue
pub struct ExecutionCoordinator {
    config: Arc<AutopilotConfig>,
    usage: Arc<dyn UsageSource>,
    queue: Arc<dyn IntentQueue>,
    ledger: Arc<PurchaseLedger>,
    notifier: Arc<dyn NotificationSink>,
}

impl std::fmt::Debug for ExecutionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionCoordinator")
            .field("concurrency", &self.config.execution_concurrency)
            .field("ledger", &self.ledger)
            .finish_non_exhaustive()
    }
}

impl ExecutionCoordinator {
    /// Create a coordinator over validated configuration
    ///
    /// # Errors
    /// Returns [`AutopilotError::Configuration`] if `config` does not validate
    pub fn new(
        config: Arc<AutopilotConfig>,
        usage: Arc<dyn UsageSource>,
        queue: Arc<dyn IntentQueue>,
        ledger: Arc<PurchaseLedger>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Result<Self, AutopilotError> {
        config.validate()?;
        Ok(Self {
            config,
            usage,
            queue,
            ledger,
            notifier,
        })
    }

    /// Drain until the queue has nothing visible left, then notify
    pub async fn drain(&self, now: DateTime<Utc>) -> DrainSummary {
        let limit = self.config.external_call_timeout();
        let mut summary = DrainSummary::new(now);
        let mut settled: HashSet<ReceiptHandle> = HashSet::new();

        loop {
            let batch = match bounded("receive", limit, self.queue.receive(RECEIVE_BATCH_SIZE)).await {
                Ok(batch) => batch,
                Err(e) => {
                    tracing::error!(error = %e, "queue receive failed; stopping drain");
                    summary.interrupted = Some(e.to_string());
                    break;
                }
            };
            if batch.is_empty() {
                break;
            }

            let mut groups: BTreeMap<CategoryId, Vec<Received>> = BTreeMap::new();
            let mut fresh = 0usize;
            for Delivery { receipt, receive_count, body } in batch {
                if settled.contains(&receipt) {
                    tracing::warn!(receipt = %receipt, "settled message delivered again");
                    continue;
                }
                fresh += 1;
                match body {
                    Ok(intent) => groups
                        .entry(intent.category_id.clone())
                        .or_default()
                        .push(Received { receipt, receive_count, intent }),
                    Err(e) => {
                        tracing::error!(receipt = %receipt, error = %e, "undecodable intent");
                        self.dead_letter(&receipt, &e.to_string()).await;
                        settled.insert(receipt);
                        summary.undecodable += 1;
                    }
                }
            }
            if fresh == 0 {
                summary.interrupted = Some("queue keeps redelivering settled messages".to_string());
                break;
            }

            let outcomes: Vec<Vec<(ReceiptHandle, ExecutionResult)>> = stream::iter(groups.into_values())
                .map(|items| self.drain_category(items, now))
                .buffer_unordered(self.config.execution_concurrency)
                .collect()
                .await;
            for (receipt, result) in outcomes.into_iter().flatten() {
                if result.outcome.is_terminal() {
                    settled.insert(receipt);
                }
                summary.results.push(result);
            }
        }

        summary.finished_at = Utc::now();
        let counts = summary.counts();
        tracing::info!(
            purchased = counts.purchased,
            skipped_cap_exceeded = counts.skipped_cap_exceeded,
            skipped_stale = counts.skipped_stale,
            failed = counts.failed,
            undecodable = summary.undecodable,
            "drain finished"
        );
        notify_best_effort(
            self.notifier.as_ref(),
            &Notification::Drain { summary: summary.clone() },
            limit,
        )
        .await;
        summary
    }

    async fn drain_category(
        &self,
        items: Vec<Received>,
        now: DateTime<Utc>,
    ) -> Vec<(ReceiptHandle, ExecutionResult)> {
        let mut results = Vec::with_capacity(items.len());
        for item in items {
            let span = tracing::info_span!(
                "execute",
                category = %item.intent.category_id,
                token = item.intent.idempotency_token.short(),
                receive_count = item.receive_count,
            );
            let outcome = self.execute(&item, now).instrument(span).await;
            metrics::counter!("spa_execution_outcomes_total", "outcome" => outcome.label()).increment(1);
            results.push((
                item.receipt,
                ExecutionResult {
                    idempotency_token: item.intent.idempotency_token,
                    category_id: item.intent.category_id,
                    hourly_commitment: item.intent.hourly_commitment,
                    outcome,
                },
            ));
        }
        results
    }

    async fn execute(&self, item: &Received, now: DateTime<Utc>) -> ExecutionOutcome {
        match self.attempt(item, now).await {
            Ok(outcome) => outcome,
            Err(err) => match err.skip_outcome() {
                Some(outcome) => {
                    tracing::warn!(error = %err, "skipping intent");
                    self.settle(&item.receipt).await;
                    outcome
                }
                None => self.fail(item, &err).await,
            },
        }
    }

    async fn attempt(&self, item: &Received, now: DateTime<Utc>) -> Result<ExecutionOutcome, AutopilotError> {
        let intent = &item.intent;
        let config = &self.config;

        // Must precede re-measurement: fresh coverage already includes an earlier purchase of this token
        let earlier = self
            .ledger
            .lookup(&intent.idempotency_token)
            .await
            .map_err(|e| e.into_autopilot("lookup"))?;
        if let Some(receipt) = earlier {
            tracing::info!(plan_id = %receipt.plan_id, "token already purchased; replaying");
            self.settle(&item.receipt).await;
            return Ok(ExecutionOutcome::Purchased { plan_id: receipt.plan_id, replayed: true });
        }

        // Ahead of re-measurement: a stale intent settles without a usage query
        let threshold = config.staleness_threshold();
        if intent.is_stale(now, threshold) {
            return Err(AutopilotError::StaleIntent {
                token: intent.idempotency_token.clone(),
                age_hours: intent.age(now).num_hours(),
                threshold_hours: threshold.num_hours(),
            });
        }

        let category = config
            .category(&intent.category_id)
            .ok_or_else(|| AutopilotError::UnknownCategory(intent.category_id.clone()))?;
        let policy = config.policy_for(category);

        let usage = bounded(
            "usage",
            config.external_call_timeout(),
            self.usage.current_state(&intent.category_id, config.lookback_days),
        )
        .await
        .map_err(|e| e.into_autopilot("usage"))?;
        let snapshot = spa_strategy::analyze(
            &intent.category_id,
            &usage,
            config.renewal_window_days,
            config.min_data_days,
            now,
        )?;

        // Infinite when spend has dropped to zero
        let projected_percent = snapshot.projected_percent(intent.hourly_commitment);
        let cap_percent = policy.max_coverage_cap;
        if projected_percent > cap_percent + CAP_EPSILON {
            tracing::debug!(
                coverage_at_creation = intent.coverage_at_creation,
                coverage_now = snapshot.coverage_percent,
                total_rate = snapshot.total_rate,
                "coverage drifted since planning"
            );
            return Err(AutopilotError::CapExceeded {
                category: intent.category_id.clone(),
                projected_percent,
                cap_percent,
            });
        }

        let done = self
            .ledger
            .purchase(&PurchaseRequest::from(intent))
            .await
            .map_err(|e| e.into_autopilot("purchase"))?;
        tracing::info!(
            plan_id = %done.receipt.plan_id,
            replayed = done.replayed,
            projected_percent,
            "intent executed"
        );
        self.settle(&item.receipt).await;
        Ok(ExecutionOutcome::Purchased {
            plan_id: done.receipt.plan_id,
            replayed: done.replayed,
        })
    }

    /// Leave a retryable failure for redelivery until retries run out
    async fn fail(&self, item: &Received, err: &AutopilotError) -> ExecutionOutcome {
        let retryable = err.is_retryable();
        let error = err.to_string();
        let exhausted = item.receive_count >= self.config.max_receive_count;
        if retryable && !exhausted {
            tracing::warn!(
                error = %error,
                receive_count = item.receive_count,
                max_receive_count = self.config.max_receive_count,
                "execution failed; leaving for redelivery"
            );
            return ExecutionOutcome::Failed { error, retryable, dead_lettered: false };
        }

        let reason = if retryable {
            format!("retries exhausted after {} deliveries: {error}", item.receive_count)
        } else {
            error.clone()
        };
        tracing::error!(reason = %reason, "dead-lettering intent");
        let dead_lettered = self.dead_letter(&item.receipt, &reason).await;
        ExecutionOutcome::Failed { error, retryable, dead_lettered }
    }

    async fn settle(&self, receipt: &ReceiptHandle) {
        let limit = self.config.external_call_timeout();
        if let Err(e) = bounded("delete", limit, self.queue.delete(receipt)).await {
            tracing::warn!(receipt = %receipt, error = %e, "could not delete settled message");
        }
    }

    async fn dead_letter(&self, receipt: &ReceiptHandle, reason: &str) -> bool {
        let limit = self.config.external_call_timeout();
        match bounded("dead_letter", limit, self.queue.dead_letter(receipt, reason)).await {
            Ok(()) => {
                metrics::counter!("spa_dead_letters_total").increment(1);
                true
            }
            Err(e) => {
                tracing::error!(receipt = %receipt, error = %e, "could not dead-letter message");
                false
            }
        }
    }
}
