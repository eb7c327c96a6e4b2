//! Planning Orchestrator
//!
//! One pass per category, all categories concurrently, no shared state
//! between them. Each pass walks the phase machine in [`crate::phase`] and
//! ends in exactly zero or one publish.

use crate::collaborators::{notify_best_effort, Notification, NotificationSink, RecommendationSource, UsageSource};
use crate::config::{AutopilotConfig, WorkloadCategory};
use crate::error::ExternalError;
use crate::phase::{InvalidTransition, Phase, PhaseTrace};
use crate::queue::IntentQueue;
use crate::report::{CategoryReport, PlanningOutcome, PlanningReport};
use crate::timeout::bounded;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use spa_model::{AutopilotError, PurchaseIntent};
use spa_strategy::SplitLimit;
use std::sync::Arc;
use tracing::Instrument;

/// Why a phase could not complete
#[derive(Debug, thiserror::Error)]
enum PhaseError {
    #[error(transparent)]
    External(#[from] ExternalError),
    #[error(transparent)]
    Queue(#[from] crate::error::QueueError),
    #[error(transparent)]
    Transition(#[from] InvalidTransition),
}

impl PhaseError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::External(e) => e.is_retryable(),
            Self::Queue(e) => e.is_retryable(),
            Self::Transition(_) => false,
        }
    }
}

/// Runs planning passes
pub struct PlanningOrchestrator {
    config: Arc<AutopilotConfig>,
    usage: Arc<dyn UsageSource>,
    recommendations: Arc<dyn RecommendationSource>,
    queue: Arc<dyn IntentQueue>,
    notifier: Arc<dyn NotificationSink>,
}

impl std::fmt::Debug for PlanningOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanningOrchestrator")
            .field("dry_run", &self.config.dry_run)
            .field("categories", &self.config.categories.len())
            .finish_non_exhaustive()
    }
}

impl PlanningOrchestrator {
    /// Create an orchestrator over validated configuration
    ///
    /// # Errors
    /// Returns [`AutopilotError::Configuration`] if `config` does not validate
    pub fn new(
        config: Arc<AutopilotConfig>,
        usage: Arc<dyn UsageSource>,
        recommendations: Arc<dyn RecommendationSource>,
        queue: Arc<dyn IntentQueue>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Result<Self, AutopilotError> {
        config.validate()?;
        Ok(Self {
            config,
            usage,
            recommendations,
            queue,
            notifier,
        })
    }

    /// Run one pass over every category at `now`
    pub async fn run(&self, now: DateTime<Utc>) -> PlanningReport {
        tracing::info!(
            dry_run = self.config.dry_run,
            categories = self.config.categories.len(),
            "starting planning pass"
        );

        let passes = self.config.categories.iter().map(|category| {
            let span = tracing::info_span!("plan", category = %category.id);
            self.plan_category(category, now).instrument(span)
        });
        let categories = join_all(passes).await;

        let report = PlanningReport {
            started_at: now,
            finished_at: Utc::now(),
            dry_run: self.config.dry_run,
            categories,
        };
        notify_best_effort(
            self.notifier.as_ref(),
            &Notification::Planning { report: report.clone() },
            self.config.external_call_timeout(),
        )
        .await;
        report
    }

    async fn plan_category(&self, category: &WorkloadCategory, now: DateTime<Utc>) -> CategoryReport {
        let mut trace = PhaseTrace::new();
        let outcome = match self.walk(category, now, &mut trace).await {
            Ok(outcome) => outcome,
            Err(e) => {
                let phase = trace.current();
                tracing::error!(phase = %phase, error = %e, "planning failed");
                // A failed publish goes straight to End; earlier phases fall back to NoAction
                if phase != Phase::EmitIntent {
                    if let Err(t) = trace.advance(Phase::NoAction) {
                        tracing::error!(error = %t, "no recovery transition");
                    }
                }
                PlanningOutcome::Failed {
                    phase,
                    error: e.to_string(),
                    retryable: e.is_retryable(),
                }
            }
        };
        if let Err(e) = trace.advance(Phase::End) {
            tracing::error!(error = %e, "planning pass did not reach end");
        }

        metrics::counter!("spa_planning_outcomes_total", "outcome" => outcome.label()).increment(1);
        CategoryReport {
            category_id: category.id.clone(),
            outcome,
            phases: trace.phases().to_vec(),
        }
    }

    async fn walk(
        &self,
        category: &WorkloadCategory,
        now: DateTime<Utc>,
        trace: &mut PhaseTrace,
    ) -> Result<PlanningOutcome, PhaseError> {
        let config = &self.config;
        let policy = config.policy_for(category);
        let limit = config.external_call_timeout();

        trace.advance(Phase::Analyze)?;
        let usage = bounded(
            "usage",
            limit,
            self.usage.current_state(&category.id, config.lookback_days),
        )
        .await?;
        let snapshot = match spa_strategy::analyze(
            &category.id,
            &usage,
            config.renewal_window_days,
            config.min_data_days,
            now,
        ) {
            Ok(snapshot) => snapshot,
            Err(AutopilotError::InsufficientData { available_days, required_days, .. }) => {
                tracing::warn!(available_days, required_days, "skipping category: insufficient data");
                trace.advance(Phase::NoAction)?;
                return Ok(PlanningOutcome::SkippedInsufficientData { available_days, required_days });
            }
            Err(other) => {
                return Err(ExternalError::permanent(other.to_string()).into());
            }
        };
        tracing::debug!(
            coverage = snapshot.coverage_percent,
            total_rate = snapshot.total_rate,
            expiring_rate = snapshot.expiring_rate,
            volatility = snapshot.volatility,
            "coverage measured"
        );

        trace.advance(Phase::ResolveTarget)?;
        let recommendation = if policy.target.needs_recommendation() {
            bounded(
                "recommendation",
                limit,
                self.recommendations.recommendation(&category.id, config.lookback_days),
            )
            .await?
        } else {
            None
        };
        let target = policy.target.resolve(&snapshot, recommendation, policy.max_coverage_cap);

        trace.advance(Phase::PlanSplit)?;
        let plan = policy.split.plan(&snapshot, target, &policy.split_limits());
        tracing::info!(
            coverage = snapshot.coverage_percent,
            target,
            cap = policy.max_coverage_cap,
            strategy = policy.split.name(),
            amount = plan.amount,
            limit = plan.limit.map(|l| l.as_str()),
            "purchase planned"
        );
        if !plan.is_actionable() {
            trace.advance(Phase::NoAction)?;
            return Ok(PlanningOutcome::NoAction {
                coverage_percent: snapshot.coverage_percent,
                target_percent: target,
                reason: plan.limit.unwrap_or(SplitLimit::NoGap),
            });
        }

        trace.advance(Phase::EmitIntent)?;
        let intent = PurchaseIntent::new(
            &snapshot,
            plan.amount,
            category.term,
            category.payment_option,
            target,
            policy.max_coverage_cap,
            now,
        );
        self.emit(intent).await
    }

    async fn emit(&self, intent: PurchaseIntent) -> Result<PlanningOutcome, PhaseError> {
        let limit = self.config.external_call_timeout();
        if self.config.dry_run {
            notify_best_effort(
                self.notifier.as_ref(),
                &Notification::WouldPurchase { intent: intent.clone() },
                limit,
            )
            .await;
            tracing::info!(token = intent.idempotency_token.short(), "dry run: intent not queued");
            return Ok(PlanningOutcome::DryRun { intent });
        }

        let purged = bounded("purge", limit, self.queue.purge(&intent.category_id)).await?;
        if purged > 0 {
            tracing::warn!(purged, "purged superseded intents");
        }
        bounded("publish", limit, self.queue.publish(&intent)).await?;
        tracing::info!(
            token = intent.idempotency_token.short(),
            amount = intent.hourly_commitment,
            "intent queued for review"
        );
        Ok(PlanningOutcome::Emitted { intent })
    }
}
