//! Subcommand implementations
//!
//! Each command wires the core components to the sandbox backend and
//! returns a value; rendering and exit codes live in the binary.

use crate::sandbox::{FileLedger, Fixture, SandboxUsage};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use spa_core::{
    AutopilotConfig, DeadLetter, ExecutionCoordinator, FileQueue, IntentQueue, LogNotifier, PlanningOrchestrator,
    PlanningOutcome, PlanningReport, PurchaseLedger, QueuedIntent,
};
use spa_model::{DrainSummary, ExecutionOutcome, IdempotencyToken};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Files making up one sandbox
#[derive(Debug, Clone)]
pub struct SandboxPaths {
    /// Configuration file (`.toml`, `.yaml` or `.yml`)
    pub config: PathBuf,
    /// Usage fixture
    pub fixture: PathBuf,
    /// Queue directory
    pub queue_dir: PathBuf,
    /// Purchase ledger file
    pub ledger: PathBuf,
}

/// Load and validate a configuration file
///
/// # Errors
/// Fails if the file cannot be read, parsed or validated
pub fn validate(path: &Path) -> Result<AutopilotConfig> {
    AutopilotConfig::from_path(path).with_context(|| format!("invalid configuration {}", path.display()))
}

async fn open_queue(queue_dir: &Path) -> Result<Arc<FileQueue>> {
    let queue = FileQueue::open(queue_dir)
        .await
        .with_context(|| format!("cannot open queue at {}", queue_dir.display()))?;
    Ok(Arc::new(queue))
}

async fn sandbox_usage(paths: &SandboxPaths, ledger: Arc<FileLedger>) -> Result<Arc<SandboxUsage>> {
    let fixture = Fixture::load(&paths.fixture)
        .await
        .with_context(|| format!("cannot load fixture {}", paths.fixture.display()))?;
    Ok(Arc::new(SandboxUsage::new(fixture, Some(ledger))))
}

/// Run one planning pass
///
/// `dry_run` overrides the configured mode when given.
///
/// # Errors
/// Fails on invalid configuration or unreadable sandbox files
pub async fn plan(paths: &SandboxPaths, dry_run: Option<bool>, now: DateTime<Utc>) -> Result<PlanningReport> {
    let mut config = validate(&paths.config)?;
    if let Some(dry_run) = dry_run {
        config.dry_run = dry_run;
    }
    let ledger = Arc::new(FileLedger::new(&paths.ledger));
    let usage = sandbox_usage(paths, ledger).await?;
    let queue = open_queue(&paths.queue_dir).await?;

    let orchestrator = PlanningOrchestrator::new(Arc::new(config), usage.clone(), usage, queue, Arc::new(LogNotifier))?;
    Ok(orchestrator.run(now).await)
}

/// Drain the queue once
///
/// # Errors
/// Fails on invalid configuration or unreadable sandbox files
pub async fn execute(paths: &SandboxPaths, now: DateTime<Utc>) -> Result<DrainSummary> {
    let config = Arc::new(validate(&paths.config)?);
    let api = Arc::new(FileLedger::new(&paths.ledger));
    let usage = sandbox_usage(paths, api.clone()).await?;
    let queue = open_queue(&paths.queue_dir).await?;
    let ledger = Arc::new(PurchaseLedger::new(api, config.external_call_timeout()));

    let coordinator = ExecutionCoordinator::new(config, usage, queue, ledger, Arc::new(LogNotifier))?;
    Ok(coordinator.drain(now).await)
}

/// Intents waiting in the queue
///
/// # Errors
/// Fails if the queue cannot be read
pub async fn queue_list(queue_dir: &Path) -> Result<Vec<QueuedIntent>> {
    let queue = open_queue(queue_dir).await?;
    queue.list().await.context("cannot list queue")
}

/// Dead-lettered messages
///
/// # Errors
/// Fails if the dead-letter directory cannot be read
pub async fn queue_dead_letters(queue_dir: &Path) -> Result<Vec<DeadLetter>> {
    let queue = open_queue(queue_dir).await?;
    queue.dead_letters().await.context("cannot list dead letters")
}

/// Withdraw a pending intent during review
///
/// # Errors
/// Fails if the queue cannot be updated
pub async fn queue_cancel(queue_dir: &Path, token: &str) -> Result<bool> {
    let queue = open_queue(queue_dir).await?;
    let token = IdempotencyToken::from_raw(token);
    let cancelled = queue.cancel(&token).await.context("cannot cancel intent")?;
    if cancelled {
        tracing::info!(token = token.short(), "intent cancelled");
    } else {
        tracing::warn!(token = token.short(), "no pending intent with that token");
    }
    Ok(cancelled)
}

/// Human-readable planning report
#[must_use]
pub fn render_planning(report: &PlanningReport) -> String {
    let mut out = String::new();
    let mode = if report.dry_run { "dry run" } else { "live" };
    let _ = writeln!(out, "Planning pass ({mode}) at {}", report.started_at.to_rfc3339());
    for category in &report.categories {
        let detail = match &category.outcome {
            PlanningOutcome::Emitted { intent } | PlanningOutcome::DryRun { intent } => format!(
                "{:.3}/h {} {} (coverage {:.1}% -> target {:.1}%) token {}",
                intent.hourly_commitment,
                intent.term,
                intent.payment_option,
                intent.coverage_at_creation,
                intent.target_percent,
                intent.idempotency_token.short()
            ),
            PlanningOutcome::NoAction { coverage_percent, target_percent, reason } => format!(
                "coverage {coverage_percent:.1}%, target {target_percent:.1}% ({})",
                reason.as_str()
            ),
            PlanningOutcome::SkippedInsufficientData { available_days, required_days } => {
                format!("{available_days} of {required_days} days of data")
            }
            PlanningOutcome::Failed { phase, error, retryable } => {
                format!("in {phase}: {error}{}", if *retryable { " (retryable)" } else { "" })
            }
        };
        let _ = writeln!(out, "  {:<16} {:<26} {detail}", category.category_id.as_str(), category.outcome.label());
    }
    out
}

/// Human-readable drain summary
#[must_use]
pub fn render_drain(summary: &DrainSummary) -> String {
    let mut out = String::new();
    let counts = summary.counts();
    let _ = writeln!(
        out,
        "Drain: {} purchased, {} over cap, {} stale, {} failed, {} undecodable",
        counts.purchased, counts.skipped_cap_exceeded, counts.skipped_stale, counts.failed, summary.undecodable
    );
    for result in &summary.results {
        let detail = match &result.outcome {
            ExecutionOutcome::Purchased { plan_id, replayed } => {
                format!("{plan_id}{}", if *replayed { " (replayed)" } else { "" })
            }
            ExecutionOutcome::SkippedCapExceeded { projected_percent, cap_percent } => {
                format!("projected {projected_percent:.1}% > cap {cap_percent:.1}%")
            }
            ExecutionOutcome::SkippedStale { age_hours } => format!("{age_hours}h old"),
            ExecutionOutcome::Failed { error, dead_lettered, .. } => {
                format!("{error}{}", if *dead_lettered { " (dead-lettered)" } else { "" })
            }
        };
        let _ = writeln!(
            out,
            "  {:<16} {:<10.3} {:<22} {detail}",
            result.category_id.as_str(),
            result.hourly_commitment,
            result.outcome.label()
        );
    }
    if let Some(reason) = &summary.interrupted {
        let _ = writeln!(out, "  interrupted: {reason}");
    }
    out
}

/// Human-readable queue listing
#[must_use]
pub fn render_queue(entries: &[QueuedIntent]) -> String {
    if entries.is_empty() {
        return "Queue is empty\n".to_string();
    }
    let mut out = String::new();
    for entry in entries {
        let intent = &entry.intent;
        let _ = writeln!(
            out,
            "{}  {:<16} {:.3}/h {} {}  created {}  received {}x",
            intent.idempotency_token,
            intent.category_id.as_str(),
            intent.hourly_commitment,
            intent.term,
            intent.payment_option,
            intent.created_at.to_rfc3339(),
            entry.receive_count
        );
    }
    out
}
