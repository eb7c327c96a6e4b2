//! Sandbox plan / review / execute round trip

use chrono::{Duration, Utc};
use pretty_assertions::assert_eq;
use spa_cli::commands;
use spa_cli::{FileLedger, SandboxPaths};
use spa_core::{FileQueue, IntentQueue, PlanningOutcome};
use spa_model::{CategoryId, ExecutionOutcome};
use std::path::Path;

const CONFIG: &str = r#"
dry_run = false
review_window_days = 3
stale_grace_days = 2

[defaults]
target = { kind = "fixed", coverage_percent = 80 }
split = { kind = "linear", step_percent = 10 }
max_coverage_cap = 95
max_purchase_percent = 100

[[categories]]
id = "compute"

[[categories]]
id = "database"
"#;

const FIXTURE: &str = r#"{
    "categories": {
        "compute": {
            "on_demand_rate": 50.0,
            "commitments": [
                {"plan_id": "sp-seed", "hourly_commitment": 50.0, "expires_at": "2099-01-01T00:00:00Z"}
            ],
            "daily_spend": [2400.0, 2400.0, 2400.0, 2400.0, 2400.0, 2400.0, 2400.0,
                            2400.0, 2400.0, 2400.0, 2400.0, 2400.0, 2400.0, 2400.0]
        },
        "database": {
            "on_demand_rate": 20.0,
            "daily_spend": [480.0, 480.0]
        }
    }
}"#;

/// One-shot to 90% under a 95% cap: a single purchase lands within 5 points of the cap
const NEAR_CAP_CONFIG: &str = r#"
dry_run = false

[defaults]
target = { kind = "fixed", coverage_percent = 90 }
split = { kind = "one_shot" }
max_coverage_cap = 95
max_purchase_percent = 100

[[categories]]
id = "compute"
"#;

fn sandbox(dir: &Path) -> SandboxPaths {
    sandbox_with(dir, CONFIG)
}

fn sandbox_with(dir: &Path, config: &str) -> SandboxPaths {
    std::fs::write(dir.join("spa.toml"), config).unwrap();
    std::fs::write(dir.join("fixture.json"), FIXTURE).unwrap();
    SandboxPaths {
        config: dir.join("spa.toml"),
        fixture: dir.join("fixture.json"),
        queue_dir: dir.join("queue"),
        ledger: dir.join("ledger.json"),
    }
}

#[tokio::test]
async fn plan_then_execute_buys_through_the_ledger() {
    let dir = tempfile::tempdir().unwrap();
    let paths = sandbox(dir.path());
    let planned_at = Utc::now();

    let report = commands::plan(&paths, None, planned_at).await.unwrap();
    assert!(!report.dry_run);
    assert_eq!(report.count("emitted"), 1);
    assert!(matches!(
        report.for_category(&CategoryId::parse("database").unwrap()).unwrap().outcome,
        PlanningOutcome::SkippedInsufficientData { available_days: 2, required_days: 14 }
    ));

    let queued = commands::queue_list(&paths.queue_dir).await.unwrap();
    assert_eq!(queued.len(), 1);
    assert!((queued[0].intent.hourly_commitment - 10.0).abs() < 1e-9);
    assert!(commands::render_queue(&queued).contains("compute"));

    let summary = commands::execute(&paths, planned_at + Duration::hours(1)).await.unwrap();
    assert_eq!(summary.counts().purchased, 1);
    assert!(commands::queue_list(&paths.queue_dir).await.unwrap().is_empty());

    let records = FileLedger::new(&paths.ledger).records().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].token, queued[0].intent.idempotency_token);

    // The purchase now counts toward coverage: next plan steps from 60%
    let next = commands::plan(&paths, None, planned_at + Duration::days(1)).await.unwrap();
    let intent = next.emitted().next().unwrap();
    assert!((intent.coverage_at_creation - 60.0).abs() < 1e-6);
}

#[tokio::test]
async fn republished_token_is_not_bought_twice() {
    let dir = tempfile::tempdir().unwrap();
    let paths = sandbox(dir.path());
    let planned_at = Utc::now();

    commands::plan(&paths, None, planned_at).await.unwrap();
    let queued = commands::queue_list(&paths.queue_dir).await.unwrap();
    commands::execute(&paths, planned_at).await.unwrap();

    // A separate process that missed the delete would see the same intent again
    let intent = queued[0].intent.clone();
    let queue = FileQueue::open(&paths.queue_dir).await.unwrap();
    queue.publish(&intent).await.unwrap();

    let summary = commands::execute(&paths, planned_at).await.unwrap();
    assert!(matches!(
        summary.results[0].outcome,
        ExecutionOutcome::Purchased { replayed: true, .. }
    ));
    assert_eq!(FileLedger::new(&paths.ledger).records().await.unwrap().len(), 1);
}

#[tokio::test]
async fn near_cap_purchase_replays_in_a_later_run() {
    let dir = tempfile::tempdir().unwrap();
    let paths = sandbox_with(dir.path(), NEAR_CAP_CONFIG);
    let planned_at = Utc::now();

    commands::plan(&paths, None, planned_at).await.unwrap();
    let queued = commands::queue_list(&paths.queue_dir).await.unwrap();
    assert!((queued[0].intent.hourly_commitment - 40.0).abs() < 1e-9);

    let first = commands::execute(&paths, planned_at).await.unwrap();
    let ExecutionOutcome::Purchased { plan_id, replayed: false } = &first.results[0].outcome else {
        panic!("unexpected outcome {:?}", first.results[0].outcome);
    };

    // Coverage is now 90%; counting the same 40/h again would project 130%
    let queue = FileQueue::open(&paths.queue_dir).await.unwrap();
    queue.publish(&queued[0].intent).await.unwrap();
    let second = commands::execute(&paths, planned_at).await.unwrap();

    assert_eq!(
        second.results[0].outcome,
        ExecutionOutcome::Purchased { plan_id: plan_id.clone(), replayed: true }
    );
    assert_eq!(FileLedger::new(&paths.ledger).records().await.unwrap().len(), 1);
    assert!(commands::queue_list(&paths.queue_dir).await.unwrap().is_empty());
}

#[tokio::test]
async fn dry_run_override_leaves_queue_empty() {
    let dir = tempfile::tempdir().unwrap();
    let paths = sandbox(dir.path());

    let report = commands::plan(&paths, Some(true), Utc::now()).await.unwrap();
    assert!(report.dry_run);
    assert_eq!(report.count("dry_run"), 1);
    assert!(commands::render_planning(&report).contains("dry run"));
    assert!(commands::queue_list(&paths.queue_dir).await.unwrap().is_empty());
}

#[tokio::test]
async fn cancelled_intent_is_not_executed() {
    let dir = tempfile::tempdir().unwrap();
    let paths = sandbox(dir.path());
    let planned_at = Utc::now();

    commands::plan(&paths, None, planned_at).await.unwrap();
    let token = commands::queue_list(&paths.queue_dir).await.unwrap()[0]
        .intent
        .idempotency_token
        .clone();

    assert!(commands::queue_cancel(&paths.queue_dir, token.as_str()).await.unwrap());
    assert!(!commands::queue_cancel(&paths.queue_dir, token.as_str()).await.unwrap());

    let summary = commands::execute(&paths, planned_at).await.unwrap();
    assert!(summary.results.is_empty());
    assert!(FileLedger::new(&paths.ledger).records().await.unwrap().is_empty());
}

#[test]
fn invalid_configuration_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.toml");
    std::fs::write(&path, "[[categories]]\nid = \"compute\"\nterm = \"five_year\"\n").unwrap();

    let err = commands::validate(&path).unwrap_err();
    assert!(format!("{err:#}").contains("invalid configuration"));
}
