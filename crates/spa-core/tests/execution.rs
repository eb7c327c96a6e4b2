//! Drain and execution integration tests

use chrono::Duration;
use pretty_assertions::assert_eq;
use spa_core::{
    AutopilotConfig, ExecutionCoordinator, ExternalError, InMemoryQueue, IntentQueue, PurchaseLedger,
};
use spa_model::{ExecutionOutcome, PurchaseIntent, UsageFigures};
use spa_test_utils::*;
use std::sync::Arc;
use std::time::Duration as StdDuration;

struct Harness {
    usage: Arc<FakeUsageSource>,
    api: Arc<FakePurchaseApi>,
    ledger: Arc<PurchaseLedger>,
    queue: Arc<InMemoryQueue>,
    notifier: Arc<RecordingNotifier>,
}

impl Harness {
    fn new(usage: FakeUsageSource) -> Self {
        Self::with_queue(usage, InMemoryQueue::new())
    }

    fn with_queue(usage: FakeUsageSource, queue: InMemoryQueue) -> Self {
        let api = Arc::new(FakePurchaseApi::new());
        Self::assemble(Arc::new(usage), api, queue)
    }

    fn linked(usage: FakeUsageSource) -> Self {
        let usage = Arc::new(usage);
        let api = Arc::new(FakePurchaseApi::linked(usage.clone()));
        Self::assemble(usage, api, InMemoryQueue::new())
    }

    fn assemble(usage: Arc<FakeUsageSource>, api: Arc<FakePurchaseApi>, queue: InMemoryQueue) -> Self {
        let ledger = Arc::new(PurchaseLedger::new(api.clone(), StdDuration::from_secs(30)));
        Self {
            usage,
            api,
            ledger,
            queue: Arc::new(queue),
            notifier: Arc::new(RecordingNotifier::new()),
        }
    }

    fn coordinator(&self, config: AutopilotConfig) -> ExecutionCoordinator {
        ExecutionCoordinator::new(
            Arc::new(config),
            self.usage.clone(),
            self.queue.clone(),
            self.ledger.clone(),
            self.notifier.clone(),
        )
        .unwrap()
    }

    async fn enqueue(&self, intent: &PurchaseIntent) {
        self.queue.publish(intent).await.unwrap();
    }
}

fn half_covered() -> FakeUsageSource {
    FakeUsageSource::new().with("compute", usage_with_coverage(100.0, 50.0, 30))
}

fn fresh_intent(amount: f64) -> PurchaseIntent {
    intent_at("compute", amount, 50.0, fixed_now() - Duration::days(3))
}

#[tokio::test]
async fn valid_intent_is_purchased_and_deleted() {
    let harness = Harness::new(half_covered());
    let intent = fresh_intent(10.0);
    harness.enqueue(&intent).await;

    let summary = harness.coordinator(live_config(&["compute"])).drain(fixed_now()).await;

    assert_eq!(summary.results.len(), 1);
    assert_eq!(
        summary.results[0].outcome,
        ExecutionOutcome::Purchased { plan_id: "sp-0000".to_string(), replayed: false }
    );
    assert_eq!(harness.api.calls_for(&intent.idempotency_token), 1);
    assert!(harness.queue.is_empty());
    assert!(summary.is_clean());
    assert_eq!(harness.notifier.drains().len(), 1);
}

#[tokio::test]
async fn stale_intent_is_skipped_without_purchase() {
    let harness = Harness::new(half_covered());
    harness
        .enqueue(&intent_at("compute", 10.0, 50.0, fixed_now() - Duration::days(10)))
        .await;

    let mut config = live_config(&["compute"]);
    config.review_window_days = 3;
    config.stale_grace_days = 2;
    let summary = harness.coordinator(config).drain(fixed_now()).await;

    assert_eq!(summary.results[0].outcome, ExecutionOutcome::SkippedStale { age_hours: 240 });
    assert_eq!(harness.api.calls(), 0);
    assert_eq!(harness.usage.calls(), 0);
    assert!(harness.queue.is_empty());
    assert_eq!(summary.counts().skipped_stale, 1);
}

#[tokio::test]
async fn cap_is_rechecked_against_fresh_coverage() {
    // Planned at 85%, coverage has since grown to 87%
    let harness = Harness::new(FakeUsageSource::new().with("compute", usage_with_coverage(100.0, 87.0, 30)));
    harness
        .enqueue(&intent_at("compute", 10.0, 85.0, fixed_now() - Duration::days(3)))
        .await;

    let summary = harness.coordinator(live_config(&["compute"])).drain(fixed_now()).await;

    match summary.results[0].outcome {
        ExecutionOutcome::SkippedCapExceeded { projected_percent, cap_percent } => {
            assert!((projected_percent - 97.0).abs() < 1e-6);
            assert_eq!(cap_percent, 95.0);
        }
        ref other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(harness.api.calls(), 0);
    assert!(harness.queue.is_empty());
}

#[tokio::test]
async fn vanished_spend_exceeds_any_cap() {
    let idle = UsageFigures::new(0.0).with_daily_spend(vec![0.0; 30]);
    let harness = Harness::new(FakeUsageSource::new().with("compute", idle));
    harness.enqueue(&fresh_intent(10.0)).await;

    let summary = harness.coordinator(live_config(&["compute"])).drain(fixed_now()).await;

    match summary.results[0].outcome {
        ExecutionOutcome::SkippedCapExceeded { projected_percent, cap_percent } => {
            assert!(projected_percent.is_infinite());
            assert_eq!(cap_percent, 95.0);
        }
        ref other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(harness.api.calls(), 0);
    assert!(harness.queue.is_empty());
}

#[tokio::test]
async fn redelivery_after_restart_replays_the_earlier_purchase() {
    // 50% covered; the intent alone takes the category to 90%, under the 95% cap
    let harness = Harness::linked(half_covered());
    let intent = intent_at("compute", 40.0, 50.0, fixed_now() - Duration::days(3));
    harness.enqueue(&intent).await;

    let first = harness.coordinator(live_config(&["compute"])).drain(fixed_now()).await;
    assert_eq!(
        first.results[0].outcome,
        ExecutionOutcome::Purchased { plan_id: "sp-0000".to_string(), replayed: false }
    );

    // The delete was lost; the message reaches a process whose ledger is empty
    // while fresh coverage (90%) already includes the purchase
    harness.enqueue(&intent).await;
    let restarted = ExecutionCoordinator::new(
        Arc::new(live_config(&["compute"])),
        harness.usage.clone(),
        harness.queue.clone(),
        Arc::new(PurchaseLedger::new(harness.api.clone(), StdDuration::from_secs(30))),
        harness.notifier.clone(),
    )
    .unwrap();
    let second = restarted.drain(fixed_now()).await;

    assert_eq!(
        second.results[0].outcome,
        ExecutionOutcome::Purchased { plan_id: "sp-0000".to_string(), replayed: true }
    );
    assert_eq!(harness.api.calls(), 1);
    assert_eq!(harness.api.lookups(), 2);
    assert!(harness.queue.is_empty());
}

#[tokio::test]
async fn cap_in_force_at_execution_wins() {
    let harness = Harness::new(half_covered());
    // Planned under a 95% cap, since lowered to 55%
    harness.enqueue(&fresh_intent(10.0)).await;

    let mut config = live_config(&["compute"]);
    config.defaults.max_coverage_cap = 55.0;
    let summary = harness.coordinator(config).drain(fixed_now()).await;

    assert!(matches!(
        summary.results[0].outcome,
        ExecutionOutcome::SkippedCapExceeded { cap_percent, .. } if cap_percent == 55.0
    ));
}

#[tokio::test]
async fn duplicate_message_buys_once() {
    let harness = Harness::new(half_covered());
    let intent = fresh_intent(10.0);
    harness.enqueue(&intent).await;
    harness.enqueue(&intent).await;

    let summary = harness.coordinator(live_config(&["compute"])).drain(fixed_now()).await;

    assert_eq!(harness.api.calls_for(&intent.idempotency_token), 1);
    let outcomes: Vec<_> = summary.for_token(&intent.idempotency_token).map(|r| &r.outcome).collect();
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes.iter().all(|o| matches!(o, ExecutionOutcome::Purchased { plan_id, .. } if plan_id == "sp-0000")));
    assert_eq!(
        outcomes.iter().filter(|o| matches!(o, ExecutionOutcome::Purchased { replayed: true, .. })).count(),
        1
    );
    assert!(harness.queue.is_empty());
}

#[tokio::test(start_paused = true)]
async fn concurrent_drains_share_one_purchase() {
    let usage = Arc::new(half_covered());
    let api = Arc::new(FakePurchaseApi::new());
    api.set_delay(StdDuration::from_secs(2));
    let ledger = Arc::new(PurchaseLedger::new(api.clone(), StdDuration::from_secs(30)));
    let config = Arc::new(live_config(&["compute"]));
    let intent = fresh_intent(10.0);

    let coordinators: Vec<_> = (0..2)
        .map(|_| {
            let queue = Arc::new(InMemoryQueue::new());
            let coordinator = ExecutionCoordinator::new(
                config.clone(),
                usage.clone(),
                queue.clone(),
                ledger.clone(),
                Arc::new(RecordingNotifier::new()),
            )
            .unwrap();
            (queue, coordinator)
        })
        .collect();
    for (queue, _) in &coordinators {
        queue.publish(&intent).await.unwrap();
    }

    let (first, second) = tokio::join!(
        coordinators[0].1.drain(fixed_now()),
        coordinators[1].1.drain(fixed_now())
    );

    assert_eq!(api.calls_for(&intent.idempotency_token), 1);
    assert_eq!(first.counts().purchased + second.counts().purchased, 2);
    let replays = [&first, &second]
        .iter()
        .flat_map(|s| s.results.iter())
        .filter(|r| matches!(r.outcome, ExecutionOutcome::Purchased { replayed: true, .. }))
        .count();
    assert_eq!(replays, 1);
    assert_eq!(ledger.len(), 1);
}

#[tokio::test]
async fn transient_failure_is_retried_on_redelivery() {
    let harness = Harness::with_queue(half_covered(), InMemoryQueue::with_visibility_timeout(StdDuration::ZERO));
    harness.api.fail_next([ExternalError::transient("throttled")]);
    let intent = fresh_intent(10.0);
    harness.enqueue(&intent).await;

    let summary = harness.coordinator(live_config(&["compute"])).drain(fixed_now()).await;

    let outcomes: Vec<_> = summary.results.iter().map(|r| r.outcome.label()).collect();
    assert_eq!(outcomes, vec!["failed", "purchased"]);
    assert_eq!(
        summary.results[0].outcome,
        ExecutionOutcome::Failed {
            error: "transient failure in purchase: throttled".to_string(),
            retryable: true,
            dead_lettered: false
        }
    );
    assert_eq!(harness.api.calls_for(&intent.idempotency_token), 2);
    assert_eq!(harness.api.purchased().len(), 1);
    assert!(harness.queue.is_empty());
}

#[tokio::test]
async fn exhausted_retries_dead_letter() {
    let harness = Harness::with_queue(half_covered(), InMemoryQueue::with_visibility_timeout(StdDuration::ZERO));
    harness.api.fail_next((0..5).map(|_| ExternalError::transient("throttled")));
    harness.enqueue(&fresh_intent(10.0)).await;

    let mut config = live_config(&["compute"]);
    config.max_receive_count = 3;
    let summary = harness.coordinator(config).drain(fixed_now()).await;

    assert_eq!(summary.results.len(), 3);
    assert_eq!(
        summary.results[2].outcome,
        ExecutionOutcome::Failed {
            error: "transient failure in purchase: throttled".to_string(),
            retryable: true,
            dead_lettered: true
        }
    );
    assert_eq!(harness.api.calls(), 3);

    let dead = harness.queue.dead_letters().await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].receive_count, 3);
    assert!(dead[0].reason.contains("retries exhausted"));
    assert!(harness.queue.is_empty());
}

#[tokio::test(start_paused = true)]
async fn failed_message_reappears_after_visibility_timeout() {
    let harness = Harness::new(half_covered());
    harness.api.fail_next([ExternalError::transient("throttled")]);
    harness.enqueue(&fresh_intent(10.0)).await;
    let coordinator = harness.coordinator(live_config(&["compute"]));

    let first = coordinator.drain(fixed_now()).await;
    assert_eq!(first.counts().failed, 1);
    assert_eq!(harness.queue.in_flight(), 1);

    // Still hidden: nothing to do
    let idle = coordinator.drain(fixed_now()).await;
    assert!(idle.results.is_empty());

    tokio::time::advance(StdDuration::from_secs(301)).await;
    let second = coordinator.drain(fixed_now()).await;
    assert_eq!(second.counts().purchased, 1);
    assert!(harness.queue.is_empty());
}

#[tokio::test]
async fn permanent_rejection_dead_letters_immediately() {
    let harness = Harness::new(half_covered());
    harness.api.fail_next([ExternalError::permanent("commitment below provider minimum")]);
    harness.enqueue(&fresh_intent(10.0)).await;

    let summary = harness.coordinator(live_config(&["compute"])).drain(fixed_now()).await;

    assert!(matches!(
        summary.results[0].outcome,
        ExecutionOutcome::Failed { retryable: false, dead_lettered: true, .. }
    ));
    let dead = harness.queue.dead_letters().await.unwrap();
    assert_eq!(dead[0].receive_count, 1);
    assert!(dead[0].reason.contains("below provider minimum"));
}

#[tokio::test]
async fn undecodable_message_is_dead_lettered() {
    let harness = Harness::new(half_covered());
    harness.queue.publish_raw("{\"not\": \"an intent\"}");
    harness.enqueue(&fresh_intent(10.0)).await;

    let summary = harness.coordinator(live_config(&["compute"])).drain(fixed_now()).await;

    assert_eq!(summary.undecodable, 1);
    assert!(!summary.is_clean());
    assert_eq!(summary.counts().purchased, 1);
    assert_eq!(harness.queue.dead_letters().await.unwrap().len(), 1);
    assert!(harness.queue.is_empty());
}

#[tokio::test]
async fn cancelled_intent_is_never_executed() {
    let harness = Harness::new(half_covered());
    let intent = fresh_intent(10.0);
    harness.enqueue(&intent).await;

    assert!(harness.queue.cancel(&intent.idempotency_token).await.unwrap());
    let summary = harness.coordinator(live_config(&["compute"])).drain(fixed_now()).await;

    assert!(summary.results.is_empty());
    assert_eq!(harness.api.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn hung_usage_query_leaves_message_for_retry() {
    let usage = half_covered();
    usage.set_delay(StdDuration::from_secs(600));
    let harness = Harness::new(usage);
    harness.enqueue(&fresh_intent(10.0)).await;

    let mut config = live_config(&["compute"]);
    config.external_call_timeout_secs = 5;
    let summary = harness.coordinator(config).drain(fixed_now()).await;

    match &summary.results[0].outcome {
        ExecutionOutcome::Failed { error, retryable, dead_lettered } => {
            assert!(error.contains("timed out"));
            assert!(retryable);
            assert!(!dead_lettered);
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(harness.api.calls(), 0);
    assert_eq!(harness.queue.in_flight(), 1);
}

#[tokio::test]
async fn intent_for_removed_category_is_dead_lettered() {
    let harness = Harness::new(half_covered());
    harness
        .enqueue(&intent_at("legacy", 10.0, 50.0, fixed_now() - Duration::days(1)))
        .await;

    let summary = harness.coordinator(live_config(&["compute"])).drain(fixed_now()).await;

    assert!(matches!(
        summary.results[0].outcome,
        ExecutionOutcome::Failed { retryable: false, dead_lettered: true, .. }
    ));
    assert_eq!(harness.usage.calls(), 0);
}

#[tokio::test]
async fn insufficient_data_at_execution_is_permanent() {
    let harness = Harness::new(FakeUsageSource::new().with("compute", usage_with_coverage(100.0, 50.0, 3)));
    harness.enqueue(&fresh_intent(10.0)).await;

    let summary = harness.coordinator(live_config(&["compute"])).drain(fixed_now()).await;

    assert!(matches!(
        summary.results[0].outcome,
        ExecutionOutcome::Failed { retryable: false, dead_lettered: true, .. }
    ));
    assert_eq!(harness.api.calls(), 0);
}

#[tokio::test]
async fn same_category_intents_see_each_others_purchases() {
    let harness = Harness::linked(FakeUsageSource::new().with("compute", usage_with_coverage(100.0, 80.0, 30)));
    harness.enqueue(&intent_at("compute", 10.0, 80.0, fixed_now() - Duration::days(3))).await;
    harness.enqueue(&intent_at("compute", 8.0, 80.0, fixed_now() - Duration::days(3))).await;

    let summary = harness.coordinator(live_config(&["compute"])).drain(fixed_now()).await;

    let outcomes: Vec<_> = summary.results.iter().map(|r| r.outcome.label()).collect();
    assert_eq!(outcomes, vec!["purchased", "skipped-cap-exceeded"]);
    assert_eq!(harness.api.purchased().len(), 1);
}

#[tokio::test]
async fn categories_settle_independently() {
    let harness = Harness::new(
        FakeUsageSource::new()
            .with("compute", usage_with_coverage(100.0, 50.0, 30))
            .with("database", usage_with_coverage(100.0, 90.0, 30)),
    );
    harness.enqueue(&fresh_intent(10.0)).await;
    harness
        .enqueue(&intent_at("database", 10.0, 80.0, fixed_now() - Duration::days(1)))
        .await;

    let summary = harness
        .coordinator(live_config(&["compute", "database"]))
        .drain(fixed_now())
        .await;

    let counts = summary.counts();
    assert_eq!(counts.purchased, 1);
    assert_eq!(counts.skipped_cap_exceeded, 1);
    assert!(harness.queue.is_empty());
}
