//! Stale-task reconciliation: dead workers are detected and repaired,
//! live ones are left alone.

mod common;

use std::time::Duration;

use common::{ScriptedAgent, harness_with, test_config};
use curricle::review::ReviewDecision;
use curricle::types::{TaskStatus, WorkUnitStatus};

#[tokio::test]
async fn crashed_worker_is_reconciled_and_siblings_survive() {
    // Zero grace: anything without a heartbeat is immediately suspect.
    let h = harness_with(
        ScriptedAgent::new(&["c1", "c2"]),
        test_config().with_stale_grace(Duration::ZERO),
    );
    let task = h.engine.create_task("roadmap-1", "goal").await.unwrap();
    h.engine.run_to_suspension(&task.task_id).await.unwrap();
    h.gate
        .approve(&task.task_id, ReviewDecision::approve())
        .await
        .unwrap();

    // Simulate workers by hand: two units complete, one crashes
    // mid-generation (claimed, no heartbeat), the rest never start.
    let units = h.registry.work_units_for_task(&task.task_id).await.unwrap();
    for unit in &units[0..2] {
        h.registry.claim_work_unit(&unit.unit_id).await.unwrap();
        h.registry.complete_work_unit(&unit.unit_id).await.unwrap();
    }
    h.registry.claim_work_unit(&units[2].unit_id).await.unwrap();

    let report = h.reconciler.check_task(&task.task_id).await.unwrap();

    // Everything stuck was failed; completed siblings are untouched.
    let after = h.registry.work_units_for_task(&task.task_id).await.unwrap();
    assert_eq!(
        after
            .iter()
            .filter(|u| u.status == WorkUnitStatus::Completed)
            .count(),
        2
    );
    assert!(after
        .iter()
        .filter(|u| u.status != WorkUnitStatus::Completed)
        .all(|u| u.status == WorkUnitStatus::Failed));

    // The aggregate resolved through the same single-winner protocol.
    let row = h.registry.get_task(&task.task_id).await.unwrap().unwrap();
    assert_eq!(row.status, TaskStatus::PartialFailure);

    // Stale concepts are authoritative even with no active task left.
    assert!(!report.has_active_task);
    assert!(!report.stale_concepts.is_empty());

    // Retrying a stale pair creates a fresh unit; completed rows persist.
    let stale = &report.stale_concepts[0];
    let (_, retry_unit) = h
        .dispatcher
        .retry_content(&stale.concept_id, stale.content_type)
        .await
        .unwrap();
    assert_eq!(retry_unit.status, WorkUnitStatus::Pending);
    let preserved = h.registry.work_units_for_task(&task.task_id).await.unwrap();
    assert_eq!(
        preserved
            .iter()
            .filter(|u| u.status == WorkUnitStatus::Completed)
            .count(),
        2
    );
}

#[tokio::test]
async fn heartbeats_protect_active_units() {
    let h = harness_with(
        ScriptedAgent::new(&["c1"]),
        test_config().with_stale_grace(Duration::ZERO),
    );
    let task = h.engine.create_task("roadmap-1", "goal").await.unwrap();
    h.engine.run_to_suspension(&task.task_id).await.unwrap();
    h.gate
        .approve(&task.task_id, ReviewDecision::approve())
        .await
        .unwrap();

    let units = h.registry.work_units_for_task(&task.task_id).await.unwrap();
    h.registry.claim_work_unit(&units[0].unit_id).await.unwrap();
    h.liveness.beat_unit(&units[0].unit_id, &task.task_id);

    // Under a sane grace window a beating worker is never touched.
    let conservative = curricle::reconcile::StaleTaskReconciler::new(
        h.registry.clone(),
        h.checkpoints.clone(),
        h.liveness.clone(),
        h.bus.clone(),
        Duration::from_secs(60),
    );
    conservative.sweep().await.unwrap();

    let unit = h
        .registry
        .get_work_unit(&units[0].unit_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(unit.status, WorkUnitStatus::Generating);
    let row = h.registry.get_task(&task.task_id).await.unwrap().unwrap();
    assert_eq!(row.status, TaskStatus::Processing);
}

#[tokio::test]
async fn waiting_on_review_is_not_staleness() {
    let h = harness_with(
        ScriptedAgent::new(&["c1"]),
        test_config().with_stale_grace(Duration::ZERO),
    );
    let task = h.engine.create_task("roadmap-1", "goal").await.unwrap();
    h.engine.run_to_suspension(&task.task_id).await.unwrap();

    // Suspended with an intact review checkpoint: the human is just slow.
    h.reconciler.sweep().await.unwrap();
    let row = h.registry.get_task(&task.task_id).await.unwrap().unwrap();
    assert_eq!(row.status, TaskStatus::HumanReviewPending);
}

#[tokio::test]
async fn dead_graph_execution_is_failed() {
    let h = harness_with(
        ScriptedAgent::new(&["c1"]),
        test_config().with_stale_grace(Duration::ZERO),
    );
    // A task that claims to be processing but has no units, no heartbeat,
    // and no progress: the node execution died between checkpoints.
    let task = h.engine.create_task("roadmap-1", "goal").await.unwrap();
    h.registry
        .transition_task(&task.task_id, &[TaskStatus::Pending], TaskStatus::Processing)
        .await
        .unwrap();

    let report = h.reconciler.check_task(&task.task_id).await.unwrap();
    assert!(!report.has_active_task);

    let row = h.registry.get_task(&task.task_id).await.unwrap().unwrap();
    assert_eq!(row.status, TaskStatus::Failed);
    assert!(row.error_message.unwrap().starts_with("stale:"));
}
