//! Durable-store behavior over real SQLite files.

#![cfg(feature = "sqlite")]

use tempfile::TempDir;

use curricle::checkpoint::{Checkpoint, CheckpointStore};
use curricle::checkpoint_sqlite::SqliteCheckpointStore;
use curricle::registry::{NewTask, TaskRegistry};
use curricle::registry_sqlite::SqliteRegistry;
use curricle::state::WorkflowState;
use curricle::types::{ContentType, EditSource, NodeId, TaskStatus, WorkUnitStatus};

fn db_url(dir: &TempDir, name: &str) -> String {
    format!("sqlite://{}/{name}", dir.path().display())
}

#[tokio::test]
async fn checkpoint_rows_roundtrip_and_latest_wins() {
    let dir = TempDir::new().unwrap();
    let store = SqliteCheckpointStore::connect(&db_url(&dir, "cp.db"))
        .await
        .unwrap();

    let mut state = WorkflowState::new("learn sqlite");
    store
        .save(Checkpoint::new("t1", NodeId::Analyze, state.clone()))
        .await
        .unwrap();
    state.validation_round = 3;
    state.edit_source = Some(EditSource::HumanReview);
    store
        .save(Checkpoint::new("t1", NodeId::Review, state))
        .await
        .unwrap();

    let latest = store.load_latest("t1").await.unwrap().unwrap();
    assert_eq!(latest.node, NodeId::Review);
    assert_eq!(latest.state.validation_round, 3);
    assert_eq!(latest.state.edit_source, Some(EditSource::HumanReview));
    assert_eq!(store.history("t1").await.unwrap().len(), 2);
    assert!(store.load_latest("missing").await.unwrap().is_none());
}

#[tokio::test]
async fn guarded_updates_hold_over_sqlite() {
    let dir = TempDir::new().unwrap();
    let registry = SqliteRegistry::connect(&db_url(&dir, "reg.db"))
        .await
        .unwrap();

    let task = registry
        .create_task(NewTask::creation("roadmap-1"))
        .await
        .unwrap();
    assert!(registry
        .transition_task(&task.task_id, &[TaskStatus::Pending], TaskStatus::Processing)
        .await
        .unwrap());
    assert!(!registry
        .transition_task(&task.task_id, &[TaskStatus::Pending], TaskStatus::Processing)
        .await
        .unwrap());

    let unit = registry
        .create_work_unit(&task.task_id, "roadmap-1", "c1", ContentType::Tutorial)
        .await
        .unwrap();
    // Duplicate active pair refused.
    assert!(registry
        .create_work_unit(&task.task_id, "roadmap-1", "c1", ContentType::Tutorial)
        .await
        .is_err());

    // Claim is single-winner; completion replay is a no-op.
    assert!(registry.claim_work_unit(&unit.unit_id).await.unwrap());
    assert!(!registry.claim_work_unit(&unit.unit_id).await.unwrap());
    assert!(registry.complete_work_unit(&unit.unit_id).await.unwrap());
    assert!(!registry.complete_work_unit(&unit.unit_id).await.unwrap());

    // All units resolved: exactly one finalizer wins.
    let first = registry.finalize_if_resolved(&task.task_id).await.unwrap();
    let second = registry.finalize_if_resolved(&task.task_id).await.unwrap();
    assert_eq!(first, Some(TaskStatus::Completed));
    assert_eq!(second, None);

    let stored = registry
        .get_work_unit(&unit.unit_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, WorkUnitStatus::Completed);
}

#[tokio::test]
async fn feedback_and_edit_plans_roundtrip() {
    let dir = TempDir::new().unwrap();
    let registry = SqliteRegistry::connect(&db_url(&dir, "rows.db"))
        .await
        .unwrap();
    let task = registry
        .create_task(NewTask::creation("roadmap-1"))
        .await
        .unwrap();

    let feedback = registry
        .create_review_feedback(&task.task_id, 2, false, Some("too broad".into()), 1)
        .await
        .unwrap();
    let plan = registry
        .create_edit_plan(
            &task.task_id,
            Some(feedback.feedback_id.clone()),
            vec![curricle::state::EditIntent::Remove {
                concept_id: "c9".into(),
            }],
            0.8,
            false,
        )
        .await
        .unwrap();

    let feedback_rows = registry
        .review_feedback_for_task(&task.task_id)
        .await
        .unwrap();
    assert_eq!(feedback_rows.len(), 1);
    assert!(!feedback_rows[0].approved);
    assert_eq!(feedback_rows[0].roadmap_version_snapshot, 2);

    let plans = registry.edit_plans_for_task(&task.task_id).await.unwrap();
    assert_eq!(plans.len(), 1);
    assert_eq!(plans[0].plan_id, plan.plan_id);
    assert_eq!(
        plans[0].feedback_id.as_deref(),
        Some(feedback.feedback_id.as_str())
    );
    assert_eq!(plans[0].intents.len(), 1);
}
