//! Full graph traversal: happy path, the validation edit loop, and node
//! failure after an exhausted retry budget.

mod common;

use common::{ScriptedAgent, harness};
use curricle::bus::ProgressKind;
use curricle::engine::AdvanceOutcome;
use curricle::review::ReviewDecision;
use curricle::types::{NodeId, TaskStatus, WorkUnitStatus};

#[tokio::test]
async fn happy_path_runs_to_completion() {
    let h = harness(ScriptedAgent::new(&["c1", "c2"]));
    let task = h.engine.create_task("roadmap-1", "learn rust").await.unwrap();

    // Analyze -> Design -> Validate(pass) -> suspended at the review gate.
    let outcome = h.engine.run_to_suspension(&task.task_id).await.unwrap();
    assert_eq!(outcome, AdvanceOutcome::Suspended);
    let row = h.registry.get_task(&task.task_id).await.unwrap().unwrap();
    assert_eq!(row.status, TaskStatus::HumanReviewPending);
    assert_eq!(row.current_step, "review");

    // Approval dispatches one unit per (concept, content_type).
    let outcome = h
        .gate
        .approve(&task.task_id, ReviewDecision::approve())
        .await
        .unwrap();
    assert_eq!(outcome, AdvanceOutcome::Dispatched { units: 6 });
    let row = h.registry.get_task(&task.task_id).await.unwrap().unwrap();
    assert_eq!(row.status, TaskStatus::Processing);
    assert_eq!(row.current_step, "content_generation_queued");

    h.drain_queue().await;

    let row = h.registry.get_task(&task.task_id).await.unwrap().unwrap();
    assert_eq!(row.status, TaskStatus::Completed);
    let units = h.registry.work_units_for_task(&task.task_id).await.unwrap();
    assert_eq!(units.len(), 6);
    assert!(units.iter().all(|u| u.status == WorkUnitStatus::Completed));

    // A late subscriber reconstructs the full story, terminal event last.
    let (history, _stream) = h
        .bus
        .subscribe_with_history(&task.task_id, h.registry.as_ref())
        .await
        .unwrap();
    assert_eq!(history.last().unwrap().kind, ProgressKind::Completed);
}

#[tokio::test]
async fn completed_task_has_no_unresolved_units() {
    let h = harness(ScriptedAgent::new(&["c1", "c2", "c3"]));
    let task = h.engine.create_task("roadmap-1", "goal").await.unwrap();
    h.engine.run_to_suspension(&task.task_id).await.unwrap();
    h.gate
        .approve(&task.task_id, ReviewDecision::approve())
        .await
        .unwrap();
    h.drain_queue().await;

    let row = h.registry.get_task(&task.task_id).await.unwrap().unwrap();
    assert_eq!(row.status, TaskStatus::Completed);
    let units = h.registry.work_units_for_task(&task.task_id).await.unwrap();
    assert!(units.iter().all(|u| u.status.is_resolved()));
}

#[tokio::test]
async fn validation_failure_loops_through_edit_and_back() {
    let agent = ScriptedAgent::new(&["c1", "c2"]);
    agent.fail_validation(1);
    let h = harness(agent);
    let task = h.engine.create_task("roadmap-1", "goal").await.unwrap();

    let outcome = h.engine.run_to_suspension(&task.task_id).await.unwrap();
    assert_eq!(outcome, AdvanceOutcome::Suspended);

    // The loop ran: validate(fail) -> plan -> edit -> validate(pass).
    let checkpoint = h
        .checkpoints
        .load_latest(&task.task_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(checkpoint.node, NodeId::Review);
    assert_eq!(checkpoint.state.validation_round, 2);
    assert_eq!(checkpoint.state.modification_count, 1);
    // The router consumed the tag when the second validation passed.
    assert_eq!(checkpoint.state.edit_source, None);
    assert!(checkpoint.state.validation_report.as_ref().unwrap().passed);

    // The validation branch records a plan without feedback linkage.
    let plans = h.registry.edit_plans_for_task(&task.task_id).await.unwrap();
    assert_eq!(plans.len(), 1);
    assert_eq!(plans[0].feedback_id, None);
}

#[tokio::test]
async fn exhausted_node_retries_fail_the_task() {
    let agent = ScriptedAgent::new(&["c1"]);
    agent.always_fail("analyze_goal");
    let h = harness(agent);
    let task = h.engine.create_task("roadmap-1", "goal").await.unwrap();

    let outcome = h.engine.run_to_suspension(&task.task_id).await.unwrap();
    assert_eq!(outcome, AdvanceOutcome::Terminal(TaskStatus::Failed));

    let row = h.registry.get_task(&task.task_id).await.unwrap().unwrap();
    assert_eq!(row.status, TaskStatus::Failed);
    assert!(row.error_message.unwrap().contains("non-conforming"));

    // The last good checkpoint (creation) survives the failure.
    let checkpoint = h
        .checkpoints
        .load_latest(&task.task_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(checkpoint.node, NodeId::Analyze);
}
