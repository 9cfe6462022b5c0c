//! The human-review gate: rejection loops, feedback linkage, resume races,
//! and checkpoint-driven resume across engine restarts.

mod common;

use std::sync::Arc;

use common::{ScriptedAgent, harness};
use curricle::agents::Agent;
use curricle::engine::{AdvanceOutcome, EngineError, WorkflowEngine};
use curricle::nodes::standard_graph;
use curricle::review::{HumanReviewGate, ReviewDecision};
use curricle::types::{EditSource, NodeId, TaskStatus};

#[tokio::test]
async fn rejection_loops_back_to_review_not_validate() {
    let h = harness(ScriptedAgent::new(&["c1", "c2"]));
    let task = h.engine.create_task("roadmap-1", "goal").await.unwrap();
    h.engine.run_to_suspension(&task.task_id).await.unwrap();

    let outcome = h
        .gate
        .approve(&task.task_id, ReviewDecision::reject("needs more depth"))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        AdvanceOutcome::Advanced {
            ran: NodeId::Review,
            next: NodeId::ReviewEditPlan,
        }
    );

    // Plan -> edit -> back at REVIEW (not VALIDATE), suspended again.
    let outcome = h.engine.run_to_suspension(&task.task_id).await.unwrap();
    assert_eq!(outcome, AdvanceOutcome::Suspended);
    let checkpoint = h
        .checkpoints
        .load_latest(&task.task_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(checkpoint.node, NodeId::Review);
    assert_eq!(checkpoint.state.modification_count, 1);
    // The rejection round never re-entered validation.
    assert_eq!(checkpoint.state.validation_round, 1);
    assert_eq!(
        checkpoint.state.edit_source,
        Some(EditSource::HumanReview)
    );
}

#[tokio::test]
async fn edit_plan_references_the_feedback_row() {
    let h = harness(ScriptedAgent::new(&["c1"]));
    let task = h.engine.create_task("roadmap-1", "goal").await.unwrap();
    h.engine.run_to_suspension(&task.task_id).await.unwrap();

    h.gate
        .approve(&task.task_id, ReviewDecision::reject("tighten the scope"))
        .await
        .unwrap();
    h.engine.run_to_suspension(&task.task_id).await.unwrap();

    let feedback = h
        .registry
        .review_feedback_for_task(&task.task_id)
        .await
        .unwrap();
    assert_eq!(feedback.len(), 1);
    assert!(!feedback[0].approved);
    assert_eq!(feedback[0].review_round, 1);
    assert_eq!(feedback[0].feedback_text.as_deref(), Some("tighten the scope"));

    let plans = h.registry.edit_plans_for_task(&task.task_id).await.unwrap();
    assert_eq!(plans.len(), 1);
    assert_eq!(plans[0].feedback_id.as_deref(), Some(feedback[0].feedback_id.as_str()));
}

#[tokio::test]
async fn only_one_resume_wins_per_suspension() {
    let h = harness(ScriptedAgent::new(&["c1"]));
    let task = h.engine.create_task("roadmap-1", "goal").await.unwrap();
    h.engine.run_to_suspension(&task.task_id).await.unwrap();

    let first = h
        .gate
        .approve(&task.task_id, ReviewDecision::approve())
        .await
        .unwrap();
    assert!(matches!(first, AdvanceOutcome::Dispatched { .. }));

    let second = h
        .gate
        .approve(&task.task_id, ReviewDecision::approve())
        .await;
    assert!(matches!(
        second,
        Err(EngineError::NotAwaitingReview { .. })
    ));
}

#[tokio::test]
async fn resume_survives_an_engine_restart() {
    let h = harness(ScriptedAgent::new(&["c1", "c2"]));
    let task = h.engine.create_task("roadmap-1", "goal").await.unwrap();
    h.engine.run_to_suspension(&task.task_id).await.unwrap();

    // A fresh engine over the same stores: suspension is data, not memory.
    let graph = Arc::new(standard_graph(h.agent.clone() as Arc<dyn Agent>).unwrap());
    let restarted = Arc::new(WorkflowEngine::new(
        graph,
        h.registry.clone(),
        h.checkpoints.clone(),
        h.bus.clone(),
        h.dispatcher.clone(),
        h.liveness.clone(),
        common::test_config(),
    ));
    let gate = HumanReviewGate::new(restarted.clone());

    let outcome = gate
        .approve(&task.task_id, ReviewDecision::approve())
        .await
        .unwrap();
    assert_eq!(outcome, AdvanceOutcome::Dispatched { units: 6 });

    h.drain_queue().await;
    let row = h.registry.get_task(&task.task_id).await.unwrap().unwrap();
    assert_eq!(row.status, TaskStatus::Completed);
}
