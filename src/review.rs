//! The human-review gate: a suspend/resume boundary, not a blocking call.
//!
//! Entering REVIEW persists a checkpoint and flips the task to
//! `human_review_pending`, then returns control — no thread or coroutine
//! stays open across the wait. This module is the resume side: an external
//! decision re-enters the graph through the engine, and the status-guarded
//! flip guarantees at most one resume wins per suspension.

use std::sync::Arc;

use crate::engine::{AdvanceOutcome, EngineError, WorkflowEngine};

/// An external review decision.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReviewDecision {
    pub approved: bool,
    pub feedback: Option<String>,
}

impl ReviewDecision {
    pub fn approve() -> Self {
        Self {
            approved: true,
            feedback: None,
        }
    }

    pub fn reject(feedback: impl Into<String>) -> Self {
        Self {
            approved: false,
            feedback: Some(feedback.into()),
        }
    }
}

/// Public resume surface for suspended tasks.
pub struct HumanReviewGate {
    engine: Arc<WorkflowEngine>,
}

impl HumanReviewGate {
    pub fn new(engine: Arc<WorkflowEngine>) -> Self {
        Self { engine }
    }

    /// Apply a review decision to a suspended task.
    ///
    /// On approval the framework is dispatched to the content workers and
    /// the graph portion ends. On rejection a `ReviewFeedback` row is
    /// recorded, `edit_source` is set to `human_review`, and the task is
    /// positioned at the review-edit-plan node; drive it onward with
    /// [`WorkflowEngine::run_to_suspension`]. A second decision for the same
    /// suspension fails with [`EngineError::NotAwaitingReview`].
    pub async fn approve(
        &self,
        task_id: &str,
        decision: ReviewDecision,
    ) -> Result<AdvanceOutcome, EngineError> {
        self.engine
            .resume_review(task_id, decision.approved, decision.feedback)
            .await
    }
}
