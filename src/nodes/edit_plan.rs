use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use crate::agents::{Agent, AgentRequest, invoke_structured};
use crate::node::{NodeCtx, NodeError, NodeRunner};
use crate::state::{HistoryEntry, PendingEdit, StateDelta, WorkflowState};
use crate::types::{EditSource, NodeId};

use super::EditPlanOutput;

/// Plans edits for a framework that failed validation.
///
/// Persists the plan as an `EditPlan` row (no feedback linkage on this
/// branch) and parks the intents in state for the EDIT node. The
/// `validation_failed` tag is re-emitted explicitly: every delta between the
/// tag's producer and the router carries it.
pub struct ValidationEditPlanNode {
    agent: Arc<dyn Agent>,
}

impl ValidationEditPlanNode {
    pub fn new(agent: Arc<dyn Agent>) -> Self {
        Self { agent }
    }
}

#[async_trait]
impl NodeRunner for ValidationEditPlanNode {
    async fn run(&self, state: &WorkflowState, ctx: NodeCtx) -> Result<StateDelta, NodeError> {
        let framework = state
            .framework
            .as_ref()
            .ok_or(NodeError::MissingInput { what: "framework" })?;
        let issues: &[String] = state
            .validation_report
            .as_ref()
            .map(|r| r.issues.as_slice())
            .unwrap_or_default();
        ctx.emit("planning_edits", serde_json::json!({ "issues": issues.len() }));

        let output: EditPlanOutput = invoke_structured(
            self.agent.as_ref(),
            AgentRequest::new(
                "plan_validation_edits",
                serde_json::json!({ "framework": framework, "issues": issues }),
            ),
            ctx.retry,
        )
        .await?;

        let plan = ctx
            .registry
            .create_edit_plan(
                &ctx.task_id,
                None,
                output.intents.clone(),
                output.confidence,
                output.needs_clarification,
            )
            .await?;

        Ok(StateDelta::new()
            .with_pending_edit(Some(PendingEdit {
                plan_id: plan.plan_id,
                intents: output.intents,
                confidence: output.confidence,
                needs_clarification: output.needs_clarification,
            }))
            .set_edit_source(EditSource::ValidationFailed)
            .with_history(HistoryEntry::new(
                NodeId::ValidationEditPlan,
                "edit plan drafted from validation issues",
            )))
    }
}

/// Plans edits for a framework the reviewer rejected.
///
/// The resulting `EditPlan` row references the `ReviewFeedback` row the gate
/// created on rejection; the `human_review` tag is re-emitted explicitly.
pub struct ReviewEditPlanNode {
    agent: Arc<dyn Agent>,
}

impl ReviewEditPlanNode {
    pub fn new(agent: Arc<dyn Agent>) -> Self {
        Self { agent }
    }
}

#[async_trait]
impl NodeRunner for ReviewEditPlanNode {
    async fn run(&self, state: &WorkflowState, ctx: NodeCtx) -> Result<StateDelta, NodeError> {
        let framework = state
            .framework
            .as_ref()
            .ok_or(NodeError::MissingInput { what: "framework" })?;
        let feedback_id = state
            .feedback_id
            .clone()
            .ok_or(NodeError::MissingInput { what: "feedback_id" })?;
        let feedback_text = state.review_feedback.clone().unwrap_or_default();
        ctx.emit("planning_edits", Value::Null);

        let output: EditPlanOutput = invoke_structured(
            self.agent.as_ref(),
            AgentRequest::new(
                "plan_review_edits",
                serde_json::json!({ "framework": framework, "feedback": feedback_text }),
            ),
            ctx.retry,
        )
        .await?;

        let plan = ctx
            .registry
            .create_edit_plan(
                &ctx.task_id,
                Some(feedback_id),
                output.intents.clone(),
                output.confidence,
                output.needs_clarification,
            )
            .await?;

        Ok(StateDelta::new()
            .with_pending_edit(Some(PendingEdit {
                plan_id: plan.plan_id,
                intents: output.intents,
                confidence: output.confidence,
                needs_clarification: output.needs_clarification,
            }))
            .set_edit_source(EditSource::HumanReview)
            .with_history(HistoryEntry::new(
                NodeId::ReviewEditPlan,
                "edit plan drafted from review feedback",
            )))
    }
}
