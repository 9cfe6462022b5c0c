use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use crate::agents::{Agent, AgentRequest, invoke_structured};
use crate::node::{NodeCtx, NodeError, NodeRunner};
use crate::state::{HistoryEntry, StateDelta, WorkflowState};
use crate::types::NodeId;

/// Breaks the learning goal down into scope, audience, and constraints.
///
/// The analysis payload is opaque to the orchestrator; DESIGN consumes it
/// verbatim.
pub struct AnalyzeNode {
    agent: Arc<dyn Agent>,
}

impl AnalyzeNode {
    pub fn new(agent: Arc<dyn Agent>) -> Self {
        Self { agent }
    }
}

#[async_trait]
impl NodeRunner for AnalyzeNode {
    async fn run(&self, state: &WorkflowState, ctx: NodeCtx) -> Result<StateDelta, NodeError> {
        ctx.emit("analyzing", Value::Null);
        let analysis: Value = invoke_structured(
            self.agent.as_ref(),
            AgentRequest::new(
                "analyze_goal",
                serde_json::json!({ "goal": state.goal }),
            ),
            ctx.retry,
        )
        .await?;

        Ok(StateDelta::new()
            .with_analysis(analysis)
            .with_history(HistoryEntry::new(NodeId::Analyze, "goal analyzed")))
    }
}
