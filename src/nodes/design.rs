use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use crate::agents::{Agent, AgentRequest, invoke_structured};
use crate::node::{NodeCtx, NodeError, NodeRunner};
use crate::state::{FrameworkDoc, HistoryEntry, StateDelta, WorkflowState};
use crate::types::NodeId;

/// Designs the concept framework from the analysis.
pub struct DesignNode {
    agent: Arc<dyn Agent>,
}

impl DesignNode {
    pub fn new(agent: Arc<dyn Agent>) -> Self {
        Self { agent }
    }
}

#[async_trait]
impl NodeRunner for DesignNode {
    async fn run(&self, state: &WorkflowState, ctx: NodeCtx) -> Result<StateDelta, NodeError> {
        let analysis = state
            .analysis
            .as_ref()
            .ok_or(NodeError::MissingInput { what: "analysis" })?;
        ctx.emit("designing", Value::Null);

        let mut framework: FrameworkDoc = invoke_structured(
            self.agent.as_ref(),
            AgentRequest::new(
                "design_framework",
                serde_json::json!({ "goal": state.goal, "analysis": analysis }),
            ),
            ctx.retry,
        )
        .await?;
        framework.version = framework.version.max(1);

        let note = format!("framework designed ({} concepts)", framework.concept_count());
        Ok(StateDelta::new()
            .with_framework(framework)
            .with_history(HistoryEntry::new(NodeId::Design, note)))
    }
}
