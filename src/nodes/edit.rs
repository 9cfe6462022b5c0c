use async_trait::async_trait;

use crate::node::{NodeCtx, NodeError, NodeRunner};
use crate::state::{HistoryEntry, StateDelta, apply_edit_intents, WorkflowState};
use crate::types::NodeId;

/// Applies the pending edit plan to the framework.
///
/// Shared terminal node of both edit branches (`roadmap_edit`). Intent
/// application is mechanical; the planning intelligence already ran. The
/// edit tag is re-emitted verbatim from state — this node sits between the
/// tag's producer and the router, so it must carry the tag forward for
/// [`Router::route_after_edit`](crate::graph::Router::route_after_edit) to
/// pick the loop to close.
pub struct EditNode;

impl EditNode {
    pub fn new() -> Self {
        Self
    }
}

impl Default for EditNode {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NodeRunner for EditNode {
    async fn run(&self, state: &WorkflowState, ctx: NodeCtx) -> Result<StateDelta, NodeError> {
        let framework = state
            .framework
            .as_ref()
            .ok_or(NodeError::MissingInput { what: "framework" })?;
        let pending = state
            .pending_edit
            .as_ref()
            .ok_or(NodeError::MissingInput { what: "pending_edit" })?;
        let source = state
            .edit_source
            .ok_or(NodeError::MissingInput { what: "edit_source" })?;

        let edited = apply_edit_intents(framework, &pending.intents);
        let count = state.modification_count + 1;
        ctx.emit(
            "applying_edits",
            serde_json::json!({ "intents": pending.intents.len(), "version": edited.version }),
        );

        Ok(StateDelta::new()
            .with_framework(edited)
            .with_modification_count(count)
            .with_pending_edit(None)
            .set_edit_source(source)
            .with_history(HistoryEntry::new(
                NodeId::Edit,
                format!("applied edit plan {} (modification {count})", pending.plan_id),
            )))
    }
}
