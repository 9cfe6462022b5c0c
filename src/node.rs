//! The node execution contract.
//!
//! A [`NodeRunner`] is the executor for one workflow step. It reads the
//! current [`WorkflowState`], talks to its agent collaborator, and returns a
//! [`StateDelta`]. It never writes state or checkpoints itself — the engine
//! merges the delta, persists the checkpoint, and updates
//! `Task.current_step` before routing, uniformly for every node.

use async_trait::async_trait;
use miette::Diagnostic;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

use crate::agents::AgentError;
use crate::bus::{NotificationBus, ProgressEvent};
use crate::config::RetryPolicy;
use crate::registry::{RegistryError, TaskRegistry};
use crate::state::{StateDelta, WorkflowState};
use crate::types::NodeId;

/// Execution context handed to a node run.
///
/// Carries the task identity, the node-level retry policy for agent calls,
/// and handles to the bus (progress emission) and registry (rows some nodes
/// create, e.g. edit plans).
#[derive(Clone)]
pub struct NodeCtx {
    pub task_id: String,
    pub node: NodeId,
    pub retry: RetryPolicy,
    pub bus: Arc<NotificationBus>,
    pub registry: Arc<dyn TaskRegistry>,
}

impl NodeCtx {
    /// Emit a task-scoped progress note tagged with this node.
    pub fn emit(&self, status: impl Into<String>, data: Value) {
        self.bus.publish(ProgressEvent::progress(
            self.task_id.clone(),
            status,
            serde_json::json!({ "node": self.node.encode(), "detail": data }),
        ));
    }
}

impl std::fmt::Debug for NodeCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeCtx")
            .field("task_id", &self.task_id)
            .field("node", &self.node)
            .finish()
    }
}

/// Errors that fail a node run (and, once surfaced, the task).
///
/// Routed outcomes — validation failure, review rejection — are not errors;
/// they are ordinary deltas that set the edit tag.
#[derive(Debug, Error, Diagnostic)]
pub enum NodeError {
    /// The agent retry budget was exhausted.
    #[error("agent call failed after retries: {source}")]
    #[diagnostic(code(curricle::node::agent))]
    Agent {
        #[from]
        source: AgentError,
    },

    /// State was missing something the node requires.
    #[error("missing expected input: {what}")]
    #[diagnostic(
        code(curricle::node::missing_input),
        help("Check that the upstream node produced the required state field.")
    )]
    MissingInput { what: &'static str },

    /// A registry write inside the node failed.
    #[error(transparent)]
    #[diagnostic(code(curricle::node::registry))]
    Registry(#[from] RegistryError),
}

/// Executor for one workflow step.
#[async_trait]
pub trait NodeRunner: Send + Sync {
    /// Run this step against a state snapshot, returning the delta to merge.
    async fn run(&self, state: &WorkflowState, ctx: NodeCtx) -> Result<StateDelta, NodeError>;
}
