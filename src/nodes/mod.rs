//! Concrete node runners for the curriculum workflow.
//!
//! Each runner wraps its agent collaborator behind the uniform
//! [`NodeRunner`](crate::node::NodeRunner) contract and returns a
//! [`StateDelta`](crate::state::StateDelta). The agent output shapes here are
//! the orchestrator's view only; prompt and schema construction live behind
//! the [`Agent`](crate::agents::Agent) seam.

mod analyze;
mod design;
mod edit;
mod edit_plan;
mod validate;

pub use analyze::AnalyzeNode;
pub use design::DesignNode;
pub use edit::EditNode;
pub use edit_plan::{ReviewEditPlanNode, ValidationEditPlanNode};
pub use validate::ValidateNode;

use serde::Deserialize;
use std::sync::Arc;

use crate::agents::Agent;
use crate::graph::{GraphCompileError, WorkflowGraph};
use crate::state::EditIntent;
use crate::types::NodeId;

/// Agent output for both edit-plan nodes.
#[derive(Debug, Deserialize)]
pub(crate) struct EditPlanOutput {
    pub intents: Vec<EditIntent>,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default)]
    pub needs_clarification: bool,
}

fn default_confidence() -> f64 {
    0.5
}

/// Agent output for the validation node.
#[derive(Debug, Deserialize)]
pub(crate) struct ValidationOutput {
    pub passed: bool,
    #[serde(default)]
    pub issues: Vec<String>,
}

/// Wire the standard curriculum graph from one shared agent.
///
/// Production deployments may register distinct agents per node; tests and
/// simple setups use one.
pub fn standard_graph(agent: Arc<dyn Agent>) -> Result<WorkflowGraph, GraphCompileError> {
    WorkflowGraph::builder()
        .with_runner(NodeId::Analyze, AnalyzeNode::new(agent.clone()))
        .with_runner(NodeId::Design, DesignNode::new(agent.clone()))
        .with_runner(NodeId::Validate, ValidateNode::new(agent.clone()))
        .with_runner(
            NodeId::ValidationEditPlan,
            ValidationEditPlanNode::new(agent.clone()),
        )
        .with_runner(NodeId::ReviewEditPlan, ReviewEditPlanNode::new(agent))
        .with_runner(NodeId::Edit, EditNode::new())
        .build()
}
