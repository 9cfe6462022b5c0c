//! The static workflow graph and its router.
//!
//! The graph is a fixed table: every [`NodeId`] that executes work maps to a
//! registered [`NodeRunner`]; routing between nodes is a pure function of
//! `(node just ran, state)`. There is no runtime type inspection and no
//! dynamic topology — the state machine is the one in the design:
//!
//! ```text
//! ANALYZE -> DESIGN -> VALIDATE --pass--> REVIEW --approve--> DISPATCH_CONTENT -> DONE
//!                         |                  |
//!                        fail             reject
//!                         v                  v
//!               VALIDATION_EDIT_PLAN   REVIEW_EDIT_PLAN
//!                         \                  /
//!                          v                v
//!                              EDIT (roadmap_edit)
//!                         edit_source routes back:
//!                 validation_failed -> VALIDATE
//!                 human_review      -> REVIEW
//! ```
//!
//! `REVIEW` is a suspension point: entering it is "persist and return", so
//! it carries no runner. The two edit branches share the EDIT node and are
//! distinguished only by the typed `edit_source` tag; routing after EDIT
//! with no tag is a hard error, never a silent default.

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::node::NodeRunner;
use crate::state::WorkflowState;
use crate::types::{EditSource, NodeId};

/// Where traversal goes after a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteTarget {
    /// Execute this node next.
    Run(NodeId),
    /// Enter the human-review gate: checkpoint, flip status, return.
    SuspendForReview,
    /// Hand off to the content dispatcher; the graph portion is done after.
    DispatchContent,
    /// The synchronous portion of the workflow is complete.
    Complete,
}

#[derive(Debug, Error, Diagnostic, PartialEq, Eq)]
pub enum RouterError {
    /// Routing after EDIT requires the edit tag; a missing tag means some
    /// intermediate delta dropped it, which is a correctness bug upstream.
    #[error("cannot route after {node}: edit_source is unset")]
    #[diagnostic(
        code(curricle::router::missing_edit_source),
        help("Every delta between the tag's producer and the router must carry it.")
    )]
    MissingEditSource { node: NodeId },

    /// The tag held a value that makes no sense at this point in the graph.
    #[error("unexpected edit_source {edit_source} while routing after {node}")]
    #[diagnostic(code(curricle::router::unexpected_edit_source))]
    UnexpectedEditSource { node: NodeId, edit_source: EditSource },

    /// Asked to route after a node that has no outgoing edges.
    #[error("node {node} is terminal; nothing to route")]
    #[diagnostic(code(curricle::router::terminal))]
    TerminalNode { node: NodeId },
}

/// Pure routing functions over the static edge table.
pub struct Router;

impl Router {
    /// Successor of `node` given the post-merge state.
    pub fn successor(node: NodeId, state: &WorkflowState) -> Result<RouteTarget, RouterError> {
        match node {
            NodeId::Analyze => Ok(RouteTarget::Run(NodeId::Design)),
            NodeId::Design => Ok(RouteTarget::Run(NodeId::Validate)),
            NodeId::Validate => match state.edit_source {
                // The validate node sets the tag when the framework failed
                // structural checks; routing consumes that decision.
                Some(EditSource::ValidationFailed) => {
                    Ok(RouteTarget::Run(NodeId::ValidationEditPlan))
                }
                None => Ok(RouteTarget::SuspendForReview),
                Some(source @ EditSource::HumanReview) => {
                    Err(RouterError::UnexpectedEditSource {
                        node,
                        edit_source: source,
                    })
                }
            },
            NodeId::ValidationEditPlan | NodeId::ReviewEditPlan => {
                Ok(RouteTarget::Run(NodeId::Edit))
            }
            NodeId::Edit => Self::route_after_edit(state),
            NodeId::DispatchContent => Ok(RouteTarget::Complete),
            NodeId::Review => Ok(RouteTarget::SuspendForReview),
            NodeId::Done | NodeId::Failed | NodeId::Cancelled => {
                Err(RouterError::TerminalNode { node })
            }
        }
    }

    /// The single highest-value routing decision: after EDIT, the typed tag
    /// chooses which loop to close. Anything but an explicit tag is an
    /// error — the two branches share this node and are otherwise
    /// indistinguishable.
    pub fn route_after_edit(state: &WorkflowState) -> Result<RouteTarget, RouterError> {
        match state.edit_source {
            Some(EditSource::HumanReview) => Ok(RouteTarget::SuspendForReview),
            Some(EditSource::ValidationFailed) => Ok(RouteTarget::Run(NodeId::Validate)),
            None => Err(RouterError::MissingEditSource { node: NodeId::Edit }),
        }
    }

    /// Routing of an external review decision injected at resume.
    #[must_use]
    pub fn route_review_decision(approved: bool) -> RouteTarget {
        if approved {
            RouteTarget::DispatchContent
        } else {
            RouteTarget::Run(NodeId::ReviewEditPlan)
        }
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum GraphCompileError {
    #[error("no runner registered for node {node}")]
    #[diagnostic(
        code(curricle::graph::missing_runner),
        help("Register a runner for every executable node before building.")
    )]
    MissingRunner { node: NodeId },

    #[error("node {node} does not execute work and cannot take a runner")]
    #[diagnostic(code(curricle::graph::virtual_node))]
    VirtualNode { node: NodeId },
}

/// Nodes that must have a runner registered.
const EXECUTABLE_NODES: [NodeId; 6] = [
    NodeId::Analyze,
    NodeId::Design,
    NodeId::Validate,
    NodeId::ValidationEditPlan,
    NodeId::ReviewEditPlan,
    NodeId::Edit,
];

/// The compiled, immutable graph: runner table plus the entry node.
pub struct WorkflowGraph {
    runners: FxHashMap<NodeId, Arc<dyn NodeRunner>>,
}

impl WorkflowGraph {
    pub fn builder() -> WorkflowGraphBuilder {
        WorkflowGraphBuilder::default()
    }

    /// Entry node for a fresh task.
    #[must_use]
    pub fn entry(&self) -> NodeId {
        NodeId::Analyze
    }

    /// Runner for an executable node. Virtual nodes (REVIEW, terminals,
    /// DISPATCH_CONTENT) are handled by the engine and never looked up.
    #[must_use]
    pub fn runner(&self, node: NodeId) -> Option<Arc<dyn NodeRunner>> {
        self.runners.get(&node).cloned()
    }
}

/// Builder for the runner table; `build` verifies completeness.
#[derive(Default)]
pub struct WorkflowGraphBuilder {
    runners: FxHashMap<NodeId, Arc<dyn NodeRunner>>,
}

impl WorkflowGraphBuilder {
    #[must_use]
    pub fn with_runner(mut self, node: NodeId, runner: impl NodeRunner + 'static) -> Self {
        self.runners.insert(node, Arc::new(runner));
        self
    }

    #[must_use]
    pub fn with_runner_arc(mut self, node: NodeId, runner: Arc<dyn NodeRunner>) -> Self {
        self.runners.insert(node, runner);
        self
    }

    pub fn build(self) -> Result<WorkflowGraph, GraphCompileError> {
        for node in self.runners.keys() {
            if !EXECUTABLE_NODES.contains(node) {
                return Err(GraphCompileError::VirtualNode { node: *node });
            }
        }
        for node in EXECUTABLE_NODES {
            if !self.runners.contains_key(&node) {
                return Err(GraphCompileError::MissingRunner { node });
            }
        }
        Ok(WorkflowGraph {
            runners: self.runners,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with(edit_source: Option<EditSource>) -> WorkflowState {
        let mut state = WorkflowState::new("goal");
        state.edit_source = edit_source;
        state
    }

    #[test]
    fn edit_routes_back_to_review_for_human_feedback() {
        let state = state_with(Some(EditSource::HumanReview));
        assert_eq!(
            Router::route_after_edit(&state),
            Ok(RouteTarget::SuspendForReview)
        );
    }

    #[test]
    fn edit_routes_back_to_validate_for_validation_failure() {
        let state = state_with(Some(EditSource::ValidationFailed));
        assert_eq!(
            Router::route_after_edit(&state),
            Ok(RouteTarget::Run(NodeId::Validate))
        );
    }

    #[test]
    fn edit_with_missing_tag_is_an_error_not_a_default() {
        let state = state_with(None);
        assert_eq!(
            Router::route_after_edit(&state),
            Err(RouterError::MissingEditSource { node: NodeId::Edit })
        );
    }

    #[test]
    fn validate_pass_proceeds_to_review() {
        let state = state_with(None);
        assert_eq!(
            Router::successor(NodeId::Validate, &state),
            Ok(RouteTarget::SuspendForReview)
        );
    }

    #[test]
    fn validate_failure_enters_edit_branch() {
        let state = state_with(Some(EditSource::ValidationFailed));
        assert_eq!(
            Router::successor(NodeId::Validate, &state),
            Ok(RouteTarget::Run(NodeId::ValidationEditPlan))
        );
    }

    #[test]
    fn review_decision_routes() {
        assert_eq!(
            Router::route_review_decision(true),
            RouteTarget::DispatchContent
        );
        assert_eq!(
            Router::route_review_decision(false),
            RouteTarget::Run(NodeId::ReviewEditPlan)
        );
    }

    #[test]
    fn terminal_nodes_do_not_route() {
        let state = state_with(None);
        assert!(Router::successor(NodeId::Done, &state).is_err());
    }
}
