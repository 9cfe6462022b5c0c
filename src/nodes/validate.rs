use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use crate::agents::{Agent, AgentRequest, invoke_structured};
use crate::node::{NodeCtx, NodeError, NodeRunner};
use crate::state::{FrameworkDoc, HistoryEntry, StateDelta, ValidationReport, WorkflowState};
use crate::types::{EditSource, NodeId};

use super::ValidationOutput;

/// Structural validation of the framework.
///
/// Cheap invariants are checked locally; the agent judges coherence. A
/// failed pass is not an error — it sets `edit_source = validation_failed`
/// and the router sends the workflow into the edit branch. A passing run
/// clears the tag, which is the router consuming the validation loop.
pub struct ValidateNode {
    agent: Arc<dyn Agent>,
}

impl ValidateNode {
    pub fn new(agent: Arc<dyn Agent>) -> Self {
        Self { agent }
    }

    fn structural_issues(framework: &FrameworkDoc) -> Vec<String> {
        let mut issues = Vec::new();
        if framework.concepts.is_empty() {
            issues.push("framework has no concepts".to_string());
        }
        let mut seen = std::collections::HashSet::new();
        for concept in &framework.concepts {
            if concept.title.trim().is_empty() {
                issues.push(format!("concept {} has an empty title", concept.concept_id));
            }
            if !seen.insert(concept.concept_id.as_str()) {
                issues.push(format!("duplicate concept id {}", concept.concept_id));
            }
        }
        issues
    }
}

#[async_trait]
impl NodeRunner for ValidateNode {
    async fn run(&self, state: &WorkflowState, ctx: NodeCtx) -> Result<StateDelta, NodeError> {
        let framework = state
            .framework
            .as_ref()
            .ok_or(NodeError::MissingInput { what: "framework" })?;
        let round = state.validation_round + 1;
        ctx.emit("validating", serde_json::json!({ "round": round }));

        let mut issues = Self::structural_issues(framework);
        if issues.is_empty() {
            let output: ValidationOutput = invoke_structured(
                self.agent.as_ref(),
                AgentRequest::new(
                    "validate_framework",
                    serde_json::json!({ "framework": framework, "round": round }),
                ),
                ctx.retry,
            )
            .await?;
            if !output.passed {
                issues = output.issues;
                if issues.is_empty() {
                    issues.push("framework rejected by validation".to_string());
                }
            }
        }

        let passed = issues.is_empty();
        let report = ValidationReport {
            passed,
            issues: issues.clone(),
        };
        let note = if passed {
            format!("validation round {round} passed")
        } else {
            format!("validation round {round} failed ({} issues)", issues.len())
        };
        ctx.emit(
            if passed { "validation_passed" } else { "validation_failed" },
            Value::Null,
        );

        let delta = StateDelta::new()
            .with_validation_round(round)
            .with_validation_report(report)
            .with_history(HistoryEntry::new(NodeId::Validate, note));
        Ok(if passed {
            delta.clear_edit_source()
        } else {
            delta.set_edit_source(EditSource::ValidationFailed)
        })
    }
}
