//! Workflow state and the delta-merge contract.
//!
//! A task's mutable state lives in exactly one place: [`WorkflowState`],
//! persisted as checkpoint rows and reconstructed on resume. Nodes never
//! mutate state directly; they return a [`StateDelta`] and the engine merges
//! it with [`StateDelta::apply`].
//!
//! # The carry-forward contract
//!
//! Deltas merge by overwrite, so any field the router consumes downstream
//! must survive every intermediate merge. For the routing-critical
//! `edit_source` tag this is enforced structurally: the delta field is an
//! [`EditCarry`] whose default is `Preserve`. A node that says nothing about
//! the tag keeps it; dropping it requires writing `EditCarry::Clear` on
//! purpose. "Absent" cannot silently become "null".

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{ContentGenerationStatus, EditSource, NodeId};

/// One concept of the designed framework.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Concept {
    pub concept_id: String,
    pub title: String,
    #[serde(default)]
    pub summary: String,
}

/// The framework document produced by DESIGN and refined by EDIT.
///
/// `version` increments on every applied edit so review feedback can snapshot
/// exactly what was reviewed.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameworkDoc {
    pub goal: String,
    pub concepts: Vec<Concept>,
    pub version: u32,
}

impl FrameworkDoc {
    #[must_use]
    pub fn concept_count(&self) -> usize {
        self.concepts.len()
    }
}

/// A single structured edit intent from an edit plan.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum EditIntent {
    /// Replace a concept's title/summary.
    Revise {
        concept_id: String,
        title: Option<String>,
        summary: Option<String>,
    },
    /// Add a new concept after the given position (end if absent).
    Add {
        concept: Concept,
        after: Option<String>,
    },
    /// Remove a concept.
    Remove { concept_id: String },
    /// Reword the overall goal statement.
    RestateGoal { goal: String },
}

/// Outcome of one structural validation pass.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub passed: bool,
    #[serde(default)]
    pub issues: Vec<String>,
}

/// Append-only record of one node execution.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub node: NodeId,
    pub at: DateTime<Utc>,
    pub note: String,
}

impl HistoryEntry {
    pub fn new(node: NodeId, note: impl Into<String>) -> Self {
        Self {
            node,
            at: Utc::now(),
            note: note.into(),
        }
    }
}

/// The full mutable state threaded through node traversal.
///
/// Lives only inside checkpoint rows; there is no separate state table.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    /// The learning goal as submitted.
    pub goal: String,
    /// Framework document; `None` until DESIGN has run.
    pub framework: Option<FrameworkDoc>,
    /// Number of VALIDATE passes so far.
    pub validation_round: u32,
    /// Number of applied edit plans.
    pub modification_count: u32,
    /// Which branch produced the pending edit request, if any.
    pub edit_source: Option<EditSource>,
    /// Outcome of the most recent VALIDATE pass.
    pub validation_report: Option<ValidationReport>,
    /// Edit intents waiting for the EDIT node, with the plan's confidence.
    pub pending_edit: Option<PendingEdit>,
    /// Id of the review-feedback row the current edit cycle answers.
    pub feedback_id: Option<String>,
    /// Reviewer's feedback text for the current rejection cycle.
    pub review_feedback: Option<String>,
    /// Append-only execution log.
    pub execution_history: Vec<HistoryEntry>,
    /// Where the asynchronous content phase stands.
    pub content_generation_status: ContentGenerationStatus,
    /// Opaque analysis payload from ANALYZE, consumed by DESIGN.
    pub analysis: Option<Value>,
}

/// An edit plan parked in state between the plan node and the EDIT node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingEdit {
    pub plan_id: String,
    pub intents: Vec<EditIntent>,
    pub confidence: f64,
    pub needs_clarification: bool,
}

impl WorkflowState {
    pub fn new(goal: impl Into<String>) -> Self {
        Self {
            goal: goal.into(),
            ..Default::default()
        }
    }
}

/// Three-valued carry semantics for the routing-critical edit tag.
///
/// `Preserve` is the default: a delta that does not mention the tag keeps the
/// previous value. Only the router's consumer writes `Clear`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditCarry {
    #[default]
    Preserve,
    Set(EditSource),
    Clear,
}

/// Partial state update returned by a node run.
///
/// `None` means "leave unchanged" for every optional field. `history` entries
/// are appended, never replaced. The edit tag uses [`EditCarry`], see the
/// module docs for why.
#[derive(Clone, Debug, Default)]
pub struct StateDelta {
    pub framework: Option<FrameworkDoc>,
    pub validation_round: Option<u32>,
    pub modification_count: Option<u32>,
    pub edit_source: EditCarry,
    pub validation_report: Option<ValidationReport>,
    pub pending_edit: Option<Option<PendingEdit>>,
    pub feedback_id: Option<Option<String>>,
    pub review_feedback: Option<Option<String>>,
    pub content_generation_status: Option<ContentGenerationStatus>,
    pub analysis: Option<Value>,
    pub history: Vec<HistoryEntry>,
}

impl StateDelta {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_framework(mut self, framework: FrameworkDoc) -> Self {
        self.framework = Some(framework);
        self
    }

    #[must_use]
    pub fn with_validation_round(mut self, round: u32) -> Self {
        self.validation_round = Some(round);
        self
    }

    #[must_use]
    pub fn with_modification_count(mut self, count: u32) -> Self {
        self.modification_count = Some(count);
        self
    }

    #[must_use]
    pub fn set_edit_source(mut self, source: EditSource) -> Self {
        self.edit_source = EditCarry::Set(source);
        self
    }

    #[must_use]
    pub fn clear_edit_source(mut self) -> Self {
        self.edit_source = EditCarry::Clear;
        self
    }

    #[must_use]
    pub fn with_validation_report(mut self, report: ValidationReport) -> Self {
        self.validation_report = Some(report);
        self
    }

    #[must_use]
    pub fn with_pending_edit(mut self, pending: Option<PendingEdit>) -> Self {
        self.pending_edit = Some(pending);
        self
    }

    #[must_use]
    pub fn with_review_feedback(mut self, feedback: Option<String>) -> Self {
        self.review_feedback = Some(feedback);
        self
    }

    #[must_use]
    pub fn with_feedback_id(mut self, id: Option<String>) -> Self {
        self.feedback_id = Some(id);
        self
    }

    #[must_use]
    pub fn with_content_generation_status(mut self, status: ContentGenerationStatus) -> Self {
        self.content_generation_status = Some(status);
        self
    }

    #[must_use]
    pub fn with_analysis(mut self, analysis: Value) -> Self {
        self.analysis = Some(analysis);
        self
    }

    #[must_use]
    pub fn with_history(mut self, entry: HistoryEntry) -> Self {
        self.history.push(entry);
        self
    }

    /// Merge this delta into `state`.
    ///
    /// Overwrite semantics for set fields, preserve semantics for unset ones,
    /// append semantics for history.
    pub fn apply(self, state: &mut WorkflowState) {
        if let Some(framework) = self.framework {
            state.framework = Some(framework);
        }
        if let Some(round) = self.validation_round {
            state.validation_round = round;
        }
        if let Some(count) = self.modification_count {
            state.modification_count = count;
        }
        match self.edit_source {
            EditCarry::Preserve => {}
            EditCarry::Set(source) => state.edit_source = Some(source),
            EditCarry::Clear => state.edit_source = None,
        }
        if let Some(report) = self.validation_report {
            state.validation_report = Some(report);
        }
        if let Some(pending) = self.pending_edit {
            state.pending_edit = pending;
        }
        if let Some(feedback) = self.feedback_id {
            state.feedback_id = feedback;
        }
        if let Some(feedback) = self.review_feedback {
            state.review_feedback = feedback;
        }
        if let Some(status) = self.content_generation_status {
            state.content_generation_status = status;
        }
        if let Some(analysis) = self.analysis {
            state.analysis = Some(analysis);
        }
        state.execution_history.extend(self.history);
    }
}

/// Apply a list of edit intents to a framework, returning the new document.
///
/// Unknown concept ids are skipped rather than erroring: the plan was
/// produced against a snapshot and the framework may have drifted by a
/// concurrent cycle. The version always increments so the drift is visible.
pub fn apply_edit_intents(framework: &FrameworkDoc, intents: &[EditIntent]) -> FrameworkDoc {
    let mut doc = framework.clone();
    for intent in intents {
        match intent {
            EditIntent::Revise {
                concept_id,
                title,
                summary,
            } => {
                if let Some(c) = doc.concepts.iter_mut().find(|c| &c.concept_id == concept_id) {
                    if let Some(t) = title {
                        c.title = t.clone();
                    }
                    if let Some(s) = summary {
                        c.summary = s.clone();
                    }
                }
            }
            EditIntent::Add { concept, after } => {
                let at = after
                    .as_ref()
                    .and_then(|id| doc.concepts.iter().position(|c| &c.concept_id == id))
                    .map(|i| i + 1)
                    .unwrap_or(doc.concepts.len());
                doc.concepts.insert(at, concept.clone());
            }
            EditIntent::Remove { concept_id } => {
                doc.concepts.retain(|c| &c.concept_id != concept_id);
            }
            EditIntent::RestateGoal { goal } => {
                doc.goal = goal.clone();
            }
        }
    }
    doc.version += 1;
    doc
}

#[cfg(test)]
mod tests {
    use super::*;

    fn framework() -> FrameworkDoc {
        FrameworkDoc {
            goal: "learn rust".into(),
            concepts: vec![
                Concept {
                    concept_id: "c1".into(),
                    title: "Ownership".into(),
                    summary: String::new(),
                },
                Concept {
                    concept_id: "c2".into(),
                    title: "Borrowing".into(),
                    summary: String::new(),
                },
            ],
            version: 1,
        }
    }

    #[test]
    fn default_delta_preserves_edit_source() {
        let mut state = WorkflowState::new("goal");
        state.edit_source = Some(EditSource::HumanReview);

        // A delta that says nothing about the tag must not drop it.
        StateDelta::new()
            .with_validation_round(2)
            .apply(&mut state);

        assert_eq!(state.edit_source, Some(EditSource::HumanReview));
        assert_eq!(state.validation_round, 2);
    }

    #[test]
    fn clear_is_explicit() {
        let mut state = WorkflowState::new("goal");
        state.edit_source = Some(EditSource::ValidationFailed);

        StateDelta::new().clear_edit_source().apply(&mut state);
        assert_eq!(state.edit_source, None);
    }

    #[test]
    fn history_appends() {
        let mut state = WorkflowState::new("goal");
        StateDelta::new()
            .with_history(HistoryEntry::new(NodeId::Analyze, "ran"))
            .apply(&mut state);
        StateDelta::new()
            .with_history(HistoryEntry::new(NodeId::Design, "ran"))
            .apply(&mut state);
        assert_eq!(state.execution_history.len(), 2);
        assert_eq!(state.execution_history[0].node, NodeId::Analyze);
    }

    #[test]
    fn edit_intents_apply_in_order() {
        let doc = framework();
        let edited = apply_edit_intents(
            &doc,
            &[
                EditIntent::Remove {
                    concept_id: "c2".into(),
                },
                EditIntent::Add {
                    concept: Concept {
                        concept_id: "c3".into(),
                        title: "Lifetimes".into(),
                        summary: String::new(),
                    },
                    after: Some("c1".into()),
                },
                EditIntent::Revise {
                    concept_id: "c1".into(),
                    title: Some("Ownership & Moves".into()),
                    summary: None,
                },
            ],
        );
        assert_eq!(edited.version, 2);
        assert_eq!(edited.concepts.len(), 2);
        assert_eq!(edited.concepts[0].title, "Ownership & Moves");
        assert_eq!(edited.concepts[1].concept_id, "c3");
    }
}
