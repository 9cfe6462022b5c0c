//! Core identifier and status types for the Curricle orchestration core.
//!
//! Everything here is a small, serde-friendly enum with a stable string form
//! used for persistence (`encode`/`decode`) and for the wire-level status
//! fields clients poll. Runtime-only types (engine outcomes, queue messages)
//! live next to the components that produce them.
//!
//! # Key Types
//!
//! - [`NodeId`]: identifies a step in the workflow state machine
//! - [`TaskStatus`]: client-visible task lifecycle, with its legal edges
//! - [`WorkUnitStatus`]: monotonic per-unit content-generation lifecycle
//! - [`EditSource`]: the tag distinguishing the two edit branches
//! - [`ContentType`]: the three independent content kinds per concept

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies a node in the workflow state machine.
///
/// The graph is static: these are all the steps there are. `Done`, `Failed`,
/// and `Cancelled` are terminal markers that carry no runner.
///
/// # Persistence
///
/// `NodeId` round-trips through [`encode`](Self::encode)/[`decode`](Self::decode)
/// for checkpoint rows and `Task.current_step`.
///
/// ```rust
/// use curricle::types::NodeId;
///
/// assert_eq!(NodeId::Validate.encode(), "validate");
/// assert_eq!(NodeId::decode("roadmap_edit"), Some(NodeId::Edit));
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeId {
    /// Analyze the learning goal into scope and constraints.
    Analyze,
    /// Design the concept framework from the analysis.
    Design,
    /// Structural validation of the framework.
    Validate,
    /// Plan edits for a failed validation.
    ValidationEditPlan,
    /// Human review suspension point.
    Review,
    /// Plan edits for a rejected review.
    ReviewEditPlan,
    /// Apply a pending edit plan to the framework (shared by both branches).
    Edit,
    /// Hand off to the content-worker pool.
    DispatchContent,
    /// Terminal: workflow finished its synchronous portion.
    Done,
    /// Terminal: workflow failed.
    Failed,
    /// Terminal: user cancelled.
    Cancelled,
}

impl NodeId {
    /// Stable string form used in checkpoints and `Task.current_step`.
    #[must_use]
    pub fn encode(&self) -> &'static str {
        match self {
            NodeId::Analyze => "analyze",
            NodeId::Design => "design",
            NodeId::Validate => "validate",
            NodeId::ValidationEditPlan => "validation_edit_plan",
            NodeId::Review => "review",
            NodeId::ReviewEditPlan => "review_edit_plan",
            NodeId::Edit => "roadmap_edit",
            NodeId::DispatchContent => "dispatch_content",
            NodeId::Done => "done",
            NodeId::Failed => "failed",
            NodeId::Cancelled => "cancelled",
        }
    }

    /// Decode a persisted string form. Unknown strings return `None` rather
    /// than guessing a node: resuming at the wrong step is worse than
    /// refusing to resume.
    pub fn decode(s: &str) -> Option<Self> {
        Some(match s {
            "analyze" => NodeId::Analyze,
            "design" => NodeId::Design,
            "validate" => NodeId::Validate,
            "validation_edit_plan" => NodeId::ValidationEditPlan,
            "review" => NodeId::Review,
            "review_edit_plan" => NodeId::ReviewEditPlan,
            "roadmap_edit" => NodeId::Edit,
            "dispatch_content" => NodeId::DispatchContent,
            "done" => NodeId::Done,
            "failed" => NodeId::Failed,
            "cancelled" => NodeId::Cancelled,
            _ => return None,
        })
    }

    /// Terminal nodes end traversal and carry no runner.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeId::Done | NodeId::Failed | NodeId::Cancelled)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.encode())
    }
}

/// Client-visible task lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    HumanReviewPending,
    Completed,
    PartialFailure,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Stable string form for persistence and the status endpoints.
    #[must_use]
    pub fn encode(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::HumanReviewPending => "human_review_pending",
            TaskStatus::Completed => "completed",
            TaskStatus::PartialFailure => "partial_failure",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn decode(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => TaskStatus::Pending,
            "processing" => TaskStatus::Processing,
            "human_review_pending" => TaskStatus::HumanReviewPending,
            "completed" => TaskStatus::Completed,
            "partial_failure" => TaskStatus::PartialFailure,
            "failed" => TaskStatus::Failed,
            "cancelled" => TaskStatus::Cancelled,
            _ => return None,
        })
    }

    /// Whether `self -> next` is a legal edge of the task state machine.
    ///
    /// Every status write in the registry goes through a guard built on this
    /// table; there is no unguarded `set_status`.
    #[must_use]
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Pending, Processing) | (Pending, Cancelled) | (Pending, Failed) => true,
            (Processing, HumanReviewPending)
            | (Processing, Completed)
            | (Processing, PartialFailure)
            | (Processing, Failed)
            | (Processing, Cancelled) => true,
            (HumanReviewPending, Processing)
            | (HumanReviewPending, Failed)
            | (HumanReviewPending, Cancelled) => true,
            _ => false,
        }
    }

    /// Terminal statuses admit no further transitions.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed
                | TaskStatus::PartialFailure
                | TaskStatus::Failed
                | TaskStatus::Cancelled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.encode())
    }
}

/// What kind of run a task row represents.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// Full roadmap generation from a learning goal.
    Creation,
    RetryTutorial,
    RetryResources,
    RetryQuiz,
    /// Re-enqueue every failed unit of a roadmap in one task.
    RetryBatch,
}

impl TaskType {
    #[must_use]
    pub fn encode(&self) -> &'static str {
        match self {
            TaskType::Creation => "creation",
            TaskType::RetryTutorial => "retry_tutorial",
            TaskType::RetryResources => "retry_resources",
            TaskType::RetryQuiz => "retry_quiz",
            TaskType::RetryBatch => "retry_batch",
        }
    }

    pub fn decode(s: &str) -> Option<Self> {
        Some(match s {
            "creation" => TaskType::Creation,
            "retry_tutorial" => TaskType::RetryTutorial,
            "retry_resources" => TaskType::RetryResources,
            "retry_quiz" => TaskType::RetryQuiz,
            "retry_batch" => TaskType::RetryBatch,
            _ => return None,
        })
    }

    /// The retry task type for a single content type.
    #[must_use]
    pub fn retry_for(content_type: ContentType) -> Self {
        match content_type {
            ContentType::Tutorial => TaskType::RetryTutorial,
            ContentType::Resources => TaskType::RetryResources,
            ContentType::Quiz => TaskType::RetryQuiz,
        }
    }
}

/// The three independent content kinds generated per concept.
///
/// A single concept id fans out into one [`WorkUnit`](crate::registry::WorkUnitRecord)
/// per content type; progress events therefore always carry the content type
/// next to the concept id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Tutorial,
    Resources,
    Quiz,
}

impl ContentType {
    /// All content types, in dispatch order.
    pub const ALL: [ContentType; 3] = [
        ContentType::Tutorial,
        ContentType::Resources,
        ContentType::Quiz,
    ];

    #[must_use]
    pub fn encode(&self) -> &'static str {
        match self {
            ContentType::Tutorial => "tutorial",
            ContentType::Resources => "resources",
            ContentType::Quiz => "quiz",
        }
    }

    pub fn decode(s: &str) -> Option<Self> {
        Some(match s {
            "tutorial" => ContentType::Tutorial,
            "resources" => ContentType::Resources,
            "quiz" => ContentType::Quiz,
            _ => return None,
        })
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.encode())
    }
}

/// Per-unit content-generation lifecycle.
///
/// Transitions are monotonic: `pending → generating → {completed, failed}`.
/// A failed unit is never flipped back; retries create a new unit row and the
/// old one stays for audit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkUnitStatus {
    Pending,
    Generating,
    Completed,
    Failed,
}

impl WorkUnitStatus {
    #[must_use]
    pub fn encode(&self) -> &'static str {
        match self {
            WorkUnitStatus::Pending => "pending",
            WorkUnitStatus::Generating => "generating",
            WorkUnitStatus::Completed => "completed",
            WorkUnitStatus::Failed => "failed",
        }
    }

    pub fn decode(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => WorkUnitStatus::Pending,
            "generating" => WorkUnitStatus::Generating,
            "completed" => WorkUnitStatus::Completed,
            "failed" => WorkUnitStatus::Failed,
            _ => return None,
        })
    }

    /// `Pending -> Failed` covers revocation and stale reconciliation of
    /// units that never started; there is no path back from a resolved state.
    #[must_use]
    pub fn can_transition_to(&self, next: WorkUnitStatus) -> bool {
        use WorkUnitStatus::*;
        matches!(
            (self, next),
            (Pending, Generating)
                | (Pending, Failed)
                | (Generating, Completed)
                | (Generating, Failed)
        )
    }

    #[must_use]
    pub fn is_resolved(&self) -> bool {
        matches!(self, WorkUnitStatus::Completed | WorkUnitStatus::Failed)
    }
}

impl fmt::Display for WorkUnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.encode())
    }
}

/// Which branch produced a pending edit request.
///
/// The `roadmap_edit` node serves both the validation-failure loop and the
/// human-review loop; this tag is the only thing that distinguishes them on
/// the way back out. It is a required, typed field everywhere it travels —
/// the router refuses to route an edit without it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditSource {
    ValidationFailed,
    HumanReview,
}

impl fmt::Display for EditSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EditSource::ValidationFailed => f.write_str("validation_failed"),
            EditSource::HumanReview => f.write_str("human_review"),
        }
    }
}

/// Where the asynchronous content phase stands, as seen by the graph.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentGenerationStatus {
    #[default]
    NotStarted,
    Queued,
    Done,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_roundtrip() {
        for id in [
            NodeId::Analyze,
            NodeId::Design,
            NodeId::Validate,
            NodeId::ValidationEditPlan,
            NodeId::Review,
            NodeId::ReviewEditPlan,
            NodeId::Edit,
            NodeId::DispatchContent,
            NodeId::Done,
            NodeId::Failed,
            NodeId::Cancelled,
        ] {
            assert_eq!(NodeId::decode(id.encode()), Some(id));
        }
        assert_eq!(NodeId::decode("not_a_node"), None);
    }

    #[test]
    fn task_status_edges() {
        use TaskStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(HumanReviewPending));
        assert!(HumanReviewPending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(PartialFailure));
        // no reverse or skipped transitions
        assert!(!Completed.can_transition_to(Processing));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Failed.can_transition_to(Processing));
    }

    #[test]
    fn work_unit_status_is_monotonic() {
        use WorkUnitStatus::*;
        assert!(Pending.can_transition_to(Generating));
        assert!(Generating.can_transition_to(Completed));
        assert!(Generating.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Generating));
        assert!(!Completed.can_transition_to(Generating));
        assert!(!Pending.can_transition_to(Completed));
    }
}
