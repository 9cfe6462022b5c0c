//! Task and work-unit registry: the source of truth for status rows.
//!
//! Every status write goes through a guard: callers state which statuses they
//! expect, the registry applies the update only if the row still matches and
//! the edge is legal per [`TaskStatus::can_transition_to`] /
//! [`WorkUnitStatus::can_transition_to`]. This is what makes resume,
//! cancellation, and the last-worker-finalizes protocol race-free.
//!
//! Two implementations share the [`TaskRegistry`] trait: [`MemoryRegistry`]
//! for tests and development, and the SQLite-backed store in
//! [`registry_sqlite`](crate::registry_sqlite) for durability.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use thiserror::Error;
use uuid::Uuid;

use crate::state::EditIntent;
use crate::types::{ContentType, TaskStatus, TaskType, WorkUnitStatus};

/// One client-visible task row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub roadmap_id: String,
    pub status: TaskStatus,
    pub current_step: String,
    pub task_type: TaskType,
    pub concept_id: Option<String>,
    pub content_type: Option<ContentType>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One dispatched unit of content generation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkUnitRecord {
    pub unit_id: String,
    pub task_id: String,
    pub roadmap_id: String,
    pub concept_id: String,
    pub content_type: ContentType,
    pub status: WorkUnitStatus,
    pub attempts: u32,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A human review decision, recorded at the gate.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReviewFeedbackRecord {
    pub feedback_id: String,
    pub task_id: String,
    pub roadmap_version_snapshot: u32,
    pub approved: bool,
    pub feedback_text: Option<String>,
    pub review_round: u32,
    pub created_at: DateTime<Utc>,
}

/// A planned edit cycle; `feedback_id` links the review branch to the
/// feedback row it answers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EditPlanRecord {
    pub plan_id: String,
    pub task_id: String,
    pub feedback_id: Option<String>,
    pub intents: Vec<EditIntent>,
    pub confidence: f64,
    pub needs_clarification: bool,
    pub created_at: DateTime<Utc>,
}

/// Parameters for creating a task row.
#[derive(Clone, Debug)]
pub struct NewTask {
    pub roadmap_id: String,
    pub task_type: TaskType,
    pub concept_id: Option<String>,
    pub content_type: Option<ContentType>,
}

impl NewTask {
    pub fn creation(roadmap_id: impl Into<String>) -> Self {
        Self {
            roadmap_id: roadmap_id.into(),
            task_type: TaskType::Creation,
            concept_id: None,
            content_type: None,
        }
    }

    pub fn retry(
        roadmap_id: impl Into<String>,
        concept_id: impl Into<String>,
        content_type: ContentType,
    ) -> Self {
        Self {
            roadmap_id: roadmap_id.into(),
            task_type: TaskType::retry_for(content_type),
            concept_id: Some(concept_id.into()),
            content_type: Some(content_type),
        }
    }

    pub fn retry_batch(roadmap_id: impl Into<String>) -> Self {
        Self {
            roadmap_id: roadmap_id.into(),
            task_type: TaskType::RetryBatch,
            concept_id: None,
            content_type: None,
        }
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum RegistryError {
    /// Store/queue connectivity trouble; retried with backoff at call sites,
    /// never surfaced as a task failure on first occurrence.
    #[error("registry backend error: {message}")]
    #[diagnostic(
        code(curricle::registry::backend),
        help("Check database connectivity; this class of error is transient.")
    )]
    Backend { message: String },

    #[error("{what} not found: {id}")]
    #[diagnostic(code(curricle::registry::not_found))]
    NotFound { what: &'static str, id: String },

    /// The requested edge is not part of the state machine. This is a
    /// programming error, not a lost race.
    #[error("illegal status transition {from} -> {to}")]
    #[diagnostic(code(curricle::registry::invalid_transition))]
    InvalidTransition { from: String, to: String },

    #[error("conflict: {message}")]
    #[diagnostic(code(curricle::registry::conflict))]
    Conflict { message: String },
}

pub type Result<T> = std::result::Result<T, RegistryError>;

/// Source of truth for task / work-unit / review / edit-plan rows.
///
/// All updates are conditional. Methods returning `Ok(bool)` report whether
/// the guarded update applied; `false` means another writer got there first,
/// which callers treat as "someone else owns this transition".
#[async_trait]
pub trait TaskRegistry: Send + Sync {
    async fn create_task(&self, new_task: NewTask) -> Result<TaskRecord>;

    async fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>>;

    async fn tasks_for_roadmap(&self, roadmap_id: &str) -> Result<Vec<TaskRecord>>;

    /// Status-guarded update: applies only if the row's status is in
    /// `expected` and the edge is legal. Returns whether it applied.
    async fn transition_task(
        &self,
        task_id: &str,
        expected: &[TaskStatus],
        next: TaskStatus,
    ) -> Result<bool>;

    async fn set_current_step(&self, task_id: &str, step: &str) -> Result<()>;

    async fn set_task_error(&self, task_id: &str, message: &str) -> Result<()>;

    /// Create a pending unit. Refused while an unresolved unit exists for
    /// the same `(roadmap, concept, content_type)` — that is the at-most-one
    /// in-flight invariant, enforced where rows are born.
    async fn create_work_unit(
        &self,
        task_id: &str,
        roadmap_id: &str,
        concept_id: &str,
        content_type: ContentType,
    ) -> Result<WorkUnitRecord>;

    async fn get_work_unit(&self, unit_id: &str) -> Result<Option<WorkUnitRecord>>;

    async fn work_units_for_task(&self, task_id: &str) -> Result<Vec<WorkUnitRecord>>;

    async fn work_units_for_roadmap(&self, roadmap_id: &str) -> Result<Vec<WorkUnitRecord>>;

    /// Most recent unit for a `(concept, content_type)` pair, any task.
    async fn latest_unit_for_concept(
        &self,
        concept_id: &str,
        content_type: ContentType,
    ) -> Result<Option<WorkUnitRecord>>;

    /// Guarded `pending -> generating`. Returns `false` when the unit is
    /// already claimed/resolved or its task is no longer active.
    async fn claim_work_unit(&self, unit_id: &str) -> Result<bool>;

    /// Guarded `generating -> completed`; idempotent on replay.
    async fn complete_work_unit(&self, unit_id: &str) -> Result<bool>;

    /// Guarded `{pending, generating} -> failed`; idempotent on replay.
    async fn fail_work_unit(&self, unit_id: &str, error: &str) -> Result<bool>;

    async fn bump_unit_attempts(&self, unit_id: &str) -> Result<u32>;

    /// The terminal-write protocol for dispatched tasks: if every unit of the
    /// task has resolved and the task is still `processing`, compute the
    /// aggregate (`completed` vs `partial_failure`) and apply it guarded.
    /// Exactly one caller observes `Some(_)`.
    async fn finalize_if_resolved(&self, task_id: &str) -> Result<Option<TaskStatus>>;

    /// Fail all still-pending units of a task (cancellation support).
    /// Returns the ids of the revoked units.
    async fn revoke_pending_units(&self, task_id: &str, reason: &str) -> Result<Vec<String>>;

    /// All tasks currently in a non-terminal status.
    async fn active_tasks(&self) -> Result<Vec<TaskRecord>>;

    async fn create_review_feedback(
        &self,
        task_id: &str,
        roadmap_version_snapshot: u32,
        approved: bool,
        feedback_text: Option<String>,
        review_round: u32,
    ) -> Result<ReviewFeedbackRecord>;

    async fn review_feedback_for_task(&self, task_id: &str) -> Result<Vec<ReviewFeedbackRecord>>;

    async fn create_edit_plan(
        &self,
        task_id: &str,
        feedback_id: Option<String>,
        intents: Vec<EditIntent>,
        confidence: f64,
        needs_clarification: bool,
    ) -> Result<EditPlanRecord>;

    async fn edit_plans_for_task(&self, task_id: &str) -> Result<Vec<EditPlanRecord>>;
}

/// In-memory registry: one mutex over all rows, so every guarded update is
/// atomic by construction.
#[derive(Default)]
pub struct MemoryRegistry {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    tasks: FxHashMap<String, TaskRecord>,
    units: FxHashMap<String, WorkUnitRecord>,
    feedback: FxHashMap<String, ReviewFeedbackRecord>,
    plans: FxHashMap<String, EditPlanRecord>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // Poisoning only happens if another thread panicked mid-update;
        // propagate rather than limp on with torn rows.
        self.inner.lock().expect("registry lock poisoned")
    }
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

#[async_trait]
impl TaskRegistry for MemoryRegistry {
    async fn create_task(&self, new_task: NewTask) -> Result<TaskRecord> {
        let now = Utc::now();
        let record = TaskRecord {
            task_id: new_id(),
            roadmap_id: new_task.roadmap_id,
            status: TaskStatus::Pending,
            current_step: "created".to_string(),
            task_type: new_task.task_type,
            concept_id: new_task.concept_id,
            content_type: new_task.content_type,
            error_message: None,
            created_at: now,
            updated_at: now,
        };
        self.lock()
            .tasks
            .insert(record.task_id.clone(), record.clone());
        Ok(record)
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        Ok(self.lock().tasks.get(task_id).cloned())
    }

    async fn tasks_for_roadmap(&self, roadmap_id: &str) -> Result<Vec<TaskRecord>> {
        let mut tasks: Vec<_> = self
            .lock()
            .tasks
            .values()
            .filter(|t| t.roadmap_id == roadmap_id)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(tasks)
    }

    async fn transition_task(
        &self,
        task_id: &str,
        expected: &[TaskStatus],
        next: TaskStatus,
    ) -> Result<bool> {
        let mut inner = self.lock();
        let task = inner
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| RegistryError::NotFound {
                what: "task",
                id: task_id.to_string(),
            })?;
        if !expected.contains(&task.status) {
            return Ok(false);
        }
        if !task.status.can_transition_to(next) {
            return Err(RegistryError::InvalidTransition {
                from: task.status.encode().to_string(),
                to: next.encode().to_string(),
            });
        }
        task.status = next;
        task.updated_at = Utc::now();
        Ok(true)
    }

    async fn set_current_step(&self, task_id: &str, step: &str) -> Result<()> {
        let mut inner = self.lock();
        let task = inner
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| RegistryError::NotFound {
                what: "task",
                id: task_id.to_string(),
            })?;
        task.current_step = step.to_string();
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn set_task_error(&self, task_id: &str, message: &str) -> Result<()> {
        let mut inner = self.lock();
        let task = inner
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| RegistryError::NotFound {
                what: "task",
                id: task_id.to_string(),
            })?;
        task.error_message = Some(message.to_string());
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn create_work_unit(
        &self,
        task_id: &str,
        roadmap_id: &str,
        concept_id: &str,
        content_type: ContentType,
    ) -> Result<WorkUnitRecord> {
        let mut inner = self.lock();
        let duplicate = inner.units.values().any(|u| {
            u.roadmap_id == roadmap_id
                && u.concept_id == concept_id
                && u.content_type == content_type
                && !u.status.is_resolved()
        });
        if duplicate {
            return Err(RegistryError::Conflict {
                message: format!(
                    "unresolved work unit already exists for {roadmap_id}/{concept_id}/{content_type}"
                ),
            });
        }
        let now = Utc::now();
        let record = WorkUnitRecord {
            unit_id: new_id(),
            task_id: task_id.to_string(),
            roadmap_id: roadmap_id.to_string(),
            concept_id: concept_id.to_string(),
            content_type,
            status: WorkUnitStatus::Pending,
            attempts: 0,
            error_message: None,
            created_at: now,
            updated_at: now,
        };
        inner.units.insert(record.unit_id.clone(), record.clone());
        Ok(record)
    }

    async fn get_work_unit(&self, unit_id: &str) -> Result<Option<WorkUnitRecord>> {
        Ok(self.lock().units.get(unit_id).cloned())
    }

    async fn work_units_for_task(&self, task_id: &str) -> Result<Vec<WorkUnitRecord>> {
        let mut units: Vec<_> = self
            .lock()
            .units
            .values()
            .filter(|u| u.task_id == task_id)
            .cloned()
            .collect();
        units.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(units)
    }

    async fn work_units_for_roadmap(&self, roadmap_id: &str) -> Result<Vec<WorkUnitRecord>> {
        let mut units: Vec<_> = self
            .lock()
            .units
            .values()
            .filter(|u| u.roadmap_id == roadmap_id)
            .cloned()
            .collect();
        units.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(units)
    }

    async fn latest_unit_for_concept(
        &self,
        concept_id: &str,
        content_type: ContentType,
    ) -> Result<Option<WorkUnitRecord>> {
        Ok(self
            .lock()
            .units
            .values()
            .filter(|u| u.concept_id == concept_id && u.content_type == content_type)
            .max_by(|a, b| a.created_at.cmp(&b.created_at))
            .cloned())
    }

    async fn claim_work_unit(&self, unit_id: &str) -> Result<bool> {
        let mut inner = self.lock();
        let task_active = {
            let unit = inner
                .units
                .get(unit_id)
                .ok_or_else(|| RegistryError::NotFound {
                    what: "work unit",
                    id: unit_id.to_string(),
                })?;
            if unit.status != WorkUnitStatus::Pending {
                return Ok(false);
            }
            inner
                .tasks
                .get(&unit.task_id)
                .map(|t| !t.status.is_terminal())
                .unwrap_or(false)
        };
        if !task_active {
            return Ok(false);
        }
        let unit = inner.units.get_mut(unit_id).expect("checked above");
        unit.status = WorkUnitStatus::Generating;
        unit.updated_at = Utc::now();
        Ok(true)
    }

    async fn complete_work_unit(&self, unit_id: &str) -> Result<bool> {
        let mut inner = self.lock();
        let unit = inner
            .units
            .get_mut(unit_id)
            .ok_or_else(|| RegistryError::NotFound {
                what: "work unit",
                id: unit_id.to_string(),
            })?;
        if !unit.status.can_transition_to(WorkUnitStatus::Completed) {
            return Ok(false);
        }
        unit.status = WorkUnitStatus::Completed;
        unit.updated_at = Utc::now();
        Ok(true)
    }

    async fn fail_work_unit(&self, unit_id: &str, error: &str) -> Result<bool> {
        let mut inner = self.lock();
        let unit = inner
            .units
            .get_mut(unit_id)
            .ok_or_else(|| RegistryError::NotFound {
                what: "work unit",
                id: unit_id.to_string(),
            })?;
        if !unit.status.can_transition_to(WorkUnitStatus::Failed) {
            return Ok(false);
        }
        unit.status = WorkUnitStatus::Failed;
        unit.error_message = Some(error.to_string());
        unit.updated_at = Utc::now();
        Ok(true)
    }

    async fn bump_unit_attempts(&self, unit_id: &str) -> Result<u32> {
        let mut inner = self.lock();
        let unit = inner
            .units
            .get_mut(unit_id)
            .ok_or_else(|| RegistryError::NotFound {
                what: "work unit",
                id: unit_id.to_string(),
            })?;
        unit.attempts += 1;
        unit.updated_at = Utc::now();
        Ok(unit.attempts)
    }

    async fn finalize_if_resolved(&self, task_id: &str) -> Result<Option<TaskStatus>> {
        let mut inner = self.lock();
        let units: Vec<_> = inner
            .units
            .values()
            .filter(|u| u.task_id == task_id)
            .cloned()
            .collect();
        if units.is_empty() || units.iter().any(|u| !u.status.is_resolved()) {
            return Ok(None);
        }
        let any_failed = units.iter().any(|u| u.status == WorkUnitStatus::Failed);
        let aggregate = if any_failed {
            TaskStatus::PartialFailure
        } else {
            TaskStatus::Completed
        };
        let task = inner
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| RegistryError::NotFound {
                what: "task",
                id: task_id.to_string(),
            })?;
        // The processing guard is what makes this a single-winner protocol:
        // the first finalizer flips the status, everyone else sees terminal.
        if task.status != TaskStatus::Processing {
            return Ok(None);
        }
        task.status = aggregate;
        task.current_step = "content_generation_resolved".to_string();
        task.updated_at = Utc::now();
        Ok(Some(aggregate))
    }

    async fn revoke_pending_units(&self, task_id: &str, reason: &str) -> Result<Vec<String>> {
        let mut inner = self.lock();
        let now = Utc::now();
        let mut revoked = Vec::new();
        for unit in inner.units.values_mut() {
            if unit.task_id == task_id && unit.status == WorkUnitStatus::Pending {
                unit.status = WorkUnitStatus::Failed;
                unit.error_message = Some(reason.to_string());
                unit.updated_at = now;
                revoked.push(unit.unit_id.clone());
            }
        }
        Ok(revoked)
    }

    async fn active_tasks(&self) -> Result<Vec<TaskRecord>> {
        let mut tasks: Vec<_> = self
            .lock()
            .tasks
            .values()
            .filter(|t| !t.status.is_terminal())
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(tasks)
    }

    async fn create_review_feedback(
        &self,
        task_id: &str,
        roadmap_version_snapshot: u32,
        approved: bool,
        feedback_text: Option<String>,
        review_round: u32,
    ) -> Result<ReviewFeedbackRecord> {
        let record = ReviewFeedbackRecord {
            feedback_id: new_id(),
            task_id: task_id.to_string(),
            roadmap_version_snapshot,
            approved,
            feedback_text,
            review_round,
            created_at: Utc::now(),
        };
        self.lock()
            .feedback
            .insert(record.feedback_id.clone(), record.clone());
        Ok(record)
    }

    async fn review_feedback_for_task(&self, task_id: &str) -> Result<Vec<ReviewFeedbackRecord>> {
        let mut rows: Vec<_> = self
            .lock()
            .feedback
            .values()
            .filter(|f| f.task_id == task_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(rows)
    }

    async fn create_edit_plan(
        &self,
        task_id: &str,
        feedback_id: Option<String>,
        intents: Vec<EditIntent>,
        confidence: f64,
        needs_clarification: bool,
    ) -> Result<EditPlanRecord> {
        let record = EditPlanRecord {
            plan_id: new_id(),
            task_id: task_id.to_string(),
            feedback_id,
            intents,
            confidence,
            needs_clarification,
            created_at: Utc::now(),
        };
        self.lock()
            .plans
            .insert(record.plan_id.clone(), record.clone());
        Ok(record)
    }

    async fn edit_plans_for_task(&self, task_id: &str) -> Result<Vec<EditPlanRecord>> {
        let mut plans: Vec<_> = self
            .lock()
            .plans
            .values()
            .filter(|p| p.task_id == task_id)
            .cloned()
            .collect();
        plans.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(plans)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn guarded_transition_rejects_stale_expectation() {
        let registry = MemoryRegistry::new();
        let task = registry
            .create_task(NewTask::creation("roadmap-1"))
            .await
            .unwrap();
        assert!(registry
            .transition_task(&task.task_id, &[TaskStatus::Pending], TaskStatus::Processing)
            .await
            .unwrap());
        // Second writer expecting Pending loses.
        assert!(!registry
            .transition_task(&task.task_id, &[TaskStatus::Pending], TaskStatus::Processing)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn finalize_has_exactly_one_winner() {
        let registry = MemoryRegistry::new();
        let task = registry
            .create_task(NewTask::creation("roadmap-1"))
            .await
            .unwrap();
        registry
            .transition_task(&task.task_id, &[TaskStatus::Pending], TaskStatus::Processing)
            .await
            .unwrap();
        let unit = registry
            .create_work_unit(&task.task_id, "roadmap-1", "c1", ContentType::Tutorial)
            .await
            .unwrap();
        registry.claim_work_unit(&unit.unit_id).await.unwrap();
        registry.complete_work_unit(&unit.unit_id).await.unwrap();

        let first = registry.finalize_if_resolved(&task.task_id).await.unwrap();
        let second = registry.finalize_if_resolved(&task.task_id).await.unwrap();
        assert_eq!(first, Some(TaskStatus::Completed));
        assert_eq!(second, None);
    }

    #[tokio::test]
    async fn duplicate_active_unit_is_refused() {
        let registry = MemoryRegistry::new();
        let task = registry
            .create_task(NewTask::creation("roadmap-1"))
            .await
            .unwrap();
        registry
            .create_work_unit(&task.task_id, "roadmap-1", "c1", ContentType::Quiz)
            .await
            .unwrap();
        let err = registry
            .create_work_unit(&task.task_id, "roadmap-1", "c1", ContentType::Quiz)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Conflict { .. }));
    }

    #[tokio::test]
    async fn complete_replay_is_idempotent() {
        let registry = MemoryRegistry::new();
        let task = registry
            .create_task(NewTask::creation("roadmap-1"))
            .await
            .unwrap();
        let unit = registry
            .create_work_unit(&task.task_id, "roadmap-1", "c1", ContentType::Tutorial)
            .await
            .unwrap();
        registry.claim_work_unit(&unit.unit_id).await.unwrap();
        assert!(registry.complete_work_unit(&unit.unit_id).await.unwrap());
        // Replayed completion: no state change, no error.
        assert!(!registry.complete_work_unit(&unit.unit_id).await.unwrap());
        let stored = registry.get_work_unit(&unit.unit_id).await.unwrap().unwrap();
        assert_eq!(stored.status, WorkUnitStatus::Completed);
    }
}
