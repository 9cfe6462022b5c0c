//! Stale-task reconciliation.
//!
//! A task recorded as in-progress with no live worker behind it would sit
//! "processing" forever without this. The reconciler runs on demand (behind
//! the status-check endpoint) and periodically; it is deliberately
//! conservative — a recent heartbeat or a fresh row timestamp always wins,
//! because failing a truly-active task is worse than detecting a dead one
//! late.

use chrono::Utc;
use miette::Diagnostic;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::instrument;

use crate::bus::NotificationBus;
use crate::checkpoint::{CheckpointError, CheckpointStore};
use crate::dispatch::{WorkerLiveness, finalize_task};
use crate::registry::{RegistryError, TaskRecord, TaskRegistry};
use crate::types::{ContentType, NodeId, TaskStatus, WorkUnitStatus};

/// Error prefix marking units the reconciler failed; the status-check report
/// keys off it to surface the retry affordance.
const STALE_PREFIX: &str = "stale:";

/// One concept/content pair the reconciler found or left in a stale-failed
/// state, retriable by the client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StaleConcept {
    pub concept_id: String,
    pub content_type: ContentType,
    pub current_status: WorkUnitStatus,
}

/// Summary row for a non-terminal task.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ActiveTaskInfo {
    pub task_id: String,
    pub status: TaskStatus,
    pub current_step: String,
}

/// Reconciliation-aware status answer. A non-empty `stale_concepts` list is
/// authoritative even when `has_active_task` is false.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StatusCheckReport {
    pub has_active_task: bool,
    pub active_tasks: Vec<ActiveTaskInfo>,
    pub stale_concepts: Vec<StaleConcept>,
}

#[derive(Debug, Error, Diagnostic)]
pub enum ReconcileError {
    #[error(transparent)]
    #[diagnostic(code(curricle::reconcile::registry))]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    #[diagnostic(code(curricle::reconcile::checkpoint))]
    Checkpoint(#[from] CheckpointError),

    #[error("task not found: {task_id}")]
    #[diagnostic(code(curricle::reconcile::task_not_found))]
    TaskNotFound { task_id: String },
}

/// Detects and repairs tasks/units stuck in-progress with no live worker.
pub struct StaleTaskReconciler {
    registry: Arc<dyn TaskRegistry>,
    checkpoints: Arc<dyn CheckpointStore>,
    liveness: Arc<WorkerLiveness>,
    bus: Arc<NotificationBus>,
    grace: Duration,
}

impl StaleTaskReconciler {
    pub fn new(
        registry: Arc<dyn TaskRegistry>,
        checkpoints: Arc<dyn CheckpointStore>,
        liveness: Arc<WorkerLiveness>,
        bus: Arc<NotificationBus>,
        grace: Duration,
    ) -> Self {
        Self {
            registry,
            checkpoints,
            liveness,
            bus,
            grace,
        }
    }

    /// Reconciliation-aware status check for one task's roadmap, as served
    /// by `GET /tasks/{id}/status-check`.
    #[instrument(skip(self), err)]
    pub async fn check_task(&self, task_id: &str) -> Result<StatusCheckReport, ReconcileError> {
        let task = self
            .registry
            .get_task(task_id)
            .await?
            .ok_or_else(|| ReconcileError::TaskNotFound {
                task_id: task_id.to_string(),
            })?;

        // Reconcile every task of the roadmap so the report reflects repairs
        // across retries, not just this row.
        for sibling in self.registry.tasks_for_roadmap(&task.roadmap_id).await? {
            self.reconcile_task(&sibling).await?;
        }

        let tasks = self.registry.tasks_for_roadmap(&task.roadmap_id).await?;
        let active_tasks: Vec<ActiveTaskInfo> = tasks
            .iter()
            .filter(|t| !t.status.is_terminal())
            .map(|t| ActiveTaskInfo {
                task_id: t.task_id.clone(),
                status: t.status,
                current_step: t.current_step.clone(),
            })
            .collect();

        let stale_concepts = self
            .registry
            .work_units_for_roadmap(&task.roadmap_id)
            .await?
            .into_iter()
            .filter(|u| {
                u.status == WorkUnitStatus::Failed
                    && u.error_message
                        .as_deref()
                        .map(|m| m.starts_with(STALE_PREFIX))
                        .unwrap_or(false)
            })
            .map(|u| StaleConcept {
                concept_id: u.concept_id,
                content_type: u.content_type,
                current_status: u.status,
            })
            .collect();

        Ok(StatusCheckReport {
            has_active_task: !active_tasks.is_empty(),
            active_tasks,
            stale_concepts,
        })
    }

    /// Inspect one task; repair it if it is demonstrably stuck.
    ///
    /// Returns the units this pass transitioned to failed.
    #[instrument(skip(self, task), fields(task = %task.task_id), err)]
    pub async fn reconcile_task(&self, task: &TaskRecord) -> Result<Vec<String>, ReconcileError> {
        if !matches!(
            task.status,
            TaskStatus::Processing | TaskStatus::HumanReviewPending
        ) {
            return Ok(Vec::new());
        }
        let grace =
            chrono::Duration::from_std(self.grace).unwrap_or_else(|_| chrono::Duration::seconds(180));
        if Utc::now() - task.updated_at < grace {
            return Ok(Vec::new());
        }
        // A heartbeat from any node run or unit beats row-age heuristics.
        if self.liveness.task_is_live(&task.task_id, self.grace) {
            return Ok(Vec::new());
        }

        if task.status == TaskStatus::HumanReviewPending {
            // Waiting on a human is not staleness, as long as the suspension
            // checkpoint is intact and resumable.
            let suspended_ok = self
                .checkpoints
                .load_latest(&task.task_id)
                .await?
                .map(|cp| cp.node == NodeId::Review)
                .unwrap_or(false);
            if !suspended_ok {
                self.fail_stuck_task(task, "stale: review suspension checkpoint lost")
                    .await?;
            }
            return Ok(Vec::new());
        }

        let units = self.registry.work_units_for_task(&task.task_id).await?;
        if units.is_empty() {
            // Processing with no units and no heartbeat: the graph execution
            // died between checkpoints.
            self.fail_stuck_task(task, "stale: no live workflow execution")
                .await?;
            return Ok(Vec::new());
        }

        let mut repaired = Vec::new();
        for unit in &units {
            let stuck = matches!(
                unit.status,
                WorkUnitStatus::Pending | WorkUnitStatus::Generating
            );
            if !stuck {
                continue;
            }
            if self.liveness.unit_is_live(&unit.unit_id, self.grace) {
                continue;
            }
            if Utc::now() - unit.updated_at < grace {
                continue;
            }
            let failed = self
                .registry
                .fail_work_unit(&unit.unit_id, "stale: no live worker")
                .await?;
            if failed {
                tracing::warn!(
                    unit = %unit.unit_id,
                    concept = %unit.concept_id,
                    content_type = %unit.content_type,
                    "stale unit reconciled to failed"
                );
                repaired.push(unit.unit_id.clone());
            }
        }

        if !repaired.is_empty() {
            // Completed siblings stay untouched; the aggregate write goes
            // through the same single-winner protocol workers use.
            finalize_task(self.registry.as_ref(), &self.bus, &task.task_id).await;
        }
        Ok(repaired)
    }

    /// One reconciliation sweep over all active tasks.
    #[instrument(skip(self), err)]
    pub async fn sweep(&self) -> Result<usize, ReconcileError> {
        let mut repaired = 0;
        for task in self.registry.active_tasks().await? {
            repaired += self.reconcile_task(&task).await?.len();
        }
        Ok(repaired)
    }

    /// Spawn the periodic sweep loop.
    pub fn spawn_periodic(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = self.sweep().await {
                    tracing::error!(error = %e, "reconciliation sweep failed");
                }
            }
        })
    }

    async fn fail_stuck_task(&self, task: &TaskRecord, message: &str) -> Result<(), ReconcileError> {
        self.registry.set_task_error(&task.task_id, message).await?;
        let failed = self
            .registry
            .transition_task(
                &task.task_id,
                &[TaskStatus::Processing, TaskStatus::HumanReviewPending],
                TaskStatus::Failed,
            )
            .await?;
        if failed {
            tracing::warn!(task = %task.task_id, %message, "stale task reconciled to failed");
            self.bus.publish(crate::bus::ProgressEvent::terminal(
                crate::bus::ProgressKind::Failed,
                task.task_id.clone(),
                TaskStatus::Failed,
            ));
        }
        Ok(())
    }
}
