//! The workflow engine: checkpointed, single-stepping graph traversal.
//!
//! Each task's traversal is logically single-threaded: [`advance`] runs one
//! node under the task's write lock, merges the delta, persists a checkpoint
//! whose `node` field is the *resume point*, updates `Task.current_step`,
//! and routes. Suspension (the review gate, the dispatch hand-off) is
//! "checkpoint and return" — no thread or coroutine spans it; resumption
//! loads the latest checkpoint and continues.
//!
//! [`advance`]: WorkflowEngine::advance

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::instrument;

use crate::bus::{NotificationBus, ProgressEvent};
use crate::checkpoint::{Checkpoint, CheckpointError, CheckpointStore};
use crate::config::OrchestratorConfig;
use crate::dispatch::{DispatchError, TaskDispatcher, WorkerLiveness};
use crate::graph::{RouteTarget, Router, WorkflowGraph};
use crate::node::NodeCtx;
use crate::registry::{NewTask, RegistryError, TaskRecord, TaskRegistry};
use crate::state::{HistoryEntry, StateDelta, WorkflowState};
use crate::types::{ContentGenerationStatus, EditSource, NodeId, TaskStatus};

/// What one call to [`WorkflowEngine::advance`] did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AdvanceOutcome {
    /// A node ran and traversal can continue at `next`.
    Advanced { ran: NodeId, next: NodeId },
    /// The task is suspended awaiting a human review decision.
    Suspended,
    /// Work units were enqueued; the graph portion of this task is done.
    Dispatched { units: usize },
    /// The graph portion already finished; content workers own completion.
    ContentInFlight,
    /// The task is in a terminal status.
    Terminal(TaskStatus),
}

#[derive(Debug, Error, Diagnostic)]
pub enum EngineError {
    #[error(transparent)]
    #[diagnostic(code(curricle::engine::registry))]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    #[diagnostic(code(curricle::engine::checkpoint))]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    #[diagnostic(code(curricle::engine::dispatch))]
    Dispatch(#[from] DispatchError),

    #[error("task not found: {task_id}")]
    #[diagnostic(code(curricle::engine::task_not_found))]
    TaskNotFound { task_id: String },

    #[error("no checkpoint for task {task_id}; cannot resume")]
    #[diagnostic(
        code(curricle::engine::missing_checkpoint),
        help("Tasks get their first checkpoint at creation; this row was lost.")
    )]
    MissingCheckpoint { task_id: String },

    #[error("task {task_id} is not awaiting review")]
    #[diagnostic(
        code(curricle::engine::not_awaiting_review),
        help("Only one resume can win per suspension; this one lost or came early.")
    )]
    NotAwaitingReview { task_id: String },

    #[error("task {task_id} cannot be cancelled from its current status")]
    #[diagnostic(code(curricle::engine::not_cancellable))]
    NotCancellable { task_id: String },
}

/// Orchestrates checkpointed traversal of the workflow graph for all tasks.
pub struct WorkflowEngine {
    graph: Arc<WorkflowGraph>,
    registry: Arc<dyn TaskRegistry>,
    checkpoints: Arc<dyn CheckpointStore>,
    bus: Arc<NotificationBus>,
    dispatcher: Arc<TaskDispatcher>,
    liveness: Arc<WorkerLiveness>,
    config: OrchestratorConfig,
    /// Per-task write locks: one node executes at a time per task, and
    /// checkpoint writes for a task are serialized.
    task_locks: Mutex<FxHashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl WorkflowEngine {
    pub fn new(
        graph: Arc<WorkflowGraph>,
        registry: Arc<dyn TaskRegistry>,
        checkpoints: Arc<dyn CheckpointStore>,
        bus: Arc<NotificationBus>,
        dispatcher: Arc<TaskDispatcher>,
        liveness: Arc<WorkerLiveness>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            graph,
            registry,
            checkpoints,
            bus,
            dispatcher,
            liveness,
            config,
            task_locks: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn registry(&self) -> &Arc<dyn TaskRegistry> {
        &self.registry
    }

    pub fn bus(&self) -> &Arc<NotificationBus> {
        &self.bus
    }

    pub fn dispatcher(&self) -> &Arc<TaskDispatcher> {
        &self.dispatcher
    }

    fn lock_for(&self, task_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.task_locks
            .lock()
            .expect("task lock table poisoned")
            .entry(task_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    async fn get_task(&self, task_id: &str) -> Result<TaskRecord, EngineError> {
        self.registry
            .get_task(task_id)
            .await?
            .ok_or_else(|| EngineError::TaskNotFound {
                task_id: task_id.to_string(),
            })
    }

    /// Create a task row and its initial checkpoint at the entry node.
    #[instrument(skip(self, goal), err)]
    pub async fn create_task(
        &self,
        roadmap_id: &str,
        goal: &str,
    ) -> Result<TaskRecord, EngineError> {
        let task = self
            .registry
            .create_task(NewTask::creation(roadmap_id))
            .await?;
        let state = WorkflowState::new(goal);
        self.checkpoints
            .save(Checkpoint::new(
                task.task_id.clone(),
                self.graph.entry(),
                state,
            ))
            .await?;
        tracing::info!(task = %task.task_id, roadmap = %roadmap_id, "task created");
        Ok(task)
    }

    /// Execute one step for the task: run the node at the resume point,
    /// merge, checkpoint, route.
    #[instrument(skip(self), err)]
    pub async fn advance(&self, task_id: &str) -> Result<AdvanceOutcome, EngineError> {
        let lock = self.lock_for(task_id);
        let _guard = lock.lock().await;

        let task = self.get_task(task_id).await?;
        if task.status.is_terminal() {
            return Ok(AdvanceOutcome::Terminal(task.status));
        }
        if task.status == TaskStatus::HumanReviewPending {
            return Ok(AdvanceOutcome::Suspended);
        }
        if task.status == TaskStatus::Pending {
            self.registry
                .transition_task(task_id, &[TaskStatus::Pending], TaskStatus::Processing)
                .await?;
        }

        let checkpoint = self
            .checkpoints
            .load_latest(task_id)
            .await?
            .ok_or_else(|| EngineError::MissingCheckpoint {
                task_id: task_id.to_string(),
            })?;
        let node = checkpoint.node;
        let state = checkpoint.state;

        match node {
            NodeId::Review => {
                // Crash between checkpoint save and the status flip heals here.
                self.registry
                    .transition_task(
                        task_id,
                        &[TaskStatus::Processing],
                        TaskStatus::HumanReviewPending,
                    )
                    .await?;
                Ok(AdvanceOutcome::Suspended)
            }
            NodeId::DispatchContent => self.dispatch_content(task_id, state).await,
            NodeId::Done => Ok(AdvanceOutcome::ContentInFlight),
            NodeId::Failed | NodeId::Cancelled => {
                let task = self.get_task(task_id).await?;
                Ok(AdvanceOutcome::Terminal(task.status))
            }
            _ => self.run_node(task_id, node, state).await,
        }
    }

    /// Drive steps until suspension, dispatch, or a terminal outcome.
    #[instrument(skip(self), err)]
    pub async fn run_to_suspension(&self, task_id: &str) -> Result<AdvanceOutcome, EngineError> {
        loop {
            match self.advance(task_id).await? {
                AdvanceOutcome::Advanced { .. } => continue,
                outcome => return Ok(outcome),
            }
        }
    }

    async fn run_node(
        &self,
        task_id: &str,
        node: NodeId,
        state: WorkflowState,
    ) -> Result<AdvanceOutcome, EngineError> {
        let runner = match self.graph.runner(node) {
            Some(runner) => runner,
            None => {
                // Table and router disagree; fail the task rather than spin.
                return self
                    .fail_task(task_id, &format!("no runner registered for node {node}"))
                    .await;
            }
        };

        let ctx = NodeCtx {
            task_id: task_id.to_string(),
            node,
            retry: self.config.node_retry,
            bus: self.bus.clone(),
            registry: self.registry.clone(),
        };

        self.liveness.beat_task(task_id);
        tracing::debug!(task = %task_id, %node, "running node");
        let run_result = runner.run(&state, ctx).await;
        self.liveness.clear_task(task_id);

        let delta = match run_result {
            Ok(delta) => delta,
            Err(err) => {
                // Retry budget already spent inside the runner; surface as
                // task failure, keep the last good checkpoint.
                return self.fail_task(task_id, &err.to_string()).await;
            }
        };

        let mut merged = state;
        delta.apply(&mut merged);
        self.registry.set_current_step(task_id, node.encode()).await?;

        let route = match Router::successor(node, &merged) {
            Ok(route) => route,
            // A dropped routing tag is a correctness bug, never a silent
            // default onto the main path.
            Err(err) => return self.fail_task(task_id, &err.to_string()).await,
        };

        match route {
            RouteTarget::Run(next) => {
                self.checkpoints
                    .save(Checkpoint::new(task_id, next, merged))
                    .await?;
                Ok(AdvanceOutcome::Advanced { ran: node, next })
            }
            RouteTarget::SuspendForReview => self.suspend_for_review(task_id, merged).await,
            RouteTarget::DispatchContent => {
                self.checkpoints
                    .save(Checkpoint::new(task_id, NodeId::DispatchContent, merged.clone()))
                    .await?;
                self.dispatch_content(task_id, merged).await
            }
            RouteTarget::Complete => {
                self.checkpoints
                    .save(Checkpoint::new(task_id, NodeId::Done, merged))
                    .await?;
                Ok(AdvanceOutcome::ContentInFlight)
            }
        }
    }

    async fn suspend_for_review(
        &self,
        task_id: &str,
        state: WorkflowState,
    ) -> Result<AdvanceOutcome, EngineError> {
        self.checkpoints
            .save(Checkpoint::new(task_id, NodeId::Review, state))
            .await?;
        self.registry
            .transition_task(
                task_id,
                &[TaskStatus::Processing],
                TaskStatus::HumanReviewPending,
            )
            .await?;
        self.registry
            .set_current_step(task_id, NodeId::Review.encode())
            .await?;
        self.bus.publish(ProgressEvent::progress(
            task_id,
            "human_review_pending",
            serde_json::Value::Null,
        ));
        tracing::info!(task = %task_id, "suspended for human review");
        Ok(AdvanceOutcome::Suspended)
    }

    async fn dispatch_content(
        &self,
        task_id: &str,
        mut state: WorkflowState,
    ) -> Result<AdvanceOutcome, EngineError> {
        let task = self.get_task(task_id).await?;
        let framework = match state.framework.clone() {
            Some(framework) => framework,
            None => {
                return self
                    .fail_task(task_id, "dispatch reached with no framework")
                    .await;
            }
        };

        let units = self.dispatcher.dispatch(&task, &framework).await?;
        state.content_generation_status = ContentGenerationStatus::Queued;
        state
            .execution_history
            .push(HistoryEntry::new(NodeId::DispatchContent, format!("queued {} units", units.len())));
        // The graph portion is finished; workers own the terminal write.
        self.checkpoints
            .save(Checkpoint::new(task_id, NodeId::Done, state))
            .await?;
        Ok(AdvanceOutcome::Dispatched { units: units.len() })
    }

    async fn fail_task(&self, task_id: &str, message: &str) -> Result<AdvanceOutcome, EngineError> {
        tracing::error!(task = %task_id, error = %message, "task failed");
        self.registry.set_task_error(task_id, message).await?;
        self.registry
            .transition_task(
                task_id,
                &[
                    TaskStatus::Pending,
                    TaskStatus::Processing,
                    TaskStatus::HumanReviewPending,
                ],
                TaskStatus::Failed,
            )
            .await?;
        self.bus.publish(ProgressEvent::terminal(
            crate::bus::ProgressKind::Failed,
            task_id,
            TaskStatus::Failed,
        ));
        Ok(AdvanceOutcome::Terminal(TaskStatus::Failed))
    }

    /// Resume a task suspended at the review gate with an external decision.
    ///
    /// Race-free by construction: the status-guarded flip
    /// `human_review_pending -> processing` admits exactly one resume per
    /// suspension; losers get [`EngineError::NotAwaitingReview`].
    #[instrument(skip(self, feedback), err)]
    pub async fn resume_review(
        &self,
        task_id: &str,
        approved: bool,
        feedback: Option<String>,
    ) -> Result<AdvanceOutcome, EngineError> {
        let lock = self.lock_for(task_id);
        let _guard = lock.lock().await;

        let resumed = self
            .registry
            .transition_task(
                task_id,
                &[TaskStatus::HumanReviewPending],
                TaskStatus::Processing,
            )
            .await?;
        if !resumed {
            return Err(EngineError::NotAwaitingReview {
                task_id: task_id.to_string(),
            });
        }

        let checkpoint = self
            .checkpoints
            .load_latest(task_id)
            .await?
            .ok_or_else(|| EngineError::MissingCheckpoint {
                task_id: task_id.to_string(),
            })?;
        let state = checkpoint.state;

        let version = state.framework.as_ref().map(|f| f.version).unwrap_or(0);
        let round = self.registry.review_feedback_for_task(task_id).await?.len() as u32 + 1;
        let record = self
            .registry
            .create_review_feedback(task_id, version, approved, feedback.clone(), round)
            .await?;
        tracing::info!(
            task = %task_id,
            approved,
            round,
            feedback_id = %record.feedback_id,
            "review decision recorded"
        );

        if approved {
            let mut merged = state;
            StateDelta::new()
                .clear_edit_source()
                .with_feedback_id(None)
                .with_review_feedback(None)
                .with_history(HistoryEntry::new(NodeId::Review, format!("approved (round {round})")))
                .apply(&mut merged);
            self.checkpoints
                .save(Checkpoint::new(task_id, NodeId::DispatchContent, merged.clone()))
                .await?;
            self.dispatch_content(task_id, merged).await
        } else {
            let mut merged = state;
            StateDelta::new()
                .set_edit_source(EditSource::HumanReview)
                .with_feedback_id(Some(record.feedback_id.clone()))
                .with_review_feedback(feedback)
                .with_history(HistoryEntry::new(NodeId::Review, format!("rejected (round {round})")))
                .apply(&mut merged);
            self.checkpoints
                .save(Checkpoint::new(task_id, NodeId::ReviewEditPlan, merged))
                .await?;
            self.bus.publish(ProgressEvent::progress(
                task_id,
                "review_rejected",
                serde_json::json!({ "round": round }),
            ));
            Ok(AdvanceOutcome::Advanced {
                ran: NodeId::Review,
                next: NodeId::ReviewEditPlan,
            })
        }
    }

    /// Cancel a task: guarded flip to `cancelled`, broker revocation of
    /// queued units, running units drain naturally.
    #[instrument(skip(self), err)]
    pub async fn cancel(&self, task_id: &str) -> Result<(), EngineError> {
        let lock = self.lock_for(task_id);
        let _guard = lock.lock().await;

        let cancelled = self
            .registry
            .transition_task(
                task_id,
                &[
                    TaskStatus::Pending,
                    TaskStatus::Processing,
                    TaskStatus::HumanReviewPending,
                ],
                TaskStatus::Cancelled,
            )
            .await?;
        if !cancelled {
            return Err(EngineError::NotCancellable {
                task_id: task_id.to_string(),
            });
        }

        self.dispatcher.revoke(task_id);
        let revoked = self
            .registry
            .revoke_pending_units(task_id, "revoked: task cancelled")
            .await?;
        if let Some(checkpoint) = self.checkpoints.load_latest(task_id).await? {
            self.checkpoints
                .save(Checkpoint::new(task_id, NodeId::Cancelled, checkpoint.state))
                .await?;
        }
        self.bus.publish(ProgressEvent::progress(
            task_id,
            TaskStatus::Cancelled.encode(),
            serde_json::json!({ "revoked_units": revoked.len() }),
        ));
        tracing::info!(task = %task_id, revoked = revoked.len(), "task cancelled");
        Ok(())
    }
}
