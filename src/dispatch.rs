//! Content dispatch: the broker-backed queue, the dispatcher that fans a
//! framework out into work units, and the worker pool that consumes them.
//!
//! Dispatch is fire-and-remember, not fire-and-forget: every unit is a
//! durable registry row before it is enqueued, so a worker crash is
//! recoverable by re-reading unit state rather than losing in-memory
//! progress. The dispatcher returns as soon as units are queued; finishing
//! the task belongs to whichever worker resolves the last unit
//! ([`TaskRegistry::finalize_if_resolved`]).

use miette::Diagnostic;
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::instrument;

use crate::agents::{Agent, AgentError, AgentRequest, SearchProvider};
use crate::bus::{NotificationBus, ProgressEvent, ProgressKind};
use crate::config::OrchestratorConfig;
use crate::registry::{RegistryError, TaskRecord, TaskRegistry, WorkUnitRecord};
use crate::state::FrameworkDoc;
use crate::types::{ContentType, TaskStatus, WorkUnitStatus};

/// One queued unit of work. Workers re-read the authoritative row from the
/// registry; the message only carries identity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkItem {
    pub unit_id: String,
    pub task_id: String,
}

#[derive(Debug, Error, Diagnostic)]
pub enum DispatchError {
    #[error(transparent)]
    #[diagnostic(code(curricle::dispatch::registry))]
    Registry(#[from] RegistryError),

    #[error("work queue closed")]
    #[diagnostic(
        code(curricle::dispatch::queue_closed),
        help("The worker pool has shut down; no further units can be enqueued.")
    )]
    QueueClosed,

    #[error("task {task_id} has no framework to dispatch")]
    #[diagnostic(code(curricle::dispatch::missing_framework))]
    MissingFramework { task_id: String },

    #[error("nothing to retry: {reason}")]
    #[diagnostic(code(curricle::dispatch::nothing_to_retry))]
    NothingToRetry { reason: String },
}

/// Broker abstraction over the unit queue.
pub trait WorkQueue: Send + Sync {
    fn enqueue(&self, item: WorkItem) -> Result<(), DispatchError>;

    /// Mark a task's not-yet-consumed items revoked; consumers skip them.
    fn revoke_task(&self, task_id: &str);

    /// Receive the next non-revoked item; `None` once closed and drained.
    fn recv(&self) -> futures_util::future::BoxFuture<'_, Option<WorkItem>>;
}

/// In-process mpmc queue over `flume`, with revocation by task id.
pub struct InMemoryQueue {
    tx: flume::Sender<WorkItem>,
    rx: flume::Receiver<WorkItem>,
    revoked: Mutex<FxHashSet<String>>,
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryQueue {
    pub fn new() -> Self {
        let (tx, rx) = flume::unbounded();
        Self {
            tx,
            rx,
            revoked: Mutex::new(FxHashSet::default()),
        }
    }

    fn is_revoked(&self, task_id: &str) -> bool {
        self.revoked
            .lock()
            .expect("queue lock poisoned")
            .contains(task_id)
    }
}

impl WorkQueue for InMemoryQueue {
    fn enqueue(&self, item: WorkItem) -> Result<(), DispatchError> {
        self.tx.send(item).map_err(|_| DispatchError::QueueClosed)
    }

    fn revoke_task(&self, task_id: &str) {
        self.revoked
            .lock()
            .expect("queue lock poisoned")
            .insert(task_id.to_string());
    }

    fn recv(&self) -> futures_util::future::BoxFuture<'_, Option<WorkItem>> {
        Box::pin(async move {
            loop {
                match self.rx.recv_async().await {
                    Ok(item) if self.is_revoked(&item.task_id) => continue,
                    Ok(item) => return Some(item),
                    Err(_) => return None,
                }
            }
        })
    }
}

/// Worker liveness signal: heartbeats for in-flight units and node runs.
///
/// The reconciler consults this before declaring anything stale; a recent
/// beat always wins over row timestamps.
#[derive(Default)]
pub struct WorkerLiveness {
    unit_beats: Mutex<FxHashMap<String, (String, Instant)>>,
    task_beats: Mutex<FxHashMap<String, Instant>>,
}

impl WorkerLiveness {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a heartbeat for an in-flight unit.
    pub fn beat_unit(&self, unit_id: &str, task_id: &str) {
        self.unit_beats
            .lock()
            .expect("liveness lock poisoned")
            .insert(unit_id.to_string(), (task_id.to_string(), Instant::now()));
    }

    pub fn clear_unit(&self, unit_id: &str) {
        self.unit_beats
            .lock()
            .expect("liveness lock poisoned")
            .remove(unit_id);
    }

    /// Record a heartbeat for a task's synchronous node execution.
    pub fn beat_task(&self, task_id: &str) {
        self.task_beats
            .lock()
            .expect("liveness lock poisoned")
            .insert(task_id.to_string(), Instant::now());
    }

    pub fn clear_task(&self, task_id: &str) {
        self.task_beats
            .lock()
            .expect("liveness lock poisoned")
            .remove(task_id);
    }

    /// Whether the unit has beaten within `grace`.
    pub fn unit_is_live(&self, unit_id: &str, grace: Duration) -> bool {
        self.unit_beats
            .lock()
            .expect("liveness lock poisoned")
            .get(unit_id)
            .map(|(_, at)| at.elapsed() < grace)
            .unwrap_or(false)
    }

    /// Whether anything for the task (node run or any unit) has beaten
    /// within `grace`.
    pub fn task_is_live(&self, task_id: &str, grace: Duration) -> bool {
        let node_live = self
            .task_beats
            .lock()
            .expect("liveness lock poisoned")
            .get(task_id)
            .map(|at| at.elapsed() < grace)
            .unwrap_or(false);
        if node_live {
            return true;
        }
        self.unit_beats
            .lock()
            .expect("liveness lock poisoned")
            .values()
            .any(|(t, at)| t == task_id && at.elapsed() < grace)
    }
}

/// Fans an approved framework out into per-concept work units.
pub struct TaskDispatcher {
    registry: Arc<dyn TaskRegistry>,
    queue: Arc<dyn WorkQueue>,
    bus: Arc<NotificationBus>,
}

impl TaskDispatcher {
    pub fn new(
        registry: Arc<dyn TaskRegistry>,
        queue: Arc<dyn WorkQueue>,
        bus: Arc<NotificationBus>,
    ) -> Self {
        Self {
            registry,
            queue,
            bus,
        }
    }

    /// Create one pending unit per `(concept, content_type)` and enqueue
    /// them all, then return immediately. Sets
    /// `current_step = "content_generation_queued"`; the task's final status
    /// belongs to the last worker, never to the dispatcher.
    #[instrument(skip(self, framework), fields(task = %task.task_id))]
    pub async fn dispatch(
        &self,
        task: &TaskRecord,
        framework: &FrameworkDoc,
    ) -> Result<Vec<WorkUnitRecord>, DispatchError> {
        let mut units = Vec::with_capacity(framework.concepts.len() * ContentType::ALL.len());
        for concept in &framework.concepts {
            for content_type in ContentType::ALL {
                let unit = self
                    .registry
                    .create_work_unit(
                        &task.task_id,
                        &task.roadmap_id,
                        &concept.concept_id,
                        content_type,
                    )
                    .await?;
                self.queue.enqueue(WorkItem {
                    unit_id: unit.unit_id.clone(),
                    task_id: task.task_id.clone(),
                })?;
                units.push(unit);
            }
        }
        self.registry
            .set_current_step(&task.task_id, "content_generation_queued")
            .await?;
        self.bus.publish(ProgressEvent::progress(
            task.task_id.clone(),
            "content_generation_queued",
            serde_json::json!({ "units": units.len() }),
        ));
        tracing::info!(units = units.len(), "work units enqueued");
        Ok(units)
    }

    /// Retry a single failed `(concept, content_type)` pair: a fresh retry
    /// task row plus a fresh work unit. The failed unit stays for audit and
    /// sibling units are never touched.
    #[instrument(skip(self))]
    pub async fn retry_content(
        &self,
        concept_id: &str,
        content_type: ContentType,
    ) -> Result<(TaskRecord, WorkUnitRecord), DispatchError> {
        let previous = self
            .registry
            .latest_unit_for_concept(concept_id, content_type)
            .await?
            .ok_or_else(|| DispatchError::NothingToRetry {
                reason: format!("no prior unit for {concept_id}/{content_type}"),
            })?;
        if !previous.status.is_resolved() {
            return Err(DispatchError::NothingToRetry {
                reason: format!(
                    "unit for {concept_id}/{content_type} is still {}",
                    previous.status
                ),
            });
        }

        let task = self
            .registry
            .create_task(crate::registry::NewTask::retry(
                previous.roadmap_id.clone(),
                concept_id,
                content_type,
            ))
            .await?;
        self.registry
            .transition_task(&task.task_id, &[TaskStatus::Pending], TaskStatus::Processing)
            .await?;
        let unit = self
            .registry
            .create_work_unit(&task.task_id, &previous.roadmap_id, concept_id, content_type)
            .await?;
        self.queue.enqueue(WorkItem {
            unit_id: unit.unit_id.clone(),
            task_id: task.task_id.clone(),
        })?;
        self.registry
            .set_current_step(&task.task_id, "content_generation_queued")
            .await?;
        Ok((task, unit))
    }

    /// Retry every failed unit of a roadmap under one `retry_batch` task.
    #[instrument(skip(self))]
    pub async fn retry_batch(
        &self,
        roadmap_id: &str,
    ) -> Result<(TaskRecord, Vec<WorkUnitRecord>), DispatchError> {
        let failed: Vec<_> = self
            .registry
            .work_units_for_roadmap(roadmap_id)
            .await?
            .into_iter()
            .filter(|u| u.status == WorkUnitStatus::Failed)
            .collect();
        if failed.is_empty() {
            return Err(DispatchError::NothingToRetry {
                reason: format!("roadmap {roadmap_id} has no failed units"),
            });
        }

        let task = self
            .registry
            .create_task(crate::registry::NewTask::retry_batch(roadmap_id))
            .await?;
        self.registry
            .transition_task(&task.task_id, &[TaskStatus::Pending], TaskStatus::Processing)
            .await?;
        let mut units = Vec::with_capacity(failed.len());
        for previous in failed {
            // A concurrent retry may already cover a pair; skip it rather
            // than failing the whole batch.
            match self
                .registry
                .create_work_unit(
                    &task.task_id,
                    roadmap_id,
                    &previous.concept_id,
                    previous.content_type,
                )
                .await
            {
                Ok(unit) => {
                    self.queue.enqueue(WorkItem {
                        unit_id: unit.unit_id.clone(),
                        task_id: task.task_id.clone(),
                    })?;
                    units.push(unit);
                }
                Err(RegistryError::Conflict { message }) => {
                    tracing::warn!(%message, "skipping already-covered pair in batch retry");
                }
                Err(e) => return Err(e.into()),
            }
        }
        self.registry
            .set_current_step(&task.task_id, "content_generation_queued")
            .await?;
        Ok((task, units))
    }

    /// Revoke a task's not-yet-started units at the broker.
    pub fn revoke(&self, task_id: &str) {
        self.queue.revoke_task(task_id);
    }
}

/// A pool of content workers consuming the queue.
///
/// Per-task concurrency is capped by a semaphore per task id so one large
/// roadmap cannot starve the others. Workers are cooperative: cancellation
/// revokes queued units and lets running ones drain.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    shutdown: Arc<tokio::sync::Notify>,
}

/// Everything a worker needs, shared across the pool.
pub struct WorkerContext {
    pub registry: Arc<dyn TaskRegistry>,
    pub bus: Arc<NotificationBus>,
    pub agent: Arc<dyn Agent>,
    pub search: Arc<dyn SearchProvider>,
    pub liveness: Arc<WorkerLiveness>,
    pub config: OrchestratorConfig,
    task_slots: Mutex<FxHashMap<String, Arc<Semaphore>>>,
}

impl WorkerContext {
    pub fn new(
        registry: Arc<dyn TaskRegistry>,
        bus: Arc<NotificationBus>,
        agent: Arc<dyn Agent>,
        search: Arc<dyn SearchProvider>,
        liveness: Arc<WorkerLiveness>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            registry,
            bus,
            agent,
            search,
            liveness,
            config,
            task_slots: Mutex::new(FxHashMap::default()),
        }
    }

    fn slots_for(&self, task_id: &str) -> Arc<Semaphore> {
        self.task_slots
            .lock()
            .expect("slots lock poisoned")
            .entry(task_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.config.per_task_concurrency.max(1))))
            .clone()
    }
}

impl WorkerPool {
    /// Spawn `config.worker_count` workers over the queue.
    pub fn spawn(ctx: Arc<WorkerContext>, queue: Arc<dyn WorkQueue>) -> Self {
        let shutdown = Arc::new(tokio::sync::Notify::new());
        let mut handles = Vec::with_capacity(ctx.config.worker_count);
        for worker_id in 0..ctx.config.worker_count.max(1) {
            let ctx = ctx.clone();
            let queue = queue.clone();
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let item = tokio::select! {
                        _ = shutdown.notified() => break,
                        item = queue.recv() => match item {
                            Some(item) => item,
                            None => break,
                        },
                    };
                    process_work_item(&ctx, item, worker_id).await;
                }
                tracing::debug!(worker_id, "content worker stopped");
            }));
        }
        Self { handles, shutdown }
    }

    /// Signal workers to stop after their current unit and wait for them.
    pub async fn shutdown(self) {
        self.shutdown.notify_waiters();
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

/// Process one queued unit end to end. Public for direct-drive tests; the
/// pool calls this in a loop.
pub async fn process_work_item(ctx: &WorkerContext, item: WorkItem, worker_id: usize) {
    let slots = ctx.slots_for(&item.task_id);
    let _permit = match slots.acquire().await {
        Ok(permit) => permit,
        Err(_) => return,
    };

    let unit = match ctx.registry.get_work_unit(&item.unit_id).await {
        Ok(Some(unit)) => unit,
        Ok(None) => {
            tracing::warn!(unit = %item.unit_id, "queued unit vanished; skipping");
            return;
        }
        Err(e) => {
            tracing::error!(unit = %item.unit_id, error = %e, "unit lookup failed");
            return;
        }
    };

    // Guarded claim: loses cleanly to duplicates, revocation, cancellation.
    match ctx.registry.claim_work_unit(&unit.unit_id).await {
        Ok(true) => {}
        Ok(false) => {
            tracing::debug!(unit = %unit.unit_id, "unit not claimable; skipping");
            return;
        }
        Err(e) => {
            tracing::error!(unit = %unit.unit_id, error = %e, "claim failed");
            return;
        }
    }

    ctx.liveness.beat_unit(&unit.unit_id, &unit.task_id);
    ctx.bus.publish(ProgressEvent::concept(
        ProgressKind::ConceptStart,
        unit.task_id.clone(),
        unit.concept_id.clone(),
        unit.content_type,
        WorkUnitStatus::Generating.encode(),
        serde_json::json!({ "worker": worker_id }),
    ));

    let outcome = tokio::time::timeout(ctx.config.hard_timeout, generate_with_retry(ctx, &unit))
        .await
        .unwrap_or_else(|_| {
            Err(AgentError::unavailable(format!(
                "hard timeout after {:?}",
                ctx.config.hard_timeout
            )))
        });

    match outcome {
        Ok(_content) => {
            match ctx.registry.complete_work_unit(&unit.unit_id).await {
                Ok(true) => {
                    ctx.bus.publish(ProgressEvent::concept(
                        ProgressKind::ConceptComplete,
                        unit.task_id.clone(),
                        unit.concept_id.clone(),
                        unit.content_type,
                        WorkUnitStatus::Completed.encode(),
                        Value::Null,
                    ));
                }
                Ok(false) => {
                    tracing::debug!(unit = %unit.unit_id, "completion replay ignored");
                }
                Err(e) => {
                    tracing::error!(unit = %unit.unit_id, error = %e, "completion write failed");
                }
            }
        }
        Err(err) => {
            match ctx
                .registry
                .fail_work_unit(&unit.unit_id, &err.to_string())
                .await
            {
                Ok(true) => {
                    ctx.bus.publish(ProgressEvent::concept(
                        ProgressKind::ConceptFailed,
                        unit.task_id.clone(),
                        unit.concept_id.clone(),
                        unit.content_type,
                        WorkUnitStatus::Failed.encode(),
                        serde_json::json!({ "error": err.to_string() }),
                    ));
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(unit = %unit.unit_id, error = %e, "failure write failed");
                }
            }
        }
    }

    ctx.liveness.clear_unit(&unit.unit_id);
    finalize_task(ctx.registry.as_ref(), &ctx.bus, &unit.task_id).await;
}

/// Run the last-worker-finalizes protocol and publish the terminal event if
/// this caller won. Shared with the reconciler, which also resolves units.
pub async fn finalize_task(registry: &dyn TaskRegistry, bus: &NotificationBus, task_id: &str) {
    match registry.finalize_if_resolved(task_id).await {
        Ok(Some(aggregate)) => {
            let kind = if aggregate == TaskStatus::Completed {
                ProgressKind::Completed
            } else {
                ProgressKind::Failed
            };
            bus.publish(ProgressEvent::terminal(kind, task_id, aggregate));
            tracing::info!(task = %task_id, status = %aggregate, "task finalized");
        }
        Ok(None) => {}
        Err(e) => {
            tracing::error!(task = %task_id, error = %e, "finalize check failed");
        }
    }
}

/// Bounded per-attempt generation with soft timeouts; the hard timeout is
/// enforced by the caller around the whole loop.
async fn generate_with_retry(ctx: &WorkerContext, unit: &WorkUnitRecord) -> Result<Value, AgentError> {
    let policy = ctx.config.worker_retry;
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        if let Err(e) = ctx.registry.bump_unit_attempts(&unit.unit_id).await {
            tracing::warn!(unit = %unit.unit_id, error = %e, "attempt count update failed");
        }
        ctx.liveness.beat_unit(&unit.unit_id, &unit.task_id);

        let attempt_result =
            tokio::time::timeout(ctx.config.soft_timeout, generate_once(ctx, unit)).await;
        let outcome = match attempt_result {
            Ok(result) => result,
            Err(_) => Err(AgentError::unavailable(format!(
                "soft timeout after {:?}",
                ctx.config.soft_timeout
            ))),
        };

        match outcome {
            Ok(content) => return Ok(content),
            Err(err) if attempt < policy.max_attempts => {
                tracing::warn!(
                    unit = %unit.unit_id,
                    attempt,
                    error = %err,
                    "generation attempt failed; retrying"
                );
                tokio::time::sleep(policy.delay_for(attempt)).await;
            }
            Err(err) => return Err(err),
        }
    }
}

async fn generate_once(ctx: &WorkerContext, unit: &WorkUnitRecord) -> Result<Value, AgentError> {
    let payload = match unit.content_type {
        ContentType::Resources => {
            // Resource recommendation grounds the agent in ranked search
            // hits; the fallback provider kicks in inside the seam.
            let hits = ctx
                .search
                .query(&format!("learning resources for {}", unit.concept_id))
                .await
                .map_err(|e| AgentError::unavailable(e.to_string()))?;
            serde_json::json!({
                "task_id": unit.task_id,
                "concept_id": unit.concept_id,
                "hits": hits,
            })
        }
        _ => serde_json::json!({
            "task_id": unit.task_id,
            "concept_id": unit.concept_id,
        }),
    };
    let purpose = format!("generate_{}", unit.content_type);
    ctx.agent.invoke(AgentRequest::new(purpose, payload)).await
}
