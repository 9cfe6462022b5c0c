//! Progress notification bus.
//!
//! Per-task broadcast channels with at-least-once delivery. Subscribers must
//! apply events idempotently: a replayed `concept_complete` for an already
//! completed unit is normal. Late subscribers call
//! [`NotificationBus::subscribe_with_history`], which synthesizes the current
//! picture from registry rows before handing over the live stream — in the
//! async dispatch model a worker may complete and publish before anyone is
//! listening, so "future deltas only" is not enough.

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::timeout;

use crate::registry::{RegistryError, TaskRegistry};
use crate::types::{ContentType, TaskStatus, WorkUnitStatus};

/// Event discriminator, serialized as the wire `type` field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressKind {
    Progress,
    ConceptStart,
    ConceptComplete,
    ConceptFailed,
    Completed,
    Failed,
}

/// A transient progress message. Published, never queried.
///
/// Construct through the associated functions: they enforce that
/// `content_type` is always present when `concept_id` is — a concept has
/// three independent content types behind one id, and an event that names
/// the concept without the type is ambiguous.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    #[serde(rename = "type")]
    pub kind: ProgressKind,
    pub task_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub concept_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<ContentType>,
    pub status: String,
    #[serde(default)]
    pub data: Value,
    pub at: DateTime<Utc>,
}

impl ProgressEvent {
    /// Task-scoped progress note (no concept attached).
    pub fn progress(task_id: impl Into<String>, status: impl Into<String>, data: Value) -> Self {
        Self {
            kind: ProgressKind::Progress,
            task_id: task_id.into(),
            concept_id: None,
            content_type: None,
            status: status.into(),
            data,
            at: Utc::now(),
        }
    }

    /// Concept-scoped event; the content type is required by signature.
    pub fn concept(
        kind: ProgressKind,
        task_id: impl Into<String>,
        concept_id: impl Into<String>,
        content_type: ContentType,
        status: impl Into<String>,
        data: Value,
    ) -> Self {
        Self {
            kind,
            task_id: task_id.into(),
            concept_id: Some(concept_id.into()),
            content_type: Some(content_type),
            status: status.into(),
            data,
            at: Utc::now(),
        }
    }

    /// Task-level terminal event, published only after every unit resolved.
    pub fn terminal(kind: ProgressKind, task_id: impl Into<String>, status: TaskStatus) -> Self {
        Self {
            kind,
            task_id: task_id.into(),
            concept_id: None,
            content_type: None,
            status: status.encode().to_string(),
            data: Value::Null,
            at: Utc::now(),
        }
    }
}

/// Pub/sub hub for [`ProgressEvent`]s, one broadcast channel per task.
#[derive(Debug)]
pub struct NotificationBus {
    channels: Mutex<FxHashMap<String, broadcast::Sender<ProgressEvent>>>,
    capacity: usize,
    dropped_events: AtomicUsize,
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl NotificationBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Mutex::new(FxHashMap::default()),
            capacity: capacity.max(1),
            dropped_events: AtomicUsize::new(0),
        }
    }

    fn sender_for(&self, task_id: &str) -> broadcast::Sender<ProgressEvent> {
        let mut channels = self.channels.lock().expect("bus lock poisoned");
        channels
            .entry(task_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    /// Publish an event to the task's subscribers. Publishing with no
    /// subscriber is not an error; late subscribers recover via history
    /// replay.
    pub fn publish(&self, event: ProgressEvent) {
        tracing::debug!(
            task = %event.task_id,
            kind = ?event.kind,
            concept = event.concept_id.as_deref().unwrap_or("-"),
            "progress event"
        );
        let sender = self.sender_for(&event.task_id);
        if sender.send(event).is_err() {
            self.dropped_events.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Subscribe to future events for a task.
    pub fn subscribe(&self, task_id: &str) -> EventStream {
        EventStream {
            receiver: self.sender_for(task_id).subscribe(),
        }
    }

    /// Subscribe and reconstruct the current picture for late joiners:
    /// returns replayed events synthesized from registry state, plus the
    /// live stream. The live subscription is opened before the snapshot is
    /// taken, so nothing falls in the gap (duplicates are possible instead,
    /// which subscribers already tolerate).
    pub async fn subscribe_with_history(
        &self,
        task_id: &str,
        registry: &dyn TaskRegistry,
    ) -> Result<(Vec<ProgressEvent>, EventStream), RegistryError> {
        let stream = self.subscribe(task_id);
        let history = replay_from_registry(registry, task_id).await?;
        Ok((history, stream))
    }

    /// Events dropped for lack of any subscriber.
    pub fn dropped(&self) -> usize {
        self.dropped_events.load(Ordering::Relaxed)
    }
}

/// Synthesize the event history a subscriber would have seen, from current
/// registry rows. Ordering matches the live guarantee: per-unit start before
/// resolution, task terminal last.
pub async fn replay_from_registry(
    registry: &dyn TaskRegistry,
    task_id: &str,
) -> Result<Vec<ProgressEvent>, RegistryError> {
    let mut events = Vec::new();
    let Some(task) = registry.get_task(task_id).await? else {
        return Ok(events);
    };
    events.push(ProgressEvent::progress(
        task_id,
        task.status.encode(),
        serde_json::json!({ "current_step": task.current_step }),
    ));
    for unit in registry.work_units_for_task(task_id).await? {
        match unit.status {
            WorkUnitStatus::Pending => {}
            WorkUnitStatus::Generating => {
                events.push(ProgressEvent::concept(
                    ProgressKind::ConceptStart,
                    task_id,
                    unit.concept_id.clone(),
                    unit.content_type,
                    unit.status.encode(),
                    Value::Null,
                ));
            }
            WorkUnitStatus::Completed | WorkUnitStatus::Failed => {
                events.push(ProgressEvent::concept(
                    ProgressKind::ConceptStart,
                    task_id,
                    unit.concept_id.clone(),
                    unit.content_type,
                    WorkUnitStatus::Generating.encode(),
                    Value::Null,
                ));
                let kind = if unit.status == WorkUnitStatus::Completed {
                    ProgressKind::ConceptComplete
                } else {
                    ProgressKind::ConceptFailed
                };
                events.push(ProgressEvent::concept(
                    kind,
                    task_id,
                    unit.concept_id.clone(),
                    unit.content_type,
                    unit.status.encode(),
                    serde_json::json!({ "error": unit.error_message }),
                ));
            }
        }
    }
    match task.status {
        TaskStatus::Completed | TaskStatus::PartialFailure => {
            events.push(ProgressEvent::terminal(
                ProgressKind::Completed,
                task_id,
                task.status,
            ));
        }
        TaskStatus::Failed => {
            events.push(ProgressEvent::terminal(
                ProgressKind::Failed,
                task_id,
                task.status,
            ));
        }
        _ => {}
    }
    Ok(events)
}

/// Receiving half of a task subscription.
#[derive(Debug)]
pub struct EventStream {
    receiver: broadcast::Receiver<ProgressEvent>,
}

impl EventStream {
    pub async fn recv(&mut self) -> Result<ProgressEvent, broadcast::error::RecvError> {
        self.receiver.recv().await
    }

    /// Next event within `duration`; `None` on timeout, lag skips ahead.
    pub async fn next_timeout(&mut self, duration: Duration) -> Option<ProgressEvent> {
        loop {
            match timeout(duration, self.receiver.recv()).await {
                Ok(Ok(event)) => return Some(event),
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                Ok(Err(broadcast::error::RecvError::Closed)) => return None,
                Err(_) => return None,
            }
        }
    }

    /// Adapt into a futures `Stream`, dropping lag markers.
    pub fn into_async_stream(self) -> impl futures_util::Stream<Item = ProgressEvent> {
        futures_util::stream::unfold(self, |mut stream| async move {
            loop {
                match stream.recv().await {
                    Ok(event) => return Some((event, stream)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
    }
}
