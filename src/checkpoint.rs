//! Checkpoint persistence: durable per-task state snapshots.
//!
//! Checkpoints are append-only `(task_id, node, state, created_at)` rows; the
//! latest row per task is the resume point. Suspension is "persist and
//! return", resumption is "load latest and continue" — no live thread or
//! coroutine ever spans a suspension.
//!
//! The [`CheckpointStore`] trait has two implementations: the in-memory store
//! below, and [`SqliteCheckpointStore`](crate::checkpoint_sqlite) for
//! durability. Serialization goes through the serde-friendly
//! [`PersistedCheckpoint`] shape so backend code stays lean.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use thiserror::Error;

use crate::state::WorkflowState;
use crate::types::NodeId;

/// A durable snapshot of one task's workflow state after one node ran.
#[derive(Clone, Debug, PartialEq)]
pub struct Checkpoint {
    pub task_id: String,
    /// The node whose merged output this snapshot captures.
    pub node: NodeId,
    pub state: WorkflowState,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(task_id: impl Into<String>, node: NodeId, state: WorkflowState) -> Self {
        Self {
            task_id: task_id.into(),
            node,
            state,
            created_at: Utc::now(),
        }
    }
}

/// Serde shape for checkpoint rows. The node id travels in its encoded
/// string form so the stored payload stays readable and stable.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PersistedCheckpoint {
    pub task_id: String,
    pub node: String,
    pub state: WorkflowState,
    /// RFC3339 creation time.
    pub created_at: String,
}

impl From<&Checkpoint> for PersistedCheckpoint {
    fn from(cp: &Checkpoint) -> Self {
        Self {
            task_id: cp.task_id.clone(),
            node: cp.node.encode().to_string(),
            state: cp.state.clone(),
            created_at: cp.created_at.to_rfc3339(),
        }
    }
}

impl TryFrom<PersistedCheckpoint> for Checkpoint {
    type Error = CheckpointError;

    fn try_from(p: PersistedCheckpoint) -> Result<Self> {
        let node = NodeId::decode(&p.node).ok_or(CheckpointError::UnknownNode {
            encoded: p.node.clone(),
        })?;
        let created_at = DateTime::parse_from_rfc3339(&p.created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());
        Ok(Self {
            task_id: p.task_id,
            node,
            state: p.state,
            created_at,
        })
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum CheckpointError {
    #[error("checkpoint backend error: {message}")]
    #[diagnostic(
        code(curricle::checkpoint::backend),
        help("Check store connectivity; retried with backoff at the call site.")
    )]
    Backend { message: String },

    #[error("checkpoint serialization failed: {source}")]
    #[diagnostic(code(curricle::checkpoint::serde))]
    Serde {
        #[from]
        source: serde_json::Error,
    },

    #[error("persisted checkpoint references unknown node: {encoded}")]
    #[diagnostic(
        code(curricle::checkpoint::unknown_node),
        help("Refusing to resume at an unrecognized step; inspect the row.")
    )]
    UnknownNode { encoded: String },
}

pub type Result<T> = std::result::Result<T, CheckpointError>;

/// Durable storage for checkpoint rows, keyed by task id.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Append a checkpoint. Rows are never updated in place.
    async fn save(&self, checkpoint: Checkpoint) -> Result<()>;

    /// The resume point: latest checkpoint for the task, if any.
    async fn load_latest(&self, task_id: &str) -> Result<Option<Checkpoint>>;

    /// Full append-order history for a task (audit/debugging).
    async fn history(&self, task_id: &str) -> Result<Vec<Checkpoint>>;
}

/// Volatile checkpoint store for tests and development.
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    rows: Mutex<FxHashMap<String, Vec<Checkpoint>>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(&self, checkpoint: Checkpoint) -> Result<()> {
        self.rows
            .lock()
            .expect("checkpoint lock poisoned")
            .entry(checkpoint.task_id.clone())
            .or_default()
            .push(checkpoint);
        Ok(())
    }

    async fn load_latest(&self, task_id: &str) -> Result<Option<Checkpoint>> {
        Ok(self
            .rows
            .lock()
            .expect("checkpoint lock poisoned")
            .get(task_id)
            .and_then(|rows| rows.last().cloned()))
    }

    async fn history(&self, task_id: &str) -> Result<Vec<Checkpoint>> {
        Ok(self
            .rows
            .lock()
            .expect("checkpoint lock poisoned")
            .get(task_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EditSource;

    #[tokio::test]
    async fn latest_row_wins() {
        let store = InMemoryCheckpointStore::new();
        let mut state = WorkflowState::new("goal");
        store
            .save(Checkpoint::new("t1", NodeId::Analyze, state.clone()))
            .await
            .unwrap();
        state.validation_round = 2;
        store
            .save(Checkpoint::new("t1", NodeId::Validate, state.clone()))
            .await
            .unwrap();

        let latest = store.load_latest("t1").await.unwrap().unwrap();
        assert_eq!(latest.node, NodeId::Validate);
        assert_eq!(latest.state.validation_round, 2);
        assert_eq!(store.history("t1").await.unwrap().len(), 2);
    }

    #[test]
    fn persisted_roundtrip_preserves_edit_source() {
        let mut state = WorkflowState::new("goal");
        state.edit_source = Some(EditSource::HumanReview);
        let cp = Checkpoint::new("t1", NodeId::Edit, state);

        let persisted = PersistedCheckpoint::from(&cp);
        let json = serde_json::to_string(&persisted).unwrap();
        let back: PersistedCheckpoint = serde_json::from_str(&json).unwrap();
        let restored = Checkpoint::try_from(back).unwrap();

        assert_eq!(restored.node, NodeId::Edit);
        assert_eq!(restored.state.edit_source, Some(EditSource::HumanReview));
    }

    #[test]
    fn unknown_node_is_refused() {
        let persisted = PersistedCheckpoint {
            task_id: "t1".into(),
            node: "mystery_step".into(),
            state: WorkflowState::new("goal"),
            created_at: Utc::now().to_rfc3339(),
        };
        assert!(matches!(
            Checkpoint::try_from(persisted),
            Err(CheckpointError::UnknownNode { .. })
        ));
    }
}
