//! SQLite-backed checkpoint store.
//!
//! Rows are append-only inserts into the `checkpoints` table; the resume
//! point is the highest-rowid entry per task. Serialization goes through
//! [`PersistedCheckpoint`](crate::checkpoint::PersistedCheckpoint); this
//! module is database I/O only.
//!
//! With the `sqlite-migrations` feature (default) embedded migrations run on
//! connect; without it, schema management is external.

use sqlx::{Row, SqlitePool};
use std::sync::Arc;
use tracing::instrument;

use crate::checkpoint::{
    Checkpoint, CheckpointError, CheckpointStore, PersistedCheckpoint, Result,
};

/// Ensure the sqlite file behind `database_url` exists so a first connect
/// does not fail on a fresh deployment.
pub(crate) fn ensure_sqlite_file(database_url: &str) {
    if let Some(path) = database_url.strip_prefix("sqlite://") {
        let path = path.trim();
        if !path.is_empty() && path != ":memory:" {
            let p = std::path::Path::new(path);
            if let Some(parent) = p.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            if !p.exists() {
                let _ = std::fs::File::create_new(p);
            }
        }
    }
}

pub(crate) async fn connect_pool(database_url: &str) -> Result<SqlitePool> {
    ensure_sqlite_file(database_url);
    let pool = SqlitePool::connect(database_url)
        .await
        .map_err(|e| CheckpointError::Backend {
            message: format!("connect error: {e}"),
        })?;
    #[cfg(feature = "sqlite-migrations")]
    {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| CheckpointError::Backend {
                message: format!("migration failure: {e}"),
            })?;
    }
    Ok(pool)
}

/// Durable checkpoint store over a shared SQLite pool.
pub struct SqliteCheckpointStore {
    pool: Arc<SqlitePool>,
}

impl std::fmt::Debug for SqliteCheckpointStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteCheckpointStore").finish()
    }
}

impl SqliteCheckpointStore {
    /// Connect (or create) a SQLite database, e.g. `sqlite://curricle.db`.
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = connect_pool(database_url).await?;
        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Reuse an already-connected pool (shared with the registry).
    pub fn from_pool(pool: Arc<SqlitePool>) -> Self {
        Self { pool }
    }
}

fn backend(op: &str) -> impl FnOnce(sqlx::Error) -> CheckpointError + '_ {
    move |e| CheckpointError::Backend {
        message: format!("{op}: {e}"),
    }
}

#[async_trait::async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    #[instrument(skip(self, checkpoint), err)]
    async fn save(&self, checkpoint: Checkpoint) -> Result<()> {
        let persisted = PersistedCheckpoint::from(&checkpoint);
        let state_json = serde_json::to_string(&persisted.state)?;
        sqlx::query(
            r#"
            INSERT INTO checkpoints (task_id, node, state_json, created_at)
            VALUES (?1, ?2, ?3, ?4)
            "#,
        )
        .bind(&persisted.task_id)
        .bind(&persisted.node)
        .bind(&state_json)
        .bind(&persisted.created_at)
        .execute(&*self.pool)
        .await
        .map_err(backend("insert checkpoint"))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn load_latest(&self, task_id: &str) -> Result<Option<Checkpoint>> {
        let row = sqlx::query(
            r#"
            SELECT task_id, node, state_json, created_at
            FROM checkpoints
            WHERE task_id = ?1
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(task_id)
        .fetch_optional(&*self.pool)
        .await
        .map_err(backend("select latest checkpoint"))?;

        row.map(row_to_checkpoint).transpose()
    }

    #[instrument(skip(self), err)]
    async fn history(&self, task_id: &str) -> Result<Vec<Checkpoint>> {
        let rows = sqlx::query(
            r#"
            SELECT task_id, node, state_json, created_at
            FROM checkpoints
            WHERE task_id = ?1
            ORDER BY id ASC
            "#,
        )
        .bind(task_id)
        .fetch_all(&*self.pool)
        .await
        .map_err(backend("select checkpoint history"))?;

        rows.into_iter().map(row_to_checkpoint).collect()
    }
}

fn row_to_checkpoint(row: sqlx::sqlite::SqliteRow) -> Result<Checkpoint> {
    let state_json: String = row.get("state_json");
    let persisted = PersistedCheckpoint {
        task_id: row.get("task_id"),
        node: row.get("node"),
        state: serde_json::from_str(&state_json)?,
        created_at: row.get("created_at"),
    };
    Checkpoint::try_from(persisted)
}
