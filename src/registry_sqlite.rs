//! SQLite-backed task registry.
//!
//! Same contract as [`MemoryRegistry`](crate::registry::MemoryRegistry),
//! with the guards expressed as optimistic conditional updates: every write
//! carries a `WHERE status = <observed>` clause and loses cleanly (zero rows
//! affected) when another writer got there first. Multi-step invariants run
//! inside a transaction per task.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool, sqlite::SqliteRow};
use std::sync::Arc;
use tracing::instrument;

use crate::registry::{
    EditPlanRecord, NewTask, RegistryError, Result, ReviewFeedbackRecord, TaskRecord,
    TaskRegistry, WorkUnitRecord,
};
use crate::state::EditIntent;
use crate::types::{ContentType, TaskStatus, TaskType, WorkUnitStatus};

/// Durable registry over a shared SQLite pool.
pub struct SqliteRegistry {
    pool: Arc<SqlitePool>,
}

impl std::fmt::Debug for SqliteRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteRegistry").finish()
    }
}

impl SqliteRegistry {
    /// Connect (or create) a SQLite database, e.g. `sqlite://curricle.db`.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = crate::checkpoint_sqlite::connect_pool(database_url)
            .await
            .map_err(|e| RegistryError::Backend {
                message: e.to_string(),
            })?;
        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Reuse an already-connected pool (shared with the checkpoint store).
    pub fn from_pool(pool: Arc<SqlitePool>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> Arc<SqlitePool> {
        self.pool.clone()
    }
}

fn backend(op: &str) -> impl FnOnce(sqlx::Error) -> RegistryError + '_ {
    move |e| RegistryError::Backend {
        message: format!("{op}: {e}"),
    }
}

fn parse_dt(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn decode_or_backend<T>(decoded: Option<T>, what: &str, raw: &str) -> Result<T> {
    decoded.ok_or_else(|| RegistryError::Backend {
        message: format!("stored {what} has unknown encoding: {raw}"),
    })
}

fn row_to_task(row: &SqliteRow) -> Result<TaskRecord> {
    let status_raw: String = row.get("status");
    let type_raw: String = row.get("task_type");
    let content_raw: Option<String> = row.get("content_type");
    let created: String = row.get("created_at");
    let updated: String = row.get("updated_at");
    Ok(TaskRecord {
        task_id: row.get("task_id"),
        roadmap_id: row.get("roadmap_id"),
        status: decode_or_backend(TaskStatus::decode(&status_raw), "task status", &status_raw)?,
        current_step: row.get("current_step"),
        task_type: decode_or_backend(TaskType::decode(&type_raw), "task type", &type_raw)?,
        concept_id: row.get("concept_id"),
        content_type: content_raw
            .as_deref()
            .map(|raw| decode_or_backend(ContentType::decode(raw), "content type", raw))
            .transpose()?,
        error_message: row.get("error_message"),
        created_at: parse_dt(&created),
        updated_at: parse_dt(&updated),
    })
}

fn row_to_unit(row: &SqliteRow) -> Result<WorkUnitRecord> {
    let status_raw: String = row.get("status");
    let content_raw: String = row.get("content_type");
    let created: String = row.get("created_at");
    let updated: String = row.get("updated_at");
    let attempts: i64 = row.get("attempts");
    Ok(WorkUnitRecord {
        unit_id: row.get("unit_id"),
        task_id: row.get("task_id"),
        roadmap_id: row.get("roadmap_id"),
        concept_id: row.get("concept_id"),
        content_type: decode_or_backend(
            ContentType::decode(&content_raw),
            "content type",
            &content_raw,
        )?,
        status: decode_or_backend(
            WorkUnitStatus::decode(&status_raw),
            "work unit status",
            &status_raw,
        )?,
        attempts: attempts as u32,
        error_message: row.get("error_message"),
        created_at: parse_dt(&created),
        updated_at: parse_dt(&updated),
    })
}

fn row_to_feedback(row: &SqliteRow) -> ReviewFeedbackRecord {
    let created: String = row.get("created_at");
    let snapshot: i64 = row.get("roadmap_version_snapshot");
    let round: i64 = row.get("review_round");
    let approved: i64 = row.get("approved");
    ReviewFeedbackRecord {
        feedback_id: row.get("feedback_id"),
        task_id: row.get("task_id"),
        roadmap_version_snapshot: snapshot as u32,
        approved: approved != 0,
        feedback_text: row.get("feedback_text"),
        review_round: round as u32,
        created_at: parse_dt(&created),
    }
}

fn row_to_plan(row: &SqliteRow) -> Result<EditPlanRecord> {
    let created: String = row.get("created_at");
    let intents_json: String = row.get("intents_json");
    let needs: i64 = row.get("needs_clarification");
    let intents: Vec<EditIntent> =
        serde_json::from_str(&intents_json).map_err(|e| RegistryError::Backend {
            message: format!("stored edit intents unreadable: {e}"),
        })?;
    Ok(EditPlanRecord {
        plan_id: row.get("plan_id"),
        task_id: row.get("task_id"),
        feedback_id: row.get("feedback_id"),
        intents,
        confidence: row.get("confidence"),
        needs_clarification: needs != 0,
        created_at: parse_dt(&created),
    })
}

const ACTIVE_TASK_STATUSES: &str = "('pending', 'processing', 'human_review_pending')";

#[async_trait]
impl TaskRegistry for SqliteRegistry {
    #[instrument(skip(self, new_task), err)]
    async fn create_task(&self, new_task: NewTask) -> Result<TaskRecord> {
        let now = Utc::now();
        let record = TaskRecord {
            task_id: uuid::Uuid::new_v4().to_string(),
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
        sqlx::query(
            r#"
            INSERT INTO tasks (
                task_id, roadmap_id, status, current_step, task_type,
                concept_id, content_type, error_message, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL, ?8, ?9)
            "#,
        )
        .bind(&record.task_id)
        .bind(&record.roadmap_id)
        .bind(record.status.encode())
        .bind(&record.current_step)
        .bind(record.task_type.encode())
        .bind(&record.concept_id)
        .bind(record.content_type.map(|c| c.encode()))
        .bind(record.created_at.to_rfc3339())
        .bind(record.updated_at.to_rfc3339())
        .execute(&*self.pool)
        .await
        .map_err(backend("insert task"))?;
        Ok(record)
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        let row = sqlx::query("SELECT * FROM tasks WHERE task_id = ?1")
            .bind(task_id)
            .fetch_optional(&*self.pool)
            .await
            .map_err(backend("select task"))?;
        row.as_ref().map(row_to_task).transpose()
    }

    async fn tasks_for_roadmap(&self, roadmap_id: &str) -> Result<Vec<TaskRecord>> {
        let rows = sqlx::query("SELECT * FROM tasks WHERE roadmap_id = ?1 ORDER BY created_at")
            .bind(roadmap_id)
            .fetch_all(&*self.pool)
            .await
            .map_err(backend("select roadmap tasks"))?;
        rows.iter().map(row_to_task).collect()
    }

    #[instrument(skip(self), err)]
    async fn transition_task(
        &self,
        task_id: &str,
        expected: &[TaskStatus],
        next: TaskStatus,
    ) -> Result<bool> {
        let current = self
            .get_task(task_id)
            .await?
            .ok_or_else(|| RegistryError::NotFound {
                what: "task",
                id: task_id.to_string(),
            })?
            .status;
        if !expected.contains(&current) {
            return Ok(false);
        }
        if !current.can_transition_to(next) {
            return Err(RegistryError::InvalidTransition {
                from: current.encode().to_string(),
                to: next.encode().to_string(),
            });
        }
        // Optimistic guard: apply only if the row still holds the status we
        // based the decision on.
        let result = sqlx::query(
            "UPDATE tasks SET status = ?1, updated_at = ?2 WHERE task_id = ?3 AND status = ?4",
        )
        .bind(next.encode())
        .bind(Utc::now().to_rfc3339())
        .bind(task_id)
        .bind(current.encode())
        .execute(&*self.pool)
        .await
        .map_err(backend("transition task"))?;
        Ok(result.rows_affected() == 1)
    }

    async fn set_current_step(&self, task_id: &str, step: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE tasks SET current_step = ?1, updated_at = ?2 WHERE task_id = ?3",
        )
        .bind(step)
        .bind(Utc::now().to_rfc3339())
        .bind(task_id)
        .execute(&*self.pool)
        .await
        .map_err(backend("set current step"))?;
        if result.rows_affected() == 0 {
            return Err(RegistryError::NotFound {
                what: "task",
                id: task_id.to_string(),
            });
        }
        Ok(())
    }

    async fn set_task_error(&self, task_id: &str, message: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE tasks SET error_message = ?1, updated_at = ?2 WHERE task_id = ?3",
        )
        .bind(message)
        .bind(Utc::now().to_rfc3339())
        .bind(task_id)
        .execute(&*self.pool)
        .await
        .map_err(backend("set task error"))?;
        if result.rows_affected() == 0 {
            return Err(RegistryError::NotFound {
                what: "task",
                id: task_id.to_string(),
            });
        }
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn create_work_unit(
        &self,
        task_id: &str,
        roadmap_id: &str,
        concept_id: &str,
        content_type: ContentType,
    ) -> Result<WorkUnitRecord> {
        let mut tx = self.pool.begin().await.map_err(backend("tx begin"))?;

        let unresolved: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM work_units
            WHERE roadmap_id = ?1 AND concept_id = ?2 AND content_type = ?3
              AND status IN ('pending', 'generating')
            "#,
        )
        .bind(roadmap_id)
        .bind(concept_id)
        .bind(content_type.encode())
        .fetch_one(&mut *tx)
        .await
        .map_err(backend("count unresolved units"))?;
        if unresolved > 0 {
            return Err(RegistryError::Conflict {
                message: format!(
                    "unresolved work unit already exists for {roadmap_id}/{concept_id}/{content_type}"
                ),
            });
        }

        let now = Utc::now();
        let record = WorkUnitRecord {
            unit_id: uuid::Uuid::new_v4().to_string(),
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
        sqlx::query(
            r#"
            INSERT INTO work_units (
                unit_id, task_id, roadmap_id, concept_id, content_type,
                status, attempts, error_message, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, NULL, ?7, ?8)
            "#,
        )
        .bind(&record.unit_id)
        .bind(&record.task_id)
        .bind(&record.roadmap_id)
        .bind(&record.concept_id)
        .bind(record.content_type.encode())
        .bind(record.status.encode())
        .bind(record.created_at.to_rfc3339())
        .bind(record.updated_at.to_rfc3339())
        .execute(&mut *tx)
        .await
        .map_err(backend("insert work unit"))?;

        tx.commit().await.map_err(backend("tx commit"))?;
        Ok(record)
    }

    async fn get_work_unit(&self, unit_id: &str) -> Result<Option<WorkUnitRecord>> {
        let row = sqlx::query("SELECT * FROM work_units WHERE unit_id = ?1")
            .bind(unit_id)
            .fetch_optional(&*self.pool)
            .await
            .map_err(backend("select work unit"))?;
        row.as_ref().map(row_to_unit).transpose()
    }

    async fn work_units_for_task(&self, task_id: &str) -> Result<Vec<WorkUnitRecord>> {
        let rows = sqlx::query("SELECT * FROM work_units WHERE task_id = ?1 ORDER BY created_at")
            .bind(task_id)
            .fetch_all(&*self.pool)
            .await
            .map_err(backend("select task units"))?;
        rows.iter().map(row_to_unit).collect()
    }

    async fn work_units_for_roadmap(&self, roadmap_id: &str) -> Result<Vec<WorkUnitRecord>> {
        let rows =
            sqlx::query("SELECT * FROM work_units WHERE roadmap_id = ?1 ORDER BY created_at")
                .bind(roadmap_id)
                .fetch_all(&*self.pool)
                .await
                .map_err(backend("select roadmap units"))?;
        rows.iter().map(row_to_unit).collect()
    }

    async fn latest_unit_for_concept(
        &self,
        concept_id: &str,
        content_type: ContentType,
    ) -> Result<Option<WorkUnitRecord>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM work_units
            WHERE concept_id = ?1 AND content_type = ?2
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(concept_id)
        .bind(content_type.encode())
        .fetch_optional(&*self.pool)
        .await
        .map_err(backend("select latest unit"))?;
        row.as_ref().map(row_to_unit).transpose()
    }

    #[instrument(skip(self), err)]
    async fn claim_work_unit(&self, unit_id: &str) -> Result<bool> {
        // Single atomic statement: claims only a pending unit whose task is
        // still active. Losing the race means zero rows affected.
        let result = sqlx::query(&format!(
            r#"
            UPDATE work_units SET status = 'generating', updated_at = ?1
            WHERE unit_id = ?2 AND status = 'pending'
              AND EXISTS (
                SELECT 1 FROM tasks
                WHERE tasks.task_id = work_units.task_id
                  AND tasks.status IN {ACTIVE_TASK_STATUSES}
              )
            "#
        ))
        .bind(Utc::now().to_rfc3339())
        .bind(unit_id)
        .execute(&*self.pool)
        .await
        .map_err(backend("claim work unit"))?;
        if result.rows_affected() == 1 {
            return Ok(true);
        }
        if self.get_work_unit(unit_id).await?.is_none() {
            return Err(RegistryError::NotFound {
                what: "work unit",
                id: unit_id.to_string(),
            });
        }
        Ok(false)
    }

    async fn complete_work_unit(&self, unit_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE work_units SET status = 'completed', updated_at = ?1
            WHERE unit_id = ?2 AND status = 'generating'
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(unit_id)
        .execute(&*self.pool)
        .await
        .map_err(backend("complete work unit"))?;
        if result.rows_affected() == 1 {
            return Ok(true);
        }
        if self.get_work_unit(unit_id).await?.is_none() {
            return Err(RegistryError::NotFound {
                what: "work unit",
                id: unit_id.to_string(),
            });
        }
        Ok(false)
    }

    async fn fail_work_unit(&self, unit_id: &str, error: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE work_units SET status = 'failed', error_message = ?1, updated_at = ?2
            WHERE unit_id = ?3 AND status IN ('pending', 'generating')
            "#,
        )
        .bind(error)
        .bind(Utc::now().to_rfc3339())
        .bind(unit_id)
        .execute(&*self.pool)
        .await
        .map_err(backend("fail work unit"))?;
        if result.rows_affected() == 1 {
            return Ok(true);
        }
        if self.get_work_unit(unit_id).await?.is_none() {
            return Err(RegistryError::NotFound {
                what: "work unit",
                id: unit_id.to_string(),
            });
        }
        Ok(false)
    }

    async fn bump_unit_attempts(&self, unit_id: &str) -> Result<u32> {
        let result = sqlx::query(
            "UPDATE work_units SET attempts = attempts + 1, updated_at = ?1 WHERE unit_id = ?2",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(unit_id)
        .execute(&*self.pool)
        .await
        .map_err(backend("bump attempts"))?;
        if result.rows_affected() == 0 {
            return Err(RegistryError::NotFound {
                what: "work unit",
                id: unit_id.to_string(),
            });
        }
        let attempts: i64 = sqlx::query_scalar("SELECT attempts FROM work_units WHERE unit_id = ?1")
            .bind(unit_id)
            .fetch_one(&*self.pool)
            .await
            .map_err(backend("read attempts"))?;
        Ok(attempts as u32)
    }

    #[instrument(skip(self), err)]
    async fn finalize_if_resolved(&self, task_id: &str) -> Result<Option<TaskStatus>> {
        let mut tx = self.pool.begin().await.map_err(backend("tx begin"))?;

        let (total, unresolved, failed): (i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*),
                COALESCE(SUM(status IN ('pending', 'generating')), 0),
                COALESCE(SUM(status = 'failed'), 0)
            FROM work_units WHERE task_id = ?1
            "#,
        )
        .bind(task_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(backend("count units"))?;

        if total == 0 || unresolved > 0 {
            return Ok(None);
        }
        let aggregate = if failed > 0 {
            TaskStatus::PartialFailure
        } else {
            TaskStatus::Completed
        };

        // The processing guard makes this a single-winner write.
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = ?1, current_step = 'content_generation_resolved', updated_at = ?2
            WHERE task_id = ?3 AND status = 'processing'
            "#,
        )
        .bind(aggregate.encode())
        .bind(Utc::now().to_rfc3339())
        .bind(task_id)
        .execute(&mut *tx)
        .await
        .map_err(backend("finalize task"))?;

        tx.commit().await.map_err(backend("tx commit"))?;
        Ok((result.rows_affected() == 1).then_some(aggregate))
    }

    async fn revoke_pending_units(&self, task_id: &str, reason: &str) -> Result<Vec<String>> {
        let mut tx = self.pool.begin().await.map_err(backend("tx begin"))?;
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT unit_id FROM work_units WHERE task_id = ?1 AND status = 'pending'",
        )
        .bind(task_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(backend("select pending units"))?;

        sqlx::query(
            r#"
            UPDATE work_units SET status = 'failed', error_message = ?1, updated_at = ?2
            WHERE task_id = ?3 AND status = 'pending'
            "#,
        )
        .bind(reason)
        .bind(Utc::now().to_rfc3339())
        .bind(task_id)
        .execute(&mut *tx)
        .await
        .map_err(backend("revoke pending units"))?;

        tx.commit().await.map_err(backend("tx commit"))?;
        Ok(ids)
    }

    async fn active_tasks(&self) -> Result<Vec<TaskRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT * FROM tasks WHERE status IN {ACTIVE_TASK_STATUSES} ORDER BY created_at"
        ))
        .fetch_all(&*self.pool)
        .await
        .map_err(backend("select active tasks"))?;
        rows.iter().map(row_to_task).collect()
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
            feedback_id: uuid::Uuid::new_v4().to_string(),
            task_id: task_id.to_string(),
            roadmap_version_snapshot,
            approved,
            feedback_text,
            review_round,
            created_at: Utc::now(),
        };
        sqlx::query(
            r#"
            INSERT INTO review_feedback (
                feedback_id, task_id, roadmap_version_snapshot, approved,
                feedback_text, review_round, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(&record.feedback_id)
        .bind(&record.task_id)
        .bind(record.roadmap_version_snapshot as i64)
        .bind(record.approved as i64)
        .bind(&record.feedback_text)
        .bind(record.review_round as i64)
        .bind(record.created_at.to_rfc3339())
        .execute(&*self.pool)
        .await
        .map_err(backend("insert review feedback"))?;
        Ok(record)
    }

    async fn review_feedback_for_task(&self, task_id: &str) -> Result<Vec<ReviewFeedbackRecord>> {
        let rows =
            sqlx::query("SELECT * FROM review_feedback WHERE task_id = ?1 ORDER BY created_at")
                .bind(task_id)
                .fetch_all(&*self.pool)
                .await
                .map_err(backend("select review feedback"))?;
        Ok(rows.iter().map(row_to_feedback).collect())
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
            plan_id: uuid::Uuid::new_v4().to_string(),
            task_id: task_id.to_string(),
            feedback_id,
            intents,
            confidence,
            needs_clarification,
            created_at: Utc::now(),
        };
        let intents_json =
            serde_json::to_string(&record.intents).map_err(|e| RegistryError::Backend {
                message: format!("serialize intents: {e}"),
            })?;
        sqlx::query(
            r#"
            INSERT INTO edit_plans (
                plan_id, task_id, feedback_id, intents_json, confidence,
                needs_clarification, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(&record.plan_id)
        .bind(&record.task_id)
        .bind(&record.feedback_id)
        .bind(&intents_json)
        .bind(record.confidence)
        .bind(record.needs_clarification as i64)
        .bind(record.created_at.to_rfc3339())
        .execute(&*self.pool)
        .await
        .map_err(backend("insert edit plan"))?;
        Ok(record)
    }

    async fn edit_plans_for_task(&self, task_id: &str) -> Result<Vec<EditPlanRecord>> {
        let rows = sqlx::query("SELECT * FROM edit_plans WHERE task_id = ?1 ORDER BY created_at")
            .bind(task_id)
            .fetch_all(&*self.pool)
            .await
            .map_err(backend("select edit plans"))?;
        rows.iter().map(row_to_plan).collect()
    }
}
