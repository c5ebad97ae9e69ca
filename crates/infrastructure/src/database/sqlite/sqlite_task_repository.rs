use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kaas_core::{OrchestratorError, OrchestratorResult};
use kaas_domain::{Task, TaskRepository};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info, instrument};

use crate::database::MappingHelpers;

pub struct SqliteTaskRepository {
    pool: SqlitePool,
}

impl SqliteTaskRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_task(row: &SqliteRow) -> OrchestratorResult<Task> {
        Ok(Task {
            id: row.try_get("id")?,
            operation: MappingHelpers::parse_json(row, "operation")?,
            status: MappingHelpers::parse_enum(row, "status")?,
            attempts: MappingHelpers::get_u32(row, "attempts")?,
            max_retries: MappingHelpers::get_u32(row, "max_retries")?,
            scheduled_at: row.try_get("scheduled_at")?,
            worker_id: row.try_get("worker_id")?,
            last_error: row.try_get("last_error")?,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    fn ensure_updated(rows_affected: u64, id: &str) -> OrchestratorResult<()> {
        if rows_affected == 0 {
            return Err(OrchestratorError::not_found("运行中的任务", id));
        }
        Ok(())
    }
}

#[async_trait]
impl TaskRepository for SqliteTaskRepository {
    #[instrument(skip(self, task), fields(task_id = %task.id, kind = %task.kind()))]
    async fn create(&self, task: &Task) -> OrchestratorResult<()> {
        let target = task.target();
        sqlx::query(
            r#"
            INSERT INTO tasks (id, kind, target_type, target_id, operation, status, attempts,
                               max_retries, scheduled_at, worker_id, last_error, created_at,
                               started_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(&task.id)
        .bind(task.kind().as_str())
        .bind(target.type_str())
        .bind(target.id())
        .bind(MappingHelpers::to_json(&task.operation)?)
        .bind(task.status.as_str())
        .bind(i64::from(task.attempts))
        .bind(i64::from(task.max_retries))
        .bind(task.scheduled_at)
        .bind(&task.worker_id)
        .bind(&task.last_error)
        .bind(task.created_at)
        .bind(task.started_at)
        .bind(task.completed_at)
        .execute(&self.pool)
        .await?;

        debug!("创建任务记录: {}", task.entity_description());
        Ok(())
    }

    async fn get_by_id(&self, id: &str) -> OrchestratorResult<Option<Task>> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_task).transpose()
    }

    async fn list_by_target(&self, target_id: &str) -> OrchestratorResult<Vec<Task>> {
        let rows = sqlx::query("SELECT * FROM tasks WHERE target_id = $1 ORDER BY created_at")
            .bind(target_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::row_to_task).collect()
    }

    async fn find_ready(&self, now: DateTime<Utc>, limit: u32) -> OrchestratorResult<Vec<Task>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM tasks
            WHERE status = 'PENDING' AND scheduled_at <= $1
            ORDER BY scheduled_at, created_at
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_task).collect()
    }

    #[instrument(skip(self, now))]
    async fn claim(
        &self,
        id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> OrchestratorResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'RUNNING', worker_id = $2, started_at = $3
            WHERE id = $1 AND status = 'PENDING'
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn mark_succeeded(
        &self,
        id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> OrchestratorResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'SUCCEEDED', completed_at = $3, last_error = NULL
            WHERE id = $1 AND status = 'RUNNING' AND worker_id = $2
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Self::ensure_updated(result.rows_affected(), id)
    }

    async fn requeue(
        &self,
        id: &str,
        worker_id: &str,
        attempts: u32,
        last_error: &str,
        scheduled_at: DateTime<Utc>,
    ) -> OrchestratorResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'PENDING', attempts = $3, last_error = $4, scheduled_at = $5,
                worker_id = NULL, started_at = NULL
            WHERE id = $1 AND status = 'RUNNING' AND worker_id = $2
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .bind(i64::from(attempts))
        .bind(last_error)
        .bind(scheduled_at)
        .execute(&self.pool)
        .await?;

        Self::ensure_updated(result.rows_affected(), id)
    }

    async fn mark_failed(
        &self,
        id: &str,
        worker_id: &str,
        attempts: u32,
        last_error: &str,
        now: DateTime<Utc>,
    ) -> OrchestratorResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'FAILED', attempts = $3, last_error = $4, completed_at = $5
            WHERE id = $1 AND status = 'RUNNING' AND worker_id = $2
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .bind(i64::from(attempts))
        .bind(last_error)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Self::ensure_updated(result.rows_affected(), id)
    }

    async fn recover_stale(&self, started_before: DateTime<Utc>) -> OrchestratorResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'PENDING', worker_id = NULL, started_at = NULL
            WHERE status = 'RUNNING' AND started_at < $1
            "#,
        )
        .bind(started_before)
        .execute(&self.pool)
        .await?;

        let recovered = result.rows_affected();
        if recovered > 0 {
            info!("恢复了 {} 个过期的运行中任务", recovered);
        }
        Ok(recovered)
    }
}
