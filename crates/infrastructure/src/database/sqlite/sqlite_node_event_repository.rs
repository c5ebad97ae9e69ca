use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kaas_core::OrchestratorResult;
use kaas_domain::{NodeEvent, NodeEventRepository};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::info;

use crate::database::MappingHelpers;

pub struct SqliteNodeEventRepository {
    pool: SqlitePool,
}

impl SqliteNodeEventRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_event(row: &SqliteRow) -> OrchestratorResult<NodeEvent> {
        Ok(NodeEvent {
            id: row.try_get("id")?,
            node_id: row.try_get("node_id")?,
            workspace_id: row.try_get("workspace_id")?,
            event_type: MappingHelpers::parse_enum(row, "event_type")?,
            message: row.try_get("message")?,
            details: MappingHelpers::parse_optional_json(row, "details")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[async_trait]
impl NodeEventRepository for SqliteNodeEventRepository {
    async fn append(&self, event: &NodeEvent) -> OrchestratorResult<()> {
        let details = event
            .details
            .as_ref()
            .map(MappingHelpers::to_json)
            .transpose()?;
        sqlx::query(
            r#"
            INSERT INTO node_events (id, node_id, workspace_id, event_type, message, details, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(&event.id)
        .bind(&event.node_id)
        .bind(&event.workspace_id)
        .bind(event.event_type.as_str())
        .bind(&event.message)
        .bind(details)
        .bind(event.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_by_node(
        &self,
        node_id: &str,
        limit: usize,
    ) -> OrchestratorResult<Vec<NodeEvent>> {
        let rows = sqlx::query(
            "SELECT * FROM node_events WHERE node_id = $1 ORDER BY created_at DESC, rowid DESC LIMIT $2",
        )
        .bind(node_id)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_event).collect()
    }

    async fn prune_before(&self, cutoff: DateTime<Utc>) -> OrchestratorResult<u64> {
        let result = sqlx::query("DELETE FROM node_events WHERE created_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        let removed = result.rows_affected();
        if removed > 0 {
            info!("清理过期节点事件 {} 条", removed);
        }
        Ok(removed)
    }
}
