use async_trait::async_trait;
use kaas_core::{OrchestratorError, OrchestratorResult};
use kaas_domain::{DedicatedNode, NodeRepository, NodeSpecification, NodeStatus};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{debug, instrument};

use crate::database::MappingHelpers;

pub struct SqliteNodeRepository {
    pool: SqlitePool,
}

impl SqliteNodeRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub(crate) fn row_to_node(row: &SqliteRow) -> OrchestratorResult<DedicatedNode> {
        Ok(DedicatedNode {
            id: row.try_get("id")?,
            workspace_id: row.try_get("workspace_id")?,
            name: row.try_get("name")?,
            status: MappingHelpers::parse_enum(row, "status")?,
            specification: NodeSpecification {
                node_type: MappingHelpers::parse_enum(row, "node_type")?,
                cpu_cores: row.try_get("cpu_cores")?,
                memory_gb: row.try_get("memory_gb")?,
                storage_gb: row.try_get("storage_gb")?,
                network_mbps: row.try_get("network_mbps")?,
            },
            external_id: row.try_get("external_id")?,
            host: row.try_get("host")?,
            ip_address: row.try_get("ip_address")?,
            ssh_public_key: row.try_get("ssh_public_key")?,
            labels: MappingHelpers::parse_json(row, "labels")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            deleted_at: row.try_get("deleted_at")?,
        })
    }
}

#[async_trait]
impl NodeRepository for SqliteNodeRepository {
    #[instrument(skip(self, node), fields(node_id = %node.id, workspace_id = %node.workspace_id))]
    async fn create(&self, node: &DedicatedNode) -> OrchestratorResult<()> {
        let spec = &node.specification;
        sqlx::query(
            r#"
            INSERT INTO dedicated_nodes (id, workspace_id, name, status, node_type, cpu_cores,
                                         memory_gb, storage_gb, network_mbps, external_id, host,
                                         ip_address, ssh_public_key, labels, created_at,
                                         updated_at, deleted_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            "#,
        )
        .bind(&node.id)
        .bind(&node.workspace_id)
        .bind(&node.name)
        .bind(node.status.as_str())
        .bind(spec.node_type.as_str())
        .bind(spec.cpu_cores)
        .bind(spec.memory_gb)
        .bind(spec.storage_gb)
        .bind(spec.network_mbps)
        .bind(&node.external_id)
        .bind(&node.host)
        .bind(&node.ip_address)
        .bind(&node.ssh_public_key)
        .bind(MappingHelpers::to_json(&node.labels)?)
        .bind(node.created_at)
        .bind(node.updated_at)
        .bind(node.deleted_at)
        .execute(&self.pool)
        .await?;

        debug!("创建节点记录: {}", node.entity_description());
        Ok(())
    }

    async fn get_by_id(&self, id: &str) -> OrchestratorResult<Option<DedicatedNode>> {
        let row = sqlx::query("SELECT * FROM dedicated_nodes WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_node).transpose()
    }

    #[instrument(skip(self, node), fields(node_id = %node.id, status = %node.status))]
    async fn update(&self, node: &DedicatedNode) -> OrchestratorResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE dedicated_nodes
            SET name = $2, status = $3, external_id = $4, host = $5, ip_address = $6,
                ssh_public_key = $7, labels = $8, updated_at = $9, deleted_at = $10
            WHERE id = $1
            "#,
        )
        .bind(&node.id)
        .bind(&node.name)
        .bind(node.status.as_str())
        .bind(&node.external_id)
        .bind(&node.host)
        .bind(&node.ip_address)
        .bind(&node.ssh_public_key)
        .bind(MappingHelpers::to_json(&node.labels)?)
        .bind(node.updated_at)
        .bind(node.deleted_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(OrchestratorError::not_found("节点", &node.id));
        }
        Ok(())
    }

    async fn list_by_workspace(
        &self,
        workspace_id: &str,
        include_deleted: bool,
    ) -> OrchestratorResult<Vec<DedicatedNode>> {
        let sql = if include_deleted {
            "SELECT * FROM dedicated_nodes WHERE workspace_id = $1 ORDER BY created_at, id"
        } else {
            "SELECT * FROM dedicated_nodes WHERE workspace_id = $1 AND deleted_at IS NULL \
             AND status != 'deleted' ORDER BY created_at, id"
        };
        let rows = sqlx::query(sql)
            .bind(workspace_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::row_to_node).collect()
    }

    async fn list_by_status(&self, status: NodeStatus) -> OrchestratorResult<Vec<DedicatedNode>> {
        let rows =
            sqlx::query("SELECT * FROM dedicated_nodes WHERE status = $1 ORDER BY created_at, id")
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?;

        rows.iter().map(Self::row_to_node).collect()
    }
}
