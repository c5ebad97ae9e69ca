use async_trait::async_trait;
use kaas_core::{OrchestratorError, OrchestratorResult};
use kaas_domain::{Workspace, WorkspaceRepository};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{debug, instrument};

use crate::database::MappingHelpers;

pub struct SqliteWorkspaceRepository {
    pool: SqlitePool,
}

impl SqliteWorkspaceRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_workspace(row: &SqliteRow) -> OrchestratorResult<Workspace> {
        Ok(Workspace {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            plan_id: row.try_get("plan_id")?,
            status: MappingHelpers::parse_enum(row, "status")?,
            control_plane_replicas: MappingHelpers::get_u32(row, "control_plane_replicas")?,
            cluster_endpoint: row.try_get("cluster_endpoint")?,
            cluster_credentials: row.try_get("cluster_credentials")?,
            oidc_users: MappingHelpers::parse_json(row, "oidc_users")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl WorkspaceRepository for SqliteWorkspaceRepository {
    #[instrument(skip(self, workspace), fields(workspace_id = %workspace.id))]
    async fn create(&self, workspace: &Workspace) -> OrchestratorResult<()> {
        sqlx::query(
            r#"
            INSERT INTO workspaces (id, name, plan_id, status, control_plane_replicas,
                                    cluster_endpoint, cluster_credentials, oidc_users,
                                    created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(&workspace.id)
        .bind(&workspace.name)
        .bind(&workspace.plan_id)
        .bind(workspace.status.as_str())
        .bind(i64::from(workspace.control_plane_replicas))
        .bind(&workspace.cluster_endpoint)
        .bind(&workspace.cluster_credentials)
        .bind(MappingHelpers::to_json(&workspace.oidc_users)?)
        .bind(workspace.created_at)
        .bind(workspace.updated_at)
        .execute(&self.pool)
        .await?;

        debug!("创建工作空间记录: {}", workspace.id);
        Ok(())
    }

    async fn get_by_id(&self, id: &str) -> OrchestratorResult<Option<Workspace>> {
        let row = sqlx::query("SELECT * FROM workspaces WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_workspace).transpose()
    }

    #[instrument(
        skip(self, workspace),
        fields(workspace_id = %workspace.id, status = %workspace.status)
    )]
    async fn update(&self, workspace: &Workspace) -> OrchestratorResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE workspaces
            SET name = $2, plan_id = $3, status = $4, control_plane_replicas = $5,
                cluster_endpoint = $6, cluster_credentials = $7, oidc_users = $8, updated_at = $9
            WHERE id = $1
            "#,
        )
        .bind(&workspace.id)
        .bind(&workspace.name)
        .bind(&workspace.plan_id)
        .bind(workspace.status.as_str())
        .bind(i64::from(workspace.control_plane_replicas))
        .bind(&workspace.cluster_endpoint)
        .bind(&workspace.cluster_credentials)
        .bind(MappingHelpers::to_json(&workspace.oidc_users)?)
        .bind(workspace.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(OrchestratorError::not_found("工作空间", &workspace.id));
        }
        Ok(())
    }
}
