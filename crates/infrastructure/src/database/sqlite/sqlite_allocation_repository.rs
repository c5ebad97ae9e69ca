use async_trait::async_trait;
use chrono::Utc;
use kaas_core::{OrchestratorError, OrchestratorResult};
use kaas_domain::{AllocationRepository, PlanType, SharedQuota, WorkspaceNodeAllocation};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{debug, instrument, warn};

use super::SqliteNodeRepository;
use crate::database::MappingHelpers;

pub struct SqliteAllocationRepository {
    pool: SqlitePool,
}

impl SqliteAllocationRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_quota(row: &SqliteRow) -> OrchestratorResult<Option<SharedQuota>> {
        let cpu_limit: Option<f64> = row.try_get("cpu_limit")?;
        let memory_limit_gb: Option<f64> = row.try_get("memory_limit_gb")?;
        match (cpu_limit, memory_limit_gb) {
            (Some(cpu_limit), Some(memory_limit_gb)) => Ok(Some(SharedQuota {
                cpu_limit,
                memory_limit_gb,
                cpu_used: row.try_get::<Option<f64>, _>("cpu_used")?.unwrap_or(0.0),
                memory_used_gb: row.try_get::<Option<f64>, _>("memory_used_gb")?.unwrap_or(0.0),
            })),
            _ => Ok(None),
        }
    }
}

#[async_trait]
impl AllocationRepository for SqliteAllocationRepository {
    #[instrument(
        skip(self, allocation),
        fields(workspace_id = %allocation.workspace_id, plan_type = %allocation.plan_type)
    )]
    async fn create(&self, allocation: &WorkspaceNodeAllocation) -> OrchestratorResult<()> {
        allocation.validate()?;
        let quota = allocation.shared_quota.as_ref();
        sqlx::query(
            r#"
            INSERT INTO workspace_allocations (workspace_id, plan_type, cpu_limit, memory_limit_gb,
                                               cpu_used, memory_used_gb, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(&allocation.workspace_id)
        .bind(allocation.plan_type.as_str())
        .bind(quota.map(|q| q.cpu_limit))
        .bind(quota.map(|q| q.memory_limit_gb))
        .bind(quota.map(|q| q.cpu_used))
        .bind(quota.map(|q| q.memory_used_gb))
        .bind(allocation.created_at)
        .bind(allocation.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_by_workspace(
        &self,
        workspace_id: &str,
    ) -> OrchestratorResult<Option<WorkspaceNodeAllocation>> {
        let Some(row) = sqlx::query("SELECT * FROM workspace_allocations WHERE workspace_id = $1")
            .bind(workspace_id)
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(None);
        };

        let plan_type: PlanType = MappingHelpers::parse_enum(&row, "plan_type")?;
        let dedicated_nodes = if plan_type == PlanType::Dedicated {
            let rows = sqlx::query(
                "SELECT * FROM dedicated_nodes WHERE workspace_id = $1 AND deleted_at IS NULL \
                 AND status != 'deleted' ORDER BY created_at, id",
            )
            .bind(workspace_id)
            .fetch_all(&self.pool)
            .await?;
            rows.iter()
                .map(SqliteNodeRepository::row_to_node)
                .collect::<OrchestratorResult<Vec<_>>>()?
        } else {
            Vec::new()
        };

        Ok(Some(WorkspaceNodeAllocation {
            workspace_id: row.try_get("workspace_id")?,
            plan_type,
            shared_quota: Self::row_to_quota(&row)?,
            dedicated_nodes,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        }))
    }

    #[instrument(skip(self, shared_quota))]
    async fn update_plan(
        &self,
        workspace_id: &str,
        plan_type: PlanType,
        shared_quota: Option<SharedQuota>,
    ) -> OrchestratorResult<()> {
        if (plan_type == PlanType::Shared) != shared_quota.is_some() {
            return Err(OrchestratorError::invalid_request(format!(
                "套餐类型 {plan_type} 与配额设置不一致"
            )));
        }
        let quota = shared_quota.as_ref();
        let result = sqlx::query(
            r#"
            UPDATE workspace_allocations
            SET plan_type = $2, cpu_limit = $3, memory_limit_gb = $4, cpu_used = $5,
                memory_used_gb = $6, updated_at = $7
            WHERE workspace_id = $1
            "#,
        )
        .bind(workspace_id)
        .bind(plan_type.as_str())
        .bind(quota.map(|q| q.cpu_limit))
        .bind(quota.map(|q| q.memory_limit_gb))
        .bind(quota.map(|q| q.cpu_used))
        .bind(quota.map(|q| q.memory_used_gb))
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(OrchestratorError::not_found("资源分配", workspace_id));
        }
        debug!("工作空间 {} 切换为 {} 套餐", workspace_id, plan_type);
        Ok(())
    }

    async fn delete(&self, workspace_id: &str) -> OrchestratorResult<bool> {
        let result = sqlx::query("DELETE FROM workspace_allocations WHERE workspace_id = $1")
            .bind(workspace_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn apply_quota_delta(
        &self,
        workspace_id: &str,
        cpu_delta: f64,
        memory_delta_gb: f64,
    ) -> OrchestratorResult<SharedQuota> {
        // 增量与边界检查在同一条语句内完成，并发请求之间不会相互覆盖
        let row = sqlx::query(
            r#"
            UPDATE workspace_allocations
            SET cpu_used = cpu_used + $2,
                memory_used_gb = memory_used_gb + $3,
                updated_at = $4
            WHERE workspace_id = $1
              AND plan_type = 'shared'
              AND cpu_used + $2 <= cpu_limit
              AND memory_used_gb + $3 <= memory_limit_gb
              AND cpu_used + $2 >= 0
              AND memory_used_gb + $3 >= 0
            RETURNING cpu_limit, memory_limit_gb, cpu_used, memory_used_gb
            "#,
        )
        .bind(workspace_id)
        .bind(cpu_delta)
        .bind(memory_delta_gb)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            return Self::row_to_quota(&row)?.ok_or_else(|| {
                OrchestratorError::Internal(format!("工作空间 {workspace_id} 配额字段缺失"))
            });
        }

        // 未命中：区分记录不存在、套餐类型不符与越界
        let current = self.get_by_workspace(workspace_id).await?;
        let Some(allocation) = current else {
            return Err(OrchestratorError::not_found("资源分配", workspace_id));
        };
        let Some(mut quota) = allocation.shared_quota else {
            return Err(OrchestratorError::invalid_request(format!(
                "工作空间 {workspace_id} 不是共享套餐，无法调整配额"
            )));
        };
        warn!(
            "工作空间 {} 配额调整被拒绝: cpu_delta={}, memory_delta={}",
            workspace_id, cpu_delta, memory_delta_gb
        );
        match quota.apply_delta(cpu_delta, memory_delta_gb) {
            Err(e) => Err(e),
            Ok(()) => Err(OrchestratorError::QuotaExceeded(format!(
                "工作空间 {workspace_id} 配额在并发更新中发生变化"
            ))),
        }
    }
}
