use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use kaas_core::{OrchestratorError, OrchestratorResult};
use kaas_domain::{AllocationRepository, PlanType, SharedQuota, WorkspaceNodeAllocation};
use tokio::sync::Mutex;

use super::InMemoryNodeRepository;

pub struct InMemoryAllocationRepository {
    allocations: Mutex<HashMap<String, WorkspaceNodeAllocation>>,
    nodes: Arc<InMemoryNodeRepository>,
}

impl InMemoryAllocationRepository {
    pub fn new(nodes: Arc<InMemoryNodeRepository>) -> Self {
        Self {
            allocations: Mutex::new(HashMap::new()),
            nodes,
        }
    }
}

impl Default for InMemoryAllocationRepository {
    fn default() -> Self {
        Self::new(Arc::new(InMemoryNodeRepository::default()))
    }
}

#[async_trait]
impl AllocationRepository for InMemoryAllocationRepository {
    async fn create(&self, allocation: &WorkspaceNodeAllocation) -> OrchestratorResult<()> {
        allocation.validate()?;
        let mut allocations = self.allocations.lock().await;
        if allocations.contains_key(&allocation.workspace_id) {
            return Err(OrchestratorError::invalid_request(format!(
                "资源分配已存在: {}",
                allocation.workspace_id
            )));
        }
        let mut stored = allocation.clone();
        stored.dedicated_nodes.clear();
        allocations.insert(stored.workspace_id.clone(), stored);
        Ok(())
    }

    async fn get_by_workspace(
        &self,
        workspace_id: &str,
    ) -> OrchestratorResult<Option<WorkspaceNodeAllocation>> {
        let stored = self.allocations.lock().await.get(workspace_id).cloned();
        let Some(mut allocation) = stored else {
            return Ok(None);
        };
        if allocation.plan_type == PlanType::Dedicated {
            allocation.dedicated_nodes = self.nodes.live_nodes(workspace_id).await;
        }
        Ok(Some(allocation))
    }

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
        let mut allocations = self.allocations.lock().await;
        let allocation = allocations
            .get_mut(workspace_id)
            .ok_or_else(|| OrchestratorError::not_found("资源分配", workspace_id))?;
        allocation.plan_type = plan_type;
        allocation.shared_quota = shared_quota;
        allocation.updated_at = Utc::now();
        Ok(())
    }

    async fn delete(&self, workspace_id: &str) -> OrchestratorResult<bool> {
        Ok(self.allocations.lock().await.remove(workspace_id).is_some())
    }

    async fn apply_quota_delta(
        &self,
        workspace_id: &str,
        cpu_delta: f64,
        memory_delta_gb: f64,
    ) -> OrchestratorResult<SharedQuota> {
        let mut allocations = self.allocations.lock().await;
        let allocation = allocations
            .get_mut(workspace_id)
            .ok_or_else(|| OrchestratorError::not_found("资源分配", workspace_id))?;
        let quota = allocation.shared_quota.as_mut().ok_or_else(|| {
            OrchestratorError::invalid_request(format!(
                "工作空间 {workspace_id} 不是共享套餐，无法调整配额"
            ))
        })?;
        quota.apply_delta(cpu_delta, memory_delta_gb)?;
        allocation.updated_at = Utc::now();
        Ok(*quota)
    }
}
