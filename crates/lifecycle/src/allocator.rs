//! 资源分配服务
//!
//! 在领域层的纯判定之上负责读取分配记录、原子更新共享配额以及套餐模型切换。

use std::sync::Arc;

use kaas_core::config::models::AllocationPolicy;
use kaas_core::{Clock, OrchestratorError, OrchestratorResult};
use kaas_domain::ports::{NodeGateway, VmResourceUsage};
use kaas_domain::{
    AllocationRepository, DedicatedNode, NodePlan, NodeRepository, NodeSpecification, NodeStatus,
    PlanType, ResourceRequest, SharedQuota, WorkspaceNodeAllocation,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

/// 单个专属节点的资源使用情况
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeResourceUsage {
    pub node_id: String,
    pub name: String,
    pub status: NodeStatus,
    pub specification: NodeSpecification,
    /// 虚拟化平台不可达时为空
    pub usage: Option<VmResourceUsage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceResourceUsage {
    pub workspace_id: String,
    pub plan_type: PlanType,
    pub shared_quota: Option<SharedQuota>,
    pub nodes: Vec<NodeResourceUsage>,
    pub total_cpu_cores: i32,
    pub total_memory_gb: i32,
    pub total_storage_gb: i32,
}

pub struct ResourceAllocator {
    allocations: Arc<dyn AllocationRepository>,
    nodes: Arc<dyn NodeRepository>,
    node_gateway: Arc<dyn NodeGateway>,
    clock: Arc<dyn Clock>,
    policy: AllocationPolicy,
    /// 每个控制平面副本占用的资源
    replica_footprint: ResourceRequest,
}

impl ResourceAllocator {
    pub fn new(
        allocations: Arc<dyn AllocationRepository>,
        nodes: Arc<dyn NodeRepository>,
        node_gateway: Arc<dyn NodeGateway>,
        clock: Arc<dyn Clock>,
        policy: AllocationPolicy,
        replica_footprint: ResourceRequest,
    ) -> Self {
        Self {
            allocations,
            nodes,
            node_gateway,
            clock,
            policy,
            replica_footprint,
        }
    }

    pub fn replica_footprint(&self) -> ResourceRequest {
        self.replica_footprint
    }

    async fn load(&self, workspace_id: &str) -> OrchestratorResult<WorkspaceNodeAllocation> {
        self.allocations
            .get_by_workspace(workspace_id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found("资源分配", workspace_id))
    }

    /// 判断工作空间能否再容纳 `requested`
    #[instrument(skip(self))]
    pub async fn can_allocate(
        &self,
        workspace_id: &str,
        requested: &ResourceRequest,
    ) -> OrchestratorResult<bool> {
        let allocation = self.load(workspace_id).await?;
        let allowed = match self.policy {
            AllocationPolicy::AnyReadyNode => allocation.can_allocate(requested),
            // 专属节点上预留一个控制平面副本
            AllocationPolicy::Capacity => {
                allocation.can_allocate_by_capacity(requested, &self.replica_footprint)
            }
        };
        debug!(
            "工作空间 {} 分配判定: plan_type={}, allowed={}",
            workspace_id, allocation.plan_type, allowed
        );
        Ok(allowed)
    }

    pub async fn ensure_can_allocate(
        &self,
        workspace_id: &str,
        requested: &ResourceRequest,
    ) -> OrchestratorResult<()> {
        if self.can_allocate(workspace_id, requested).await? {
            Ok(())
        } else {
            Err(OrchestratorError::QuotaExceeded(format!(
                "工作空间 {} 无法分配 cpu={} memory={}GB",
                workspace_id, requested.cpu, requested.memory_gb
            )))
        }
    }

    pub async fn apply_quota_delta(
        &self,
        workspace_id: &str,
        cpu_delta: f64,
        memory_delta_gb: f64,
    ) -> OrchestratorResult<SharedQuota> {
        self.allocations
            .apply_quota_delta(workspace_id, cpu_delta, memory_delta_gb)
            .await
    }

    /// 为共享套餐原子地占用配额，专属套餐不记账，返回是否实际扣减
    pub async fn reserve(
        &self,
        workspace_id: &str,
        amount: &ResourceRequest,
    ) -> OrchestratorResult<bool> {
        self.shift(workspace_id, amount.cpu, amount.memory_gb).await
    }

    pub async fn release(
        &self,
        workspace_id: &str,
        amount: &ResourceRequest,
    ) -> OrchestratorResult<bool> {
        self.shift(workspace_id, -amount.cpu, -amount.memory_gb).await
    }

    async fn shift(
        &self,
        workspace_id: &str,
        cpu: f64,
        memory_gb: f64,
    ) -> OrchestratorResult<bool> {
        if cpu == 0.0 && memory_gb == 0.0 {
            return Ok(false);
        }
        let allocation = self.load(workspace_id).await?;
        if allocation.plan_type != PlanType::Shared {
            return Ok(false);
        }
        let quota = self.apply_quota_delta(workspace_id, cpu, memory_gb).await?;
        debug!(
            "工作空间 {} 共享配额已更新: cpu {}/{}, memory {}/{}GB",
            workspace_id,
            quota.cpu_used,
            quota.cpu_limit,
            quota.memory_used_gb,
            quota.memory_limit_gb
        );
        Ok(true)
    }

    /// 按套餐创建分配记录，已存在时直接返回现有记录
    #[instrument(skip(self, plan), fields(plan_id = %plan.id))]
    pub async fn ensure_allocation(
        &self,
        workspace_id: &str,
        plan: &NodePlan,
    ) -> OrchestratorResult<WorkspaceNodeAllocation> {
        if let Some(existing) = self.allocations.get_by_workspace(workspace_id).await? {
            return Ok(existing);
        }

        let now = self.clock.now();
        let allocation = match plan.kind()? {
            PlanType::Shared => {
                let quota = SharedQuota::new(
                    f64::from(plan.resources.cpu_cores),
                    f64::from(plan.resources.memory_gb),
                )?;
                WorkspaceNodeAllocation::shared(workspace_id, quota, now)
            }
            PlanType::Dedicated => WorkspaceNodeAllocation::dedicated(workspace_id, now),
        };
        self.allocations.create(&allocation).await?;
        info!(
            "已为工作空间 {} 创建 {} 资源分配",
            workspace_id, allocation.plan_type
        );
        Ok(allocation)
    }

    pub async fn remove_allocation(&self, workspace_id: &str) -> OrchestratorResult<bool> {
        self.allocations.delete(workspace_id).await
    }

    /// 切换到专属节点模型，清除共享配额
    #[instrument(skip(self))]
    pub async fn transition_to_dedicated_plan(&self, workspace_id: &str) -> OrchestratorResult<()> {
        let allocation = self.load(workspace_id).await?;
        if allocation.plan_type == PlanType::Dedicated {
            return Ok(());
        }
        self.allocations
            .update_plan(workspace_id, PlanType::Dedicated, None)
            .await?;
        info!("工作空间 {} 已切换为专属节点套餐", workspace_id);
        Ok(())
    }

    /// 切换回共享模型，仍有未删除节点时拒绝
    #[instrument(skip(self))]
    pub async fn transition_to_shared_plan(&self, workspace_id: &str) -> OrchestratorResult<()> {
        let allocation = self.load(workspace_id).await?;
        if allocation.plan_type == PlanType::Shared {
            return Ok(());
        }
        let holding = allocation
            .dedicated_nodes
            .iter()
            .filter(|node| node.holds_resources())
            .count();
        if holding > 0 {
            return Err(OrchestratorError::invalid_request(format!(
                "工作空间 {} 仍有 {} 个未删除的专属节点，无法切换为共享套餐",
                workspace_id, holding
            )));
        }
        self.allocations
            .update_plan(
                workspace_id,
                PlanType::Shared,
                Some(SharedQuota::default_shared()),
            )
            .await?;
        info!("工作空间 {} 已切换为共享套餐", workspace_id);
        Ok(())
    }

    /// 汇总工作空间的资源使用情况，只统计仍占用虚拟机的节点
    #[instrument(skip(self))]
    pub async fn get_workspace_resource_usage(
        &self,
        workspace_id: &str,
    ) -> OrchestratorResult<WorkspaceResourceUsage> {
        let allocation = self.load(workspace_id).await?;
        let live_nodes = match allocation.plan_type {
            PlanType::Shared => Vec::new(),
            PlanType::Dedicated => self.nodes.list_by_workspace(workspace_id, false).await?,
        };

        let mut nodes = Vec::with_capacity(live_nodes.len());
        let (mut cpu, mut memory, mut storage) = (0, 0, 0);
        for node in live_nodes.into_iter().filter(DedicatedNode::holds_resources) {
            cpu += node.specification.cpu_cores;
            memory += node.specification.memory_gb;
            storage += node.specification.storage_gb;

            let usage = match &node.external_id {
                Some(external_id) => {
                    match self.node_gateway.get_vm_resource_usage(external_id).await {
                        Ok(usage) => Some(usage),
                        Err(e) => {
                            warn!("获取节点 {} 的资源使用失败: {}", node.id, e);
                            None
                        }
                    }
                }
                None => None,
            };
            nodes.push(NodeResourceUsage {
                node_id: node.id,
                name: node.name,
                status: node.status,
                specification: node.specification,
                usage,
            });
        }

        Ok(WorkspaceResourceUsage {
            workspace_id: workspace_id.to_string(),
            plan_type: allocation.plan_type,
            shared_quota: allocation.shared_quota,
            nodes,
            total_cpu_cores: cpu,
            total_memory_gb: memory,
            total_storage_gb: storage,
        })
    }
}
