//! 工作空间生命周期控制器
//!
//! 协调租户虚拟集群的创建、等待、配额下发、扩缩容与身份联合配置。
//! 网关错误直接返回，重试由任务引擎负责。

use std::sync::Arc;

use kaas_core::{Clock, OrchestratorError, OrchestratorResult};
use kaas_domain::ports::{ClusterGateway, ClusterPhase, OidcConfig};
use kaas_domain::{
    ClusterSizing, NodePlan, PlanCatalog, PlanLimits, PlanType, ResourceRequest, Workspace,
    WorkspaceAction, WorkspaceRepository, WorkspaceStatus,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::allocator::ResourceAllocator;
use crate::waiter::{poll_until, PollSettings};

pub struct WorkspaceLifecycleController {
    workspaces: Arc<dyn WorkspaceRepository>,
    gateway: Arc<dyn ClusterGateway>,
    allocator: Arc<ResourceAllocator>,
    catalog: Arc<dyn PlanCatalog>,
    clock: Arc<dyn Clock>,
    wait: PollSettings,
    oidc_issuer_url: String,
}

impl WorkspaceLifecycleController {
    pub fn new(
        workspaces: Arc<dyn WorkspaceRepository>,
        gateway: Arc<dyn ClusterGateway>,
        allocator: Arc<ResourceAllocator>,
        catalog: Arc<dyn PlanCatalog>,
        clock: Arc<dyn Clock>,
        wait: PollSettings,
        oidc_issuer_url: impl Into<String>,
    ) -> Self {
        Self {
            workspaces,
            gateway,
            allocator,
            catalog,
            clock,
            wait,
            oidc_issuer_url: oidc_issuer_url.into(),
        }
    }

    async fn load(&self, workspace_id: &str) -> OrchestratorResult<Workspace> {
        self.workspaces
            .get_by_id(workspace_id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found("工作空间", workspace_id))
    }

    pub async fn get_workspace(&self, workspace_id: &str) -> OrchestratorResult<Workspace> {
        self.load(workspace_id).await
    }

    pub fn replica_footprint(&self) -> ResourceRequest {
        self.allocator.replica_footprint()
    }

    /// 在套餐目录中查找套餐
    pub fn plan(&self, plan_id: &str) -> OrchestratorResult<NodePlan> {
        self.catalog
            .get_plan(plan_id)
            .ok_or_else(|| OrchestratorError::not_found("套餐", plan_id))
    }

    async fn transition(
        &self,
        workspace: &mut Workspace,
        action: WorkspaceAction,
    ) -> OrchestratorResult<()> {
        let from = workspace.status;
        let next = workspace.transition_to(action, self.clock.now())?;
        self.workspaces.update(workspace).await?;
        info!(workspace_id = %workspace.id, "工作空间状态 {} --{:?}--> {}", from, action, next);
        Ok(())
    }

    /// 按套餐规格创建虚拟集群并等待就绪
    ///
    /// 等待超时返回 `Timeout`，不会重新发起创建。
    #[instrument(skip(self, cancel))]
    pub async fn create_vcluster(
        &self,
        workspace_id: &str,
        plan_id: &str,
        cancel: &CancellationToken,
    ) -> OrchestratorResult<()> {
        let sizing = ClusterSizing::for_plan(plan_id);
        self.gateway.create_cluster(workspace_id, &sizing).await?;
        info!(
            "已提交虚拟集群创建: syncer cpu={}, memory={}",
            sizing.syncer_cpu_limit, sizing.syncer_memory_limit
        );
        self.wait_for_ready(workspace_id, cancel).await
    }

    pub async fn wait_for_ready(
        &self,
        workspace_id: &str,
        cancel: &CancellationToken,
    ) -> OrchestratorResult<()> {
        let gateway = self.gateway.as_ref();
        let operation = format!("等待虚拟集群 {workspace_id} 就绪");
        poll_until(self.wait, cancel, &operation, move || async move {
            match gateway.get_cluster_status(workspace_id).await? {
                ClusterPhase::Ready => Ok::<_, OrchestratorError>(Some(())),
                phase => {
                    debug!("虚拟集群 {} 当前阶段: {:?}", workspace_id, phase);
                    Ok(None)
                }
            }
        })
        .await
    }

    #[instrument(skip(self, cancel))]
    pub async fn delete_vcluster(
        &self,
        workspace_id: &str,
        cancel: &CancellationToken,
    ) -> OrchestratorResult<()> {
        self.gateway.delete_cluster(workspace_id).await?;
        self.wait_for_deleted(workspace_id, cancel).await
    }

    pub async fn wait_for_deleted(
        &self,
        workspace_id: &str,
        cancel: &CancellationToken,
    ) -> OrchestratorResult<()> {
        let gateway = self.gateway.as_ref();
        let operation = format!("等待虚拟集群 {workspace_id} 删除");
        poll_until(self.wait, cancel, &operation, move || async move {
            let phase = gateway.get_cluster_status(workspace_id).await?;
            Ok::<_, OrchestratorError>((phase == ClusterPhase::Absent).then_some(()))
        })
        .await
    }

    /// 把套餐限额下发到租户集群，未知套餐按最低档处理
    #[instrument(skip(self))]
    pub async fn apply_resource_quotas(
        &self,
        workspace_id: &str,
        plan_id: &str,
    ) -> OrchestratorResult<PlanLimits> {
        let limits = PlanLimits::for_plan(plan_id);
        self.gateway.apply_quota(workspace_id, &limits).await?;
        info!(
            "已下发资源配额: cpu={}, memory={}, pods={}",
            limits.cpu, limits.memory, limits.pods
        );
        Ok(limits)
    }

    /// 调整控制平面副本数
    ///
    /// 共享套餐先按副本差额原子占用配额，网关失败时归还。
    #[instrument(skip(self))]
    pub async fn scale_vcluster(
        &self,
        workspace_id: &str,
        replicas: u32,
    ) -> OrchestratorResult<Workspace> {
        let mut workspace = self.load(workspace_id).await?;
        if workspace.is_deleted() {
            return Err(OrchestratorError::not_found("工作空间", workspace_id));
        }

        let delta = f64::from(replicas) - f64::from(workspace.control_plane_replicas);
        let change = self.allocator.replica_footprint().scaled(delta.abs());
        let reserved = if delta > 0.0 {
            self.allocator.reserve(workspace_id, &change).await?
        } else {
            false
        };

        if let Err(e) = self.gateway.scale_control_plane(workspace_id, replicas).await {
            if reserved {
                if let Err(release_err) = self.allocator.release(workspace_id, &change).await {
                    warn!("归还工作空间 {} 的配额失败: {}", workspace_id, release_err);
                }
            }
            return Err(e);
        }
        if delta < 0.0 {
            self.allocator.release(workspace_id, &change).await?;
        }

        workspace.control_plane_replicas = replicas;
        workspace.updated_at = self.clock.now();
        self.workspaces.update(&workspace).await?;
        info!("工作空间 {} 控制平面副本数调整为 {}", workspace_id, replicas);
        Ok(workspace)
    }

    /// 下发身份联合配置，重复调用会重新应用同一配置
    #[instrument(skip(self, users))]
    pub async fn configure_oidc(
        &self,
        workspace_id: &str,
        users: Vec<String>,
    ) -> OrchestratorResult<OidcConfig> {
        let config = OidcConfig::for_workspace(&self.oidc_issuer_url, workspace_id, users);
        self.gateway
            .configure_identity_federation(workspace_id, &config)
            .await?;
        info!("已为工作空间 {} 配置 OIDC ({} 个用户)", workspace_id, config.users.len());
        Ok(config)
    }

    /// 成员变化后更新 OIDC 配置并保存成员列表
    pub async fn update_oidc_config(
        &self,
        workspace_id: &str,
        users: Vec<String>,
    ) -> OrchestratorResult<OidcConfig> {
        let mut workspace = self.load(workspace_id).await?;
        let config = self.configure_oidc(workspace_id, users).await?;
        workspace.oidc_users = config.users.clone();
        workspace.updated_at = self.clock.now();
        self.workspaces.update(&workspace).await?;
        Ok(config)
    }

    /// 完整的开通流程
    ///
    /// 共享套餐创建虚拟集群、下发配额与 OIDC 并保存凭据；专属套餐只建立分配记录，
    /// 节点由单独的任务开通。已处于 Starting 的工作空间从中断处继续。
    #[instrument(skip(self, cancel))]
    pub async fn provision_workspace(
        &self,
        workspace_id: &str,
        cancel: &CancellationToken,
    ) -> OrchestratorResult<Workspace> {
        let mut workspace = self.load(workspace_id).await?;
        match workspace.status {
            WorkspaceStatus::Running => return Ok(workspace),
            WorkspaceStatus::Starting => {}
            _ => self.transition(&mut workspace, WorkspaceAction::Start).await?,
        }

        let plan = self.plan(&workspace.plan_id)?;
        let allocation = self.allocator.ensure_allocation(workspace_id, &plan).await?;

        if allocation.plan_type == PlanType::Shared {
            let sizing = ClusterSizing::for_plan(&plan.id);
            if workspace.control_plane_replicas < sizing.replicas {
                let extra = f64::from(sizing.replicas - workspace.control_plane_replicas);
                self.allocator
                    .reserve(workspace_id, &self.allocator.replica_footprint().scaled(extra))
                    .await?;
                workspace.control_plane_replicas = sizing.replicas;
                self.workspaces.update(&workspace).await?;
            }

            self.create_vcluster(workspace_id, &plan.id, cancel).await?;
            self.apply_resource_quotas(workspace_id, &plan.id).await?;
            self.configure_oidc(workspace_id, workspace.oidc_users.clone())
                .await?;

            let credentials = self.gateway.get_cluster_credentials(workspace_id).await?;
            workspace.cluster_endpoint = Some(credentials.endpoint);
            workspace.cluster_credentials = Some(credentials.kubeconfig);
        }

        self.transition(&mut workspace, WorkspaceAction::Complete)
            .await?;
        info!("工作空间 {} 已就绪 (套餐 {})", workspace_id, plan.id);
        Ok(workspace)
    }

    /// 删除虚拟集群并释放分配记录
    ///
    /// 仍有占用虚拟机的专属节点时拒绝，节点需先通过节点任务删除或由对账释放。
    #[instrument(skip(self, cancel))]
    pub async fn teardown_workspace(
        &self,
        workspace_id: &str,
        cancel: &CancellationToken,
    ) -> OrchestratorResult<Workspace> {
        let mut workspace = self.load(workspace_id).await?;
        if workspace.is_deleted() {
            return Ok(workspace);
        }

        let plan_type = match self.allocator.get_workspace_resource_usage(workspace_id).await {
            Ok(usage) if !usage.nodes.is_empty() => {
                return Err(OrchestratorError::invalid_request(format!(
                    "工作空间 {} 仍有 {} 个未删除的专属节点",
                    workspace_id,
                    usage.nodes.len()
                )))
            }
            Ok(usage) => Some(usage.plan_type),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };

        if workspace.status != WorkspaceStatus::Deleting {
            self.transition(&mut workspace, WorkspaceAction::Delete)
                .await?;
        }

        if plan_type != Some(PlanType::Dedicated) {
            self.delete_vcluster(workspace_id, cancel).await?;
        }
        self.allocator.remove_allocation(workspace_id).await?;

        workspace.control_plane_replicas = 0;
        workspace.cluster_endpoint = None;
        workspace.cluster_credentials = None;
        self.transition(&mut workspace, WorkspaceAction::Complete)
            .await?;
        Ok(workspace)
    }

    /// 暂停：控制平面缩到 0 个副本
    #[instrument(skip(self))]
    pub async fn suspend_workspace(&self, workspace_id: &str) -> OrchestratorResult<Workspace> {
        let mut workspace = self.load(workspace_id).await?;
        if workspace.status != WorkspaceStatus::Stopping {
            self.transition(&mut workspace, WorkspaceAction::Stop)
                .await?;
        }
        let mut workspace = self.scale_vcluster(workspace_id, 0).await?;
        self.transition(&mut workspace, WorkspaceAction::Complete)
            .await?;
        Ok(workspace)
    }

    /// 恢复：控制平面扩到 1 个副本并等待集群就绪
    #[instrument(skip(self, cancel))]
    pub async fn reactivate_workspace(
        &self,
        workspace_id: &str,
        cancel: &CancellationToken,
    ) -> OrchestratorResult<Workspace> {
        let mut workspace = self.load(workspace_id).await?;
        if workspace.status != WorkspaceStatus::Starting {
            self.transition(&mut workspace, WorkspaceAction::Start)
                .await?;
        }
        self.scale_vcluster(workspace_id, 1).await?;
        self.wait_for_ready(workspace_id, cancel).await?;
        let mut workspace = self.load(workspace_id).await?;
        self.transition(&mut workspace, WorkspaceAction::Complete)
            .await?;
        Ok(workspace)
    }

    /// 重试耗尽后把工作空间置为 Error，当前状态不允许时保持不变
    pub async fn mark_error(
        &self,
        workspace_id: &str,
        reason: &str,
    ) -> OrchestratorResult<Workspace> {
        let mut workspace = self.load(workspace_id).await?;
        if workspace.status.can(WorkspaceAction::Fail) {
            self.transition(&mut workspace, WorkspaceAction::Fail)
                .await?;
            warn!("工作空间 {} 已置为 Error: {}", workspace_id, reason);
        } else {
            warn!(
                "工作空间 {} 处于 {}，无法置为 Error: {}",
                workspace_id, workspace.status, reason
            );
        }
        Ok(workspace)
    }
}
