//! 领域仓储抽象
//!
//! 定义数据访问的抽象接口，遵循依赖倒置原则。
//! 配额增量与任务领取必须在存储层原子完成。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kaas_core::OrchestratorResult;

use crate::entities::{
    DedicatedNode, PlanType, SharedQuota, Task, Workspace, WorkspaceNodeAllocation,
};
use crate::events::NodeEvent;
use crate::state_machine::NodeStatus;

/// 工作空间仓储抽象
#[async_trait]
pub trait WorkspaceRepository: Send + Sync {
    async fn create(&self, workspace: &Workspace) -> OrchestratorResult<()>;
    async fn get_by_id(&self, id: &str) -> OrchestratorResult<Option<Workspace>>;
    async fn update(&self, workspace: &Workspace) -> OrchestratorResult<()>;
}

/// 资源分配仓储抽象
#[async_trait]
pub trait AllocationRepository: Send + Sync {
    async fn create(&self, allocation: &WorkspaceNodeAllocation) -> OrchestratorResult<()>;

    /// 读取分配记录，`dedicated_nodes` 为该工作空间未删除的节点
    async fn get_by_workspace(
        &self,
        workspace_id: &str,
    ) -> OrchestratorResult<Option<WorkspaceNodeAllocation>>;

    /// 切换资源模型；专属套餐的 `shared_quota` 必须为 None
    async fn update_plan(
        &self,
        workspace_id: &str,
        plan_type: PlanType,
        shared_quota: Option<SharedQuota>,
    ) -> OrchestratorResult<()>;

    async fn delete(&self, workspace_id: &str) -> OrchestratorResult<bool>;

    /// 原子地执行 `used = used + delta`
    ///
    /// 结果越过上限时返回 `QuotaExceeded`，低于 0 时返回校验错误，两种情况都不写入。
    async fn apply_quota_delta(
        &self,
        workspace_id: &str,
        cpu_delta: f64,
        memory_delta_gb: f64,
    ) -> OrchestratorResult<SharedQuota>;
}

/// 专属节点仓储抽象
#[async_trait]
pub trait NodeRepository: Send + Sync {
    async fn create(&self, node: &DedicatedNode) -> OrchestratorResult<()>;
    async fn get_by_id(&self, id: &str) -> OrchestratorResult<Option<DedicatedNode>>;
    async fn update(&self, node: &DedicatedNode) -> OrchestratorResult<()>;
    async fn list_by_workspace(
        &self,
        workspace_id: &str,
        include_deleted: bool,
    ) -> OrchestratorResult<Vec<DedicatedNode>>;
    async fn list_by_status(&self, status: NodeStatus) -> OrchestratorResult<Vec<DedicatedNode>>;
}

/// 节点事件仓储抽象
#[async_trait]
pub trait NodeEventRepository: Send + Sync {
    async fn append(&self, event: &NodeEvent) -> OrchestratorResult<()>;
    /// 按时间倒序返回最近的事件
    async fn list_by_node(&self, node_id: &str, limit: usize) -> OrchestratorResult<Vec<NodeEvent>>;
    async fn prune_before(&self, cutoff: DateTime<Utc>) -> OrchestratorResult<u64>;
}

/// 任务仓储抽象
#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn create(&self, task: &Task) -> OrchestratorResult<()>;
    async fn get_by_id(&self, id: &str) -> OrchestratorResult<Option<Task>>;
    async fn list_by_target(&self, target_id: &str) -> OrchestratorResult<Vec<Task>>;

    /// 到期可执行的 pending 任务，按 scheduled_at 升序
    async fn find_ready(&self, now: DateTime<Utc>, limit: u32) -> OrchestratorResult<Vec<Task>>;

    /// 条件更新 pending → running，只有一个调用者能返回 true
    async fn claim(
        &self,
        id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> OrchestratorResult<bool>;

    // 以下结算操作只对当前持有者生效：任务不再由 `worker_id` 运行时返回 NotFound

    async fn mark_succeeded(
        &self,
        id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> OrchestratorResult<()>;

    /// running → pending，并推迟到 `scheduled_at`
    async fn requeue(
        &self,
        id: &str,
        worker_id: &str,
        attempts: u32,
        last_error: &str,
        scheduled_at: DateTime<Utc>,
    ) -> OrchestratorResult<()>;

    async fn mark_failed(
        &self,
        id: &str,
        worker_id: &str,
        attempts: u32,
        last_error: &str,
        now: DateTime<Utc>,
    ) -> OrchestratorResult<()>;

    /// 把 `started_at` 早于阈值的 running 任务放回 pending，返回数量
    async fn recover_stale(&self, started_before: DateTime<Utc>) -> OrchestratorResult<u64>;
}
