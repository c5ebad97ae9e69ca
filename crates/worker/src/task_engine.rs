//! 任务引擎
//!
//! 受理任务时做同步校验，执行时先原子领取再调用生命周期控制器。外部服务错误按退避
//! 策略重新排队，重试耗尽或不可重试的错误使任务失败，并把所属节点或工作空间置为失败。

use std::sync::Arc;
use std::time::Instant;

use kaas_core::{Clock, OrchestratorError, OrchestratorResult};
use kaas_domain::{
    DedicatedNode, NodeAction, ResourceRequest, Task, TaskKind, TaskOperation, TaskRepository,
    TransitionRejected,
};
use kaas_lifecycle::{NodeLifecycleController, ResourceAllocator, WorkspaceLifecycleController};
use metrics::{counter, histogram};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::retry::RetryPolicy;

/// 一次处理的结果
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Succeeded,
    /// 重新排队，`attempts` 为累计失败次数
    Requeued { attempts: u32 },
    Failed { attempts: u32, error: String },
    /// 已被其他 Worker 领取
    NotClaimed,
    /// 执行期间任务因超时被回收并由其他 Worker 接管，本次结果已丢弃
    Reclaimed,
}

pub struct TaskEngine {
    tasks: Arc<dyn TaskRepository>,
    nodes: Arc<NodeLifecycleController>,
    workspaces: Arc<WorkspaceLifecycleController>,
    allocator: Arc<ResourceAllocator>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    worker_id: String,
    max_retries: u32,
}

impl TaskEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tasks: Arc<dyn TaskRepository>,
        nodes: Arc<NodeLifecycleController>,
        workspaces: Arc<WorkspaceLifecycleController>,
        allocator: Arc<ResourceAllocator>,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
        worker_id: impl Into<String>,
        max_retries: u32,
    ) -> Self {
        Self {
            tasks,
            nodes,
            workspaces,
            allocator,
            clock,
            retry,
            worker_id: worker_id.into(),
            max_retries,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// 受理任务
    ///
    /// 校验错误、状态迁移错误和配额不足都在这里同步返回，不会创建任务。
    #[instrument(
        skip(self, operation),
        fields(kind = %operation.kind(), target = %operation.target().id())
    )]
    pub async fn submit(&self, operation: TaskOperation) -> OrchestratorResult<Task> {
        self.admit(&operation).await?;
        let task = Task::new(operation, self.max_retries, self.clock.now());
        self.tasks.create(&task).await?;
        info!("已受理任务 {}", task.entity_description());
        Ok(task)
    }

    async fn admit(&self, operation: &TaskOperation) -> OrchestratorResult<()> {
        match operation {
            TaskOperation::ProvisionWorkspace { workspace_id } => {
                let workspace = self.workspaces.get_workspace(workspace_id).await?;
                let plan = self.workspaces.plan(&workspace.plan_id)?;
                plan.validate()?;
                Ok(())
            }
            TaskOperation::DeleteWorkspace { workspace_id }
            | TaskOperation::SuspendWorkspace { workspace_id } => {
                self.workspaces.get_workspace(workspace_id).await.map(|_| ())
            }
            TaskOperation::ScaleWorkspace {
                workspace_id,
                replicas,
            } => {
                let workspace = self.workspaces.get_workspace(workspace_id).await?;
                let extra = replicas.saturating_sub(workspace.control_plane_replicas);
                self.ensure_replica_headroom(workspace_id, extra).await
            }
            TaskOperation::ReactivateWorkspace { workspace_id } => {
                let workspace = self.workspaces.get_workspace(workspace_id).await?;
                let extra = 1u32.saturating_sub(workspace.control_plane_replicas);
                self.ensure_replica_headroom(workspace_id, extra).await
            }
            TaskOperation::ProvisionNode {
                workspace_id,
                request,
            } => {
                request.validate()?;
                self.workspaces.get_workspace(workspace_id).await?;
                // 分配记录必须存在
                self.allocator
                    .can_allocate(workspace_id, &ResourceRequest::default())
                    .await
                    .map(|_| ())
            }
            TaskOperation::StartNode { node_id } => {
                self.admit_node(node_id, NodeAction::Start).await
            }
            TaskOperation::StopNode { node_id } => self.admit_node(node_id, NodeAction::Stop).await,
            TaskOperation::DeleteNode { node_id } => {
                self.admit_node(node_id, NodeAction::Delete).await
            }
            TaskOperation::RebootNode { node_id } => {
                let node = self.nodes.get_node(node_id).await?;
                if node.can_schedule_workload() {
                    Ok(())
                } else {
                    Err(TransitionRejected {
                        entity: "节点",
                        from: node.status.as_str(),
                        action: "reboot",
                    }
                    .into())
                }
            }
        }
    }

    async fn admit_node(&self, node_id: &str, action: NodeAction) -> OrchestratorResult<()> {
        let node: DedicatedNode = self.nodes.get_node(node_id).await?;
        node.status.next(action)?;
        Ok(())
    }

    async fn ensure_replica_headroom(
        &self,
        workspace_id: &str,
        extra: u32,
    ) -> OrchestratorResult<()> {
        if extra == 0 {
            return Ok(());
        }
        let needed = self.workspaces.replica_footprint().scaled(f64::from(extra));
        self.allocator.ensure_can_allocate(workspace_id, &needed).await
    }

    /// 只处理开通类任务
    pub async fn process_provisioning_task(
        &self,
        task_id: &str,
        cancel: &CancellationToken,
    ) -> OrchestratorResult<TaskOutcome> {
        self.process_kind(task_id, &[TaskKind::Provision], cancel).await
    }

    /// 只处理删除类任务
    pub async fn process_deletion_task(
        &self,
        task_id: &str,
        cancel: &CancellationToken,
    ) -> OrchestratorResult<TaskOutcome> {
        self.process_kind(task_id, &[TaskKind::Delete], cancel).await
    }

    async fn process_kind(
        &self,
        task_id: &str,
        kinds: &[TaskKind],
        cancel: &CancellationToken,
    ) -> OrchestratorResult<TaskOutcome> {
        let task = self.load(task_id).await?;
        if !kinds.contains(&task.kind()) {
            return Err(OrchestratorError::invalid_request(format!(
                "任务 {} 的类型为 {}，不能在此处理",
                task_id,
                task.kind()
            )));
        }
        self.process_task(task_id, cancel).await
    }

    async fn load(&self, task_id: &str) -> OrchestratorResult<Task> {
        self.tasks
            .get_by_id(task_id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found("任务", task_id))
    }

    /// 领取并执行任务
    ///
    /// 领取失败说明已被其他 Worker 执行，返回 `NotClaimed` 而不是错误。
    #[instrument(skip(self, cancel), fields(worker_id = %self.worker_id))]
    pub async fn process_task(
        &self,
        task_id: &str,
        cancel: &CancellationToken,
    ) -> OrchestratorResult<TaskOutcome> {
        if !self
            .tasks
            .claim(task_id, &self.worker_id, self.clock.now())
            .await?
        {
            debug!("任务 {} 已被其他 Worker 领取", task_id);
            return Ok(TaskOutcome::NotClaimed);
        }

        let task = self.load(task_id).await?;
        info!("开始执行任务 {}", task.entity_description());
        let started = Instant::now();
        let result = self.execute(&task, cancel).await;
        histogram!("kaas_task_duration_seconds", "kind" => task.kind().as_str())
            .record(started.elapsed().as_secs_f64());

        self.settle(&task, result).await
    }

    async fn execute(&self, task: &Task, cancel: &CancellationToken) -> OrchestratorResult<()> {
        match &task.operation {
            TaskOperation::ProvisionWorkspace { workspace_id } => {
                self.workspaces
                    .provision_workspace(workspace_id, cancel)
                    .await?;
            }
            TaskOperation::DeleteWorkspace { workspace_id } => {
                self.workspaces
                    .teardown_workspace(workspace_id, cancel)
                    .await?;
            }
            TaskOperation::ScaleWorkspace {
                workspace_id,
                replicas,
            } => {
                self.workspaces
                    .scale_vcluster(workspace_id, *replicas)
                    .await?;
            }
            TaskOperation::SuspendWorkspace { workspace_id } => {
                self.workspaces.suspend_workspace(workspace_id).await?;
            }
            TaskOperation::ReactivateWorkspace { workspace_id } => {
                self.workspaces
                    .reactivate_workspace(workspace_id, cancel)
                    .await?;
            }
            TaskOperation::ProvisionNode {
                workspace_id,
                request,
            } => {
                self.nodes
                    .provision_dedicated_node(workspace_id, request, &task.id, cancel)
                    .await?;
                self.allocator
                    .transition_to_dedicated_plan(workspace_id)
                    .await?;
            }
            TaskOperation::StartNode { node_id } => {
                self.nodes.start_node(node_id, cancel).await?;
            }
            TaskOperation::StopNode { node_id } => {
                self.nodes.stop_node(node_id, cancel).await?;
            }
            TaskOperation::RebootNode { node_id } => {
                self.nodes.reboot_node(node_id).await?;
            }
            TaskOperation::DeleteNode { node_id } => {
                self.nodes.delete_node(node_id, cancel).await?;
            }
        }
        Ok(())
    }

    async fn settle(
        &self,
        task: &Task,
        result: OrchestratorResult<()>,
    ) -> OrchestratorResult<TaskOutcome> {
        let now = self.clock.now();
        let kind = task.kind().as_str();

        let error = match result {
            Ok(()) => {
                let written = self.tasks.mark_succeeded(&task.id, &self.worker_id, now).await;
                if !self.still_owned(task, written)? {
                    return Ok(TaskOutcome::Reclaimed);
                }
                counter!("kaas_tasks_succeeded_total", "kind" => kind).increment(1);
                info!("任务 {} 执行成功", task.id);
                return Ok(TaskOutcome::Succeeded);
            }
            Err(error) => error,
        };

        // 停机取消不计入失败次数
        if let OrchestratorError::Cancelled(_) = error {
            let written = self
                .tasks
                .requeue(&task.id, &self.worker_id, task.attempts, &error.to_string(), now)
                .await;
            if !self.still_owned(task, written)? {
                return Ok(TaskOutcome::Reclaimed);
            }
            warn!("任务 {} 被取消，已放回队列", task.id);
            return Ok(TaskOutcome::Requeued {
                attempts: task.attempts,
            });
        }

        let attempts = task.attempts + 1;
        let message = error.to_string();
        if error.is_retryable() && task.can_retry_after_failure() {
            let retry_at = self.retry.next_retry_at(attempts, now);
            let written = self
                .tasks
                .requeue(&task.id, &self.worker_id, attempts, &message, retry_at)
                .await;
            if !self.still_owned(task, written)? {
                return Ok(TaskOutcome::Reclaimed);
            }
            counter!("kaas_tasks_retried_total", "kind" => kind).increment(1);
            warn!(
                "任务 {} 第 {} 次失败，将在 {} 重试: {}",
                task.id, attempts, retry_at, message
            );
            return Ok(TaskOutcome::Requeued { attempts });
        }

        let written = self
            .tasks
            .mark_failed(&task.id, &self.worker_id, attempts, &message, now)
            .await;
        if !self.still_owned(task, written)? {
            return Ok(TaskOutcome::Reclaimed);
        }
        counter!("kaas_tasks_failed_total", "kind" => kind).increment(1);
        error!("任务 {} 最终失败 (共 {} 次): {}", task.id, attempts, message);
        self.mark_owner_failed(task, &message).await;

        Ok(TaskOutcome::Failed {
            attempts,
            error: message,
        })
    }

    /// 结算写入被拒绝说明任务已不归本 Worker 所有
    fn still_owned(
        &self,
        task: &Task,
        written: OrchestratorResult<()>,
    ) -> OrchestratorResult<bool> {
        match written {
            Ok(()) => Ok(true),
            Err(e) if e.is_not_found() => {
                warn!(
                    "任务 {} 已被回收并由其他 Worker 接管，丢弃 {} 的执行结果",
                    task.id, self.worker_id
                );
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// 任务最终失败后把所属实体置为失败状态，这里的错误只记录日志
    async fn mark_owner_failed(&self, task: &Task, reason: &str) {
        let result = match &task.operation {
            TaskOperation::ProvisionNode {
                workspace_id,
                request,
            } => self
                .nodes
                .record_provision_failure(workspace_id, request, reason)
                .await
                .map(|_| ()),
            TaskOperation::StartNode { node_id }
            | TaskOperation::StopNode { node_id }
            | TaskOperation::RebootNode { node_id }
            | TaskOperation::DeleteNode { node_id } => {
                self.nodes.fail_node(node_id, reason).await.map(|_| ())
            }
            TaskOperation::ProvisionWorkspace { workspace_id }
            | TaskOperation::DeleteWorkspace { workspace_id }
            | TaskOperation::ScaleWorkspace { workspace_id, .. }
            | TaskOperation::SuspendWorkspace { workspace_id }
            | TaskOperation::ReactivateWorkspace { workspace_id } => self
                .workspaces
                .mark_error(workspace_id, reason)
                .await
                .map(|_| ()),
        };
        if let Err(e) = result {
            error!("更新任务 {} 所属实体的失败状态时出错: {}", task.id, e);
        }
    }

    /// 把长时间处于运行中的任务放回队列
    pub async fn recover_stale_tasks(&self, timeout: chrono::Duration) -> OrchestratorResult<u64> {
        self.tasks.recover_stale(self.clock.now() - timeout).await
    }

    pub async fn get_task(&self, task_id: &str) -> OrchestratorResult<Task> {
        self.load(task_id).await
    }

    pub async fn is_terminal(&self, task_id: &str) -> OrchestratorResult<bool> {
        Ok(self.load(task_id).await?.status.is_terminal())
    }

    pub async fn tasks_for(&self, target_id: &str) -> OrchestratorResult<Vec<Task>> {
        self.tasks.list_by_target(target_id).await
    }
}
