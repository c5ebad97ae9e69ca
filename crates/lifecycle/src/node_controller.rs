//! 专属节点生命周期控制器
//!
//! 负责调用虚拟化平台网关并驱动节点状态机，每次状态迁移都会写入节点事件。

use std::sync::Arc;

use chrono::Duration as ChronoDuration;
use kaas_core::{Clock, OrchestratorError, OrchestratorResult};
use kaas_domain::ports::{NodeGateway, VmPowerState, VmSpec};
use kaas_domain::{
    DedicatedNode, NodeAction, NodeEvent, NodeEventRepository, NodeEventType, NodePool,
    NodeProvisionRequest, NodeRepository, NodeStatus, TransitionRejected,
};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::waiter::{poll_until, PollSettings};

/// 节点本地状态与虚拟机电源状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStatusReport {
    pub node: DedicatedNode,
    pub power_state: VmPowerState,
}

pub struct NodeLifecycleController {
    nodes: Arc<dyn NodeRepository>,
    events: Arc<dyn NodeEventRepository>,
    gateway: Arc<dyn NodeGateway>,
    clock: Arc<dyn Clock>,
    wait: PollSettings,
}

impl NodeLifecycleController {
    pub fn new(
        nodes: Arc<dyn NodeRepository>,
        events: Arc<dyn NodeEventRepository>,
        gateway: Arc<dyn NodeGateway>,
        clock: Arc<dyn Clock>,
        wait: PollSettings,
    ) -> Self {
        Self {
            nodes,
            events,
            gateway,
            clock,
            wait,
        }
    }

    async fn load(&self, node_id: &str) -> OrchestratorResult<DedicatedNode> {
        self.nodes
            .get_by_id(node_id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found("节点", node_id))
    }

    pub async fn get_node(&self, node_id: &str) -> OrchestratorResult<DedicatedNode> {
        self.load(node_id).await
    }

    fn external_id(node: &DedicatedNode) -> OrchestratorResult<String> {
        node.external_id.clone().ok_or_else(|| {
            OrchestratorError::invalid_request(format!("节点 {} 没有关联的虚拟机", node.id))
        })
    }

    async fn record(
        &self,
        node: &DedicatedNode,
        event_type: NodeEventType,
        message: impl Into<String>,
    ) -> OrchestratorResult<()> {
        let event = node.event(event_type, message, self.clock.now());
        self.events.append(&event).await
    }

    /// 执行状态迁移、持久化并记录事件
    async fn apply(
        &self,
        node: &mut DedicatedNode,
        action: NodeAction,
        event_type: NodeEventType,
        message: impl Into<String>,
    ) -> OrchestratorResult<NodeStatus> {
        let from = node.status;
        let next = node.transition_to(action, self.clock.now())?;
        self.nodes.update(node).await?;
        self.record(node, event_type, message).await?;
        counter!("kaas_node_transitions_total", "action" => action.as_str()).increment(1);
        info!(node_id = %node.id, "节点状态 {} --{}--> {}", from, action, next);
        Ok(next)
    }

    /// 创建专属节点并等待虚拟机运行
    ///
    /// `request_id` 作为虚拟机创建的幂等键。节点已处于 Provisioning 时不会重复创建虚拟机，
    /// 而是继续等待；网关失败时不写入任何节点记录。
    #[instrument(skip(self, request, cancel), fields(node_id = %request.node_id))]
    pub async fn provision_dedicated_node(
        &self,
        workspace_id: &str,
        request: &NodeProvisionRequest,
        request_id: &str,
        cancel: &CancellationToken,
    ) -> OrchestratorResult<DedicatedNode> {
        let specification = request.validate()?;

        let mut node = match self.nodes.get_by_id(&request.node_id).await? {
            Some(existing) if existing.status == NodeStatus::Provisioning => {
                info!("节点 {} 已在创建中，继续等待虚拟机就绪", existing.id);
                existing
            }
            Some(existing) if existing.status == NodeStatus::Ready => return Ok(existing),
            Some(existing) => {
                return Err(TransitionRejected {
                    entity: "节点",
                    from: existing.status.as_str(),
                    action: NodeAction::Provision.as_str(),
                }
                .into())
            }
            None => {
                let vm_spec = VmSpec::for_node(request_id, workspace_id, request, None);
                let external_id = self.gateway.create_vm(&vm_spec).await?;
                let vm = self.gateway.get_vm(&external_id).await?;

                let now = self.clock.now();
                let mut node = DedicatedNode::new(
                    &request.node_id,
                    workspace_id,
                    &request.name,
                    specification,
                    now,
                );
                node.external_id = Some(external_id.clone());
                node.host = Some(vm.host);
                node.ip_address = vm.ip_address;
                node.ssh_public_key = request.ssh_public_key.clone();
                node.labels = request.labels.clone();
                if let Some(region) = &request.region {
                    node.labels.insert("region".to_string(), region.clone());
                }
                node.transition_to(NodeAction::Provision, now)?;
                self.nodes.create(&node).await?;
                self.record(
                    &node,
                    NodeEventType::Provisioning,
                    format!(
                        "虚拟机 {} 已创建 (模板 {})",
                        external_id, vm_spec.template_id
                    ),
                )
                .await?;
                info!("节点 {} 已开始创建", node.entity_description());
                node
            }
        };

        let external_id = Self::external_id(&node)?;
        self.wait_for_vm_state(&external_id, VmPowerState::Running, cancel)
            .await?;
        self.apply(
            &mut node,
            NodeAction::Complete,
            NodeEventType::StatusChange,
            "节点已就绪",
        )
        .await?;
        Ok(node)
    }

    /// 重试耗尽后的补偿记录
    ///
    /// 已有记录时执行 fail 迁移，否则写入一条 Failed 状态的节点记录。
    #[instrument(skip(self, request), fields(node_id = %request.node_id))]
    pub async fn record_provision_failure(
        &self,
        workspace_id: &str,
        request: &NodeProvisionRequest,
        reason: &str,
    ) -> OrchestratorResult<DedicatedNode> {
        if self.nodes.get_by_id(&request.node_id).await?.is_some() {
            return self.fail_node(&request.node_id, reason).await;
        }

        let now = self.clock.now();
        let mut node = DedicatedNode::new(
            &request.node_id,
            workspace_id,
            &request.name,
            request.specification(),
            now,
        );
        node.ssh_public_key = request.ssh_public_key.clone();
        node.labels = request.labels.clone();
        node.transition_to(NodeAction::Provision, now)?;
        node.transition_to(NodeAction::Fail, now)?;
        self.nodes.create(&node).await?;
        self.record(
            &node,
            NodeEventType::Error,
            format!("节点创建失败: {reason}"),
        )
        .await?;
        warn!("节点 {} 创建失败，已写入补偿记录", node.id);
        Ok(node)
    }

    /// 把节点标记为失败，当前状态不允许 fail 时只记录错误事件
    pub async fn fail_node(
        &self,
        node_id: &str,
        reason: &str,
    ) -> OrchestratorResult<DedicatedNode> {
        let mut node = self.load(node_id).await?;
        if node.status.can(NodeAction::Fail) {
            self.apply(&mut node, NodeAction::Fail, NodeEventType::Error, reason)
                .await?;
        } else {
            self.record(&node, NodeEventType::Error, reason).await?;
        }
        Ok(node)
    }

    #[instrument(skip(self, cancel))]
    pub async fn start_node(
        &self,
        node_id: &str,
        cancel: &CancellationToken,
    ) -> OrchestratorResult<DedicatedNode> {
        self.drive_power(node_id, NodeAction::Start, VmPowerState::Running, cancel)
            .await
    }

    #[instrument(skip(self, cancel))]
    pub async fn stop_node(
        &self,
        node_id: &str,
        cancel: &CancellationToken,
    ) -> OrchestratorResult<DedicatedNode> {
        self.drive_power(node_id, NodeAction::Stop, VmPowerState::Stopped, cancel)
            .await
    }

    async fn drive_power(
        &self,
        node_id: &str,
        action: NodeAction,
        target: VmPowerState,
        cancel: &CancellationToken,
    ) -> OrchestratorResult<DedicatedNode> {
        let mut node = self.load(node_id).await?;
        let external_id = Self::external_id(&node)?;

        let resuming = matches!(
            (action, node.status),
            (NodeAction::Start, NodeStatus::Starting) | (NodeAction::Stop, NodeStatus::Stopping)
        );
        if !resuming {
            node.status.next(action)?;
            match action {
                NodeAction::Start => self.gateway.start_vm(&external_id).await?,
                _ => self.gateway.stop_vm(&external_id).await?,
            }
            self.apply(
                &mut node,
                action,
                NodeEventType::StatusChange,
                format!("已请求虚拟机 {external_id} 执行 {action}"),
            )
            .await?;
        }

        self.wait_for_vm_state(&external_id, target, cancel).await?;
        self.apply(
            &mut node,
            NodeAction::Complete,
            NodeEventType::StatusChange,
            format!("虚拟机已进入 {target} 状态"),
        )
        .await?;
        Ok(node)
    }

    /// 重启不改变节点状态，只允许对 Ready 节点执行
    #[instrument(skip(self))]
    pub async fn reboot_node(&self, node_id: &str) -> OrchestratorResult<DedicatedNode> {
        let node = self.load(node_id).await?;
        if !node.can_schedule_workload() {
            return Err(TransitionRejected {
                entity: "节点",
                from: node.status.as_str(),
                action: "reboot",
            }
            .into());
        }
        let external_id = Self::external_id(&node)?;
        self.gateway.reboot_vm(&external_id).await?;
        self.record(&node, NodeEventType::StatusChange, "节点已重启")
            .await?;
        info!("节点 {} 已重启", node.id);
        Ok(node)
    }

    /// 删除虚拟机并把节点软删除
    ///
    /// 已处于 Deleting 的节点会重新下发删除并继续等待。
    #[instrument(skip(self, cancel))]
    pub async fn delete_node(
        &self,
        node_id: &str,
        cancel: &CancellationToken,
    ) -> OrchestratorResult<DedicatedNode> {
        let mut node = self.load(node_id).await?;
        let resuming = node.status == NodeStatus::Deleting;
        if !resuming {
            node.status.next(NodeAction::Delete)?;
        }

        if let Some(external_id) = &node.external_id {
            self.gateway.delete_vm(external_id).await?;
        }
        if !resuming {
            self.apply(
                &mut node,
                NodeAction::Delete,
                NodeEventType::Deletion,
                "已请求删除虚拟机",
            )
            .await?;
        }

        if let Some(external_id) = node.external_id.clone() {
            self.wait_for_vm_absent(&external_id, cancel).await?;
        }
        self.apply(
            &mut node,
            NodeAction::Complete,
            NodeEventType::Deletion,
            "节点已删除",
        )
        .await?;
        Ok(node)
    }

    /// 轮询虚拟机电源状态直到等于 `target`
    pub async fn wait_for_vm_state(
        &self,
        external_id: &str,
        target: VmPowerState,
        cancel: &CancellationToken,
    ) -> OrchestratorResult<()> {
        let gateway = self.gateway.as_ref();
        let operation = format!("等待虚拟机 {external_id} 进入 {target} 状态");
        poll_until(self.wait, cancel, &operation, move || async move {
            let state = gateway.get_vm_status(external_id).await?;
            Ok::<_, OrchestratorError>((state == target).then_some(()))
        })
        .await
    }

    async fn wait_for_vm_absent(
        &self,
        external_id: &str,
        cancel: &CancellationToken,
    ) -> OrchestratorResult<()> {
        let gateway = self.gateway.as_ref();
        let operation = format!("等待虚拟机 {external_id} 删除");
        poll_until(self.wait, cancel, &operation, move || async move {
            match gateway.get_vm(external_id).await {
                Ok(_) => Ok(None),
                Err(e) if e.is_not_found() => Ok(Some(())),
                Err(e) => Err(e),
            }
        })
        .await
    }

    /// 本地状态加上虚拟机电源状态，网关不可达时电源状态为 unknown
    pub async fn get_node_status(&self, node_id: &str) -> OrchestratorResult<NodeStatusReport> {
        let node = self.load(node_id).await?;
        let power_state = match &node.external_id {
            Some(external_id) => match self.gateway.get_vm_status(external_id).await {
                Ok(state) => state,
                Err(e) => {
                    warn!("查询节点 {} 的虚拟机状态失败: {}", node.id, e);
                    VmPowerState::Unknown
                }
            },
            None => VmPowerState::Unknown,
        };
        Ok(NodeStatusReport { node, power_state })
    }

    pub async fn list_node_events(
        &self,
        node_id: &str,
        limit: usize,
    ) -> OrchestratorResult<Vec<NodeEvent>> {
        self.events.list_by_node(node_id, limit).await
    }

    /// 删除早于保留期的节点事件
    pub async fn prune_node_events(&self, retention: ChronoDuration) -> OrchestratorResult<u64> {
        let cutoff = self.clock.now() - retention;
        let pruned = self.events.prune_before(cutoff).await?;
        if pruned > 0 {
            info!("清理了 {} 条早于 {} 的节点事件", pruned, cutoff);
        }
        Ok(pruned)
    }

    /// 工作空间内可调度的节点
    pub async fn get_available_nodes(
        &self,
        workspace_id: &str,
    ) -> OrchestratorResult<Vec<DedicatedNode>> {
        let pool = NodePool::new(self.nodes.list_by_workspace(workspace_id, false).await?);
        Ok(pool.available_nodes().into_iter().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use kaas_core::ManualClock;
    use kaas_domain::ports::{VmInfo, VmResourceUsage, VmTemplate};
    use kaas_domain::NodeType;
    use kaas_infrastructure::{InMemoryNodeGateway, InMemoryRepositories};
    use kaas_testing_utils::{fixed_now, NodeBuilder};
    use mockall::mock;

    use super::*;

    mock! {
        pub Gateway {}

        #[async_trait]
        impl NodeGateway for Gateway {
            async fn create_vm(&self, spec: &VmSpec) -> OrchestratorResult<String>;
            async fn get_vm(&self, external_id: &str) -> OrchestratorResult<VmInfo>;
            async fn start_vm(&self, external_id: &str) -> OrchestratorResult<()>;
            async fn stop_vm(&self, external_id: &str) -> OrchestratorResult<()>;
            async fn reboot_vm(&self, external_id: &str) -> OrchestratorResult<()>;
            async fn delete_vm(&self, external_id: &str) -> OrchestratorResult<()>;
            async fn get_vm_status(&self, external_id: &str) -> OrchestratorResult<VmPowerState>;
            async fn get_vm_resource_usage(&self, external_id: &str) -> OrchestratorResult<VmResourceUsage>;
            async fn list_templates(&self) -> OrchestratorResult<Vec<VmTemplate>>;
            async fn list_vms(&self) -> OrchestratorResult<Vec<VmInfo>>;
        }
    }

    struct Fixture {
        repos: InMemoryRepositories,
        gateway: Arc<InMemoryNodeGateway>,
        controller: NodeLifecycleController,
    }

    fn fixture(settle_polls: u32) -> Fixture {
        let repos = InMemoryRepositories::new();
        let gateway = Arc::new(InMemoryNodeGateway::new(settle_polls));
        let controller = NodeLifecycleController::new(
            repos.nodes.clone(),
            repos.events.clone(),
            gateway.clone(),
            Arc::new(ManualClock::new(fixed_now())),
            PollSettings::new(Duration::from_secs(5), Duration::from_secs(30)),
        );
        Fixture {
            repos,
            gateway,
            controller,
        }
    }

    fn event_types(events: &[NodeEvent]) -> Vec<NodeEventType> {
        events.iter().rev().map(|e| e.event_type).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_provision_creates_ready_node_with_events() {
        let f = fixture(1);
        let mut request = NodeProvisionRequest::new("worker-1", NodeType::Medium);
        request.region = Some("eu-1".to_string());

        let node = f
            .controller
            .provision_dedicated_node("ws-1", &request, "task-1", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(node.status, NodeStatus::Ready);
        assert_eq!(node.specification.cpu_cores, 8);
        assert_eq!(node.labels.get("region").map(String::as_str), Some("eu-1"));
        assert!(node.external_id.is_some());

        let events = f.controller.list_node_events(&node.id, 10).await.unwrap();
        assert_eq!(
            event_types(&events),
            vec![NodeEventType::Provisioning, NodeEventType::StatusChange]
        );
    }

    #[tokio::test]
    async fn test_invalid_request_never_reaches_gateway() {
        let f = fixture(0);
        let request = NodeProvisionRequest::new("  ", NodeType::Small);

        let err = f
            .controller
            .provision_dedicated_node("ws-1", &request, "task-1", &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, OrchestratorError::Validation(_)));
        assert_eq!(f.gateway.create_calls().await, 0);
    }

    #[tokio::test]
    async fn test_gateway_failure_leaves_no_row_until_compensated() {
        let f = fixture(0);
        f.gateway.faults().fail_next("create_vm", 1).await;
        let request = NodeProvisionRequest::new("worker-1", NodeType::Small);

        let err = f
            .controller
            .provision_dedicated_node("ws-1", &request, "task-1", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(f.repos.nodes.get_by_id(&request.node_id).await.unwrap().is_none());

        let node = f
            .controller
            .record_provision_failure("ws-1", &request, "重试耗尽")
            .await
            .unwrap();
        assert_eq!(node.status, NodeStatus::Failed);
        let events = f.controller.list_node_events(&node.id, 10).await.unwrap();
        assert_eq!(event_types(&events), vec![NodeEventType::Error]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_provision_timeout_resumes_without_new_vm() {
        let f = fixture(u32::MAX);
        let request = NodeProvisionRequest::new("worker-1", NodeType::Small);
        let cancel = CancellationToken::new();

        let err = f
            .controller
            .provision_dedicated_node("ws-1", &request, "task-1", &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Timeout { .. }));

        let stored = f.repos.nodes.get_by_id(&request.node_id).await.unwrap().unwrap();
        assert_eq!(stored.status, NodeStatus::Provisioning);

        let _ = f
            .controller
            .provision_dedicated_node("ws-1", &request, "task-1", &cancel)
            .await;
        assert_eq!(f.gateway.create_calls().await, 1);
        assert_eq!(f.gateway.vm_count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_start_delete_cycle() {
        let f = fixture(1);
        let cancel = CancellationToken::new();
        let request = NodeProvisionRequest::new("worker-1", NodeType::Small);
        let node = f
            .controller
            .provision_dedicated_node("ws-1", &request, "task-1", &cancel)
            .await
            .unwrap();

        let node = f.controller.stop_node(&node.id, &cancel).await.unwrap();
        assert_eq!(node.status, NodeStatus::Stopped);

        let err = f.controller.reboot_node(&node.id).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::StateTransition { .. }));

        let node = f.controller.start_node(&node.id, &cancel).await.unwrap();
        assert_eq!(node.status, NodeStatus::Ready);
        f.controller.reboot_node(&node.id).await.unwrap();

        let node = f.controller.delete_node(&node.id, &cancel).await.unwrap();
        assert_eq!(node.status, NodeStatus::Deleted);
        assert!(node.deleted_at.is_some());
        assert_eq!(f.gateway.vm_count().await, 0);
        assert!(f.controller.get_available_nodes("ws-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_gateway_failure_does_not_advance_state() {
        let f = fixture(0);
        f.gateway
            .insert_vm(VmInfo {
                external_id: "vm-1".to_string(),
                name: "worker-1".to_string(),
                host: "pve-node1".to_string(),
                ip_address: None,
                power_state: VmPowerState::Running,
                tags: vec![],
            })
            .await;
        f.repos
            .nodes
            .create(&NodeBuilder::new().ready().with_external_id("vm-1").build())
            .await
            .unwrap();
        f.gateway.faults().fail_next("stop_vm", 1).await;

        let err = f
            .controller
            .stop_node("node-1", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        let stored = f.repos.nodes.get_by_id("node-1").await.unwrap().unwrap();
        assert_eq!(stored.status, NodeStatus::Ready);
    }

    #[tokio::test]
    async fn test_delete_rejected_while_provisioning() {
        let f = fixture(0);
        f.repos
            .nodes
            .create(
                &NodeBuilder::new()
                    .with_status(NodeStatus::Provisioning)
                    .with_external_id("vm-1")
                    .build(),
            )
            .await
            .unwrap();

        let err = f
            .controller
            .delete_node("node-1", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::StateTransition { .. }));
    }

    #[tokio::test]
    async fn test_node_status_is_unknown_when_gateway_fails() {
        let repos = InMemoryRepositories::new();
        repos
            .nodes
            .create(&NodeBuilder::new().ready().with_external_id("vm-9").build())
            .await
            .unwrap();
        let mut gateway = MockGateway::new();
        gateway
            .expect_get_vm_status()
            .times(1)
            .returning(|_| Err(OrchestratorError::external("node-gateway", "连接超时")));

        let controller = NodeLifecycleController::new(
            repos.nodes.clone(),
            repos.events.clone(),
            Arc::new(gateway),
            Arc::new(ManualClock::new(fixed_now())),
            PollSettings::from_seconds(5, 30),
        );
        let report = controller.get_node_status("node-1").await.unwrap();
        assert_eq!(report.power_state, VmPowerState::Unknown);
        assert_eq!(report.node.status, NodeStatus::Ready);
    }

    #[tokio::test]
    async fn test_available_nodes_keep_order() {
        let f = fixture(0);
        for (id, status) in [
            ("a", NodeStatus::Ready),
            ("b", NodeStatus::Stopped),
            ("c", NodeStatus::Ready),
            ("d", NodeStatus::Failed),
        ] {
            f.repos
                .nodes
                .create(&NodeBuilder::new().with_id(id).with_status(status).build())
                .await
                .unwrap();
        }

        let ids: Vec<_> = f
            .controller
            .get_available_nodes("ws-1")
            .await
            .unwrap()
            .into_iter()
            .map(|n| n.id)
            .collect();
        assert_eq!(ids, vec!["a", "c"]);
    }
}
