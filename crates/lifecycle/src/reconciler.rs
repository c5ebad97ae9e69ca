//! 外部资源与本地记录的对账
//!
//! 删除带平台标签但没有存活本地记录的虚拟机；释放失败节点仍持有的虚拟机并软删除节点；
//! 处理超过宽限期仍在 Provisioning 的节点：虚拟机已运行则补完成，虚拟机不存在则置为失败。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use kaas_core::{Clock, OrchestratorResult};
use kaas_domain::ports::{node_id_from_tags, NodeGateway, VmInfo, VmPowerState, PLATFORM_TAG};
use kaas_domain::{NodeAction, NodeEventRepository, NodeEventType, NodeRepository, NodeStatus};
use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub orphan_vms_deleted: Vec<String>,
    pub stale_nodes_completed: Vec<String>,
    pub stale_nodes_failed: Vec<String>,
    /// 已释放虚拟机并软删除的失败节点
    pub failed_nodes_released: Vec<String>,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.orphan_vms_deleted.is_empty()
            && self.stale_nodes_completed.is_empty()
            && self.stale_nodes_failed.is_empty()
            && self.failed_nodes_released.is_empty()
    }
}

pub struct Reconciler {
    nodes: Arc<dyn NodeRepository>,
    events: Arc<dyn NodeEventRepository>,
    gateway: Arc<dyn NodeGateway>,
    clock: Arc<dyn Clock>,
    provisioning_grace: ChronoDuration,
}

impl Reconciler {
    pub fn new(
        nodes: Arc<dyn NodeRepository>,
        events: Arc<dyn NodeEventRepository>,
        gateway: Arc<dyn NodeGateway>,
        clock: Arc<dyn Clock>,
        provisioning_grace: ChronoDuration,
    ) -> Self {
        Self {
            nodes,
            events,
            gateway,
            clock,
            provisioning_grace,
        }
    }

    pub async fn run_once(&self) -> OrchestratorResult<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let vms: Vec<VmInfo> = self
            .gateway
            .list_vms()
            .await?
            .into_iter()
            .filter(|vm| vm.tags.iter().any(|tag| tag == PLATFORM_TAG))
            .collect();

        for vm in &vms {
            let Some(node_id) = node_id_from_tags(&vm.tags) else {
                continue;
            };
            let orphan = match self.nodes.get_by_id(node_id).await? {
                None => true,
                Some(node) if node.is_deleted() => true,
                // 失败节点登记的虚拟机随节点一起释放
                Some(node) if node.status == NodeStatus::Failed => {
                    node.external_id.as_deref() != Some(vm.external_id.as_str())
                }
                Some(_) => false,
            };
            if !orphan {
                continue;
            }
            warn!("发现孤儿虚拟机 {} (节点 {})，执行删除", vm.external_id, node_id);
            self.gateway.delete_vm(&vm.external_id).await?;
            counter!("kaas_reconcile_orphan_vms_total").increment(1);
            report.orphan_vms_deleted.push(vm.external_id.clone());
        }

        let power: HashMap<&str, VmPowerState> = vms
            .iter()
            .map(|vm| (vm.external_id.as_str(), vm.power_state))
            .collect();

        for mut node in self.nodes.list_by_status(NodeStatus::Failed).await? {
            if node.is_deleted() {
                continue;
            }
            let Some(external_id) = node.external_id.clone() else {
                continue;
            };
            if power.contains_key(external_id.as_str()) {
                warn!("失败节点 {} 仍持有虚拟机 {}，执行删除", node.id, external_id);
                self.gateway.delete_vm(&external_id).await?;
                counter!("kaas_reconcile_orphan_vms_total").increment(1);
                report.orphan_vms_deleted.push(external_id.clone());
            }
            let now = self.clock.now();
            node.retire(now)?;
            self.nodes.update(&node).await?;
            self.events
                .append(&node.event(
                    NodeEventType::Deletion,
                    format!("对账: 已释放失败节点的虚拟机 {external_id}"),
                    now,
                ))
                .await?;
            info!("失败节点 {} 已软删除", node.id);
            report.failed_nodes_released.push(node.id);
        }

        let cutoff = self.clock.now() - self.provisioning_grace;

        for mut node in self.nodes.list_by_status(NodeStatus::Provisioning).await? {
            if node.updated_at >= cutoff {
                continue;
            }
            let state = node
                .external_id
                .as_deref()
                .and_then(|id| power.get(id).copied());

            let now = self.clock.now();
            let (action, event_type, message) = match state {
                Some(VmPowerState::Running) => (
                    NodeAction::Complete,
                    NodeEventType::StatusChange,
                    "对账: 虚拟机已运行，节点置为就绪",
                ),
                Some(_) => continue,
                None => (
                    NodeAction::Fail,
                    NodeEventType::Error,
                    "对账: 创建超过宽限期且虚拟机不存在",
                ),
            };
            node.transition_to(action, now)?;
            if state.is_none() {
                node.external_id = None;
            }
            self.nodes.update(&node).await?;
            self.events
                .append(&node.event(event_type, message, now))
                .await?;
            info!("节点 {} {}", node.id, message);
            match action {
                NodeAction::Complete => report.stale_nodes_completed.push(node.id),
                _ => report.stale_nodes_failed.push(node.id),
            }
        }

        Ok(report)
    }

    /// 按固定间隔执行对账直到取消
    pub async fn run(&self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        info!("对账任务已启动，间隔 {:?}", interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match self.run_once().await {
                        Ok(report) if !report.is_empty() => info!("对账完成: {:?}", report),
                        Ok(_) => {}
                        Err(e) => error!("对账失败: {}", e),
                    }
                }
            }
        }
        info!("对账任务已停止");
    }
}
