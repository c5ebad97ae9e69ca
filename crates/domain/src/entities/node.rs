use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kaas_core::ValidationError;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::events::{NodeEvent, NodeEventType};
use crate::state_machine::{NodeAction, NodeStatus, TransitionRejected};
use crate::value_objects::{NodeSpecification, NodeType};

/// 租户独占的虚拟机节点，与外部虚拟机一一对应
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedicatedNode {
    pub id: String,
    pub workspace_id: String,
    pub name: String,
    pub status: NodeStatus,
    pub specification: NodeSpecification,
    /// 外部虚拟机ID
    pub external_id: Option<String>,
    /// 虚拟机所在宿主机
    pub host: Option<String>,
    pub ip_address: Option<String>,
    pub ssh_public_key: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl DedicatedNode {
    pub fn new(
        id: impl Into<String>,
        workspace_id: impl Into<String>,
        name: impl Into<String>,
        specification: NodeSpecification,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            workspace_id: workspace_id.into(),
            name: name.into(),
            status: NodeStatus::Unprovisioned,
            specification,
            external_id: None,
            host: None,
            ip_address: None,
            ssh_public_key: None,
            labels: BTreeMap::new(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    /// 执行状态机动作，失败时状态保持不变
    pub fn transition_to(
        &mut self,
        action: NodeAction,
        now: DateTime<Utc>,
    ) -> Result<NodeStatus, TransitionRejected> {
        let next = self.status.next(action)?;
        self.status = next;
        self.updated_at = now;
        if next == NodeStatus::Deleted {
            self.deleted_at = Some(now);
        }
        Ok(next)
    }

    pub fn can_schedule_workload(&self) -> bool {
        self.status == NodeStatus::Ready
    }

    pub fn is_deleted(&self) -> bool {
        self.status == NodeStatus::Deleted || self.deleted_at.is_some()
    }

    /// 是否仍占用虚拟机资源，失败且没有虚拟机的节点不再占用
    pub fn holds_resources(&self) -> bool {
        !self.is_deleted() && !(self.status == NodeStatus::Failed && self.external_id.is_none())
    }

    /// 计费截止时间：软删除时间，或不再占用资源时的最后更新时间
    pub fn billing_end(&self) -> Option<DateTime<Utc>> {
        match self.deleted_at {
            Some(deleted_at) => Some(deleted_at),
            None if !self.holds_resources() => Some(self.updated_at),
            None => None,
        }
    }

    /// 虚拟机释放后软删除失败节点，状态保持 Failed
    pub fn retire(&mut self, now: DateTime<Utc>) -> Result<(), TransitionRejected> {
        if self.status != NodeStatus::Failed {
            return Err(TransitionRejected {
                entity: "节点",
                from: self.status.as_str(),
                action: "retire",
            });
        }
        self.updated_at = now;
        self.deleted_at = Some(now);
        Ok(())
    }

    pub fn node_type(&self) -> NodeType {
        self.specification.node_type
    }

    /// 截至 `until` 的累计费用，已删除节点返回 0
    pub fn calculate_usage_cost(&self, until: DateTime<Utc>) -> f64 {
        if self.is_deleted() {
            return 0.0;
        }
        let end = self.billing_end().map_or(until, |end| end.min(until));
        hours_between(self.created_at, end) * self.node_type().hourly_rate()
    }

    pub fn event(
        &self,
        event_type: NodeEventType,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> NodeEvent {
        NodeEvent::new(&self.id, &self.workspace_id, event_type, message, now)
    }

    pub fn entity_description(&self) -> String {
        format!(
            "节点 '{}' (ID: {}, 类型: {}, 状态: {})",
            self.name,
            self.id,
            self.node_type(),
            self.status
        )
    }
}

/// 两个时间点之间的小时数，负区间记为 0
pub fn hours_between(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    let millis = (end - start).num_milliseconds();
    if millis <= 0 {
        0.0
    } else {
        millis as f64 / 3_600_000.0
    }
}

/// 一组节点的只读视图
#[derive(Debug, Clone, Default)]
pub struct NodePool {
    nodes: Vec<DedicatedNode>,
}

impl NodePool {
    pub fn new(nodes: Vec<DedicatedNode>) -> Self {
        Self { nodes }
    }

    /// 可调度的节点，保持原有顺序
    pub fn available_nodes(&self) -> Vec<&DedicatedNode> {
        self.nodes
            .iter()
            .filter(|node| node.can_schedule_workload())
            .collect()
    }

    pub fn nodes(&self) -> &[DedicatedNode] {
        &self.nodes
    }
}

/// 专属节点开通请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeProvisionRequest {
    /// 节点ID在任务受理时分配，重试时保持不变
    pub node_id: String,
    pub name: String,
    pub node_type: NodeType,
    #[serde(default)]
    pub ssh_public_key: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub region: Option<String>,
}

impl NodeProvisionRequest {
    pub fn new(name: impl Into<String>, node_type: NodeType) -> Self {
        Self {
            node_id: Uuid::new_v4().to_string(),
            name: name.into(),
            node_type,
            ssh_public_key: None,
            labels: BTreeMap::new(),
            region: None,
        }
    }

    pub fn specification(&self) -> NodeSpecification {
        self.node_type.specification()
    }

    pub fn validate(&self) -> Result<NodeSpecification, ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::InvalidNodeSpec(
                "节点名称不能为空".to_string(),
            ));
        }
        if self.node_id.is_empty() {
            return Err(ValidationError::InvalidNodeSpec("节点ID不能为空".to_string()));
        }
        let spec = self.specification();
        spec.validate()?;
        Ok(spec)
    }
}
