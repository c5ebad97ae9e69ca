//! 测试数据构建器
//!
//! 提供带合理默认值的构建器，测试只需覆盖关心的字段。

use chrono::{DateTime, TimeZone, Utc};
use kaas_domain::{
    DedicatedNode, NodeProvisionRequest, NodeStatus, NodeType, Task, TaskOperation, TaskStatus,
    Workspace, WorkspaceStatus,
};

/// 测试使用的固定起始时间
pub fn fixed_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 15, 8, 0, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

pub struct NodeBuilder {
    node: DedicatedNode,
}

impl NodeBuilder {
    pub fn new() -> Self {
        Self {
            node: DedicatedNode::new(
                "node-1",
                "ws-1",
                "worker-1",
                NodeType::Small.specification(),
                fixed_now(),
            ),
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.node.id = id.to_string();
        self
    }

    pub fn with_workspace(mut self, workspace_id: &str) -> Self {
        self.node.workspace_id = workspace_id.to_string();
        self
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.node.name = name.to_string();
        self
    }

    pub fn with_type(mut self, node_type: NodeType) -> Self {
        self.node.specification = node_type.specification();
        self
    }

    pub fn with_status(mut self, status: NodeStatus) -> Self {
        self.node.status = status;
        self
    }

    pub fn with_external_id(mut self, external_id: &str) -> Self {
        self.node.external_id = Some(external_id.to_string());
        self
    }

    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.node.created_at = at;
        self.node.updated_at = at;
        self
    }

    /// 标记为已删除，同时设置删除时间
    pub fn deleted_at(mut self, at: DateTime<Utc>) -> Self {
        self.node.status = NodeStatus::Deleted;
        self.node.deleted_at = Some(at);
        self
    }

    pub fn ready(self) -> Self {
        self.with_status(NodeStatus::Ready)
    }

    pub fn build(self) -> DedicatedNode {
        self.node
    }
}

impl Default for NodeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub struct WorkspaceBuilder {
    workspace: Workspace,
}

impl WorkspaceBuilder {
    pub fn new() -> Self {
        Self {
            workspace: Workspace::new("ws-1", "test-workspace", "starter", fixed_now()),
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.workspace.id = id.to_string();
        self
    }

    pub fn with_plan(mut self, plan_id: &str) -> Self {
        self.workspace.plan_id = plan_id.to_string();
        self
    }

    pub fn with_status(mut self, status: WorkspaceStatus) -> Self {
        self.workspace.status = status;
        self
    }

    pub fn with_replicas(mut self, replicas: u32) -> Self {
        self.workspace.control_plane_replicas = replicas;
        self
    }

    /// 已就绪的工作空间，带一个控制面副本
    pub fn running(self) -> Self {
        self.with_status(WorkspaceStatus::Running).with_replicas(1)
    }

    pub fn build(self) -> Workspace {
        self.workspace
    }
}

impl Default for WorkspaceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub struct TaskBuilder {
    task: Task,
}

impl TaskBuilder {
    pub fn new(operation: TaskOperation) -> Self {
        Self {
            task: Task::new(operation, 3, fixed_now()),
        }
    }

    pub fn provision_node(workspace_id: &str, name: &str, node_type: NodeType) -> Self {
        Self::new(TaskOperation::ProvisionNode {
            workspace_id: workspace_id.to_string(),
            request: NodeProvisionRequest::new(name, node_type),
        })
    }

    pub fn delete_node(node_id: &str) -> Self {
        Self::new(TaskOperation::DeleteNode {
            node_id: node_id.to_string(),
        })
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.task.id = id.to_string();
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.task.max_retries = max_retries;
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.task.attempts = attempts;
        self
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.task.status = status;
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.task.scheduled_at = at;
        self.task.created_at = at;
        self
    }

    pub fn build(self) -> Task {
        self.task
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builders_produce_consistent_defaults() {
        let node = NodeBuilder::new().with_type(NodeType::Large).ready().build();
        assert_eq!(node.node_type(), NodeType::Large);
        assert!(node.can_schedule_workload());

        let deleted = NodeBuilder::new().deleted_at(fixed_now()).build();
        assert!(deleted.is_deleted());

        let task = TaskBuilder::delete_node("node-7").with_max_retries(0).build();
        assert_eq!(task.target().id(), "node-7");
        assert_eq!(task.status, TaskStatus::Pending);
    }
}
