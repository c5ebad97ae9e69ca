use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::node::NodeProvisionRequest;

/// 任务状态: pending → running → {succeeded, failed}
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "SUCCEEDED")]
    Succeeded,
    #[serde(rename = "FAILED")]
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Succeeded => "SUCCEEDED",
            TaskStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(TaskStatus::Pending),
            "RUNNING" => Ok(TaskStatus::Running),
            "SUCCEEDED" => Ok(TaskStatus::Succeeded),
            "FAILED" => Ok(TaskStatus::Failed),
            _ => Err(format!("无效的任务状态: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Provision,
    Delete,
    Scale,
    Start,
    Stop,
    Reboot,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Provision => "provision",
            TaskKind::Delete => "delete",
            TaskKind::Scale => "scale",
            TaskKind::Start => "start",
            TaskKind::Stop => "stop",
            TaskKind::Reboot => "reboot",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 任务作用对象
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum TaskTarget {
    Workspace(String),
    Node(String),
}

impl TaskTarget {
    pub fn type_str(&self) -> &'static str {
        match self {
            TaskTarget::Workspace(_) => "workspace",
            TaskTarget::Node(_) => "node",
        }
    }

    pub fn id(&self) -> &str {
        match self {
            TaskTarget::Workspace(id) | TaskTarget::Node(id) => id,
        }
    }
}

/// 任务携带的具体操作
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum TaskOperation {
    ProvisionWorkspace { workspace_id: String },
    DeleteWorkspace { workspace_id: String },
    ScaleWorkspace { workspace_id: String, replicas: u32 },
    SuspendWorkspace { workspace_id: String },
    ReactivateWorkspace { workspace_id: String },
    ProvisionNode {
        workspace_id: String,
        request: NodeProvisionRequest,
    },
    StartNode { node_id: String },
    StopNode { node_id: String },
    RebootNode { node_id: String },
    DeleteNode { node_id: String },
}

impl TaskOperation {
    pub fn kind(&self) -> TaskKind {
        match self {
            TaskOperation::ProvisionWorkspace { .. } | TaskOperation::ProvisionNode { .. } => {
                TaskKind::Provision
            }
            TaskOperation::DeleteWorkspace { .. } | TaskOperation::DeleteNode { .. } => {
                TaskKind::Delete
            }
            TaskOperation::ScaleWorkspace { .. } => TaskKind::Scale,
            TaskOperation::ReactivateWorkspace { .. } | TaskOperation::StartNode { .. } => {
                TaskKind::Start
            }
            TaskOperation::SuspendWorkspace { .. } | TaskOperation::StopNode { .. } => {
                TaskKind::Stop
            }
            TaskOperation::RebootNode { .. } => TaskKind::Reboot,
        }
    }

    pub fn target(&self) -> TaskTarget {
        match self {
            TaskOperation::ProvisionWorkspace { workspace_id }
            | TaskOperation::DeleteWorkspace { workspace_id }
            | TaskOperation::ScaleWorkspace { workspace_id, .. }
            | TaskOperation::SuspendWorkspace { workspace_id }
            | TaskOperation::ReactivateWorkspace { workspace_id } => {
                TaskTarget::Workspace(workspace_id.clone())
            }
            TaskOperation::ProvisionNode { request, .. } => {
                TaskTarget::Node(request.node_id.clone())
            }
            TaskOperation::StartNode { node_id }
            | TaskOperation::StopNode { node_id }
            | TaskOperation::RebootNode { node_id }
            | TaskOperation::DeleteNode { node_id } => TaskTarget::Node(node_id.clone()),
        }
    }
}

/// 异步工作单元
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub operation: TaskOperation,
    pub status: TaskStatus,
    /// 已失败的执行次数
    pub attempts: u32,
    pub max_retries: u32,
    /// 最早可被领取的时间
    pub scheduled_at: DateTime<Utc>,
    pub worker_id: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(operation: TaskOperation, max_retries: u32, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            operation,
            status: TaskStatus::Pending,
            attempts: 0,
            max_retries,
            scheduled_at: now,
            worker_id: None,
            last_error: None,
            created_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn kind(&self) -> TaskKind {
        self.operation.kind()
    }

    pub fn target(&self) -> TaskTarget {
        self.operation.target()
    }

    /// 再失败一次后是否仍可重试
    pub fn can_retry_after_failure(&self) -> bool {
        self.attempts < self.max_retries
    }

    pub fn entity_description(&self) -> String {
        let target = self.target();
        format!(
            "任务 {} ({} {} {})",
            self.id,
            self.kind(),
            target.type_str(),
            target.id()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value_objects::NodeType;

    #[test]
    fn test_operation_kind_and_target() {
        let request = NodeProvisionRequest::new("node-a", NodeType::Small);
        let node_id = request.node_id.clone();
        let op = TaskOperation::ProvisionNode {
            workspace_id: "ws-1".to_string(),
            request,
        };
        assert_eq!(op.kind(), TaskKind::Provision);
        assert_eq!(op.target(), TaskTarget::Node(node_id));

        let op = TaskOperation::SuspendWorkspace {
            workspace_id: "ws-1".to_string(),
        };
        assert_eq!(op.kind(), TaskKind::Stop);
        assert_eq!(op.target(), TaskTarget::Workspace("ws-1".to_string()));
    }

    #[test]
    fn test_operation_json_shape() {
        let op = TaskOperation::ScaleWorkspace {
            workspace_id: "ws-1".to_string(),
            replicas: 3,
        };
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["operation"], "scale_workspace");
        assert_eq!(json["replicas"], 3);
        let parsed: TaskOperation = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, op);
    }

    #[test]
    fn test_retry_ceiling() {
        let mut task = Task::new(
            TaskOperation::DeleteNode {
                node_id: "n1".to_string(),
            },
            2,
            Utc::now(),
        );
        assert!(task.can_retry_after_failure());
        task.attempts = 1;
        assert!(task.can_retry_after_failure());
        task.attempts = 2;
        assert!(!task.can_retry_after_failure());
    }
}
