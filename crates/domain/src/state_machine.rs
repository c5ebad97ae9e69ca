//! 节点与工作空间的有限状态机
//!
//! 状态与动作都是封闭枚举，`next` 是对所有 (状态, 动作) 组合定义的全函数：
//! 要么返回下一个状态，要么返回 [`TransitionRejected`]。

use std::fmt;
use std::str::FromStr;

use kaas_core::OrchestratorError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 状态转换被拒绝
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{entity} 在状态 '{from}' 下不允许执行 '{action}'")]
pub struct TransitionRejected {
    pub entity: &'static str,
    pub from: &'static str,
    pub action: &'static str,
}

impl From<TransitionRejected> for OrchestratorError {
    fn from(rejected: TransitionRejected) -> Self {
        OrchestratorError::StateTransition {
            entity: rejected.entity,
            from: rejected.from.to_string(),
            action: rejected.action.to_string(),
        }
    }
}

/// 专属节点状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeStatus {
    #[serde(rename = "")]
    Unprovisioned,
    #[serde(rename = "provisioning")]
    Provisioning,
    #[serde(rename = "ready")]
    Ready,
    #[serde(rename = "starting")]
    Starting,
    #[serde(rename = "stopping")]
    Stopping,
    #[serde(rename = "stopped")]
    Stopped,
    #[serde(rename = "deleting")]
    Deleting,
    #[serde(rename = "failed")]
    Failed,
    #[serde(rename = "deleted")]
    Deleted,
}

/// 驱动节点状态机的动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeAction {
    Provision,
    Complete,
    Fail,
    Start,
    Stop,
    Delete,
}

impl NodeStatus {
    pub const ALL: [NodeStatus; 9] = [
        NodeStatus::Unprovisioned,
        NodeStatus::Provisioning,
        NodeStatus::Ready,
        NodeStatus::Starting,
        NodeStatus::Stopping,
        NodeStatus::Stopped,
        NodeStatus::Deleting,
        NodeStatus::Failed,
        NodeStatus::Deleted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Unprovisioned => "",
            NodeStatus::Provisioning => "provisioning",
            NodeStatus::Ready => "ready",
            NodeStatus::Starting => "starting",
            NodeStatus::Stopping => "stopping",
            NodeStatus::Stopped => "stopped",
            NodeStatus::Deleting => "deleting",
            NodeStatus::Failed => "failed",
            NodeStatus::Deleted => "deleted",
        }
    }

    pub fn next(self, action: NodeAction) -> Result<NodeStatus, TransitionRejected> {
        use NodeAction as A;
        use NodeStatus as S;

        match (self, action) {
            (S::Unprovisioned, A::Provision) => Ok(S::Provisioning),
            (S::Provisioning, A::Complete) => Ok(S::Ready),
            (S::Provisioning, A::Fail) => Ok(S::Failed),
            (S::Ready, A::Stop) => Ok(S::Stopping),
            (S::Ready, A::Delete) => Ok(S::Deleting),
            (S::Stopping, A::Complete) => Ok(S::Stopped),
            (S::Stopping, A::Fail) => Ok(S::Ready),
            (S::Stopped, A::Start) => Ok(S::Starting),
            (S::Stopped, A::Delete) => Ok(S::Deleting),
            (S::Starting, A::Complete) => Ok(S::Ready),
            (S::Starting, A::Fail) => Ok(S::Stopped),
            (S::Deleting, A::Complete) => Ok(S::Deleted),
            (S::Deleting, A::Fail) => Ok(S::Failed),
            (from, action) => Err(TransitionRejected {
                entity: "节点",
                from: from.as_str(),
                action: action.as_str(),
            }),
        }
    }

    pub fn can(self, action: NodeAction) -> bool {
        self.next(action).is_ok()
    }

    /// 处于过渡态，需要等待外部操作完成
    pub fn is_transitional(&self) -> bool {
        matches!(
            self,
            NodeStatus::Provisioning
                | NodeStatus::Starting
                | NodeStatus::Stopping
                | NodeStatus::Deleting
        )
    }
}

impl NodeAction {
    pub const ALL: [NodeAction; 6] = [
        NodeAction::Provision,
        NodeAction::Complete,
        NodeAction::Fail,
        NodeAction::Start,
        NodeAction::Stop,
        NodeAction::Delete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeAction::Provision => "provision",
            NodeAction::Complete => "complete",
            NodeAction::Fail => "fail",
            NodeAction::Start => "start",
            NodeAction::Stop => "stop",
            NodeAction::Delete => "delete",
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for NodeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NodeStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("无效的节点状态: {s}"))
    }
}

/// 工作空间状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkspaceStatus {
    #[serde(rename = "PENDING_CREATION")]
    PendingCreation,
    #[serde(rename = "STARTING")]
    Starting,
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "STOPPING")]
    Stopping,
    #[serde(rename = "STOPPED")]
    Stopped,
    #[serde(rename = "ERROR")]
    Error,
    #[serde(rename = "DELETING")]
    Deleting,
    #[serde(rename = "DELETED")]
    Deleted,
}

/// 驱动工作空间状态机的动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceAction {
    Start,
    Complete,
    Fail,
    Stop,
    Delete,
}

impl WorkspaceStatus {
    pub const ALL: [WorkspaceStatus; 8] = [
        WorkspaceStatus::PendingCreation,
        WorkspaceStatus::Starting,
        WorkspaceStatus::Running,
        WorkspaceStatus::Stopping,
        WorkspaceStatus::Stopped,
        WorkspaceStatus::Error,
        WorkspaceStatus::Deleting,
        WorkspaceStatus::Deleted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkspaceStatus::PendingCreation => "PENDING_CREATION",
            WorkspaceStatus::Starting => "STARTING",
            WorkspaceStatus::Running => "RUNNING",
            WorkspaceStatus::Stopping => "STOPPING",
            WorkspaceStatus::Stopped => "STOPPED",
            WorkspaceStatus::Error => "ERROR",
            WorkspaceStatus::Deleting => "DELETING",
            WorkspaceStatus::Deleted => "DELETED",
        }
    }

    pub fn next(self, action: WorkspaceAction) -> Result<WorkspaceStatus, TransitionRejected> {
        use WorkspaceAction as A;
        use WorkspaceStatus as S;

        match (self, action) {
            (S::PendingCreation, A::Start) => Ok(S::Starting),
            (S::Starting, A::Complete) => Ok(S::Running),
            (S::Starting, A::Fail) => Ok(S::Error),
            (S::Running, A::Stop) => Ok(S::Stopping),
            (S::Stopping, A::Complete) => Ok(S::Stopped),
            (S::Stopping, A::Fail) => Ok(S::Error),
            (S::Stopped, A::Start) => Ok(S::Starting),
            (S::Error, A::Start) => Ok(S::Starting),
            (S::PendingCreation | S::Running | S::Stopped | S::Error, A::Delete) => {
                Ok(S::Deleting)
            }
            (S::Deleting, A::Complete) => Ok(S::Deleted),
            (S::Deleting, A::Fail) => Ok(S::Error),
            (from, action) => Err(TransitionRejected {
                entity: "工作空间",
                from: from.as_str(),
                action: action.as_str(),
            }),
        }
    }

    pub fn can(self, action: WorkspaceAction) -> bool {
        self.next(action).is_ok()
    }
}

impl WorkspaceAction {
    pub const ALL: [WorkspaceAction; 5] = [
        WorkspaceAction::Start,
        WorkspaceAction::Complete,
        WorkspaceAction::Fail,
        WorkspaceAction::Stop,
        WorkspaceAction::Delete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkspaceAction::Start => "start",
            WorkspaceAction::Complete => "complete",
            WorkspaceAction::Fail => "fail",
            WorkspaceAction::Stop => "stop",
            WorkspaceAction::Delete => "delete",
        }
    }
}

impl fmt::Display for WorkspaceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkspaceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WorkspaceStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("无效的工作空间状态: {s}"))
    }
}
