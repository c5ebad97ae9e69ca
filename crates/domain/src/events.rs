//! 节点审计事件
//!
//! 只追加，除保留策略清理外不修改、不删除。

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeEventType {
    Provisioning,
    StatusChange,
    Error,
    Deletion,
}

impl NodeEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeEventType::Provisioning => "provisioning",
            NodeEventType::StatusChange => "status_change",
            NodeEventType::Error => "error",
            NodeEventType::Deletion => "deletion",
        }
    }
}

impl fmt::Display for NodeEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeEventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "provisioning" => Ok(NodeEventType::Provisioning),
            "status_change" => Ok(NodeEventType::StatusChange),
            "error" => Ok(NodeEventType::Error),
            "deletion" => Ok(NodeEventType::Deletion),
            _ => Err(format!("无效的节点事件类型: {s}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeEvent {
    pub id: String,
    pub node_id: String,
    pub workspace_id: String,
    pub event_type: NodeEventType,
    pub message: String,
    pub details: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl NodeEvent {
    pub fn new(
        node_id: &str,
        workspace_id: &str,
        event_type: NodeEventType,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            node_id: node_id.to_string(),
            workspace_id: workspace_id.to_string(),
            event_type,
            message: message.into(),
            details: None,
            created_at: now,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}
