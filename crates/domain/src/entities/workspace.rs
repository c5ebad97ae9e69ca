use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state_machine::{TransitionRejected, WorkspaceAction, WorkspaceStatus};

/// 租户工作空间
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workspace {
    pub id: String,
    pub name: String,
    pub plan_id: String,
    pub status: WorkspaceStatus,
    pub control_plane_replicas: u32,
    pub cluster_endpoint: Option<String>,
    /// 集群访问凭据，对编排器不透明
    pub cluster_credentials: Option<String>,
    /// 已下发到租户集群 OIDC 配置中的用户
    pub oidc_users: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Workspace {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        plan_id: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            plan_id: plan_id.into(),
            status: WorkspaceStatus::PendingCreation,
            control_plane_replicas: 0,
            cluster_endpoint: None,
            cluster_credentials: None,
            oidc_users: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn transition_to(
        &mut self,
        action: WorkspaceAction,
        now: DateTime<Utc>,
    ) -> Result<WorkspaceStatus, TransitionRejected> {
        let next = self.status.next(action)?;
        self.status = next;
        self.updated_at = now;
        Ok(next)
    }

    pub fn is_deleted(&self) -> bool {
        self.status == WorkspaceStatus::Deleted
    }
}
