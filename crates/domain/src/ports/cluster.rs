use async_trait::async_trait;
use kaas_core::OrchestratorResult;
use serde::{Deserialize, Serialize};

use crate::plans::{ClusterSizing, PlanLimits};

/// 租户虚拟集群所处阶段
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterPhase {
    Ready,
    /// 集群存在但尚未就绪，附带底层状态描述
    Pending(String),
    Absent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterCredentials {
    pub endpoint: String,
    pub kubeconfig: String,
}

/// 租户集群的身份联合配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OidcConfig {
    pub issuer_url: String,
    pub client_id: String,
    pub username_claim: String,
    pub groups_claim: String,
    pub users: Vec<String>,
}

impl OidcConfig {
    pub fn for_workspace(issuer_url: &str, workspace_id: &str, users: Vec<String>) -> Self {
        Self {
            issuer_url: issuer_url.to_string(),
            client_id: workspace_id.to_string(),
            username_claim: "sub".to_string(),
            groups_claim: "groups".to_string(),
            users,
        }
    }
}

/// 集群 API 网关
///
/// 以工作空间ID为键，创建与删除都应当幂等。
#[async_trait]
pub trait ClusterGateway: Send + Sync {
    async fn create_cluster(&self, workspace_id: &str, sizing: &ClusterSizing)
        -> OrchestratorResult<()>;
    async fn delete_cluster(&self, workspace_id: &str) -> OrchestratorResult<()>;
    async fn get_cluster_status(&self, workspace_id: &str) -> OrchestratorResult<ClusterPhase>;
    async fn get_cluster_credentials(&self, workspace_id: &str)
        -> OrchestratorResult<ClusterCredentials>;
    async fn scale_control_plane(&self, workspace_id: &str, replicas: u32)
        -> OrchestratorResult<()>;
    async fn apply_quota(&self, workspace_id: &str, limits: &PlanLimits) -> OrchestratorResult<()>;
    async fn configure_identity_federation(
        &self,
        workspace_id: &str,
        config: &OidcConfig,
    ) -> OrchestratorResult<()>;
}
