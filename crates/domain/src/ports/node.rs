use std::fmt;

use async_trait::async_trait;
use kaas_core::OrchestratorResult;
use serde::{Deserialize, Serialize};

use crate::entities::NodeProvisionRequest;
use crate::value_objects::NodeType;

pub const PLATFORM_TAG: &str = "kaas";
const NODE_TAG_PREFIX: &str = "node:";
const WORKSPACE_TAG_PREFIX: &str = "workspace:";

/// 虚拟机创建请求
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmSpec {
    /// 幂等键：同一 request_id 的重复调用返回同一台虚拟机
    pub request_id: String,
    pub name: String,
    pub template_id: u32,
    pub cpu_cores: i32,
    pub memory_gb: i32,
    pub storage_gb: i32,
    pub target_host: Option<String>,
    pub tags: Vec<String>,
    pub cloud_init_user_data: String,
}

impl VmSpec {
    pub fn for_node(
        request_id: &str,
        workspace_id: &str,
        request: &NodeProvisionRequest,
        target_host: Option<String>,
    ) -> Self {
        let spec = request.specification();
        Self {
            request_id: request_id.to_string(),
            name: format!("kaas-{}-{}", workspace_id, request.name),
            template_id: request.node_type.template_id(),
            cpu_cores: spec.cpu_cores,
            memory_gb: spec.memory_gb,
            storage_gb: spec.storage_gb,
            target_host,
            tags: vec![
                PLATFORM_TAG.to_string(),
                format!("{WORKSPACE_TAG_PREFIX}{workspace_id}"),
                format!("{NODE_TAG_PREFIX}{}", request.node_id),
            ],
            cloud_init_user_data: cloud_init(request),
        }
    }
}

fn cloud_init(request: &NodeProvisionRequest) -> String {
    let mut user_data = format!(
        "#cloud-config\nhostname: {}\npackage_update: true\n",
        request.name
    );
    if let Some(key) = &request.ssh_public_key {
        user_data.push_str(&format!("ssh_authorized_keys:\n  - {key}\n"));
    }
    user_data
}

/// 从虚拟机标签中取出节点ID
pub fn node_id_from_tags(tags: &[String]) -> Option<&str> {
    tags.iter().find_map(|tag| tag.strip_prefix(NODE_TAG_PREFIX))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmPowerState {
    Running,
    Stopped,
    Paused,
    Unknown,
}

impl fmt::Display for VmPowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VmPowerState::Running => "running",
            VmPowerState::Stopped => "stopped",
            VmPowerState::Paused => "paused",
            VmPowerState::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmInfo {
    pub external_id: String,
    pub name: String,
    pub host: String,
    pub ip_address: Option<String>,
    pub power_state: VmPowerState,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct VmResourceUsage {
    pub cpu_percent: f64,
    pub memory_used_gb: f64,
    pub memory_total_gb: f64,
    pub disk_used_gb: f64,
    pub disk_total_gb: f64,
    pub network_in_bytes: u64,
    pub network_out_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmTemplate {
    pub id: u32,
    pub name: String,
    pub node_type: Option<NodeType>,
}

/// 虚拟化平台网关
#[async_trait]
pub trait NodeGateway: Send + Sync {
    /// 创建虚拟机并返回外部ID
    async fn create_vm(&self, spec: &VmSpec) -> OrchestratorResult<String>;
    async fn get_vm(&self, external_id: &str) -> OrchestratorResult<VmInfo>;
    async fn start_vm(&self, external_id: &str) -> OrchestratorResult<()>;
    async fn stop_vm(&self, external_id: &str) -> OrchestratorResult<()>;
    async fn reboot_vm(&self, external_id: &str) -> OrchestratorResult<()>;
    async fn delete_vm(&self, external_id: &str) -> OrchestratorResult<()>;
    async fn get_vm_status(&self, external_id: &str) -> OrchestratorResult<VmPowerState>;
    async fn get_vm_resource_usage(&self, external_id: &str)
        -> OrchestratorResult<VmResourceUsage>;
    async fn list_templates(&self) -> OrchestratorResult<Vec<VmTemplate>>;
    /// 平台上所有带平台标签的虚拟机
    async fn list_vms(&self) -> OrchestratorResult<Vec<VmInfo>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vm_spec_tags_and_template() {
        let mut request = NodeProvisionRequest::new("worker-1", NodeType::Medium);
        request.ssh_public_key = Some("ssh-ed25519 AAAA test".to_string());
        let spec = VmSpec::for_node("task-1", "ws-9", &request, None);

        assert_eq!(spec.template_id, 9001);
        assert_eq!(spec.cpu_cores, 8);
        assert!(spec.tags.contains(&"workspace:ws-9".to_string()));
        assert_eq!(node_id_from_tags(&spec.tags), Some(request.node_id.as_str()));
        assert!(spec.cloud_init_user_data.contains("ssh-ed25519 AAAA test"));
    }
}
