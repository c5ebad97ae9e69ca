use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use kaas_core::{OrchestratorError, OrchestratorResult};
use kaas_domain::ports::{
    NodeGateway, VmInfo, VmPowerState, VmResourceUsage, VmSpec, VmTemplate,
};
use kaas_domain::NodeType;
use tokio::sync::Mutex;
use tracing::debug;

use super::FaultInjector;

const PROVIDER: &str = "node-gateway";
const DEFAULT_HOST: &str = "pve-node1";

struct SimulatedVm {
    info: VmInfo,
    memory_gb: f64,
    storage_gb: f64,
    /// 目标电源状态及剩余轮询次数
    pending: Option<(VmPowerState, u32)>,
    reboots: u32,
}

#[derive(Default)]
struct State {
    vms: BTreeMap<String, SimulatedVm>,
    by_request: HashMap<String, String>,
    next_id: u32,
    create_calls: u32,
}

pub struct InMemoryNodeGateway {
    state: Mutex<State>,
    faults: FaultInjector,
    settle_polls: u32,
}

impl InMemoryNodeGateway {
    /// `settle_polls` 为电源状态生效前返回旧状态的轮询次数
    pub fn new(settle_polls: u32) -> Self {
        Self {
            state: Mutex::new(State::default()),
            faults: FaultInjector::default(),
            settle_polls,
        }
    }

    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    /// 直接放入一台虚拟机，模拟平台上已有的资源
    pub async fn insert_vm(&self, info: VmInfo) {
        let mut state = self.state.lock().await;
        state.vms.insert(
            info.external_id.clone(),
            SimulatedVm {
                info,
                memory_gb: 16.0,
                storage_gb: 200.0,
                pending: None,
                reboots: 0,
            },
        );
    }

    pub async fn vm_count(&self) -> usize {
        self.state.lock().await.vms.len()
    }

    pub async fn create_calls(&self) -> u32 {
        self.state.lock().await.create_calls
    }

    pub async fn reboots(&self, external_id: &str) -> u32 {
        self.state
            .lock()
            .await
            .vms
            .get(external_id)
            .map_or(0, |vm| vm.reboots)
    }

    async fn with_vm<T>(
        &self,
        external_id: &str,
        apply: impl FnOnce(&mut SimulatedVm) -> T + Send,
    ) -> OrchestratorResult<T> {
        let mut state = self.state.lock().await;
        state
            .vms
            .get_mut(external_id)
            .map(apply)
            .ok_or_else(|| OrchestratorError::not_found("虚拟机", external_id))
    }

    async fn schedule_power(
        &self,
        external_id: &str,
        target: VmPowerState,
    ) -> OrchestratorResult<()> {
        let settle_polls = self.settle_polls;
        self.with_vm(external_id, move |vm| {
            vm.pending = Some((target, settle_polls));
        })
        .await
    }
}

impl Default for InMemoryNodeGateway {
    fn default() -> Self {
        Self::new(0)
    }
}

#[async_trait]
impl NodeGateway for InMemoryNodeGateway {
    async fn create_vm(&self, spec: &VmSpec) -> OrchestratorResult<String> {
        self.faults.check(PROVIDER, "create_vm").await?;
        let mut state = self.state.lock().await;
        state.create_calls += 1;

        if let Some(existing) = state.by_request.get(&spec.request_id) {
            if state.vms.contains_key(existing) {
                debug!("请求 {} 已创建虚拟机 {}，直接返回", spec.request_id, existing);
                return Ok(existing.clone());
            }
        }

        state.next_id += 1;
        let seq = state.next_id;
        let external_id = format!("vm-{}", 100 + seq);
        let vm = SimulatedVm {
            info: VmInfo {
                external_id: external_id.clone(),
                name: spec.name.clone(),
                host: spec
                    .target_host
                    .clone()
                    .unwrap_or_else(|| DEFAULT_HOST.to_string()),
                ip_address: Some(format!("10.0.{}.{}", seq / 250, seq % 250 + 2)),
                power_state: VmPowerState::Stopped,
                tags: spec.tags.clone(),
            },
            memory_gb: f64::from(spec.memory_gb),
            storage_gb: f64::from(spec.storage_gb),
            pending: Some((VmPowerState::Running, self.settle_polls)),
            reboots: 0,
        };
        state.vms.insert(external_id.clone(), vm);
        state
            .by_request
            .insert(spec.request_id.clone(), external_id.clone());
        Ok(external_id)
    }

    async fn get_vm(&self, external_id: &str) -> OrchestratorResult<VmInfo> {
        self.faults.check(PROVIDER, "get_vm").await?;
        self.with_vm(external_id, |vm| vm.info.clone()).await
    }

    async fn start_vm(&self, external_id: &str) -> OrchestratorResult<()> {
        self.faults.check(PROVIDER, "start_vm").await?;
        self.schedule_power(external_id, VmPowerState::Running).await
    }

    async fn stop_vm(&self, external_id: &str) -> OrchestratorResult<()> {
        self.faults.check(PROVIDER, "stop_vm").await?;
        self.schedule_power(external_id, VmPowerState::Stopped).await
    }

    async fn reboot_vm(&self, external_id: &str) -> OrchestratorResult<()> {
        self.faults.check(PROVIDER, "reboot_vm").await?;
        self.with_vm(external_id, |vm| vm.reboots += 1).await
    }

    async fn delete_vm(&self, external_id: &str) -> OrchestratorResult<()> {
        self.faults.check(PROVIDER, "delete_vm").await?;
        let mut state = self.state.lock().await;
        state.vms.remove(external_id);
        state.by_request.retain(|_, vm_id| vm_id != external_id);
        Ok(())
    }

    async fn get_vm_status(&self, external_id: &str) -> OrchestratorResult<VmPowerState> {
        self.faults.check(PROVIDER, "get_vm_status").await?;
        self.with_vm(external_id, |vm| {
            match vm.pending {
                Some((target, 0)) => {
                    vm.info.power_state = target;
                    vm.pending = None;
                }
                Some((target, remaining)) => vm.pending = Some((target, remaining - 1)),
                None => {}
            }
            vm.info.power_state
        })
        .await
    }

    async fn get_vm_resource_usage(
        &self,
        external_id: &str,
    ) -> OrchestratorResult<VmResourceUsage> {
        self.faults.check(PROVIDER, "get_vm_resource_usage").await?;
        self.with_vm(external_id, |vm| {
            let running = vm.info.power_state == VmPowerState::Running;
            let load = if running { 0.25 } else { 0.0 };
            VmResourceUsage {
                cpu_percent: load * 100.0,
                memory_used_gb: vm.memory_gb * load,
                memory_total_gb: vm.memory_gb,
                disk_used_gb: vm.storage_gb * 0.1,
                disk_total_gb: vm.storage_gb,
                network_in_bytes: if running { 1_048_576 } else { 0 },
                network_out_bytes: if running { 524_288 } else { 0 },
            }
        })
        .await
    }

    async fn list_templates(&self) -> OrchestratorResult<Vec<VmTemplate>> {
        self.faults.check(PROVIDER, "list_templates").await?;
        Ok(NodeType::ALL
            .iter()
            .map(|node_type| VmTemplate {
                id: node_type.template_id(),
                name: format!("kaas-{}-template", node_type.as_str().to_lowercase()),
                node_type: Some(*node_type),
            })
            .collect())
    }

    async fn list_vms(&self) -> OrchestratorResult<Vec<VmInfo>> {
        self.faults.check(PROVIDER, "list_vms").await?;
        Ok(self
            .state
            .lock()
            .await
            .vms
            .values()
            .map(|vm| vm.info.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kaas_domain::NodeProvisionRequest;

    #[tokio::test]
    async fn test_create_vm_is_idempotent_per_request_id() {
        let gateway = InMemoryNodeGateway::new(1);
        let request = NodeProvisionRequest::new("n1", NodeType::Small);
        let spec = VmSpec::for_node("task-1", "ws-1", &request, None);

        let first = gateway.create_vm(&spec).await.unwrap();
        let second = gateway.create_vm(&spec).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(gateway.vm_count().await, 1);

        let other = VmSpec::for_node("task-2", "ws-1", &request, None);
        assert_ne!(gateway.create_vm(&other).await.unwrap(), first);
    }

    #[tokio::test]
    async fn test_power_state_settles_deterministically() {
        let gateway = InMemoryNodeGateway::new(2);
        let request = NodeProvisionRequest::new("n1", NodeType::Small);
        let id = gateway
            .create_vm(&VmSpec::for_node("r", "ws-1", &request, None))
            .await
            .unwrap();

        assert_eq!(gateway.get_vm_status(&id).await.unwrap(), VmPowerState::Stopped);
        assert_eq!(gateway.get_vm_status(&id).await.unwrap(), VmPowerState::Stopped);
        assert_eq!(gateway.get_vm_status(&id).await.unwrap(), VmPowerState::Running);
        assert_eq!(gateway.get_vm(&id).await.unwrap().host, "pve-node1");
    }

    #[tokio::test]
    async fn test_injected_faults_are_consumed() {
        let gateway = InMemoryNodeGateway::default();
        gateway.faults().fail_next("list_templates", 1).await;

        let err = gateway.list_templates().await.unwrap_err();
        assert!(err.is_retryable());
        let templates = gateway.list_templates().await.unwrap();
        assert_eq!(templates.iter().map(|t| t.id).collect::<Vec<_>>(), vec![9000, 9001, 9002]);
    }

    #[tokio::test]
    async fn test_missing_vm_is_not_found() {
        let gateway = InMemoryNodeGateway::default();
        assert!(gateway.get_vm_status("vm-404").await.unwrap_err().is_not_found());
        assert!(gateway.delete_vm("vm-404").await.is_ok());
    }
}
