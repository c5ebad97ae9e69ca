use std::collections::HashMap;

use async_trait::async_trait;
use kaas_core::{OrchestratorError, OrchestratorResult};
use kaas_domain::ports::{ClusterCredentials, ClusterGateway, ClusterPhase, OidcConfig};
use kaas_domain::{ClusterSizing, PlanLimits};
use tokio::sync::Mutex;
use tracing::debug;

use super::FaultInjector;

const PROVIDER: &str = "cluster-gateway";

#[derive(Debug, Clone, PartialEq)]
enum Lifecycle {
    Creating { remaining_polls: u32 },
    Ready,
    Deleting { remaining_polls: u32 },
}

/// 集群当前记录的配置，测试断言用
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterSnapshot {
    pub sizing: ClusterSizing,
    pub replicas: u32,
    pub quota: Option<PlanLimits>,
    pub oidc: Option<OidcConfig>,
    pub oidc_applied_count: u32,
    pub create_calls: u32,
}

struct SimulatedCluster {
    lifecycle: Lifecycle,
    snapshot: ClusterSnapshot,
}

pub struct InMemoryClusterGateway {
    clusters: Mutex<HashMap<String, SimulatedCluster>>,
    faults: FaultInjector,
    settle_polls: u32,
}

impl InMemoryClusterGateway {
    /// `settle_polls` 为集群就绪/删除前返回中间状态的轮询次数，`u32::MAX` 表示永不完成
    pub fn new(settle_polls: u32) -> Self {
        Self {
            clusters: Mutex::new(HashMap::new()),
            faults: FaultInjector::default(),
            settle_polls,
        }
    }

    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    pub async fn snapshot(&self, workspace_id: &str) -> Option<ClusterSnapshot> {
        self.clusters
            .lock()
            .await
            .get(workspace_id)
            .map(|cluster| cluster.snapshot.clone())
    }

    async fn with_cluster<T>(
        &self,
        workspace_id: &str,
        apply: impl FnOnce(&mut SimulatedCluster) -> T + Send,
    ) -> OrchestratorResult<T> {
        let mut clusters = self.clusters.lock().await;
        clusters
            .get_mut(workspace_id)
            .map(apply)
            .ok_or_else(|| OrchestratorError::not_found("虚拟集群", workspace_id))
    }
}

/// 倒计数一次，`u32::MAX` 保持不变
fn tick(remaining_polls: u32) -> u32 {
    if remaining_polls == u32::MAX {
        remaining_polls
    } else {
        remaining_polls.saturating_sub(1)
    }
}

impl Default for InMemoryClusterGateway {
    fn default() -> Self {
        Self::new(0)
    }
}

#[async_trait]
impl ClusterGateway for InMemoryClusterGateway {
    async fn create_cluster(
        &self,
        workspace_id: &str,
        sizing: &ClusterSizing,
    ) -> OrchestratorResult<()> {
        self.faults.check(PROVIDER, "create_cluster").await?;
        let mut clusters = self.clusters.lock().await;
        let settle_polls = self.settle_polls;
        let cluster = clusters
            .entry(workspace_id.to_string())
            .or_insert_with(|| SimulatedCluster {
                lifecycle: Lifecycle::Creating {
                    remaining_polls: settle_polls,
                },
                snapshot: ClusterSnapshot {
                    sizing: sizing.clone(),
                    replicas: sizing.replicas,
                    quota: None,
                    oidc: None,
                    oidc_applied_count: 0,
                    create_calls: 0,
                },
            });
        cluster.snapshot.create_calls += 1;
        debug!("虚拟集群创建请求: {}", workspace_id);
        Ok(())
    }

    async fn delete_cluster(&self, workspace_id: &str) -> OrchestratorResult<()> {
        self.faults.check(PROVIDER, "delete_cluster").await?;
        let mut clusters = self.clusters.lock().await;
        if let Some(cluster) = clusters.get_mut(workspace_id) {
            if !matches!(cluster.lifecycle, Lifecycle::Deleting { .. }) {
                cluster.lifecycle = Lifecycle::Deleting {
                    remaining_polls: self.settle_polls,
                };
            }
        }
        Ok(())
    }

    async fn get_cluster_status(&self, workspace_id: &str) -> OrchestratorResult<ClusterPhase> {
        self.faults.check(PROVIDER, "get_cluster_status").await?;
        let mut clusters = self.clusters.lock().await;
        let Some(cluster) = clusters.get_mut(workspace_id) else {
            return Ok(ClusterPhase::Absent);
        };
        let (phase, next) = match cluster.lifecycle {
            Lifecycle::Ready | Lifecycle::Creating { remaining_polls: 0 } => {
                (ClusterPhase::Ready, Some(Lifecycle::Ready))
            }
            Lifecycle::Creating { remaining_polls } => (
                ClusterPhase::Pending("Provisioning".to_string()),
                Some(Lifecycle::Creating {
                    remaining_polls: tick(remaining_polls),
                }),
            ),
            Lifecycle::Deleting { remaining_polls: 0 } => (ClusterPhase::Absent, None),
            Lifecycle::Deleting { remaining_polls } => (
                ClusterPhase::Pending("Terminating".to_string()),
                Some(Lifecycle::Deleting {
                    remaining_polls: tick(remaining_polls),
                }),
            ),
        };
        match next {
            Some(lifecycle) => cluster.lifecycle = lifecycle,
            None => {
                clusters.remove(workspace_id);
            }
        }
        Ok(phase)
    }

    async fn get_cluster_credentials(
        &self,
        workspace_id: &str,
    ) -> OrchestratorResult<ClusterCredentials> {
        self.faults.check(PROVIDER, "get_cluster_credentials").await?;
        let ready = self
            .with_cluster(workspace_id, |cluster| cluster.lifecycle == Lifecycle::Ready)
            .await?;
        if !ready {
            return Err(OrchestratorError::external(
                PROVIDER,
                format!("虚拟集群 {workspace_id} 尚未就绪"),
            ));
        }
        let endpoint = format!("https://{workspace_id}.vcluster.kaas.local");
        Ok(ClusterCredentials {
            kubeconfig: format!(
                "apiVersion: v1\nkind: Config\nclusters:\n- name: {workspace_id}\n  cluster:\n    server: {endpoint}\n"
            ),
            endpoint,
        })
    }

    async fn scale_control_plane(
        &self,
        workspace_id: &str,
        replicas: u32,
    ) -> OrchestratorResult<()> {
        self.faults.check(PROVIDER, "scale_control_plane").await?;
        self.with_cluster(workspace_id, |cluster| cluster.snapshot.replicas = replicas)
            .await
    }

    async fn apply_quota(&self, workspace_id: &str, limits: &PlanLimits) -> OrchestratorResult<()> {
        self.faults.check(PROVIDER, "apply_quota").await?;
        let limits = limits.clone();
        self.with_cluster(workspace_id, move |cluster| cluster.snapshot.quota = Some(limits))
            .await
    }

    async fn configure_identity_federation(
        &self,
        workspace_id: &str,
        config: &OidcConfig,
    ) -> OrchestratorResult<()> {
        self.faults
            .check(PROVIDER, "configure_identity_federation")
            .await?;
        let config = config.clone();
        self.with_cluster(workspace_id, move |cluster| {
            cluster.snapshot.oidc = Some(config);
            cluster.snapshot.oidc_applied_count += 1;
        })
        .await
    }
}
