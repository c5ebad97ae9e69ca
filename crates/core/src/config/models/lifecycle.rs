use serde::{Deserialize, Serialize};

/// 专属节点套餐的容量判定策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AllocationPolicy {
    /// 只要存在一个 Ready 节点即可分配
    #[default]
    AnyReadyNode,
    /// 汇总所有 Ready 节点的剩余 CPU/内存并与请求比较
    Capacity,
}

/// 生命周期控制器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// 集群/虚拟机状态轮询间隔
    pub poll_interval_seconds: u64,
    /// 等待虚拟集群就绪或删除的超时时间
    pub wait_timeout_seconds: u64,
    /// 等待虚拟机电源状态变化的超时时间
    pub node_wait_timeout_seconds: u64,
    /// Provisioning 记录在被对账流程判定为卡住前的宽限期
    pub provisioning_grace_seconds: u64,
    pub reconcile_interval_seconds: u64,
    pub oidc_issuer_url: String,
    pub allocation_policy: AllocationPolicy,
    /// 每个控制平面副本占用的共享配额
    pub control_plane_replica_cpu: f64,
    pub control_plane_replica_memory_gb: f64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: 5,
            wait_timeout_seconds: 300,
            node_wait_timeout_seconds: 600,
            provisioning_grace_seconds: 1800,
            reconcile_interval_seconds: 300,
            oidc_issuer_url: "https://auth.kaas.local".to_string(),
            allocation_policy: AllocationPolicy::AnyReadyNode,
            control_plane_replica_cpu: 0.5,
            control_plane_replica_memory_gb: 0.5,
        }
    }
}

impl LifecycleConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.poll_interval_seconds == 0 {
            return Err(anyhow::anyhow!("状态轮询间隔必须大于0"));
        }

        if self.wait_timeout_seconds < self.poll_interval_seconds {
            return Err(anyhow::anyhow!("等待超时时间不能小于轮询间隔"));
        }

        if self.node_wait_timeout_seconds < self.poll_interval_seconds {
            return Err(anyhow::anyhow!("节点等待超时时间不能小于轮询间隔"));
        }

        if self.reconcile_interval_seconds == 0 {
            return Err(anyhow::anyhow!("对账间隔必须大于0"));
        }

        if !self.oidc_issuer_url.starts_with("https://") {
            return Err(anyhow::anyhow!("OIDC issuer URL必须使用https"));
        }

        if self.control_plane_replica_cpu < 0.0 || self.control_plane_replica_memory_gb < 0.0 {
            return Err(anyhow::anyhow!("控制平面副本资源占用不能为负数"));
        }

        Ok(())
    }
}
