use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use kaas_core::{OrchestratorError, OrchestratorResult, ValidationError};
use serde::{Deserialize, Serialize};

use super::node::DedicatedNode;
use crate::value_objects::ResourceRequest;

/// 工作空间的资源模型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanType {
    Shared,
    Dedicated,
}

impl PlanType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanType::Shared => "shared",
            PlanType::Dedicated => "dedicated",
        }
    }
}

impl fmt::Display for PlanType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlanType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "shared" => Ok(PlanType::Shared),
            "dedicated" => Ok(PlanType::Dedicated),
            other => Err(ValidationError::InvalidPlanType(other.to_string())),
        }
    }
}

/// 共享套餐的 CPU/内存配额
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SharedQuota {
    pub cpu_limit: f64,
    pub memory_limit_gb: f64,
    pub cpu_used: f64,
    pub memory_used_gb: f64,
}

impl SharedQuota {
    /// 共享套餐默认配额
    pub const DEFAULT_CPU: f64 = 2.0;
    pub const DEFAULT_MEMORY_GB: f64 = 4.0;

    pub fn new(cpu_limit: f64, memory_limit_gb: f64) -> Result<Self, ValidationError> {
        if cpu_limit.is_nan()
            || memory_limit_gb.is_nan()
            || cpu_limit <= 0.0
            || memory_limit_gb <= 0.0
        {
            return Err(ValidationError::InvalidRequest(format!(
                "配额上限必须大于0: cpu={cpu_limit}, memory={memory_limit_gb}"
            )));
        }
        Ok(Self {
            cpu_limit,
            memory_limit_gb,
            cpu_used: 0.0,
            memory_used_gb: 0.0,
        })
    }

    pub fn default_shared() -> Self {
        Self {
            cpu_limit: Self::DEFAULT_CPU,
            memory_limit_gb: Self::DEFAULT_MEMORY_GB,
            cpu_used: 0.0,
            memory_used_gb: 0.0,
        }
    }

    pub fn available_cpu(&self) -> f64 {
        self.cpu_limit - self.cpu_used
    }

    pub fn available_memory_gb(&self) -> f64 {
        self.memory_limit_gb - self.memory_used_gb
    }

    pub fn fits(&self, requested: &ResourceRequest) -> bool {
        requested.cpu <= self.available_cpu() && requested.memory_gb <= self.available_memory_gb()
    }

    /// 应用增量，结果必须满足 `0 <= used <= limit`，否则保持原值
    pub fn apply_delta(&mut self, cpu_delta: f64, memory_delta_gb: f64) -> OrchestratorResult<()> {
        let cpu_used = self.cpu_used + cpu_delta;
        let memory_used_gb = self.memory_used_gb + memory_delta_gb;

        if cpu_used > self.cpu_limit || memory_used_gb > self.memory_limit_gb {
            return Err(OrchestratorError::QuotaExceeded(format!(
                "申请 cpu={cpu_delta}, memory={memory_delta_gb}GB 超出剩余配额 cpu={}, memory={}GB",
                self.available_cpu(),
                self.available_memory_gb()
            )));
        }
        if cpu_used < 0.0 || memory_used_gb < 0.0 {
            return Err(OrchestratorError::invalid_request(format!(
                "释放量超过已用配额: cpu={cpu_delta}, memory={memory_delta_gb}GB"
            )));
        }

        self.cpu_used = cpu_used;
        self.memory_used_gb = memory_used_gb;
        Ok(())
    }
}

/// 工作空间与资源模型的绑定关系
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceNodeAllocation {
    pub workspace_id: String,
    pub plan_type: PlanType,
    pub shared_quota: Option<SharedQuota>,
    pub dedicated_nodes: Vec<DedicatedNode>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkspaceNodeAllocation {
    pub fn shared(workspace_id: impl Into<String>, quota: SharedQuota, now: DateTime<Utc>) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            plan_type: PlanType::Shared,
            shared_quota: Some(quota),
            dedicated_nodes: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn dedicated(workspace_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            plan_type: PlanType::Dedicated,
            shared_quota: None,
            dedicated_nodes: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// 共享套餐按剩余配额判断；专属套餐只要求存在 Ready 节点
    pub fn can_allocate(&self, requested: &ResourceRequest) -> bool {
        match self.plan_type {
            PlanType::Shared => self
                .shared_quota
                .as_ref()
                .is_some_and(|quota| quota.fits(requested)),
            PlanType::Dedicated => self
                .dedicated_nodes
                .iter()
                .any(DedicatedNode::can_schedule_workload),
        }
    }

    /// 专属套餐按 Ready 节点剩余容量汇总判断
    ///
    /// `committed` 为已承诺给该工作空间负载的资源总量。
    pub fn can_allocate_by_capacity(
        &self,
        requested: &ResourceRequest,
        committed: &ResourceRequest,
    ) -> bool {
        match self.plan_type {
            PlanType::Shared => self.can_allocate(requested),
            PlanType::Dedicated => {
                let free = self.ready_capacity();
                requested.cpu <= free.cpu - committed.cpu
                    && requested.memory_gb <= free.memory_gb - committed.memory_gb
            }
        }
    }

    /// Ready 节点的 CPU/内存总量
    pub fn ready_capacity(&self) -> ResourceRequest {
        self.dedicated_nodes
            .iter()
            .filter(|node| node.can_schedule_workload())
            .fold(ResourceRequest::default(), |acc, node| ResourceRequest {
                cpu: acc.cpu + f64::from(node.specification.cpu_cores),
                memory_gb: acc.memory_gb + f64::from(node.specification.memory_gb),
            })
    }

    /// 检查资源模型与套餐类型是否一致
    pub fn validate(&self) -> Result<(), ValidationError> {
        match (self.plan_type, self.shared_quota.is_some()) {
            (PlanType::Shared, true) if self.dedicated_nodes.is_empty() => Ok(()),
            (PlanType::Dedicated, false) => Ok(()),
            _ => Err(ValidationError::InvalidRequest(format!(
                "工作空间 {} 的资源模型与套餐类型 {} 不一致",
                self.workspace_id, self.plan_type
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::NodeStatus;
    use crate::value_objects::NodeType;

    fn quota(cpu_limit: f64, memory_limit: f64, cpu_used: f64, memory_used: f64) -> SharedQuota {
        SharedQuota {
            cpu_limit,
            memory_limit_gb: memory_limit,
            cpu_used,
            memory_used_gb: memory_used,
        }
    }

    fn ready_node(id: &str, status: NodeStatus) -> DedicatedNode {
        let mut node =
            DedicatedNode::new(id, "ws-1", id, NodeType::Small.specification(), Utc::now());
        node.status = status;
        node
    }

    #[test]
    fn test_can_allocate_shared_quota() {
        let allocation =
            WorkspaceNodeAllocation::shared("ws-1", quota(4.0, 8.0, 2.0, 4.0), Utc::now());

        assert!(allocation.can_allocate(&ResourceRequest::new(1.0, 2.0).unwrap()));
        assert!(!allocation.can_allocate(&ResourceRequest::new(3.0, 2.0).unwrap()));
        assert!(allocation.can_allocate(&ResourceRequest::new(2.0, 4.0).unwrap()));
        assert!(!allocation.can_allocate(&ResourceRequest::new(1.0, 4.5).unwrap()));
    }

    #[test]
    fn test_can_allocate_shared_without_quota_is_false() {
        let mut allocation = WorkspaceNodeAllocation::dedicated("ws-1", Utc::now());
        allocation.plan_type = PlanType::Shared;
        assert!(!allocation.can_allocate(&ResourceRequest::default()));
        assert!(allocation.validate().is_err());
    }

    #[test]
    fn test_can_allocate_dedicated_requires_ready_node() {
        let mut allocation = WorkspaceNodeAllocation::dedicated("ws-1", Utc::now());
        let request = ResourceRequest::new(1.0, 1.0).unwrap();
        assert!(!allocation.can_allocate(&request));

        allocation.dedicated_nodes.push(ready_node("n1", NodeStatus::Stopped));
        assert!(!allocation.can_allocate(&request));

        allocation.dedicated_nodes.push(ready_node("n2", NodeStatus::Ready));
        assert!(allocation.can_allocate(&request));
    }

    #[test]
    fn test_capacity_check_sums_ready_nodes() {
        let mut allocation = WorkspaceNodeAllocation::dedicated("ws-1", Utc::now());
        allocation.dedicated_nodes.push(ready_node("n1", NodeStatus::Ready));
        allocation.dedicated_nodes.push(ready_node("n2", NodeStatus::Ready));
        allocation.dedicated_nodes.push(ready_node("n3", NodeStatus::Stopped));

        // 两个 S 型节点：8 核 / 32GB
        let committed = ResourceRequest::new(2.0, 8.0).unwrap();
        assert!(allocation
            .can_allocate_by_capacity(&ResourceRequest::new(6.0, 24.0).unwrap(), &committed));
        assert!(!allocation
            .can_allocate_by_capacity(&ResourceRequest::new(7.0, 1.0).unwrap(), &committed));
        // 宽松策略只看是否存在 Ready 节点
        assert!(allocation.can_allocate(&ResourceRequest::new(64.0, 256.0).unwrap()));
    }

    #[test]
    fn test_apply_delta_keeps_used_within_bounds() {
        let mut q = quota(4.0, 8.0, 2.0, 4.0);
        q.apply_delta(2.0, 4.0).unwrap();
        assert_eq!((q.cpu_used, q.memory_used_gb), (4.0, 8.0));

        let err = q.apply_delta(0.5, 0.0).unwrap_err();
        assert!(matches!(err, OrchestratorError::QuotaExceeded(_)));
        assert_eq!(q.cpu_used, 4.0);

        assert!(q.apply_delta(-5.0, 0.0).is_err());
        q.apply_delta(-4.0, -8.0).unwrap();
        assert_eq!((q.cpu_used, q.memory_used_gb), (0.0, 0.0));
    }
}
