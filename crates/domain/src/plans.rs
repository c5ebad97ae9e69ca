//! 套餐目录与套餐→配额映射

use std::collections::HashMap;

use kaas_core::ValidationError;
use serde::{Deserialize, Serialize};

use crate::entities::PlanType;
use crate::value_objects::ResourceSpec;

/// 可购买的套餐
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodePlan {
    pub id: String,
    pub name: String,
    /// 原始类型字符串，由 [`NodePlan::validate`] 解析
    #[serde(rename = "type")]
    pub plan_type: String,
    pub resources: ResourceSpec,
    pub price_per_month: f64,
    pub description: String,
}

impl NodePlan {
    pub fn validate(&self) -> Result<PlanType, ValidationError> {
        let plan_type = self.plan_type.parse::<PlanType>()?;
        self.resources.validate()?;
        if self.price_per_month < 0.0 || self.price_per_month.is_nan() {
            return Err(ValidationError::NegativePrice(format!(
                "{}: {}",
                self.id, self.price_per_month
            )));
        }
        Ok(plan_type)
    }

    pub fn kind(&self) -> Result<PlanType, ValidationError> {
        self.plan_type.parse()
    }
}

/// 只读套餐目录
pub trait PlanCatalog: Send + Sync {
    fn get_plan(&self, plan_id: &str) -> Option<NodePlan>;
    fn list_plans(&self) -> Vec<NodePlan>;
}

/// 内置套餐目录，加载时逐条校验
#[derive(Debug, Clone)]
pub struct StaticPlanCatalog {
    plans: Vec<NodePlan>,
}

impl StaticPlanCatalog {
    pub fn new(plans: Vec<NodePlan>) -> Result<Self, ValidationError> {
        for plan in &plans {
            plan.validate()?;
        }
        Ok(Self { plans })
    }

    pub fn builtin() -> Self {
        Self {
            plans: vec![
                builtin_plan(
                    "starter",
                    "Starter",
                    "shared",
                    (2, 4, 20, 20, 10),
                    0.0,
                    "共享基础设施，入门配额",
                ),
                builtin_plan(
                    "professional",
                    "Professional",
                    "shared",
                    (8, 16, 100, 100, 50),
                    49.99,
                    "共享基础设施，标准配额",
                ),
                builtin_plan(
                    "enterprise",
                    "Enterprise",
                    "shared",
                    (32, 64, 500, 500, 200),
                    199.99,
                    "共享基础设施，大规模配额",
                ),
                builtin_plan(
                    "s-type",
                    "S-Type Dedicated",
                    "dedicated",
                    (4, 16, 200, 100, 50),
                    99.99,
                    "4 vCPU / 16GB 专属节点",
                ),
                builtin_plan(
                    "m-type",
                    "M-Type Dedicated",
                    "dedicated",
                    (8, 32, 500, 200, 100),
                    199.99,
                    "8 vCPU / 32GB 专属节点",
                ),
                builtin_plan(
                    "l-type",
                    "L-Type Dedicated",
                    "dedicated",
                    (16, 64, 1000, 400, 200),
                    399.99,
                    "16 vCPU / 64GB 专属节点",
                ),
            ],
        }
    }
}

/// `spec` 依次为 CPU 核数、内存、存储、Pod 上限、Service 上限
fn builtin_plan(
    id: &str,
    name: &str,
    plan_type: &str,
    spec: (i32, i32, i32, i32, i32),
    price_per_month: f64,
    description: &str,
) -> NodePlan {
    NodePlan {
        id: id.to_string(),
        name: name.to_string(),
        plan_type: plan_type.to_string(),
        resources: ResourceSpec {
            cpu_cores: spec.0,
            memory_gb: spec.1,
            storage_gb: spec.2,
            max_pods: spec.3,
            max_services: spec.4,
        },
        price_per_month,
        description: description.to_string(),
    }
}

impl PlanCatalog for StaticPlanCatalog {
    fn get_plan(&self, plan_id: &str) -> Option<NodePlan> {
        self.plans.iter().find(|plan| plan.id == plan_id).cloned()
    }

    fn list_plans(&self) -> Vec<NodePlan> {
        self.plans.clone()
    }
}

/// 下发到租户集群的 ResourceQuota 上限
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanLimits {
    pub cpu: String,
    pub memory: String,
    pub storage: String,
    pub pods: u32,
    pub services: u32,
    pub persistent_volume_claims: u32,
}

impl PlanLimits {
    pub const DEFAULT_TIER: &'static str = "starter";

    /// 按套餐ID查表，未知套餐按最低档处理
    pub fn for_plan(plan_id: &str) -> Self {
        match plan_id {
            "professional" => Self::tier("8", "16Gi", "100Gi", 100, 50, 20),
            "enterprise" => Self::tier("32", "64Gi", "500Gi", 500, 200, 100),
            _ => Self::tier("2", "4Gi", "20Gi", 20, 10, 5),
        }
    }

    fn tier(cpu: &str, memory: &str, storage: &str, pods: u32, services: u32, pvcs: u32) -> Self {
        Self {
            cpu: cpu.to_string(),
            memory: memory.to_string(),
            storage: storage.to_string(),
            pods,
            services,
            persistent_volume_claims: pvcs,
        }
    }

    /// 转换为 Kubernetes ResourceQuota 的 hard 字段
    pub fn to_hard_limits(&self) -> HashMap<String, String> {
        HashMap::from([
            ("requests.cpu".to_string(), self.cpu.clone()),
            ("requests.memory".to_string(), self.memory.clone()),
            ("requests.storage".to_string(), self.storage.clone()),
            ("pods".to_string(), self.pods.to_string()),
            ("services".to_string(), self.services.to_string()),
            (
                "persistentvolumeclaims".to_string(),
                self.persistent_volume_claims.to_string(),
            ),
        ])
    }
}

/// 虚拟集群控制平面规格
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSizing {
    pub plan_id: String,
    pub syncer_cpu_limit: String,
    pub syncer_memory_limit: String,
    pub replicas: u32,
}

impl ClusterSizing {
    pub fn for_plan(plan_id: &str) -> Self {
        let (cpu, memory) = match plan_id {
            "professional" => ("1", "1Gi"),
            "enterprise" => ("2", "2Gi"),
            _ => ("500m", "512Mi"),
        };
        Self {
            plan_id: plan_id.to_string(),
            syncer_cpu_limit: cpu.to_string(),
            syncer_memory_limit: memory.to_string(),
            replicas: 1,
        }
    }
}
