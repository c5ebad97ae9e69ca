//! 值对象
//!
//! 所有值对象在构造时校验不变量，非法值无法被构造出来。

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, TimeZone, Utc};
use kaas_core::ValidationError;
use serde::{Deserialize, Serialize};

/// 套餐资源规格
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub cpu_cores: i32,
    pub memory_gb: i32,
    pub storage_gb: i32,
    pub max_pods: i32,
    pub max_services: i32,
}

impl ResourceSpec {
    pub fn new(
        cpu_cores: i32,
        memory_gb: i32,
        storage_gb: i32,
        max_pods: i32,
        max_services: i32,
    ) -> Result<Self, ValidationError> {
        let spec = Self {
            cpu_cores,
            memory_gb,
            storage_gb,
            max_pods,
            max_services,
        };
        spec.validate()?;
        Ok(spec)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        let fields = [
            ("cpu_cores", self.cpu_cores),
            ("memory_gb", self.memory_gb),
            ("storage_gb", self.storage_gb),
            ("max_pods", self.max_pods),
            ("max_services", self.max_services),
        ];
        match fields.iter().find(|(_, value)| *value <= 0) {
            Some((field, _)) => Err(ValidationError::InvalidResourceSpec { field: *field }),
            None => Ok(()),
        }
    }
}

/// 专属节点规格档位
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeType {
    #[serde(rename = "S-Type")]
    Small,
    #[serde(rename = "M-Type")]
    Medium,
    #[serde(rename = "L-Type")]
    Large,
}

impl NodeType {
    pub const ALL: [NodeType; 3] = [NodeType::Small, NodeType::Medium, NodeType::Large];

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Small => "S-Type",
            NodeType::Medium => "M-Type",
            NodeType::Large => "L-Type",
        }
    }

    /// 月租价格（美元）
    pub fn monthly_price(&self) -> f64 {
        match self {
            NodeType::Small => 99.99,
            NodeType::Medium => 199.99,
            NodeType::Large => 399.99,
        }
    }

    /// 小时费率，按每月 30 天折算
    pub fn hourly_rate(&self) -> f64 {
        self.monthly_price() / (30.0 * 24.0)
    }

    /// 虚拟机模板ID
    pub fn template_id(&self) -> u32 {
        match self {
            NodeType::Small => 9000,
            NodeType::Medium => 9001,
            NodeType::Large => 9002,
        }
    }

    pub fn specification(&self) -> NodeSpecification {
        let (cpu_cores, memory_gb, storage_gb, network_mbps) = match self {
            NodeType::Small => (4, 16, 200, 1000),
            NodeType::Medium => (8, 32, 500, 2000),
            NodeType::Large => (16, 64, 1000, 4000),
        };
        NodeSpecification {
            node_type: *self,
            cpu_cores,
            memory_gb,
            storage_gb,
            network_mbps,
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "S-Type" => Ok(NodeType::Small),
            "M-Type" => Ok(NodeType::Medium),
            "L-Type" => Ok(NodeType::Large),
            other => Err(ValidationError::InvalidNodeSpec(format!(
                "未知的节点类型: {other}"
            ))),
        }
    }
}

/// 专属节点硬件规格
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSpecification {
    pub node_type: NodeType,
    pub cpu_cores: i32,
    pub memory_gb: i32,
    pub storage_gb: i32,
    pub network_mbps: i32,
}

impl NodeSpecification {
    pub const MIN_MEMORY_GB: i32 = 4;
    pub const MIN_STORAGE_GB: i32 = 50;

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.cpu_cores <= 0 {
            return Err(ValidationError::InvalidNodeSpec(
                "CPU核数必须大于0".to_string(),
            ));
        }
        if self.memory_gb < Self::MIN_MEMORY_GB {
            return Err(ValidationError::InvalidNodeSpec(format!(
                "内存不能小于 {}GB",
                Self::MIN_MEMORY_GB
            )));
        }
        if self.storage_gb < Self::MIN_STORAGE_GB {
            return Err(ValidationError::InvalidNodeSpec(format!(
                "存储不能小于 {}GB",
                Self::MIN_STORAGE_GB
            )));
        }
        Ok(())
    }
}

/// 资源申请量
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub cpu: f64,
    pub memory_gb: f64,
}

impl ResourceRequest {
    pub fn new(cpu: f64, memory_gb: f64) -> Result<Self, ValidationError> {
        if !cpu.is_finite() || !memory_gb.is_finite() || cpu < 0.0 || memory_gb < 0.0 {
            return Err(ValidationError::InvalidRequest(format!(
                "资源申请量必须为非负数: cpu={cpu}, memory={memory_gb}"
            )));
        }
        Ok(Self { cpu, memory_gb })
    }

    pub fn scaled(&self, factor: f64) -> Self {
        Self {
            cpu: self.cpu * factor,
            memory_gb: self.memory_gb * factor,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.cpu == 0.0 && self.memory_gb == 0.0
    }
}

/// 计费周期，左闭右开区间
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingPeriod {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl BillingPeriod {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, ValidationError> {
        if end <= start {
            return Err(ValidationError::InvalidBillingPeriod(format!(
                "结束时间 {end} 必须晚于开始时间 {start}"
            )));
        }
        Ok(Self { start, end })
    }

    /// 包含 `now` 的自然月
    pub fn current_month(now: DateTime<Utc>) -> Self {
        let start = Utc
            .with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
            .single()
            .unwrap_or(now);
        let (year, month) = if now.month() == 12 {
            (now.year() + 1, 1)
        } else {
            (now.year(), now.month() + 1)
        };
        let end = Utc
            .with_ymd_and_hms(year, month, 1, 0, 0, 0)
            .single()
            .unwrap_or(now);
        Self { start, end }
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }
}
