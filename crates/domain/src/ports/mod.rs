//! 外部服务端口
//!
//! 集群 API 与虚拟化平台 API 的窄接口，实现方负责把底层错误映射为
//! `ExternalProvider`（可重试）或 `NotFound`。

pub mod cluster;
pub mod node;

pub use cluster::{ClusterCredentials, ClusterGateway, ClusterPhase, OidcConfig};
pub use node::{
    node_id_from_tags, NodeGateway, VmInfo, VmPowerState, VmResourceUsage, VmSpec, VmTemplate,
    PLATFORM_TAG,
};
