//! 确定性的内存网关
//!
//! 遵循网关契约：按请求ID幂等创建、状态按轮询次数确定推进、可注入故障。
//! 用于本地运行和测试，真实的集群/虚拟化平台客户端不在本仓库内。

mod cluster;
mod node;

pub use cluster::{ClusterSnapshot, InMemoryClusterGateway};
pub use node::InMemoryNodeGateway;

use std::collections::HashMap;

use kaas_core::{OrchestratorError, OrchestratorResult};
use tokio::sync::Mutex;

/// 按操作名注入的一次性故障
#[derive(Default)]
pub struct FaultInjector {
    pending: Mutex<HashMap<&'static str, u32>>,
}

impl FaultInjector {
    /// 让接下来 `times` 次 `operation` 调用返回外部服务错误
    pub async fn fail_next(&self, operation: &'static str, times: u32) {
        *self.pending.lock().await.entry(operation).or_insert(0) += times;
    }

    async fn check(&self, provider: &str, operation: &'static str) -> OrchestratorResult<()> {
        let mut pending = self.pending.lock().await;
        match pending.get_mut(operation) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(OrchestratorError::external(
                    provider,
                    format!("{operation} 调用失败 (注入故障)"),
                ))
            }
            _ => Ok(()),
        }
    }
}
