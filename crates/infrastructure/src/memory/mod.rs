//! 内存仓储实现
//!
//! 语义与 SQLite 实现一致：条件更新在同一把锁内完成，用于测试和单机运行。

mod allocation;
mod node;
mod task;
mod workspace;

pub use allocation::InMemoryAllocationRepository;
pub use node::{InMemoryNodeEventRepository, InMemoryNodeRepository};
pub use task::InMemoryTaskRepository;
pub use workspace::InMemoryWorkspaceRepository;

use std::sync::Arc;

/// 一组共享状态的内存仓储
#[derive(Clone)]
pub struct InMemoryRepositories {
    pub workspaces: Arc<InMemoryWorkspaceRepository>,
    pub allocations: Arc<InMemoryAllocationRepository>,
    pub nodes: Arc<InMemoryNodeRepository>,
    pub events: Arc<InMemoryNodeEventRepository>,
    pub tasks: Arc<InMemoryTaskRepository>,
}

impl InMemoryRepositories {
    pub fn new() -> Self {
        let nodes = Arc::new(InMemoryNodeRepository::default());
        Self {
            workspaces: Arc::new(InMemoryWorkspaceRepository::default()),
            allocations: Arc::new(InMemoryAllocationRepository::new(Arc::clone(&nodes))),
            nodes,
            events: Arc::new(InMemoryNodeEventRepository::default()),
            tasks: Arc::new(InMemoryTaskRepository::default()),
        }
    }
}

impl Default for InMemoryRepositories {
    fn default() -> Self {
        Self::new()
    }
}
