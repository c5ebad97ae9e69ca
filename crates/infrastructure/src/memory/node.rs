use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kaas_core::{OrchestratorError, OrchestratorResult};
use kaas_domain::{DedicatedNode, NodeEvent, NodeEventRepository, NodeRepository, NodeStatus};
use tokio::sync::RwLock;

#[derive(Default)]
pub struct InMemoryNodeRepository {
    /// 保留插入顺序，便于按创建顺序列出
    nodes: RwLock<Vec<DedicatedNode>>,
}

impl InMemoryNodeRepository {
    pub(crate) async fn live_nodes(&self, workspace_id: &str) -> Vec<DedicatedNode> {
        self.nodes
            .read()
            .await
            .iter()
            .filter(|node| node.workspace_id == workspace_id && !node.is_deleted())
            .cloned()
            .collect()
    }
}

#[async_trait]
impl NodeRepository for InMemoryNodeRepository {
    async fn create(&self, node: &DedicatedNode) -> OrchestratorResult<()> {
        let mut nodes = self.nodes.write().await;
        if nodes.iter().any(|existing| existing.id == node.id) {
            return Err(OrchestratorError::invalid_request(format!(
                "节点已存在: {}",
                node.id
            )));
        }
        nodes.push(node.clone());
        Ok(())
    }

    async fn get_by_id(&self, id: &str) -> OrchestratorResult<Option<DedicatedNode>> {
        Ok(self.nodes.read().await.iter().find(|n| n.id == id).cloned())
    }

    async fn update(&self, node: &DedicatedNode) -> OrchestratorResult<()> {
        let mut nodes = self.nodes.write().await;
        match nodes.iter_mut().find(|existing| existing.id == node.id) {
            Some(existing) => {
                *existing = node.clone();
                Ok(())
            }
            None => Err(OrchestratorError::not_found("节点", &node.id)),
        }
    }

    async fn list_by_workspace(
        &self,
        workspace_id: &str,
        include_deleted: bool,
    ) -> OrchestratorResult<Vec<DedicatedNode>> {
        if !include_deleted {
            return Ok(self.live_nodes(workspace_id).await);
        }
        Ok(self
            .nodes
            .read()
            .await
            .iter()
            .filter(|node| node.workspace_id == workspace_id)
            .cloned()
            .collect())
    }

    async fn list_by_status(&self, status: NodeStatus) -> OrchestratorResult<Vec<DedicatedNode>> {
        Ok(self
            .nodes
            .read()
            .await
            .iter()
            .filter(|node| node.status == status)
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct InMemoryNodeEventRepository {
    events: RwLock<Vec<NodeEvent>>,
}

impl InMemoryNodeEventRepository {
    pub async fn all(&self) -> Vec<NodeEvent> {
        self.events.read().await.clone()
    }
}

#[async_trait]
impl NodeEventRepository for InMemoryNodeEventRepository {
    async fn append(&self, event: &NodeEvent) -> OrchestratorResult<()> {
        self.events.write().await.push(event.clone());
        Ok(())
    }

    async fn list_by_node(
        &self,
        node_id: &str,
        limit: usize,
    ) -> OrchestratorResult<Vec<NodeEvent>> {
        let events = self.events.read().await;
        let mut matching: Vec<(usize, &NodeEvent)> = events
            .iter()
            .enumerate()
            .filter(|(_, event)| event.node_id == node_id)
            .collect();
        // 时间相同时后写入的排在前面
        matching.sort_by(|(ia, a), (ib, b)| b.created_at.cmp(&a.created_at).then(ib.cmp(ia)));
        Ok(matching
            .into_iter()
            .take(limit)
            .map(|(_, event)| event.clone())
            .collect())
    }

    async fn prune_before(&self, cutoff: DateTime<Utc>) -> OrchestratorResult<u64> {
        let mut events = self.events.write().await;
        let before = events.len();
        events.retain(|event| event.created_at >= cutoff);
        Ok((before - events.len()) as u64)
    }
}

