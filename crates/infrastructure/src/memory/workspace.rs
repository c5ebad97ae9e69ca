use std::collections::HashMap;

use async_trait::async_trait;
use kaas_core::{OrchestratorError, OrchestratorResult};
use kaas_domain::{Workspace, WorkspaceRepository};
use tokio::sync::RwLock;

#[derive(Default)]
pub struct InMemoryWorkspaceRepository {
    workspaces: RwLock<HashMap<String, Workspace>>,
}

#[async_trait]
impl WorkspaceRepository for InMemoryWorkspaceRepository {
    async fn create(&self, workspace: &Workspace) -> OrchestratorResult<()> {
        let mut workspaces = self.workspaces.write().await;
        if workspaces.contains_key(&workspace.id) {
            return Err(OrchestratorError::invalid_request(format!(
                "工作空间已存在: {}",
                workspace.id
            )));
        }
        workspaces.insert(workspace.id.clone(), workspace.clone());
        Ok(())
    }

    async fn get_by_id(&self, id: &str) -> OrchestratorResult<Option<Workspace>> {
        Ok(self.workspaces.read().await.get(id).cloned())
    }

    async fn update(&self, workspace: &Workspace) -> OrchestratorResult<()> {
        match self.workspaces.write().await.get_mut(&workspace.id) {
            Some(existing) => {
                *existing = workspace.clone();
                Ok(())
            }
            None => Err(OrchestratorError::not_found("工作空间", &workspace.id)),
        }
    }
}
