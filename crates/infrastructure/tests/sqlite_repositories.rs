use std::sync::Arc;

use chrono::Duration;
use kaas_core::config::models::DatabaseConfig;
use kaas_core::OrchestratorError;
use kaas_domain::{
    AllocationRepository, NodeEvent, NodeEventRepository, NodeEventType, NodeRepository,
    NodeStatus, SharedQuota, TaskRepository, TaskStatus, WorkspaceNodeAllocation,
    WorkspaceRepository,
};
use kaas_infrastructure::{
    DatabaseManager, SqliteAllocationRepository, SqliteNodeEventRepository, SqliteNodeRepository,
    SqliteTaskRepository, SqliteWorkspaceRepository,
};
use kaas_testing_utils::{fixed_now, NodeBuilder, TaskBuilder, WorkspaceBuilder};
use tempfile::TempDir;

async fn setup() -> (TempDir, DatabaseManager) {
    let dir = tempfile::tempdir().unwrap();
    let config = DatabaseConfig {
        url: format!("sqlite://{}?mode=rwc", dir.path().join("kaas.db").display()),
        ..DatabaseConfig::default()
    };
    let manager = DatabaseManager::new(&config).await.unwrap();
    manager.migrate().await.unwrap();
    (dir, manager)
}

#[tokio::test]
async fn test_workspace_round_trip_and_update() {
    let (_dir, db) = setup().await;
    let repo = SqliteWorkspaceRepository::new(db.pool().clone());

    let mut workspace = WorkspaceBuilder::new().with_plan("professional").build();
    repo.create(&workspace).await.unwrap();

    workspace.control_plane_replicas = 2;
    workspace.oidc_users = vec!["alice".to_string()];
    repo.update(&workspace).await.unwrap();

    let loaded = repo.get_by_id("ws-1").await.unwrap().unwrap();
    assert_eq!(loaded.control_plane_replicas, 2);
    assert_eq!(loaded.oidc_users, vec!["alice".to_string()]);
    assert!(repo.get_by_id("missing").await.unwrap().is_none());
}

#[tokio::test]
async fn test_quota_delta_is_guarded() {
    let (_dir, db) = setup().await;
    let repo = SqliteAllocationRepository::new(db.pool().clone());
    let allocation =
        WorkspaceNodeAllocation::shared("ws-1", SharedQuota::new(2.0, 4.0).unwrap(), fixed_now());
    repo.create(&allocation).await.unwrap();

    let quota = repo.apply_quota_delta("ws-1", 1.5, 3.0).await.unwrap();
    assert_eq!(quota.cpu_used, 1.5);

    let err = repo.apply_quota_delta("ws-1", 1.0, 0.5).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::QuotaExceeded(_)));

    let err = repo.apply_quota_delta("ws-1", -2.0, 0.0).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Validation(_)));

    let stored = repo.get_by_workspace("ws-1").await.unwrap().unwrap();
    let quota = stored.shared_quota.unwrap();
    assert_eq!((quota.cpu_used, quota.memory_used_gb), (1.5, 3.0));

    assert!(repo.apply_quota_delta("missing", 0.1, 0.1).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_allocation_lists_only_live_nodes() {
    let (_dir, db) = setup().await;
    let allocations = SqliteAllocationRepository::new(db.pool().clone());
    let nodes = SqliteNodeRepository::new(db.pool().clone());

    allocations
        .create(&WorkspaceNodeAllocation::dedicated("ws-1", fixed_now()))
        .await
        .unwrap();
    nodes.create(&NodeBuilder::new().with_id("a").ready().build()).await.unwrap();
    nodes
        .create(&NodeBuilder::new().with_id("b").deleted_at(fixed_now()).build())
        .await
        .unwrap();

    let allocation = allocations.get_by_workspace("ws-1").await.unwrap().unwrap();
    let ids: Vec<_> = allocation.dedicated_nodes.iter().map(|n| n.id.as_str()).collect();
    assert_eq!(ids, vec!["a"]);

    assert_eq!(nodes.list_by_workspace("ws-1", true).await.unwrap().len(), 2);
    assert_eq!(nodes.list_by_status(NodeStatus::Ready).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_events_are_newest_first_and_prunable() {
    let (_dir, db) = setup().await;
    let repo = SqliteNodeEventRepository::new(db.pool().clone());
    let start = fixed_now();
    for (offset, message) in ["first", "second", "third"].iter().enumerate() {
        let event = NodeEvent::new(
            "node-1",
            "ws-1",
            NodeEventType::StatusChange,
            *message,
            start + Duration::minutes(offset as i64),
        );
        repo.append(&event).await.unwrap();
    }

    let events = repo.list_by_node("node-1", 2).await.unwrap();
    let messages: Vec<_> = events.iter().map(|e| e.message.as_str()).collect();
    assert_eq!(messages, vec!["third", "second"]);

    assert_eq!(repo.prune_before(start + Duration::minutes(1)).await.unwrap(), 1);
    assert_eq!(repo.list_by_node("node-1", 10).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_only_one_worker_claims_a_task() {
    let (_dir, db) = setup().await;
    let repo = Arc::new(SqliteTaskRepository::new(db.pool().clone()));
    let task = TaskBuilder::delete_node("node-1").build();
    repo.create(&task).await.unwrap();

    let mut handles = Vec::new();
    for worker in 0..8 {
        let repo = Arc::clone(&repo);
        let id = task.id.clone();
        handles.push(tokio::spawn(async move {
            repo.claim(&id, &format!("worker-{worker}"), fixed_now()).await.unwrap()
        }));
    }

    let mut claimed = 0;
    for handle in handles {
        if handle.await.unwrap() {
            claimed += 1;
        }
    }
    assert_eq!(claimed, 1);

    let stored = repo.get_by_id(&task.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Running);
    assert!(stored.worker_id.is_some());
}

#[tokio::test]
async fn test_task_requeue_and_stale_recovery() {
    let (_dir, db) = setup().await;
    let repo = SqliteTaskRepository::new(db.pool().clone());
    let now = fixed_now();
    let task = TaskBuilder::delete_node("node-1").scheduled_at(now).build();
    repo.create(&task).await.unwrap();

    assert!(repo.claim(&task.id, "w1", now).await.unwrap());
    repo.requeue(&task.id, "w1", 1, "boom", now + Duration::seconds(30))
        .await
        .unwrap();

    assert!(repo.find_ready(now, 10).await.unwrap().is_empty());
    let ready = repo.find_ready(now + Duration::seconds(30), 10).await.unwrap();
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].attempts, 1);
    assert_eq!(ready[0].last_error.as_deref(), Some("boom"));

    assert!(repo.claim(&task.id, "w2", now).await.unwrap());
    assert_eq!(repo.recover_stale(now - Duration::minutes(1)).await.unwrap(), 0);
    assert_eq!(repo.recover_stale(now + Duration::minutes(1)).await.unwrap(), 1);

    assert!(repo.claim(&task.id, "w3", now).await.unwrap());
    repo.mark_failed(&task.id, "w3", 2, "still broken", now)
        .await
        .unwrap();
    let failed = repo.get_by_id(&task.id).await.unwrap().unwrap();
    assert_eq!(failed.status, TaskStatus::Failed);
    assert!(failed.completed_at.is_some());

    let err = repo.mark_succeeded(&task.id, "w3", now).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_reclaimed_task_cannot_be_settled_by_previous_worker() {
    let (_dir, db) = setup().await;
    let repo = SqliteTaskRepository::new(db.pool().clone());
    let now = fixed_now();
    let task = TaskBuilder::delete_node("node-1").scheduled_at(now).build();
    repo.create(&task).await.unwrap();

    assert!(repo.claim(&task.id, "worker-a", now).await.unwrap());
    assert_eq!(repo.recover_stale(now + Duration::hours(2)).await.unwrap(), 1);
    assert!(repo.claim(&task.id, "worker-b", now + Duration::hours(2)).await.unwrap());

    // worker-a 的迟到结果全部被拒绝
    let err = repo
        .mark_failed(&task.id, "worker-a", 1, "late", now)
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    let err = repo.mark_succeeded(&task.id, "worker-a", now).await.unwrap_err();
    assert!(err.is_not_found());
    let err = repo
        .requeue(&task.id, "worker-a", 1, "late", now)
        .await
        .unwrap_err();
    assert!(err.is_not_found());

    let stored = repo.get_by_id(&task.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Running);
    assert_eq!(stored.worker_id.as_deref(), Some("worker-b"));

    repo.mark_succeeded(&task.id, "worker-b", now + Duration::hours(3))
        .await
        .unwrap();
    let stored = repo.get_by_id(&task.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Succeeded);
}
