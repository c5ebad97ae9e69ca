use std::sync::Arc;
use std::time::Duration;

use kaas_core::config::models::{AllocationPolicy, DatabaseConfig, RetryConfig};
use kaas_core::{Clock, ManualClock, OrchestratorError, ValidationError};
use kaas_domain::{
    AllocationRepository, BillingPeriod, NodeProvisionRequest, NodeRepository, NodeStatus,
    PlanType, ResourceRequest, SharedQuota, StaticPlanCatalog, TaskOperation, TaskRepository,
    TaskStatus, WorkspaceNodeAllocation, WorkspaceRepository,
};
use kaas_infrastructure::{
    DatabaseManager, InMemoryClusterGateway, InMemoryNodeGateway, InMemoryRepositories,
    SqliteAllocationRepository, SqliteNodeEventRepository, SqliteNodeRepository,
    SqliteTaskRepository, SqliteWorkspaceRepository,
};
use kaas_lifecycle::{
    CostAccountant, NodeLifecycleController, PollSettings, Reconciler, ResourceAllocator,
    WorkspaceLifecycleController,
};
use kaas_testing_utils::{fixed_now, NodeBuilder, WorkspaceBuilder};
use kaas_worker::{RetryPolicy, TaskEngine, TaskOutcome, WorkerPool};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

struct Harness {
    repos: InMemoryRepositories,
    node_gateway: Arc<InMemoryNodeGateway>,
    clock: Arc<ManualClock>,
    engine: Arc<TaskEngine>,
}

fn harness(settle_polls: u32, max_retries: u32) -> Harness {
    let repos = InMemoryRepositories::new();
    let node_gateway = Arc::new(InMemoryNodeGateway::new(settle_polls));
    let clock = Arc::new(ManualClock::new(fixed_now()));
    let allocator = Arc::new(ResourceAllocator::new(
        repos.allocations.clone(),
        repos.nodes.clone(),
        node_gateway.clone(),
        clock.clone(),
        AllocationPolicy::AnyReadyNode,
        ResourceRequest::new(0.5, 0.5).unwrap(),
    ));
    let nodes = Arc::new(NodeLifecycleController::new(
        repos.nodes.clone(),
        repos.events.clone(),
        node_gateway.clone(),
        clock.clone(),
        PollSettings::from_seconds(5, 60),
    ));
    let workspaces = Arc::new(WorkspaceLifecycleController::new(
        repos.workspaces.clone(),
        Arc::new(InMemoryClusterGateway::new(0)),
        allocator.clone(),
        Arc::new(StaticPlanCatalog::builtin()),
        clock.clone(),
        PollSettings::from_seconds(5, 300),
        "https://auth.kaas.local",
    ));
    let engine = Arc::new(TaskEngine::new(
        repos.tasks.clone(),
        nodes,
        workspaces,
        allocator,
        clock.clone(),
        RetryPolicy::new(RetryConfig::default()),
        "worker-test",
        max_retries,
    ));
    Harness {
        repos,
        node_gateway,
        clock,
        engine,
    }
}

async fn seed_shared_workspace(repos: &InMemoryRepositories) {
    repos
        .workspaces
        .create(&WorkspaceBuilder::new().build())
        .await
        .unwrap();
    repos
        .allocations
        .create(&WorkspaceNodeAllocation::shared(
            "ws-1",
            SharedQuota::new(2.0, 4.0).unwrap(),
            fixed_now(),
        ))
        .await
        .unwrap();
}

fn provision_node(name: &str) -> TaskOperation {
    TaskOperation::ProvisionNode {
        workspace_id: "ws-1".to_string(),
        request: NodeProvisionRequest::new(name, kaas_domain::NodeType::Small),
    }
}

#[tokio::test(start_paused = true)]
async fn test_provision_node_success_switches_to_dedicated() {
    let h = harness(1, 3);
    seed_shared_workspace(&h.repos).await;

    let task = h.engine.submit(provision_node("gpu-a")).await.unwrap();
    let node_id = task.target().id().to_string();

    let outcome = h
        .engine
        .process_task(&task.id, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome, TaskOutcome::Succeeded);

    let node = h.repos.nodes.get_by_id(&node_id).await.unwrap().unwrap();
    assert_eq!(node.status, NodeStatus::Ready);
    assert!(node.external_id.is_some());

    let allocation = h
        .repos
        .allocations
        .get_by_workspace("ws-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(allocation.plan_type, PlanType::Dedicated);
    assert!(h.engine.is_terminal(&task.id).await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_transient_failure_is_requeued_with_backoff_then_succeeds() {
    let h = harness(0, 3);
    seed_shared_workspace(&h.repos).await;
    h.node_gateway.faults().fail_next("create_vm", 1).await;

    let task = h.engine.submit(provision_node("node-a")).await.unwrap();
    let cancel = CancellationToken::new();

    let outcome = h.engine.process_task(&task.id, &cancel).await.unwrap();
    assert_eq!(outcome, TaskOutcome::Requeued { attempts: 1 });

    let stored = h.engine.get_task(&task.id).await.unwrap();
    assert_eq!(stored.status, TaskStatus::Pending);
    assert!(stored.scheduled_at > fixed_now());
    assert!(stored.last_error.is_some());
    // 网关失败时不写节点记录
    assert!(h
        .repos
        .nodes
        .get_by_id(task.target().id())
        .await
        .unwrap()
        .is_none());
    assert!(h
        .repos
        .tasks
        .find_ready(fixed_now(), 10)
        .await
        .unwrap()
        .is_empty());

    h.clock.advance(chrono::Duration::hours(1));
    let outcome = h.engine.process_task(&task.id, &cancel).await.unwrap();
    assert_eq!(outcome, TaskOutcome::Succeeded);
    assert_eq!(h.node_gateway.vm_count().await, 1);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_fail_task_and_record_failed_node() {
    let h = harness(0, 1);
    seed_shared_workspace(&h.repos).await;
    h.node_gateway.faults().fail_next("create_vm", 5).await;

    let task = h.engine.submit(provision_node("node-a")).await.unwrap();
    let cancel = CancellationToken::new();

    assert_eq!(
        h.engine.process_task(&task.id, &cancel).await.unwrap(),
        TaskOutcome::Requeued { attempts: 1 }
    );
    match h.engine.process_task(&task.id, &cancel).await.unwrap() {
        TaskOutcome::Failed { attempts, error } => {
            assert_eq!(attempts, 2);
            assert!(error.contains("create_vm"));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }

    let stored = h.engine.get_task(&task.id).await.unwrap();
    assert_eq!(stored.status, TaskStatus::Failed);
    let node = h
        .repos
        .nodes
        .get_by_id(task.target().id())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(node.status, NodeStatus::Failed);
    assert_eq!(h.node_gateway.vm_count().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_wait_timeout_fails_without_retry() {
    let h = harness(u32::MAX, 3);
    seed_shared_workspace(&h.repos).await;

    let task = h.engine.submit(provision_node("slow")).await.unwrap();
    let started = Instant::now();
    let outcome = h
        .engine
        .process_task(&task.id, &CancellationToken::new())
        .await
        .unwrap();

    assert!(matches!(outcome, TaskOutcome::Failed { attempts: 1, .. }));
    assert_eq!(started.elapsed(), Duration::from_secs(60));
    let node = h
        .repos
        .nodes
        .get_by_id(task.target().id())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(node.status, NodeStatus::Failed);
}

#[tokio::test(start_paused = true)]
async fn test_timed_out_node_vm_released_by_reconciler() {
    let h = harness(u32::MAX, 3);
    seed_shared_workspace(&h.repos).await;

    let task = h.engine.submit(provision_node("slow")).await.unwrap();
    let node_id = task.target().id().to_string();
    let outcome = h
        .engine
        .process_task(&task.id, &CancellationToken::new())
        .await
        .unwrap();
    assert!(matches!(outcome, TaskOutcome::Failed { attempts: 1, .. }));

    // 等待超时后虚拟机仍在，Failed 节点不接受删除任务
    let node = h.repos.nodes.get_by_id(&node_id).await.unwrap().unwrap();
    assert_eq!(node.status, NodeStatus::Failed);
    let external_id = node.external_id.clone().unwrap();
    assert_eq!(h.node_gateway.vm_count().await, 1);
    let err = h
        .engine
        .submit(TaskOperation::DeleteNode {
            node_id: node_id.clone(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::StateTransition { .. }));

    h.clock.advance(chrono::Duration::hours(2));
    let reconciler = Reconciler::new(
        h.repos.nodes.clone(),
        h.repos.events.clone(),
        h.node_gateway.clone(),
        h.clock.clone(),
        chrono::Duration::minutes(30),
    );
    let report = reconciler.run_once().await.unwrap();
    assert_eq!(report.orphan_vms_deleted, vec![external_id]);
    assert_eq!(report.failed_nodes_released, vec![node_id.clone()]);
    assert_eq!(h.node_gateway.vm_count().await, 0);

    let node = h.repos.nodes.get_by_id(&node_id).await.unwrap().unwrap();
    assert_eq!(node.deleted_at, Some(fixed_now() + chrono::Duration::hours(2)));

    // 费用截止到软删除时间
    h.clock.advance(chrono::Duration::days(3));
    let costs = CostAccountant::new(h.repos.nodes.clone(), h.clock.clone());
    let period = BillingPeriod::new(
        fixed_now() - chrono::Duration::days(1),
        fixed_now() + chrono::Duration::days(30),
    )
    .unwrap();
    let report = costs.get_node_costs("ws-1", period).await.unwrap();
    assert_eq!(report.nodes.len(), 1);
    assert!((report.nodes[0].hours - 2.0).abs() < 1e-9);
}

#[tokio::test(start_paused = true)]
async fn test_result_discarded_after_task_reclaimed_by_other_worker() {
    let h = harness(3, 3);
    seed_shared_workspace(&h.repos).await;

    let task = h.engine.submit(provision_node("slow")).await.unwrap();
    let engine = h.engine.clone();
    let task_id = task.id.clone();
    let handle = tokio::spawn(async move {
        engine
            .process_task(&task_id, &CancellationToken::new())
            .await
    });

    // 执行中的任务被判定超时回收，交给另一个 Worker
    tokio::time::sleep(Duration::from_secs(1)).await;
    let stored = h.engine.get_task(&task.id).await.unwrap();
    assert_eq!(stored.worker_id.as_deref(), Some("worker-test"));
    let cutoff = h.clock.now() + chrono::Duration::minutes(1);
    assert_eq!(h.repos.tasks.recover_stale(cutoff).await.unwrap(), 1);
    assert!(h
        .repos
        .tasks
        .claim(&task.id, "worker-b", h.clock.now())
        .await
        .unwrap());

    let outcome = handle.await.unwrap().unwrap();
    assert_eq!(outcome, TaskOutcome::Reclaimed);

    let stored = h.engine.get_task(&task.id).await.unwrap();
    assert_eq!(stored.status, TaskStatus::Running);
    assert_eq!(stored.worker_id.as_deref(), Some("worker-b"));
    assert_eq!(stored.attempts, 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_task_is_requeued_without_counting_attempt() {
    let h = harness(u32::MAX, 3);
    seed_shared_workspace(&h.repos).await;

    let task = h.engine.submit(provision_node("node-a")).await.unwrap();
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(10)).await;
        trigger.cancel();
    });

    let outcome = h.engine.process_task(&task.id, &cancel).await.unwrap();
    assert_eq!(outcome, TaskOutcome::Requeued { attempts: 0 });

    let stored = h.engine.get_task(&task.id).await.unwrap();
    assert_eq!(stored.status, TaskStatus::Pending);
    assert_eq!(stored.attempts, 0);
    assert_eq!(stored.scheduled_at, fixed_now());

    // 节点保留在 Provisioning，下次执行继续等待
    let node = h
        .repos
        .nodes
        .get_by_id(task.target().id())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(node.status, NodeStatus::Provisioning);
}

#[tokio::test]
async fn test_claimed_task_is_not_processed_twice() {
    let h = harness(0, 3);
    seed_shared_workspace(&h.repos).await;
    let task = h.engine.submit(provision_node("node-a")).await.unwrap();

    assert!(h
        .repos
        .tasks
        .claim(&task.id, "other-worker", fixed_now())
        .await
        .unwrap());
    let outcome = h
        .engine
        .process_task(&task.id, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome, TaskOutcome::NotClaimed);
    assert_eq!(h.node_gateway.create_calls().await, 0);
}

#[tokio::test]
async fn test_admission_rejects_before_creating_task() {
    let h = harness(0, 3);

    // 没有分配记录
    h.repos
        .workspaces
        .create(&WorkspaceBuilder::new().build())
        .await
        .unwrap();
    let err = h.engine.submit(provision_node("node-a")).await.unwrap_err();
    assert!(err.is_not_found());

    // 名称非法
    h.repos
        .allocations
        .create(&WorkspaceNodeAllocation::shared(
            "ws-1",
            SharedQuota::new(2.0, 4.0).unwrap(),
            fixed_now(),
        ))
        .await
        .unwrap();
    let err = h.engine.submit(provision_node("")).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Validation(_)));

    // Failed 节点不能删除
    let failed = NodeBuilder::new()
        .with_id("node-f")
        .with_status(NodeStatus::Failed)
        .build();
    h.repos.nodes.create(&failed).await.unwrap();
    let err = h
        .engine
        .submit(TaskOperation::DeleteNode {
            node_id: "node-f".to_string(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::StateTransition { .. }));

    // 2 CPU 的配额只够 4 个副本
    let err = h
        .engine
        .submit(TaskOperation::ScaleWorkspace {
            workspace_id: "ws-1".to_string(),
            replicas: 5,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::QuotaExceeded(_)));

    assert!(h.engine.tasks_for("ws-1").await.unwrap().is_empty());
    assert!(h.engine.tasks_for("node-f").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_kind_specific_entry_points_check_task_kind() {
    let h = harness(0, 3);
    seed_shared_workspace(&h.repos).await;
    let task = h.engine.submit(provision_node("node-a")).await.unwrap();
    let cancel = CancellationToken::new();

    let err = h
        .engine
        .process_deletion_task(&task.id, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::Validation(ValidationError::InvalidRequest(_))
    ));
    assert_eq!(
        h.engine.get_task(&task.id).await.unwrap().status,
        TaskStatus::Pending
    );

    let outcome = h
        .engine
        .process_provisioning_task(&task.id, &cancel)
        .await
        .unwrap();
    assert_eq!(outcome, TaskOutcome::Succeeded);
}

#[tokio::test]
async fn test_node_power_tasks_through_engine() {
    let h = harness(0, 3);
    seed_shared_workspace(&h.repos).await;
    let task = h.engine.submit(provision_node("node-a")).await.unwrap();
    let node_id = task.target().id().to_string();
    let cancel = CancellationToken::new();
    h.engine.process_task(&task.id, &cancel).await.unwrap();

    let stop = h
        .engine
        .submit(TaskOperation::StopNode {
            node_id: node_id.clone(),
        })
        .await
        .unwrap();
    assert_eq!(
        h.engine.process_task(&stop.id, &cancel).await.unwrap(),
        TaskOutcome::Succeeded
    );
    let node = h.repos.nodes.get_by_id(&node_id).await.unwrap().unwrap();
    assert_eq!(node.status, NodeStatus::Stopped);

    // 停止状态下不能重启
    let err = h
        .engine
        .submit(TaskOperation::RebootNode {
            node_id: node_id.clone(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::StateTransition { .. }));

    let delete = h
        .engine
        .submit(TaskOperation::DeleteNode {
            node_id: node_id.clone(),
        })
        .await
        .unwrap();
    assert_eq!(
        h.engine.process_deletion_task(&delete.id, &cancel).await.unwrap(),
        TaskOutcome::Succeeded
    );
    let node = h.repos.nodes.get_by_id(&node_id).await.unwrap().unwrap();
    assert_eq!(node.status, NodeStatus::Deleted);
    assert_eq!(h.node_gateway.vm_count().await, 0);
}

#[tokio::test]
async fn test_pool_poll_once_processes_ready_batch() {
    let h = harness(0, 3);
    seed_shared_workspace(&h.repos).await;
    for name in ["node-a", "node-b", "node-c"] {
        h.engine.submit(provision_node(name)).await.unwrap();
    }

    let pool = WorkerPool::builder(h.engine.clone(), h.repos.tasks.clone(), h.clock.clone())
        .concurrency(2)
        .batch_size(10)
        .build();
    let summary = pool.poll_once(&CancellationToken::new()).await.unwrap();

    assert_eq!(summary.processed, 3);
    assert_eq!(summary.succeeded, 3);
    assert_eq!(h.node_gateway.vm_count().await, 3);

    let summary = pool.poll_once(&CancellationToken::new()).await.unwrap();
    assert_eq!(summary.processed, 0);
}

#[tokio::test]
async fn test_pool_clamps_oversized_stale_timeout() {
    let h = harness(0, 3);
    let pool = WorkerPool::builder(h.engine.clone(), h.repos.tasks.clone(), h.clock.clone())
        .stale_task_timeout_seconds(u64::MAX)
        .build();
    let summary = pool.poll_once(&CancellationToken::new()).await.unwrap();
    assert_eq!(summary.recovered, 0);
    assert_eq!(summary.processed, 0);
}

#[tokio::test]
async fn test_pool_run_stops_on_cancel() {
    let h = harness(0, 3);
    let pool = WorkerPool::builder(h.engine.clone(), h.repos.tasks.clone(), h.clock.clone())
        .poll_interval_ms(10)
        .build();
    let cancel = CancellationToken::new();
    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), pool.run(cancel))
        .await
        .unwrap();
}

fn sqlite_engine(
    db: &DatabaseManager,
    worker_id: &str,
    gateway: Arc<InMemoryNodeGateway>,
) -> TaskEngine {
    let pool = db.pool().clone();
    let clock = Arc::new(ManualClock::new(fixed_now()));
    let nodes_repo = Arc::new(SqliteNodeRepository::new(pool.clone()));
    let allocator = Arc::new(ResourceAllocator::new(
        Arc::new(SqliteAllocationRepository::new(pool.clone())),
        nodes_repo.clone(),
        gateway.clone(),
        clock.clone(),
        AllocationPolicy::AnyReadyNode,
        ResourceRequest::new(0.5, 0.5).unwrap(),
    ));
    let nodes = Arc::new(NodeLifecycleController::new(
        nodes_repo,
        Arc::new(SqliteNodeEventRepository::new(pool.clone())),
        gateway,
        clock.clone(),
        PollSettings::from_seconds(1, 30),
    ));
    let workspaces = Arc::new(WorkspaceLifecycleController::new(
        Arc::new(SqliteWorkspaceRepository::new(pool.clone())),
        Arc::new(InMemoryClusterGateway::new(0)),
        allocator.clone(),
        Arc::new(StaticPlanCatalog::builtin()),
        clock.clone(),
        PollSettings::from_seconds(1, 30),
        "https://auth.kaas.local",
    ));
    TaskEngine::new(
        Arc::new(SqliteTaskRepository::new(pool)),
        nodes,
        workspaces,
        allocator,
        clock,
        RetryPolicy::new(RetryConfig::default()),
        worker_id,
        3,
    )
}

#[tokio::test]
async fn test_sqlite_two_workers_race_for_one_task() {
    let dir = tempfile::tempdir().unwrap();
    let config = DatabaseConfig {
        url: format!("sqlite://{}?mode=rwc", dir.path().join("kaas.db").display()),
        ..DatabaseConfig::default()
    };
    let db = DatabaseManager::new(&config).await.unwrap();
    db.migrate().await.unwrap();

    SqliteWorkspaceRepository::new(db.pool().clone())
        .create(&WorkspaceBuilder::new().build())
        .await
        .unwrap();
    SqliteAllocationRepository::new(db.pool().clone())
        .create(&WorkspaceNodeAllocation::shared(
            "ws-1",
            SharedQuota::new(2.0, 4.0).unwrap(),
            fixed_now(),
        ))
        .await
        .unwrap();

    let gateway = Arc::new(InMemoryNodeGateway::new(0));
    let first = sqlite_engine(&db, "worker-a", gateway.clone());
    let second = sqlite_engine(&db, "worker-b", gateway.clone());
    let task = first.submit(provision_node("node-a")).await.unwrap();

    let cancel = CancellationToken::new();
    let (a, b) = tokio::join!(
        first.process_task(&task.id, &cancel),
        second.process_task(&task.id, &cancel)
    );
    let outcomes = [a.unwrap(), b.unwrap()];

    assert_eq!(
        outcomes
            .iter()
            .filter(|o| **o == TaskOutcome::Succeeded)
            .count(),
        1
    );
    assert_eq!(
        outcomes
            .iter()
            .filter(|o| **o == TaskOutcome::NotClaimed)
            .count(),
        1
    );
    assert_eq!(gateway.vm_count().await, 1);
    db.close().await;
}
