use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use kaas_core::{AppConfig, Clock, SystemClock};
use kaas_domain::{PlanCatalog, ResourceRequest, StaticPlanCatalog};
use kaas_infrastructure::{
    DatabaseManager, InMemoryClusterGateway, InMemoryNodeGateway, SqliteAllocationRepository,
    SqliteNodeEventRepository, SqliteNodeRepository, SqliteTaskRepository,
    SqliteWorkspaceRepository,
};
use kaas_lifecycle::{
    CostAccountant, NodeLifecycleController, PollSettings, Reconciler, ResourceAllocator,
    WorkspaceLifecycleController,
};
use kaas_worker::{RetryPolicy, TaskEngine, WorkerPool};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// 应用运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppMode {
    /// 仅运行任务 Worker
    Worker,
    /// 仅运行对账流程
    Reconciler,
    /// 运行所有组件
    All,
}

impl AppMode {
    pub fn parse(mode: &str, config: &AppConfig) -> Result<Self> {
        match mode {
            "worker" => {
                if !config.worker.enabled {
                    return Err(anyhow::anyhow!("Worker模式被禁用，请检查配置"));
                }
                Ok(AppMode::Worker)
            }
            "reconciler" => Ok(AppMode::Reconciler),
            "all" => Ok(AppMode::All),
            _ => Err(anyhow::anyhow!("不支持的运行模式: {mode}")),
        }
    }

    fn runs_worker(self) -> bool {
        matches!(self, AppMode::Worker | AppMode::All)
    }

    fn runs_reconciler(self) -> bool {
        matches!(self, AppMode::Reconciler | AppMode::All)
    }
}

/// 主应用程序，持有装配好的各个组件
pub struct Application {
    config: AppConfig,
    mode: AppMode,
    database: DatabaseManager,
    engine: Arc<TaskEngine>,
    pool: Arc<WorkerPool>,
    reconciler: Arc<Reconciler>,
    costs: Arc<CostAccountant>,
}

impl Application {
    /// 建立数据库连接并装配仓储、网关、控制器和任务引擎
    pub async fn new(config: AppConfig, mode: AppMode) -> Result<Self> {
        info!("初始化应用程序，模式: {:?}", mode);

        let database = DatabaseManager::new(&config.database).await?;
        database.migrate().await?;
        let db_pool = database.pool().clone();

        let workspaces = Arc::new(SqliteWorkspaceRepository::new(db_pool.clone()));
        let allocations = Arc::new(SqliteAllocationRepository::new(db_pool.clone()));
        let nodes = Arc::new(SqliteNodeRepository::new(db_pool.clone()));
        let events = Arc::new(SqliteNodeEventRepository::new(db_pool.clone()));
        let tasks = Arc::new(SqliteTaskRepository::new(db_pool));

        // 真实的集群/虚拟化平台客户端不在本仓库内，这里使用确定性的内存网关
        let cluster_gateway = Arc::new(InMemoryClusterGateway::new(1));
        let node_gateway = Arc::new(InMemoryNodeGateway::new(1));
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let catalog: Arc<dyn PlanCatalog> = Arc::new(StaticPlanCatalog::builtin());

        let lifecycle = &config.lifecycle;
        let replica_footprint = ResourceRequest::new(
            lifecycle.control_plane_replica_cpu,
            lifecycle.control_plane_replica_memory_gb,
        )
        .context("控制平面副本资源占用无效")?;

        let allocator = Arc::new(ResourceAllocator::new(
            allocations,
            nodes.clone(),
            node_gateway.clone(),
            Arc::clone(&clock),
            lifecycle.allocation_policy,
            replica_footprint,
        ));
        let node_controller = Arc::new(NodeLifecycleController::new(
            nodes.clone(),
            events.clone(),
            node_gateway.clone(),
            Arc::clone(&clock),
            PollSettings::from_seconds(
                lifecycle.poll_interval_seconds,
                lifecycle.node_wait_timeout_seconds,
            ),
        ));
        let workspace_controller = Arc::new(WorkspaceLifecycleController::new(
            workspaces,
            cluster_gateway,
            Arc::clone(&allocator),
            catalog,
            Arc::clone(&clock),
            PollSettings::from_seconds(
                lifecycle.poll_interval_seconds,
                lifecycle.wait_timeout_seconds,
            ),
            lifecycle.oidc_issuer_url.clone(),
        ));

        let engine = Arc::new(TaskEngine::new(
            tasks.clone(),
            node_controller,
            workspace_controller,
            allocator,
            Arc::clone(&clock),
            RetryPolicy::new(config.worker.retry.clone()),
            config.worker.worker_id.clone(),
            config.worker.max_retries,
        ));
        let pool = Arc::new(
            WorkerPool::builder(Arc::clone(&engine), tasks, Arc::clone(&clock))
                .with_config(&config.worker)
                .build(),
        );
        let reconciler = Arc::new(Reconciler::new(
            nodes.clone(),
            events,
            node_gateway,
            Arc::clone(&clock),
            chrono::Duration::seconds(
                i64::try_from(lifecycle.provisioning_grace_seconds)
                    .context("Provisioning 宽限期过大")?,
            ),
        ));
        let costs = Arc::new(CostAccountant::new(nodes, clock));

        Ok(Self {
            config,
            mode,
            database,
            engine,
            pool,
            reconciler,
            costs,
        })
    }

    pub fn engine(&self) -> Arc<TaskEngine> {
        Arc::clone(&self.engine)
    }

    pub fn costs(&self) -> Arc<CostAccountant> {
        Arc::clone(&self.costs)
    }

    pub fn reconciler(&self) -> Arc<Reconciler> {
        Arc::clone(&self.reconciler)
    }

    /// 运行所选组件直到取消，返回前关闭数据库连接池
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        info!("启动应用程序，模式: {:?}", self.mode);
        self.database.health_check().await.context("数据库健康检查失败")?;

        let mut components = JoinSet::new();

        if self.mode.runs_worker() {
            info!("启动Worker: {}", self.config.worker.worker_id);
            let pool = Arc::clone(&self.pool);
            let cancel = cancel.clone();
            components.spawn(async move { pool.run(cancel).await });
        }

        if self.mode.runs_reconciler() {
            let interval = Duration::from_secs(self.config.lifecycle.reconcile_interval_seconds);
            let reconciler = Arc::clone(&self.reconciler);
            let cancel = cancel.clone();
            components.spawn(async move { reconciler.run(interval, cancel).await });
        }

        while let Some(result) = components.join_next().await {
            if let Err(e) = result {
                error!("组件异常退出: {e}");
                cancel.cancel();
            }
        }

        self.database.close().await;
        info!("应用程序已停止");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_modes() {
        let mut config = AppConfig::default();
        assert_eq!(AppMode::parse("all", &config).unwrap(), AppMode::All);
        assert_eq!(
            AppMode::parse("reconciler", &config).unwrap(),
            AppMode::Reconciler
        );
        assert!(AppMode::parse("dispatcher", &config).is_err());

        config.worker.enabled = false;
        assert!(AppMode::parse("worker", &config).is_err());
    }

    #[test]
    fn test_mode_components() {
        assert!(AppMode::All.runs_worker() && AppMode::All.runs_reconciler());
        assert!(!AppMode::Worker.runs_reconciler());
        assert!(!AppMode::Reconciler.runs_worker());
    }
}
