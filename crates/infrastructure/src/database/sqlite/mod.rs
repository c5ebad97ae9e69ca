pub mod schema;
pub mod sqlite_allocation_repository;
pub mod sqlite_node_event_repository;
pub mod sqlite_node_repository;
pub mod sqlite_task_repository;
pub mod sqlite_workspace_repository;

pub use sqlite_allocation_repository::SqliteAllocationRepository;
pub use sqlite_node_event_repository::SqliteNodeEventRepository;
pub use sqlite_node_repository::SqliteNodeRepository;
pub use sqlite_task_repository::SqliteTaskRepository;
pub use sqlite_workspace_repository::SqliteWorkspaceRepository;

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use kaas_core::config::models::DatabaseConfig;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

pub struct DatabaseManager {
    pool: SqlitePool,
}

impl DatabaseManager {
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        // 启用外键约束和WAL模式，busy_timeout 避免并发领取任务时立即报 SQLITE_BUSY
        let connect_options = SqliteConnectOptions::from_str(&config.url)
            .with_context(|| format!("无效的数据库URL: {}", config.url))?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(config.busy_timeout_seconds));

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connection_timeout_seconds))
            .idle_timeout(Duration::from_secs(config.idle_timeout_seconds))
            .max_lifetime(Duration::from_secs(1800))
            .connect_with(connect_options)
            .await
            .context("连接SQLite数据库失败")?;

        info!("数据库连接池已建立: {}", config.url);
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        schema::run_migrations(&self.pool)
            .await
            .context("执行数据库迁移失败")
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
