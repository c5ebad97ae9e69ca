use kaas_core::OrchestratorResult;
use sqlx::SqlitePool;
use tracing::debug;

const STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS workspaces (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        plan_id TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'PENDING_CREATION',
        control_plane_replicas INTEGER NOT NULL DEFAULT 0,
        cluster_endpoint TEXT,
        cluster_credentials TEXT,
        oidc_users TEXT NOT NULL DEFAULT '[]',
        created_at DATETIME NOT NULL,
        updated_at DATETIME NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS workspace_allocations (
        workspace_id TEXT PRIMARY KEY,
        plan_type TEXT NOT NULL,
        cpu_limit REAL,
        memory_limit_gb REAL,
        cpu_used REAL,
        memory_used_gb REAL,
        created_at DATETIME NOT NULL,
        updated_at DATETIME NOT NULL,
        CHECK (plan_type IN ('shared', 'dedicated')),
        CHECK (cpu_used IS NULL OR (cpu_used >= 0 AND cpu_used <= cpu_limit)),
        CHECK (memory_used_gb IS NULL OR (memory_used_gb >= 0 AND memory_used_gb <= memory_limit_gb))
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS dedicated_nodes (
        id TEXT PRIMARY KEY,
        workspace_id TEXT NOT NULL,
        name TEXT NOT NULL,
        status TEXT NOT NULL,
        node_type TEXT NOT NULL,
        cpu_cores INTEGER NOT NULL,
        memory_gb INTEGER NOT NULL,
        storage_gb INTEGER NOT NULL,
        network_mbps INTEGER NOT NULL,
        external_id TEXT,
        host TEXT,
        ip_address TEXT,
        ssh_public_key TEXT,
        labels TEXT NOT NULL DEFAULT '{}',
        created_at DATETIME NOT NULL,
        updated_at DATETIME NOT NULL,
        deleted_at DATETIME
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_dedicated_nodes_workspace ON dedicated_nodes(workspace_id)",
    "CREATE INDEX IF NOT EXISTS idx_dedicated_nodes_status ON dedicated_nodes(status)",
    r#"
    CREATE TABLE IF NOT EXISTS node_events (
        id TEXT PRIMARY KEY,
        node_id TEXT NOT NULL,
        workspace_id TEXT NOT NULL,
        event_type TEXT NOT NULL,
        message TEXT NOT NULL,
        details TEXT,
        created_at DATETIME NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_node_events_node ON node_events(node_id, created_at)",
    r#"
    CREATE TABLE IF NOT EXISTS tasks (
        id TEXT PRIMARY KEY,
        kind TEXT NOT NULL,
        target_type TEXT NOT NULL,
        target_id TEXT NOT NULL,
        operation TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'PENDING',
        attempts INTEGER NOT NULL DEFAULT 0,
        max_retries INTEGER NOT NULL DEFAULT 0,
        scheduled_at DATETIME NOT NULL,
        worker_id TEXT,
        last_error TEXT,
        created_at DATETIME NOT NULL,
        started_at DATETIME,
        completed_at DATETIME
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_tasks_ready ON tasks(status, scheduled_at)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_target ON tasks(target_id)",
];

/// 运行数据库迁移
pub async fn run_migrations(pool: &SqlitePool) -> OrchestratorResult<()> {
    debug!("Running SQLite database migrations");
    for statement in STATEMENTS {
        sqlx::query(statement).execute(pool).await?;
    }
    debug!("SQLite database migrations completed");
    Ok(())
}
