use std::time::Duration;

use kaas_core::config::models::DatabaseConfig;
use kaas_core::AppConfig;
use kaas_domain::TaskOperation;
use kaas_orchestrator::{AppMode, Application, ShutdownManager};
use tempfile::TempDir;

fn config_in(dir: &TempDir) -> AppConfig {
    let mut config = AppConfig::default();
    config.database = DatabaseConfig {
        url: format!("sqlite://{}?mode=rwc", dir.path().join("kaas.db").display()),
        ..DatabaseConfig::default()
    };
    config.worker.poll_interval_ms = 20;
    config
}

#[tokio::test]
async fn test_application_wires_components_against_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let app = Application::new(config_in(&dir), AppMode::All).await.unwrap();

    let err = app
        .engine()
        .submit(TaskOperation::ProvisionWorkspace {
            workspace_id: "missing".to_string(),
        })
        .await
        .unwrap_err();
    assert!(err.is_not_found());

    let report = app.costs().current_month_costs("ws-1").await.unwrap();
    assert!(report.nodes.is_empty());

    let reconcile = app.reconciler().run_once().await.unwrap();
    assert!(reconcile.is_empty());
}

#[tokio::test]
async fn test_application_stops_on_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let app = std::sync::Arc::new(
        Application::new(config_in(&dir), AppMode::All)
            .await
            .unwrap(),
    );

    let manager = ShutdownManager::new(Duration::from_secs(5));
    let token = manager.token();
    let runner = std::sync::Arc::clone(&app);
    let handle = tokio::spawn(async move { runner.run(token).await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(manager.shutdown_and_wait(handle).await);
}
