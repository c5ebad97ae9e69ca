pub mod app_config;
pub mod database;
pub mod lifecycle;
pub mod observability;
pub mod worker;

pub use app_config::AppConfig;
pub use database::DatabaseConfig;
pub use lifecycle::{AllocationPolicy, LifecycleConfig};
pub use observability::ObservabilityConfig;
pub use worker::{RetryConfig, WorkerConfig, MAX_STALE_TASK_TIMEOUT_SECONDS};
