use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

use super::{
    database::DatabaseConfig, lifecycle::LifecycleConfig, observability::ObservabilityConfig,
    worker::WorkerConfig,
};

/// System configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// Load configuration from config file and environment variables
    ///
    /// Load order:
    /// 1. Default configuration
    /// 2. Config file (TOML format)
    /// 3. Environment variable overrides (prefix: KAAS_)
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let defaults = ConfigBuilder::try_from(&Self::default()).context("构建默认配置失败")?;
        let mut builder = ConfigBuilder::builder().add_source(defaults);

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                info!("加载配置文件: {}", path);
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            } else {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
        } else {
            let default_paths = ["config/kaas.toml", "kaas.toml", "/etc/kaas/config.toml"];
            match default_paths.iter().find(|p| Path::new(p).exists()) {
                Some(path) => {
                    info!("加载配置文件: {}", path);
                    builder = builder.add_source(File::new(path, FileFormat::Toml));
                }
                None => debug!("未找到配置文件，使用默认配置"),
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("KAAS")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;

        Ok(config)
    }

    /// Load configuration from TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;

        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML string
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }

    pub fn validate(&self) -> Result<()> {
        self.database.validate().context("数据库配置验证失败")?;
        self.worker.validate().context("Worker配置验证失败")?;
        self.lifecycle.validate().context("生命周期配置验证失败")?;
        self.observability
            .validate()
            .context("可观测性配置验证失败")?;

        // 执行中的任务在等待期间不能被当作崩溃回收
        let longest_wait = self
            .lifecycle
            .wait_timeout_seconds
            .max(self.lifecycle.node_wait_timeout_seconds);
        if self.worker.stale_task_timeout_seconds <= longest_wait {
            return Err(anyhow::anyhow!(
                "任务过期时间 ({} 秒) 必须大于最长等待时间 ({} 秒)",
                self.worker.stale_task_timeout_seconds,
                longest_wait
            ));
        }
        Ok(())
    }
}
