use serde::{Deserialize, Serialize};

/// SQLite 数据库配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// 例如 `sqlite://kaas.db?mode=rwc`
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connection_timeout_seconds: u64,
    pub idle_timeout_seconds: u64,
    /// 多个 Worker 同时领取任务时等待写锁的时长
    pub busy_timeout_seconds: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://kaas.db?mode=rwc".to_string(),
            max_connections: 10,
            min_connections: 1,
            connection_timeout_seconds: 30,
            idle_timeout_seconds: 600,
            busy_timeout_seconds: 5,
        }
    }
}

impl DatabaseConfig {
    pub fn is_in_memory(&self) -> bool {
        self.url.contains(":memory:") || self.url.contains("mode=memory")
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.url.is_empty() {
            return Err(anyhow::anyhow!("数据库URL不能为空"));
        }

        if !self.url.starts_with("sqlite:") {
            return Err(anyhow::anyhow!("数据库URL必须是SQLite格式: {}", self.url));
        }

        if self.max_connections == 0 {
            return Err(anyhow::anyhow!("最大连接数必须大于0"));
        }

        if self.min_connections > self.max_connections {
            return Err(anyhow::anyhow!("最小连接数不能大于最大连接数"));
        }

        // 内存库的每个连接都是独立的数据库
        if self.is_in_memory() && self.max_connections > 1 {
            return Err(anyhow::anyhow!("内存数据库只能使用单个连接"));
        }

        if self.connection_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("连接超时时间必须大于0"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_file_backed_sqlite() {
        let config = DatabaseConfig::default();
        assert!(config.validate().is_ok());
        assert!(!config.is_in_memory());
    }

    #[test]
    fn test_in_memory_requires_single_connection() {
        let mut config = DatabaseConfig {
            url: "sqlite::memory:".to_string(),
            ..DatabaseConfig::default()
        };
        assert!(config.validate().is_err());

        config.max_connections = 1;
        config.min_connections = 1;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_connection_bounds() {
        let config = DatabaseConfig {
            min_connections: 20,
            ..DatabaseConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
