use serde::{Deserialize, Serialize};

/// 任务过期时间上限（7 天）
pub const MAX_STALE_TASK_TIMEOUT_SECONDS: u64 = 7 * 24 * 3600;

/// 任务引擎 Worker 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub enabled: bool,
    pub worker_id: String,
    /// 并发执行的任务槽位数
    pub concurrency: usize,
    pub poll_interval_ms: u64,
    /// 每轮拉取的待执行任务数量上限
    pub batch_size: u32,
    /// 外部服务错误的最大重试次数
    pub max_retries: u32,
    /// 运行中任务超过该时长未完成则视为 Worker 崩溃，重新排队
    pub stale_task_timeout_seconds: u64,
    pub retry: RetryConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            worker_id: "worker-001".to_string(),
            concurrency: 4,
            poll_interval_ms: 1000,
            batch_size: 16,
            max_retries: 3,
            stale_task_timeout_seconds: 3600,
            retry: RetryConfig::default(),
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.worker_id.is_empty() {
            return Err(anyhow::anyhow!("Worker ID不能为空"));
        }

        if self.concurrency == 0 {
            return Err(anyhow::anyhow!("并发数必须大于0"));
        }

        if self.poll_interval_ms == 0 {
            return Err(anyhow::anyhow!("任务轮询间隔必须大于0"));
        }

        if self.batch_size == 0 {
            return Err(anyhow::anyhow!("批量拉取数量必须大于0"));
        }

        if self.stale_task_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("任务过期时间必须大于0"));
        }

        if self.stale_task_timeout_seconds > MAX_STALE_TASK_TIMEOUT_SECONDS {
            return Err(anyhow::anyhow!(
                "任务过期时间不能超过 {} 秒",
                MAX_STALE_TASK_TIMEOUT_SECONDS
            ));
        }

        self.retry.validate()
    }
}

/// 重试退避配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// 基础重试间隔（秒）
    pub base_interval_seconds: u64,
    /// 最大重试间隔（秒）
    pub max_interval_seconds: u64,
    /// 退避倍数
    pub backoff_multiplier: f64,
    /// 随机抖动因子 (0.0-1.0)
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_interval_seconds: 30,
            max_interval_seconds: 1800,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.base_interval_seconds == 0 {
            return Err(anyhow::anyhow!("基础重试间隔必须大于0"));
        }

        if self.max_interval_seconds < self.base_interval_seconds {
            return Err(anyhow::anyhow!("最大重试间隔不能小于基础重试间隔"));
        }

        if self.backoff_multiplier < 1.0 {
            return Err(anyhow::anyhow!("退避倍数不能小于1.0"));
        }

        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(anyhow::anyhow!("抖动因子必须在0.0到1.0之间"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stale_task_timeout_bounds() {
        let mut config = WorkerConfig::default();
        assert!(config.validate().is_ok());

        config.stale_task_timeout_seconds = 0;
        assert!(config.validate().is_err());

        config.stale_task_timeout_seconds = MAX_STALE_TASK_TIMEOUT_SECONDS;
        assert!(config.validate().is_ok());

        config.stale_task_timeout_seconds = u64::MAX;
        assert!(config.validate().is_err());
    }
}
