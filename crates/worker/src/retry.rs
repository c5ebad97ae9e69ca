//! 指数退避重试策略

use chrono::{DateTime, Duration, Utc};
use kaas_core::config::models::RetryConfig;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// 不含抖动的退避间隔（秒）：base * multiplier^(attempts-1)，不超过上限
    pub fn base_delay_seconds(&self, attempts: u32) -> f64 {
        let exponent = i32::try_from(attempts.saturating_sub(1)).unwrap_or(i32::MAX);
        let interval = self.config.base_interval_seconds as f64
            * self.config.backoff_multiplier.powi(exponent);
        interval.min(self.config.max_interval_seconds as f64)
    }

    /// `sample` 取值 [0, 1)，映射为 ±jitter_factor 的抖动
    pub fn delay_with_sample(&self, attempts: u32, sample: f64) -> Duration {
        let capped = self.base_delay_seconds(attempts);
        let jitter = capped * self.config.jitter_factor * (sample - 0.5) * 2.0;
        let seconds = (capped + jitter).max(self.config.base_interval_seconds as f64);
        Duration::milliseconds((seconds * 1000.0) as i64)
    }

    pub fn next_retry_at(&self, attempts: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        now + self.delay_with_sample(attempts, rand::random::<f64>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(RetryConfig::default())
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = policy();
        assert_eq!(policy.base_delay_seconds(1), 30.0);
        assert_eq!(policy.base_delay_seconds(2), 60.0);
        assert_eq!(policy.base_delay_seconds(3), 120.0);
        assert_eq!(policy.base_delay_seconds(20), 1800.0);
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = policy();
        let low = policy.delay_with_sample(3, 0.0);
        let mid = policy.delay_with_sample(3, 0.5);
        let high = policy.delay_with_sample(3, 0.999_999);

        assert_eq!(mid, Duration::seconds(120));
        assert!((low.num_milliseconds() - 108_000).abs() <= 1);
        assert!(high <= Duration::seconds(132));
        // 抖动后不低于基础间隔
        assert_eq!(policy.delay_with_sample(1, 0.0), Duration::seconds(30));
    }
}
