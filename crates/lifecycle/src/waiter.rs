//! 可取消的轮询等待
//!
//! 基于 `tokio::time`，测试中可用暂停的运行时推进时间。

use std::future::Future;
use std::time::Duration;

use kaas_core::{OrchestratorError, OrchestratorResult};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// 轮询间隔与总超时
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub interval: Duration,
    pub timeout: Duration,
}

impl PollSettings {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    pub fn from_seconds(interval_seconds: u64, timeout_seconds: u64) -> Self {
        Self::new(
            Duration::from_secs(interval_seconds),
            Duration::from_secs(timeout_seconds),
        )
    }
}

/// 反复调用 `probe` 直到返回 `Some`
///
/// 首次探测立即执行。探测错误直接返回，不在此处重试；超过时限返回
/// `Timeout`，令牌被取消时立即返回 `Cancelled`。
pub async fn poll_until<T, F, Fut>(
    settings: PollSettings,
    cancel: &CancellationToken,
    operation: &str,
    mut probe: F,
) -> OrchestratorResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = OrchestratorResult<Option<T>>>,
{
    let deadline = Instant::now() + settings.timeout;
    let mut polls: u32 = 0;

    loop {
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled(operation)),
            outcome = probe() => outcome?,
        };
        polls += 1;

        if let Some(value) = outcome {
            debug!("{} 在第 {} 次轮询后完成", operation, polls);
            return Ok(value);
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(OrchestratorError::Timeout {
                operation: operation.to_string(),
                timeout_seconds: settings.timeout.as_secs(),
            });
        }

        let wake_at = (now + settings.interval).min(deadline);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled(operation)),
            _ = tokio::time::sleep_until(wake_at) => {}
        }
    }
}

fn cancelled(operation: &str) -> OrchestratorError {
    OrchestratorError::Cancelled(format!("{operation} 已取消"))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    fn settings() -> PollSettings {
        PollSettings::from_seconds(5, 300)
    }

    #[tokio::test(start_paused = true)]
    async fn test_returns_immediately_when_ready() {
        let started = Instant::now();
        let value = poll_until(settings(), &CancellationToken::new(), "probe", || async {
            Ok(Some(42))
        })
        .await
        .unwrap();

        assert_eq!(value, 42);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_at_deadline() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let started = Instant::now();

        let err = poll_until(settings(), &CancellationToken::new(), "等待集群", || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<Option<()>, OrchestratorError>(None)
            }
        })
        .await
        .unwrap_err();

        assert!(matches!(
            err,
            OrchestratorError::Timeout { timeout_seconds: 300, .. }
        ));
        assert_eq!(started.elapsed(), Duration::from_secs(300));
        // 0s, 5s, ..., 300s
        assert_eq!(calls.load(Ordering::SeqCst), 61);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_interrupts_sleep() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(7)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let err = poll_until(settings(), &cancel, "等待集群", || async {
            Ok::<Option<()>, OrchestratorError>(None)
        })
        .await
        .unwrap_err();

        assert!(matches!(err, OrchestratorError::Cancelled(_)));
        assert_eq!(started.elapsed(), Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_errors_are_not_retried() {
        let err = poll_until(settings(), &CancellationToken::new(), "probe", || async {
            Err::<Option<()>, _>(OrchestratorError::external("cluster-gateway", "boom"))
        })
        .await
        .unwrap_err();
        assert!(err.is_retryable());
    }
}
