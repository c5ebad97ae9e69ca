use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 优雅关闭管理器
///
/// 所有组件共享同一个取消令牌，触发关闭后正在等待外部状态的任务会立即放弃等待并放回队列。
#[derive(Clone)]
pub struct ShutdownManager {
    token: CancellationToken,
    is_shutdown: Arc<AtomicBool>,
    timeout: Duration,
}

impl ShutdownManager {
    pub fn new(timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            is_shutdown: Arc::new(AtomicBool::new(false)),
            timeout,
        }
    }

    /// 订阅关闭信号
    pub fn token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// 触发关闭，重复调用无副作用
    pub fn shutdown(&self) {
        if self.is_shutdown.swap(true, Ordering::SeqCst) {
            debug!("关闭管理器已经触发过关闭");
            return;
        }
        info!("触发系统关闭");
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown.load(Ordering::SeqCst)
    }

    /// 触发关闭并在超时内等待应用任务退出，返回是否按时退出
    pub async fn shutdown_and_wait<T>(&self, handle: JoinHandle<T>) -> bool {
        self.shutdown();
        match timeout(self.timeout, handle).await {
            Ok(Ok(_)) => {
                info!("应用已优雅关闭");
                true
            }
            Ok(Err(e)) => {
                error!("应用关闭时发生错误: {e}");
                false
            }
            Err(_) => {
                warn!("应用关闭超时（{:?}），强制退出", self.timeout);
                false
            }
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_cancels_all_subscribers() {
        let manager = ShutdownManager::default();
        let first = manager.token();
        let second = manager.token();
        assert!(!manager.is_shutdown());

        manager.shutdown();

        assert!(first.is_cancelled());
        assert!(second.is_cancelled());
        assert!(manager.is_shutdown());
    }

    #[tokio::test]
    async fn test_subscribe_after_shutdown_is_cancelled() {
        let manager = ShutdownManager::default();
        manager.shutdown();
        assert!(manager.token().is_cancelled());
    }

    #[tokio::test]
    async fn test_double_shutdown() {
        let manager = ShutdownManager::default();
        let clone = manager.clone();
        manager.shutdown();
        clone.shutdown();
        assert!(clone.is_shutdown());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_returns_when_component_stops() {
        let manager = ShutdownManager::new(Duration::from_secs(30));
        let token = manager.token();
        let handle = tokio::spawn(async move { token.cancelled().await });

        assert!(manager.shutdown_and_wait(handle).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out_on_stuck_component() {
        let manager = ShutdownManager::new(Duration::from_secs(30));
        let handle = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });

        let started = tokio::time::Instant::now();
        assert!(!manager.shutdown_and_wait(handle).await);
        assert_eq!(started.elapsed(), Duration::from_secs(30));
    }
}
