//! Worker 轮询循环

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use kaas_core::{Clock, OrchestratorResult, WorkerConfig, MAX_STALE_TASK_TIMEOUT_SECONDS};
use kaas_domain::TaskRepository;
use metrics::gauge;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::task_engine::{TaskEngine, TaskOutcome};

/// 一轮轮询的统计
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PollSummary {
    pub recovered: u64,
    pub processed: usize,
    pub succeeded: usize,
    pub requeued: usize,
    pub failed: usize,
    pub not_claimed: usize,
    pub reclaimed: usize,
}

pub struct WorkerPoolBuilder {
    engine: Arc<TaskEngine>,
    tasks: Arc<dyn TaskRepository>,
    clock: Arc<dyn Clock>,
    concurrency: usize,
    poll_interval_ms: u64,
    batch_size: u32,
    stale_task_timeout_seconds: u64,
}

impl WorkerPoolBuilder {
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn poll_interval_ms(mut self, poll_interval_ms: u64) -> Self {
        self.poll_interval_ms = poll_interval_ms.max(1);
        self
    }

    pub fn batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn stale_task_timeout_seconds(mut self, seconds: u64) -> Self {
        self.stale_task_timeout_seconds = seconds;
        self
    }

    /// 从配置读取并发数、轮询间隔、批大小和超时
    pub fn with_config(self, config: &WorkerConfig) -> Self {
        self.concurrency(config.concurrency)
            .poll_interval_ms(config.poll_interval_ms)
            .batch_size(config.batch_size)
            .stale_task_timeout_seconds(config.stale_task_timeout_seconds)
    }

    pub fn build(self) -> WorkerPool {
        WorkerPool {
            engine: self.engine,
            tasks: self.tasks,
            clock: self.clock,
            concurrency: self.concurrency,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            batch_size: self.batch_size,
            stale_task_timeout: chrono::Duration::seconds(
                self.stale_task_timeout_seconds.min(MAX_STALE_TASK_TIMEOUT_SECONDS) as i64,
            ),
        }
    }
}

/// 拉取到期任务并按并发上限执行
pub struct WorkerPool {
    engine: Arc<TaskEngine>,
    tasks: Arc<dyn TaskRepository>,
    clock: Arc<dyn Clock>,
    concurrency: usize,
    poll_interval: Duration,
    batch_size: u32,
    stale_task_timeout: chrono::Duration,
}

impl WorkerPool {
    pub fn builder(
        engine: Arc<TaskEngine>,
        tasks: Arc<dyn TaskRepository>,
        clock: Arc<dyn Clock>,
    ) -> WorkerPoolBuilder {
        WorkerPoolBuilder {
            engine,
            tasks,
            clock,
            concurrency: 4,
            poll_interval_ms: 1000,
            batch_size: 16,
            stale_task_timeout_seconds: 3600,
        }
    }

    /// 执行一轮: 回收超时任务，再并发处理到期任务
    pub async fn poll_once(&self, cancel: &CancellationToken) -> OrchestratorResult<PollSummary> {
        let mut summary = PollSummary {
            recovered: self.engine.recover_stale_tasks(self.stale_task_timeout).await?,
            ..PollSummary::default()
        };
        if summary.recovered > 0 {
            warn!("已回收 {} 个超时任务", summary.recovered);
        }

        let ready = self
            .tasks
            .find_ready(self.clock.now(), self.batch_size)
            .await?;
        if ready.is_empty() {
            return Ok(summary);
        }
        debug!("发现 {} 个待执行任务", ready.len());

        let outcomes: Vec<_> = stream::iter(ready)
            .map(|task| {
                let engine = Arc::clone(&self.engine);
                let cancel = cancel.clone();
                async move {
                    gauge!("kaas_worker_active_tasks").increment(1.0);
                    let outcome = engine.process_task(&task.id, &cancel).await;
                    gauge!("kaas_worker_active_tasks").decrement(1.0);
                    (task.id, outcome)
                }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        for (task_id, outcome) in outcomes {
            summary.processed += 1;
            match outcome {
                Ok(TaskOutcome::Succeeded) => summary.succeeded += 1,
                Ok(TaskOutcome::Requeued { .. }) => summary.requeued += 1,
                Ok(TaskOutcome::Failed { .. }) => summary.failed += 1,
                Ok(TaskOutcome::NotClaimed) => summary.not_claimed += 1,
                Ok(TaskOutcome::Reclaimed) => summary.reclaimed += 1,
                Err(e) => error!("处理任务 {} 时出错: {}", task_id, e),
            }
        }
        Ok(summary)
    }

    /// 轮询直到取消
    ///
    /// 取消后不再领取新任务，正在执行的任务通过同一个令牌停止等待并放回队列。
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            "Worker {} 开始轮询，并发数 {}",
            self.engine.worker_id(),
            self.concurrency
        );
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once(&cancel).await {
                        error!("任务轮询失败: {}", e);
                    }
                }
                _ = cancel.cancelled() => {
                    info!("Worker {} 收到停止信号", self.engine.worker_id());
                    break;
                }
            }
        }
    }
}
