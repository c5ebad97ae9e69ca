use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kaas_core::{OrchestratorError, OrchestratorResult};
use kaas_domain::{Task, TaskRepository, TaskStatus};
use tokio::sync::Mutex;

#[derive(Default)]
pub struct InMemoryTaskRepository {
    tasks: Mutex<HashMap<String, Task>>,
}

impl InMemoryTaskRepository {
    /// 只修改仍由 `worker_id` 运行的任务
    async fn with_running<F>(&self, id: &str, worker_id: &str, apply: F) -> OrchestratorResult<()>
    where
        F: FnOnce(&mut Task) + Send,
    {
        let mut tasks = self.tasks.lock().await;
        match tasks.get_mut(id) {
            Some(task)
                if task.status == TaskStatus::Running
                    && task.worker_id.as_deref() == Some(worker_id) =>
            {
                apply(task);
                Ok(())
            }
            _ => Err(OrchestratorError::not_found("运行中的任务", id)),
        }
    }
}

#[async_trait]
impl TaskRepository for InMemoryTaskRepository {
    async fn create(&self, task: &Task) -> OrchestratorResult<()> {
        let mut tasks = self.tasks.lock().await;
        if tasks.contains_key(&task.id) {
            return Err(OrchestratorError::invalid_request(format!(
                "任务已存在: {}",
                task.id
            )));
        }
        tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn get_by_id(&self, id: &str) -> OrchestratorResult<Option<Task>> {
        Ok(self.tasks.lock().await.get(id).cloned())
    }

    async fn list_by_target(&self, target_id: &str) -> OrchestratorResult<Vec<Task>> {
        let mut tasks: Vec<Task> = self
            .tasks
            .lock()
            .await
            .values()
            .filter(|task| task.target().id() == target_id)
            .cloned()
            .collect();
        tasks.sort_by_key(|task| task.created_at);
        Ok(tasks)
    }

    async fn find_ready(&self, now: DateTime<Utc>, limit: u32) -> OrchestratorResult<Vec<Task>> {
        let mut ready: Vec<Task> = self
            .tasks
            .lock()
            .await
            .values()
            .filter(|task| task.status == TaskStatus::Pending && task.scheduled_at <= now)
            .cloned()
            .collect();
        ready.sort_by_key(|task| (task.scheduled_at, task.created_at));
        ready.truncate(limit as usize);
        Ok(ready)
    }

    async fn claim(
        &self,
        id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> OrchestratorResult<bool> {
        let mut tasks = self.tasks.lock().await;
        match tasks.get_mut(id) {
            Some(task) if task.status == TaskStatus::Pending => {
                task.status = TaskStatus::Running;
                task.worker_id = Some(worker_id.to_string());
                task.started_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_succeeded(
        &self,
        id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> OrchestratorResult<()> {
        self.with_running(id, worker_id, |task| {
            task.status = TaskStatus::Succeeded;
            task.completed_at = Some(now);
            task.last_error = None;
        })
        .await
    }

    async fn requeue(
        &self,
        id: &str,
        worker_id: &str,
        attempts: u32,
        last_error: &str,
        scheduled_at: DateTime<Utc>,
    ) -> OrchestratorResult<()> {
        let last_error = last_error.to_string();
        self.with_running(id, worker_id, move |task| {
            task.status = TaskStatus::Pending;
            task.attempts = attempts;
            task.last_error = Some(last_error);
            task.scheduled_at = scheduled_at;
            task.worker_id = None;
            task.started_at = None;
        })
        .await
    }

    async fn mark_failed(
        &self,
        id: &str,
        worker_id: &str,
        attempts: u32,
        last_error: &str,
        now: DateTime<Utc>,
    ) -> OrchestratorResult<()> {
        let last_error = last_error.to_string();
        self.with_running(id, worker_id, move |task| {
            task.status = TaskStatus::Failed;
            task.attempts = attempts;
            task.last_error = Some(last_error);
            task.completed_at = Some(now);
        })
        .await
    }

    async fn recover_stale(&self, started_before: DateTime<Utc>) -> OrchestratorResult<u64> {
        let mut recovered = 0;
        for task in self.tasks.lock().await.values_mut() {
            let stale = task.status == TaskStatus::Running
                && task.started_at.is_some_and(|started| started < started_before);
            if stale {
                task.status = TaskStatus::Pending;
                task.worker_id = None;
                task.started_at = None;
                recovered += 1;
            }
        }
        Ok(recovered)
    }
}
