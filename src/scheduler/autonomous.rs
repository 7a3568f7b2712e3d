//! 自主任务调度器
//!
//! Agent 通过 schedule 持久化未来要做的事（check-in、跟进、提醒、自主任务），轮询循环定时取出到期任务，
//! 领取（pending -> running）后交给 TaskHandler 执行：
//! - 成功：completed
//! - 失败 / 超时 / 被 abort：increment_retry，未达上限回到 pending 等下次轮询，达到上限为 failed
//!
//! stop() 取消轮询循环：正在执行的任务跑完，不再领取新任务。
//! 单个任务的存储错误只记录日志；滞留在 running 的任务由 start() 时的 recover_stale 放回队列。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::core::{AgentError, StoreError};
use crate::scheduler::{ScheduleOptions, ScheduledTask, TaskStats, TaskStatus, TaskStore};

/// 到期任务的执行者；Err 为失败原因（计入重试）
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &ScheduledTask, cancel: CancellationToken) -> Result<(), String>;
}

/// 调度器参数
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    /// 每次轮询最多处理的任务数
    pub batch_size: usize,
    pub default_max_retries: u32,
    /// 终态任务保留天数
    pub retention_days: i64,
    /// 单个任务执行超时；None 不限
    pub task_timeout: Option<Duration>,
    /// 轮询循环内自动清理的间隔
    pub cleanup_every: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            default_max_retries: 3,
            retention_days: 7,
            task_timeout: None,
            cleanup_every: Duration::from_secs(3600),
        }
    }
}

struct PollLoop {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// 自主任务调度器
pub struct AutonomousScheduler {
    store: Arc<dyn TaskStore>,
    handler: Arc<dyn TaskHandler>,
    config: SchedulerConfig,
    poll_loop: Mutex<Option<PollLoop>>,
    /// 执行中任务的取消令牌
    in_flight: RwLock<HashMap<String, CancellationToken>>,
}

impl AutonomousScheduler {
    pub fn new(store: Arc<dyn TaskStore>, handler: Arc<dyn TaskHandler>) -> Self {
        Self {
            store,
            handler,
            config: SchedulerConfig::default(),
            poll_loop: Mutex::new(None),
            in_flight: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn TaskStore> {
        Arc::clone(&self.store)
    }

    /// 持久化一个 pending 任务，返回任务 ID
    pub async fn schedule(
        &self,
        agent_id: &str,
        thread_id: &str,
        options: ScheduleOptions,
    ) -> Result<String, AgentError> {
        let task = ScheduledTask::new(agent_id, thread_id, options, self.config.default_max_retries);
        self.store
            .insert(&task)
            .await
            .map_err(AgentError::Scheduler)?;
        tracing::info!(
            task_id = %task.id,
            thread_id,
            task_type = %task.task_type,
            scheduled_for = %task.scheduled_for,
            "task scheduled"
        );
        Ok(task.id)
    }

    /// 到期的 pending 任务（最早到期优先）
    pub async fn get_due_tasks(&self, limit: usize) -> Result<Vec<ScheduledTask>, AgentError> {
        self.store
            .due(Utc::now(), limit)
            .await
            .map_err(AgentError::Scheduler)
    }

    /// 更新状态；error 为 None 时保留原 last_error。流转不合法时返回 false 且状态不变
    pub async fn update_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        error: Option<&str>,
    ) -> Result<bool, AgentError> {
        self.store
            .update_status(task_id, status, error)
            .await
            .map_err(AgentError::Scheduler)
    }

    /// 重试计数 +1，返回是否还能重试
    pub async fn increment_retry(&self, task_id: &str) -> Result<bool, AgentError> {
        self.store
            .increment_retry(task_id, None)
            .await
            .map_err(AgentError::Scheduler)
    }

    /// 取消 pending 任务；其他状态返回 false
    pub async fn cancel(&self, task_id: &str) -> Result<bool, AgentError> {
        let cancelled = self
            .store
            .cancel(task_id)
            .await
            .map_err(AgentError::Scheduler)?;
        if cancelled {
            tracing::info!(task_id, "task cancelled");
        }
        Ok(cancelled)
    }

    /// 中止执行中的任务（本次执行计为一次失败）
    pub async fn abort(&self, task_id: &str) -> bool {
        match self.in_flight.read().await.get(task_id) {
            Some(token) => {
                token.cancel();
                tracing::info!(task_id, "aborting running task");
                true
            }
            None => false,
        }
    }

    /// 删除超过保留期的终态任务
    pub async fn cleanup(&self, older_than_days: i64) -> Result<usize, AgentError> {
        let cutoff = chrono::Duration::try_days(older_than_days)
            .and_then(|age| Utc::now().checked_sub_signed(age))
            .ok_or_else(|| {
                AgentError::Scheduler(StoreError::InvalidValue(format!(
                    "retention of {older_than_days} days is out of range"
                )))
            })?;
        let deleted = self
            .store
            .delete_terminal_before(cutoff)
            .await
            .map_err(AgentError::Scheduler)?;
        if deleted > 0 {
            tracing::info!(deleted, older_than_days, "cleaned up finished tasks");
        }
        Ok(deleted)
    }

    /// 把 updated_at 早于 older_than 仍为 running、且不在本进程执行中的任务计一次失败放回队列
    ///
    /// 用于进程崩溃或状态写入失败后滞留的任务；返回回到 pending 的任务数
    pub async fn recover_stale(&self, older_than: Duration) -> Result<usize, AgentError> {
        let cutoff = chrono::Duration::from_std(older_than)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
            .ok_or_else(|| {
                AgentError::Scheduler(StoreError::InvalidValue(format!(
                    "stale window of {}s is out of range",
                    older_than.as_secs()
                )))
            })?;
        let stale = self
            .store
            .stale_running(cutoff)
            .await
            .map_err(AgentError::Scheduler)?;

        let mut requeued = 0;
        for task in stale {
            if self.in_flight.read().await.contains_key(&task.id) {
                continue;
            }
            match self
                .store
                .increment_retry(&task.id, Some("interrupted while running"))
                .await
            {
                Ok(true) => {
                    requeued += 1;
                    tracing::warn!(task_id = %task.id, "requeued stale running task");
                }
                Ok(false) => tracing::warn!(task_id = %task.id, "stale running task exhausted retries"),
                Err(e) => tracing::warn!(task_id = %task.id, error = %e, "failed to recover stale task"),
            }
        }
        Ok(requeued)
    }

    pub async fn get_stats(&self) -> Result<TaskStats, AgentError> {
        self.store.stats().await.map_err(AgentError::Scheduler)
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Option<ScheduledTask>, AgentError> {
        self.store.get(task_id).await.map_err(AgentError::Scheduler)
    }

    pub async fn tasks_for_thread(&self, thread_id: &str) -> Result<Vec<ScheduledTask>, AgentError> {
        self.store
            .for_thread(thread_id)
            .await
            .map_err(AgentError::Scheduler)
    }

    /// 启动轮询循环；已在运行时返回 false
    pub async fn start(self: &Arc<Self>, poll_interval: Duration) -> bool {
        let mut slot = self.poll_loop.lock().await;
        if slot.is_some() {
            return false;
        }

        let stale_after = self.config.task_timeout.unwrap_or(poll_interval);
        if let Err(e) = self.recover_stale(stale_after).await {
            tracing::warn!(error = %e, "stale task recovery failed");
        }

        let token = CancellationToken::new();
        let scheduler = Arc::clone(self);
        let loop_token = token.clone();
        let handle = tokio::spawn(async move {
            scheduler.run_poll_loop(poll_interval, loop_token).await;
        });

        *slot = Some(PollLoop { token, handle });
        tracing::info!(interval_ms = poll_interval.as_millis() as u64, "scheduler started");
        true
    }

    /// 停止轮询循环并等待其退出
    pub async fn stop(&self) {
        let Some(PollLoop { token, handle }) = self.poll_loop.lock().await.take() else {
            return;
        };
        token.cancel();
        if let Err(e) = handle.await {
            tracing::warn!(error = %e, "scheduler loop ended abnormally");
        }
        tracing::info!("scheduler stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.poll_loop.lock().await.is_some()
    }

    async fn run_poll_loop(&self, poll_interval: Duration, token: CancellationToken) {
        let mut ticker = interval(poll_interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_cleanup = Instant::now();

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.process_due_tasks(&token).await {
                        tracing::warn!(error = %e, "processing due tasks failed");
                    }
                    if last_cleanup.elapsed() >= self.config.cleanup_every {
                        last_cleanup = Instant::now();
                        if let Err(e) = self.cleanup(self.config.retention_days).await {
                            tracing::warn!(error = %e, "task cleanup failed");
                        }
                    }
                }
            }
        }
    }

    /// 处理一批到期任务，返回实际执行的任务数；stop 被触发后不再领取新任务
    pub async fn process_due_tasks(&self, stop: &CancellationToken) -> Result<usize, AgentError> {
        let due = self.get_due_tasks(self.config.batch_size).await?;
        let mut executed = 0;
        for task in due {
            if stop.is_cancelled() {
                break;
            }
            match self.store.claim(&task.id).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!(task_id = %task.id, "task already claimed");
                    continue;
                }
                Err(e) => {
                    tracing::warn!(task_id = %task.id, error = %e, "failed to claim task");
                    continue;
                }
            }
            self.execute(task).await;
            executed += 1;
        }
        Ok(executed)
    }

    /// 执行一个已领取的任务；状态写入失败只记录日志，任务留在 running 等 recover_stale 处理
    async fn execute(&self, task: ScheduledTask) {
        let token = CancellationToken::new();
        self.in_flight
            .write()
            .await
            .insert(task.id.clone(), token.clone());

        tracing::info!(
            task_id = %task.id,
            task_type = %task.task_type,
            attempt = task.retry_count + 1,
            "executing task"
        );
        let outcome = self.run_handler(&task, token).await;
        self.in_flight.write().await.remove(&task.id);

        match outcome {
            Ok(()) => match self.update_status(&task.id, TaskStatus::Completed, None).await {
                Ok(_) => tracing::info!(task_id = %task.id, "task completed"),
                Err(e) => {
                    tracing::warn!(task_id = %task.id, error = %e, "failed to mark task completed")
                }
            },
            Err(error) => match self.store.increment_retry(&task.id, Some(&error)).await {
                Ok(true) => tracing::warn!(task_id = %task.id, %error, "task failed, will retry"),
                Ok(false) => tracing::warn!(task_id = %task.id, %error, "task failed permanently"),
                Err(e) => tracing::warn!(
                    task_id = %task.id,
                    %error,
                    store_error = %e,
                    "failed to record task failure"
                ),
            },
        }
    }

    async fn run_handler(&self, task: &ScheduledTask, token: CancellationToken) -> Result<(), String> {
        let run = async {
            tokio::select! {
                _ = token.cancelled() => Err("task aborted".to_string()),
                res = self.handler.handle(task, token.clone()) => res,
            }
        };
        match self.config.task_timeout {
            Some(limit) => match timeout(limit, run).await {
                Ok(res) => res,
                Err(_) => {
                    token.cancel();
                    Err(format!("task timed out after {}s", limit.as_secs()))
                }
            },
            None => run.await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::Duration as ChronoDuration;
    use serde_json::json;

    use crate::scheduler::{MemoryTaskStore, TaskType};

    /// 前 fail_first 次失败，之后成功
    struct CountingHandler {
        calls: AtomicUsize,
        fail_first: usize,
    }

    impl CountingHandler {
        fn new(fail_first: usize) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_first,
            }
        }
    }

    #[async_trait]
    impl TaskHandler for CountingHandler {
        async fn handle(&self, _task: &ScheduledTask, _cancel: CancellationToken) -> Result<(), String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err(format!("failure #{}", n + 1))
            } else {
                Ok(())
            }
        }
    }

    struct SleepyHandler;

    #[async_trait]
    impl TaskHandler for SleepyHandler {
        async fn handle(&self, _task: &ScheduledTask, _cancel: CancellationToken) -> Result<(), String> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        }
    }

    fn scheduler(handler: impl TaskHandler + 'static) -> Arc<AutonomousScheduler> {
        Arc::new(AutonomousScheduler::new(
            Arc::new(MemoryTaskStore::new()),
            Arc::new(handler),
        ))
    }

    fn due_now(task_type: TaskType) -> ScheduleOptions {
        ScheduleOptions::new(task_type, Utc::now() - ChronoDuration::seconds(1))
    }

    #[tokio::test]
    async fn test_check_in_scenario() {
        let s = scheduler(CountingHandler::new(0));
        let id = s
            .schedule("agent-1", "thread-1", due_now(TaskType::CheckIn))
            .await
            .unwrap();

        let due = s.get_due_tasks(10).await.unwrap();
        assert!(due.iter().any(|t| t.id == id));

        assert!(s.update_status(&id, TaskStatus::Running, None).await.unwrap());
        assert!(s.increment_retry(&id).await.unwrap());

        let task = s.get_task(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 1);
        assert_eq!(task.max_retries, 3);
    }

    #[tokio::test]
    async fn test_retry_exhaustion() {
        let s = scheduler(CountingHandler::new(0));
        let id = s
            .schedule("a", "t", due_now(TaskType::FollowUp))
            .await
            .unwrap();

        let mut results = Vec::new();
        for _ in 0..3 {
            s.update_status(&id, TaskStatus::Running, None).await.unwrap();
            results.push(s.increment_retry(&id).await.unwrap());
        }
        assert_eq!(results, vec![true, true, false]);

        let task = s.get_task(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        // 终态不会回到 pending
        assert!(!s.increment_retry(&id).await.unwrap());
        assert!(!s.update_status(&id, TaskStatus::Pending, None).await.unwrap());
        assert_eq!(s.get_task(&id).await.unwrap().unwrap().retry_count, 3);
    }

    #[tokio::test]
    async fn test_cancel_only_while_pending() {
        let s = scheduler(CountingHandler::new(0));
        let pending = s.schedule("a", "t", due_now(TaskType::Reminder)).await.unwrap();
        let running = s.schedule("a", "t", due_now(TaskType::Reminder)).await.unwrap();
        s.update_status(&running, TaskStatus::Running, None).await.unwrap();

        assert!(s.cancel(&pending).await.unwrap());
        assert!(!s.cancel(&pending).await.unwrap());
        assert!(!s.cancel(&running).await.unwrap());
        assert_eq!(
            s.get_task(&running).await.unwrap().unwrap().status,
            TaskStatus::Running
        );
    }

    #[tokio::test]
    async fn test_process_due_tasks_records_errors() {
        let s = scheduler(CountingHandler::new(1));
        let id = s
            .schedule(
                "a",
                "t",
                due_now(TaskType::Autonomous).with_payload(json!({"message": "work"})),
            )
            .await
            .unwrap();
        let stop = CancellationToken::new();

        assert_eq!(s.process_due_tasks(&stop).await.unwrap(), 1);
        let task = s.get_task(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.last_error.as_deref(), Some("failure #1"));

        assert_eq!(s.process_due_tasks(&stop).await.unwrap(), 1);
        let task = s.get_task(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.retry_count, 1);
    }

    #[tokio::test]
    async fn test_future_tasks_are_not_run() {
        let s = scheduler(CountingHandler::new(0));
        s.schedule(
            "a",
            "t",
            ScheduleOptions::new(TaskType::Reminder, Utc::now() + ChronoDuration::hours(1)),
        )
        .await
        .unwrap();
        assert_eq!(s.process_due_tasks(&CancellationToken::new()).await.unwrap(), 0);
        assert_eq!(s.get_stats().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn test_poll_loop_exhausts_retries() {
        let s = scheduler(CountingHandler::new(usize::MAX));
        let id = s
            .schedule("a", "t", due_now(TaskType::CheckIn).with_max_retries(2))
            .await
            .unwrap();

        assert!(s.start(Duration::from_millis(20)).await);
        assert!(!s.start(Duration::from_millis(20)).await);

        let mut status = TaskStatus::Pending;
        for _ in 0..100 {
            status = s.get_task(&id).await.unwrap().unwrap().status;
            if status == TaskStatus::Failed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        s.stop().await;
        assert!(!s.is_running().await);

        assert_eq!(status, TaskStatus::Failed);
        let task = s.get_task(&id).await.unwrap().unwrap();
        assert_eq!(task.retry_count, 2);
        assert_eq!(task.last_error.as_deref(), Some("failure #2"));
    }

    #[tokio::test]
    async fn test_abort_counts_as_failure() {
        let s = scheduler(SleepyHandler);
        let id = s.schedule("a", "t", due_now(TaskType::Autonomous)).await.unwrap();

        let runner = Arc::clone(&s);
        let worker = tokio::spawn(async move { runner.process_due_tasks(&CancellationToken::new()).await });

        let mut aborted = false;
        for _ in 0..100 {
            if s.abort(&id).await {
                aborted = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(aborted);
        worker.await.unwrap().unwrap();

        let task = s.get_task(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 1);
        assert_eq!(task.last_error.as_deref(), Some("task aborted"));
    }

    #[tokio::test]
    async fn test_task_timeout() {
        let s = Arc::new(
            AutonomousScheduler::new(Arc::new(MemoryTaskStore::new()), Arc::new(SleepyHandler))
                .with_config(SchedulerConfig {
                    task_timeout: Some(Duration::from_millis(50)),
                    ..Default::default()
                }),
        );
        let id = s
            .schedule("a", "t", due_now(TaskType::Autonomous).with_max_retries(1))
            .await
            .unwrap();
        s.process_due_tasks(&CancellationToken::new()).await.unwrap();

        let task = s.get_task(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.last_error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_cleanup_keeps_recent_and_pending() {
        let s = scheduler(CountingHandler::new(0));
        let done = s.schedule("a", "t", due_now(TaskType::Reminder)).await.unwrap();
        s.schedule("a", "t", due_now(TaskType::Reminder)).await.unwrap();
        s.cancel(&done).await.unwrap();

        assert_eq!(s.cleanup(7).await.unwrap(), 0);
        // 保留期为 -1 天：cutoff 在未来，刚结束的任务也会被清理
        assert_eq!(s.cleanup(-1).await.unwrap(), 1);
        assert_eq!(s.tasks_for_thread("t").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_rejects_out_of_range_retention() {
        let s = scheduler(CountingHandler::new(0));
        s.schedule("a", "t", due_now(TaskType::Reminder)).await.unwrap();

        let err = s.cleanup(i64::MAX).await.unwrap_err();
        assert!(err.to_string().contains("out of range"));
        assert_eq!(s.tasks_for_thread("t").await.unwrap().len(), 1);
    }

    /// 对指定任务的 update_status 返回错误，其余调用转发给内存存储
    struct BrokenCompletionStore {
        inner: MemoryTaskStore,
        broken_id: std::sync::Mutex<Option<String>>,
    }

    impl BrokenCompletionStore {
        fn is_broken(&self, id: &str) -> bool {
            self.broken_id.lock().unwrap().as_deref() == Some(id)
        }
    }

    #[async_trait]
    impl TaskStore for BrokenCompletionStore {
        async fn insert(&self, task: &ScheduledTask) -> Result<(), StoreError> {
            self.inner.insert(task).await
        }
        async fn get(&self, id: &str) -> Result<Option<ScheduledTask>, StoreError> {
            self.inner.get(id).await
        }
        async fn due(
            &self,
            now: chrono::DateTime<Utc>,
            limit: usize,
        ) -> Result<Vec<ScheduledTask>, StoreError> {
            self.inner.due(now, limit).await
        }
        async fn stale_running(
            &self,
            cutoff: chrono::DateTime<Utc>,
        ) -> Result<Vec<ScheduledTask>, StoreError> {
            self.inner.stale_running(cutoff).await
        }
        async fn for_thread(&self, thread_id: &str) -> Result<Vec<ScheduledTask>, StoreError> {
            self.inner.for_thread(thread_id).await
        }
        async fn update_status(
            &self,
            id: &str,
            status: TaskStatus,
            error: Option<&str>,
        ) -> Result<bool, StoreError> {
            if self.is_broken(id) {
                return Err(StoreError::InvalidValue("disk full".into()));
            }
            self.inner.update_status(id, status, error).await
        }
        async fn claim(&self, id: &str) -> Result<bool, StoreError> {
            self.inner.claim(id).await
        }
        async fn increment_retry(&self, id: &str, error: Option<&str>) -> Result<bool, StoreError> {
            self.inner.increment_retry(id, error).await
        }
        async fn cancel(&self, id: &str) -> Result<bool, StoreError> {
            self.inner.cancel(id).await
        }
        async fn delete_terminal_before(
            &self,
            cutoff: chrono::DateTime<Utc>,
        ) -> Result<usize, StoreError> {
            self.inner.delete_terminal_before(cutoff).await
        }
        async fn stats(&self) -> Result<TaskStats, StoreError> {
            self.inner.stats().await
        }
    }

    #[tokio::test]
    async fn test_store_error_on_one_task_does_not_stop_batch() {
        let store = Arc::new(BrokenCompletionStore {
            inner: MemoryTaskStore::new(),
            broken_id: std::sync::Mutex::new(None),
        });
        let s = AutonomousScheduler::new(store.clone(), Arc::new(CountingHandler::new(0)));

        let first = s
            .schedule(
                "a",
                "t",
                ScheduleOptions::new(TaskType::Reminder, Utc::now() - ChronoDuration::seconds(10)),
            )
            .await
            .unwrap();
        let second = s.schedule("a", "t", due_now(TaskType::FollowUp)).await.unwrap();
        *store.broken_id.lock().unwrap() = Some(first.clone());

        let executed = s.process_due_tasks(&CancellationToken::new()).await.unwrap();
        assert_eq!(executed, 2);
        assert_eq!(s.get_task(&first).await.unwrap().unwrap().status, TaskStatus::Running);
        assert_eq!(s.get_task(&second).await.unwrap().unwrap().status, TaskStatus::Completed);

        // 存储恢复后，滞留的 running 任务计一次失败回到队列并最终完成
        *store.broken_id.lock().unwrap() = None;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(s.recover_stale(Duration::ZERO).await.unwrap(), 1);
        let requeued = s.get_task(&first).await.unwrap().unwrap();
        assert_eq!(requeued.status, TaskStatus::Pending);
        assert_eq!(requeued.retry_count, 1);
        assert_eq!(requeued.last_error.as_deref(), Some("interrupted while running"));

        s.process_due_tasks(&CancellationToken::new()).await.unwrap();
        assert_eq!(s.get_task(&first).await.unwrap().unwrap().status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_start_requeues_tasks_left_running() {
        let store = Arc::new(MemoryTaskStore::new());
        let task = ScheduledTask::new("a", "t", due_now(TaskType::CheckIn), 3);
        store.insert(&task).await.unwrap();
        assert!(store.claim(&task.id).await.unwrap());
        tokio::time::sleep(Duration::from_millis(5)).await;

        let s = Arc::new(AutonomousScheduler::new(store, Arc::new(CountingHandler::new(0))));
        assert!(s.start(Duration::from_millis(1)).await);

        let mut status = TaskStatus::Running;
        for _ in 0..200 {
            status = s.get_task(&task.id).await.unwrap().unwrap().status;
            if status == TaskStatus::Completed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        s.stop().await;
        assert_eq!(status, TaskStatus::Completed);
        assert_eq!(s.get_task(&task.id).await.unwrap().unwrap().retry_count, 1);
    }
}
