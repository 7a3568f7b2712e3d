//! 定时任务存储
//!
//! TaskStore 抽象任务表；所有状态变更都是带前置状态条件的单条更新，多个轮询者并发时不会重复领取任务，
//! 也不会把已取消 / 已结束的任务拉回 pending。
//! - MemoryTaskStore：进程内（测试与无数据库部署）
//! - SqliteTaskStore：scheduled_tasks 表，时间以毫秒时间戳保存

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, OptionalExtension, Row};
use tokio::sync::RwLock;

use crate::core::{SqliteHandle, StoreError};
use crate::scheduler::{ScheduledTask, TaskStats, TaskStatus};

/// 任务表接口
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn insert(&self, task: &ScheduledTask) -> Result<(), StoreError>;

    async fn get(&self, id: &str) -> Result<Option<ScheduledTask>, StoreError>;

    /// 到期的 pending 任务，最早到期优先
    async fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ScheduledTask>, StoreError>;

    /// updated_at 早于 cutoff 仍处于 running 的任务（执行者已退出）
    async fn stale_running(&self, cutoff: DateTime<Utc>) -> Result<Vec<ScheduledTask>, StoreError>;

    /// 某线程的全部任务，scheduled_for 倒序
    async fn for_thread(&self, thread_id: &str) -> Result<Vec<ScheduledTask>, StoreError>;

    /// 按合法流转更新状态；error 为 None 时保留原 last_error。流转不合法返回 false
    async fn update_status(
        &self,
        id: &str,
        status: TaskStatus,
        error: Option<&str>,
    ) -> Result<bool, StoreError>;

    /// pending -> running；已被其他轮询者领取时返回 false
    async fn claim(&self, id: &str) -> Result<bool, StoreError>;

    /// 原子地 retry_count += 1：达到 max_retries 置 failed 并返回 false，否则回到 pending 并返回 true
    async fn increment_retry(&self, id: &str, error: Option<&str>) -> Result<bool, StoreError>;

    /// 仅 pending 可取消
    async fn cancel(&self, id: &str) -> Result<bool, StoreError>;

    /// 删除 updated_at 早于 cutoff 的终态任务，返回删除数
    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;

    async fn stats(&self) -> Result<TaskStats, StoreError>;
}

// ---------------------------------------------------------------------------
// 内存实现
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryTaskStore {
    tasks: RwLock<HashMap<String, ScheduledTask>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn insert(&self, task: &ScheduledTask) -> Result<(), StoreError> {
        self.tasks
            .write()
            .await
            .insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<ScheduledTask>, StoreError> {
        Ok(self.tasks.read().await.get(id).cloned())
    }

    async fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ScheduledTask>, StoreError> {
        let tasks = self.tasks.read().await;
        let mut due: Vec<ScheduledTask> = tasks.values().filter(|t| t.is_due(now)).cloned().collect();
        due.sort_by_key(|t| t.scheduled_for);
        due.truncate(limit);
        Ok(due)
    }

    async fn stale_running(&self, cutoff: DateTime<Utc>) -> Result<Vec<ScheduledTask>, StoreError> {
        let tasks = self.tasks.read().await;
        Ok(tasks
            .values()
            .filter(|t| t.status == TaskStatus::Running && t.updated_at < cutoff)
            .cloned()
            .collect())
    }

    async fn for_thread(&self, thread_id: &str) -> Result<Vec<ScheduledTask>, StoreError> {
        let tasks = self.tasks.read().await;
        let mut list: Vec<ScheduledTask> = tasks
            .values()
            .filter(|t| t.thread_id == thread_id)
            .cloned()
            .collect();
        list.sort_by(|a, b| b.scheduled_for.cmp(&a.scheduled_for));
        Ok(list)
    }

    async fn update_status(
        &self,
        id: &str,
        status: TaskStatus,
        error: Option<&str>,
    ) -> Result<bool, StoreError> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| StoreError::TaskNotFound(id.to_string()))?;
        if !task.status.can_transition_to(status) {
            return Ok(false);
        }
        task.status = status;
        task.updated_at = Utc::now();
        if let Some(error) = error {
            task.last_error = Some(error.to_string());
        }
        Ok(true)
    }

    async fn claim(&self, id: &str) -> Result<bool, StoreError> {
        let mut tasks = self.tasks.write().await;
        match tasks.get_mut(id) {
            Some(task) if task.status == TaskStatus::Pending => {
                task.status = TaskStatus::Running;
                task.updated_at = Utc::now();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(StoreError::TaskNotFound(id.to_string())),
        }
    }

    async fn increment_retry(&self, id: &str, error: Option<&str>) -> Result<bool, StoreError> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| StoreError::TaskNotFound(id.to_string()))?;
        if !matches!(task.status, TaskStatus::Pending | TaskStatus::Running) {
            return Ok(false);
        }
        task.retry_count += 1;
        task.status = if task.retry_count >= task.max_retries {
            TaskStatus::Failed
        } else {
            TaskStatus::Pending
        };
        task.updated_at = Utc::now();
        if let Some(error) = error {
            task.last_error = Some(error.to_string());
        }
        Ok(task.status == TaskStatus::Pending)
    }

    async fn cancel(&self, id: &str) -> Result<bool, StoreError> {
        let mut tasks = self.tasks.write().await;
        match tasks.get_mut(id) {
            Some(task) if task.status == TaskStatus::Pending => {
                task.status = TaskStatus::Cancelled;
                task.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut tasks = self.tasks.write().await;
        let before = tasks.len();
        tasks.retain(|_, t| !(t.status.is_terminal() && t.updated_at < cutoff));
        Ok(before - tasks.len())
    }

    async fn stats(&self) -> Result<TaskStats, StoreError> {
        let mut stats = TaskStats::default();
        for task in self.tasks.read().await.values() {
            stats.add(task.status, 1);
        }
        Ok(stats)
    }
}

// ---------------------------------------------------------------------------
// SQLite 实现
// ---------------------------------------------------------------------------

const TASK_COLUMNS: &str = "id, agent_id, thread_id, task_type, scheduled_for, status, payload, \
                            retry_count, max_retries, created_at, updated_at, last_error";

pub struct SqliteTaskStore {
    db: SqliteHandle,
}

impl SqliteTaskStore {
    pub async fn new(db: SqliteHandle) -> Result<Self, StoreError> {
        db.call(|conn| {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS scheduled_tasks (
                    id TEXT PRIMARY KEY,
                    agent_id TEXT NOT NULL,
                    thread_id TEXT NOT NULL,
                    task_type TEXT NOT NULL,
                    scheduled_for INTEGER NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    payload TEXT NOT NULL DEFAULT '{}',
                    retry_count INTEGER NOT NULL DEFAULT 0,
                    max_retries INTEGER NOT NULL DEFAULT 3,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL,
                    last_error TEXT
                );
                CREATE INDEX IF NOT EXISTS idx_scheduled_tasks_scheduled_for ON scheduled_tasks(scheduled_for);
                CREATE INDEX IF NOT EXISTS idx_scheduled_tasks_status ON scheduled_tasks(status);
                CREATE INDEX IF NOT EXISTS idx_scheduled_tasks_thread_id ON scheduled_tasks(thread_id);",
            )?;
            Ok(())
        })
        .await?;
        Ok(Self { db })
    }
}

/// 'a','b' 形式的状态列表（取值来自枚举常量）
fn status_list(statuses: &[TaskStatus]) -> String {
    statuses
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(",")
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| StoreError::InvalidValue(format!("timestamp {ms}")))
}

struct TaskRow {
    id: String,
    agent_id: String,
    thread_id: String,
    task_type: String,
    scheduled_for: i64,
    status: String,
    payload: String,
    retry_count: u32,
    max_retries: u32,
    created_at: i64,
    updated_at: i64,
    last_error: Option<String>,
}

impl TaskRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            agent_id: row.get(1)?,
            thread_id: row.get(2)?,
            task_type: row.get(3)?,
            scheduled_for: row.get(4)?,
            status: row.get(5)?,
            payload: row.get(6)?,
            retry_count: row.get(7)?,
            max_retries: row.get(8)?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
            last_error: row.get(11)?,
        })
    }

    fn into_task(self) -> Result<ScheduledTask, StoreError> {
        Ok(ScheduledTask {
            task_type: self.task_type.parse().map_err(StoreError::InvalidValue)?,
            status: self.status.parse().map_err(StoreError::InvalidValue)?,
            payload: serde_json::from_str(&self.payload)?,
            scheduled_for: from_millis(self.scheduled_for)?,
            created_at: from_millis(self.created_at)?,
            updated_at: from_millis(self.updated_at)?,
            id: self.id,
            agent_id: self.agent_id,
            thread_id: self.thread_id,
            retry_count: self.retry_count,
            max_retries: self.max_retries,
            last_error: self.last_error,
        })
    }
}

fn query_tasks(
    conn: &rusqlite::Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<ScheduledTask>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, TaskRow::read)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(TaskRow::into_task).collect()
}

/// 条件更新未命中时区分「任务不存在」与「状态不允许」
fn ensure_exists(conn: &rusqlite::Connection, id: &str) -> Result<(), StoreError> {
    let found: Option<i64> = conn
        .query_row("SELECT 1 FROM scheduled_tasks WHERE id = ?1", params![id], |row| row.get(0))
        .optional()?;
    match found {
        Some(_) => Ok(()),
        None => Err(StoreError::TaskNotFound(id.to_string())),
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn insert(&self, task: &ScheduledTask) -> Result<(), StoreError> {
        let task = task.clone();
        let payload = serde_json::to_string(&task.payload)?;
        self.db
            .call(move |conn| {
                conn.execute(
                    &format!("INSERT INTO scheduled_tasks ({TASK_COLUMNS})
                              VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"),
                    params![
                        task.id,
                        task.agent_id,
                        task.thread_id,
                        task.task_type.as_str(),
                        task.scheduled_for.timestamp_millis(),
                        task.status.as_str(),
                        payload,
                        task.retry_count,
                        task.max_retries,
                        task.created_at.timestamp_millis(),
                        task.updated_at.timestamp_millis(),
                        task.last_error,
                    ],
                )?;
                Ok(())
            })
            .await
    }

    async fn get(&self, id: &str) -> Result<Option<ScheduledTask>, StoreError> {
        let id = id.to_string();
        self.db
            .call(move |conn| {
                let row = conn
                    .query_row(
                        &format!("SELECT {TASK_COLUMNS} FROM scheduled_tasks WHERE id = ?1"),
                        params![id],
                        TaskRow::read,
                    )
                    .optional()?;
                row.map(TaskRow::into_task).transpose()
            })
            .await
    }

    async fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ScheduledTask>, StoreError> {
        let now = now.timestamp_millis();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.db
            .call(move |conn| {
                query_tasks(
                    conn,
                    &format!(
                        "SELECT {TASK_COLUMNS} FROM scheduled_tasks
                         WHERE status = 'pending' AND scheduled_for <= ?1
                         ORDER BY scheduled_for ASC
                         LIMIT ?2"
                    ),
                    params![now, limit],
                )
            })
            .await
    }

    async fn stale_running(&self, cutoff: DateTime<Utc>) -> Result<Vec<ScheduledTask>, StoreError> {
        let cutoff = cutoff.timestamp_millis();
        self.db
            .call(move |conn| {
                query_tasks(
                    conn,
                    &format!(
                        "SELECT {TASK_COLUMNS} FROM scheduled_tasks
                         WHERE status = 'running' AND updated_at < ?1"
                    ),
                    params![cutoff],
                )
            })
            .await
    }

    async fn for_thread(&self, thread_id: &str) -> Result<Vec<ScheduledTask>, StoreError> {
        let thread_id = thread_id.to_string();
        self.db
            .call(move |conn| {
                query_tasks(
                    conn,
                    &format!(
                        "SELECT {TASK_COLUMNS} FROM scheduled_tasks
                         WHERE thread_id = ?1
                         ORDER BY scheduled_for DESC"
                    ),
                    params![thread_id],
                )
            })
            .await
    }

    async fn update_status(
        &self,
        id: &str,
        status: TaskStatus,
        error: Option<&str>,
    ) -> Result<bool, StoreError> {
        let id = id.to_string();
        let error = error.map(str::to_string);
        let sql = format!(
            "UPDATE scheduled_tasks
             SET status = ?1, updated_at = ?2, last_error = COALESCE(?3, last_error)
             WHERE id = ?4 AND status IN ({})",
            status_list(status.allowed_from())
        );
        self.db
            .call(move |conn| {
                let changed = conn.execute(
                    &sql,
                    params![status.as_str(), Utc::now().timestamp_millis(), error, id],
                )?;
                if changed == 0 {
                    ensure_exists(conn, &id)?;
                    return Ok(false);
                }
                Ok(true)
            })
            .await
    }

    async fn claim(&self, id: &str) -> Result<bool, StoreError> {
        let id = id.to_string();
        self.db
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE scheduled_tasks SET status = 'running', updated_at = ?1
                     WHERE id = ?2 AND status = 'pending'",
                    params![Utc::now().timestamp_millis(), id],
                )?;
                if changed == 0 {
                    ensure_exists(conn, &id)?;
                }
                Ok(changed == 1)
            })
            .await
    }

    async fn increment_retry(&self, id: &str, error: Option<&str>) -> Result<bool, StoreError> {
        let id = id.to_string();
        let error = error.map(str::to_string);
        self.db
            .call(move |conn| {
                let status: Option<String> = conn
                    .query_row(
                        "UPDATE scheduled_tasks
                         SET retry_count = retry_count + 1,
                             updated_at = ?1,
                             status = CASE
                                 WHEN retry_count + 1 >= max_retries THEN 'failed'
                                 ELSE 'pending'
                             END,
                             last_error = COALESCE(?2, last_error)
                         WHERE id = ?3 AND status IN ('pending', 'running')
                         RETURNING status",
                        params![Utc::now().timestamp_millis(), error, id],
                        |row| row.get(0),
                    )
                    .optional()?;
                match status {
                    Some(status) => Ok(status == TaskStatus::Pending.as_str()),
                    None => {
                        ensure_exists(conn, &id)?;
                        Ok(false)
                    }
                }
            })
            .await
    }

    async fn cancel(&self, id: &str) -> Result<bool, StoreError> {
        let id = id.to_string();
        self.db
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE scheduled_tasks SET status = 'cancelled', updated_at = ?1
                     WHERE id = ?2 AND status = 'pending'",
                    params![Utc::now().timestamp_millis(), id],
                )?;
                Ok(changed == 1)
            })
            .await
    }

    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let cutoff = cutoff.timestamp_millis();
        let sql = format!(
            "DELETE FROM scheduled_tasks WHERE status IN ({}) AND updated_at < ?1",
            status_list(&[TaskStatus::Completed, TaskStatus::Failed, TaskStatus::Cancelled])
        );
        self.db
            .call(move |conn| Ok(conn.execute(&sql, params![cutoff])?))
            .await
    }

    async fn stats(&self) -> Result<TaskStats, StoreError> {
        self.db
            .call(|conn| {
                let mut stmt =
                    conn.prepare("SELECT status, COUNT(*) FROM scheduled_tasks GROUP BY status")?;
                let rows = stmt
                    .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
                    .collect::<Result<Vec<_>, _>>()?;
                let mut stats = TaskStats::default();
                for (status, count) in rows {
                    let status: TaskStatus = status.parse().map_err(StoreError::InvalidValue)?;
                    stats.add(status, usize::try_from(count).unwrap_or(0));
                }
                Ok(stats)
            })
            .await
    }
}
