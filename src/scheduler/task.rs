//! 定时任务数据模型

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 任务状态
///
/// 合法流转：pending -> running -> {completed | failed | pending(重试)}；cancelled 只能由 pending 进入。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Pending,
        TaskStatus::Running,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// 可以流转到本状态的前驱状态（含自身，便于重复写入错误信息）
    pub fn allowed_from(&self) -> &'static [TaskStatus] {
        match self {
            TaskStatus::Pending => &[TaskStatus::Pending, TaskStatus::Running],
            TaskStatus::Running => &[TaskStatus::Pending, TaskStatus::Running],
            TaskStatus::Completed => &[TaskStatus::Running, TaskStatus::Completed],
            TaskStatus::Failed => &[TaskStatus::Pending, TaskStatus::Running, TaskStatus::Failed],
            TaskStatus::Cancelled => &[TaskStatus::Pending, TaskStatus::Cancelled],
        }
    }

    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        next.allowed_from().contains(self)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| format!("unknown task status: {s}"))
    }
}

/// 任务类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    CheckIn,
    FollowUp,
    Reminder,
    Autonomous,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::CheckIn => "check_in",
            TaskType::FollowUp => "follow_up",
            TaskType::Reminder => "reminder",
            TaskType::Autonomous => "autonomous",
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "check_in" | "checkin" => Ok(TaskType::CheckIn),
            "follow_up" | "followup" => Ok(TaskType::FollowUp),
            "reminder" => Ok(TaskType::Reminder),
            "autonomous" => Ok(TaskType::Autonomous),
            other => Err(format!("unknown task type: {other}")),
        }
    }
}

/// 持久化的定时任务
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: String,
    pub agent_id: String,
    pub thread_id: String,
    pub task_type: TaskType,
    pub scheduled_for: DateTime<Utc>,
    pub status: TaskStatus,
    pub payload: Value,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl ScheduledTask {
    /// 由调度请求构造一个 pending 任务
    pub fn new(
        agent_id: impl Into<String>,
        thread_id: impl Into<String>,
        options: ScheduleOptions,
        default_max_retries: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            agent_id: agent_id.into(),
            thread_id: thread_id.into(),
            task_type: options.task_type,
            scheduled_for: options.scheduled_for,
            status: TaskStatus::Pending,
            payload: options.payload,
            retry_count: 0,
            max_retries: options.max_retries.unwrap_or(default_max_retries),
            created_at: now,
            updated_at: now,
            last_error: None,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Pending && self.scheduled_for <= now
    }

    /// payload 中的 message 字段（定时唤醒时交给状态机的指令）
    pub fn message(&self) -> Option<&str> {
        self.payload.get("message").and_then(Value::as_str)
    }
}

/// 调度参数
#[derive(Debug, Clone)]
pub struct ScheduleOptions {
    pub scheduled_for: DateTime<Utc>,
    pub task_type: TaskType,
    pub payload: Value,
    /// None 时使用调度器默认值（3）
    pub max_retries: Option<u32>,
}

impl ScheduleOptions {
    pub fn new(task_type: TaskType, scheduled_for: DateTime<Utc>) -> Self {
        Self {
            scheduled_for,
            task_type,
            payload: Value::Object(Default::default()),
            max_retries: None,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// 各状态任务数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskStats {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl TaskStats {
    pub fn add(&mut self, status: TaskStatus, count: usize) {
        let slot = match status {
            TaskStatus::Pending => &mut self.pending,
            TaskStatus::Running => &mut self.running,
            TaskStatus::Completed => &mut self.completed,
            TaskStatus::Failed => &mut self.failed,
            TaskStatus::Cancelled => &mut self.cancelled,
        };
        *slot += count;
    }

    pub fn total(&self) -> usize {
        self.pending + self.running + self.completed + self.failed + self.cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    #[test]
    fn test_status_transitions() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Pending));
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Cancelled));
        assert!(!TaskStatus::Running.can_transition_to(TaskStatus::Cancelled));
        assert!(!TaskStatus::Failed.can_transition_to(TaskStatus::Pending));
        assert!(!TaskStatus::Completed.can_transition_to(TaskStatus::Running));
    }

    #[test]
    fn test_parse_names() {
        for status in TaskStatus::ALL {
            assert_eq!(status.as_str().parse::<TaskStatus>(), Ok(status));
        }
        assert_eq!("check-in".parse::<TaskType>(), Ok(TaskType::CheckIn));
        assert_eq!("follow_up".parse::<TaskType>(), Ok(TaskType::FollowUp));
        assert!("nap".parse::<TaskType>().is_err());
    }

    #[test]
    fn test_new_task_defaults() {
        let when = Utc::now() - Duration::seconds(1);
        let task = ScheduledTask::new(
            "agent",
            "thread",
            ScheduleOptions::new(TaskType::CheckIn, when).with_payload(json!({"message": "hi"})),
            3,
        );
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.max_retries, 3);
        assert_eq!(task.retry_count, 0);
        assert_eq!(task.message(), Some("hi"));
        assert!(task.is_due(Utc::now()));
        assert_eq!(serde_json::to_value(task.task_type).unwrap(), "check_in");
    }
}
