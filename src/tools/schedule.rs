//! schedule_task 工具：让 Agent 为当前线程安排未来的工作（跟进、提醒等）

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};

use crate::scheduler::{ScheduleOptions, ScheduledTask, TaskStore, TaskType};
use crate::tools::{Tool, ToolContext};

/// 定时任务工具；直接写任务表，由调度器轮询执行
pub struct ScheduleTaskTool {
    store: Arc<dyn TaskStore>,
    default_max_retries: u32,
}

impl ScheduleTaskTool {
    pub fn new(store: Arc<dyn TaskStore>, default_max_retries: u32) -> Self {
        Self {
            store,
            default_max_retries,
        }
    }

    fn parse_when(args: &Value) -> Result<DateTime<Utc>, String> {
        if let Some(at) = args.get("scheduled_for").and_then(Value::as_str) {
            return DateTime::parse_from_rfc3339(at)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| format!("invalid scheduled_for '{at}': {e}"));
        }
        match args.get("delay_seconds").and_then(Value::as_i64) {
            Some(secs) if secs >= 0 => Duration::try_seconds(secs)
                .and_then(|delay| Utc::now().checked_add_signed(delay))
                .ok_or_else(|| format!("delay_seconds out of range: {secs}")),
            Some(secs) => Err(format!("delay_seconds must be non-negative, got {secs}")),
            None => Err("one of 'delay_seconds' or 'scheduled_for' is required".to_string()),
        }
    }
}

#[async_trait]
impl Tool for ScheduleTaskTool {
    fn name(&self) -> &str {
        "schedule_task"
    }

    fn description(&self) -> &str {
        "Schedule future work on this conversation (check_in, follow_up, reminder, autonomous). \
         Args: {\"task_type\": \"reminder\", \"delay_seconds\": 3600, \"message\": \"what to do\"}"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "task_type": {
                    "type": "string",
                    "enum": ["check_in", "follow_up", "reminder", "autonomous"]
                },
                "delay_seconds": { "type": "integer", "minimum": 0 },
                "scheduled_for": { "type": "string", "description": "RFC 3339 timestamp" },
                "message": { "type": "string", "description": "Instruction for the future turn" },
                "max_retries": { "type": "integer", "minimum": 1 }
            },
            "required": ["task_type", "message"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<String, String> {
        let task_type: TaskType = args
            .get("task_type")
            .and_then(Value::as_str)
            .ok_or("missing required argument 'task_type'")?
            .parse()?;
        let message = args
            .get("message")
            .and_then(Value::as_str)
            .ok_or("missing required argument 'message'")?;
        let when = Self::parse_when(&args)?;

        let mut options =
            ScheduleOptions::new(task_type, when).with_payload(json!({ "message": message }));
        if let Some(max) = args.get("max_retries").and_then(Value::as_u64) {
            options = options.with_max_retries(u32::try_from(max).unwrap_or(u32::MAX).max(1));
        }

        let task = ScheduledTask::new(
            ctx.agent_type.as_str(),
            ctx.thread_id.as_str(),
            options,
            self.default_max_retries,
        );
        self.store.insert(&task).await.map_err(|e| e.to_string())?;
        tracing::info!(task_id = %task.id, thread_id = %ctx.thread_id, "agent scheduled a task");

        Ok(json!({
            "task_id": task.id,
            "task_type": task.task_type,
            "scheduled_for": task.scheduled_for.to_rfc3339(),
        })
        .to_string())
    }
}
