//! 调度器端到端测试：Agent 通过 schedule_task 安排任务，调度循环在 SQLite 上唤醒同一线程

use std::sync::Arc;
use std::time::Duration;

use agentic_hub::agent::AgentRuntime;
use agentic_hub::config::AppConfig;
use agentic_hub::llm::{LlmError, ModelRegistry, ModelResponse, ScriptedLlmClient};
use agentic_hub::memory::{Role, ToolCall};
use agentic_hub::scheduler::{ScheduleOptions, ScheduledTask, TaskStatus, TaskType};
use chrono::Utc;
use serde_json::json;
use tokio_util::sync::CancellationToken;

/// 用户消息 -> 安排一个立即到期的 follow_up；工具结果 -> 确认；system 唤醒 -> 跟进回复
fn planner_model() -> ScriptedLlmClient {
    ScriptedLlmClient::new(|history, _| match history.last().map(|m| m.role) {
        Some(Role::User) => Ok(ModelResponse::with_tool_calls(
            "",
            vec![ToolCall::new(
                "call-1",
                "schedule_task",
                json!({"task_type": "follow_up", "delay_seconds": 0, "message": "ask how the deploy went"}),
            )],
        )),
        Some(Role::Tool) => Ok(ModelResponse::text("I'll follow up shortly.")),
        _ => Ok(ModelResponse::text("How did the deploy go?")),
    })
}

fn sqlite_config(dir: &tempfile::TempDir) -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.storage.database_path = Some(dir.path().join("hub.db"));
    cfg.scheduler.poll_interval_ms = 20;
    cfg
}

async fn wait_for_status(runtime: &AgentRuntime, task_id: &str, status: TaskStatus) -> ScheduledTask {
    for _ in 0..250 {
        if let Some(task) = runtime.scheduler.get_task(task_id).await.unwrap() {
            if task.status == status {
                return task;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("task {task_id} never reached {status}");
}

#[tokio::test]
async fn test_agent_scheduled_follow_up_wakes_thread() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = AgentRuntime::from_config(
        &sqlite_config(&dir),
        ModelRegistry::uniform(Arc::new(planner_model())),
    )
    .await
    .unwrap();

    let turn = runtime
        .process_message("deploy-thread", "remind me about the deploy", None, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(turn.reply.as_deref(), Some("I'll follow up shortly."));

    let tasks = runtime.scheduler.tasks_for_thread("deploy-thread").await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].task_type, TaskType::FollowUp);
    assert_eq!(tasks[0].message(), Some("ask how the deploy went"));

    assert!(runtime.start_scheduler().await);
    let done = wait_for_status(&runtime, &tasks[0].id, TaskStatus::Completed).await;
    assert_eq!(done.retry_count, 0);
    runtime.shutdown().await;

    let state = runtime.machine.load_state("deploy-thread").await.unwrap();
    let wake = state
        .messages
        .iter()
        .find(|m| m.role == Role::System)
        .expect("wake message appended");
    assert!(wake.content.contains("ask how the deploy went"));
    assert_eq!(
        state.messages.last().map(|m| m.content.as_str()),
        Some("How did the deploy go?")
    );

    let stats = runtime.scheduler.get_stats().await.unwrap();
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.total(), 1);
}

#[tokio::test]
async fn test_failing_model_exhausts_retries_on_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = AgentRuntime::from_config(
        &sqlite_config(&dir),
        ModelRegistry::uniform(Arc::new(ScriptedLlmClient::failing(LlmError::Network(
            "connection refused".into(),
        )))),
    )
    .await
    .unwrap();

    let task_id = runtime
        .scheduler
        .schedule(
            "conversational",
            "ops-thread",
            ScheduleOptions::new(TaskType::CheckIn, Utc::now()).with_max_retries(2),
        )
        .await
        .unwrap();

    assert!(runtime.start_scheduler().await);
    let failed = wait_for_status(&runtime, &task_id, TaskStatus::Failed).await;
    runtime.shutdown().await;

    assert_eq!(failed.retry_count, 2);
    assert!(failed
        .last_error
        .as_deref()
        .is_some_and(|e| e.contains("connection refused")));
}

#[tokio::test]
async fn test_pending_tasks_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = sqlite_config(&dir);
    let models = ModelRegistry::uniform(Arc::new(planner_model()));

    let task_id = {
        let runtime = AgentRuntime::from_config(&cfg, models.clone()).await.unwrap();
        runtime
            .scheduler
            .schedule(
                "conversational",
                "later-thread",
                ScheduleOptions::new(TaskType::Reminder, Utc::now())
                    .with_payload(json!({"message": "water the plants"})),
            )
            .await
            .unwrap()
    };

    let runtime = AgentRuntime::from_config(&cfg, models).await.unwrap();
    assert_eq!(
        runtime.scheduler.get_task(&task_id).await.unwrap().map(|t| t.status),
        Some(TaskStatus::Pending)
    );

    assert!(runtime.start_scheduler().await);
    wait_for_status(&runtime, &task_id, TaskStatus::Completed).await;
    runtime.shutdown().await;
}
