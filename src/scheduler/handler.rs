//! 用状态机执行到期任务：以一条 system 消息在任务所属线程上唤醒一轮对话

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::llm::ModelProvider;
use crate::memory::Message;
use crate::react::StateMachine;
use crate::scheduler::{ScheduledTask, TaskHandler};

/// 定时唤醒 Agent 的任务执行者
pub struct AgentTaskHandler {
    machine: Arc<StateMachine>,
}

impl AgentTaskHandler {
    pub fn new(machine: Arc<StateMachine>) -> Self {
        Self { machine }
    }

    /// 唤醒消息：payload.message 优先，否则按任务类型给出默认指令
    pub fn wake_message(task: &ScheduledTask) -> Message {
        let instruction = task
            .message()
            .map(str::to_string)
            .unwrap_or_else(|| format!("Perform the scheduled {} for this conversation.", task.task_type));
        Message::system(format!(
            "[scheduled {} task {}] {}",
            task.task_type, task.id, instruction
        ))
    }
}

#[async_trait]
impl TaskHandler for AgentTaskHandler {
    async fn handle(&self, task: &ScheduledTask, cancel: CancellationToken) -> Result<(), String> {
        let model_override = task
            .payload
            .get("model")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<ModelProvider>().ok());

        let turn = self
            .machine
            .run_turn(&task.thread_id, Self::wake_message(task), model_override, cancel)
            .await
            .map_err(|e| e.to_string())?;

        if let Some(e) = turn.model_error {
            return Err(format!("model failure: {e}"));
        }
        tracing::info!(
            task_id = %task.id,
            thread_id = %task.thread_id,
            termination = %turn.termination,
            "scheduled turn finished"
        );
        Ok(())
    }
}
