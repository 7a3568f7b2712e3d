//! Headless Agent 运行时
//!
//! 按 AppConfig 组装全部组件：检查点与任务存储（SQLite 或内存）、上下文栈、工具执行器、状态机、
//! 自主调度器（以 AgentTaskHandler 唤醒状态机）。传输层（HTTP / SSE / TUI）只需调用这里的方法。

use std::sync::Arc;

use anyhow::Context;
use futures_util::Stream;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::core::{
    AgentError, CheckpointStore, MemoryCheckpointStore, SqliteCheckpointStore, SqliteHandle,
};
use crate::llm::{ModelProvider, ModelRegistry};
use crate::memory::{ContextStackManager, Message};
use crate::react::{StateMachine, TurnEvent, TurnResult};
use crate::scheduler::{
    AgentTaskHandler, AutonomousScheduler, MemoryTaskStore, SqliteTaskStore, TaskStore,
};
use crate::tools::{EchoTool, ScheduleTaskTool, ToolExecutor, ToolRegistry};

/// 组装好的运行时
pub struct AgentRuntime {
    pub machine: Arc<StateMachine>,
    pub scheduler: Arc<AutonomousScheduler>,
    pub context: Arc<ContextStackManager>,
    config: AppConfig,
}

impl AgentRuntime {
    /// 由配置与模型注册表构建运行时（不启动调度循环）
    pub async fn from_config(config: &AppConfig, models: ModelRegistry) -> anyhow::Result<Self> {
        let (checkpoints, tasks): (Arc<dyn CheckpointStore>, Arc<dyn TaskStore>) =
            match &config.storage.database_path {
                Some(path) => {
                    let db = SqliteHandle::open(path)
                        .with_context(|| format!("Failed to open database {}", path.display()))?;
                    let checkpoints = SqliteCheckpointStore::new(db.clone())
                        .await
                        .context("Failed to initialise checkpoint table")?;
                    let tasks = SqliteTaskStore::new(db)
                        .await
                        .context("Failed to initialise task table")?;
                    tracing::info!(path = %path.display(), "using SQLite storage");
                    let checkpoints: Arc<dyn CheckpointStore> = Arc::new(checkpoints);
                    let tasks: Arc<dyn TaskStore> = Arc::new(tasks);
                    (checkpoints, tasks)
                }
                None => {
                    tracing::info!("no database configured, using in-memory storage");
                    let checkpoints: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::new());
                    let tasks: Arc<dyn TaskStore> = Arc::new(MemoryTaskStore::new());
                    (checkpoints, tasks)
                }
            };

        let scheduler_config = config.scheduler.to_scheduler_config();

        let mut tools = ToolRegistry::new();
        tools.register(EchoTool);
        tools.register(ScheduleTaskTool::new(
            Arc::clone(&tasks),
            scheduler_config.default_max_retries,
        ));
        let executor = Arc::new(ToolExecutor::new(tools, config.tools.tool_timeout_secs));

        let context = Arc::new(ContextStackManager::new(config.context.to_options()));
        let machine = Arc::new(
            StateMachine::new(models, executor, Arc::clone(&context), checkpoints)
                .with_config(config.agent.to_agent_config()),
        );

        let scheduler = Arc::new(
            AutonomousScheduler::new(tasks, Arc::new(AgentTaskHandler::new(Arc::clone(&machine))))
                .with_config(scheduler_config),
        );

        Ok(Self {
            machine,
            scheduler,
            context,
            config: config.clone(),
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// 交互输入未指定模型时使用配置中的 default_model（"default" 表示交给路由决定）
    fn effective_override(&self, model_override: Option<ModelProvider>) -> Option<ModelProvider> {
        model_override.or_else(|| match self.config.agent.default_provider() {
            Ok(ModelProvider::Default) => None,
            Ok(provider) => Some(provider),
            Err(e) => {
                tracing::warn!(error = %e, "ignoring invalid agent.default_model");
                None
            }
        })
    }

    /// 对一条用户输入跑完整一轮
    pub async fn process_message(
        &self,
        thread_id: &str,
        text: &str,
        model_override: Option<ModelProvider>,
        cancel: CancellationToken,
    ) -> Result<TurnResult, AgentError> {
        self.machine
            .run_turn(
                thread_id,
                Message::user(text),
                self.effective_override(model_override),
                cancel,
            )
            .await
    }

    /// 流式版本，每个节点一条事件
    pub fn stream_message(
        &self,
        thread_id: &str,
        text: &str,
        model_override: Option<ModelProvider>,
        cancel: CancellationToken,
    ) -> impl Stream<Item = TurnEvent> + Send + 'static {
        self.machine.stream_turn(
            thread_id.to_string(),
            Message::user(text),
            self.effective_override(model_override),
            cancel,
        )
    }

    /// 按配置启动调度循环；未启用时返回 false
    pub async fn start_scheduler(&self) -> bool {
        if !self.config.scheduler.enabled {
            tracing::info!("scheduler disabled by configuration");
            return false;
        }
        self.scheduler
            .start(self.config.scheduler.poll_interval())
            .await
    }

    pub async fn shutdown(&self) {
        self.scheduler.stop().await;
    }
}
