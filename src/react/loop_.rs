//! 状态机主循环
//!
//! Router -> Planner -> (Executor -> Planner)* -> End。每个节点执行完、合并增量后立即写检查点
//! （state + 下一个节点），再把控制权交给下一个节点；进程在两个节点之间崩溃时，resume_turn 从
//! 检查点记录的节点继续。取消发生在模型 / 工具调用的 await 点，被中断的节点不写任何状态。
//!
//! 同一线程的轮次（用户输入与定时唤醒）由每线程互斥锁串行化，不同线程互不影响。

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::stream::{self, Stream};
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

use crate::core::{AgentError, Checkpoint, CheckpointStore, ConversationState, NodeKind, StateUpdate};
use crate::llm::{LlmError, ModelProvider, ModelRegistry, ModelRouter};
use crate::memory::{ContextStackManager, Message};
use crate::react::nodes::{executor_node, planner_node, router_node, AgentConfig, NodeContext, NodeOutput};
use crate::react::{Termination, TurnEvent};
use crate::tools::ToolExecutor;

/// 一轮执行结果
#[derive(Debug, Clone)]
pub struct TurnResult {
    pub thread_id: String,
    /// 本轮结束后的完整状态（已持久化）
    pub state: ConversationState,
    /// 本轮最后一条 assistant 回复
    pub reply: Option<String>,
    pub termination: Termination,
    /// 模型调用失败时的错误
    pub model_error: Option<LlmError>,
    /// 本次调用实际执行的节点
    pub nodes: Vec<NodeKind>,
}

impl TurnResult {
    pub fn is_model_failure(&self) -> bool {
        self.model_error.is_some()
    }
}

/// Router / Planner / Executor 状态机
pub struct StateMachine {
    router: ModelRouter,
    models: ModelRegistry,
    executor: Arc<ToolExecutor>,
    context: Arc<ContextStackManager>,
    checkpoints: Arc<dyn CheckpointStore>,
    config: AgentConfig,
    thread_locks: ThreadLocks,
}

type ThreadLocks = std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>;

/// 持有某线程的轮次锁；释放时若没有其他等待者，从锁表中移除该线程
struct ThreadLease<'a> {
    locks: &'a ThreadLocks,
    thread_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for ThreadLease<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if locks
            .get(&self.thread_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.thread_id);
        }
    }
}

impl StateMachine {
    pub fn new(
        models: ModelRegistry,
        executor: Arc<ToolExecutor>,
        context: Arc<ContextStackManager>,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Self {
        Self {
            router: ModelRouter::new(),
            models,
            executor,
            context,
            checkpoints,
            config: AgentConfig::default(),
            thread_locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn with_config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_router(mut self, router: ModelRouter) -> Self {
        self.router = router;
        self
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn context(&self) -> &Arc<ContextStackManager> {
        &self.context
    }

    async fn lock_thread(&self, thread_id: &str) -> ThreadLease<'_> {
        let lock = {
            let mut locks = self.thread_locks.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(locks.entry(thread_id.to_string()).or_default())
        };
        ThreadLease {
            locks: &self.thread_locks,
            thread_id: thread_id.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }

    #[cfg(test)]
    fn locked_thread_count(&self) -> usize {
        self.thread_locks
            .lock()
            .map(|locks| locks.len())
            .unwrap_or_default()
    }

    async fn save(&self, thread_id: &str, state: &ConversationState, next: Option<NodeKind>) -> Result<(), AgentError> {
        self.checkpoints
            .save(&Checkpoint::new(thread_id, state.clone(), next))
            .await
            .map_err(AgentError::Checkpoint)
    }

    /// 读取线程当前状态（没有检查点时为默认状态）
    pub async fn load_state(&self, thread_id: &str) -> Result<ConversationState, AgentError> {
        Ok(self
            .checkpoints
            .load(thread_id)
            .await
            .map_err(AgentError::Checkpoint)?
            .map(|cp| cp.state)
            .unwrap_or_default())
    }

    /// 以一条新消息开始一轮，从 Router 执行到结束
    pub async fn run_turn(
        &self,
        thread_id: &str,
        message: Message,
        model_override: Option<ModelProvider>,
        cancel: CancellationToken,
    ) -> Result<TurnResult, AgentError> {
        self.run_turn_inner(thread_id, message, model_override, cancel, None)
            .await
    }

    async fn run_turn_inner(
        &self,
        thread_id: &str,
        message: Message,
        model_override: Option<ModelProvider>,
        cancel: CancellationToken,
        events: Option<&mpsc::UnboundedSender<TurnEvent>>,
    ) -> Result<TurnResult, AgentError> {
        let _guard = self.lock_thread(thread_id).await;

        let previous = self
            .checkpoints
            .load(thread_id)
            .await
            .map_err(AgentError::Checkpoint)?;
        let mut state = match previous {
            Some(cp) => {
                if let Some(next) = cp.next {
                    tracing::warn!(thread_id, %next, "starting new turn over an interrupted one");
                }
                cp.state
            }
            None => ConversationState::default(),
        };

        state.begin_turn(message, model_override);
        self.save(thread_id, &state, Some(NodeKind::Router)).await?;
        tracing::info!(thread_id, llm_calls = state.llm_calls, "turn started");

        self.drive(thread_id, state, NodeKind::Router, &cancel, events).await
    }

    /// 从检查点继续被中断的一轮；没有未完成轮次时返回 None
    pub async fn resume_turn(
        &self,
        thread_id: &str,
        cancel: CancellationToken,
    ) -> Result<Option<TurnResult>, AgentError> {
        let _guard = self.lock_thread(thread_id).await;

        let checkpoint = self
            .checkpoints
            .load(thread_id)
            .await
            .map_err(AgentError::Checkpoint)?;
        let Some(Checkpoint {
            state,
            next: Some(next),
            ..
        }) = checkpoint
        else {
            return Ok(None);
        };

        tracing::info!(thread_id, %next, "resuming interrupted turn");
        self.drive(thread_id, state, next, &cancel, None).await.map(Some)
    }

    /// 流式执行一轮：每个节点一条 Node 事件，最后是 End 或 Error
    pub fn stream_turn(
        self: &Arc<Self>,
        thread_id: String,
        message: Message,
        model_override: Option<ModelProvider>,
        cancel: CancellationToken,
    ) -> impl Stream<Item = TurnEvent> + Send + 'static {
        let (tx, rx) = mpsc::unbounded_channel();
        let machine = Arc::clone(self);

        tokio::spawn(async move {
            let result = machine
                .run_turn_inner(&thread_id, message, model_override, cancel, Some(&tx))
                .await;
            let last = match result {
                Ok(turn) => TurnEvent::End {
                    termination: turn.termination,
                    reply: turn.reply,
                    model_error: turn.model_error.map(|e| e.to_string()),
                },
                Err(e) => TurnEvent::Error { text: e.to_string() },
            };
            let _ = tx.send(last);
        });

        stream::unfold(rx, |mut rx| async move {
            let event = rx.recv().await?;
            Some((event, rx))
        })
    }

    /// 清空线程的上下文栈（检查点中的对话历史保留）
    pub async fn reset_thread(&self, thread_id: &str) {
        self.context.clear(thread_id).await;
        tracing::info!(thread_id, "context stack cleared");
    }

    async fn drive(
        &self,
        thread_id: &str,
        mut state: ConversationState,
        start: NodeKind,
        cancel: &CancellationToken,
        events: Option<&mpsc::UnboundedSender<TurnEvent>>,
    ) -> Result<TurnResult, AgentError> {
        let ctx = NodeContext {
            thread_id,
            router: &self.router,
            models: &self.models,
            executor: &self.executor,
            context: &self.context,
            config: &self.config,
            cancel,
        };

        let mut node = start;
        let mut nodes = Vec::new();
        let mut model_error = None;

        let termination = loop {
            if cancel.is_cancelled() {
                tracing::info!(thread_id, %node, "turn cancelled");
                return Err(AgentError::Cancelled);
            }

            let NodeOutput {
                update,
                next,
                termination,
                model_error: err,
            } = match node {
                NodeKind::Router => router_node(ctx.router, &state),
                NodeKind::Planner => planner_node(&ctx, &state).await?,
                NodeKind::Executor => executor_node(&ctx, &state).await?,
            };

            state.apply(&update);
            nodes.push(node);
            if err.is_some() {
                model_error = err;
            }

            let forced = state.should_end && next.node().is_some();
            let next_node = if forced { None } else { next.node() };
            self.save(thread_id, &state, next_node).await?;
            tracing::debug!(
                thread_id,
                %node,
                next = ?next_node,
                llm_calls = state.llm_calls,
                "node completed"
            );
            emit(events, node, update);

            match next_node {
                Some(n) => node = n,
                None if forced => break Termination::Forced,
                None => break termination.unwrap_or(Termination::NoToolCalls),
            }
        };

        tracing::info!(
            thread_id,
            %termination,
            llm_calls = state.llm_calls,
            "turn finished"
        );

        Ok(TurnResult {
            thread_id: thread_id.to_string(),
            reply: state.last_assistant_reply().map(str::to_string),
            state,
            termination,
            model_error,
            nodes,
        })
    }
}

fn emit(events: Option<&mpsc::UnboundedSender<TurnEvent>>, node: NodeKind, delta: StateUpdate) {
    if let Some(tx) = events {
        let _ = tx.send(TurnEvent::Node { node, delta });
    }
}
