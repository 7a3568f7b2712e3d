//! 状态机节点：Router、Planner、Executor
//!
//! 每个节点读取当前状态，返回 (StateUpdate, NextNode)，不直接修改状态；合并与持久化由 StateMachine 负责。
//! 节点内的失败（模型失败、工具失败、能力未注册）在这里转为数据，只有取消会以 Err 返回。

use std::time::Duration;

use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::core::{AgentError, ConversationState, NextNode, StateUpdate};
use crate::llm::{LlmError, ModelRegistry, ModelRouter};
use crate::memory::{ContextStackManager, Message, Role};
use crate::react::Termination;
use crate::tools::{ToolContext, ToolExecutor};

/// 单个线程一轮对话的限制
#[derive(Debug, Clone, Copy)]
pub struct AgentConfig {
    /// 每轮最多 LLM 调用次数（循环保护）
    pub max_llm_calls: u32,
    /// 单次模型调用超时
    pub model_timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_llm_calls: 25,
            model_timeout: Duration::from_secs(60),
        }
    }
}

/// 节点执行所需的协作者
pub struct NodeContext<'a> {
    pub thread_id: &'a str,
    pub router: &'a ModelRouter,
    pub models: &'a ModelRegistry,
    pub executor: &'a ToolExecutor,
    pub context: &'a ContextStackManager,
    pub config: &'a AgentConfig,
    pub cancel: &'a CancellationToken,
}

/// 节点输出
#[derive(Debug, Clone)]
pub struct NodeOutput {
    pub update: StateUpdate,
    pub next: NextNode,
    /// next 为 End 时的结束原因
    pub termination: Option<Termination>,
    pub model_error: Option<LlmError>,
}

impl NodeOutput {
    fn goto(update: StateUpdate, next: NextNode) -> Self {
        Self {
            update,
            next,
            termination: None,
            model_error: None,
        }
    }

    fn end(update: StateUpdate, termination: Termination) -> Self {
        Self {
            update,
            next: NextNode::End,
            termination: Some(termination),
            model_error: None,
        }
    }
}

/// 本轮的路由输入：最近一条 user / system 消息
fn routing_text(state: &ConversationState) -> &str {
    state
        .messages
        .iter()
        .rev()
        .find(|m| matches!(m.role, Role::User | Role::System))
        .map(|m| m.content.as_str())
        .unwrap_or("")
}

/// Router：纯函数，分类意图并选择模型，总是进入 Planner
pub fn router_node(router: &ModelRouter, state: &ConversationState) -> NodeOutput {
    let decision = router.route(routing_text(state), state.model_override);
    tracing::debug!(
        agent_type = %decision.agent_type,
        model = %decision.model,
        "router decided"
    );
    NodeOutput::goto(
        StateUpdate::new()
            .model(decision.model)
            .agent_type(decision.agent_type),
        NextNode::Planner,
    )
}

/// Planner：循环保护 -> 解析模型 -> 带工具调用模型 -> 追加回复
pub async fn planner_node(
    ctx: &NodeContext<'_>,
    state: &ConversationState,
) -> Result<NodeOutput, AgentError> {
    let max = ctx.config.max_llm_calls;
    if state.llm_calls >= max {
        tracing::warn!(thread_id = ctx.thread_id, max, "loop guard tripped before planning");
        return Ok(NodeOutput::end(
            StateUpdate::new().llm_call().end(),
            Termination::LoopGuard,
        ));
    }

    let outcome = invoke_model(ctx, state).await?;
    let response = match outcome {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!(thread_id = ctx.thread_id, error = %e, "model call failed, ending turn");
            let mut out = NodeOutput::end(StateUpdate::new().llm_call().end(), Termination::ModelFailure);
            out.model_error = Some(e);
            return Ok(out);
        }
    };

    let has_calls = !response.tool_calls.is_empty();
    let update = StateUpdate::new()
        .llm_call()
        .message(Message::assistant_with_calls(response.content, response.tool_calls));

    if !has_calls {
        return Ok(NodeOutput::end(update, Termination::NoToolCalls));
    }
    if state.llm_calls + 1 >= max {
        tracing::warn!(thread_id = ctx.thread_id, max, "loop guard reached with tool calls pending");
        return Ok(NodeOutput::end(update.end(), Termination::LoopGuard));
    }
    Ok(NodeOutput::goto(update, NextNode::Executor))
}

/// 调用模型；外层 Err 只表示取消
async fn invoke_model(
    ctx: &NodeContext<'_>,
    state: &ConversationState,
) -> Result<Result<crate::llm::ModelResponse, LlmError>, AgentError> {
    let client = match ctx.models.resolve(state.current_model) {
        Ok(client) => client,
        Err(e) => return Ok(Err(e)),
    };

    let mut history = ctx.context.get_stack(ctx.thread_id).await;
    history.extend(state.messages.iter().cloned());
    let tools = ctx.executor.specs();

    tracing::debug!(
        thread_id = ctx.thread_id,
        model = client.model_name(),
        history_len = history.len(),
        tools = tools.len(),
        "invoking model"
    );

    let secs = ctx.config.model_timeout.as_secs();
    tokio::select! {
        _ = ctx.cancel.cancelled() => Err(AgentError::Cancelled),
        res = timeout(ctx.config.model_timeout, client.invoke(&history, &tools)) => {
            Ok(res.unwrap_or(Err(LlmError::Timeout(secs))))
        }
    }
}

/// Executor：执行最近一条 assistant 消息中尚未有结果的工具调用，每个调用产出一条工具结果消息
pub async fn executor_node(
    ctx: &NodeContext<'_>,
    state: &ConversationState,
) -> Result<NodeOutput, AgentError> {
    let pending = state.pending_tool_call_ids();
    let calls: Vec<_> = state
        .messages
        .iter()
        .rev()
        .find(|m| m.role == Role::Assistant && m.has_tool_calls())
        .map(|m| {
            m.tool_calls
                .iter()
                .filter(|c| pending.contains(&c.id))
                .cloned()
                .collect()
        })
        .unwrap_or_default();

    if calls.is_empty() {
        return Ok(NodeOutput::end(StateUpdate::new(), Termination::NoPendingCalls));
    }

    let tool_ctx = ToolContext::new(ctx.thread_id, state.current_agent_type);
    let mut results = Vec::with_capacity(calls.len());
    for call in calls {
        let outcome = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(AgentError::Cancelled),
            res = ctx.executor.execute(&call.name, call.args.clone(), &tool_ctx) => res,
        };
        let content = match outcome {
            Ok(content) => content,
            Err(e) => {
                tracing::warn!(tool = %call.name, error = %e, "tool call failed");
                serde_json::json!({ "error": e.to_string() }).to_string()
            }
        };
        results.push(Message::tool_result(call.id, call.name, content));
    }

    Ok(NodeOutput::goto(
        StateUpdate::new().messages(results),
        NextNode::Planner,
    ))
}
