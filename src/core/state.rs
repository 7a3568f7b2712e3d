//! 会话状态与逐字段合并规则
//!
//! ConversationState 是一轮执行的单位，只由状态机修改；节点返回 StateUpdate（增量），
//! 由 apply 按字段规则合并：
//! - messages：追加，从不替换；tool 消息的 tool_call_id 必须对应待处理的调用
//! - llm_calls：累加，永不递减
//! - current_model / current_agent_type / should_end：后写覆盖

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::llm::{AgentType, ModelProvider};
use crate::memory::{Message, Role};

/// 状态机节点
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Router,
    Planner,
    Executor,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Router => "router",
            NodeKind::Planner => "planner",
            NodeKind::Executor => "executor",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "router" => Some(NodeKind::Router),
            "planner" => Some(NodeKind::Planner),
            "executor" => Some(NodeKind::Executor),
            _ => None,
        }
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 节点执行后的下一跳
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NextNode {
    Planner,
    Executor,
    End,
}

impl NextNode {
    pub fn node(&self) -> Option<NodeKind> {
        match self {
            NextNode::Planner => Some(NodeKind::Planner),
            NextNode::Executor => Some(NodeKind::Executor),
            NextNode::End => None,
        }
    }
}

/// 节点产出的状态增量
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateUpdate {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub llm_calls: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_model: Option<ModelProvider>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_agent_type: Option<AgentType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub should_end: Option<bool>,
}

impl StateUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn message(mut self, message: Message) -> Self {
        self.messages.push(message);
        self
    }

    pub fn messages(mut self, messages: Vec<Message>) -> Self {
        self.messages.extend(messages);
        self
    }

    pub fn llm_call(mut self) -> Self {
        self.llm_calls += 1;
        self
    }

    pub fn model(mut self, model: ModelProvider) -> Self {
        self.current_model = Some(model);
        self
    }

    pub fn agent_type(mut self, agent_type: AgentType) -> Self {
        self.current_agent_type = Some(agent_type);
        self
    }

    pub fn end(mut self) -> Self {
        self.should_end = Some(true);
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// 会话状态（检查点内容）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationState {
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub llm_calls: u32,
    #[serde(default = "default_model")]
    pub current_model: ModelProvider,
    #[serde(default = "default_agent_type")]
    pub current_agent_type: AgentType,
    #[serde(default)]
    pub should_end: bool,
    /// 调用方为本轮指定的模型
    #[serde(default)]
    pub model_override: Option<ModelProvider>,
}

fn default_model() -> ModelProvider {
    ModelProvider::Default
}

fn default_agent_type() -> AgentType {
    AgentType::Conversational
}

impl Default for ConversationState {
    fn default() -> Self {
        Self {
            messages: Vec::new(),
            llm_calls: 0,
            current_model: default_model(),
            current_agent_type: default_agent_type(),
            should_end: false,
            model_override: None,
        }
    }
}

impl ConversationState {
    /// 开始新一轮：追加输入消息，清除 should_end，记录模型覆盖；llm_calls 跨轮累计
    pub fn begin_turn(&mut self, message: Message, model_override: Option<ModelProvider>) {
        self.messages.push(message);
        self.should_end = false;
        self.model_override = model_override;
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// 最近一条带工具调用的 assistant 消息中尚未有结果的调用 ID
    pub fn pending_tool_call_ids(&self) -> HashSet<String> {
        let Some(idx) = self
            .messages
            .iter()
            .rposition(|m| m.role == Role::Assistant && m.has_tool_calls())
        else {
            return HashSet::new();
        };
        let mut pending: HashSet<String> = self.messages[idx]
            .tool_calls
            .iter()
            .map(|c| c.id.clone())
            .collect();
        for answered in self.messages[idx + 1..]
            .iter()
            .filter_map(|m| m.tool_call_id.as_ref())
        {
            pending.remove(answered);
        }
        pending
    }

    /// 按字段规则合并增量
    pub fn apply(&mut self, update: &StateUpdate) {
        for message in &update.messages {
            if message.role == Role::Tool {
                let pending = self.pending_tool_call_ids();
                let matches = message
                    .tool_call_id
                    .as_ref()
                    .map(|id| pending.contains(id))
                    .unwrap_or(false);
                if !matches {
                    tracing::warn!(
                        tool_call_id = ?message.tool_call_id,
                        "dropping tool result without a matching pending call"
                    );
                    continue;
                }
            }
            self.messages.push(message.clone());
        }
        self.llm_calls = self.llm_calls.saturating_add(update.llm_calls);
        if let Some(model) = update.current_model {
            self.current_model = model;
        }
        if let Some(agent_type) = update.current_agent_type {
            self.current_agent_type = agent_type;
        }
        if let Some(should_end) = update.should_end {
            self.should_end = should_end;
        }
    }

    /// 最后一条 assistant 回复的正文
    pub fn last_assistant_reply(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant)
            .map(|m| m.content.as_str())
    }
}
