//! 状态机过程事件：每完成一个节点推送一次（节点名 + 状态增量），以 End 或 Error 结尾
//!
//! 传输层（SSE / WebSocket）不在本 crate 内，事件可直接序列化为 JSON 交给它。

use serde::Serialize;

use crate::core::{NodeKind, StateUpdate};

/// 一轮结束的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// 模型回复不含工具调用
    NoToolCalls,
    /// 累计 LLM 调用次数达到上限
    LoopGuard,
    /// 模型调用失败或超时
    ModelFailure,
    /// Executor 没有待执行的工具调用
    NoPendingCalls,
    /// 状态中的 should_end 已被置位
    Forced,
}

impl Termination {
    pub fn as_str(&self) -> &'static str {
        match self {
            Termination::NoToolCalls => "no_tool_calls",
            Termination::LoopGuard => "loop_guard",
            Termination::ModelFailure => "model_failure",
            Termination::NoPendingCalls => "no_pending_calls",
            Termination::Forced => "forced",
        }
    }
}

impl std::fmt::Display for Termination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 流式事件
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    /// 节点已执行并持久化
    Node { node: NodeKind, delta: StateUpdate },
    /// 本轮结束（哨兵事件）
    End {
        termination: Termination,
        reply: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        model_error: Option<String>,
    },
    /// 本轮以错误结束（检查点失败或被取消）
    Error { text: String },
}

impl TurnEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TurnEvent::End { .. } | TurnEvent::Error { .. })
    }
}
