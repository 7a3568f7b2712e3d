//! LLM 客户端抽象
//!
//! 所有模型后端实现 LlmClient：invoke 接收合并后的历史与可用工具描述，返回正文与可选的工具调用。
//! 具体供应商（Claude / DeepSeek / Ollama 等）不在本 crate 内，只要求满足这个契约。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::memory::{Message, ToolCall};

/// 模型调用失败（鉴权、超时、限流等在 Planner 看来处理方式一致：结束本轮）
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Model call timed out after {0}s")]
    Timeout(u64),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("API error: {0}")]
    Api(String),

    #[error("No model registered for provider '{0}'")]
    NoModelAvailable(String),
}

/// 绑定给模型的工具描述（名称、用途、参数 schema）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// 一次模型调用的结果
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    pub content: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
}

impl ModelResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }

    pub fn with_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            content: content.into(),
            tool_calls,
        }
    }
}

/// 模型能力：按历史与工具生成下一条 assistant 消息
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn invoke(&self, history: &[Message], tools: &[ToolSpec]) -> Result<ModelResponse, LlmError>;

    /// 用于日志的模型名
    fn model_name(&self) -> &str {
        "unknown"
    }
}
