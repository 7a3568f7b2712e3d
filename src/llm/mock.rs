//! Mock / 脚本化 LLM 客户端（用于测试与本地演示，无需 API）
//!
//! - MockLlmClient：回显最后一条 user/system 消息；若历史末尾是工具结果，则汇总工具结果作为最终回复
//! - ScriptedLlmClient：由闭包决定每次调用的返回，记录调用次数

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::llm::{LlmClient, LlmError, ModelResponse, ToolSpec};
use crate::memory::{Message, Role};

/// Mock 客户端：回显输入
#[derive(Debug, Default)]
pub struct MockLlmClient;

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn invoke(&self, history: &[Message], _tools: &[ToolSpec]) -> Result<ModelResponse, LlmError> {
        if let Some(last) = history.last() {
            if last.role == Role::Tool {
                let results: Vec<&str> = history
                    .iter()
                    .rev()
                    .take_while(|m| m.role == Role::Tool)
                    .map(|m| m.content.as_str())
                    .collect();
                return Ok(ModelResponse::text(format!(
                    "Tool results: {}",
                    results.into_iter().rev().collect::<Vec<_>>().join(" | ")
                )));
            }
        }

        let last_input = history
            .iter()
            .rev()
            .find(|m| matches!(m.role, Role::User | Role::System))
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");

        Ok(ModelResponse::text(format!("Echo from Mock: {}", last_input)))
    }

    fn model_name(&self) -> &str {
        "mock"
    }
}

type ScriptFn = dyn Fn(&[Message], usize) -> Result<ModelResponse, LlmError> + Send + Sync;

/// 脚本化客户端：闭包参数为（历史，第几次调用，从 0 开始）
pub struct ScriptedLlmClient {
    script: Box<ScriptFn>,
    calls: AtomicUsize,
}

impl ScriptedLlmClient {
    pub fn new(
        script: impl Fn(&[Message], usize) -> Result<ModelResponse, LlmError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            script: Box::new(script),
            calls: AtomicUsize::new(0),
        }
    }

    /// 按顺序返回给定响应；用完后返回纯文本 "done"
    pub fn sequence(responses: Vec<ModelResponse>) -> Self {
        Self::new(move |_, call| {
            Ok(responses
                .get(call)
                .cloned()
                .unwrap_or_else(|| ModelResponse::text("done")))
        })
    }

    /// 每次调用都失败
    pub fn failing(error: LlmError) -> Self {
        Self::new(move |_, _| Err(error.clone()))
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn invoke(&self, history: &[Message], _tools: &[ToolSpec]) -> Result<ModelResponse, LlmError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        (self.script)(history, call)
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_echoes_last_user_message() {
        let out = MockLlmClient
            .invoke(&[Message::user("ping")], &[])
            .await
            .unwrap();
        assert_eq!(out.content, "Echo from Mock: ping");
        assert!(out.tool_calls.is_empty());
    }

    #[tokio::test]
    async fn test_mock_summarizes_tool_results() {
        let history = vec![
            Message::user("go"),
            Message::tool_result("c1", "echo", "a"),
            Message::tool_result("c2", "echo", "b"),
        ];
        let out = MockLlmClient.invoke(&history, &[]).await.unwrap();
        assert_eq!(out.content, "Tool results: a | b");
    }

    #[tokio::test]
    async fn test_sequence_then_done() {
        let client = ScriptedLlmClient::sequence(vec![ModelResponse::text("first")]);
        assert_eq!(client.invoke(&[], &[]).await.unwrap().content, "first");
        assert_eq!(client.invoke(&[], &[]).await.unwrap().content, "done");
        assert_eq!(client.call_count(), 2);
    }
}
