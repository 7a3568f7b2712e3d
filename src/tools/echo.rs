//! Echo 工具（演示与测试用）

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::tools::{Tool, ToolContext};

/// Echo 工具：回显文本，缺少 text 参数时报错
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo text back. Args: {\"text\": \"message\"}"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "text": { "type": "string", "description": "Text to echo" }
            },
            "required": ["text"]
        })
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<String, String> {
        args.get("text")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| "missing required argument 'text'".to_string())
    }
}
