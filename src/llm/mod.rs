//! LLM 层：模型契约、注册表、意图/模型路由、Mock 实现

pub mod mock;
pub mod registry;
pub mod router;
pub mod traits;

pub use mock::{MockLlmClient, ScriptedLlmClient};
pub use registry::{ModelProvider, ModelRegistry};
pub use router::{AgentClassifier, AgentType, ModelConstraints, ModelRouter, RouteDecision};
pub use traits::{LlmClient, LlmError, ModelResponse, ToolSpec};
