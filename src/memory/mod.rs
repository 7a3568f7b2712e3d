//! 记忆层：对话消息模型与按线程的上下文栈

pub mod context_stack;
pub mod conversation;

pub use context_stack::{
    ContextFrame, ContextStackManager, ContextStackOptions, ContextStats, FrameInfo, FrameMetadata,
    MergeStrategy,
};
pub use conversation::{Message, Role, ToolCall};
