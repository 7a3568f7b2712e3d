//! 错误类型
//!
//! - StoreError：检查点与任务表的持久化错误
//! - AgentError：一轮对话 / 调度 API 向调用方传播的错误
//!
//! 节点内与工具内的错误在原地转为数据（工具结果消息、should_end），不会穿过节点边界；
//! 只有检查点 I/O 错误与取消会以 Err 返回给调用方。

use thiserror::Error;

/// 持久化层错误
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Invalid stored value: {0}")]
    InvalidValue(String),

    #[error("Blocking task failed: {0}")]
    Join(String),

    #[error("Connection lock poisoned")]
    Poisoned,
}

/// Agent 运行过程中向调用方传播的错误
#[derive(Error, Debug)]
pub enum AgentError {
    /// 检查点读写失败：没有持久状态本轮无法继续
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[source] StoreError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[source] StoreError),

    #[error("Cancelled")]
    Cancelled,

    #[error("Tool execution failed: {0}")]
    ToolExecutionFailed(String),

    #[error("Tool timeout: {0}")]
    ToolTimeout(String),

    #[error("Capability not found: {0}")]
    CapabilityNotFound(String),

    #[error("Config error: {0}")]
    ConfigError(String),
}
