//! agentic-hub：多模型对话智能体的编排核心
//!
//! 模块划分：
//! - **agent**: 按配置组装的无头运行时（供 HTTP / SSE / CLI 调用）
//! - **config**: 应用配置加载（TOML + 环境变量 HUB__*）
//! - **core**: 错误、会话状态与合并规则、检查点存储、SQLite 句柄、优雅关闭
//! - **llm**: 模型契约、模型注册表、意图与模型路由、Mock 实现
//! - **memory**: 消息模型与按线程的上下文栈
//! - **observability**: tracing 初始化
//! - **react**: Router / Planner / Executor 节点与状态机主循环
//! - **scheduler**: 定时任务存储与自主调度器
//! - **tools**: 工具契约、注册表、执行器与内置工具

pub mod agent;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod react;
pub mod scheduler;
pub mod tools;
