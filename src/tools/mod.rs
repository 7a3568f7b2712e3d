//! 工具层：Tool 契约与注册表、带超时与审计日志的执行器、内置工具（echo、schedule_task）

pub mod echo;
pub mod executor;
pub mod registry;
pub mod schedule;

pub use echo::EchoTool;
pub use executor::ToolExecutor;
pub use registry::{Tool, ToolContext, ToolRegistry};
pub use schedule::ScheduleTaskTool;
