//! 自主调度层：定时任务模型、任务存储、轮询调度器与 Agent 唤醒

pub mod autonomous;
pub mod handler;
pub mod store;
pub mod task;

pub use autonomous::{AutonomousScheduler, SchedulerConfig, TaskHandler};
pub use handler::AgentTaskHandler;
pub use store::{MemoryTaskStore, SqliteTaskStore, TaskStore};
pub use task::{ScheduleOptions, ScheduledTask, TaskStats, TaskStatus, TaskType};
