//! 编排层：Router / Planner / Executor 节点与带检查点的状态机主循环

pub mod events;
pub mod loop_;
pub mod nodes;

pub use events::{Termination, TurnEvent};
pub use loop_::{StateMachine, TurnResult};
pub use nodes::AgentConfig;
