//! 核心层：错误、会话状态与合并规则、检查点存储、SQLite 句柄、优雅关闭

pub mod checkpoint;
pub mod error;
pub mod shutdown;
pub mod sqlite;
pub mod state;

pub use checkpoint::{Checkpoint, CheckpointStore, MemoryCheckpointStore, SqliteCheckpointStore};
pub use error::{AgentError, StoreError};
pub use shutdown::{ShutdownManager, ShutdownReason};
pub use sqlite::SqliteHandle;
pub use state::{ConversationState, NextNode, NodeKind, StateUpdate};
