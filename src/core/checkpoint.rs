//! 检查点存储
//!
//! 以 thread_id 为键持久化 ConversationState 与「下一个待执行节点」。状态机每完成一个节点就写一次，
//! 崩溃后从 next 指向的节点继续，而不是重跑整轮。next 为 None 表示该线程没有未完成的轮次。

use std::collections::HashMap;

use async_trait::async_trait;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::core::sqlite::{now_millis, SqliteHandle};
use crate::core::state::{ConversationState, NodeKind};
use crate::core::StoreError;

/// 一个线程的检查点
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub thread_id: String,
    pub state: ConversationState,
    /// 下一个待执行节点；None 表示本轮已结束
    pub next: Option<NodeKind>,
    /// 写入时间（毫秒时间戳）
    pub updated_at: i64,
}

impl Checkpoint {
    pub fn new(thread_id: impl Into<String>, state: ConversationState, next: Option<NodeKind>) -> Self {
        Self {
            thread_id: thread_id.into(),
            state,
            next,
            updated_at: now_millis(),
        }
    }

    pub fn is_interrupted(&self) -> bool {
        self.next.is_some()
    }
}

/// 检查点存储接口：不假设具体存储技术
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// 读取线程检查点；不存在时返回 None（调用方使用默认状态）
    async fn load(&self, thread_id: &str) -> Result<Option<Checkpoint>, StoreError>;

    /// 覆盖写入线程检查点
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), StoreError>;
}

/// 内存检查点存储（测试与无数据库部署用）
#[derive(Default)]
pub struct MemoryCheckpointStore {
    checkpoints: RwLock<HashMap<String, Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, thread_id: &str) -> Result<Option<Checkpoint>, StoreError> {
        Ok(self.checkpoints.read().await.get(thread_id).cloned())
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        self.checkpoints
            .write()
            .await
            .insert(checkpoint.thread_id.clone(), checkpoint.clone());
        Ok(())
    }
}

/// SQLite 检查点存储：每个线程一行，state 以 JSON 文本保存
pub struct SqliteCheckpointStore {
    db: SqliteHandle,
}

impl SqliteCheckpointStore {
    pub async fn new(db: SqliteHandle) -> Result<Self, StoreError> {
        db.call(|conn| {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS checkpoints (
                    thread_id TEXT PRIMARY KEY,
                    state TEXT NOT NULL,
                    next_node TEXT,
                    updated_at INTEGER NOT NULL
                );",
            )?;
            Ok(())
        })
        .await?;
        Ok(Self { db })
    }
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn load(&self, thread_id: &str) -> Result<Option<Checkpoint>, StoreError> {
        let thread_id = thread_id.to_string();
        self.db
            .call(move |conn| {
                let row = conn
                    .query_row(
                        "SELECT state, next_node, updated_at FROM checkpoints WHERE thread_id = ?1",
                        params![thread_id],
                        |row| {
                            Ok((
                                row.get::<_, String>(0)?,
                                row.get::<_, Option<String>>(1)?,
                                row.get::<_, i64>(2)?,
                            ))
                        },
                    )
                    .optional()?;

                let Some((state_json, next_node, updated_at)) = row else {
                    return Ok(None);
                };
                let state: ConversationState = serde_json::from_str(&state_json)?;
                let next = match next_node {
                    Some(name) => Some(
                        NodeKind::parse(&name)
                            .ok_or_else(|| StoreError::InvalidValue(format!("next_node '{name}'")))?,
                    ),
                    None => None,
                };
                Ok(Some(Checkpoint {
                    thread_id,
                    state,
                    next,
                    updated_at,
                }))
            })
            .await
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        let state_json = serde_json::to_string(&checkpoint.state)?;
        let thread_id = checkpoint.thread_id.clone();
        let next_node = checkpoint.next.map(|n| n.as_str().to_string());
        let updated_at = checkpoint.updated_at;
        self.db
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO checkpoints (thread_id, state, next_node, updated_at)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(thread_id) DO UPDATE SET
                        state = excluded.state,
                        next_node = excluded.next_node,
                        updated_at = excluded.updated_at",
                    params![thread_id, state_json, next_node, updated_at],
                )?;
                Ok(())
            })
            .await
    }
}
