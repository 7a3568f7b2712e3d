//! 上下文栈管理器
//!
//! 每个线程维护一个有界的帧栈（ContextFrame），每帧是一段带来源信息的对话切片：
//! - push：按 token 预算裁剪（保留最新消息），入栈；超过 max_frames 时淘汰最旧的帧
//! - pop：弹出最新帧，栈空后移除该线程
//! - get_stack：按合并策略（append / interleave / replace）得到交给 Planner 的历史
//!
//! 同一线程的操作串行（单写者），不同线程之间互不影响。

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::llm::AgentType;
use crate::memory::Message;

/// 帧合并策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeStrategy {
    /// 按入栈顺序拼接所有帧
    #[default]
    Append,
    /// 按帧顺序展开；目前只有帧顺序一个排序维度，结果与 Append 相同
    Interleave,
    /// 只用最新一帧
    Replace,
}

impl FromStr for MergeStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "append" => Ok(MergeStrategy::Append),
            "interleave" => Ok(MergeStrategy::Interleave),
            "replace" => Ok(MergeStrategy::Replace),
            other => Err(format!("unknown merge strategy: {other}")),
        }
    }
}

/// 帧元数据
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameMetadata {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub language: Option<String>,
    pub agent_type: Option<AgentType>,
}

/// push 时可选附带的元数据
#[derive(Debug, Clone, Default)]
pub struct FrameInfo {
    pub language: Option<String>,
    pub agent_type: Option<AgentType>,
}

impl FrameInfo {
    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn with_agent_type(mut self, agent_type: AgentType) -> Self {
        self.agent_type = Some(agent_type);
        self
    }
}

/// 上下文帧
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextFrame {
    pub id: String,
    pub thread_id: String,
    pub messages: Vec<Message>,
    pub metadata: FrameMetadata,
}

/// 管理器配置
#[derive(Debug, Clone, Copy)]
pub struct ContextStackOptions {
    /// 每个线程最多保留的帧数
    pub max_frames: usize,
    /// 每帧的近似 token 上限
    pub max_tokens: usize,
    /// 估算用的每条消息平均 token 数
    pub tokens_per_message: usize,
    pub merge_strategy: MergeStrategy,
}

impl Default for ContextStackOptions {
    fn default() -> Self {
        Self {
            max_frames: 10,
            max_tokens: 16_000,
            tokens_per_message: 100,
            merge_strategy: MergeStrategy::Append,
        }
    }
}

impl ContextStackOptions {
    /// 每帧最多保留的消息数
    pub fn max_messages_per_frame(&self) -> usize {
        self.max_tokens.div_ceil(self.tokens_per_message.max(1))
    }
}

/// 统计信息
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ContextStats {
    pub total_threads: usize,
    pub total_frames: usize,
    pub avg_frames_per_thread: f64,
}

/// 上下文栈管理器
pub struct ContextStackManager {
    stacks: RwLock<HashMap<String, Vec<ContextFrame>>>,
    options: ContextStackOptions,
    /// 最近一次分配的帧时间戳，保证帧 ID 严格递增
    last_stamp: AtomicI64,
}

impl ContextStackManager {
    pub fn new(options: ContextStackOptions) -> Self {
        Self {
            stacks: RwLock::new(HashMap::new()),
            options: ContextStackOptions {
                max_frames: options.max_frames.max(1),
                ..options
            },
            last_stamp: AtomicI64::new(0),
        }
    }

    pub fn options(&self) -> &ContextStackOptions {
        &self.options
    }

    /// 单调时间戳：取当前毫秒与上次 +1 的较大者
    fn next_stamp(&self) -> i64 {
        let now = Utc::now().timestamp_millis();
        let mut last = self.last_stamp.load(Ordering::SeqCst);
        loop {
            let candidate = now.max(last + 1);
            match self
                .last_stamp
                .compare_exchange(last, candidate, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return candidate,
                Err(actual) => last = actual,
            }
        }
    }

    /// 保留最新的 N 条消息，顺序不变
    fn trim_messages(&self, mut messages: Vec<Message>) -> Vec<Message> {
        let max = self.options.max_messages_per_frame();
        if messages.len() > max {
            messages.drain(..messages.len() - max);
        }
        messages
    }

    /// 入栈一帧，返回帧 ID
    pub async fn push(&self, thread_id: &str, messages: Vec<Message>, info: FrameInfo) -> String {
        let stamp = self.next_stamp();
        let frame_id = format!("{}-{:013}", thread_id, stamp);
        let now = Utc::now();
        let frame = ContextFrame {
            id: frame_id.clone(),
            thread_id: thread_id.to_string(),
            messages: self.trim_messages(messages),
            metadata: FrameMetadata {
                created_at: now,
                updated_at: now,
                language: info.language,
                agent_type: info.agent_type,
            },
        };

        let mut stacks = self.stacks.write().await;
        let stack = stacks.entry(thread_id.to_string()).or_default();
        stack.push(frame);
        if stack.len() > self.options.max_frames {
            let evicted = stack.remove(0);
            tracing::debug!(thread_id, frame_id = %evicted.id, "evicted oldest context frame");
        }
        frame_id
    }

    /// 弹出最新帧；栈空后移除线程条目
    pub async fn pop(&self, thread_id: &str) -> Option<ContextFrame> {
        let mut stacks = self.stacks.write().await;
        let stack = stacks.get_mut(thread_id)?;
        let frame = stack.pop();
        if stack.is_empty() {
            stacks.remove(thread_id);
        }
        frame
    }

    /// 按合并策略得到线程的有效历史
    pub async fn get_stack(&self, thread_id: &str) -> Vec<Message> {
        let stacks = self.stacks.read().await;
        let Some(frames) = stacks.get(thread_id) else {
            return Vec::new();
        };
        match self.options.merge_strategy {
            MergeStrategy::Append | MergeStrategy::Interleave => frames
                .iter()
                .flat_map(|f| f.messages.iter().cloned())
                .collect(),
            MergeStrategy::Replace => frames
                .last()
                .map(|f| f.messages.clone())
                .unwrap_or_default(),
        }
    }

    /// 跨线程按 ID 查找帧（调试用）
    pub async fn get_frame(&self, frame_id: &str) -> Option<ContextFrame> {
        let stacks = self.stacks.read().await;
        stacks
            .values()
            .flat_map(|stack| stack.iter())
            .find(|f| f.id == frame_id)
            .cloned()
    }

    /// 线程的帧数
    pub async fn frame_count(&self, thread_id: &str) -> usize {
        self.stacks
            .read()
            .await
            .get(thread_id)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub async fn clear(&self, thread_id: &str) {
        self.stacks.write().await.remove(thread_id);
    }

    /// 仍有帧的线程 ID
    pub async fn active_threads(&self) -> Vec<String> {
        let mut threads: Vec<String> = self.stacks.read().await.keys().cloned().collect();
        threads.sort();
        threads
    }

    pub async fn get_stats(&self) -> ContextStats {
        let stacks = self.stacks.read().await;
        let total_threads = stacks.len();
        let total_frames: usize = stacks.values().map(Vec::len).sum();
        ContextStats {
            total_threads,
            total_frames,
            avg_frames_per_thread: if total_threads > 0 {
                total_frames as f64 / total_threads as f64
            } else {
                0.0
            },
        }
    }
}

impl Default for ContextStackManager {
    fn default() -> Self {
        Self::new(ContextStackOptions::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numbered(n: usize) -> Vec<Message> {
        (0..n).map(|i| Message::user(format!("m{i}"))).collect()
    }

    fn manager(max_frames: usize, max_tokens: usize, strategy: MergeStrategy) -> ContextStackManager {
        ContextStackManager::new(ContextStackOptions {
            max_frames,
            max_tokens,
            tokens_per_message: 100,
            merge_strategy: strategy,
        })
    }

    #[tokio::test]
    async fn test_push_trims_to_newest_messages() {
        // 500 tokens / 100 per message = 5 条
        let mgr = manager(10, 500, MergeStrategy::Append);
        let id = mgr.push("t1", numbered(8), FrameInfo::default()).await;
        let frame = mgr.get_frame(&id).await.unwrap();
        let contents: Vec<&str> = frame.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m3", "m4", "m5", "m6", "m7"]);
    }

    #[tokio::test]
    async fn test_budget_rounds_up() {
        let mgr = manager(10, 250, MergeStrategy::Append);
        let id = mgr.push("t1", numbered(5), FrameInfo::default()).await;
        assert_eq!(mgr.get_frame(&id).await.unwrap().messages.len(), 3);
    }

    #[tokio::test]
    async fn test_evicts_oldest_frame() {
        let mgr = manager(3, 16_000, MergeStrategy::Append);
        let mut ids = Vec::new();
        for i in 0..4 {
            ids.push(mgr.push("t1", vec![Message::user(format!("f{i}"))], FrameInfo::default()).await);
        }
        assert_eq!(mgr.frame_count("t1").await, 3);
        assert!(mgr.get_frame(&ids[0]).await.is_none());
        for id in &ids[1..] {
            assert!(mgr.get_frame(id).await.is_some());
        }
    }

    #[tokio::test]
    async fn test_frame_ids_unique_and_sortable() {
        let mgr = ContextStackManager::default();
        let a = mgr.push("t1", numbered(1), FrameInfo::default()).await;
        let b = mgr.push("t1", numbered(1), FrameInfo::default()).await;
        assert_ne!(a, b);
        assert!(a < b);
    }

    #[tokio::test]
    async fn test_pop_removes_thread_when_empty() {
        let mgr = ContextStackManager::default();
        mgr.push("t1", numbered(1), FrameInfo::default()).await;
        let latest = mgr.push("t1", numbered(2), FrameInfo::default()).await;

        assert_eq!(mgr.pop("t1").await.unwrap().id, latest);
        assert_eq!(mgr.active_threads().await, vec!["t1".to_string()]);
        assert!(mgr.pop("t1").await.is_some());
        assert!(mgr.active_threads().await.is_empty());
        assert!(mgr.pop("t1").await.is_none());
    }

    #[tokio::test]
    async fn test_merge_strategies() {
        for strategy in [MergeStrategy::Append, MergeStrategy::Interleave, MergeStrategy::Replace] {
            let mgr = manager(10, 16_000, strategy);
            mgr.push("t1", vec![Message::user("a"), Message::user("b")], FrameInfo::default()).await;
            mgr.push("t1", vec![Message::user("c")], FrameInfo::default()).await;
            let contents: Vec<String> = mgr.get_stack("t1").await.into_iter().map(|m| m.content).collect();
            match strategy {
                MergeStrategy::Replace => assert_eq!(contents, vec!["c"]),
                _ => assert_eq!(contents, vec!["a", "b", "c"]),
            }
        }
    }

    #[tokio::test]
    async fn test_metadata_and_stats() {
        let mgr = ContextStackManager::default();
        let id = mgr
            .push(
                "t1",
                numbered(1),
                FrameInfo::default()
                    .with_language("en")
                    .with_agent_type(AgentType::Technical),
            )
            .await;
        mgr.push("t1", numbered(1), FrameInfo::default()).await;
        mgr.push("t2", numbered(1), FrameInfo::default()).await;

        let frame = mgr.get_frame(&id).await.unwrap();
        assert_eq!(frame.thread_id, "t1");
        assert_eq!(frame.metadata.language.as_deref(), Some("en"));
        assert_eq!(frame.metadata.agent_type, Some(AgentType::Technical));

        let stats = mgr.get_stats().await;
        assert_eq!(stats.total_threads, 2);
        assert_eq!(stats.total_frames, 3);
        assert!((stats.avg_frames_per_thread - 1.5).abs() < f64::EPSILON);

        mgr.clear("t1").await;
        assert!(mgr.get_stack("t1").await.is_empty());
        assert_eq!(mgr.get_stats().await.total_threads, 1);
    }

    #[test]
    fn test_merge_strategy_from_str() {
        assert_eq!("REPLACE".parse::<MergeStrategy>(), Ok(MergeStrategy::Replace));
        assert!("zip".parse::<MergeStrategy>().is_err());
    }
}
