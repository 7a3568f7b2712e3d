//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HUB__*` 覆盖（双下划线表示嵌套，如 `HUB__AGENT__MAX_LLM_CALLS=10`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::llm::ModelProvider;
use crate::memory::{ContextStackOptions, MergeStrategy};
use crate::react::AgentConfig;
use crate::scheduler::SchedulerConfig;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub agent: AgentSection,
    pub context: ContextSection,
    pub scheduler: SchedulerSection,
    pub storage: StorageSection,
    pub tools: ToolsSection,
}

/// [agent] 段：循环保护、默认模型、模型调用超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    /// 每轮最多 LLM 调用次数
    pub max_llm_calls: u32,
    /// 交互输入未指定模型时使用的 provider key
    pub default_model: String,
    pub model_timeout_secs: u64,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            max_llm_calls: 25,
            default_model: "default".to_string(),
            model_timeout_secs: 60,
        }
    }
}

impl AgentSection {
    pub fn to_agent_config(&self) -> AgentConfig {
        AgentConfig {
            max_llm_calls: self.max_llm_calls.max(1),
            model_timeout: Duration::from_secs(self.model_timeout_secs.max(1)),
        }
    }

    pub fn default_provider(&self) -> Result<ModelProvider, String> {
        self.default_model.parse()
    }
}

/// [context] 段：上下文栈容量与合并策略
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ContextSection {
    pub max_frames: usize,
    pub max_tokens: usize,
    pub tokens_per_message: usize,
    pub merge_strategy: MergeStrategy,
}

impl Default for ContextSection {
    fn default() -> Self {
        let defaults = ContextStackOptions::default();
        Self {
            max_frames: defaults.max_frames,
            max_tokens: defaults.max_tokens,
            tokens_per_message: defaults.tokens_per_message,
            merge_strategy: defaults.merge_strategy,
        }
    }
}

impl ContextSection {
    pub fn to_options(&self) -> ContextStackOptions {
        ContextStackOptions {
            max_frames: self.max_frames,
            max_tokens: self.max_tokens,
            tokens_per_message: self.tokens_per_message,
            merge_strategy: self.merge_strategy,
        }
    }
}

/// [scheduler] 段：轮询间隔、批量、重试与保留期
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    pub enabled: bool,
    pub poll_interval_ms: u64,
    pub batch_size: usize,
    pub default_max_retries: u32,
    pub retention_days: i64,
    /// 单个任务执行超时（秒），不设则不限
    pub task_timeout_secs: Option<u64>,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_ms: 5000,
            batch_size: 10,
            default_max_retries: 3,
            retention_days: 7,
            task_timeout_secs: None,
        }
    }
}

impl SchedulerSection {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn to_scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            batch_size: self.batch_size.max(1),
            default_max_retries: self.default_max_retries.max(1),
            retention_days: self.retention_days,
            task_timeout: self.task_timeout_secs.map(Duration::from_secs),
            ..SchedulerConfig::default()
        }
    }
}

/// [storage] 段：SQLite 文件路径；不设则检查点与任务只保存在内存
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct StorageSection {
    pub database_path: Option<PathBuf>,
}

/// [tools] 段：工具超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    pub tool_timeout_secs: u64,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: 30,
        }
    }
}

/// 从 config 目录加载配置，环境变量 HUB__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HUB__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HUB")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.agent.max_llm_calls, 25);
        assert_eq!(cfg.agent.default_provider(), Ok(ModelProvider::Default));
        assert_eq!(cfg.context.max_frames, 10);
        assert_eq!(cfg.context.to_options().max_messages_per_frame(), 160);
        assert_eq!(cfg.scheduler.poll_interval(), Duration::from_millis(5000));
        assert_eq!(cfg.scheduler.to_scheduler_config().default_max_retries, 3);
        assert!(cfg.storage.database_path.is_none());
        assert_eq!(cfg.tools.tool_timeout_secs, 30);
    }

    #[test]
    fn test_load_from_file_keeps_unset_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hub.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "[agent]\nmax_llm_calls = 7\n\n[context]\nmerge_strategy = \"replace\"\n\n[scheduler]\ntask_timeout_secs = 90"
        )
        .unwrap();

        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.agent.max_llm_calls, 7);
        assert_eq!(cfg.agent.model_timeout_secs, 60);
        assert_eq!(cfg.context.merge_strategy, MergeStrategy::Replace);
        assert_eq!(cfg.context.max_tokens, 16_000);
        assert_eq!(
            cfg.scheduler.to_scheduler_config().task_timeout,
            Some(Duration::from_secs(90))
        );
    }
}
