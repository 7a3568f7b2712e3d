//! 模型注册表：provider key -> LlmClient
//!
//! Planner 只认 provider key；找不到时回退到 Default，Default 也没有则报 NoModelAvailable。

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{LlmClient, LlmError};

/// 模型供应商键
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelProvider {
    /// 本地/私有部署模型
    PrivacyPreserving,
    /// 便宜、快速
    CostEfficient,
    /// 质量最高
    HighestQuality,
    Default,
}

impl ModelProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelProvider::PrivacyPreserving => "privacy-preserving",
            ModelProvider::CostEfficient => "cost-efficient",
            ModelProvider::HighestQuality => "highest-quality",
            ModelProvider::Default => "default",
        }
    }
}

impl std::fmt::Display for ModelProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "privacy-preserving" | "private" | "local" => Ok(ModelProvider::PrivacyPreserving),
            "cost-efficient" | "cheap" | "fast" => Ok(ModelProvider::CostEfficient),
            "highest-quality" | "quality" | "best" => Ok(ModelProvider::HighestQuality),
            "default" => Ok(ModelProvider::Default),
            other => Err(format!("unknown model provider: {other}")),
        }
    }
}

/// 模型注册表
#[derive(Default, Clone)]
pub struct ModelRegistry {
    models: HashMap<ModelProvider, Arc<dyn LlmClient>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: ModelProvider, client: Arc<dyn LlmClient>) {
        self.models.insert(provider, client);
    }

    pub fn with_model(mut self, provider: ModelProvider, client: Arc<dyn LlmClient>) -> Self {
        self.register(provider, client);
        self
    }

    /// 同一个客户端注册到所有 provider key（本地演示与测试用）
    pub fn uniform(client: Arc<dyn LlmClient>) -> Self {
        let mut registry = Self::new();
        for provider in [
            ModelProvider::PrivacyPreserving,
            ModelProvider::CostEfficient,
            ModelProvider::HighestQuality,
            ModelProvider::Default,
        ] {
            registry.register(provider, Arc::clone(&client));
        }
        registry
    }

    /// 按 key 取模型，缺失时回退到 Default
    pub fn resolve(&self, provider: ModelProvider) -> Result<Arc<dyn LlmClient>, LlmError> {
        if let Some(client) = self.models.get(&provider) {
            return Ok(Arc::clone(client));
        }
        if provider != ModelProvider::Default {
            if let Some(client) = self.models.get(&ModelProvider::Default) {
                tracing::warn!(requested = %provider, "model not registered, falling back to default");
                return Ok(Arc::clone(client));
            }
        }
        Err(LlmError::NoModelAvailable(provider.to_string()))
    }

    pub fn providers(&self) -> Vec<ModelProvider> {
        self.models.keys().copied().collect()
    }
}
