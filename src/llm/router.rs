//! 多模型路由器
//!
//! 根据最新消息判断对话意图（AgentType）并选择模型：
//! - 隐私敏感：强制本地/私有模型
//! - 成本或速度优先：使用便宜快速的模型
//! - 质量优先：使用能力最强的模型
//! - 无明确信号：使用该意图的首选模型
//!
//! 路由是全函数：任何输入都有结果，不会失败。

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::registry::ModelProvider;

/// 对话意图分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    /// 闲聊/问答（基线）
    Conversational,
    /// 代码/技术问题
    Technical,
    /// 检索/浏览/摘要
    Retrieval,
}

impl AgentType {
    /// 平分时的优先级顺序（靠前者胜出）
    pub const PRIORITY: [AgentType; 3] =
        [AgentType::Technical, AgentType::Retrieval, AgentType::Conversational];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentType::Conversational => "conversational",
            AgentType::Technical => "technical",
            AgentType::Retrieval => "retrieval",
        }
    }

    fn keywords(&self) -> &'static [&'static str] {
        match self {
            AgentType::Conversational => &[
                "hello", "hi", "hey", "help", "explain", "tell me", "what is", "how do",
                "can you", "please", "thanks", "thank you", "hola", "buenos", "gracias",
                "ayuda", "explica", "你好", "您好", "谢谢", "请问",
            ],
            AgentType::Technical => &[
                "code", "coding", "program*", "function", "class", "debug*", "bug", "buggy",
                "fix", "implement*", "refactor*", "algorithm", "api", "database", "sql", "test",
                "testing", "deploy*", "compil*", "syntax", "error", "stack trace", "rust",
                "python", "javascript", "typescript", "analyz*", "analys*", "reason", "código", "programar",
                "función", "depurar", "代码", "编程", "函数", "调试",
            ],
            AgentType::Retrieval => &[
                "search*", "find", "look up", "google", "web", "brows*", "fetch", "url",
                "http", "https", "website", "recent", "latest", "news", "information", "translat*",
                "summar*", "bulk", "buscar", "encontrar", "sitio web", "搜索", "查找", "网页",
                "最新", "总结",
            ],
        }
    }
}

impl std::fmt::Display for AgentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 从自由文本中识别出的模型约束
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ModelConstraints {
    pub privacy: bool,
    pub cost: bool,
    pub quality: bool,
}

const PRIVACY_CUES: &[&str] = &["privat*", "local", "locally", "offline", "confidential", "sensitive"];
const COST_CUES: &[&str] = &[
    "cheap*", "fast", "faster", "quick*", "budget", "bulk", "low cost", "asap", "speed",
];
const QUALITY_CUES: &[&str] = &[
    "best", "thorough*", "accurat*", "high quality", "high-quality", "detailed", "precise*",
    "careful*",
];

fn words(content: &str) -> impl Iterator<Item = &str> {
    content.split(|c: char| !c.is_alphanumeric()).filter(|w| !w.is_empty())
}

/// 单个 ASCII 词
/// - 以 `*` 结尾：词干，按词前缀匹配（analyz* 命中 analyze / analyzing）
/// - 其余：整词匹配；三个字母以上的关键词允许复数后缀 s / es（bug 命中 bugs，hi 不命中 his）
///
/// 短语与非 ASCII 关键词按子串匹配。
fn keyword_matches(content: &str, keyword: &str) -> bool {
    if let Some(stem) = keyword.strip_suffix('*') {
        return words(content).any(|word| word.starts_with(stem));
    }
    if !keyword.chars().all(|c| c.is_ascii_alphanumeric()) {
        return content.contains(keyword);
    }
    let plural_of_keyword = |word: &str| {
        keyword.len() >= 3
            && word
                .strip_suffix('s')
                .is_some_and(|base| base == keyword || base.strip_suffix('e') == Some(keyword))
    };
    words(content).any(|word| word == keyword || plural_of_keyword(word))
}

fn any_cue(content: &str, cues: &[&str]) -> bool {
    cues.iter().any(|cue| keyword_matches(content, cue))
}

/// 意图分类器：统计各类别关键词命中数，最高者胜；平分按 PRIORITY；全部为 0 则为 Conversational
pub struct AgentClassifier;

impl AgentClassifier {
    pub fn scores(text: &str) -> HashMap<AgentType, usize> {
        let content = text.to_lowercase();
        AgentType::PRIORITY
            .iter()
            .map(|agent| {
                let hits = agent
                    .keywords()
                    .iter()
                    .filter(|k| keyword_matches(&content, k))
                    .count();
                (*agent, hits)
            })
            .collect()
    }

    pub fn classify(text: &str) -> AgentType {
        let scores = Self::scores(text);
        let best = scores.values().copied().max().unwrap_or(0);
        if best == 0 {
            return AgentType::Conversational;
        }
        AgentType::PRIORITY
            .into_iter()
            .find(|agent| scores.get(agent).copied().unwrap_or(0) == best)
            .unwrap_or(AgentType::Conversational)
    }

    pub fn constraints(text: &str) -> ModelConstraints {
        let content = text.to_lowercase();
        ModelConstraints {
            privacy: any_cue(&content, PRIVACY_CUES),
            cost: any_cue(&content, COST_CUES),
            quality: any_cue(&content, QUALITY_CUES),
        }
    }
}

/// 路由结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteDecision {
    pub agent_type: AgentType,
    pub model: ModelProvider,
    pub constraints: ModelConstraints,
}

/// 模型路由器：约束优先级 privacy > cost > quality，其次为意图首选模型
#[derive(Debug, Clone)]
pub struct ModelRouter {
    preferred: HashMap<AgentType, ModelProvider>,
}

impl ModelRouter {
    pub fn new() -> Self {
        let preferred = HashMap::from([
            (AgentType::Conversational, ModelProvider::Default),
            (AgentType::Technical, ModelProvider::HighestQuality),
            (AgentType::Retrieval, ModelProvider::CostEfficient),
        ]);
        Self { preferred }
    }

    /// 覆盖某个意图的首选模型
    pub fn with_preferred(mut self, agent: AgentType, provider: ModelProvider) -> Self {
        self.preferred.insert(agent, provider);
        self
    }

    pub fn preferred_model(&self, agent: AgentType) -> ModelProvider {
        self.preferred
            .get(&agent)
            .copied()
            .unwrap_or(ModelProvider::Default)
    }

    pub fn select_model(&self, agent: AgentType, constraints: ModelConstraints) -> ModelProvider {
        if constraints.privacy {
            ModelProvider::PrivacyPreserving
        } else if constraints.cost {
            ModelProvider::CostEfficient
        } else if constraints.quality {
            ModelProvider::HighestQuality
        } else {
            self.preferred_model(agent)
        }
    }

    /// 对一段文本做完整路由；model_override 存在时覆盖模型选择（意图照常分类）
    pub fn route(&self, text: &str, model_override: Option<ModelProvider>) -> RouteDecision {
        let agent_type = AgentClassifier::classify(text);
        let constraints = AgentClassifier::constraints(text);
        let model = model_override.unwrap_or_else(|| self.select_model(agent_type, constraints));
        RouteDecision {
            agent_type,
            model,
            constraints,
        }
    }
}

impl Default for ModelRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_code_bug() {
        assert_eq!(
            AgentClassifier::classify("fix this bug in my code"),
            AgentType::Technical
        );
    }

    #[test]
    fn test_technical_beats_weaker_chat_match() {
        // "please" 命中闲聊，但代码类命中更多
        assert_eq!(
            AgentClassifier::classify("please refactor this function"),
            AgentType::Technical
        );
    }

    #[test]
    fn test_classify_retrieval() {
        assert_eq!(
            AgentClassifier::classify("search the web for the latest news"),
            AgentType::Retrieval
        );
    }

    #[test]
    fn test_classify_defaults_to_conversational() {
        assert_eq!(AgentClassifier::classify("zzz qqq"), AgentType::Conversational);
        assert_eq!(AgentClassifier::classify(""), AgentType::Conversational);
        assert_eq!(AgentClassifier::classify("你好"), AgentType::Conversational);
    }

    #[test]
    fn test_tie_prefers_technical() {
        // code（technical）与 search（retrieval）各命中一次
        assert_eq!(AgentClassifier::classify("code search"), AgentType::Technical);
    }

    #[test]
    fn test_hi_does_not_match_inside_words() {
        let scores = AgentClassifier::scores("this thing");
        assert_eq!(scores[&AgentType::Conversational], 0);
        let scores = AgentClassifier::scores("a high score in history");
        assert_eq!(scores[&AgentType::Conversational], 0);
        assert_eq!(AgentClassifier::scores("his hints")[&AgentType::Conversational], 0);
        assert_eq!(AgentClassifier::scores("hi")[&AgentType::Conversational], 1);
    }

    #[test]
    fn test_keywords_match_whole_words() {
        let scores = AgentClassifier::scores("the testimony about a fixture");
        assert_eq!(scores[&AgentType::Technical], 0);

        // 复数与词干
        let scores = AgentClassifier::scores("two bugs and some fixes");
        assert_eq!(scores[&AgentType::Technical], 2);
        let scores = AgentClassifier::scores("summarizing and searching");
        assert_eq!(scores[&AgentType::Retrieval], 2);
        assert!(AgentClassifier::constraints("be thoroughly accurate").quality);
        assert!(!AgentClassifier::constraints("the location of the file").privacy);
    }

    #[test]
    fn test_privacy_cue_forces_private_model() {
        let router = ModelRouter::new();
        let decision = router.route("keep this private and fix the code", None);
        assert_eq!(decision.agent_type, AgentType::Technical);
        assert_eq!(decision.model, ModelProvider::PrivacyPreserving);
    }

    #[test]
    fn test_cost_and_quality_cues() {
        let router = ModelRouter::new();
        assert_eq!(
            router.route("give me a quick answer", None).model,
            ModelProvider::CostEfficient
        );
        assert_eq!(
            router.route("write the best possible essay", None).model,
            ModelProvider::HighestQuality
        );
    }

    #[test]
    fn test_falls_back_to_preferred_model() {
        let router = ModelRouter::new();
        assert_eq!(router.route("hello there", None).model, ModelProvider::Default);
        assert_eq!(
            router.route("debug my sql", None).model,
            ModelProvider::HighestQuality
        );
        let router = router.with_preferred(AgentType::Conversational, ModelProvider::CostEfficient);
        assert_eq!(router.route("hello there", None).model, ModelProvider::CostEfficient);
    }

    #[test]
    fn test_override_wins() {
        let router = ModelRouter::new();
        let decision = router.route("keep this private", Some(ModelProvider::HighestQuality));
        assert_eq!(decision.model, ModelProvider::HighestQuality);
        assert!(decision.constraints.privacy);
    }
}
