//! 模型任务路由器
//!
//! 逻辑任务名 -> 有序候选模型（主 + 可选回退）与任务策略（输出预算、超时、重试次数、校验级别）。
//! 路由表是静态配置（可由 `[tasks.<name>]` / 环境变量覆盖）上的纯函数；
//! 每个 TaskName 在构造时都有路由，因此 resolve 不存在运行期失败。

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{AppConfig, TaskOverride};
use crate::llm::deepseek::DEEPSEEK_CHAT;

/// 逻辑任务
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskName {
    /// 驱动多步工具调用的编排模型
    Orchestrate,
    /// 从视频元数据抽取行程块（结构化 + 业务规则）
    ExtractItinerary,
    /// 为图片生成撰写提示词（结构化）
    ImagePrompts,
    /// 行程总结（文本）
    SummarizeTrip,
    /// 对话压缩摘要（文本）
    CompactConversation,
}

impl TaskName {
    pub const ALL: [TaskName; 5] = [
        TaskName::Orchestrate,
        TaskName::ExtractItinerary,
        TaskName::ImagePrompts,
        TaskName::SummarizeTrip,
        TaskName::CompactConversation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskName::Orchestrate => "orchestrate",
            TaskName::ExtractItinerary => "extract_itinerary",
            TaskName::ImagePrompts => "image_prompts",
            TaskName::SummarizeTrip => "summarize_trip",
            TaskName::CompactConversation => "compact_conversation",
        }
    }

    fn index(&self) -> usize {
        match self {
            TaskName::Orchestrate => 0,
            TaskName::ExtractItinerary => 1,
            TaskName::ImagePrompts => 2,
            TaskName::SummarizeTrip => 3,
            TaskName::CompactConversation => 4,
        }
    }
}

impl fmt::Display for TaskName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 模型稳定性分级
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StabilityTier {
    Stable,
    Preview,
    Experimental,
}

/// 结果校验级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationPolicy {
    None,
    SchemaOnly,
    SchemaAndBusinessRules,
}

/// 一个具体的模型后端选项
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelCandidate {
    pub provider: String,
    pub model_id: String,
    pub label: String,
    pub stability_tier: StabilityTier,
}

impl ModelCandidate {
    pub fn new(provider: &str, model_id: &str, stability_tier: StabilityTier) -> Self {
        Self {
            provider: provider.to_string(),
            model_id: model_id.to_string(),
            label: format!("{provider}/{model_id}"),
            stability_tier,
        }
    }

    /// 解析 `provider:model_id`；格式不对返回 None
    pub fn parse(spec: &str, stability_tier: StabilityTier) -> Option<Self> {
        let (provider, model_id) = spec.trim().split_once(':')?;
        let (provider, model_id) = (provider.trim(), model_id.trim());
        if provider.is_empty() || model_id.is_empty() {
            return None;
        }
        Some(Self::new(provider, model_id, stability_tier))
    }
}

/// 单个任务的执行策略
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskPolicy {
    pub max_output_tokens: u32,
    pub timeout: Duration,
    pub max_retries: u32,
    pub validation: ValidationPolicy,
    pub stability_tier: StabilityTier,
}

/// resolve 的结果：主候选、可选回退、策略
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRoute {
    pub task: TaskName,
    pub primary: ModelCandidate,
    pub fallback: Option<ModelCandidate>,
    pub policy: TaskPolicy,
}

impl TaskRoute {
    /// 按路由顺序的候选链
    pub fn candidates(&self) -> Vec<ModelCandidate> {
        std::iter::once(self.primary.clone())
            .chain(self.fallback.clone())
            .collect()
    }

    fn apply_override(&mut self, o: &TaskOverride) {
        if let Some(model) = o.model.as_deref() {
            match ModelCandidate::parse(model, self.policy.stability_tier) {
                Some(c) => self.primary = c,
                None => tracing::warn!(task = %self.task, model, "Ignoring malformed model override"),
            }
        }
        if let Some(fallback) = o.fallback.as_deref() {
            if fallback.trim().eq_ignore_ascii_case("none") || fallback.trim().is_empty() {
                self.fallback = None;
            } else {
                match ModelCandidate::parse(fallback, self.policy.stability_tier) {
                    Some(c) => self.fallback = Some(c),
                    None => tracing::warn!(task = %self.task, fallback, "Ignoring malformed fallback override"),
                }
            }
        }
        if let Some(v) = o.max_output_tokens {
            self.policy.max_output_tokens = v;
        }
        if let Some(ms) = o.timeout_ms {
            self.policy.timeout = Duration::from_millis(ms);
        }
        if let Some(v) = o.max_retries {
            self.policy.max_retries = v;
        }
    }
}

/// 模型任务路由器
#[derive(Debug, Clone)]
pub struct ModelTaskRouter {
    /// 以 TaskName::index 为下标，覆盖全部任务
    routes: [TaskRoute; 5],
}

impl ModelTaskRouter {
    /// 内置默认路由表
    pub fn defaults() -> Self {
        let stable = |model: &str| ModelCandidate::new("openai", model, StabilityTier::Stable);
        let deepseek = || Some(ModelCandidate::new("deepseek", DEEPSEEK_CHAT, StabilityTier::Stable));
        let policy = |tokens: u32, timeout_ms: u64, retries: u32, validation| TaskPolicy {
            max_output_tokens: tokens,
            timeout: Duration::from_millis(timeout_ms),
            max_retries: retries,
            validation,
            stability_tier: StabilityTier::Stable,
        };

        Self {
            routes: [
                TaskRoute {
                    task: TaskName::Orchestrate,
                    primary: stable("gpt-4.1"),
                    fallback: deepseek(),
                    policy: policy(2048, 60_000, 1, ValidationPolicy::None),
                },
                TaskRoute {
                    task: TaskName::ExtractItinerary,
                    primary: stable("gpt-4.1-mini"),
                    fallback: deepseek(),
                    policy: policy(4096, 90_000, 2, ValidationPolicy::SchemaAndBusinessRules),
                },
                TaskRoute {
                    task: TaskName::ImagePrompts,
                    primary: stable("gpt-4.1-mini"),
                    fallback: deepseek(),
                    policy: policy(1024, 45_000, 1, ValidationPolicy::SchemaOnly),
                },
                TaskRoute {
                    task: TaskName::SummarizeTrip,
                    primary: stable("gpt-4.1-mini"),
                    fallback: deepseek(),
                    policy: policy(800, 45_000, 1, ValidationPolicy::None),
                },
                TaskRoute {
                    task: TaskName::CompactConversation,
                    primary: stable("gpt-4.1-nano"),
                    fallback: deepseek(),
                    policy: policy(800, 30_000, 0, ValidationPolicy::None),
                },
            ],
        }
    }

    /// 默认表叠加 `[tasks.<name>]` 覆盖
    pub fn from_config(cfg: &AppConfig) -> Self {
        let mut router = Self::defaults();
        for task in TaskName::ALL {
            if let Some(o) = cfg.task_override(task.as_str()) {
                router.routes[task.index()].apply_override(o);
            }
        }
        router
    }

    /// 替换某任务的整条路由（测试与嵌入方使用）
    pub fn with_route(mut self, route: TaskRoute) -> Self {
        let idx = route.task.index();
        self.routes[idx] = route;
        self
    }

    /// 只改某任务的策略
    pub fn with_policy(mut self, task: TaskName, policy: TaskPolicy) -> Self {
        self.routes[task.index()].policy = policy;
        self
    }

    /// 把所有任务的候选改写到同一提供方（测试中常用 "mock"）
    pub fn with_provider(mut self, provider: &str) -> Self {
        for route in self.routes.iter_mut() {
            route.primary = ModelCandidate::new(provider, &route.primary.model_id, route.primary.stability_tier);
            route.fallback = route
                .fallback
                .as_ref()
                .map(|f| ModelCandidate::new(provider, &f.model_id, f.stability_tier));
        }
        self
    }

    pub fn resolve(&self, task: TaskName) -> &TaskRoute {
        &self.routes[task.index()]
    }
}

impl Default for ModelTaskRouter {
    fn default() -> Self {
        Self::defaults()
    }
}
