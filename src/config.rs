//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `ITINERA__*` 覆盖（双下划线表示嵌套，
//! 如 `ITINERA__TASKS__EXTRACT_ITINERARY__MAX_RETRIES=3`）。所有键都有固定默认值。

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;

use crate::core::state::ImagePrecedence;

/// 应用配置根
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub llm: LlmSection,
    /// 任务名（snake_case）到覆盖项
    pub tasks: HashMap<String, TaskOverride>,
    pub compaction: CompactionSection,
    pub orchestrator: OrchestratorSection,
    pub providers: ProvidersSection,
    pub store: StoreSection,
}

/// [llm] 段：各提供方端点；API Key 只从环境变量读取
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct LlmSection {
    pub openai_base_url: Option<String>,
    pub deepseek_base_url: Option<String>,
}

/// [tasks.<name>] 段：单个任务的模型与策略覆盖
///
/// `model` / `fallback` 形如 `openai:gpt-4.1-mini`；`fallback = "none"` 关闭回退。
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct TaskOverride {
    pub model: Option<String>,
    pub fallback: Option<String>,
    pub max_output_tokens: Option<u32>,
    pub timeout_ms: Option<u64>,
    pub max_retries: Option<u32>,
}

/// [compaction] 段：两个压缩档位的阈值覆盖
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct CompactionSection {
    pub standard: CompactionOverride,
    pub aggressive: CompactionOverride,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct CompactionOverride {
    pub recent_message_count: Option<usize>,
    pub summary_max_chars: Option<usize>,
    pub digest_max_chars: Option<usize>,
    pub trigger_chars: Option<usize>,
    pub max_message_chars: Option<usize>,
}

/// [orchestrator] 段：步数上限、工具超时、并发分支数、图片集优先级
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorSection {
    pub max_steps: usize,
    pub tool_timeout_secs: u64,
    pub max_concurrent_branches: usize,
    pub image_precedence: ImagePrecedence,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            max_steps: 12,
            tool_timeout_secs: 180,
            max_concurrent_branches: 4,
            image_precedence: ImagePrecedence::default(),
        }
    }
}

/// [providers] 段：视频元数据、地理编码、图库搜索、图片生成
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProvidersSection {
    pub request_timeout_secs: u64,
    pub oembed_url: String,
    pub geocoder_url: String,
    pub geocoder_user_agent: String,
    pub unsplash_url: String,
    pub unsplash_access_key: Option<String>,
    pub image_base_url: String,
    pub image_model: String,
    pub image_api_key: Option<String>,
}

impl Default for ProvidersSection {
    fn default() -> Self {
        Self {
            request_timeout_secs: 20,
            oembed_url: "https://www.youtube.com/oembed".to_string(),
            geocoder_url: "https://nominatim.openstreetmap.org/search".to_string(),
            geocoder_user_agent: "itinera/0.1".to_string(),
            unsplash_url: "https://api.unsplash.com/search/photos".to_string(),
            unsplash_access_key: None,
            image_base_url: "https://api.openai.com/v1".to_string(),
            image_model: "gpt-image-1".to_string(),
            image_api_key: None,
        }
    }
}

/// [store] 段：SQLite 路径（需启用 async-sqlite feature）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct StoreSection {
    pub sqlite_path: Option<PathBuf>,
}

impl AppConfig {
    pub fn task_override(&self, task: &str) -> Option<&TaskOverride> {
        self.tasks.get(task)
    }
}

/// 从 config 目录加载配置，环境变量 ITINERA__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 ITINERA__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    for name in ["config/default", "../config/default"] {
        if std::path::Path::new(&format!("{name}.toml")).exists() {
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
        config::Environment::with_prefix("ITINERA")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}
