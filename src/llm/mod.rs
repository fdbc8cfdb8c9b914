//! LLM 层：客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）、任务路由与任务执行器

pub mod backends;
pub mod deepseek;
pub mod executor;
pub mod mock;
pub mod openai;
pub mod router;
pub mod traits;

pub use backends::LlmBackends;
pub use deepseek::{create_deepseek_client, DEEPSEEK_BASE_URL, DEEPSEEK_CHAT, DEEPSEEK_REASONER};
pub use executor::{TaskExecutor, TaskOutcome, TextRequest, Validator};
pub use mock::{MockLlmClient, MockReply, RecordedCall};
pub use openai::{OpenAiClient, TokenUsage};
pub use router::{
    ModelCandidate, ModelTaskRouter, StabilityTier, TaskName, TaskPolicy, TaskRoute,
    ValidationPolicy,
};
pub use traits::{extract_json, GenerationBudget, LlmClient, LlmError};
