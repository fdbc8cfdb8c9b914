//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / DeepSeek / Mock）实现 LlmClient：complete 生成文本，
//! complete_structured 默认基于 complete 实现（schema 写入 system，回复中提取 JSON）。

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::memory::Message;

/// 后端调用错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timed out")]
    Timeout,

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("missing credentials for {0}")]
    MissingCredentials(String),

    #[error("cancelled")]
    Cancelled,
}

/// 单次生成请求的输出预算
#[derive(Debug, Clone, Copy)]
pub struct GenerationBudget {
    pub max_output_tokens: u32,
}

/// LLM 客户端 trait
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 文本生成；实现方应在 cancel 触发时尽快返回 LlmError::Cancelled
    async fn complete(
        &self,
        model_id: &str,
        messages: &[Message],
        budget: GenerationBudget,
        cancel: &CancellationToken,
    ) -> Result<String, LlmError>;

    /// 结构化生成：返回满足 schema 的 JSON 值（由调用方再做反序列化与业务校验）
    async fn complete_structured(
        &self,
        model_id: &str,
        prompt: &str,
        schema: &Value,
        budget: GenerationBudget,
        cancel: &CancellationToken,
    ) -> Result<Value, LlmError> {
        let schema_text = serde_json::to_string_pretty(schema)
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;
        let messages = [
            Message::system(format!(
                "Respond with a single JSON object that validates against this JSON Schema. \
                 Output only the JSON, no prose.\n\n{schema_text}"
            )),
            Message::user(prompt.to_string()),
        ];
        let raw = self.complete(model_id, &messages, budget, cancel).await?;
        extract_json(&raw)
    }

    /// 累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}

/// 从模型回复中提取 JSON（```json 围栏或首个 { 到末个 }）
pub fn extract_json(raw: &str) -> Result<Value, LlmError> {
    let trimmed = raw.trim();
    let candidate = if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim())
    } else if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start <= end {
            &trimmed[start..=end]
        } else {
            trimmed
        }
    } else {
        trimmed
    };
    serde_json::from_str(candidate)
        .map_err(|e| LlmError::InvalidResponse(format!("{e}: {}", preview(candidate, 120))))
}

fn preview(text: &str, max: usize) -> String {
    if text.chars().count() > max {
        format!("{}...", text.chars().take(max).collect::<String>())
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json_fenced() {
        let v = extract_json("Sure:\n```json\n{\"a\": 1}\n```").unwrap();
        assert_eq!(v["a"], 1);
    }

    #[test]
    fn test_extract_json_bare() {
        let v = extract_json("here {\"b\": [1,2]} done").unwrap();
        assert_eq!(v["b"][1], 2);
    }

    #[test]
    fn test_extract_json_invalid() {
        assert!(matches!(
            extract_json("no json here"),
            Err(LlmError::InvalidResponse(_))
        ));
    }
}
