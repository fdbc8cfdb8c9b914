//! Mock LLM 客户端（用于测试，无需 API）
//!
//! 按脚本顺序返回回复，并记录每次调用的模型与消息，便于断言重试次数与反馈提示。

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::llm::{GenerationBudget, LlmClient, LlmError};
use crate::memory::{Message, Role};

/// 单次脚本回复
#[derive(Debug, Clone)]
pub enum MockReply {
    Text(String),
    Fail(LlmError),
    /// 一直挂起直到令牌取消
    Hang,
    Delayed(Duration, String),
}

/// 一次被记录的调用
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub model_id: String,
    pub messages: Vec<Message>,
}

impl RecordedCall {
    /// 最后一条 user 消息内容（结构化任务的 prompt 即在此）
    pub fn last_user_text(&self) -> String {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.text())
            .unwrap_or_default()
    }

    pub fn system_text(&self) -> String {
        self.messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.text())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// 脚本化 Mock 客户端
#[derive(Debug, Default)]
pub struct MockLlmClient {
    replies: Mutex<VecDeque<MockReply>>,
    default_reply: Option<MockReply>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// 脚本耗尽后的默认回复
    pub fn with_default(mut self, reply: MockReply) -> Self {
        self.default_reply = Some(reply);
        self
    }

    pub fn push(&self, reply: MockReply) -> &Self {
        if let Ok(mut q) = self.replies.lock() {
            q.push_back(reply);
        }
        self
    }

    pub fn push_text(&self, text: impl Into<String>) -> &Self {
        self.push(MockReply::Text(text.into()))
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or(0)
    }

    fn next_reply(&self) -> Option<MockReply> {
        let scripted = self.replies.lock().ok().and_then(|mut q| q.pop_front());
        scripted.or_else(|| self.default_reply.clone())
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(
        &self,
        model_id: &str,
        messages: &[Message],
        _budget: GenerationBudget,
        cancel: &CancellationToken,
    ) -> Result<String, LlmError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(RecordedCall {
                model_id: model_id.to_string(),
                messages: messages.to_vec(),
            });
        }
        if cancel.is_cancelled() {
            return Err(LlmError::Cancelled);
        }

        match self.next_reply() {
            Some(MockReply::Text(text)) => Ok(text),
            Some(MockReply::Fail(err)) => Err(err),
            Some(MockReply::Hang) => {
                cancel.cancelled().await;
                Err(LlmError::Cancelled)
            }
            Some(MockReply::Delayed(delay, text)) => {
                tokio::select! {
                    _ = cancel.cancelled() => Err(LlmError::Cancelled),
                    _ = tokio::time::sleep(delay) => Ok(text),
                }
            }
            None => Err(LlmError::Transport("mock script exhausted".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn budget() -> GenerationBudget {
        GenerationBudget { max_output_tokens: 64 }
    }

    #[tokio::test]
    async fn test_scripted_order_and_recording() {
        let mock = MockLlmClient::new();
        mock.push_text("first").push(MockReply::Fail(LlmError::Timeout));
        let token = CancellationToken::new();
        let msgs = [Message::user("hi")];

        assert_eq!(mock.complete("m", &msgs, budget(), &token).await.unwrap(), "first");
        assert_eq!(
            mock.complete("m", &msgs, budget(), &token).await,
            Err(LlmError::Timeout)
        );
        assert!(mock.complete("m", &msgs, budget(), &token).await.is_err());
        assert_eq!(mock.call_count(), 3);
        assert_eq!(mock.calls()[0].last_user_text(), "hi");
    }

    #[tokio::test]
    async fn test_hang_until_cancelled() {
        let mock = MockLlmClient::new();
        mock.push(MockReply::Hang);
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });
        let res = mock.complete("m", &[Message::user("x")], budget(), &token).await;
        assert_eq!(res, Err(LlmError::Cancelled));
    }

    #[tokio::test]
    async fn test_structured_default_impl() {
        let mock = MockLlmClient::new();
        mock.push_text("```json\n{\"ok\": true}\n```");
        let token = CancellationToken::new();
        let v = mock
            .complete_structured("m", "give json", &serde_json::json!({"type": "object"}), budget(), &token)
            .await
            .unwrap();
        assert_eq!(v["ok"], true);
        assert!(mock.calls()[0].system_text().contains("JSON Schema"));
    }
}
