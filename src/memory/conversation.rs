//! 对话消息模型
//!
//! 消息含角色、纯文本内容，以及可选的结构化片段（工具调用及其输出），
//! 压缩策略依据这些片段生成紧凑的一行摘要。

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Tool => "tool",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 工具调用在对话中的状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallState {
    Pending,
    Completed,
    Error,
    Cancelled,
}

impl ToolCallState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolCallState::Pending => "pending",
            ToolCallState::Completed => "completed",
            ToolCallState::Error => "error",
            ToolCallState::Cancelled => "cancelled",
        }
    }
}

/// 消息中的结构化片段
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePart {
    Text {
        text: String,
    },
    ToolCall {
        tool_name: String,
        state: ToolCallState,
        #[serde(default)]
        input: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<Value>,
    },
}

/// 单条消息
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parts: Vec<MessagePart>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            parts: Vec::new(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn with_part(mut self, part: MessagePart) -> Self {
        self.parts.push(part);
        self
    }

    /// 纯文本：content 与所有 Text 片段拼接
    pub fn text(&self) -> String {
        let mut out = self.content.clone();
        for part in &self.parts {
            if let MessagePart::Text { text } = part {
                if !out.is_empty() {
                    out.push('\n');
                }
                out.push_str(text);
            }
        }
        out
    }

    /// 是否没有任何可用内容
    pub fn is_blank(&self) -> bool {
        self.content.trim().is_empty()
            && self.parts.iter().all(|p| match p {
                MessagePart::Text { text } => text.trim().is_empty(),
                MessagePart::ToolCall { .. } => false,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_text_joins_parts() {
        let msg = Message::assistant("hello").with_part(MessagePart::Text {
            text: "world".into(),
        });
        assert_eq!(msg.text(), "hello\nworld");
    }

    #[test]
    fn test_blank_detection() {
        assert!(Message::user("   ").is_blank());
        let with_tool = Message::assistant("").with_part(MessagePart::ToolCall {
            tool_name: "fetch_video".into(),
            state: ToolCallState::Completed,
            input: Value::Null,
            output: None,
        });
        assert!(!with_tool.is_blank());
    }

    #[test]
    fn test_parts_deserialize() {
        let raw = r#"{"role":"assistant","parts":[{"type":"tool_call","tool_name":"render_document","state":"error"}]}"#;
        let msg: Message = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.role, Role::Assistant);
        assert!(matches!(
            &msg.parts[0],
            MessagePart::ToolCall { state: ToolCallState::Error, .. }
        ));
    }
}
