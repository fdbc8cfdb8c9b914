//! 对话压缩策略
//!
//! 消息数超过 `recent_message_count` 或序列化体积超过 `trigger_chars` 时触发：
//! 较早的消息压成有界摘要行（digest），交给 CompactConversation 任务更新滚动摘要；
//! 模型失败时用本地确定性拼接兜底。保留段每条消息压成一条纯文本消息。

use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::config::{CompactionOverride, CompactionSection};
use crate::llm::{TaskExecutor, TaskName, TextRequest};
use crate::memory::{Message, MessagePart};

/// 工具输出中允许进入摘要的字段
const OUTPUT_FIELDS: &[&str] = &[
    "id", "title", "url", "name", "status", "mode", "count", "version", "preview_path",
    "summary", "error", "message", "day", "place", "resolved", "unresolved",
];

/// 工具输出中的长字符串截断长度
const MAX_FIELD_CHARS: usize = 180;

/// 压缩档位
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompactionMode {
    #[default]
    Standard,
    Aggressive,
}

/// 压缩阈值
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionPolicy {
    pub recent_message_count: usize,
    pub summary_max_chars: usize,
    pub digest_max_chars: usize,
    pub trigger_chars: usize,
    pub max_message_chars: usize,
}

impl CompactionPolicy {
    pub const STANDARD: CompactionPolicy = CompactionPolicy {
        recent_message_count: 12,
        summary_max_chars: 2400,
        digest_max_chars: 6000,
        trigger_chars: 48_000,
        max_message_chars: 4000,
    };

    pub const AGGRESSIVE: CompactionPolicy = CompactionPolicy {
        recent_message_count: 6,
        summary_max_chars: 1600,
        digest_max_chars: 3000,
        trigger_chars: 24_000,
        max_message_chars: 1500,
    };

    fn with_override(mut self, o: &CompactionOverride) -> Self {
        if let Some(v) = o.recent_message_count {
            self.recent_message_count = v;
        }
        if let Some(v) = o.summary_max_chars {
            self.summary_max_chars = v;
        }
        if let Some(v) = o.digest_max_chars {
            self.digest_max_chars = v;
        }
        if let Some(v) = o.trigger_chars {
            self.trigger_chars = v;
        }
        if let Some(v) = o.max_message_chars {
            self.max_message_chars = v;
        }
        self
    }
}

/// 压缩结果
#[derive(Debug, Clone, PartialEq)]
pub struct CompactionResult {
    pub kept_messages: Vec<Message>,
    pub summary: String,
    pub was_compacted: bool,
    pub dropped_count: usize,
}

/// 对话压缩器
pub struct ConversationCompactor {
    executor: Arc<TaskExecutor>,
    standard: CompactionPolicy,
    aggressive: CompactionPolicy,
}

impl ConversationCompactor {
    pub fn new(executor: Arc<TaskExecutor>) -> Self {
        Self {
            executor,
            standard: CompactionPolicy::STANDARD,
            aggressive: CompactionPolicy::AGGRESSIVE,
        }
    }

    /// 内置档位叠加 `[compaction.*]` 覆盖
    pub fn from_config(executor: Arc<TaskExecutor>, cfg: &CompactionSection) -> Self {
        Self {
            executor,
            standard: CompactionPolicy::STANDARD.with_override(&cfg.standard),
            aggressive: CompactionPolicy::AGGRESSIVE.with_override(&cfg.aggressive),
        }
    }

    pub fn with_policy(mut self, mode: CompactionMode, policy: CompactionPolicy) -> Self {
        match mode {
            CompactionMode::Standard => self.standard = policy,
            CompactionMode::Aggressive => self.aggressive = policy,
        }
        self
    }

    pub fn policy(&self, mode: CompactionMode) -> CompactionPolicy {
        match mode {
            CompactionMode::Standard => self.standard,
            CompactionMode::Aggressive => self.aggressive,
        }
    }

    /// 压缩对话；不会失败（模型失败走本地兜底）
    pub async fn compact(
        &self,
        messages: &[Message],
        previous_summary: Option<&str>,
        mode: CompactionMode,
        cancel: &CancellationToken,
    ) -> CompactionResult {
        let policy = self.policy(mode);
        let previous = previous_summary.unwrap_or_default();

        if !should_compact(messages, &policy) {
            return CompactionResult {
                kept_messages: messages.to_vec(),
                summary: sanitize_summary(previous, policy.summary_max_chars),
                was_compacted: false,
                dropped_count: 0,
            };
        }

        let split = messages.len().saturating_sub(policy.recent_message_count);
        let (older, recent) = messages.split_at(split);
        let kept_segment = if recent.is_empty() { messages } else { recent };

        let summary = if older.is_empty() {
            sanitize_summary(previous, policy.summary_max_chars)
        } else {
            let digest = build_digest(older, policy.digest_max_chars, policy.max_message_chars);
            self.update_summary(previous, &digest, &policy, cancel).await
        };

        let kept: Vec<Message> = kept_segment
            .iter()
            .map(|m| Message::new(m.role, message_line(m, policy.max_message_chars)))
            .filter(|m| !m.is_blank())
            .collect();

        if kept.is_empty() {
            tracing::warn!("Compaction produced no usable messages; keeping original history");
            return CompactionResult {
                kept_messages: messages.to_vec(),
                summary,
                was_compacted: false,
                dropped_count: 0,
            };
        }

        tracing::info!(
            mode = ?mode,
            dropped = older.len(),
            kept = kept.len(),
            summary_chars = summary.chars().count(),
            "Conversation compacted"
        );
        CompactionResult {
            kept_messages: kept,
            summary,
            was_compacted: true,
            dropped_count: older.len(),
        }
    }

    async fn update_summary(
        &self,
        previous: &str,
        digest: &str,
        policy: &CompactionPolicy,
        cancel: &CancellationToken,
    ) -> String {
        let prompt = format!(
            "Update the running memory of this trip-planning conversation.\n\n\
             Current memory:\n{}\n\nNew activity:\n{}\n\n\
             Reply with concise bullet points (\"- \"), at most {} characters in total. \
             Keep decisions, places, dates and open requests; drop chatter.",
            if previous.trim().is_empty() { "(none)" } else { previous.trim() },
            digest,
            policy.summary_max_chars
        );
        let request = TextRequest::new(prompt)
            .with_system("You maintain a compact memory of a conversation. Never invent facts.");

        match self
            .executor
            .run_text(TaskName::CompactConversation, &request, cancel)
            .await
        {
            Ok(outcome) => {
                let summary = sanitize_summary(&outcome.result, policy.summary_max_chars);
                if summary.is_empty() {
                    fallback_summary(previous, digest, policy.summary_max_chars)
                } else {
                    summary
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Summary update failed; using local fallback");
                fallback_summary(previous, digest, policy.summary_max_chars)
            }
        }
    }
}

/// 消息数或估算体积超限
pub fn should_compact(messages: &[Message], policy: &CompactionPolicy) -> bool {
    messages.len() > policy.recent_message_count
        || estimate_chars(messages) > policy.trigger_chars
}

/// 序列化后的字符数估算
pub fn estimate_chars(messages: &[Message]) -> usize {
    messages
        .iter()
        .map(|m| {
            serde_json::to_string(m)
                .map(|s| s.chars().count())
                .unwrap_or_else(|_| m.text().chars().count())
        })
        .sum()
}

/// 较早消息的有界摘要：逐行贪心累加，放不下就停止，已收入的行不截断
pub fn build_digest(messages: &[Message], max_chars: usize, max_line_chars: usize) -> String {
    let mut digest = String::new();
    let mut used = 0usize;
    for message in messages {
        let line = format!("{}: {}", message.role, message_line(message, max_line_chars));
        let cost = line.chars().count() + usize::from(used > 0);
        if used + cost > max_chars {
            break;
        }
        if used > 0 {
            digest.push('\n');
        }
        digest.push_str(&line);
        used += cost;
    }
    digest
}

/// 单条消息压成一行：文本扁平化，工具片段输出为 `[tool <name> state=<state>]` 加白名单字段
fn message_line(message: &Message, max_chars: usize) -> String {
    let mut segments: Vec<String> = Vec::new();
    let text = flatten(&message.text());
    if !text.is_empty() {
        segments.push(text);
    }
    for part in &message.parts {
        if let MessagePart::ToolCall {
            tool_name,
            state,
            output,
            ..
        } = part
        {
            let mut seg = format!("[tool {} state={}]", tool_name, state.as_str());
            if let Some(out) = output {
                let rendered = render_output(out);
                if !rendered.is_empty() {
                    seg.push(' ');
                    seg.push_str(&rendered);
                }
            }
            segments.push(seg);
        }
    }
    truncate_chars(&segments.join(" "), max_chars)
}

fn render_output(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let fields: Vec<String> = map
                .iter()
                .filter(|(k, _)| OUTPUT_FIELDS.contains(&k.as_str()))
                .map(|(k, v)| format!("{k}={}", render_value(v)))
                .collect();
            if fields.is_empty() {
                render_value(value)
            } else {
                fields.join(" ")
            }
        }
        other => render_value(other),
    }
}

fn render_value(value: &Value) -> String {
    match value {
        Value::Array(items) => format!("[array length={}]", items.len()),
        Value::Object(map) => {
            let keys: Vec<&str> = map.keys().map(String::as_str).collect();
            format!("[object keys={}]", keys.join(","))
        }
        Value::String(s) => truncate_chars(&flatten(s), MAX_FIELD_CHARS),
        other => other.to_string(),
    }
}

fn flatten(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// 按字符截断，超出时以 "..." 结尾
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    if max_chars <= 3 {
        return text.chars().take(max_chars).collect();
    }
    let mut out: String = text.chars().take(max_chars - 3).collect();
    out.push_str("...");
    out
}

static FENCE_RE: OnceLock<Option<Regex>> = OnceLock::new();

/// 去掉代码围栏并限制长度；对已清洗的文本再次调用结果不变
pub fn sanitize_summary(summary: &str, max_chars: usize) -> String {
    let re = FENCE_RE.get_or_init(|| Regex::new(r"```[A-Za-z0-9_-]*").ok());
    let stripped = match re {
        Some(re) => re.replace_all(summary, "").into_owned(),
        None => summary.replace("```", ""),
    };
    truncate_chars(stripped.trim(), max_chars).trim().to_string()
}

/// 本地确定性兜底：旧摘要与 digest 各截一段，固定标签拼接
pub fn fallback_summary(previous: &str, digest: &str, max_chars: usize) -> String {
    let previous = sanitize_summary(previous, max_chars / 2);
    let mut out = String::new();
    if !previous.is_empty() {
        out.push_str("Earlier summary:\n");
        out.push_str(&previous);
        out.push_str("\n\n");
    }
    let header = "Recent activity:\n";
    let remaining = max_chars
        .saturating_sub(out.chars().count())
        .saturating_sub(header.chars().count());
    if remaining > 0 && !digest.trim().is_empty() {
        out.push_str(header);
        out.push_str(&truncate_chars(digest.trim(), remaining));
    }
    sanitize_summary(&out, max_chars)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmBackends, LlmError, MockLlmClient, MockReply, ModelTaskRouter};
    use crate::memory::{Role, ToolCallState};
    use serde_json::json;

    fn compactor(mock: Arc<MockLlmClient>) -> ConversationCompactor {
        let router = ModelTaskRouter::defaults().with_provider("mock");
        let backends = LlmBackends::new().with("mock", mock);
        ConversationCompactor::new(Arc::new(TaskExecutor::new(Arc::new(router), Arc::new(backends))))
    }

    fn history(n: usize) -> Vec<Message> {
        (0..n)
            .map(|i| {
                if i % 2 == 0 {
                    Message::user(format!("question {i}"))
                } else {
                    Message::assistant(format!("answer {i}"))
                }
            })
            .collect()
    }

    #[tokio::test]
    async fn test_below_threshold_is_idempotent() {
        let mock = Arc::new(MockLlmClient::new());
        let c = compactor(mock.clone());
        let msgs = history(4);
        let token = CancellationToken::new();
        let first = c
            .compact(&msgs, Some("```\n- likes ramen\n```"), CompactionMode::Standard, &token)
            .await;
        assert!(!first.was_compacted);
        assert_eq!(first.summary, "- likes ramen");
        let second = c
            .compact(&first.kept_messages, Some(&first.summary), CompactionMode::Standard, &token)
            .await;
        assert!(!second.was_compacted);
        assert_eq!(second.summary, first.summary);
        assert_eq!(second.kept_messages, msgs);
        assert_eq!(mock.call_count(), 0);
    }

    #[test]
    fn test_digest_is_greedy_without_partial_lines() {
        // "user: " + 24 字符 = 30 字符一行
        let msgs: Vec<Message> = (0..5).map(|i| Message::user(format!("{i}{}", "x".repeat(23)))).collect();
        let digest = build_digest(&msgs, 100, 4000);
        let lines: Vec<&str> = digest.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines.iter().all(|l| l.chars().count() == 30));
        assert!(lines[2].starts_with("user: 2"));
    }

    #[test]
    fn test_tool_parts_are_compacted() {
        let big: Vec<Value> = (0..500).map(|i| json!({"n": i})).collect();
        let msg = Message::assistant("done").with_part(MessagePart::ToolCall {
            tool_name: "extract_itinerary".into(),
            state: ToolCallState::Completed,
            input: json!({}),
            output: Some(json!({
                "count": 12,
                "blocks": big,
                "title": "y".repeat(400),
                "nested": {"a": 1, "b": 2},
            })),
        });
        let line = message_line(&msg, 4000);
        assert!(line.contains("[tool extract_itinerary state=completed]"));
        assert!(line.contains("count=12"));
        assert!(!line.contains("blocks"));
        assert!(!line.contains("nested"));
        assert!(line.len() < 400);

        let array_out = Message::assistant("").with_part(MessagePart::ToolCall {
            tool_name: "search_images".into(),
            state: ToolCallState::Completed,
            input: json!({}),
            output: Some(json!([1, 2, 3])),
        });
        assert!(message_line(&array_out, 4000).contains("[array length=3]"));
        assert_eq!(render_value(&json!({"a": 1, "b": 2})), "[object keys=a,b]");
    }

    #[tokio::test]
    async fn test_compaction_calls_model_and_keeps_recent() {
        let mock = Arc::new(MockLlmClient::new());
        mock.push_text("- wants a 3 day Kyoto trip");
        let c = compactor(mock.clone());
        let msgs = history(20);
        let result = c
            .compact(&msgs, Some("- prefers trains"), CompactionMode::Aggressive, &CancellationToken::new())
            .await;
        assert!(result.was_compacted);
        assert_eq!(result.dropped_count, 14);
        assert_eq!(result.kept_messages.len(), 6);
        assert_eq!(result.kept_messages[0].role, Role::User);
        assert_eq!(result.summary, "- wants a 3 day Kyoto trip");
        let prompt = mock.calls()[0].last_user_text();
        assert!(prompt.contains("- prefers trains"));
        assert!(prompt.contains("user: question 0"));
    }

    #[tokio::test]
    async fn test_model_failure_uses_fallback() {
        let mock = Arc::new(
            MockLlmClient::new().with_default(MockReply::Fail(LlmError::Transport("down".into()))),
        );
        let c = compactor(mock);
        let result = c
            .compact(&history(20), Some("- prefers trains"), CompactionMode::Standard, &CancellationToken::new())
            .await;
        assert!(result.was_compacted);
        assert!(result.summary.starts_with("Earlier summary:\n- prefers trains"));
        assert!(result.summary.contains("Recent activity:\nuser: question 0"));
        assert!(result.summary.chars().count() <= CompactionPolicy::STANDARD.summary_max_chars);
    }

    #[tokio::test]
    async fn test_size_trigger_with_empty_older_segment_skips_model() {
        let mock = Arc::new(MockLlmClient::new());
        let c = compactor(mock.clone()).with_policy(
            CompactionMode::Standard,
            CompactionPolicy {
                trigger_chars: 50,
                max_message_chars: 20,
                ..CompactionPolicy::STANDARD
            },
        );
        let msgs = vec![Message::user("a".repeat(200))];
        let result = c
            .compact(&msgs, Some("- old"), CompactionMode::Standard, &CancellationToken::new())
            .await;
        assert!(result.was_compacted);
        assert_eq!(result.dropped_count, 0);
        assert_eq!(result.summary, "- old");
        assert_eq!(result.kept_messages[0].content.chars().count(), 20);
        assert_eq!(mock.call_count(), 0);
    }

    #[tokio::test]
    async fn test_blank_kept_segment_returns_original() {
        let c = compactor(Arc::new(MockLlmClient::new())).with_policy(
            CompactionMode::Standard,
            CompactionPolicy {
                trigger_chars: 10,
                ..CompactionPolicy::STANDARD
            },
        );
        let msgs = vec![Message::user("   "), Message::assistant("          \n   ")];
        let result = c
            .compact(&msgs, None, CompactionMode::Standard, &CancellationToken::new())
            .await;
        assert_eq!(result.kept_messages, msgs);
        assert!(!result.kept_messages.is_empty());
    }

    #[test]
    fn test_fallback_respects_cap() {
        let out = fallback_summary(&"p".repeat(5000), &"d".repeat(5000), 300);
        assert!(out.chars().count() <= 300);
        assert!(out.contains("Recent activity:"));
    }
}
