//! Planner：编排模型的工具调用协议与系统提示词
//!
//! 协议：模型回复 `{"tool": "...", "args": {...}}` 表示调用工具，否则视为最终回复。

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::core::RuntimeState;
use crate::tools::ToolRegistry;

/// 模型请求的一次工具调用
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ToolCall {
    pub tool: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlannerOutput {
    ToolCall(ToolCall),
    Response(String),
}

/// 回复看起来是工具调用但无法解析
#[derive(Error, Debug, Clone, PartialEq)]
#[error("malformed tool call: {0}")]
pub struct MalformedToolCall(pub String);

/// 解析模型输出：```json 围栏或以 { 开头的回复按工具调用解析，其余为最终回复
pub fn parse_llm_output(output: &str) -> Result<PlannerOutput, MalformedToolCall> {
    let trimmed = output.trim();

    let json_str = if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim())
    } else if trimmed.starts_with('{') {
        match trimmed.rfind('}') {
            Some(end) => &trimmed[..=end],
            None => trimmed,
        }
    } else {
        return Ok(PlannerOutput::Response(trimmed.to_string()));
    };

    let parsed: ToolCall = serde_json::from_str(json_str)
        .map_err(|e| MalformedToolCall(format!("{e}: {json_str}")))?;

    if parsed.tool.trim().is_empty() {
        Ok(PlannerOutput::Response(trimmed.to_string()))
    } else {
        Ok(PlannerOutput::ToolCall(parsed))
    }
}

const DEFAULT_PROMPT: &str = "You are Itinera, a travel assistant that turns travel videos into \
itineraries. Work step by step: fetch the video, extract the itinerary, resolve locations, \
pick images, summarize and render the document, skipping steps the user did not ask for \
or that are already done.";

const PROTOCOL: &str = "To call a tool, reply with only a JSON object: \
{\"tool\": \"<name>\", \"args\": {...}}. Call one tool at a time and wait for its observation. \
When you are done, reply to the user in plain text without JSON.";

pub struct Planner {
    base_prompt: String,
}

impl Planner {
    pub fn new(base_prompt: impl Into<String>) -> Self {
        Self {
            base_prompt: base_prompt.into(),
        }
    }

    pub fn base_system_prompt(&self) -> &str {
        &self.base_prompt
    }

    /// 动态 system：基础提示 + 工具列表与协议 + 当前行程状态 + 滚动摘要
    pub fn system_prompt(&self, tools: &ToolRegistry, state: &RuntimeState) -> String {
        let mut system = format!(
            "{}\n\n## Tools\n{}\n\n{}\n\n## Current state\n{}",
            self.base_prompt,
            tools.tool_descriptions(),
            PROTOCOL,
            state_section(state)
        );
        if let Some(summary) = state.conversation_summary() {
            system.push_str("\n\n## Earlier conversation\n");
            system.push_str(summary);
        }
        system
    }
}

impl Default for Planner {
    fn default() -> Self {
        Self::new(DEFAULT_PROMPT)
    }
}

fn state_section(state: &RuntimeState) -> String {
    let mut lines = Vec::new();
    match state.current_source() {
        Some(src) => lines.push(format!("- video: {} ({})", src.title, src.url)),
        None => lines.push("- video: none fetched".to_string()),
    }
    let spots = state.spots();
    lines.push(format!(
        "- itinerary: {} blocks, {} spots ({} with coordinates)",
        state.blocks().len(),
        spots.len(),
        spots.iter().filter(|s| s.is_resolved()).count()
    ));
    match state.images() {
        Some(set) => lines.push(format!("- images: {} ({} images)", set.mode.as_str(), set.images.len())),
        None => lines.push("- images: none".to_string()),
    }
    if state.summary().is_some() {
        lines.push("- summary: written".to_string());
    }
    if let Some(doc) = state.document() {
        lines.push(format!("- document: version {} at {}", doc.version, doc.preview_path));
    }
    lines.join("\n")
}
