//! 回合过程事件：用于流式展示步骤、工具调用、观察与回复

use serde::Serialize;

/// 单个过程事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    /// 当前第几步
    StepUpdate { step: usize, max_steps: usize },
    /// 正在调用编排模型
    Thinking,
    /// 对话已压缩
    Compacted { dropped: usize },
    /// 主模型无法启动，改用回退模型
    FallbackModel { model: String },
    ToolCall {
        tool: String,
        args: serde_json::Value,
    },
    /// 工具返回（预览，避免过长）
    Observation { tool: String, preview: String },
    ToolFailure { tool: String, reason: String },
    /// 最终回复的一小段（流式输出）
    MessageChunk { text: String },
    MessageDone,
    /// 回合被取消
    Stopped,
    Error { text: String },
}
