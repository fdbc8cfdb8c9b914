//! 错误恢复引擎
//!
//! 根据 TaskError 类型返回 RecoveryAction，供任务执行器决定是带反馈重试、盲重试还是终止。

use crate::core::TaskError;

/// 反馈列表最多列出的校验错误条数
pub const MAX_FEEDBACK_ITEMS: usize = 12;

/// 恢复引擎给出的建议动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 把失败项注入下一次尝试的提示，让模型修正（软失败）
    RetryWithFeedback(Vec<String>),
    /// 清空已有反馈后原样重试（硬失败）
    RetryBlind,
    /// 不再重试，直接上抛
    Abort,
}

/// 语义化错误恢复：将错误映射为可执行动作
#[derive(Debug, Default)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn handle(&self, err: &TaskError) -> RecoveryAction {
        match err {
            TaskError::Validation(errors) => RecoveryAction::RetryWithFeedback(errors.clone()),
            TaskError::Transport(_) => RecoveryAction::RetryBlind,
            TaskError::Cancelled | TaskError::Configuration(_) | TaskError::Exhausted { .. } => {
                RecoveryAction::Abort
            }
        }
    }

    /// 在原提示后追加编号的失败列表与修正指令
    pub fn feedback_prompt(prompt: &str, errors: &[String]) -> String {
        if errors.is_empty() {
            return prompt.to_string();
        }
        let mut out = String::with_capacity(prompt.len() + 256);
        out.push_str(prompt);
        out.push_str("\n\nYour previous answer was rejected for these reasons:\n");
        for (i, e) in errors.iter().take(MAX_FEEDBACK_ITEMS).enumerate() {
            out.push_str(&format!("{}. {}\n", i + 1, e));
        }
        if errors.len() > MAX_FEEDBACK_ITEMS {
            out.push_str(&format!(
                "(and {} more)\n",
                errors.len() - MAX_FEEDBACK_ITEMS
            ));
        }
        out.push_str("Fix every issue listed above and answer again with the complete corrected result.");
        out
    }
}
