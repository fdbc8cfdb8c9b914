//! 错误分类与各层错误类型
//!
//! TaskError 对应执行器的五类失败：Validation / Transport 可在策略内吸收，
//! Cancelled 是控制流退出，Configuration 直接上抛，Exhausted 表示候选与重试均已耗尽。

use thiserror::Error;

use crate::llm::{LlmError, TaskName};

/// 单个逻辑任务（结构化 / 文本）执行失败
#[derive(Error, Debug, Clone)]
pub enum TaskError {
    /// Schema 或业务规则校验失败（可带反馈重试）
    #[error("validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    /// 提供方 / 网络 / 超时 / 解析库错误（盲重试后切换候选）
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("cancelled")]
    Cancelled,

    /// 缺少必需的外部配置（如凭据），不重试
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("task {task} exhausted after {attempts} attempts: {last}")]
    Exhausted {
        task: TaskName,
        attempts: u32,
        last: Box<TaskError>,
    },
}

impl TaskError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TaskError::Cancelled)
    }
}

impl From<LlmError> for TaskError {
    fn from(err: LlmError) -> Self {
        match err {
            LlmError::Cancelled => TaskError::Cancelled,
            LlmError::MissingCredentials(provider) => {
                TaskError::Configuration(format!("no credentials for provider '{provider}'"))
            }
            other => TaskError::Transport(other.to_string()),
        }
    }
}

/// 会话存储 / 步骤账本错误
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("session {0} not found")]
    SessionNotFound(String),

    #[error("session {session_id} is not owned by {owner_id}")]
    NotOwner { session_id: String, owner_id: String },

    #[error("step {0} not found")]
    StepNotFound(String),

    /// 账本条目只允许从 running 迁移一次
    #[error("step {0} already reached a terminal state")]
    AlreadyTerminal(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(String),
}

/// Step Envelope 的执行结果错误：取消与失败必须可区分
#[derive(Error, Debug)]
pub enum StepError {
    #[error("step {tool} cancelled")]
    Cancelled { tool: String },

    #[error("step {tool} failed: {message}")]
    Failed {
        tool: String,
        message: String,
        /// 配置类故障，编排循环应终止而非把错误回填给模型
        fatal: bool,
    },

    #[error("step {tool} could not be recorded: {source}")]
    Store {
        tool: String,
        #[source]
        source: StoreError,
    },
}

impl StepError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, StepError::Cancelled { .. })
    }
}

/// 编排入口的终止错误
#[derive(Error, Debug)]
pub enum TurnError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("turn cancelled")]
    Cancelled,

    #[error("model error: {0}")]
    Task(#[from] TaskError),

    #[error(transparent)]
    Step(#[from] StepError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl TurnError {
    /// 面向客户端的简短描述，不暴露内部细节
    pub fn user_message(&self) -> String {
        match self {
            TurnError::InvalidRequest(reason) => format!("The request could not be read: {reason}"),
            TurnError::Cancelled => "Stopped.".to_string(),
            TurnError::Task(TaskError::Configuration(_)) => {
                "The assistant is not configured correctly. Please try again later.".to_string()
            }
            TurnError::Task(TaskError::Exhausted { .. }) | TurnError::Task(TaskError::Transport(_)) => {
                "The model service is unavailable right now. Please try again.".to_string()
            }
            TurnError::Task(_) => "The assistant could not complete this request.".to_string(),
            TurnError::Step(StepError::Cancelled { .. }) => "Stopped.".to_string(),
            TurnError::Step(StepError::Failed { tool, .. }) | TurnError::Step(StepError::Store { tool, .. }) => {
                format!("The {tool} step failed. Progress so far has been saved.")
            }
            TurnError::Store(_) => "Session data could not be loaded or saved.".to_string(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        match self {
            TurnError::Cancelled => true,
            TurnError::Task(e) => e.is_cancelled(),
            TurnError::Step(e) => e.is_cancelled(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_llm_error_mapping() {
        assert!(matches!(TaskError::from(LlmError::Cancelled), TaskError::Cancelled));
        assert!(matches!(
            TaskError::from(LlmError::MissingCredentials("openai".into())),
            TaskError::Configuration(_)
        ));
        assert!(matches!(
            TaskError::from(LlmError::Transport("503".into())),
            TaskError::Transport(_)
        ));
    }

    #[test]
    fn test_exhausted_names_task_and_cause() {
        let err = TaskError::Exhausted {
            task: TaskName::ExtractItinerary,
            attempts: 4,
            last: Box::new(TaskError::Transport("connection reset".into())),
        };
        let text = err.to_string();
        assert!(text.contains("extract_itinerary"));
        assert!(text.contains("connection reset"));
    }

    #[test]
    fn test_user_message_hides_detail() {
        let err = TurnError::Task(TaskError::Transport("secret upstream stack".into()));
        assert!(!err.user_message().contains("secret"));
        assert!(TurnError::Step(StepError::Cancelled { tool: "x".into() }).is_cancelled());
    }
}
