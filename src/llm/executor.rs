//! 结构化 / 文本任务执行器
//!
//! 外层按路由顺序遍历候选，内层对每个候选最多尝试 `max_retries + 1` 次：
//! - 业务规则校验失败是软失败，下一次尝试的提示会附上编号的失败列表（反馈回路）；
//! - 提供方 / 网络 / 超时 / 解析失败是硬失败，清空反馈后盲重试；
//! - 取消立即上抛，不再开始新的尝试；
//! - 全部耗尽后返回 Exhausted（含任务名与最后一次错误）。

use std::future::Future;
use std::sync::Arc;

use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::core::cancel::{Deadline, Interrupt};
use crate::core::{RecoveryAction, RecoveryEngine, TaskError};
use crate::llm::{
    GenerationBudget, LlmBackends, LlmClient, ModelCandidate, ModelTaskRouter, TaskName,
    TaskPolicy, ValidationPolicy,
};
use crate::memory::Message;

/// 业务规则校验函数：返回空列表表示通过
pub type Validator<'a, T> = &'a (dyn Fn(&T) -> Vec<String> + Send + Sync);

/// 成功结果：值、实际使用的候选、总尝试次数
#[derive(Debug, Clone)]
pub struct TaskOutcome<T> {
    pub result: T,
    pub model_used: ModelCandidate,
    pub attempt_count: u32,
}

/// 文本任务请求
#[derive(Debug, Clone)]
pub struct TextRequest {
    pub system: Option<String>,
    pub prompt: String,
}

impl TextRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            system: None,
            prompt: prompt.into(),
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }
}

/// 任务执行器：持有路由表与提供方注册表，可在多个回合间共享
pub struct TaskExecutor {
    router: Arc<ModelTaskRouter>,
    backends: Arc<LlmBackends>,
    recovery: RecoveryEngine,
}

impl TaskExecutor {
    pub fn new(router: Arc<ModelTaskRouter>, backends: Arc<LlmBackends>) -> Self {
        Self {
            router,
            backends,
            recovery: RecoveryEngine::new(),
        }
    }

    pub fn router(&self) -> &ModelTaskRouter {
        &self.router
    }

    pub fn backends(&self) -> &LlmBackends {
        &self.backends
    }

    /// 文本任务
    pub async fn run_text(
        &self,
        task: TaskName,
        request: &TextRequest,
        cancel: &CancellationToken,
    ) -> Result<TaskOutcome<String>, TaskError> {
        let budget = self.budget(task);
        self.run_with_fallback(task, cancel, |client, candidate, token, feedback| async move {
            let mut messages = Vec::with_capacity(2);
            if let Some(system) = &request.system {
                messages.push(Message::system(system.clone()));
            }
            messages.push(Message::user(RecoveryEngine::feedback_prompt(
                &request.prompt,
                &feedback,
            )));
            let text = client
                .complete(&candidate.model_id, &messages, budget, &token)
                .await?;
            Ok::<_, TaskError>(text.trim().to_string())
        })
        .await
    }

    /// 结构化任务：schema 由 T 的 JsonSchema 派生；validate 仅在 SchemaAndBusinessRules 策略下生效
    pub async fn run_structured<T>(
        &self,
        task: TaskName,
        prompt: &str,
        validate: Option<Validator<'_, T>>,
        cancel: &CancellationToken,
    ) -> Result<TaskOutcome<T>, TaskError>
    where
        T: DeserializeOwned + JsonSchema + Send,
    {
        let schema = serde_json::to_value(schemars::schema_for!(T))
            .map_err(|e| TaskError::Configuration(format!("schema for {task}: {e}")))?;
        let schema = &schema;
        let budget = self.budget(task);
        let validate = match self.router.resolve(task).policy.validation {
            ValidationPolicy::SchemaAndBusinessRules => validate,
            ValidationPolicy::None | ValidationPolicy::SchemaOnly => None,
        };

        self.run_with_fallback(task, cancel, move |client, candidate, token, feedback| async move {
            let prompt = RecoveryEngine::feedback_prompt(prompt, &feedback);
            let value: Value = client
                .complete_structured(&candidate.model_id, &prompt, schema, budget, &token)
                .await?;
            let parsed: T = serde_json::from_value(value)
                .map_err(|e| TaskError::Transport(format!("output does not match schema: {e}")))?;
            if let Some(check) = validate {
                let errors = check(&parsed);
                if !errors.is_empty() {
                    return Err(TaskError::Validation(errors));
                }
            }
            Ok::<T, TaskError>(parsed)
        })
        .await
    }

    /// 单次调用指定候选（编排循环使用；不做重试，超时按策略计算）
    pub async fn complete_once(
        &self,
        candidate: &ModelCandidate,
        policy: &TaskPolicy,
        messages: &[Message],
        cancel: &CancellationToken,
    ) -> Result<String, TaskError> {
        let client = self.backends.client(&candidate.provider)?;
        let budget = GenerationBudget {
            max_output_tokens: policy.max_output_tokens,
        };
        let deadline = Deadline::new(cancel, policy.timeout);
        match deadline
            .run(client.complete(&candidate.model_id, messages, budget, deadline.token()))
            .await
        {
            Ok(Ok(text)) => Ok(text),
            Ok(Err(e)) => Err(self.normalize(TaskError::from(e), cancel)),
            Err(interrupt) => Err(interrupt_error(interrupt)),
        }
    }

    fn budget(&self, task: TaskName) -> GenerationBudget {
        GenerationBudget {
            max_output_tokens: self.router.resolve(task).policy.max_output_tokens,
        }
    }

    /// 取消只来自上游令牌；尝试自身的子令牌被截止时间取消时按超时处理
    fn normalize(&self, err: TaskError, cancel: &CancellationToken) -> TaskError {
        if err.is_cancelled() && !cancel.is_cancelled() {
            TaskError::Transport("attempt interrupted by deadline".to_string())
        } else {
            err
        }
    }

    async fn run_with_fallback<T, F, Fut>(
        &self,
        task: TaskName,
        cancel: &CancellationToken,
        mut attempt: F,
    ) -> Result<TaskOutcome<T>, TaskError>
    where
        F: FnMut(Arc<dyn LlmClient>, ModelCandidate, CancellationToken, Vec<String>) -> Fut,
        Fut: Future<Output = Result<T, TaskError>>,
    {
        let route = self.router.resolve(task);
        let candidates = route.candidates();
        if candidates.is_empty() {
            return Err(TaskError::Configuration(format!("task {task} has no model candidates")));
        }
        let policy = &route.policy;

        let mut attempts: u32 = 0;
        let mut feedback: Vec<String> = Vec::new();
        let mut last_error: Option<TaskError> = None;

        for candidate in candidates {
            let client = self.backends.client(&candidate.provider)?;

            for n in 0..=policy.max_retries {
                if cancel.is_cancelled() {
                    return Err(TaskError::Cancelled);
                }
                attempts += 1;
                tracing::debug!(
                    task = %task,
                    model = %candidate.label,
                    attempt = n + 1,
                    feedback_items = feedback.len(),
                    "Task attempt"
                );

                let deadline = Deadline::new(cancel, policy.timeout);
                let fut = attempt(
                    client.clone(),
                    candidate.clone(),
                    deadline.token().clone(),
                    feedback.clone(),
                );
                let err = match deadline.run(fut).await {
                    Ok(Ok(result)) => {
                        tracing::info!(
                            task = %task,
                            model = %candidate.label,
                            attempts,
                            "Task succeeded"
                        );
                        return Ok(TaskOutcome {
                            result,
                            model_used: candidate,
                            attempt_count: attempts,
                        });
                    }
                    Ok(Err(e)) => self.normalize(e, cancel),
                    Err(interrupt) => interrupt_error(interrupt),
                };

                match self.recovery.handle(&err) {
                    RecoveryAction::RetryWithFeedback(errors) => feedback = errors,
                    RecoveryAction::RetryBlind => feedback.clear(),
                    RecoveryAction::Abort => return Err(err),
                }
                tracing::warn!(
                    task = %task,
                    model = %candidate.label,
                    attempt = n + 1,
                    error = %err,
                    "Task attempt failed"
                );
                last_error = Some(err);
            }
            tracing::warn!(task = %task, model = %candidate.label, "Candidate exhausted, moving on");
        }

        Err(TaskError::Exhausted {
            task,
            attempts,
            last: Box::new(
                last_error.unwrap_or_else(|| TaskError::Transport("no attempt was made".to_string())),
            ),
        })
    }
}

fn interrupt_error(interrupt: Interrupt) -> TaskError {
    match interrupt {
        Interrupt::Cancelled => TaskError::Cancelled,
        Interrupt::TimedOut(d) => TaskError::Transport(format!("timed out after {}ms", d.as_millis())),
    }
}
