//! 工具调用主循环
//!
//! Plan -> Act (Tool，经 StepEnvelope) -> Observe -> 下一轮 Plan，直到模型给出最终回复、
//! 回合被取消、出现致命错误或达到步数上限。一次只执行一个工具，完整结束（含持久化）后再规划下一步。

use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::core::{RuntimeState, StepError, TaskError, TurnError};
use crate::llm::{ModelCandidate, TaskExecutor, TaskName, TaskPolicy};
use crate::memory::{Message, MessagePart, ToolCallState};
use crate::react::{parse_llm_output, Planner, PlannerOutput, TurnEvent};
use crate::tools::{StepEnvelope, ToolRegistry};

/// 流式回复时每段字符数
const CHUNK_CHARS: usize = 24;
/// Observation 事件预览最大字符数
const OBSERVATION_PREVIEW_CHARS: usize = 200;
/// 回填给模型的工具结果最大字符数
const OBSERVATION_MAX_CHARS: usize = 4000;

/// 循环失败
#[derive(Debug)]
pub enum LoopError {
    /// 第一次规划调用失败，尚未运行任何工具（入口可改用回退模型重来）
    FirstPlan(TaskError),
    Turn(TurnError),
}

impl From<TurnError> for LoopError {
    fn from(err: TurnError) -> Self {
        LoopError::Turn(err)
    }
}

/// 一个回合的循环配置
pub struct ToolLoop<'a> {
    pub executor: &'a TaskExecutor,
    pub planner: &'a Planner,
    pub tools: &'a ToolRegistry,
    pub envelope: &'a StepEnvelope,
    pub max_steps: usize,
    pub events: Option<&'a UnboundedSender<TurnEvent>>,
}

impl<'a> ToolLoop<'a> {
    fn emit(&self, ev: TurnEvent) {
        if let Some(tx) = self.events {
            let _ = tx.send(ev);
        }
    }

    /// 用指定候选模型驱动循环；transcript 随过程追加（失败时也保留已追加的部分）
    pub async fn run(
        &self,
        candidate: &ModelCandidate,
        policy: &TaskPolicy,
        transcript: &mut Vec<Message>,
        state: &mut RuntimeState,
        cancel: &CancellationToken,
    ) -> Result<String, LoopError> {
        let mut step = 0;

        loop {
            self.emit(TurnEvent::StepUpdate {
                step,
                max_steps: self.max_steps,
            });

            if cancel.is_cancelled() || state.is_cancelled() {
                return Err(TurnError::Cancelled.into());
            }

            if step >= self.max_steps {
                tracing::warn!(max_steps = self.max_steps, "Step budget exhausted");
                let text = format!(
                    "I reached the limit of {} steps for this turn. Progress so far has been saved; \
                     ask me to continue.",
                    self.max_steps
                );
                self.finish(&text, transcript);
                return Ok(text);
            }

            let mut messages = Vec::with_capacity(transcript.len() + 1);
            messages.push(Message::system(self.planner.system_prompt(self.tools, state)));
            messages.extend(transcript.iter().cloned());

            self.emit(TurnEvent::Thinking);
            let output = match self.plan(candidate, policy, &messages, cancel).await {
                Ok(o) => o,
                Err(TaskError::Cancelled) => return Err(TurnError::Cancelled.into()),
                Err(e) if step == 0 => return Err(LoopError::FirstPlan(e)),
                Err(e) => return Err(TurnError::Task(e).into()),
            };

            match parse_llm_output(&output) {
                Ok(PlannerOutput::Response(text)) => {
                    self.finish(&text, transcript);
                    return Ok(text);
                }
                Ok(PlannerOutput::ToolCall(tc)) => {
                    self.emit(TurnEvent::ToolCall {
                        tool: tc.tool.clone(),
                        args: tc.args.clone(),
                    });
                    let Some(tool) = self.tools.get(&tc.tool) else {
                        let names = self.tools.tool_names().join(", ");
                        self.emit(TurnEvent::ToolFailure {
                            tool: tc.tool.clone(),
                            reason: "unknown tool".to_string(),
                        });
                        transcript.push(Message::assistant(output.trim()));
                        transcript.push(Message::user(format!(
                            "Tool '{}' does not exist. Available tools: {names}.",
                            tc.tool
                        )));
                        step += 1;
                        continue;
                    };

                    let result = self
                        .envelope
                        .run_step(tool.as_ref(), tc.args.clone(), state, cancel)
                        .await;
                    let (call_state, output_value, observation) = match result {
                        Ok(out) => {
                            let value = out.to_value();
                            let text = truncate(&value.to_string(), OBSERVATION_MAX_CHARS);
                            (ToolCallState::Completed, Some(value), text)
                        }
                        Err(e) if e.is_cancelled() => {
                            transcript.push(tool_call_message(&output, &tc.tool, &tc.args, ToolCallState::Cancelled, None));
                            return Err(TurnError::Cancelled.into());
                        }
                        Err(e @ StepError::Failed { fatal: true, .. }) | Err(e @ StepError::Store { .. }) => {
                            transcript.push(tool_call_message(&output, &tc.tool, &tc.args, ToolCallState::Error, None));
                            return Err(TurnError::Step(e).into());
                        }
                        Err(e) => {
                            let reason = match &e {
                                StepError::Failed { message, .. } => message.clone(),
                                other => other.to_string(),
                            };
                            self.emit(TurnEvent::ToolFailure {
                                tool: tc.tool.clone(),
                                reason: reason.clone(),
                            });
                            (ToolCallState::Error, None, format!("Error: {reason}"))
                        }
                    };

                    self.emit(TurnEvent::Observation {
                        tool: tc.tool.clone(),
                        preview: truncate(&observation, OBSERVATION_PREVIEW_CHARS),
                    });
                    transcript.push(tool_call_message(&output, &tc.tool, &tc.args, call_state, output_value));
                    transcript.push(Message::user(format!(
                        "Observation from {}: {}",
                        tc.tool, observation
                    )));
                }
                Err(e) => {
                    tracing::debug!(error = %e, "Planner output could not be parsed");
                    transcript.push(Message::assistant(output.trim()));
                    transcript.push(Message::user(format!(
                        "Your last reply was not a valid tool call ({e}). Reply with a single JSON object \
                         {{\"tool\": \"<name>\", \"args\": {{...}}}} or answer in plain text."
                    )));
                }
            }

            step += 1;
        }
    }

    /// 单次规划：同一候选上对传输失败重试 max_retries 次
    async fn plan(
        &self,
        candidate: &ModelCandidate,
        policy: &TaskPolicy,
        messages: &[Message],
        cancel: &CancellationToken,
    ) -> Result<String, TaskError> {
        let attempts = policy.max_retries + 1;
        let mut last = TaskError::Transport("no planning attempt was made".to_string());
        for attempt in 1..=attempts {
            match self.executor.complete_once(candidate, policy, messages, cancel).await {
                Ok(text) => return Ok(text),
                Err(e @ (TaskError::Cancelled | TaskError::Configuration(_))) => return Err(e),
                Err(e) => {
                    tracing::warn!(model = %candidate.label, attempt, error = %e, "Planning call failed");
                    last = e;
                }
            }
        }
        Err(TaskError::Exhausted {
            task: TaskName::Orchestrate,
            attempts,
            last: Box::new(last),
        })
    }

    fn finish(&self, text: &str, transcript: &mut Vec<Message>) {
        let chars: Vec<char> = text.chars().collect();
        for chunk in chars.chunks(CHUNK_CHARS) {
            self.emit(TurnEvent::MessageChunk {
                text: chunk.iter().collect(),
            });
        }
        self.emit(TurnEvent::MessageDone);
        transcript.push(Message::assistant(text));
    }
}

fn tool_call_message(
    raw: &str,
    tool: &str,
    args: &serde_json::Value,
    state: ToolCallState,
    output: Option<serde_json::Value>,
) -> Message {
    Message::assistant(raw.trim()).with_part(MessagePart::ToolCall {
        tool_name: tool.to_string(),
        state,
        input: args.clone(),
        output,
    })
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() > max_chars {
        format!("{}...", text.chars().take(max_chars).collect::<String>())
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmError, MockLlmClient, MockReply};
    use crate::tools::testing::{mock_executor, state_with_video};
    use crate::tools::{RenderDocumentTool, StepEnvelope};
    use std::sync::Arc;
    use std::time::Duration;

    fn registry() -> ToolRegistry {
        let mut tools = ToolRegistry::new();
        tools.register(RenderDocumentTool::new("previews/local"));
        tools
    }

    async fn run_loop(
        llm: Arc<MockLlmClient>,
        max_steps: usize,
        state: &mut RuntimeState,
        transcript: &mut Vec<Message>,
    ) -> Result<String, LoopError> {
        let executor = mock_executor(llm);
        let planner = Planner::default();
        let tools = registry();
        let envelope = StepEnvelope::anonymous(Duration::from_secs(5));
        let route = executor.router().resolve(TaskName::Orchestrate).clone();
        let tool_loop = ToolLoop {
            executor: &executor,
            planner: &planner,
            tools: &tools,
            envelope: &envelope,
            max_steps,
            events: None,
        };
        tool_loop
            .run(&route.primary, &route.policy, transcript, state, &CancellationToken::new())
            .await
    }

    #[tokio::test]
    async fn test_tool_failure_becomes_observation() {
        let llm = Arc::new(MockLlmClient::new());
        llm.push_text(r#"{"tool": "render_document", "args": {}}"#)
            .push_text("There is nothing to render yet.");
        let mut state = state_with_video();
        let mut transcript = vec![Message::user("render it")];

        let reply = run_loop(llm.clone(), 5, &mut state, &mut transcript).await.unwrap();
        assert_eq!(reply, "There is nothing to render yet.");
        assert_eq!(transcript.len(), 4);
        assert!(transcript[2].content.starts_with("Observation from render_document: Error:"));
        assert!(matches!(
            transcript[1].parts[0],
            MessagePart::ToolCall { state: ToolCallState::Error, .. }
        ));
        assert!(llm.calls()[1].last_user_text().contains("Error: nothing to render"));
    }

    #[tokio::test]
    async fn test_unknown_tool_and_step_budget() {
        let llm = Arc::new(MockLlmClient::new().with_default(MockReply::Text(
            r#"{"tool": "book_flight", "args": {}}"#.into(),
        )));
        let mut state = state_with_video();
        let mut transcript = vec![Message::user("book it")];

        let reply = run_loop(llm.clone(), 3, &mut state, &mut transcript).await.unwrap();
        assert!(reply.contains("limit of 3 steps"));
        assert_eq!(llm.call_count(), 3);
        assert!(transcript[2].content.contains("does not exist"));
    }

    #[tokio::test]
    async fn test_first_plan_failure_is_reported() {
        let llm = Arc::new(
            MockLlmClient::new().with_default(MockReply::Fail(LlmError::Transport("down".into()))),
        );
        let mut state = state_with_video();
        let mut transcript = vec![Message::user("hi")];

        let err = run_loop(llm.clone(), 3, &mut state, &mut transcript).await.unwrap_err();
        assert!(matches!(err, LoopError::FirstPlan(TaskError::Exhausted { .. })));
        // 默认编排策略 max_retries = 1
        assert_eq!(llm.call_count(), 2);
        assert_eq!(transcript.len(), 1);
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("abcdef", 3), "abc...");
        assert_eq!(truncate("abc", 3), "abc");
    }
}
