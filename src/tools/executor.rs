//! 步骤信封（Step Envelope）
//!
//! 包裹每一次工具调用：会话状态预检 -> 创建 running 账本条目 -> 在超时与取消约束下执行 ->
//! 按结果分类（success / error / cancelled）收尾账本 -> 成功时写入会话快照。
//! 无会话身份时跳过全部账本与快照 I/O，只在运行时状态中缓存输出。
//! 每次调用输出一条结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::core::cancel::{Deadline, Interrupt};
use crate::core::{RuntimeState, StepError, StoreError, ToolOutput};
use crate::session::{SessionStatus, SessionStore, StepLedger};
use crate::tools::Tool;

const ARGS_PREVIEW_CHARS: usize = 200;

/// 会话身份与持久化协作方
#[derive(Clone)]
pub struct SessionBinding {
    pub session_id: String,
    pub owner_id: String,
    pub store: Arc<dyn SessionStore>,
    pub ledger: Arc<dyn StepLedger>,
}

impl SessionBinding {
    pub fn new(
        session_id: impl Into<String>,
        owner_id: impl Into<String>,
        store: Arc<dyn SessionStore>,
        ledger: Arc<dyn StepLedger>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            owner_id: owner_id.into(),
            store,
            ledger,
        }
    }
}

/// 工具执行的内部分类结果
enum Outcome {
    Success(ToolOutput),
    Cancelled,
    Failed { message: String, fatal: bool },
}

pub struct StepEnvelope {
    binding: Option<SessionBinding>,
    timeout: Duration,
}

impl StepEnvelope {
    pub fn new(binding: Option<SessionBinding>, timeout: Duration) -> Self {
        Self { binding, timeout }
    }

    /// 匿名运行：只做本地缓存
    pub fn anonymous(timeout: Duration) -> Self {
        Self::new(None, timeout)
    }

    pub fn binding(&self) -> Option<&SessionBinding> {
        self.binding.as_ref()
    }

    /// 执行一步；返回工具输出或可区分的取消 / 失败
    pub async fn run_step(
        &self,
        tool: &dyn Tool,
        input: Value,
        state: &mut RuntimeState,
        cancel: &CancellationToken,
    ) -> Result<ToolOutput, StepError> {
        let name = tool.name().to_string();
        let preview = args_preview(&input);

        if let Some(b) = &self.binding {
            let status = b
                .store
                .get_status(&b.session_id, &b.owner_id)
                .await
                .map_err(|source| store_error(&name, source))?;
            if status == SessionStatus::Cancelled {
                state.mark_cancelled();
                audit(&name, "skipped", 0, &preview);
                return Err(StepError::Cancelled { tool: name });
            }
        }
        if cancel.is_cancelled() || state.is_cancelled() {
            audit(&name, "skipped", 0, &preview);
            return Err(StepError::Cancelled { tool: name });
        }

        let step_id = match &self.binding {
            Some(b) => Some(
                b.ledger
                    .create_step(&b.session_id, &b.owner_id, &name, &input)
                    .await
                    .map_err(|source| store_error(&name, source))?,
            ),
            None => None,
        };

        let start = Instant::now();
        let outcome = self.execute(tool, input, state, cancel).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        match outcome {
            Outcome::Success(output) => {
                audit(&name, "ok", duration_ms, &preview);
                state.record_output(&name, output.clone());
                if let (Some(b), Some(id)) = (&self.binding, &step_id) {
                    b.ledger
                        .complete_step(id, &output.to_value(), duration_ms)
                        .await
                        .map_err(|source| store_error(&name, source))?;
                    b.store
                        .upsert_snapshot(&b.session_id, &b.owner_id, state.to_patch())
                        .await
                        .map_err(|source| store_error(&name, source))?;
                }
                Ok(output)
            }
            Outcome::Cancelled => {
                audit(&name, "cancelled", duration_ms, &preview);
                if let (Some(b), Some(id)) = (&self.binding, &step_id) {
                    if let Err(e) = b.ledger.cancel_step(id, duration_ms).await {
                        tracing::warn!(tool = %name, step = %id, error = %e, "could not mark step cancelled");
                    }
                }
                Err(StepError::Cancelled { tool: name })
            }
            Outcome::Failed { message, fatal } => {
                audit(&name, "error", duration_ms, &preview);
                state.record_error(&name, message.clone());
                if let (Some(b), Some(id)) = (&self.binding, &step_id) {
                    if let Err(e) = b.ledger.fail_step(id, &message, duration_ms).await {
                        tracing::warn!(tool = %name, step = %id, error = %e, "could not mark step failed");
                    }
                }
                Err(StepError::Failed {
                    tool: name,
                    message,
                    fatal,
                })
            }
        }
    }

    async fn execute(
        &self,
        tool: &dyn Tool,
        input: Value,
        state: &mut RuntimeState,
        cancel: &CancellationToken,
    ) -> Outcome {
        let deadline = Deadline::new(cancel, self.timeout);
        let result = deadline
            .run(tool.execute(input, state, deadline.token()))
            .await;
        match result {
            Ok(Ok(output)) => Outcome::Success(output),
            Ok(Err(e)) if e.is_cancelled() && cancel.is_cancelled() => Outcome::Cancelled,
            Ok(Err(e)) if e.is_cancelled() => Outcome::Failed {
                message: format!("{} interrupted by its deadline", tool.name()),
                fatal: false,
            },
            Ok(Err(e)) => Outcome::Failed {
                fatal: e.is_fatal(),
                message: e.to_string(),
            },
            Err(Interrupt::Cancelled) => Outcome::Cancelled,
            Err(Interrupt::TimedOut(after)) => Outcome::Failed {
                message: format!("{} timed out after {}s", tool.name(), after.as_secs()),
                fatal: false,
            },
        }
    }
}

fn store_error(tool: &str, source: StoreError) -> StepError {
    StepError::Store {
        tool: tool.to_string(),
        source,
    }
}

fn audit(tool: &str, outcome: &str, duration_ms: u64, args_preview: &str) {
    let audit = serde_json::json!({
        "event": "tool_audit",
        "tool": tool,
        "ok": outcome == "ok",
        "outcome": outcome,
        "duration_ms": duration_ms,
        "args_preview": args_preview,
    });
    tracing::info!(audit = %audit.to_string(), "tool");
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > ARGS_PREVIEW_CHARS {
        format!("{}...", s.chars().take(ARGS_PREVIEW_CHARS).collect::<String>())
    } else {
        s
    }
}
