//! 编排入口：一次用户回合
//!
//! 负责：规范化请求、标记会话 running 并保存消息、解析编排模型、从快照恢复运行时状态、
//! 注册取消监听、压缩对话、构建本回合工具集与 StepEnvelope、驱动工具调用循环
//! （首次规划失败时改用回退模型重试一次），最后写入消息与快照并落定会话状态。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::config::OrchestratorSection;
use crate::core::{RuntimeState, StoreError, TurnError};
use crate::itinerary::RenderedDocument;
use crate::llm::{ModelCandidate, TaskExecutor, TaskName, TaskRoute};
use crate::memory::{CompactionMode, ConversationCompactor, Message, Role};
use crate::react::{LoopError, Planner, ToolLoop, TurnEvent};
use crate::session::{SessionStatus, SessionStore, StepLedger};
use crate::tools::{itinerary_tools, SessionBinding, StepEnvelope, ToolDeps};

/// 回合被取消时返回给客户端的回复
pub const STOPPED_RESPONSE: &str = "Stopped.";

/// 一次用户回合
#[derive(Debug, Clone, Default)]
pub struct TurnRequest {
    pub session_id: Option<String>,
    pub owner_id: Option<String>,
    pub messages: Vec<Message>,
    pub compaction: CompactionMode,
}

impl TurnRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>, owner_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self.owner_id = Some(owner_id.into());
        self
    }

    pub fn with_compaction(mut self, mode: CompactionMode) -> Self {
        self.compaction = mode;
        self
    }

    /// 去掉空白消息；要求最后一条是用户消息；会话身份必须成对出现
    fn normalize(self) -> Result<(Option<(String, String)>, Vec<Message>), TurnError> {
        let identity = match (self.session_id, self.owner_id) {
            (Some(s), Some(o)) if !s.trim().is_empty() && !o.trim().is_empty() => {
                Some((s.trim().to_string(), o.trim().to_string()))
            }
            (None, None) => None,
            _ => {
                return Err(TurnError::InvalidRequest(
                    "session_id and owner_id must be given together".to_string(),
                ))
            }
        };
        let messages: Vec<Message> = self.messages.into_iter().filter(|m| !m.is_blank()).collect();
        match messages.last() {
            Some(m) if m.role == Role::User => Ok((identity, messages)),
            Some(_) => Err(TurnError::InvalidRequest(
                "the last message must come from the user".to_string(),
            )),
            None => Err(TurnError::InvalidRequest("no messages".to_string())),
        }
    }
}

/// 回合结果
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub response: String,
    /// Completed 或 Cancelled
    pub status: SessionStatus,
    /// 本回合结束时的完整对话
    pub messages: Vec<Message>,
    pub document: Option<RenderedDocument>,
    pub model_used: ModelCandidate,
    pub compacted: bool,
}

struct Drive {
    response: String,
    model_used: ModelCandidate,
    compacted: bool,
}

/// 编排器：跨回合共享，本身不持有回合状态
pub struct Orchestrator {
    pub(crate) executor: Arc<TaskExecutor>,
    pub(crate) compactor: ConversationCompactor,
    pub(crate) deps: ToolDeps,
    pub(crate) store: Option<(Arc<dyn SessionStore>, Arc<dyn StepLedger>)>,
    pub(crate) planner: Planner,
    pub(crate) settings: OrchestratorSection,
    pub(crate) preview_dir: String,
}

impl Orchestrator {
    pub fn executor(&self) -> &Arc<TaskExecutor> {
        &self.executor
    }

    pub fn settings(&self) -> &OrchestratorSection {
        &self.settings
    }

    /// 运行一个回合；取消不是错误，返回 status = Cancelled 的结果
    pub async fn run_turn(
        &self,
        request: TurnRequest,
        cancel: &CancellationToken,
        events: Option<&UnboundedSender<TurnEvent>>,
    ) -> Result<TurnOutcome, TurnError> {
        let mode = request.compaction;
        let (identity, messages) = request.normalize()?;
        let binding = self.bind(identity);

        if let Some(b) = &binding {
            b.store.mark_running(&b.session_id, &b.owner_id).await?;
            if let Err(e) = b.store.save_messages(&b.session_id, &b.owner_id, &messages).await {
                return Err(self.fail(binding.as_ref(), e.into(), events).await);
            }
        }
        tracing::info!(
            session = binding.as_ref().map(|b| b.session_id.as_str()).unwrap_or("-"),
            messages = messages.len(),
            "Turn started"
        );

        let route = self.executor.router().resolve(TaskName::Orchestrate).clone();
        let mut state = match self.hydrate(binding.as_ref()).await {
            Ok(s) => s,
            Err(e) => return Err(self.fail(binding.as_ref(), e, events).await),
        };

        // 取消监听：翻转运行时标志并标记外部会话
        let done = CancellationToken::new();
        let listener = {
            let cancel = cancel.clone();
            let done = done.clone();
            let flag = state.cancel_flag();
            let binding = binding.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        flag.store(true, std::sync::atomic::Ordering::SeqCst);
                        if let Some(b) = binding {
                            if let Err(e) = b.store.mark_cancelled(&b.session_id, &b.owner_id).await {
                                tracing::warn!(session = %b.session_id, error = %e, "Failed to mark session cancelled");
                            }
                        }
                    }
                    _ = done.cancelled() => {}
                }
            })
        };

        let mut transcript = messages;
        let result = self
            .drive(&route, binding.as_ref(), mode, &mut transcript, &mut state, cancel, events)
            .await;
        done.cancel();
        let _ = listener.await;

        self.finalize(result, binding, transcript, state, cancel, events).await
    }

    fn bind(&self, identity: Option<(String, String)>) -> Option<SessionBinding> {
        let (session_id, owner_id) = identity?;
        match &self.store {
            Some((store, ledger)) => Some(SessionBinding::new(
                session_id,
                owner_id,
                store.clone(),
                ledger.clone(),
            )),
            None => {
                tracing::warn!(session_id, "No session store configured; running the turn anonymously");
                None
            }
        }
    }

    async fn hydrate(&self, binding: Option<&SessionBinding>) -> Result<RuntimeState, TurnError> {
        let Some(b) = binding else {
            return Ok(RuntimeState::new());
        };
        let snapshot = b.store.get_snapshot(&b.session_id, &b.owner_id).await?;
        Ok(match snapshot {
            Some(snap) => {
                let state = RuntimeState::from_snapshot(&snap, self.settings.image_precedence);
                tracing::debug!(
                    session = %b.session_id,
                    blocks = state.blocks().len(),
                    resolved = state.locations_resolved(),
                    "State hydrated from snapshot"
                );
                state
            }
            None => RuntimeState::new(),
        })
    }

    fn preview_root(&self, binding: Option<&SessionBinding>) -> String {
        let dir = self.preview_dir.trim_end_matches('/');
        match binding {
            Some(b) => format!("{dir}/{}", b.session_id),
            None => format!("{dir}/local"),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn drive(
        &self,
        route: &TaskRoute,
        binding: Option<&SessionBinding>,
        mode: CompactionMode,
        transcript: &mut Vec<Message>,
        state: &mut RuntimeState,
        cancel: &CancellationToken,
        events: Option<&UnboundedSender<TurnEvent>>,
    ) -> Result<Drive, TurnError> {
        let compaction = self
            .compactor
            .compact(transcript, state.conversation_summary(), mode, cancel)
            .await;
        if compaction.was_compacted {
            emit(events, TurnEvent::Compacted {
                dropped: compaction.dropped_count,
            });
        }
        state.set_conversation_summary(compaction.summary);

        // 模型看到压缩后的上下文；新增消息再追加回完整对话
        let mut context = compaction.kept_messages;
        let base = context.len();

        let tools = itinerary_tools(&self.deps, &self.preview_root(binding));
        let envelope = StepEnvelope::new(
            binding.cloned(),
            Duration::from_secs(self.settings.tool_timeout_secs),
        );
        let tool_loop = ToolLoop {
            executor: &self.executor,
            planner: &self.planner,
            tools: &tools,
            envelope: &envelope,
            max_steps: self.settings.max_steps,
            events,
        };

        let mut model_used = route.primary.clone();
        let mut result = tool_loop
            .run(&route.primary, &route.policy, &mut context, state, cancel)
            .await;
        let first_failure = match &result {
            Err(LoopError::FirstPlan(e)) => Some(e.to_string()),
            _ => None,
        };
        if let (Some(error), Some(fallback)) = (first_failure, route.fallback.as_ref()) {
            if !cancel.is_cancelled() {
                tracing::warn!(
                    primary = %route.primary.label,
                    fallback = %fallback.label,
                    error = %error,
                    "Primary model failed to start the turn; retrying with fallback"
                );
                emit(events, TurnEvent::FallbackModel {
                    model: fallback.label.clone(),
                });
                context.truncate(base);
                model_used = fallback.clone();
                result = tool_loop
                    .run(fallback, &route.policy, &mut context, state, cancel)
                    .await;
            }
        }
        transcript.extend(context.drain(base.min(context.len())..));

        let response = result.map_err(|e| match e {
            LoopError::FirstPlan(t) => TurnError::Task(t),
            LoopError::Turn(t) => t,
        })?;
        Ok(Drive {
            response,
            model_used,
            compacted: compaction.was_compacted,
        })
    }

    /// 写入最终消息与快照，然后落定会话状态；持久化失败不会掩盖模型侧错误
    async fn finalize(
        &self,
        result: Result<Drive, TurnError>,
        binding: Option<SessionBinding>,
        transcript: Vec<Message>,
        state: RuntimeState,
        cancel: &CancellationToken,
        events: Option<&UnboundedSender<TurnEvent>>,
    ) -> Result<TurnOutcome, TurnError> {
        let cancelled = cancel.is_cancelled()
            || state.is_cancelled()
            || matches!(&result, Err(e) if e.is_cancelled());

        let persisted = match &binding {
            Some(b) => persist(b, &transcript, &state).await,
            None => Ok(()),
        };

        if cancelled {
            if let Err(e) = &persisted {
                tracing::warn!(error = %e, "Failed to persist a cancelled turn");
            }
            if let Some(b) = &binding {
                if let Err(e) = b.store.mark_cancelled(&b.session_id, &b.owner_id).await {
                    tracing::warn!(session = %b.session_id, error = %e, "Failed to mark session cancelled");
                }
            }
            tracing::info!("Turn cancelled");
            emit(events, TurnEvent::Stopped);
            let model_used = match &result {
                Ok(d) => d.model_used.clone(),
                Err(_) => self.executor.router().resolve(TaskName::Orchestrate).primary.clone(),
            };
            return Ok(TurnOutcome {
                response: STOPPED_RESPONSE.to_string(),
                status: SessionStatus::Cancelled,
                messages: transcript,
                document: state.document().cloned(),
                model_used,
                compacted: result.as_ref().map(|d| d.compacted).unwrap_or(false),
            });
        }

        let drive = match result {
            Ok(d) => d,
            Err(e) => {
                if let Err(pe) = &persisted {
                    tracing::warn!(error = %pe, "Failed to persist a failed turn");
                }
                return Err(self.fail(binding.as_ref(), e, events).await);
            }
        };

        if let Err(e) = persisted {
            return Err(self.fail(binding.as_ref(), e.into(), events).await);
        }
        if let Some(b) = &binding {
            if let Err(e) = b.store.mark_completed(&b.session_id, &b.owner_id).await {
                return Err(self.fail(binding.as_ref(), e.into(), events).await);
            }
        }

        tracing::info!(model = %drive.model_used.label, messages = transcript.len(), "Turn completed");
        Ok(TurnOutcome {
            response: drive.response,
            status: SessionStatus::Completed,
            messages: transcript,
            document: state.document().cloned(),
            model_used: drive.model_used,
            compacted: drive.compacted,
        })
    }

    /// 终止错误：标记会话 errored（失败只记日志）并发出面向用户的错误事件
    async fn fail(
        &self,
        binding: Option<&SessionBinding>,
        err: TurnError,
        events: Option<&UnboundedSender<TurnEvent>>,
    ) -> TurnError {
        tracing::error!(error = %err, "Turn failed");
        if let Some(b) = binding {
            if let Err(e) = b.store.mark_error(&b.session_id, &b.owner_id, &err.to_string()).await {
                tracing::warn!(session = %b.session_id, error = %e, "Failed to mark session errored");
            }
        }
        emit(events, TurnEvent::Error {
            text: err.user_message(),
        });
        err
    }
}

async fn persist(b: &SessionBinding, transcript: &[Message], state: &RuntimeState) -> Result<(), StoreError> {
    b.store.save_messages(&b.session_id, &b.owner_id, transcript).await?;
    let patch = state.to_patch();
    if !patch.is_empty() {
        b.store.upsert_snapshot(&b.session_id, &b.owner_id, patch).await?;
    }
    Ok(())
}

fn emit(events: Option<&UnboundedSender<TurnEvent>>, ev: TurnEvent) {
    if let Some(tx) = events {
        let _ = tx.send(ev);
    }
}
