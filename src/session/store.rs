//! 会话存储与步骤账本抽象
//!
//! 两个接口都以 (session_id, owner_id) 定位会话；owner 不匹配时返回 NotOwner。
//! 账本条目创建时为 running，只能迁移一次到终态，之后不再修改。

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::core::StoreError;
use crate::memory::Message;
use crate::session::{SessionSnapshot, SnapshotPatch};

/// 外部会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Running,
    Completed,
    Cancelled,
    Error,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Idle => "idle",
            SessionStatus::Running => "running",
            SessionStatus::Completed => "completed",
            SessionStatus::Cancelled => "cancelled",
            SessionStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(SessionStatus::Idle),
            "running" => Some(SessionStatus::Running),
            "completed" => Some(SessionStatus::Completed),
            "cancelled" => Some(SessionStatus::Cancelled),
            "error" => Some(SessionStatus::Error),
            _ => None,
        }
    }
}

/// 账本条目状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Running,
    Success,
    Error,
    Cancelled,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Running => "running",
            StepStatus::Success => "success",
            StepStatus::Error => "error",
            StepStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(StepStatus::Running),
            "success" => Some(StepStatus::Success),
            "error" => Some(StepStatus::Error),
            "cancelled" => Some(StepStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, StepStatus::Running)
    }
}

/// 一次工具调用的持久记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepLedgerEntry {
    pub id: String,
    pub session_id: String,
    pub tool_name: String,
    pub status: StepStatus,
    pub input: Value,
    pub output: Option<Value>,
    pub error_message: Option<String>,
    pub duration_ms: Option<u64>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl StepLedgerEntry {
    pub fn running(session_id: &str, tool_name: &str, input: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            tool_name: tool_name.to_string(),
            status: StepStatus::Running,
            input,
            output: None,
            error_message: None,
            duration_ms: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// 迁移到终态；已是终态时报错
    pub fn finish(
        &mut self,
        status: StepStatus,
        output: Option<Value>,
        error_message: Option<String>,
        duration_ms: u64,
    ) -> Result<(), StoreError> {
        if self.status.is_terminal() {
            return Err(StoreError::AlreadyTerminal(self.id.clone()));
        }
        self.status = status;
        self.output = output;
        self.error_message = error_message;
        self.duration_ms = Some(duration_ms);
        self.finished_at = Some(Utc::now());
        Ok(())
    }
}

/// 会话存储：快照读写、状态迁移、消息记录
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get_snapshot(
        &self,
        session_id: &str,
        owner_id: &str,
    ) -> Result<Option<SessionSnapshot>, StoreError>;

    /// 读取后合并写入，返回合并结果
    async fn upsert_snapshot(
        &self,
        session_id: &str,
        owner_id: &str,
        patch: SnapshotPatch,
    ) -> Result<SessionSnapshot, StoreError>;

    /// 未知会话视为 Idle
    async fn get_status(&self, session_id: &str, owner_id: &str)
        -> Result<SessionStatus, StoreError>;

    async fn mark_running(&self, session_id: &str, owner_id: &str) -> Result<(), StoreError>;

    async fn mark_completed(&self, session_id: &str, owner_id: &str) -> Result<(), StoreError>;

    async fn mark_cancelled(&self, session_id: &str, owner_id: &str) -> Result<(), StoreError>;

    async fn mark_error(
        &self,
        session_id: &str,
        owner_id: &str,
        message: &str,
    ) -> Result<(), StoreError>;

    /// 覆盖保存会话消息
    async fn save_messages(
        &self,
        session_id: &str,
        owner_id: &str,
        messages: &[Message],
    ) -> Result<(), StoreError>;

    async fn load_messages(&self, session_id: &str, owner_id: &str)
        -> Result<Vec<Message>, StoreError>;
}

/// 步骤账本：只追加
#[async_trait]
pub trait StepLedger: Send + Sync {
    /// 创建 running 条目，返回 step id
    async fn create_step(
        &self,
        session_id: &str,
        owner_id: &str,
        tool_name: &str,
        input: &Value,
    ) -> Result<String, StoreError>;

    async fn complete_step(
        &self,
        step_id: &str,
        output: &Value,
        duration_ms: u64,
    ) -> Result<(), StoreError>;

    async fn fail_step(&self, step_id: &str, message: &str, duration_ms: u64)
        -> Result<(), StoreError>;

    async fn cancel_step(&self, step_id: &str, duration_ms: u64) -> Result<(), StoreError>;

    /// 按创建顺序列出会话的全部条目
    async fn list_steps(
        &self,
        session_id: &str,
        owner_id: &str,
    ) -> Result<Vec<StepLedgerEntry>, StoreError>;
}

#[derive(Debug)]
struct SessionRecord {
    owner_id: String,
    status: SessionStatus,
    error_message: Option<String>,
    snapshot: Option<SessionSnapshot>,
    messages: Vec<Message>,
}

#[derive(Default)]
struct MemoryInner {
    sessions: HashMap<String, SessionRecord>,
    steps: Vec<StepLedgerEntry>,
}

/// 内存实现：同时提供会话存储与步骤账本（测试与匿名部署）
#[derive(Default)]
pub struct MemorySessionStore {
    inner: RwLock<MemoryInner>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 最近一次 mark_error 写入的消息
    pub async fn error_message(&self, session_id: &str) -> Option<String> {
        let inner = self.inner.read().await;
        inner
            .sessions
            .get(session_id)
            .and_then(|s| s.error_message.clone())
    }

    /// 外部直接置为 cancelled（模拟另一端发起停止）
    pub async fn force_status(&self, session_id: &str, owner_id: &str, status: SessionStatus) {
        let mut inner = self.inner.write().await;
        inner
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionRecord::new(owner_id))
            .status = status;
    }

    async fn set_status(
        &self,
        session_id: &str,
        owner_id: &str,
        status: SessionStatus,
        error_message: Option<String>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let record = owned_entry(&mut inner.sessions, session_id, owner_id)?;
        record.status = status;
        record.error_message = error_message;
        tracing::debug!(session_id, status = status.as_str(), "Session status updated");
        Ok(())
    }
}

impl SessionRecord {
    fn new(owner_id: &str) -> Self {
        Self {
            owner_id: owner_id.to_string(),
            status: SessionStatus::Idle,
            error_message: None,
            snapshot: None,
            messages: Vec::new(),
        }
    }
}

fn owned<'a>(
    sessions: &'a HashMap<String, SessionRecord>,
    session_id: &str,
    owner_id: &str,
) -> Result<Option<&'a SessionRecord>, StoreError> {
    match sessions.get(session_id) {
        Some(r) if r.owner_id != owner_id => Err(StoreError::NotOwner {
            session_id: session_id.to_string(),
            owner_id: owner_id.to_string(),
        }),
        other => Ok(other),
    }
}

fn owned_entry<'a>(
    sessions: &'a mut HashMap<String, SessionRecord>,
    session_id: &str,
    owner_id: &str,
) -> Result<&'a mut SessionRecord, StoreError> {
    let record = sessions
        .entry(session_id.to_string())
        .or_insert_with(|| SessionRecord::new(owner_id));
    if record.owner_id != owner_id {
        return Err(StoreError::NotOwner {
            session_id: session_id.to_string(),
            owner_id: owner_id.to_string(),
        });
    }
    Ok(record)
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get_snapshot(
        &self,
        session_id: &str,
        owner_id: &str,
    ) -> Result<Option<SessionSnapshot>, StoreError> {
        let inner = self.inner.read().await;
        Ok(owned(&inner.sessions, session_id, owner_id)?.and_then(|r| r.snapshot.clone()))
    }

    async fn upsert_snapshot(
        &self,
        session_id: &str,
        owner_id: &str,
        patch: SnapshotPatch,
    ) -> Result<SessionSnapshot, StoreError> {
        let mut inner = self.inner.write().await;
        let record = owned_entry(&mut inner.sessions, session_id, owner_id)?;
        let merged = SessionSnapshot::merge(record.snapshot.take(), patch);
        record.snapshot = Some(merged.clone());
        Ok(merged)
    }

    async fn get_status(
        &self,
        session_id: &str,
        owner_id: &str,
    ) -> Result<SessionStatus, StoreError> {
        let inner = self.inner.read().await;
        Ok(owned(&inner.sessions, session_id, owner_id)?
            .map(|r| r.status)
            .unwrap_or(SessionStatus::Idle))
    }

    async fn mark_running(&self, session_id: &str, owner_id: &str) -> Result<(), StoreError> {
        self.set_status(session_id, owner_id, SessionStatus::Running, None).await
    }

    async fn mark_completed(&self, session_id: &str, owner_id: &str) -> Result<(), StoreError> {
        self.set_status(session_id, owner_id, SessionStatus::Completed, None).await
    }

    async fn mark_cancelled(&self, session_id: &str, owner_id: &str) -> Result<(), StoreError> {
        self.set_status(session_id, owner_id, SessionStatus::Cancelled, None).await
    }

    async fn mark_error(
        &self,
        session_id: &str,
        owner_id: &str,
        message: &str,
    ) -> Result<(), StoreError> {
        self.set_status(session_id, owner_id, SessionStatus::Error, Some(message.to_string()))
            .await
    }

    async fn save_messages(
        &self,
        session_id: &str,
        owner_id: &str,
        messages: &[Message],
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        owned_entry(&mut inner.sessions, session_id, owner_id)?.messages = messages.to_vec();
        Ok(())
    }

    async fn load_messages(
        &self,
        session_id: &str,
        owner_id: &str,
    ) -> Result<Vec<Message>, StoreError> {
        let inner = self.inner.read().await;
        Ok(owned(&inner.sessions, session_id, owner_id)?
            .map(|r| r.messages.clone())
            .unwrap_or_default())
    }
}

#[async_trait]
impl StepLedger for MemorySessionStore {
    async fn create_step(
        &self,
        session_id: &str,
        owner_id: &str,
        tool_name: &str,
        input: &Value,
    ) -> Result<String, StoreError> {
        let mut inner = self.inner.write().await;
        owned_entry(&mut inner.sessions, session_id, owner_id)?;
        let entry = StepLedgerEntry::running(session_id, tool_name, input.clone());
        let id = entry.id.clone();
        inner.steps.push(entry);
        Ok(id)
    }

    async fn complete_step(
        &self,
        step_id: &str,
        output: &Value,
        duration_ms: u64,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        find_step(&mut inner.steps, step_id)?.finish(
            StepStatus::Success,
            Some(output.clone()),
            None,
            duration_ms,
        )
    }

    async fn fail_step(
        &self,
        step_id: &str,
        message: &str,
        duration_ms: u64,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        find_step(&mut inner.steps, step_id)?.finish(
            StepStatus::Error,
            None,
            Some(message.to_string()),
            duration_ms,
        )
    }

    async fn cancel_step(&self, step_id: &str, duration_ms: u64) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        find_step(&mut inner.steps, step_id)?.finish(StepStatus::Cancelled, None, None, duration_ms)
    }

    async fn list_steps(
        &self,
        session_id: &str,
        owner_id: &str,
    ) -> Result<Vec<StepLedgerEntry>, StoreError> {
        let inner = self.inner.read().await;
        owned(&inner.sessions, session_id, owner_id)?;
        Ok(inner
            .steps
            .iter()
            .filter(|s| s.session_id == session_id)
            .cloned()
            .collect())
    }
}

fn find_step<'a>(
    steps: &'a mut [StepLedgerEntry],
    step_id: &str,
) -> Result<&'a mut StepLedgerEntry, StoreError> {
    steps
        .iter_mut()
        .find(|s| s.id == step_id)
        .ok_or_else(|| StoreError::StepNotFound(step_id.to_string()))
}
