//! SQLite 会话存储与步骤账本
//!
//! 快照与消息以 JSON 文本存在 sessions 表；账本条目存在 session_steps 表，
//! 按自增 seq 保持创建顺序。快照写入在事务内「读取后合并」。

#![cfg(feature = "async-sqlite")]

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;

use crate::core::StoreError;
use crate::memory::Message;
use crate::session::{
    SessionSnapshot, SessionStatus, SessionStore, SnapshotPatch, StepLedger, StepLedgerEntry,
    StepStatus,
};

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Database(err.to_string())
    }
}

pub struct SqliteSessionStore {
    pool: SqlitePool,
}

impl SqliteSessionStore {
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path.as_ref().display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;
        let store = Self { pool };
        store.init_tables().await?;
        tracing::info!(path = %db_path.as_ref().display(), "SQLite session store ready");
        Ok(store)
    }

    async fn init_tables(&self) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                status TEXT NOT NULL,
                error_message TEXT,
                snapshot TEXT,
                messages TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS session_steps (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                session_id TEXT NOT NULL,
                tool_name TEXT NOT NULL,
                status TEXT NOT NULL,
                input TEXT NOT NULL,
                output TEXT,
                error_message TEXT,
                duration_ms INTEGER,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_session_steps_session ON session_steps(session_id, seq)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// 校验 owner；会话不存在时返回 None
    async fn owner_of(&self, session_id: &str, owner_id: &str) -> Result<Option<()>, StoreError> {
        let row = sqlx::query("SELECT owner_id FROM sessions WHERE id = ?")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            None => Ok(None),
            Some(row) => {
                let owner: String = row.get("owner_id");
                if owner == owner_id {
                    Ok(Some(()))
                } else {
                    Err(StoreError::NotOwner {
                        session_id: session_id.to_string(),
                        owner_id: owner_id.to_string(),
                    })
                }
            }
        }
    }

    /// 会话不存在则创建（Idle）
    async fn ensure_session(&self, session_id: &str, owner_id: &str) -> Result<(), StoreError> {
        if self.owner_of(session_id, owner_id).await?.is_some() {
            return Ok(());
        }
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT OR IGNORE INTO sessions (id, owner_id, status, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(session_id)
        .bind(owner_id)
        .bind(SessionStatus::Idle.as_str())
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        // 并发插入时另一方可能已写入不同 owner
        self.owner_of(session_id, owner_id).await?;
        Ok(())
    }

    async fn set_status(
        &self,
        session_id: &str,
        owner_id: &str,
        status: SessionStatus,
        error_message: Option<&str>,
    ) -> Result<(), StoreError> {
        self.ensure_session(session_id, owner_id).await?;
        sqlx::query("UPDATE sessions SET status = ?, error_message = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(error_message)
            .bind(Utc::now().to_rfc3339())
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn finish_step(
        &self,
        step_id: &str,
        status: StepStatus,
        output: Option<String>,
        error_message: Option<&str>,
        duration_ms: u64,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE session_steps
             SET status = ?, output = ?, error_message = ?, duration_ms = ?, finished_at = ?
             WHERE id = ? AND status = 'running'",
        )
        .bind(status.as_str())
        .bind(output)
        .bind(error_message)
        .bind(duration_ms as i64)
        .bind(Utc::now().to_rfc3339())
        .bind(step_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(());
        }
        let exists = sqlx::query("SELECT 1 FROM session_steps WHERE id = ?")
            .bind(step_id)
            .fetch_optional(&self.pool)
            .await?
            .is_some();
        if exists {
            Err(StoreError::AlreadyTerminal(step_id.to_string()))
        } else {
            Err(StoreError::StepNotFound(step_id.to_string()))
        }
    }
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Database(format!("bad timestamp '{raw}': {e}")))
}

fn step_from_row(row: &SqliteRow) -> Result<StepLedgerEntry, StoreError> {
    let status: String = row.get("status");
    let input: String = row.get("input");
    let output: Option<String> = row.get("output");
    let started_at: String = row.get("started_at");
    let finished_at: Option<String> = row.get("finished_at");
    let duration_ms: Option<i64> = row.get("duration_ms");

    Ok(StepLedgerEntry {
        id: row.get("id"),
        session_id: row.get("session_id"),
        tool_name: row.get("tool_name"),
        status: StepStatus::parse(&status)
            .ok_or_else(|| StoreError::Database(format!("unknown step status '{status}'")))?,
        input: serde_json::from_str(&input)?,
        output: output.as_deref().map(serde_json::from_str).transpose()?,
        error_message: row.get("error_message"),
        duration_ms: duration_ms.map(|d| d.max(0) as u64),
        started_at: parse_time(&started_at)?,
        finished_at: finished_at.as_deref().map(parse_time).transpose()?,
    })
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn get_snapshot(
        &self,
        session_id: &str,
        owner_id: &str,
    ) -> Result<Option<SessionSnapshot>, StoreError> {
        if self.owner_of(session_id, owner_id).await?.is_none() {
            return Ok(None);
        }
        let row = sqlx::query("SELECT snapshot FROM sessions WHERE id = ?")
            .bind(session_id)
            .fetch_one(&self.pool)
            .await?;
        let raw: Option<String> = row.get("snapshot");
        Ok(raw.as_deref().map(serde_json::from_str).transpose()?)
    }

    async fn upsert_snapshot(
        &self,
        session_id: &str,
        owner_id: &str,
        patch: SnapshotPatch,
    ) -> Result<SessionSnapshot, StoreError> {
        self.ensure_session(session_id, owner_id).await?;

        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT snapshot FROM sessions WHERE id = ?")
            .bind(session_id)
            .fetch_one(&mut *tx)
            .await?;
        let raw: Option<String> = row.get("snapshot");
        let existing: Option<SessionSnapshot> = raw.as_deref().map(serde_json::from_str).transpose()?;
        let merged = SessionSnapshot::merge(existing, patch);

        sqlx::query("UPDATE sessions SET snapshot = ?, updated_at = ? WHERE id = ?")
            .bind(serde_json::to_string(&merged)?)
            .bind(Utc::now().to_rfc3339())
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(merged)
    }

    async fn get_status(
        &self,
        session_id: &str,
        owner_id: &str,
    ) -> Result<SessionStatus, StoreError> {
        if self.owner_of(session_id, owner_id).await?.is_none() {
            return Ok(SessionStatus::Idle);
        }
        let row = sqlx::query("SELECT status FROM sessions WHERE id = ?")
            .bind(session_id)
            .fetch_one(&self.pool)
            .await?;
        let status: String = row.get("status");
        SessionStatus::parse(&status)
            .ok_or_else(|| StoreError::Database(format!("unknown session status '{status}'")))
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
        self.set_status(session_id, owner_id, SessionStatus::Error, Some(message)).await
    }

    async fn save_messages(
        &self,
        session_id: &str,
        owner_id: &str,
        messages: &[Message],
    ) -> Result<(), StoreError> {
        self.ensure_session(session_id, owner_id).await?;
        sqlx::query("UPDATE sessions SET messages = ?, updated_at = ? WHERE id = ?")
            .bind(serde_json::to_string(messages)?)
            .bind(Utc::now().to_rfc3339())
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn load_messages(
        &self,
        session_id: &str,
        owner_id: &str,
    ) -> Result<Vec<Message>, StoreError> {
        if self.owner_of(session_id, owner_id).await?.is_none() {
            return Ok(Vec::new());
        }
        let row = sqlx::query("SELECT messages FROM sessions WHERE id = ?")
            .bind(session_id)
            .fetch_one(&self.pool)
            .await?;
        let raw: String = row.get("messages");
        Ok(serde_json::from_str(&raw)?)
    }
}

#[async_trait]
impl StepLedger for SqliteSessionStore {
    async fn create_step(
        &self,
        session_id: &str,
        owner_id: &str,
        tool_name: &str,
        input: &Value,
    ) -> Result<String, StoreError> {
        self.ensure_session(session_id, owner_id).await?;
        let entry = StepLedgerEntry::running(session_id, tool_name, input.clone());
        sqlx::query(
            "INSERT INTO session_steps (id, session_id, tool_name, status, input, started_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&entry.id)
        .bind(session_id)
        .bind(tool_name)
        .bind(entry.status.as_str())
        .bind(serde_json::to_string(input)?)
        .bind(entry.started_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(entry.id)
    }

    async fn complete_step(
        &self,
        step_id: &str,
        output: &Value,
        duration_ms: u64,
    ) -> Result<(), StoreError> {
        let output = serde_json::to_string(output)?;
        self.finish_step(step_id, StepStatus::Success, Some(output), None, duration_ms)
            .await
    }

    async fn fail_step(
        &self,
        step_id: &str,
        message: &str,
        duration_ms: u64,
    ) -> Result<(), StoreError> {
        self.finish_step(step_id, StepStatus::Error, None, Some(message), duration_ms)
            .await
    }

    async fn cancel_step(&self, step_id: &str, duration_ms: u64) -> Result<(), StoreError> {
        self.finish_step(step_id, StepStatus::Cancelled, None, None, duration_ms)
            .await
    }

    async fn list_steps(
        &self,
        session_id: &str,
        owner_id: &str,
    ) -> Result<Vec<StepLedgerEntry>, StoreError> {
        if self.owner_of(session_id, owner_id).await?.is_none() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query("SELECT * FROM session_steps WHERE session_id = ? ORDER BY seq ASC")
            .bind(session_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(step_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_snapshot_and_ledger_survive_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("sessions.db");

        let store = SqliteSessionStore::new(&db_path).await.unwrap();
        store.mark_running("s1", "alice").await.unwrap();
        let step = store
            .create_step("s1", "alice", "fetch_video", &json!({"url": "https://youtu.be/x"}))
            .await
            .unwrap();
        store.complete_step(&step, &json!({"id": "x"}), 40).await.unwrap();
        let mut patch = SnapshotPatch::default();
        patch.context = json!({"title": "Kyoto"}).as_object().cloned();
        store.upsert_snapshot("s1", "alice", patch).await.unwrap();
        store.close().await;

        let store = SqliteSessionStore::new(&db_path).await.unwrap();
        assert_eq!(store.get_status("s1", "alice").await.unwrap(), SessionStatus::Running);
        let snap = store.get_snapshot("s1", "alice").await.unwrap().unwrap();
        assert_eq!(snap.context["title"], "Kyoto");
        let steps = store.list_steps("s1", "alice").await.unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].status, StepStatus::Success);
        assert!(matches!(
            store.cancel_step(&step, 1).await,
            Err(StoreError::AlreadyTerminal(_))
        ));
        assert!(matches!(
            store.get_snapshot("s1", "bob").await,
            Err(StoreError::NotOwner { .. })
        ));
    }
}
