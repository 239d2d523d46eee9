//! Crash-resilient scan session store.
//!
//! Each scan event is persisted immediately so an interrupted batch scan
//! resumes from the last durable line instead of being lost. Completed
//! sessions are archived, never deleted.

use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use scanstock_core::{ScanLine, ScanMode, ScanSession, SessionId, TenantId};

use crate::db::{fmt_ts, parse_ts, Database};
use crate::error::{StoreError, StoreResult};

/// SQLite-backed store of scan sessions.
#[derive(Debug, Clone)]
pub struct ScanSessionStore {
    db: Database,
}

impl ScanSessionStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Start a new scan session.
    pub async fn create(&self, tenant_id: TenantId, mode: ScanMode) -> StoreResult<ScanSession> {
        let session = ScanSession::new(tenant_id, mode);
        sqlx::query(
            r#"
            INSERT INTO scan_sessions (
                id, tenant_id, mode, items, created_at, updated_at, completed_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL)
            "#,
        )
        .bind(session.id.to_string())
        .bind(session.tenant_id.to_string())
        .bind(session.mode.as_str())
        .bind(serde_json::to_string(&session.items)?)
        .bind(fmt_ts(session.created_at))
        .bind(fmt_ts(session.updated_at))
        .execute(self.db.pool())
        .await?;

        Ok(session)
    }

    pub async fn get(&self, id: SessionId) -> StoreResult<Option<ScanSession>> {
        let row = sqlx::query("SELECT * FROM scan_sessions WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(self.db.pool())
            .await?;
        row.map(row_to_session).transpose()
    }

    /// Append one scan event to a session and bump `updated_at`.
    ///
    /// Fails with [`StoreError::SessionCompleted`] on an archived session —
    /// completion is terminal.
    pub async fn record_scan(&self, id: SessionId, line: ScanLine) -> StoreResult<ScanSession> {
        let mut session = self
            .get(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("scan session {id}")))?;

        if session.is_completed() {
            return Err(StoreError::SessionCompleted(id));
        }

        session.items.push(line);
        session.updated_at = Utc::now();

        sqlx::query("UPDATE scan_sessions SET items = ?2, updated_at = ?3 WHERE id = ?1")
            .bind(id.to_string())
            .bind(serde_json::to_string(&session.items)?)
            .bind(fmt_ts(session.updated_at))
            .execute(self.db.pool())
            .await?;

        Ok(session)
    }

    /// Complete a session. Terminal and idempotent: the first call sets
    /// `completed_at`, later calls return the archived session unchanged.
    pub async fn complete(&self, id: SessionId) -> StoreResult<ScanSession> {
        let mut session = self
            .get(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("scan session {id}")))?;

        if session.is_completed() {
            return Ok(session);
        }

        let now = Utc::now();
        session.completed_at = Some(now);
        session.updated_at = now;

        sqlx::query(
            "UPDATE scan_sessions SET completed_at = ?2, updated_at = ?2 WHERE id = ?1",
        )
        .bind(id.to_string())
        .bind(fmt_ts(now))
        .execute(self.db.pool())
        .await?;

        Ok(session)
    }

    /// The most recently touched incomplete session, if any — the resume
    /// point after a crash.
    pub async fn resume_latest_incomplete(
        &self,
        tenant_id: TenantId,
    ) -> StoreResult<Option<ScanSession>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM scan_sessions
            WHERE tenant_id = ?1 AND completed_at IS NULL
            ORDER BY updated_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(tenant_id.to_string())
        .fetch_optional(self.db.pool())
        .await?;
        row.map(row_to_session).transpose()
    }

    /// Recent sessions for a tenant, newest first (audit view).
    pub async fn list_recent(
        &self,
        tenant_id: TenantId,
        limit: u32,
    ) -> StoreResult<Vec<ScanSession>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM scan_sessions
            WHERE tenant_id = ?1
            ORDER BY created_at DESC, id DESC
            LIMIT ?2
            "#,
        )
        .bind(tenant_id.to_string())
        .bind(limit as i64)
        .fetch_all(self.db.pool())
        .await?;
        rows.into_iter().map(row_to_session).collect()
    }
}

/// Map a database row into a `ScanSession`.
fn row_to_session(row: SqliteRow) -> StoreResult<ScanSession> {
    use std::str::FromStr;

    let id_str: String = row.try_get("id")?;
    let id = SessionId::from_str(&id_str)
        .map_err(|e| StoreError::corrupt("scan_sessions", e.to_string()))?;

    let tenant_str: String = row.try_get("tenant_id")?;
    let tenant_id = TenantId::from_str(&tenant_str)
        .map_err(|e| StoreError::corrupt("scan_sessions", e.to_string()))?;

    let mode_str: String = row.try_get("mode")?;
    let mode = ScanMode::parse(&mode_str)
        .map_err(|e| StoreError::corrupt("scan_sessions", e.to_string()))?;

    let items_str: String = row.try_get("items")?;
    let items: Vec<ScanLine> = serde_json::from_str(&items_str)?;

    let created_at_str: String = row.try_get("created_at")?;
    let updated_at_str: String = row.try_get("updated_at")?;
    let completed_at_str: Option<String> = row.try_get("completed_at")?;

    Ok(ScanSession {
        id,
        tenant_id,
        mode,
        items,
        created_at: parse_ts("scan_sessions", &created_at_str)?,
        updated_at: parse_ts("scan_sessions", &updated_at_str)?,
        completed_at: completed_at_str
            .map(|s| parse_ts("scan_sessions", &s))
            .transpose()?,
    })
}
