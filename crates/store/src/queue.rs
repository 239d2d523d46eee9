//! Durable pending change queue.
//!
//! The queue is the single write path for user mutations, online or offline.
//! Enqueue is fail-closed: if the change cannot be durably recorded the
//! operation errors instead of accepting an in-memory-only mutation.
//!
//! Drain order is FIFO by `created_at`, but application order per entity is
//! the real invariant: two changes to the same entity are never in flight at
//! the same time and never reordered relative to each other.

use chrono::{Duration, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use scanstock_core::{ChangeId, ChangeKind, ChangeStatus, PendingChange, TenantId};

use crate::db::{fmt_ts, parse_ts, Database};
use crate::error::{StoreError, StoreResult};

/// SQLite-backed queue of pending changes.
#[derive(Debug, Clone)]
pub struct ChangeQueue {
    db: Database,
}

impl ChangeQueue {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Durably append a change. Never blocks on connectivity; errors only if
    /// the local store cannot record it.
    pub async fn enqueue(&self, change: &PendingChange) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO pending_changes (
                id, tenant_id, kind, entity_type, entity_id,
                payload, status, created_at, retry_count, last_error, synced_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, NULL)
            "#,
        )
        .bind(change.id.to_string())
        .bind(change.tenant_id.to_string())
        .bind(change.kind.as_str())
        .bind(&change.entity_type)
        .bind(&change.entity_id)
        .bind(change.payload.to_string())
        .bind(change.status.as_str())
        .bind(fmt_ts(change.created_at))
        .bind(change.retry_count as i64)
        .bind(&change.last_error)
        .execute(self.db.pool())
        .await?;

        Ok(())
    }

    /// Claim up to `max` pending changes for syncing, in `created_at` order.
    ///
    /// Entities that already have a change in `syncing` state are excluded,
    /// and a batch contains at most one change per entity — a later change
    /// for an entity only becomes claimable once the earlier one has left
    /// the `syncing` state. Claimed changes are atomically moved to
    /// `syncing`.
    pub async fn claim_next_batch(
        &self,
        tenant_id: TenantId,
        max: usize,
    ) -> StoreResult<Vec<PendingChange>> {
        let tenant_str = tenant_id.to_string();

        let mut tx = self.db.pool().begin().await?;

        let rows = sqlx::query(
            r#"
            SELECT * FROM pending_changes
            WHERE tenant_id = ?1
              AND status = 'pending'
              AND entity_id NOT IN (
                  SELECT entity_id FROM pending_changes
                  WHERE tenant_id = ?1 AND status = 'syncing'
              )
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(&tenant_str)
        .fetch_all(&mut *tx)
        .await?;

        let mut claimed = Vec::new();
        let mut seen_entities = std::collections::HashSet::new();
        for row in rows {
            if claimed.len() >= max {
                break;
            }
            let change = row_to_change(row)?;
            if !seen_entities.insert(change.entity_id.clone()) {
                continue;
            }
            claimed.push(change);
        }

        for change in &mut claimed {
            sqlx::query("UPDATE pending_changes SET status = 'syncing' WHERE id = ?1")
                .bind(change.id.to_string())
                .execute(&mut *tx)
                .await?;
            change.status = ChangeStatus::Syncing;
        }

        tx.commit().await?;
        Ok(claimed)
    }

    /// Mark a change as acknowledged by the remote store. Retained until
    /// pruned.
    pub async fn mark_completed(&self, id: ChangeId) -> StoreResult<()> {
        sqlx::query(
            "UPDATE pending_changes
             SET status = 'completed', synced_at = ?2, last_error = NULL
             WHERE id = ?1",
        )
        .bind(id.to_string())
        .bind(fmt_ts(Utc::now()))
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    /// Mark a change as rejected by the remote store. The change is retained
    /// with its error and requires explicit retry or user resolution.
    pub async fn mark_failed(&self, id: ChangeId, error: &str) -> StoreResult<()> {
        sqlx::query(
            "UPDATE pending_changes
             SET status = 'failed', retry_count = retry_count + 1, last_error = ?2
             WHERE id = ?1",
        )
        .bind(id.to_string())
        .bind(error)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    /// Return a change hit by a transient error to the pending state so the
    /// next sync pass picks it up again.
    pub async fn mark_retry(&self, id: ChangeId, error: &str) -> StoreResult<()> {
        sqlx::query(
            "UPDATE pending_changes
             SET status = 'pending', retry_count = retry_count + 1, last_error = ?2
             WHERE id = ?1",
        )
        .bind(id.to_string())
        .bind(error)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    /// Reset one failed change back to pending (operator/user retry).
    pub async fn retry_failed(&self, id: ChangeId) -> StoreResult<()> {
        sqlx::query(
            "UPDATE pending_changes
             SET status = 'pending', retry_count = 0, last_error = NULL
             WHERE id = ?1 AND status = 'failed'",
        )
        .bind(id.to_string())
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    /// Reset every failed change for a tenant back to pending.
    pub async fn retry_all_failed(&self, tenant_id: TenantId) -> StoreResult<u64> {
        let result = sqlx::query(
            "UPDATE pending_changes
             SET status = 'pending', retry_count = 0, last_error = NULL
             WHERE tenant_id = ?1 AND status = 'failed'",
        )
        .bind(tenant_id.to_string())
        .execute(self.db.pool())
        .await?;
        Ok(result.rows_affected())
    }

    /// Crash recovery: changes stranded in `syncing` by an interrupted sync
    /// pass go back to `pending`. Called once at engine startup.
    pub async fn requeue_syncing(&self, tenant_id: TenantId) -> StoreResult<u64> {
        let result = sqlx::query(
            "UPDATE pending_changes SET status = 'pending'
             WHERE tenant_id = ?1 AND status = 'syncing'",
        )
        .bind(tenant_id.to_string())
        .execute(self.db.pool())
        .await?;
        let requeued = result.rows_affected();
        if requeued > 0 {
            tracing::info!(tenant = %tenant_id, requeued, "requeued stranded syncing changes");
        }
        Ok(requeued)
    }

    /// All not-yet-completed changes for one entity, oldest first.
    pub async fn list_pending_for_entity(
        &self,
        tenant_id: TenantId,
        entity_id: &str,
    ) -> StoreResult<Vec<PendingChange>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM pending_changes
            WHERE tenant_id = ?1 AND entity_id = ?2 AND status IN ('pending', 'syncing')
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(tenant_id.to_string())
        .bind(entity_id)
        .fetch_all(self.db.pool())
        .await?;

        rows.into_iter().map(row_to_change).collect()
    }

    /// All failed changes for a tenant, oldest first.
    pub async fn list_failed(&self, tenant_id: TenantId) -> StoreResult<Vec<PendingChange>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM pending_changes
            WHERE tenant_id = ?1 AND status = 'failed'
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(tenant_id.to_string())
        .fetch_all(self.db.pool())
        .await?;

        rows.into_iter().map(row_to_change).collect()
    }

    pub async fn pending_count(&self, tenant_id: TenantId) -> StoreResult<u64> {
        self.count_with_status(tenant_id, &["pending", "syncing"]).await
    }

    pub async fn failed_count(&self, tenant_id: TenantId) -> StoreResult<u64> {
        self.count_with_status(tenant_id, &["failed"]).await
    }

    async fn count_with_status(
        &self,
        tenant_id: TenantId,
        statuses: &[&str],
    ) -> StoreResult<u64> {
        let placeholders = statuses
            .iter()
            .enumerate()
            .map(|(i, _)| format!("?{}", i + 2))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT COUNT(*) AS n FROM pending_changes
             WHERE tenant_id = ?1 AND status IN ({placeholders})"
        );
        let mut query = sqlx::query(&sql).bind(tenant_id.to_string());
        for status in statuses {
            query = query.bind(*status);
        }
        let row = query.fetch_one(self.db.pool()).await?;
        let n: i64 = row.try_get("n")?;
        Ok(n as u64)
    }

    /// Delete completed changes older than `retention` (default call site
    /// uses 7 days). Failed changes are never pruned.
    pub async fn prune_completed(&self, retention: Duration) -> StoreResult<u64> {
        let cutoff = fmt_ts(Utc::now() - retention);
        let result = sqlx::query(
            "DELETE FROM pending_changes
             WHERE status = 'completed' AND synced_at IS NOT NULL AND synced_at < ?1",
        )
        .bind(&cutoff)
        .execute(self.db.pool())
        .await?;
        Ok(result.rows_affected())
    }
}

/// Map a database row into a `PendingChange`.
fn row_to_change(row: SqliteRow) -> StoreResult<PendingChange> {
    use std::str::FromStr;

    let id_str: String = row.try_get("id")?;
    let id = ChangeId::from_str(&id_str)
        .map_err(|e| StoreError::corrupt("pending_changes", e.to_string()))?;

    let tenant_str: String = row.try_get("tenant_id")?;
    let tenant_id = TenantId::from_str(&tenant_str)
        .map_err(|e| StoreError::corrupt("pending_changes", e.to_string()))?;

    let kind_str: String = row.try_get("kind")?;
    let kind = ChangeKind::parse(&kind_str)
        .map_err(|e| StoreError::corrupt("pending_changes", e.to_string()))?;

    let status_str: String = row.try_get("status")?;
    let status = ChangeStatus::parse(&status_str)
        .map_err(|e| StoreError::corrupt("pending_changes", e.to_string()))?;

    let payload_str: String = row.try_get("payload")?;
    let payload = serde_json::from_str(&payload_str)?;

    let created_at_str: String = row.try_get("created_at")?;
    let retry_count: i64 = row.try_get("retry_count")?;

    Ok(PendingChange {
        id,
        tenant_id,
        kind,
        entity_type: row.try_get("entity_type")?,
        entity_id: row.try_get("entity_id")?,
        payload,
        created_at: parse_ts("pending_changes", &created_at_str)?,
        retry_count: retry_count as u32,
        last_error: row.try_get("last_error")?,
        status,
    })
}
