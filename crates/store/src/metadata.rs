//! Tenant-scoped sync metadata: pull cursor and sync timestamps.

use chrono::{DateTime, Utc};
use sqlx::Row;

use scanstock_core::TenantId;

use crate::db::{fmt_ts, parse_ts, Database};
use crate::error::StoreResult;

/// Key of the incremental pull cursor (last remote `updated_at` applied).
const KEY_PULL_CURSOR: &str = "pull_cursor";
/// Key of the last successful sync (push drained and pull finished).
const KEY_LAST_SYNC: &str = "last_sync";
/// Key of the last completed from-epoch pull; drives the staleness policy.
const KEY_LAST_FULL_SYNC: &str = "last_full_sync";

/// Key/value cursor store backing incremental pulls.
#[derive(Debug, Clone)]
pub struct SyncMetadataStore {
    db: Database,
}

impl SyncMetadataStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn get(&self, tenant_id: TenantId, key: &str) -> StoreResult<Option<String>> {
        let row = sqlx::query("SELECT value FROM sync_metadata WHERE tenant_id = ?1 AND key = ?2")
            .bind(tenant_id.to_string())
            .bind(key)
            .fetch_optional(self.db.pool())
            .await?;
        Ok(row.map(|r| r.try_get("value")).transpose()?)
    }

    pub async fn set(&self, tenant_id: TenantId, key: &str, value: &str) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_metadata (tenant_id, key, value, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(tenant_id, key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(tenant_id.to_string())
        .bind(key)
        .bind(value)
        .bind(fmt_ts(Utc::now()))
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    pub async fn delete(&self, tenant_id: TenantId, key: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM sync_metadata WHERE tenant_id = ?1 AND key = ?2")
            .bind(tenant_id.to_string())
            .bind(key)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    /// Last remote `updated_at` successfully applied by the pull step.
    pub async fn pull_cursor(&self, tenant_id: TenantId) -> StoreResult<Option<DateTime<Utc>>> {
        self.get_ts(tenant_id, KEY_PULL_CURSOR).await
    }

    pub async fn set_pull_cursor(
        &self,
        tenant_id: TenantId,
        cursor: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.set(tenant_id, KEY_PULL_CURSOR, &fmt_ts(cursor)).await
    }

    /// Reset the cursor to the epoch (forces the next pull to be full).
    pub async fn reset_pull_cursor(&self, tenant_id: TenantId) -> StoreResult<()> {
        self.delete(tenant_id, KEY_PULL_CURSOR).await
    }

    pub async fn last_sync(&self, tenant_id: TenantId) -> StoreResult<Option<DateTime<Utc>>> {
        self.get_ts(tenant_id, KEY_LAST_SYNC).await
    }

    pub async fn set_last_sync(&self, tenant_id: TenantId, at: DateTime<Utc>) -> StoreResult<()> {
        self.set(tenant_id, KEY_LAST_SYNC, &fmt_ts(at)).await
    }

    pub async fn last_full_sync(&self, tenant_id: TenantId) -> StoreResult<Option<DateTime<Utc>>> {
        self.get_ts(tenant_id, KEY_LAST_FULL_SYNC).await
    }

    pub async fn set_last_full_sync(
        &self,
        tenant_id: TenantId,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.set(tenant_id, KEY_LAST_FULL_SYNC, &fmt_ts(at)).await
    }

    async fn get_ts(
        &self,
        tenant_id: TenantId,
        key: &str,
    ) -> StoreResult<Option<DateTime<Utc>>> {
        self.get(tenant_id, key)
            .await?
            .map(|s| parse_ts("sync_metadata", &s))
            .transpose()
    }
}
