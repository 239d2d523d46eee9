//! Local replica store: the device-resident cache of remote inventory items.
//!
//! Reads never depend on connectivity; absence of an item is a normal case,
//! not an error. Writes come from two places only: the sync reconciler's
//! pull step (`upsert_many`) and optimistic application of queued changes
//! (`apply_quantity_delta`).

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use scanstock_core::{CachedItem, ItemId, ItemStatus, RemoteItem, TenantId};

use crate::db::{fmt_ts, parse_ts, Database};
use crate::error::StoreResult;

/// Aggregate statistics about the cached replica for one tenant.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicaStats {
    pub item_count: u64,
    /// Most recent local fetch timestamp across all cached items.
    pub last_synced_at: Option<DateTime<Utc>>,
}

/// SQLite-backed cache of the scan-relevant item projection.
#[derive(Debug, Clone)]
pub struct ReplicaStore {
    db: Database,
}

impl ReplicaStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Upsert a page of pulled items.
    ///
    /// Idempotent, last-write-wins keyed by item id: a row is only
    /// overwritten when the incoming `updated_at` is not older than the
    /// stored one, so repeated or out-of-order pulls converge. Items without
    /// a barcode or SKU are skipped — only scan-relevant items are cached.
    ///
    /// Returns the number of items written.
    pub async fn upsert_many(&self, items: Vec<RemoteItem>) -> StoreResult<usize> {
        let synced_at = Utc::now();
        let mut written = 0usize;

        let mut tx = self.db.pool().begin().await?;
        for remote in items {
            if !remote.is_scan_relevant() {
                tracing::debug!(item = %remote.id, "skipping item without barcode/sku");
                continue;
            }
            let item = remote.into_cached(synced_at);
            sqlx::query(
                r#"
                INSERT INTO cached_items (
                    tenant_id, id, barcode, sku, name,
                    quantity, min_quantity, price, image_url,
                    folder_id, folder_name, updated_at, synced_at
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                ON CONFLICT(tenant_id, id) DO UPDATE SET
                    barcode      = excluded.barcode,
                    sku          = excluded.sku,
                    name         = excluded.name,
                    quantity     = excluded.quantity,
                    min_quantity = excluded.min_quantity,
                    price        = excluded.price,
                    image_url    = excluded.image_url,
                    folder_id    = excluded.folder_id,
                    folder_name  = excluded.folder_name,
                    updated_at   = excluded.updated_at,
                    synced_at    = excluded.synced_at
                WHERE excluded.updated_at >= cached_items.updated_at
                "#,
            )
            .bind(item.tenant_id.to_string())
            .bind(item.id.to_string())
            .bind(&item.barcode)
            .bind(&item.sku)
            .bind(&item.name)
            .bind(item.quantity)
            .bind(item.min_quantity)
            .bind(item.price)
            .bind(&item.image_url)
            .bind(&item.folder_id)
            .bind(&item.folder_name)
            .bind(fmt_ts(item.updated_at))
            .bind(fmt_ts(item.synced_at))
            .execute(&mut *tx)
            .await?;
            written += 1;
        }
        tx.commit().await?;

        Ok(written)
    }

    /// Scanner hot path: indexed lookup by barcode or SKU.
    ///
    /// A barcode match wins over a SKU match when both exist. Returns `None`
    /// when absent.
    pub async fn get_by_barcode_or_sku(
        &self,
        tenant_id: TenantId,
        code: &str,
    ) -> StoreResult<Option<CachedItem>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM cached_items
            WHERE tenant_id = ?1 AND (barcode = ?2 OR sku = ?2)
            ORDER BY CASE WHEN barcode = ?2 THEN 0 ELSE 1 END
            LIMIT 1
            "#,
        )
        .bind(tenant_id.to_string())
        .bind(code)
        .fetch_optional(self.db.pool())
        .await?;

        row.map(row_to_item).transpose()
    }

    /// Lookup by item id.
    pub async fn get_by_id(
        &self,
        tenant_id: TenantId,
        item_id: ItemId,
    ) -> StoreResult<Option<CachedItem>> {
        let row = sqlx::query("SELECT * FROM cached_items WHERE tenant_id = ?1 AND id = ?2")
            .bind(tenant_id.to_string())
            .bind(item_id.to_string())
            .fetch_optional(self.db.pool())
            .await?;

        row.map(row_to_item).transpose()
    }

    /// Optimistically apply a quantity delta to a cached item, clamping at
    /// zero. The remote quantity stays authoritative; the next pull will
    /// reconcile.
    ///
    /// Returns the updated item, or `None` if it is not cached.
    pub async fn apply_quantity_delta(
        &self,
        tenant_id: TenantId,
        item_id: ItemId,
        delta: i64,
    ) -> StoreResult<Option<CachedItem>> {
        let Some(mut item) = self.get_by_id(tenant_id, item_id).await? else {
            return Ok(None);
        };
        item.apply_delta(delta);

        sqlx::query("UPDATE cached_items SET quantity = ?3 WHERE tenant_id = ?1 AND id = ?2")
            .bind(tenant_id.to_string())
            .bind(item_id.to_string())
            .bind(item.quantity)
            .execute(self.db.pool())
            .await?;

        Ok(Some(item))
    }

    /// Aggregate statistics for the UI (cached item count, freshest fetch).
    pub async fn get_stats(&self, tenant_id: TenantId) -> StoreResult<ReplicaStats> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n, MAX(synced_at) AS latest
             FROM cached_items WHERE tenant_id = ?1",
        )
        .bind(tenant_id.to_string())
        .fetch_one(self.db.pool())
        .await?;

        let item_count: i64 = row.try_get("n")?;
        let latest: Option<String> = row.try_get("latest")?;
        let last_synced_at = latest
            .map(|s| parse_ts("cached_items", &s))
            .transpose()?;

        Ok(ReplicaStats {
            item_count: item_count as u64,
            last_synced_at,
        })
    }

    /// Drop every cached item for a tenant (full cache invalidation).
    pub async fn clear_for_tenant(&self, tenant_id: TenantId) -> StoreResult<()> {
        sqlx::query("DELETE FROM cached_items WHERE tenant_id = ?1")
            .bind(tenant_id.to_string())
            .execute(self.db.pool())
            .await?;
        Ok(())
    }
}

/// Map a database row into a `CachedItem`.
///
/// The derived status is recomputed here rather than stored: a stale or
/// upstream-provided status column is never trusted.
fn row_to_item(row: SqliteRow) -> StoreResult<CachedItem> {
    use crate::error::StoreError;
    use std::str::FromStr;

    let tenant_str: String = row.try_get("tenant_id")?;
    let tenant_id = TenantId::from_str(&tenant_str)
        .map_err(|e| StoreError::corrupt("cached_items", e.to_string()))?;

    let id_str: String = row.try_get("id")?;
    let id = ItemId::from_str(&id_str)
        .map_err(|e| StoreError::corrupt("cached_items", e.to_string()))?;

    let quantity: i64 = row.try_get("quantity")?;
    let min_quantity: Option<i64> = row.try_get("min_quantity")?;

    let updated_at_str: String = row.try_get("updated_at")?;
    let synced_at_str: String = row.try_get("synced_at")?;

    Ok(CachedItem {
        id,
        tenant_id,
        barcode: row.try_get("barcode")?,
        sku: row.try_get("sku")?,
        name: row.try_get("name")?,
        quantity,
        min_quantity,
        price: row.try_get("price")?,
        image_url: row.try_get("image_url")?,
        folder_id: row.try_get("folder_id")?,
        folder_name: row.try_get("folder_name")?,
        status: ItemStatus::derive(quantity, min_quantity),
        updated_at: parse_ts("cached_items", &updated_at_str)?,
        synced_at: parse_ts("cached_items", &synced_at_str)?,
    })
}
