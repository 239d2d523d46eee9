//! Database lifecycle: open, schema migration, tenant activation.
//!
//! The schema is versioned as a whole. A version bump wipes all four tables
//! instead of attempting a field-level migration — the store is a disposable
//! cache of remote state plus a queue that is only meaningful for the tenant
//! that wrote it.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

use scanstock_core::TenantId;

use crate::error::{StoreError, StoreResult};

/// Current schema version. Bumping this wipes all four tables on open.
const SCHEMA_VERSION: i64 = 1;

/// Tables holding tenant-partitioned data, wiped together on tenant switch
/// and on schema version bump.
const TENANT_TABLES: [&str; 4] = [
    "cached_items",
    "pending_changes",
    "scan_sessions",
    "sync_metadata",
];

/// Handle to the local SQLite database.
///
/// Cheap to clone; constructed explicitly and injected into the stores —
/// there is no process-wide singleton. Lifecycle is tied to the current
/// tenant/session via [`Database::activate_tenant`].
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (and if necessary create) the database at `path`, running
    /// migrations.
    pub async fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Database(sqlx::Error::Io(e))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new().connect_with(options).await?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// Open the database at the default per-user data path.
    pub async fn open_default() -> StoreResult<Self> {
        Self::open(&default_db_path()?).await
    }

    /// Open an in-memory database (tests, throwaway sessions).
    pub async fn open_in_memory() -> StoreResult<Self> {
        // A pooled in-memory SQLite database lives and dies with its single
        // connection; pin the pool to exactly one connection that never
        // expires.
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(StoreError::Database)?;
        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create or upgrade the schema. A stored version different from
    /// [`SCHEMA_VERSION`] drops and recreates all four tables.
    pub(crate) async fn migrate(&self) -> StoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS meta (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        let stored: Option<i64> = sqlx::query("SELECT value FROM meta WHERE key = 'schema_version'")
            .fetch_optional(&self.pool)
            .await?
            .and_then(|row| {
                row.try_get::<String, _>("value")
                    .ok()
                    .and_then(|v| v.parse().ok())
            });

        if let Some(version) = stored {
            if version != SCHEMA_VERSION {
                tracing::warn!(
                    stored = version,
                    current = SCHEMA_VERSION,
                    "schema version changed; wiping local store"
                );
                for table in TENANT_TABLES {
                    sqlx::query(&format!("DROP TABLE IF EXISTS {table}"))
                        .execute(&self.pool)
                        .await?;
                }
            }
        }

        self.create_tables().await?;

        sqlx::query(
            r#"
            INSERT INTO meta (key, value) VALUES ('schema_version', ?1)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(SCHEMA_VERSION.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn create_tables(&self) -> StoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cached_items (
                tenant_id    TEXT NOT NULL,
                id           TEXT NOT NULL,
                barcode      TEXT NULL,
                sku          TEXT NULL,
                name         TEXT NOT NULL,
                quantity     INTEGER NOT NULL,
                min_quantity INTEGER NULL,
                price        REAL NULL,
                image_url    TEXT NULL,
                folder_id    TEXT NULL,
                folder_name  TEXT NULL,
                updated_at   TEXT NOT NULL,
                synced_at    TEXT NOT NULL,
                PRIMARY KEY (tenant_id, id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_cached_items_barcode
             ON cached_items (tenant_id, barcode)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_cached_items_sku
             ON cached_items (tenant_id, sku)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pending_changes (
                id          TEXT PRIMARY KEY,
                tenant_id   TEXT NOT NULL,
                kind        TEXT NOT NULL,
                entity_type TEXT NOT NULL,
                entity_id   TEXT NOT NULL,
                payload     TEXT NOT NULL,
                status      TEXT NOT NULL,
                created_at  TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                last_error  TEXT NULL,
                synced_at   TEXT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_pending_changes_drain
             ON pending_changes (tenant_id, status, created_at)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_pending_changes_entity
             ON pending_changes (tenant_id, entity_id)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS scan_sessions (
                id           TEXT PRIMARY KEY,
                tenant_id    TEXT NOT NULL,
                mode         TEXT NOT NULL,
                items        TEXT NOT NULL,
                created_at   TEXT NOT NULL,
                updated_at   TEXT NOT NULL,
                completed_at TEXT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_scan_sessions_resume
             ON scan_sessions (tenant_id, updated_at)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_metadata (
                tenant_id  TEXT NOT NULL,
                key        TEXT NOT NULL,
                value      TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (tenant_id, key)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Make `tenant_id` the active tenant.
    ///
    /// If a different tenant was active before, all four tables are cleared
    /// in a single transaction before any data for the new tenant is
    /// admitted — cached rows from another tenant must never be readable.
    pub async fn activate_tenant(&self, tenant_id: TenantId) -> StoreResult<()> {
        let active: Option<String> =
            sqlx::query("SELECT value FROM meta WHERE key = 'active_tenant'")
                .fetch_optional(&self.pool)
                .await?
                .and_then(|row| row.try_get("value").ok());

        let tenant_str = tenant_id.to_string();
        if active.as_deref() == Some(tenant_str.as_str()) {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        if active.is_some() {
            tracing::info!(tenant = %tenant_id, "tenant switch; clearing local store");
            for table in TENANT_TABLES {
                sqlx::query(&format!("DELETE FROM {table}"))
                    .execute(&mut *tx)
                    .await?;
            }
        }
        sqlx::query(
            r#"
            INSERT INTO meta (key, value) VALUES ('active_tenant', ?1)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(&tenant_str)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(())
    }

    /// Clear every row belonging to `tenant_id` from all four tables, in one
    /// transaction.
    pub async fn clear_tenant(&self, tenant_id: TenantId) -> StoreResult<()> {
        let tenant_str = tenant_id.to_string();
        let mut tx = self.pool.begin().await?;
        for table in TENANT_TABLES {
            sqlx::query(&format!("DELETE FROM {table} WHERE tenant_id = ?1"))
                .bind(&tenant_str)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

/// Format a timestamp for storage. RFC 3339 in UTC; lexicographic order
/// matches chronological order.
pub(crate) fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

/// Parse a stored timestamp back.
pub(crate) fn parse_ts(table: &'static str, s: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::corrupt(table, format!("bad timestamp '{s}': {e}")))
}

/// Resolve the default database path:
/// `{app_data_dir}/scanstock/offline.db`.
fn default_db_path() -> StoreResult<PathBuf> {
    let base = dirs::data_dir()
        .or_else(|| {
            dirs::home_dir().map(|mut h| {
                h.push(".local");
                h.push("share");
                h
            })
        })
        .ok_or_else(|| StoreError::NotFound("OS app data directory".to_string()))?;

    let mut dir = base;
    dir.push("scanstock");
    dir.push("offline.db");
    Ok(dir)
}
