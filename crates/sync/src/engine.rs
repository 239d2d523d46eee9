//! The offline engine: the facade the client shell talks to.
//!
//! One engine serves one tenant. Construction activates the tenant
//! partition (wiping stale data from a previous tenant), recovers changes
//! stranded mid-sync by a crash, and prunes old completed changes. `start`
//! wires the connectivity monitor to the reconciler and begins probing.

use std::sync::{Arc, Mutex, Weak};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;

use scanstock_core::{CachedItem, ItemId, PendingChange, ScanLine, ScanLineStatus, ScanMode,
    ScanSession, SessionId, TenantId};
use scanstock_store::{
    ChangeQueue, Database, ReplicaStore, ScanSessionStore, StoreError, SyncMetadataStore,
};

use crate::monitor::{ConnectivityEvent, ConnectivityMonitor, ConnectivityState, ListenerId,
    LivenessProbe, MonitorConfig};
use crate::reconciler::{SyncConfig, SyncError, SyncOutcome, SyncReconciler};
use crate::remote::RemoteStore;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Sync(#[from] SyncError),
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Engine tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub sync: SyncConfig,
    pub monitor: MonitorConfig,
    /// Replica age beyond which a triggered sync becomes a full refresh.
    pub stale_after: Duration,
    /// How long completed changes stay in the queue before pruning.
    pub completed_retention: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sync: SyncConfig::default(),
            monitor: MonitorConfig::default(),
            stale_after: Duration::hours(24),
            completed_retention: Duration::days(7),
        }
    }
}

/// Snapshot of sync health for the UI status bar.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncStats {
    pub pending_changes: u64,
    pub failed_changes: u64,
    pub cached_items: u64,
    pub last_sync: Option<DateTime<Utc>>,
    pub last_full_sync: Option<DateTime<Utc>>,
    /// No full sync has completed within the staleness window.
    pub is_stale: bool,
    pub is_syncing: bool,
    pub connectivity: ConnectivityState,
}

/// Per-tenant offline engine.
///
/// All collaborators are injected; the engine owns no globals. Cheap to
/// share behind an `Arc` (which [`OfflineEngine::start`] requires so spawned
/// sync tasks can hold a weak handle back to it).
pub struct OfflineEngine {
    tenant_id: TenantId,
    replica: ReplicaStore,
    queue: ChangeQueue,
    sessions: ScanSessionStore,
    metadata: SyncMetadataStore,
    reconciler: SyncReconciler,
    monitor: ConnectivityMonitor,
    config: EngineConfig,
    probe_task: Mutex<Option<JoinHandle<()>>>,
}

impl OfflineEngine {
    /// Build an engine for one tenant.
    ///
    /// Side effects, in order: the tenant partition is activated (wiping
    /// all local data if the tenant changed since last run), changes
    /// stranded in `syncing` are returned to `pending`, and completed
    /// changes past retention are pruned.
    pub async fn new(
        db: Database,
        remote: Arc<dyn RemoteStore>,
        probe: Arc<dyn LivenessProbe>,
        tenant_id: TenantId,
        config: EngineConfig,
    ) -> EngineResult<Arc<Self>> {
        db.activate_tenant(tenant_id).await?;

        let replica = ReplicaStore::new(db.clone());
        let queue = ChangeQueue::new(db.clone());
        let sessions = ScanSessionStore::new(db.clone());
        let metadata = SyncMetadataStore::new(db);

        queue.requeue_syncing(tenant_id).await?;
        let pruned = queue.prune_completed(config.completed_retention).await?;
        if pruned > 0 {
            tracing::debug!(tenant = %tenant_id, pruned, "pruned old completed changes");
        }

        let reconciler = SyncReconciler::new(
            remote,
            queue.clone(),
            replica.clone(),
            metadata.clone(),
            config.sync,
        );
        let monitor = ConnectivityMonitor::new(probe, config.monitor);

        Ok(Arc::new(Self {
            tenant_id,
            replica,
            queue,
            sessions,
            metadata,
            reconciler,
            monitor,
            config,
            probe_task: Mutex::new(None),
        }))
    }

    /// Wire the monitor's debounced trigger to the reconciler and start the
    /// probe loop. Idempotent only in the sense that calling it twice
    /// replaces the previous probe task.
    pub fn start(self: &Arc<Self>) {
        let engine = Arc::downgrade(self);
        self.monitor.set_sync_trigger(move || {
            let Some(engine) = Weak::upgrade(&engine) else {
                return;
            };
            tokio::spawn(async move {
                if let Err(err) = engine.triggered_sync().await {
                    tracing::error!(error = ?err, "triggered sync pass failed");
                }
            });
        });

        let task = self.monitor.start();
        let previous = self.probe_task.lock().unwrap_or_else(|e| e.into_inner()).replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }

        tracing::info!(tenant = %self.tenant_id, "offline engine started");
    }

    /// Stop probing and cancel any scheduled sync. An in-flight sync pass is
    /// allowed to finish.
    pub fn shutdown(&self) {
        self.monitor.shutdown();
        if let Some(task) = self.probe_task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
        }
        tracing::info!(tenant = %self.tenant_id, "offline engine stopped");
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    // ---- lookups ---------------------------------------------------------

    /// Scanner hot path: resolve a scanned code against the local replica.
    /// Never touches the network; `None` means "not cached", not "absent
    /// remotely".
    pub async fn get_cached_item(&self, code: &str) -> EngineResult<Option<CachedItem>> {
        Ok(self.replica.get_by_barcode_or_sku(self.tenant_id, code).await?)
    }

    pub async fn get_cached_item_by_id(
        &self,
        item_id: ItemId,
    ) -> EngineResult<Option<CachedItem>> {
        Ok(self.replica.get_by_id(self.tenant_id, item_id).await?)
    }

    // ---- mutations -------------------------------------------------------

    /// Record a quantity adjustment as a delta.
    ///
    /// The change is durably enqueued first (fail-closed: a storage error
    /// aborts the whole operation), then applied optimistically to the
    /// cached copy, then a debounced sync is requested if online. Returns
    /// the optimistically updated item, or `None` if it is not cached.
    pub async fn adjust_quantity(
        &self,
        item_id: ItemId,
        delta: i64,
        reason: Option<String>,
    ) -> EngineResult<Option<CachedItem>> {
        let change = PendingChange::quantity_adjust(self.tenant_id, item_id, delta, reason);
        self.queue.enqueue(&change).await?;

        let updated = self
            .replica
            .apply_quantity_delta(self.tenant_id, item_id, delta)
            .await?;

        tracing::debug!(item = %item_id, delta, "quantity adjustment queued");
        self.monitor.request_sync();
        Ok(updated)
    }

    /// Durably enqueue an arbitrary change (checkout, checkin, create,
    /// update) and request a debounced sync.
    pub async fn enqueue_change(&self, change: PendingChange) -> EngineResult<()> {
        self.queue.enqueue(&change).await?;
        self.monitor.request_sync();
        Ok(())
    }

    /// Reset all failed changes to pending and request a sync.
    pub async fn retry_failed_changes(&self) -> EngineResult<u64> {
        let reset = self.queue.retry_all_failed(self.tenant_id).await?;
        if reset > 0 {
            tracing::info!(tenant = %self.tenant_id, reset, "failed changes reset for retry");
            self.monitor.request_sync();
        }
        Ok(reset)
    }

    /// Failed changes awaiting user resolution, oldest first.
    pub async fn failed_changes(&self) -> EngineResult<Vec<PendingChange>> {
        Ok(self.queue.list_failed(self.tenant_id).await?)
    }

    // ---- sync ------------------------------------------------------------

    /// Run a sync pass immediately, bypassing the debounce.
    pub async fn sync_now(&self) -> EngineResult<SyncOutcome> {
        Ok(self.reconciler.run_sync(self.tenant_id).await?)
    }

    /// Wipe the replica and re-pull the full catalog.
    pub async fn force_full_refresh(&self) -> EngineResult<SyncOutcome> {
        Ok(self.reconciler.force_full_refresh(self.tenant_id).await?)
    }

    /// Sync pass run from the monitor's debounced trigger: a stale replica
    /// escalates to a full refresh.
    async fn triggered_sync(&self) -> EngineResult<SyncOutcome> {
        if self.is_stale().await? {
            tracing::info!(tenant = %self.tenant_id, "replica stale, escalating to full refresh");
            self.force_full_refresh().await
        } else {
            self.sync_now().await
        }
    }

    async fn is_stale(&self) -> EngineResult<bool> {
        let cutoff = Utc::now() - self.config.stale_after;
        Ok(match self.metadata.last_full_sync(self.tenant_id).await? {
            Some(at) => at < cutoff,
            None => true,
        })
    }

    pub async fn sync_stats(&self) -> EngineResult<SyncStats> {
        let replica = self.replica.get_stats(self.tenant_id).await?;
        Ok(SyncStats {
            pending_changes: self.queue.pending_count(self.tenant_id).await?,
            failed_changes: self.queue.failed_count(self.tenant_id).await?,
            cached_items: replica.item_count,
            last_sync: self.metadata.last_sync(self.tenant_id).await?,
            last_full_sync: self.metadata.last_full_sync(self.tenant_id).await?,
            is_stale: self.is_stale().await?,
            is_syncing: self.reconciler.is_syncing(),
            connectivity: self.monitor.state(),
        })
    }

    // ---- connectivity ----------------------------------------------------

    pub fn connectivity_state(&self) -> ConnectivityState {
        self.monitor.state()
    }

    /// Feed an environment connectivity signal (e.g. the OS network change
    /// notification) into the monitor without waiting for the next probe.
    pub fn set_online(&self, online: bool) {
        self.monitor.set_online(online);
    }

    pub fn subscribe(
        &self,
        event: ConnectivityEvent,
        callback: impl Fn() + Send + Sync + 'static,
    ) -> ListenerId {
        self.monitor.subscribe(event, callback)
    }

    pub fn unsubscribe(&self, id: ListenerId) {
        self.monitor.unsubscribe(id);
    }

    // ---- scan sessions ---------------------------------------------------

    pub async fn start_scan_session(&self, mode: ScanMode) -> EngineResult<ScanSession> {
        Ok(self.sessions.create(self.tenant_id, mode).await?)
    }

    /// Record one scan against a session.
    ///
    /// The barcode is resolved against the replica to decide the line
    /// status; an unresolved code is recorded as `Unknown` rather than
    /// dropped, so it can be reviewed once the catalog syncs.
    pub async fn record_scan(
        &self,
        session_id: SessionId,
        barcode: &str,
        scanned_quantity: i64,
    ) -> EngineResult<ScanSession> {
        let cached = self.get_cached_item(barcode).await?;
        let line = ScanLine {
            barcode: barcode.to_string(),
            expected_quantity: cached.as_ref().map(|item| item.quantity),
            scanned_quantity,
            status: if cached.is_some() {
                ScanLineStatus::Matched
            } else {
                ScanLineStatus::Unknown
            },
            scanned_at: Utc::now(),
        };
        Ok(self.sessions.record_scan(session_id, line).await?)
    }

    pub async fn complete_scan_session(&self, session_id: SessionId) -> EngineResult<ScanSession> {
        Ok(self.sessions.complete(session_id).await?)
    }

    /// The most recently touched incomplete session, for resuming after a
    /// crash or app restart.
    pub async fn resume_scan_session(&self) -> EngineResult<Option<ScanSession>> {
        Ok(self.sessions.resume_latest_incomplete(self.tenant_id).await?)
    }

    pub async fn recent_scan_sessions(&self, limit: u32) -> EngineResult<Vec<ScanSession>> {
        Ok(self.sessions.list_recent(self.tenant_id, limit).await?)
    }
}
