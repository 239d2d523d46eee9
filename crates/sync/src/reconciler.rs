//! Push-then-pull reconciliation against the remote store.
//!
//! A sync pass first drains the pending change queue in causal order (push),
//! then refreshes the replica from the incremental pull cursor. At most one
//! pass runs at a time; a pass requested while one is in flight is reported
//! as [`SyncOutcome::AlreadyRunning`] rather than queued.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use thiserror::Error;

use scanstock_core::TenantId;
use scanstock_store::{ChangeQueue, ReplicaStore, StoreError, SyncMetadataStore};

use crate::remote::RemoteStore;

/// Local storage failure during a sync pass. Transport failures are not
/// errors at this level: they degrade the pass (changes return to pending,
/// pull aborts keeping applied pages) and are surfaced in the report.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Reconciler tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct SyncConfig {
    /// Items fetched per pull page.
    pub page_size: u32,
    /// Changes claimed from the queue per push round.
    pub batch_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_size: 100,
            batch_size: 50,
        }
    }
}

/// What one completed sync pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Changes acknowledged by the remote store.
    pub pushed: u64,
    /// Changes the remote examined and refused (now `failed`, retained).
    pub rejected: u64,
    /// Changes returned to `pending` after a transport failure.
    pub retried: u64,
    /// Items applied to the replica by the pull step.
    pub pulled: u64,
    /// Transport failure that cut the push step short, if any.
    pub push_error: Option<String>,
    /// Transport failure that cut the pull step short, if any. Pages applied
    /// before the failure stay applied and the cursor reflects them.
    pub pull_error: Option<String>,
}

impl SyncReport {
    /// Whether both steps ran to the end without a transport failure.
    pub fn is_complete(&self) -> bool {
        self.push_error.is_none() && self.pull_error.is_none()
    }
}

/// Result of requesting a sync pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Completed(SyncReport),
    /// Another pass held the in-flight guard; nothing was done.
    AlreadyRunning,
}

/// Orchestrates push and pull for one tenant against one remote store.
pub struct SyncReconciler {
    remote: Arc<dyn RemoteStore>,
    queue: ChangeQueue,
    replica: ReplicaStore,
    metadata: SyncMetadataStore,
    config: SyncConfig,
    in_flight: AtomicBool,
}

impl SyncReconciler {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        queue: ChangeQueue,
        replica: ReplicaStore,
        metadata: SyncMetadataStore,
        config: SyncConfig,
    ) -> Self {
        Self {
            remote,
            queue,
            replica,
            metadata,
            config,
            in_flight: AtomicBool::new(false),
        }
    }

    /// Whether a sync pass currently holds the in-flight guard.
    pub fn is_syncing(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Run one full sync pass: push the queue, then pull from the cursor.
    ///
    /// Overlapping passes are rejected, not serialized: the caller that
    /// loses the race gets [`SyncOutcome::AlreadyRunning`].
    pub async fn run_sync(&self, tenant_id: TenantId) -> Result<SyncOutcome, SyncError> {
        let Some(_guard) = InFlightGuard::acquire(&self.in_flight) else {
            tracing::debug!(tenant = %tenant_id, "sync already in flight, skipping");
            return Ok(SyncOutcome::AlreadyRunning);
        };

        let mut report = SyncReport::default();
        self.push(tenant_id, &mut report).await?;
        self.pull(tenant_id, &mut report).await?;

        if report.is_complete() {
            self.metadata.set_last_sync(tenant_id, Utc::now()).await?;
        }

        tracing::info!(
            tenant = %tenant_id,
            pushed = report.pushed,
            rejected = report.rejected,
            retried = report.retried,
            pulled = report.pulled,
            complete = report.is_complete(),
            "sync pass finished"
        );
        Ok(SyncOutcome::Completed(report))
    }

    /// Invalidate the replica and re-pull everything from the epoch.
    ///
    /// The pending queue is untouched; queued changes are pushed first so
    /// the re-pulled snapshot already reflects them.
    pub async fn force_full_refresh(
        &self,
        tenant_id: TenantId,
    ) -> Result<SyncOutcome, SyncError> {
        let Some(_guard) = InFlightGuard::acquire(&self.in_flight) else {
            return Ok(SyncOutcome::AlreadyRunning);
        };

        tracing::info!(tenant = %tenant_id, "forcing full replica refresh");

        let mut report = SyncReport::default();
        self.push(tenant_id, &mut report).await?;

        self.replica.clear_for_tenant(tenant_id).await?;
        self.metadata.reset_pull_cursor(tenant_id).await?;

        self.pull(tenant_id, &mut report).await?;
        if report.is_complete() {
            self.metadata.set_last_sync(tenant_id, Utc::now()).await?;
        }

        Ok(SyncOutcome::Completed(report))
    }

    /// Drain the queue batch by batch until it is empty or a transport
    /// failure intervenes.
    ///
    /// Outcome per change: an accepted ack completes it, a rejected ack
    /// fails it (and push moves on to the next change), a transport error
    /// returns it to pending and aborts the push step.
    async fn push(&self, tenant_id: TenantId, report: &mut SyncReport) -> Result<(), SyncError> {
        loop {
            let batch = self
                .queue
                .claim_next_batch(tenant_id, self.config.batch_size)
                .await?;
            if batch.is_empty() {
                return Ok(());
            }

            for change in batch {
                match self.remote.submit_change(&change).await {
                    Ok(ack) if ack.accepted => {
                        self.queue.mark_completed(change.id).await?;
                        report.pushed += 1;
                    }
                    Ok(ack) => {
                        let reason = ack.error.unwrap_or_else(|| "rejected".to_string());
                        tracing::warn!(
                            change = %change.id,
                            entity = %change.entity_id,
                            reason,
                            "change rejected by remote store"
                        );
                        self.queue.mark_failed(change.id, &reason).await?;
                        report.rejected += 1;
                    }
                    Err(err) => {
                        let reason = err.to_string();
                        tracing::warn!(
                            change = %change.id,
                            error = reason,
                            "transport failure during push, will retry"
                        );
                        self.queue.mark_retry(change.id, &reason).await?;
                        report.retried += 1;
                        report.push_error = Some(reason);
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Pull changed items page by page from the cursor, advancing it after
    /// each applied page so an interrupted pull resumes where it stopped.
    async fn pull(&self, tenant_id: TenantId, report: &mut SyncReport) -> Result<(), SyncError> {
        let started_from_epoch = self.metadata.pull_cursor(tenant_id).await?.is_none();
        let mut cursor = self
            .metadata
            .pull_cursor(tenant_id)
            .await?
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);

        loop {
            let page = match self
                .remote
                .pull_changed_since(tenant_id, cursor, self.config.page_size)
                .await
            {
                Ok(page) => page,
                Err(err) => {
                    let reason = err.to_string();
                    tracing::warn!(
                        tenant = %tenant_id,
                        error = reason,
                        "transport failure during pull, keeping applied pages"
                    );
                    report.pull_error = Some(reason);
                    return Ok(());
                }
            };

            if page.is_empty() {
                break;
            }

            let page_len = page.len();
            let last_updated = page.last().map(|item| item.updated_at);

            let written = self.replica.upsert_many(page).await?;
            report.pulled += written as u64;

            if let Some(last_updated) = last_updated {
                cursor = last_updated;
                self.metadata.set_pull_cursor(tenant_id, cursor).await?;
            }

            // A short page means the remote has nothing further.
            if page_len < self.config.page_size as usize {
                break;
            }
        }

        if started_from_epoch {
            self.metadata
                .set_last_full_sync(tenant_id, Utc::now())
                .await?;
        }
        Ok(())
    }
}

/// RAII holder of the in-flight flag so every exit path releases it.
struct InFlightGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> InFlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::str::FromStr;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use scanstock_core::{ChangeId, ChangeKind, ItemId, PendingChange, RemoteItem};
    use scanstock_store::Database;

    use crate::remote::{RemoteError, SubmitAck};

    /// Remote store double: serves a fixed catalog whose quantities move when
    /// accepted deltas arrive, and can be told to reject or drop requests.
    #[derive(Default)]
    struct MockRemote {
        items: Mutex<HashMap<ItemId, RemoteItem>>,
        reject: Mutex<HashSet<ChangeId>>,
        transport_down: AtomicBool,
        pull_calls: AtomicUsize,
        fail_pull_from_call: Mutex<Option<usize>>,
        submitted: Mutex<Vec<ChangeId>>,
    }

    impl MockRemote {
        fn seed(&self, item: RemoteItem) {
            self.items.lock().unwrap().insert(item.id, item);
        }

        fn reject_change(&self, id: ChangeId) {
            self.reject.lock().unwrap().insert(id);
        }

        fn quantity_of(&self, id: ItemId) -> i64 {
            self.items.lock().unwrap()[&id].quantity
        }
    }

    #[async_trait]
    impl RemoteStore for MockRemote {
        async fn pull_changed_since(
            &self,
            tenant_id: TenantId,
            cursor: DateTime<Utc>,
            page_size: u32,
        ) -> Result<Vec<RemoteItem>, RemoteError> {
            let call = self.pull_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(from) = *self.fail_pull_from_call.lock().unwrap() {
                if call >= from {
                    return Err(RemoteError::Network("connection reset".to_string()));
                }
            }

            let mut page: Vec<RemoteItem> = self
                .items
                .lock()
                .unwrap()
                .values()
                .filter(|i| i.tenant_id == tenant_id && i.updated_at > cursor)
                .cloned()
                .collect();
            page.sort_by_key(|i| i.updated_at);
            page.truncate(page_size as usize);
            Ok(page)
        }

        async fn submit_change(
            &self,
            change: &PendingChange,
        ) -> Result<SubmitAck, RemoteError> {
            self.submitted.lock().unwrap().push(change.id);

            if self.transport_down.load(Ordering::SeqCst) {
                return Err(RemoteError::Network("connection reset".to_string()));
            }
            if self.reject.lock().unwrap().contains(&change.id) {
                return Ok(SubmitAck::rejected("insufficient stock"));
            }

            if change.kind == ChangeKind::QuantityAdjust {
                let payload = change.quantity_adjust_payload().unwrap();
                let item_id = ItemId::from_str(&change.entity_id).unwrap();
                let mut items = self.items.lock().unwrap();
                let item = items.get_mut(&item_id).unwrap();
                item.quantity = (item.quantity + payload.delta).max(0);
                item.updated_at = Utc::now();
            }
            Ok(SubmitAck::accepted())
        }
    }

    struct Fixture {
        remote: Arc<MockRemote>,
        reconciler: SyncReconciler,
        queue: ChangeQueue,
        replica: ReplicaStore,
        metadata: SyncMetadataStore,
        tenant: TenantId,
    }

    async fn fixture(config: SyncConfig) -> Fixture {
        let db = Database::open_in_memory().await.unwrap();
        let remote = Arc::new(MockRemote::default());
        let queue = ChangeQueue::new(db.clone());
        let replica = ReplicaStore::new(db.clone());
        let metadata = SyncMetadataStore::new(db);
        let reconciler = SyncReconciler::new(
            Arc::clone(&remote) as Arc<dyn RemoteStore>,
            queue.clone(),
            replica.clone(),
            metadata.clone(),
            config,
        );
        Fixture {
            remote,
            reconciler,
            queue,
            replica,
            metadata,
            tenant: TenantId::new(),
        }
    }

    fn remote_item(tenant: TenantId, barcode: &str, quantity: i64) -> RemoteItem {
        RemoteItem {
            id: ItemId::new(),
            tenant_id: tenant,
            barcode: Some(barcode.to_string()),
            sku: None,
            name: format!("Item {barcode}"),
            quantity,
            min_quantity: None,
            price: None,
            image_url: None,
            folder_id: None,
            folder_name: None,
            updated_at: Utc::now(),
        }
    }

    fn report(outcome: SyncOutcome) -> SyncReport {
        match outcome {
            SyncOutcome::Completed(report) => report,
            SyncOutcome::AlreadyRunning => panic!("sync pass was skipped"),
        }
    }

    #[tokio::test]
    async fn rejection_fails_one_change_and_push_continues() {
        let f = fixture(SyncConfig::default()).await;
        for barcode in ["1", "2", "3"] {
            f.remote.seed(remote_item(f.tenant, barcode, 10));
        }
        let items: Vec<ItemId> = f.remote.items.lock().unwrap().keys().copied().collect();

        let changes: Vec<PendingChange> = items
            .iter()
            .map(|&id| PendingChange::quantity_adjust(f.tenant, id, 1, None))
            .collect();
        for change in &changes {
            f.queue.enqueue(change).await.unwrap();
        }
        f.remote.reject_change(changes[1].id);

        let report = report(f.reconciler.run_sync(f.tenant).await.unwrap());
        assert_eq!(report.pushed, 2);
        assert_eq!(report.rejected, 1);
        assert!(report.is_complete());

        assert_eq!(f.queue.failed_count(f.tenant).await.unwrap(), 1);
        assert_eq!(f.queue.pending_count(f.tenant).await.unwrap(), 0);
        let failed = f.queue.list_failed(f.tenant).await.unwrap();
        assert_eq!(failed[0].id, changes[1].id);
        assert_eq!(failed[0].last_error.as_deref(), Some("insufficient stock"));
    }

    #[tokio::test]
    async fn transport_failure_returns_change_to_pending_and_aborts_pass() {
        let f = fixture(SyncConfig::default()).await;
        let item = remote_item(f.tenant, "1", 10);
        let item_id = item.id;
        f.remote.seed(item);
        f.remote.transport_down.store(true, Ordering::SeqCst);

        let change = PendingChange::quantity_adjust(f.tenant, item_id, -1, None);
        f.queue.enqueue(&change).await.unwrap();

        let report = report(f.reconciler.run_sync(f.tenant).await.unwrap());
        assert_eq!(report.retried, 1);
        assert!(report.push_error.is_some());
        assert!(!report.is_complete());

        // Still pending, not failed: the change was never examined.
        assert_eq!(f.queue.pending_count(f.tenant).await.unwrap(), 1);
        assert_eq!(f.queue.failed_count(f.tenant).await.unwrap(), 0);
        assert!(f.metadata.last_sync(f.tenant).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn same_entity_deltas_apply_in_enqueue_order() {
        let f = fixture(SyncConfig::default()).await;
        let item = remote_item(f.tenant, "1", 10);
        let item_id = item.id;
        f.remote.seed(item);

        f.queue
            .enqueue(&PendingChange::quantity_adjust(f.tenant, item_id, 5, None))
            .await
            .unwrap();
        f.queue
            .enqueue(&PendingChange::quantity_adjust(f.tenant, item_id, -3, None))
            .await
            .unwrap();

        let report = report(f.reconciler.run_sync(f.tenant).await.unwrap());
        assert_eq!(report.pushed, 2);

        assert_eq!(f.remote.quantity_of(item_id), 12);
        let cached = f.replica.get_by_id(f.tenant, item_id).await.unwrap().unwrap();
        assert_eq!(cached.quantity, 12);
    }

    #[tokio::test]
    async fn pull_pages_through_catalog_and_advances_cursor() {
        let f = fixture(SyncConfig {
            page_size: 2,
            batch_size: 50,
        })
        .await;
        for i in 0..5 {
            f.remote.seed(remote_item(f.tenant, &format!("{i}"), i));
        }

        let report1 = report(f.reconciler.run_sync(f.tenant).await.unwrap());
        assert_eq!(report1.pulled, 5);
        assert_eq!(f.replica.get_stats(f.tenant).await.unwrap().item_count, 5);
        assert!(f.metadata.pull_cursor(f.tenant).await.unwrap().is_some());
        // First pass started from the epoch, so it counts as a full sync.
        assert!(f.metadata.last_full_sync(f.tenant).await.unwrap().is_some());
        let first_full = f.metadata.last_full_sync(f.tenant).await.unwrap();

        // Nothing changed remotely: incremental pass pulls nothing and does
        // not move the full-sync marker.
        let report2 = report(f.reconciler.run_sync(f.tenant).await.unwrap());
        assert_eq!(report2.pulled, 0);
        assert_eq!(f.metadata.last_full_sync(f.tenant).await.unwrap(), first_full);
    }

    #[tokio::test]
    async fn pull_failure_keeps_applied_pages_and_cursor() {
        let f = fixture(SyncConfig {
            page_size: 2,
            batch_size: 50,
        })
        .await;
        for i in 0..5 {
            f.remote.seed(remote_item(f.tenant, &format!("{i}"), i));
        }
        // First pull call succeeds, every later one fails.
        *f.remote.fail_pull_from_call.lock().unwrap() = Some(1);

        let report = report(f.reconciler.run_sync(f.tenant).await.unwrap());
        assert_eq!(report.pulled, 2);
        assert!(report.pull_error.is_some());

        let cursor = f.metadata.pull_cursor(f.tenant).await.unwrap();
        assert!(cursor.is_some());
        assert_eq!(f.replica.get_stats(f.tenant).await.unwrap().item_count, 2);
        assert!(f.metadata.last_sync(f.tenant).await.unwrap().is_none());

        // Transport recovers: the next pass resumes from the cursor.
        *f.remote.fail_pull_from_call.lock().unwrap() = None;
        let report = self::report(f.reconciler.run_sync(f.tenant).await.unwrap());
        assert_eq!(report.pulled, 3);
        assert_eq!(f.replica.get_stats(f.tenant).await.unwrap().item_count, 5);
    }

    #[tokio::test]
    async fn full_refresh_discards_replica_and_repulls() {
        let f = fixture(SyncConfig::default()).await;
        let stale = remote_item(f.tenant, "old", 1);
        let stale_id = stale.id;
        f.replica.upsert_many(vec![stale]).await.unwrap();
        f.metadata.set_pull_cursor(f.tenant, Utc::now()).await.unwrap();

        f.remote.seed(remote_item(f.tenant, "fresh", 7));

        let report = report(f.reconciler.force_full_refresh(f.tenant).await.unwrap());
        assert_eq!(report.pulled, 1);

        // The stale item no longer exists remotely, so the wipe removed it.
        assert!(f.replica.get_by_id(f.tenant, stale_id).await.unwrap().is_none());
        assert!(f
            .replica
            .get_by_barcode_or_sku(f.tenant, "fresh")
            .await
            .unwrap()
            .is_some());
        assert!(f.metadata.last_full_sync(f.tenant).await.unwrap().is_some());
    }

    /// Remote double whose submit blocks until released, to hold a sync pass
    /// open while a second one is requested.
    struct BlockingRemote {
        release: Notify,
        entered: Notify,
    }

    #[async_trait]
    impl RemoteStore for BlockingRemote {
        async fn pull_changed_since(
            &self,
            _tenant_id: TenantId,
            _cursor: DateTime<Utc>,
            _page_size: u32,
        ) -> Result<Vec<RemoteItem>, RemoteError> {
            Ok(Vec::new())
        }

        async fn submit_change(
            &self,
            _change: &PendingChange,
        ) -> Result<SubmitAck, RemoteError> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(SubmitAck::accepted())
        }
    }

    #[tokio::test]
    async fn overlapping_passes_are_rejected_not_queued() {
        let db = Database::open_in_memory().await.unwrap();
        let remote = Arc::new(BlockingRemote {
            release: Notify::new(),
            entered: Notify::new(),
        });
        let queue = ChangeQueue::new(db.clone());
        let reconciler = Arc::new(SyncReconciler::new(
            Arc::clone(&remote) as Arc<dyn RemoteStore>,
            queue.clone(),
            ReplicaStore::new(db.clone()),
            SyncMetadataStore::new(db),
            SyncConfig::default(),
        ));
        let tenant = TenantId::new();

        let change = PendingChange::quantity_adjust(tenant, ItemId::new(), 1, None);
        queue.enqueue(&change).await.unwrap();

        let first = tokio::spawn({
            let reconciler = Arc::clone(&reconciler);
            async move { reconciler.run_sync(tenant).await }
        });
        // Wait until the first pass is inside submit_change.
        remote.entered.notified().await;
        assert!(reconciler.is_syncing());

        let second = reconciler.run_sync(tenant).await.unwrap();
        assert_eq!(second, SyncOutcome::AlreadyRunning);

        remote.release.notify_one();
        let first = first.await.unwrap().unwrap();
        assert_eq!(report(first).pushed, 1);
        assert!(!reconciler.is_syncing());
    }
}
