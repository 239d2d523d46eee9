//! End-to-end offline flow: scan and adjust while disconnected, reconnect,
//! and watch the debounced sync drain the queue and reconcile the replica.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use scanstock_core::{ChangeKind, ItemId, PendingChange, RemoteItem, TenantId};
use scanstock_store::Database;
use scanstock_sync::engine::{EngineConfig, OfflineEngine};
use scanstock_sync::monitor::{LivenessProbe, MonitorConfig};
use scanstock_sync::remote::{RemoteError, RemoteStore, SubmitAck};

/// Remote double: a catalog whose quantities move when accepted deltas
/// arrive, gated on a connectivity flag shared with the probe.
struct FakeRemote {
    online: Arc<AtomicBool>,
    items: Mutex<HashMap<ItemId, RemoteItem>>,
    submitted: Mutex<Vec<PendingChange>>,
}

impl FakeRemote {
    fn new(online: Arc<AtomicBool>) -> Self {
        Self {
            online,
            items: Mutex::new(HashMap::new()),
            submitted: Mutex::new(Vec::new()),
        }
    }

    fn seed(&self, item: RemoteItem) {
        self.items.lock().unwrap().insert(item.id, item);
    }

    fn quantity_of(&self, id: ItemId) -> i64 {
        self.items.lock().unwrap()[&id].quantity
    }

    fn submitted_count(&self) -> usize {
        self.submitted.lock().unwrap().len()
    }
}

#[async_trait]
impl RemoteStore for FakeRemote {
    async fn pull_changed_since(
        &self,
        tenant_id: TenantId,
        cursor: DateTime<Utc>,
        page_size: u32,
    ) -> Result<Vec<RemoteItem>, RemoteError> {
        if !self.online.load(Ordering::SeqCst) {
            return Err(RemoteError::Network("unreachable".to_string()));
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

    async fn submit_change(&self, change: &PendingChange) -> Result<SubmitAck, RemoteError> {
        if !self.online.load(Ordering::SeqCst) {
            return Err(RemoteError::Network("unreachable".to_string()));
        }
        self.submitted.lock().unwrap().push(change.clone());

        if change.kind == ChangeKind::QuantityAdjust {
            let payload = change.quantity_adjust_payload().unwrap();
            let item_id: ItemId = change.entity_id.parse().unwrap();
            let mut items = self.items.lock().unwrap();
            if let Some(item) = items.get_mut(&item_id) {
                item.quantity = (item.quantity + payload.delta).max(0);
                item.updated_at = Utc::now();
            }
        }
        Ok(SubmitAck::accepted())
    }
}

struct FlagProbe(Arc<AtomicBool>);

#[async_trait]
impl LivenessProbe for FlagProbe {
    async fn check(&self) -> anyhow::Result<bool> {
        Ok(self.0.load(Ordering::SeqCst))
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
        min_quantity: Some(2),
        price: Some(4.50),
        image_url: None,
        folder_id: None,
        folder_name: None,
        updated_at: Utc::now(),
    }
}

async fn wait_until(mut condition: impl AsyncFnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if condition().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn offline_adjustment_reconciles_after_reconnect() {
    let online = Arc::new(AtomicBool::new(true));
    let remote = Arc::new(FakeRemote::new(Arc::clone(&online)));
    let tenant = TenantId::new();

    let item = remote_item(tenant, "0042", 20);
    let item_id = item.id;
    remote.seed(item);

    let config = EngineConfig {
        monitor: MonitorConfig {
            // Keep the probe out of the way; connectivity edges are fed
            // directly. A short debounce keeps the test fast.
            probe_interval: Duration::from_secs(600),
            sync_debounce: Duration::from_millis(100),
        },
        ..EngineConfig::default()
    };

    let db = Database::open_in_memory().await.unwrap();
    let engine = OfflineEngine::new(
        db,
        Arc::clone(&remote) as Arc<dyn RemoteStore>,
        Arc::new(FlagProbe(Arc::clone(&online))),
        tenant,
        config,
    )
    .await
    .unwrap();
    engine.start();

    // Initial sync while online fills the replica.
    engine.sync_now().await.unwrap();
    let cached = engine.get_cached_item("0042").await.unwrap().unwrap();
    assert_eq!(cached.quantity, 20);

    // Connection drops.
    online.store(false, Ordering::SeqCst);
    engine.set_online(false);

    // A scan-driven adjustment while offline: queued durably and applied
    // optimistically, no network involved.
    let submitted_before = remote.submitted_count();
    let updated = engine
        .adjust_quantity(item_id, -5, Some("damaged in transit".to_string()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(updated.quantity, 15);
    assert_eq!(remote.submitted_count(), submitted_before);

    let stats = engine.sync_stats().await.unwrap();
    assert_eq!(stats.pending_changes, 1);

    // Reconnect. No sync has happened yet at this instant; the debounce
    // window is still open.
    online.store(true, Ordering::SeqCst);
    engine.set_online(true);
    assert_eq!(remote.submitted_count(), submitted_before);

    // The debounced sync drains the queue and pulls the reconciled item.
    wait_until(async || engine.sync_stats().await.unwrap().pending_changes == 0).await;

    assert_eq!(remote.quantity_of(item_id), 15);
    wait_until(async || {
        engine
            .get_cached_item("0042")
            .await
            .unwrap()
            .map(|item| item.quantity == 15)
            .unwrap_or(false)
    })
    .await;

    let stats = engine.sync_stats().await.unwrap();
    assert_eq!(stats.failed_changes, 0);
    assert!(stats.last_sync.is_some());

    engine.shutdown();
}

#[tokio::test]
async fn queue_survives_reopen_and_syncs_on_next_start() {
    let online = Arc::new(AtomicBool::new(false));
    let remote = Arc::new(FakeRemote::new(Arc::clone(&online)));
    let tenant = TenantId::new();

    let item = remote_item(tenant, "7777", 10);
    let item_id = item.id;
    remote.seed(item);

    let db = Database::open_in_memory().await.unwrap();

    // First engine lifetime: enqueue offline, then "close the app".
    {
        let engine = OfflineEngine::new(
            db.clone(),
            Arc::clone(&remote) as Arc<dyn RemoteStore>,
            Arc::new(FlagProbe(Arc::clone(&online))),
            tenant,
            EngineConfig::default(),
        )
        .await
        .unwrap();
        engine.set_online(false);
        engine.adjust_quantity(item_id, 3, None).await.unwrap();
        engine.shutdown();
    }

    // Second lifetime on the same database: the change is still there and
    // drains once a sync runs online.
    online.store(true, Ordering::SeqCst);
    let engine = OfflineEngine::new(
        db,
        Arc::clone(&remote) as Arc<dyn RemoteStore>,
        Arc::new(FlagProbe(online)),
        tenant,
        EngineConfig::default(),
    )
    .await
    .unwrap();

    assert_eq!(engine.sync_stats().await.unwrap().pending_changes, 1);
    engine.sync_now().await.unwrap();

    assert_eq!(engine.sync_stats().await.unwrap().pending_changes, 0);
    assert_eq!(remote.quantity_of(item_id), 13);
}
