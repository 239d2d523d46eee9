//! Connectivity monitor: liveness probing, edge-triggered online/offline
//! events, and debounced reconnect sync scheduling.
//!
//! The monitor never decides *how* to sync; it invokes an injected trigger
//! after the debounce window. Probe failures are coerced to offline and
//! never surface as errors.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Connectivity state of the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityState {
    /// Online and (as far as the last probe knows) reachable.
    Online,
    /// Offline (network unreachable or remote store unavailable).
    Offline,
}

/// Event names listeners can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
    Online,
    Offline,
}

/// Handle for removing a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Injected liveness check.
///
/// Implementations enforce their own timeout; the monitor adds no timeout
/// layer of its own. A returned error is treated identically to `Ok(false)`.
#[async_trait]
pub trait LivenessProbe: Send + Sync {
    async fn check(&self) -> anyhow::Result<bool>;
}

/// Monitor configuration.
#[derive(Debug, Clone, Copy)]
pub struct MonitorConfig {
    /// Fixed probing interval, independent of user activity.
    pub probe_interval: Duration,
    /// Quiet period between an online edge and the triggered sync, to avoid
    /// thrashing on flaky reconnects.
    pub sync_debounce: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(30),
            sync_debounce: Duration::from_secs(2),
        }
    }
}

type Callback = Arc<dyn Fn() + Send + Sync>;

struct Listener {
    id: u64,
    event: ConnectivityEvent,
    callback: Callback,
}

struct MonitorInner {
    probe: Arc<dyn LivenessProbe>,
    config: MonitorConfig,
    state: Mutex<ConnectivityState>,
    listeners: Mutex<Vec<Listener>>,
    next_listener: AtomicU64,
    scheduled_sync: Mutex<Option<JoinHandle<()>>>,
    sync_trigger: Mutex<Option<Callback>>,
    shutdown: Notify,
}

/// Online/offline state machine with observer registration.
///
/// Starts optimistically `Online` until the first probe result is known.
/// Transitions are edge-triggered: setting the current state again fires no
/// events and schedules nothing.
#[derive(Clone)]
pub struct ConnectivityMonitor {
    inner: Arc<MonitorInner>,
}

impl ConnectivityMonitor {
    pub fn new(probe: Arc<dyn LivenessProbe>, config: MonitorConfig) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                probe,
                config,
                state: Mutex::new(ConnectivityState::Online),
                listeners: Mutex::new(Vec::new()),
                next_listener: AtomicU64::new(1),
                scheduled_sync: Mutex::new(None),
                sync_trigger: Mutex::new(None),
                shutdown: Notify::new(),
            }),
        }
    }

    pub fn state(&self) -> ConnectivityState {
        *self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_online(&self) -> bool {
        self.state() == ConnectivityState::Online
    }

    /// Register a listener for an event. Multiple listeners per event are
    /// supported; callbacks are plain `Fn()`, nothing is awaited.
    pub fn subscribe(
        &self,
        event: ConnectivityEvent,
        callback: impl Fn() + Send + Sync + 'static,
    ) -> ListenerId {
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        let mut listeners = self.inner.listeners.lock().unwrap_or_else(|e| e.into_inner());
        listeners.push(Listener {
            id,
            event,
            callback: Arc::new(callback),
        });
        ListenerId(id)
    }

    /// Remove one listener; all others keep firing.
    pub fn unsubscribe(&self, id: ListenerId) {
        let mut listeners = self.inner.listeners.lock().unwrap_or_else(|e| e.into_inner());
        listeners.retain(|l| l.id != id.0);
    }

    /// Install the action invoked after the reconnect debounce elapses.
    pub fn set_sync_trigger(&self, trigger: impl Fn() + Send + Sync + 'static) {
        let mut guard = self
            .inner
            .sync_trigger
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        *guard = Some(Arc::new(trigger));
    }

    /// Apply an observed connectivity value (probe result or environment
    /// signal). Edge-triggered: a repeated value is a no-op.
    ///
    /// `Offline -> Online` emits `online` and schedules the debounced sync;
    /// `Online -> Offline` emits `offline` and cancels a scheduled (not yet
    /// started) sync.
    pub fn set_online(&self, online: bool) {
        let next = if online {
            ConnectivityState::Online
        } else {
            ConnectivityState::Offline
        };

        {
            let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
            if *state == next {
                return;
            }
            *state = next;
        }

        match next {
            ConnectivityState::Online => {
                tracing::info!("connectivity restored");
                self.emit(ConnectivityEvent::Online);
                self.schedule_sync();
            }
            ConnectivityState::Offline => {
                tracing::warn!("connectivity lost");
                self.emit(ConnectivityEvent::Offline);
                self.cancel_scheduled_sync();
            }
        }
    }

    /// Schedule the debounced sync if currently online (used when a change
    /// is enqueued while connected, so rapid edits collapse into one drain).
    pub fn request_sync(&self) {
        if self.is_online() {
            self.schedule_sync();
        }
    }

    /// Start the periodic probe loop. Returns the task handle; the loop runs
    /// until [`ConnectivityMonitor::shutdown`] is called.
    pub fn start(&self) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        let monitor = self.clone();

        tokio::spawn(async move {
            tracing::debug!("connectivity probe loop started");

            let mut probe_interval = tokio::time::interval(inner.config.probe_interval);
            probe_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = inner.shutdown.notified() => {
                        tracing::debug!("connectivity probe loop received shutdown signal");
                        break;
                    }
                    _ = probe_interval.tick() => {
                        // A probe error means the same thing as an explicit
                        // negative result.
                        let alive = match inner.probe.check().await {
                            Ok(alive) => alive,
                            Err(err) => {
                                tracing::debug!("liveness probe errored: {err:?}");
                                false
                            }
                        };
                        monitor.set_online(alive);
                    }
                }
            }
        })
    }

    /// Request graceful shutdown of the probe loop and cancel any scheduled
    /// sync.
    pub fn shutdown(&self) {
        self.cancel_scheduled_sync();
        self.inner.shutdown.notify_waiters();
    }

    fn emit(&self, event: ConnectivityEvent) {
        // Snapshot callbacks so listener code never runs under the lock.
        let callbacks: Vec<Callback> = {
            let listeners = self.inner.listeners.lock().unwrap_or_else(|e| e.into_inner());
            listeners
                .iter()
                .filter(|l| l.event == event)
                .map(|l| Arc::clone(&l.callback))
                .collect()
        };
        for callback in callbacks {
            callback();
        }
    }

    fn schedule_sync(&self) {
        let inner = Arc::clone(&self.inner);
        let debounce = inner.config.sync_debounce;

        let task = tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            let trigger = {
                let guard = inner.sync_trigger.lock().unwrap_or_else(|e| e.into_inner());
                guard.clone()
            };
            if let Some(trigger) = trigger {
                trigger();
            }
        });

        let mut scheduled = self
            .inner
            .scheduled_sync
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = scheduled.replace(task) {
            previous.abort();
        }
    }

    fn cancel_scheduled_sync(&self) {
        let mut scheduled = self
            .inner
            .scheduled_sync
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(task) = scheduled.take() {
            task.abort();
        }
    }
}
