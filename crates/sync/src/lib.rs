//! Sync orchestration for the offline core.
//!
//! Three pieces sit on top of the durable stores:
//!
//! - [`ConnectivityMonitor`]: probes liveness on an interval, raises
//!   edge-triggered online/offline events, and schedules a debounced sync
//!   after reconnect.
//! - [`SyncReconciler`]: drains the pending change queue against the remote
//!   store in causal order (push), then refreshes the replica from a cursor
//!   (pull), with at most one sync pass in flight.
//! - [`OfflineEngine`]: the facade the UI shell consumes — cached lookups,
//!   mutation enqueue with optimistic application, connectivity state,
//!   sync statistics, and scan sessions.

pub mod engine;
pub mod monitor;
pub mod reconciler;
pub mod remote;

pub use engine::{EngineConfig, EngineError, EngineResult, OfflineEngine, SyncStats};
pub use monitor::{
    ConnectivityEvent, ConnectivityMonitor, ConnectivityState, ListenerId, LivenessProbe,
    MonitorConfig,
};
pub use reconciler::{SyncConfig, SyncError, SyncOutcome, SyncReconciler, SyncReport};
pub use remote::{RemoteError, RemoteStore, SubmitAck};
