//! Durable, tenant-scoped SQLite stores for the offline core.
//!
//! Four tables back the subsystem: the cached item replica, the pending
//! change queue, scan sessions, and sync metadata (pull cursors). All of
//! them are partitioned by tenant and wiped together on tenant switch or
//! schema version bump — the data is a disposable cache, not a source of
//! truth.
//!
//! Every operation is async and fail-closed: a mutation that cannot be
//! durably recorded returns an error instead of being accepted in memory.

pub mod db;
pub mod error;
pub mod metadata;
pub mod queue;
pub mod replica;
pub mod session;

pub use db::Database;
pub use error::{StoreError, StoreResult};
pub use metadata::SyncMetadataStore;
pub use queue::ChangeQueue;
pub use replica::{ReplicaStats, ReplicaStore};
pub use session::ScanSessionStore;
