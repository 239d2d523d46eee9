//! Domain types for the offline-first scanning core.
//!
//! This crate is IO-free: identifiers, the cached item projection with its
//! derived stock status, the pending change model, and scan sessions. The
//! durable stores live in `scanstock-store`, orchestration in
//! `scanstock-sync`.

pub mod change;
pub mod error;
pub mod id;
pub mod item;
pub mod session;

pub use change::{
    ChangeKind, ChangeStatus, CheckinPayload, CheckoutPayload, PendingChange,
    QuantityAdjustPayload,
};
pub use error::{DomainError, DomainResult};
pub use id::{ChangeId, ItemId, SessionId, TenantId};
pub use item::{CachedItem, ItemStatus, RemoteItem};
pub use session::{ScanLine, ScanLineStatus, ScanMode, ScanSession};
