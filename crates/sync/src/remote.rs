//! Collaborator contract for the remote authoritative store.
//!
//! The core prescribes no wire format; it only requires that pull results
//! arrive ordered by `updated_at` ascending and that submission tolerates
//! at-least-once delivery (a change may be resubmitted if an ack was lost).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use scanstock_core::{PendingChange, RemoteItem, TenantId};

/// Transport-level failure talking to the remote store.
///
/// Any `Err` from [`RemoteStore`] is treated as transient: the affected
/// change returns to `pending` and is retried on a later pass. A change the
/// remote has *examined and refused* must instead be reported through
/// [`SubmitAck`] with `accepted = false`.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("network error: {0}")]
    Network(String),

    #[error("API error ({0}): {1}")]
    Api(u16, String),

    #[error("parse error: {0}")]
    Parse(String),
}

/// Acknowledgement of a submitted change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitAck {
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SubmitAck {
    pub fn accepted() -> Self {
        Self {
            accepted: true,
            error: None,
        }
    }

    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            accepted: false,
            error: Some(error.into()),
        }
    }
}

/// The remote authoritative store, as seen by the reconciler.
///
/// Quantity changes are submitted as **deltas**; the remote applies them
/// atomically against its own authoritative quantity. That is the
/// conflict-avoidance strategy: deltas from different devices merge without
/// a lost update as long as per-entity submission order is preserved.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Fetch up to `page_size` items changed strictly after `cursor`,
    /// ordered by `updated_at` ascending.
    async fn pull_changed_since(
        &self,
        tenant_id: TenantId,
        cursor: DateTime<Utc>,
        page_size: u32,
    ) -> Result<Vec<RemoteItem>, RemoteError>;

    /// Submit one change. Must be idempotent enough to tolerate duplicate
    /// delivery of the same change id.
    async fn submit_change(&self, change: &PendingChange) -> Result<SubmitAck, RemoteError>;
}
