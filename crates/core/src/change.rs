//! Pending change model: a durable intent to mutate remote state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DomainError;
use crate::id::{ChangeId, ItemId, TenantId};

/// Kind of a queued mutation.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    QuantityAdjust,
    Checkout,
    Checkin,
    Create,
    Update,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::QuantityAdjust => "quantity_adjust",
            ChangeKind::Checkout => "checkout",
            ChangeKind::Checkin => "checkin",
            ChangeKind::Create => "create",
            ChangeKind::Update => "update",
        }
    }

    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s {
            "quantity_adjust" => Ok(ChangeKind::QuantityAdjust),
            "checkout" => Ok(ChangeKind::Checkout),
            "checkin" => Ok(ChangeKind::Checkin),
            "create" => Ok(ChangeKind::Create),
            "update" => Ok(ChangeKind::Update),
            other => Err(DomainError::validation(format!(
                "unknown change kind '{other}'"
            ))),
        }
    }
}

/// Lifecycle state of a queued change.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeStatus {
    /// Awaiting sync.
    Pending,
    /// Claimed by an in-flight sync pass.
    Syncing,
    /// Rejected by the remote store; retained for explicit retry.
    Failed,
    /// Acknowledged by the remote store; eligible for pruning.
    Completed,
}

impl ChangeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeStatus::Pending => "pending",
            ChangeStatus::Syncing => "syncing",
            ChangeStatus::Failed => "failed",
            ChangeStatus::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s {
            "pending" => Ok(ChangeStatus::Pending),
            "syncing" => Ok(ChangeStatus::Syncing),
            "failed" => Ok(ChangeStatus::Failed),
            "completed" => Ok(ChangeStatus::Completed),
            other => Err(DomainError::validation(format!(
                "unknown change status '{other}'"
            ))),
        }
    }
}

/// Payload of a `QuantityAdjust` change.
///
/// Carries a relative delta, not an absolute quantity; the remote store
/// applies it atomically against its own authoritative value. Deltas are
/// only commutative within a single entity's timeline, which is why
/// per-entity queue order must be preserved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuantityAdjustPayload {
    pub delta: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Payload of a `Checkout` change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutPayload {
    pub quantity: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
}

/// Payload of a `Checkin` change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckinPayload {
    pub quantity: i64,
}

/// An intent to mutate remote state, durable until confirmed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingChange {
    pub id: ChangeId,
    pub tenant_id: TenantId,
    pub kind: ChangeKind,
    pub entity_type: String,
    pub entity_id: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub status: ChangeStatus,
}

impl PendingChange {
    /// Build a fresh pending change.
    pub fn new(
        tenant_id: TenantId,
        kind: ChangeKind,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            id: ChangeId::new(),
            tenant_id,
            kind,
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            payload,
            created_at: Utc::now(),
            retry_count: 0,
            last_error: None,
            status: ChangeStatus::Pending,
        }
    }

    /// Convenience constructor for the hot path: a quantity delta on an
    /// inventory item.
    pub fn quantity_adjust(
        tenant_id: TenantId,
        item_id: ItemId,
        delta: i64,
        reason: Option<String>,
    ) -> Self {
        let payload = serde_json::to_value(QuantityAdjustPayload { delta, reason })
            .unwrap_or(Value::Null);
        Self::new(
            tenant_id,
            ChangeKind::QuantityAdjust,
            "inventory_item",
            item_id.to_string(),
            payload,
        )
    }

    /// Decode the payload as a quantity adjustment, if this change is one.
    pub fn quantity_adjust_payload(&self) -> Option<QuantityAdjustPayload> {
        if self.kind != ChangeKind::QuantityAdjust {
            return None;
        }
        serde_json::from_value(self.payload.clone()).ok()
    }
}
