//! Store-layer error model.

use scanstock_core::SessionId;
use thiserror::Error;

/// Result type used across the store layer.
pub type StoreResult<T> = Result<T, StoreError>;

/// Infrastructure error from the local persistence layer.
///
/// These are distinct from domain errors: they mean the durable store could
/// not record or produce data. Callers must treat them as fail-closed — a
/// mutation that hits a `StoreError` has not been accepted.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A persisted row could not be decoded back into its domain type.
    #[error("corrupt row in {table}: {detail}")]
    Corrupt { table: &'static str, detail: String },

    /// A scan session is completed and read-only.
    #[error("scan session {0} is completed and read-only")]
    SessionCompleted(SessionId),

    /// A referenced row does not exist.
    #[error("not found: {0}")]
    NotFound(String),
}

impl StoreError {
    pub fn corrupt(table: &'static str, detail: impl Into<String>) -> Self {
        Self::Corrupt {
            table,
            detail: detail.into(),
        }
    }
}
