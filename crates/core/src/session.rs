//! Scan session model: a named, resumable batch-scan workspace.
//!
//! Independent of the pending change queue; sessions survive a crash and are
//! archived (not deleted) on completion so they can be audited.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::id::{SessionId, TenantId};

/// Scanning mode of a session.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanMode {
    Single,
    Quick,
    Batch,
}

impl ScanMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanMode::Single => "single",
            ScanMode::Quick => "quick",
            ScanMode::Batch => "batch",
        }
    }

    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s {
            "single" => Ok(ScanMode::Single),
            "quick" => Ok(ScanMode::Quick),
            "batch" => Ok(ScanMode::Batch),
            other => Err(DomainError::validation(format!(
                "unknown scan mode '{other}'"
            ))),
        }
    }
}

/// Resolution state of a single scanned line.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanLineStatus {
    /// Barcode resolved against the local replica.
    Matched,
    /// Barcode not found in the replica; kept for later resolution.
    Unknown,
}

/// One scan event within a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanLine {
    pub barcode: String,
    pub expected_quantity: Option<i64>,
    pub scanned_quantity: i64,
    pub status: ScanLineStatus,
    pub scanned_at: DateTime<Utc>,
}

/// An in-progress or archived batch-scan workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanSession {
    pub id: SessionId,
    pub tenant_id: TenantId,
    pub mode: ScanMode,
    pub items: Vec<ScanLine>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ScanSession {
    pub fn new(tenant_id: TenantId, mode: ScanMode) -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::new(),
            tenant_id,
            mode,
            items: Vec::new(),
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }
}
