//! Device-local projection of a remote inventory item.
//!
//! Only the fields needed for scan-time lookup are cached; full item detail
//! is fetched live when online and is not part of this core.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{ItemId, TenantId};

/// Derived stock status of a cached item.
///
/// Always recomputed locally from `(quantity, min_quantity)`; a status field
/// received from upstream is never trusted directly.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    InStock,
    LowStock,
    OutOfStock,
}

impl ItemStatus {
    /// Derive the stock status from a quantity and optional minimum.
    ///
    /// Pure: `OutOfStock` iff quantity == 0; else `LowStock` iff
    /// `min_quantity > 0` and `quantity <= min_quantity`; else `InStock`.
    pub fn derive(quantity: i64, min_quantity: Option<i64>) -> Self {
        if quantity == 0 {
            return ItemStatus::OutOfStock;
        }
        match min_quantity {
            Some(min) if min > 0 && quantity <= min => ItemStatus::LowStock,
            _ => ItemStatus::InStock,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::InStock => "in_stock",
            ItemStatus::LowStock => "low_stock",
            ItemStatus::OutOfStock => "out_of_stock",
        }
    }
}

/// Wire projection of an item as returned by the remote store's pull
/// endpoint. Carries no derived status and no local timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteItem {
    pub id: ItemId,
    pub tenant_id: TenantId,
    pub barcode: Option<String>,
    pub sku: Option<String>,
    pub name: String,
    pub quantity: i64,
    pub min_quantity: Option<i64>,
    pub price: Option<f64>,
    pub image_url: Option<String>,
    pub folder_id: Option<String>,
    pub folder_name: Option<String>,
    /// Remote modification timestamp; also the pull cursor watermark.
    pub updated_at: DateTime<Utc>,
}

impl RemoteItem {
    /// Whether this item is worth caching for scan-time lookup.
    pub fn is_scan_relevant(&self) -> bool {
        self.barcode.is_some() || self.sku.is_some()
    }

    /// Convert into the local projection, deriving the status and stamping
    /// the local fetch time.
    pub fn into_cached(self, synced_at: DateTime<Utc>) -> CachedItem {
        let status = ItemStatus::derive(self.quantity, self.min_quantity);
        CachedItem {
            id: self.id,
            tenant_id: self.tenant_id,
            barcode: self.barcode,
            sku: self.sku,
            name: self.name,
            quantity: self.quantity,
            min_quantity: self.min_quantity,
            price: self.price,
            image_url: self.image_url,
            folder_id: self.folder_id,
            folder_name: self.folder_name,
            status,
            updated_at: self.updated_at,
            synced_at,
        }
    }
}

/// Device-local cached item used for barcode/SKU lookup while offline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedItem {
    pub id: ItemId,
    pub tenant_id: TenantId,
    pub barcode: Option<String>,
    pub sku: Option<String>,
    pub name: String,
    pub quantity: i64,
    pub min_quantity: Option<i64>,
    pub price: Option<f64>,
    pub image_url: Option<String>,
    pub folder_id: Option<String>,
    pub folder_name: Option<String>,
    /// Derived from `(quantity, min_quantity)`.
    pub status: ItemStatus,
    /// Remote modification timestamp.
    pub updated_at: DateTime<Utc>,
    /// Local fetch timestamp.
    pub synced_at: DateTime<Utc>,
}

impl CachedItem {
    /// Whether this item is worth caching for scan-time lookup.
    pub fn is_scan_relevant(&self) -> bool {
        self.barcode.is_some() || self.sku.is_some()
    }

    /// Apply a local quantity delta (optimistic application of a queued
    /// change). Clamps at zero and recomputes the derived status.
    pub fn apply_delta(&mut self, delta: i64) {
        self.quantity = (self.quantity + delta).max(0);
        self.status = ItemStatus::derive(self.quantity, self.min_quantity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn status_derivation_matches_policy() {
        assert_eq!(ItemStatus::derive(0, Some(10)), ItemStatus::OutOfStock);
        assert_eq!(ItemStatus::derive(0, None), ItemStatus::OutOfStock);
        assert_eq!(ItemStatus::derive(10, Some(10)), ItemStatus::LowStock);
        assert_eq!(ItemStatus::derive(11, Some(10)), ItemStatus::InStock);
        assert_eq!(ItemStatus::derive(5, Some(0)), ItemStatus::InStock);
        assert_eq!(ItemStatus::derive(5, None), ItemStatus::InStock);
    }

    #[test]
    fn apply_delta_clamps_at_zero_and_rederives_status() {
        let mut item = sample_item(20, Some(10));
        item.apply_delta(-5);
        assert_eq!(item.quantity, 15);
        assert_eq!(item.status, ItemStatus::InStock);

        item.apply_delta(-7);
        assert_eq!(item.quantity, 8);
        assert_eq!(item.status, ItemStatus::LowStock);

        item.apply_delta(-100);
        assert_eq!(item.quantity, 0);
        assert_eq!(item.status, ItemStatus::OutOfStock);
    }

    #[test]
    fn scan_relevance_requires_barcode_or_sku() {
        let mut item = sample_item(1, None);
        assert!(item.is_scan_relevant());
        item.barcode = None;
        item.sku = Some("SKU-1".to_string());
        assert!(item.is_scan_relevant());
        item.sku = None;
        assert!(!item.is_scan_relevant());
    }

    proptest! {
        #[test]
        fn status_is_deterministic_and_total(qty in 0i64..100_000, min in proptest::option::of(0i64..100_000)) {
            let a = ItemStatus::derive(qty, min);
            let b = ItemStatus::derive(qty, min);
            prop_assert_eq!(a, b);

            if qty == 0 {
                prop_assert_eq!(a, ItemStatus::OutOfStock);
            } else if let Some(m) = min {
                if m > 0 && qty <= m {
                    prop_assert_eq!(a, ItemStatus::LowStock);
                } else {
                    prop_assert_eq!(a, ItemStatus::InStock);
                }
            } else {
                prop_assert_eq!(a, ItemStatus::InStock);
            }
        }
    }

    fn sample_item(quantity: i64, min_quantity: Option<i64>) -> CachedItem {
        let now = Utc::now();
        CachedItem {
            id: ItemId::new(),
            tenant_id: TenantId::new(),
            barcode: Some("4006381333931".to_string()),
            sku: None,
            name: "Widget".to_string(),
            quantity,
            min_quantity,
            price: None,
            image_url: None,
            folder_id: None,
            folder_name: None,
            status: ItemStatus::derive(quantity, min_quantity),
            updated_at: now,
            synced_at: now,
        }
    }
}
