//! Denormalized stock kept in sync from product and reconciliation events.
//!
//! Delivery is at-least-once, so the ledger remembers recently applied
//! envelope ids and skips duplicates.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Deserialize;
use shopmesh_core::MessageEnvelope;
use tracing::{debug, info, warn};

use super::product::{failed_kind, PRODUCT_CREATED};
use super::reconciliation::INVENTORY_RECONCILE;
use crate::bus::{BusError, MessageBusClient, MessageHandler};

const DEFAULT_REMEMBERED_IDS: usize = 10_000;

#[derive(Debug, Deserialize)]
struct ProductCreated {
    id: String,
    #[serde(default)]
    stock: u32,
}

#[derive(Debug, Deserialize)]
struct ProductRolledBack {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReconcileItem {
    product_id: String,
    quantity: u32,
    #[serde(default)]
    tx_id: Option<String>,
}

impl ReconcileItem {
    /// Identity of the correction independent of the envelope carrying it.
    fn correction_key(&self) -> Option<String> {
        self.tx_id
            .as_ref()
            .map(|tx| format!("reconcile:{tx}:{}", self.product_id))
    }
}

/// Bounded set of recently seen ids, evicting the oldest first.
#[derive(Debug)]
struct SeenIds {
    capacity: usize,
    ids: HashSet<String>,
    order: VecDeque<String>,
}

impl SeenIds {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            ids: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    fn insert(&mut self, id: String) {
        if !self.ids.insert(id.clone()) {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }
}

/// Stock per product id.
#[derive(Debug)]
pub struct InventoryLedger {
    stock: DashMap<String, u32>,
    seen: Mutex<SeenIds>,
}

impl Default for InventoryLedger {
    fn default() -> Self {
        Self::new(DEFAULT_REMEMBERED_IDS)
    }
}

impl InventoryLedger {
    /// `remembered_ids` bounds the duplicate-detection window.
    #[must_use]
    pub fn new(remembered_ids: usize) -> Self {
        Self {
            stock: DashMap::new(),
            seen: Mutex::new(SeenIds::new(remembered_ids)),
        }
    }

    #[must_use]
    pub fn stock(&self, product_id: &str) -> Option<u32> {
        self.stock.get(product_id).map(|s| *s)
    }

    #[must_use]
    pub fn product_count(&self) -> usize {
        self.stock.len()
    }

    /// Registers the ledger for every event type it consumes.
    ///
    /// # Errors
    ///
    /// Returns a broker error if binding on a live connection fails.
    pub async fn subscribe(self: &Arc<Self>, bus: &MessageBusClient) -> Result<(), BusError> {
        for kind in [
            PRODUCT_CREATED.to_string(),
            failed_kind(PRODUCT_CREATED),
            INVENTORY_RECONCILE.to_string(),
        ] {
            bus.subscribe(kind, Arc::clone(self) as Arc<dyn MessageHandler>)
                .await?;
        }
        Ok(())
    }

    /// Applies one event. Returns `false` for duplicates and ignored types.
    ///
    /// # Errors
    ///
    /// Returns an error when the payload does not match the event type.
    pub fn apply(&self, envelope: &MessageEnvelope) -> anyhow::Result<bool> {
        if self.seen.lock().contains(&envelope.id) {
            debug!(id = %envelope.id, kind = %envelope.kind, "skipping duplicate event");
            return Ok(false);
        }

        let applied = match envelope.kind.as_str() {
            PRODUCT_CREATED => {
                let created: ProductCreated = serde_json::from_value(envelope.data.clone())?;
                self.stock.insert(created.id, created.stock);
                true
            }
            INVENTORY_RECONCILE => {
                let item: ReconcileItem = serde_json::from_value(envelope.data.clone())?;
                let key = item.correction_key();
                if let Some(key) = &key {
                    if self.seen.lock().contains(key) {
                        debug!(id = %envelope.id, correction = %key, "skipping repeated correction");
                        return Ok(false);
                    }
                }
                let mut entry = self.stock.entry(item.product_id.clone()).or_insert(0);
                let before = *entry;
                *entry = before.saturating_sub(item.quantity);
                info!(
                    product = %item.product_id,
                    before,
                    after = *entry,
                    "inventory reconciled"
                );
                drop(entry);
                if let Some(key) = key {
                    self.seen.lock().insert(key);
                }
                true
            }
            kind if kind == failed_kind(PRODUCT_CREATED) => {
                let rolled_back: ProductRolledBack = serde_json::from_value(envelope.data.clone())?;
                self.stock.remove(&rolled_back.id);
                true
            }
            _ => false,
        };

        if applied {
            self.seen.lock().insert(envelope.id.clone());
        }
        Ok(applied)
    }
}

#[async_trait]
impl MessageHandler for InventoryLedger {
    async fn handle(&self, envelope: MessageEnvelope) -> anyhow::Result<()> {
        // A payload that does not parse now never will; drop it instead of
        // requeueing forever.
        if let Err(e) = self.apply(&envelope) {
            warn!(id = %envelope.id, kind = %envelope.kind, error = %e, "discarding malformed inventory event");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};
    use shopmesh_core::ManualClock;

    use super::*;

    fn event(kind: &str, data: Value) -> MessageEnvelope {
        MessageEnvelope::new(kind, data, "test", &ManualClock::new(1))
    }

    #[test]
    fn tracks_created_products() {
        let ledger = InventoryLedger::default();
        assert!(ledger
            .apply(&event("product.created", json!({"id": "p-1", "stock": 5})))
            .unwrap());
        assert_eq!(ledger.stock("p-1"), Some(5));
    }

    #[test]
    fn reconciliation_decrements_once_per_envelope() {
        let ledger = InventoryLedger::default();
        ledger
            .apply(&event("product.created", json!({"id": "p-1", "stock": 5})))
            .unwrap();
        let reconcile = event("inventory.reconcile", json!({"productId": "p-1", "quantity": 2}));
        assert!(ledger.apply(&reconcile).unwrap());
        assert!(!ledger.apply(&reconcile).unwrap());
        assert_eq!(ledger.stock("p-1"), Some(3));
    }

    #[test]
    fn repeated_correction_for_same_transaction_and_product_applies_once() {
        let ledger = InventoryLedger::default();
        ledger
            .apply(&event("product.created", json!({"id": "p-1", "stock": 5})))
            .unwrap();
        let correction = json!({"productId": "p-1", "quantity": 2, "txId": "tx-1"});
        assert!(ledger.apply(&event("inventory.reconcile", correction.clone())).unwrap());
        // Same correction republished under a fresh envelope id.
        assert!(!ledger.apply(&event("inventory.reconcile", correction)).unwrap());
        assert_eq!(ledger.stock("p-1"), Some(3));

        let other_tx = json!({"productId": "p-1", "quantity": 1, "txId": "tx-2"});
        assert!(ledger.apply(&event("inventory.reconcile", other_tx)).unwrap());
        assert_eq!(ledger.stock("p-1"), Some(2));
    }

    #[test]
    fn decrement_saturates_at_zero() {
        let ledger = InventoryLedger::default();
        ledger
            .apply(&event("inventory.reconcile", json!({"productId": "p-9", "quantity": 3})))
            .unwrap();
        assert_eq!(ledger.stock("p-9"), Some(0));
    }

    #[test]
    fn failed_creation_removes_product() {
        let ledger = InventoryLedger::default();
        ledger
            .apply(&event("product.created", json!({"id": "p-1", "stock": 1})))
            .unwrap();
        ledger
            .apply(&event("product.created.FAILED", json!({"id": "p-1", "reason": "x"})))
            .unwrap();
        assert_eq!(ledger.stock("p-1"), None);
        assert_eq!(ledger.product_count(), 0);
    }

    #[test]
    fn unknown_kinds_are_ignored_and_bad_payloads_error() {
        let ledger = InventoryLedger::default();
        assert!(!ledger.apply(&event("order.created", json!({}))).unwrap());
        assert!(ledger
            .apply(&event("product.created", json!({"name": "no id"})))
            .is_err());
    }

    #[test]
    fn dedup_window_is_bounded() {
        let ledger = InventoryLedger::new(2);
        let first = event("inventory.reconcile", json!({"productId": "p", "quantity": 0}));
        ledger.apply(&first).unwrap();
        for _ in 0..2 {
            ledger
                .apply(&event("inventory.reconcile", json!({"productId": "p", "quantity": 0})))
                .unwrap();
        }
        // Evicted from the window, so it applies again.
        assert!(ledger.apply(&first).unwrap());
    }

    #[tokio::test]
    async fn malformed_payload_is_acknowledged() {
        let ledger = InventoryLedger::default();
        let result = ledger
            .handle(event("inventory.reconcile", json!({"productId": 1})))
            .await;
        assert!(result.is_ok());
    }
}
