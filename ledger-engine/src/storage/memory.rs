//! In-memory store
//!
//! Used in development and tests. All maps sit behind one lock so that
//! reservation and index maintenance are atomic.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::{Reservation, StoreStats, TransactionStore};
use crate::error::LedgerResult;
use crate::types::{
    normalize_tx_hash, record_key, reservation_key, OperationKind, PayloadHash, PendingId,
    PendingTransaction, ReconciliationRecord, TxStatus,
};

#[derive(Debug, Default)]
struct Inner {
    pending: HashMap<PendingId, PendingTransaction>,
    // indexes
    in_flight: HashMap<String, PendingId>,
    tx_index: HashMap<String, PendingId>,
    payload_index: HashMap<PayloadHash, Vec<PendingId>>,
    // records
    records: HashMap<String, ReconciliationRecord>,
    record_by_pending: HashMap<PendingId, String>,
    watermarks: HashMap<String, u64>,
}

impl Inner {
    fn index(&mut self, pending: &PendingTransaction) {
        for hash in pending.broadcast_hashes() {
            self.tx_index.insert(normalize_tx_hash(&hash), pending.id);
        }
        let ids = self.payload_index.entry(pending.payload_hash).or_default();
        if !ids.contains(&pending.id) {
            ids.push(pending.id);
        }

        let key = pending.reservation_key();
        if pending.status.blocks_new_submission() {
            // Never taken over from another holder
            self.in_flight.entry(key).or_insert(pending.id);
        } else if self.in_flight.get(&key) == Some(&pending.id) {
            self.in_flight.remove(&key);
        }
    }
}

/// In-memory transaction store
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop all data
    pub async fn clear(&self) {
        *self.inner.write().await = Inner::default();
    }
}

#[async_trait]
impl TransactionStore for MemoryStore {
    async fn reserve(&self, pending: &PendingTransaction) -> LedgerResult<Reservation> {
        let mut inner = self.inner.write().await;
        let key = pending.reservation_key();
        if let Some(holder) = inner.in_flight.get(&key) {
            if *holder != pending.id {
                return Ok(Reservation::InFlight(*holder));
            }
        }
        inner.in_flight.insert(key, pending.id);
        inner.pending.insert(pending.id, pending.clone());
        inner.index(pending);
        Ok(Reservation::Reserved)
    }

    async fn save(&self, pending: &PendingTransaction) -> LedgerResult<()> {
        let mut inner = self.inner.write().await;
        inner.pending.insert(pending.id, pending.clone());
        inner.index(pending);
        Ok(())
    }

    async fn save_if(&self, pending: &PendingTransaction, expected: TxStatus) -> LedgerResult<bool> {
        let mut inner = self.inner.write().await;
        match inner.pending.get(&pending.id) {
            Some(stored) if stored.status == expected => {}
            _ => return Ok(false),
        }
        inner.pending.insert(pending.id, pending.clone());
        inner.index(pending);
        Ok(true)
    }

    async fn get(&self, id: &PendingId) -> LedgerResult<Option<PendingTransaction>> {
        Ok(self.inner.read().await.pending.get(id).cloned())
    }

    async fn find_by_tx_hash(&self, tx_hash: &str) -> LedgerResult<Option<PendingTransaction>> {
        let inner = self.inner.read().await;
        Ok(inner
            .tx_index
            .get(&normalize_tx_hash(tx_hash))
            .and_then(|id| inner.pending.get(id))
            .cloned())
    }

    async fn find_by_payload_hash(&self, hash: &PayloadHash) -> LedgerResult<Vec<PendingTransaction>> {
        let inner = self.inner.read().await;
        let mut found: Vec<PendingTransaction> = inner
            .payload_index
            .get(hash)
            .map(|ids| ids.iter().filter_map(|id| inner.pending.get(id).cloned()).collect())
            .unwrap_or_default();
        found.sort_by_key(|p| p.created_at);
        Ok(found)
    }

    async fn list_by_status(&self, status: TxStatus) -> LedgerResult<Vec<PendingTransaction>> {
        let inner = self.inner.read().await;
        let mut found: Vec<PendingTransaction> = inner
            .pending
            .values()
            .filter(|p| p.status == status)
            .cloned()
            .collect();
        found.sort_by_key(|p| p.created_at);
        Ok(found)
    }

    async fn in_flight(&self, entity_id: &str, kind: OperationKind) -> LedgerResult<Option<PendingId>> {
        let inner = self.inner.read().await;
        Ok(inner.in_flight.get(&reservation_key(entity_id, kind)).copied())
    }

    async fn insert_record(&self, record: &ReconciliationRecord) -> LedgerResult<bool> {
        let mut inner = self.inner.write().await;
        let key = record.key();
        if inner.records.contains_key(&key) {
            return Ok(false);
        }
        if let Some(id) = record.pending_id {
            inner.record_by_pending.insert(id, key.clone());
        }
        inner.records.insert(key, record.clone());
        Ok(true)
    }

    async fn get_record(
        &self,
        tx_hash: &str,
        kind: OperationKind,
    ) -> LedgerResult<Option<ReconciliationRecord>> {
        let key = record_key(&normalize_tx_hash(tx_hash), kind);
        Ok(self.inner.read().await.records.get(&key).cloned())
    }

    async fn get_record_by_pending(&self, id: &PendingId) -> LedgerResult<Option<ReconciliationRecord>> {
        let inner = self.inner.read().await;
        Ok(inner
            .record_by_pending
            .get(id)
            .and_then(|key| inner.records.get(key))
            .cloned())
    }

    async fn list_records(&self) -> LedgerResult<Vec<ReconciliationRecord>> {
        let inner = self.inner.read().await;
        let mut records: Vec<ReconciliationRecord> = inner.records.values().cloned().collect();
        records.sort_by_key(|r| r.confirmed_at);
        Ok(records)
    }

    async fn watermark(&self, poller: &str) -> LedgerResult<Option<u64>> {
        Ok(self.inner.read().await.watermarks.get(poller).copied())
    }

    async fn set_watermark(&self, poller: &str, next_block: u64) -> LedgerResult<()> {
        self.inner
            .write()
            .await
            .watermarks
            .insert(poller.to_string(), next_block);
        Ok(())
    }

    async fn stats(&self) -> LedgerResult<StoreStats> {
        let inner = self.inner.read().await;
        let mut stats = StoreStats::default();
        for pending in inner.pending.values() {
            stats.count(pending.status);
        }
        stats.in_flight = inner.in_flight.len() as u64;
        stats.total_records = inner.records.len() as u64;
        stats.orphan_records = inner.records.values().filter(|r| r.is_orphan()).count() as u64;
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tests as conformance;

    #[tokio::test]
    async fn test_single_flight() {
        conformance::single_flight(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn test_reservation_released_on_terminal_status() {
        conformance::reservation_release(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn test_lookup_indexes() {
        conformance::lookup_indexes(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn test_record_insert_is_write_once() {
        conformance::write_once_records(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn test_blocking_save_keeps_holder() {
        conformance::blocking_save_keeps_holder(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn test_conditional_save() {
        conformance::conditional_save(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn test_watermarks() {
        conformance::watermarks(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn test_concurrent_reservations() {
        let store = std::sync::Arc::new(MemoryStore::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let pending = conformance::earn("U1", "booking B9");
                store.reserve(&pending).await.unwrap()
            }));
        }
        let mut reserved = 0;
        for handle in handles {
            if handle.await.unwrap() == Reservation::Reserved {
                reserved += 1;
            }
        }
        assert_eq!(reserved, 1);
    }

    #[tokio::test]
    async fn test_clear() {
        let store = MemoryStore::new();
        store.save(&conformance::earn("U1", "booking B9")).await.unwrap();
        store.clear().await;
        assert_eq!(store.stats().await.unwrap(), StoreStats::default());
    }
}
