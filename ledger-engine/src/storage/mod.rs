//! Pending transaction storage
//!
//! Persists pending transactions and reconciliation records.
//!
//! - Pending transactions are never deleted; terminal ones stay for audit.
//! - `reserve` is the single-flight gate: an atomic lookup-and-reserve on
//!   `(entity_id, kind)`.
//! - `insert_record` is insert-if-absent on `(tx_hash, kind)`; the boolean
//!   result is what makes reconciliation idempotent.
//! - `save_if` is the status compare-and-swap used for every transition the
//!   driver and the reconciler may race on.
//! - Event poller watermarks live here too, so a restarted engine resumes
//!   where the previous one stopped.

pub mod memory;
pub mod sled;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::LedgerResult;
use crate::types::{
    OperationKind, PayloadHash, PendingId, PendingTransaction, ReconciliationRecord, TxStatus,
};

/// Result of a single-flight reservation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    /// Reservation taken and the transaction persisted
    Reserved,
    /// Another open transaction holds the key
    InFlight(PendingId),
}

/// Storage interface for the engine
#[async_trait]
pub trait TransactionStore: Send + Sync {
    // ==================== Pending transactions ====================

    /// Reserve `(entity_id, kind)` for `pending` and persist it, atomically.
    /// Re-reserving for the id that already holds the key succeeds.
    async fn reserve(&self, pending: &PendingTransaction) -> LedgerResult<Reservation>;

    /// Persist a pending transaction. Releases the reservation once the
    /// status no longer blocks new submissions.
    async fn save(&self, pending: &PendingTransaction) -> LedgerResult<()>;

    /// Persist only if the stored row still has status `expected`. Returns
    /// whether the write happened; a missing row is never written.
    async fn save_if(&self, pending: &PendingTransaction, expected: TxStatus) -> LedgerResult<bool>;

    async fn get(&self, id: &PendingId) -> LedgerResult<Option<PendingTransaction>>;

    /// Look up by any hash the transaction was broadcast under
    async fn find_by_tx_hash(&self, tx_hash: &str) -> LedgerResult<Option<PendingTransaction>>;

    /// All transactions with this payload hash, oldest first
    async fn find_by_payload_hash(&self, hash: &PayloadHash) -> LedgerResult<Vec<PendingTransaction>>;

    async fn list_by_status(&self, status: TxStatus) -> LedgerResult<Vec<PendingTransaction>>;

    /// Holder of the reservation for `(entity_id, kind)`, if any
    async fn in_flight(&self, entity_id: &str, kind: OperationKind) -> LedgerResult<Option<PendingId>>;

    // ==================== Reconciliation records ====================

    /// Insert unless a record for `(tx_hash, kind)` exists. Returns whether
    /// the record was written.
    async fn insert_record(&self, record: &ReconciliationRecord) -> LedgerResult<bool>;

    async fn get_record(
        &self,
        tx_hash: &str,
        kind: OperationKind,
    ) -> LedgerResult<Option<ReconciliationRecord>>;

    async fn get_record_by_pending(&self, id: &PendingId) -> LedgerResult<Option<ReconciliationRecord>>;

    async fn list_records(&self) -> LedgerResult<Vec<ReconciliationRecord>>;

    // ==================== Event watermarks ====================

    /// Next block the named poller has to scan
    async fn watermark(&self, poller: &str) -> LedgerResult<Option<u64>>;

    async fn set_watermark(&self, poller: &str, next_block: u64) -> LedgerResult<()>;

    /// Lowest block holding a broadcast transaction whose confirming event
    /// has not been applied yet
    async fn earliest_unreconciled_block(&self) -> LedgerResult<Option<u64>> {
        let mut earliest: Option<u64> = None;
        for status in [TxStatus::Submitted, TxStatus::Orphaned, TxStatus::Confirmed] {
            for pending in self.list_by_status(status).await? {
                let block = match pending.block_number {
                    Some(block) if pending.kind().has_confirming_event() => block,
                    _ => continue,
                };
                if self.get_record_by_pending(&pending.id).await?.is_some() {
                    continue;
                }
                earliest = Some(earliest.map_or(block, |e| e.min(block)));
            }
        }
        Ok(earliest)
    }

    // ==================== Stats ====================

    async fn stats(&self) -> LedgerResult<StoreStats>;
}

/// Store statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub total_pending: u64,
    pub queued: u64,
    pub submitted: u64,
    pub confirmed: u64,
    pub failed: u64,
    pub orphaned: u64,
    /// Open reservations
    pub in_flight: u64,
    pub total_records: u64,
    pub orphan_records: u64,
}

impl StoreStats {
    pub(crate) fn count(&mut self, status: TxStatus) {
        self.total_pending += 1;
        match status {
            TxStatus::Queued => self.queued += 1,
            TxStatus::Submitted => self.submitted += 1,
            TxStatus::Confirmed => self.confirmed += 1,
            TxStatus::Failed => self.failed += 1,
            TxStatus::Orphaned => self.orphaned += 1,
        }
    }
}

pub use self::sled::SledStore;
pub use memory::MemoryStore;
