//! Sled persistent store
//!
//! Reservation, conditional status writes and record inserts all use
//! `compare_and_swap`, so single-flight and write-once hold even with several
//! engines sharing one database handle.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::path::Path;
use uuid::Uuid;

use super::{Reservation, StoreStats, TransactionStore};
use crate::config::StorageConfig;
use crate::error::{LedgerError, LedgerResult};
use crate::types::{
    normalize_tx_hash, record_key, reservation_key, OperationKind, PayloadHash, PendingId,
    PendingTransaction, ReconciliationRecord, TxStatus,
};

const PENDING_TREE: &str = "pending";
const IN_FLIGHT_TREE: &str = "in_flight";
const TX_INDEX_TREE: &str = "tx_index";
const PAYLOAD_INDEX_TREE: &str = "payload_index";
const RECORDS_TREE: &str = "records";
const RECORD_BY_PENDING_TREE: &str = "record_by_pending";
const WATERMARK_TREE: &str = "watermarks";

const DEFAULT_PATH: &str = "./data/ledger-engine";

/// Sled-backed transaction store
#[derive(Debug, Clone)]
pub struct SledStore {
    db: sled::Db,
    pending: sled::Tree,
    in_flight: sled::Tree,
    tx_index: sled::Tree,
    payload_index: sled::Tree,
    records: sled::Tree,
    record_by_pending: sled::Tree,
    watermarks: sled::Tree,
}

impl SledStore {
    pub fn new(config: &StorageConfig) -> LedgerResult<Self> {
        Self::open(config.path.as_deref().unwrap_or(DEFAULT_PATH))
    }

    /// Open or create the database at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> LedgerResult<Self> {
        let db = sled::open(path)
            .map_err(|e| LedgerError::Storage(format!("Failed to open sled db: {}", e)))?;
        let tree = |name: &str| {
            db.open_tree(name)
                .map_err(|e| LedgerError::Storage(format!("Failed to open {} tree: {}", name, e)))
        };

        Ok(Self {
            pending: tree(PENDING_TREE)?,
            in_flight: tree(IN_FLIGHT_TREE)?,
            tx_index: tree(TX_INDEX_TREE)?,
            payload_index: tree(PAYLOAD_INDEX_TREE)?,
            records: tree(RECORDS_TREE)?,
            record_by_pending: tree(RECORD_BY_PENDING_TREE)?,
            watermarks: tree(WATERMARK_TREE)?,
            db,
        })
    }

    pub fn flush(&self) -> LedgerResult<()> {
        self.db
            .flush()
            .map_err(|e| LedgerError::Storage(format!("Failed to flush db: {}", e)))?;
        Ok(())
    }

    // ==================== Helpers ====================

    fn serialize<T: Serialize>(value: &T) -> LedgerResult<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| LedgerError::Serialization(e.to_string()))
    }

    fn deserialize<T: DeserializeOwned>(bytes: &[u8]) -> LedgerResult<T> {
        serde_json::from_slice(bytes).map_err(|e| LedgerError::Serialization(e.to_string()))
    }

    fn parse_id(bytes: &[u8]) -> LedgerResult<PendingId> {
        Uuid::from_slice(bytes)
            .map_err(|e| LedgerError::Storage(format!("Corrupt pending id: {}", e)))
    }

    fn payload_key(hash: &PayloadHash, id: &PendingId) -> Vec<u8> {
        let mut key = Vec::with_capacity(48);
        key.extend_from_slice(hash);
        key.extend_from_slice(id.as_bytes());
        key
    }

    fn load(&self, id: &PendingId) -> LedgerResult<Option<PendingTransaction>> {
        match self.pending.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(Self::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn write(&self, pending: &PendingTransaction) -> LedgerResult<()> {
        self.pending
            .insert(pending.id.as_bytes(), Self::serialize(pending)?)?;
        self.index(pending)
    }

    fn index(&self, pending: &PendingTransaction) -> LedgerResult<()> {
        for hash in pending.broadcast_hashes() {
            self.tx_index
                .insert(normalize_tx_hash(&hash).as_bytes(), pending.id.as_bytes().as_slice())?;
        }
        self.payload_index
            .insert(Self::payload_key(&pending.payload_hash, &pending.id), Vec::<u8>::new())?;
        Ok(())
    }

    /// Take the reservation if vacant, or release it if this id holds it
    fn settle_reservation(&self, pending: &PendingTransaction) -> LedgerResult<()> {
        let key = pending.reservation_key();
        let mine = pending.id.as_bytes().as_slice();
        if pending.status.blocks_new_submission() {
            let _ = self
                .in_flight
                .compare_and_swap(key.as_bytes(), None as Option<&[u8]>, Some(mine))?;
        } else {
            // Only the holder may release
            let _ = self
                .in_flight
                .compare_and_swap(key.as_bytes(), Some(mine), None as Option<&[u8]>)?;
        }
        Ok(())
    }

    fn load_all(&self) -> LedgerResult<Vec<PendingTransaction>> {
        let mut all = Vec::new();
        for item in self.pending.iter() {
            let (_, value) = item?;
            all.push(Self::deserialize::<PendingTransaction>(&value)?);
        }
        Ok(all)
    }
}

#[async_trait]
impl TransactionStore for SledStore {
    async fn reserve(&self, pending: &PendingTransaction) -> LedgerResult<Reservation> {
        let key = pending.reservation_key();
        let mine = pending.id.as_bytes();
        loop {
            let current = self.in_flight.get(key.as_bytes())?;
            if let Some(ref holder) = current {
                if &holder[..] != mine.as_slice() {
                    return Ok(Reservation::InFlight(Self::parse_id(holder)?));
                }
                break;
            }
            match self
                .in_flight
                .compare_and_swap(key.as_bytes(), current, Some(mine.as_slice()))?
            {
                Ok(()) => break,
                // Lost the race; re-read the holder
                Err(_) => continue,
            }
        }
        self.write(pending)?;
        Ok(Reservation::Reserved)
    }

    async fn save(&self, pending: &PendingTransaction) -> LedgerResult<()> {
        self.write(pending)?;
        self.settle_reservation(pending)
    }

    async fn save_if(&self, pending: &PendingTransaction, expected: TxStatus) -> LedgerResult<bool> {
        let bytes = Self::serialize(pending)?;
        loop {
            let current = match self.pending.get(pending.id.as_bytes())? {
                Some(current) => current,
                None => return Ok(false),
            };
            if Self::deserialize::<PendingTransaction>(&current)?.status != expected {
                return Ok(false);
            }
            match self.pending.compare_and_swap(
                pending.id.as_bytes(),
                Some(current),
                Some(bytes.as_slice()),
            )? {
                Ok(()) => break,
                // Row changed under us; check the status again
                Err(_) => continue,
            }
        }
        self.index(pending)?;
        self.settle_reservation(pending)?;
        Ok(true)
    }

    async fn get(&self, id: &PendingId) -> LedgerResult<Option<PendingTransaction>> {
        self.load(id)
    }

    async fn find_by_tx_hash(&self, tx_hash: &str) -> LedgerResult<Option<PendingTransaction>> {
        match self.tx_index.get(normalize_tx_hash(tx_hash).as_bytes())? {
            Some(id) => self.load(&Self::parse_id(&id)?),
            None => Ok(None),
        }
    }

    async fn find_by_payload_hash(&self, hash: &PayloadHash) -> LedgerResult<Vec<PendingTransaction>> {
        let mut found = Vec::new();
        for item in self.payload_index.scan_prefix(hash) {
            let (key, _) = item?;
            let id = Self::parse_id(&key[hash.len()..])?;
            if let Some(pending) = self.load(&id)? {
                found.push(pending);
            }
        }
        found.sort_by_key(|p| p.created_at);
        Ok(found)
    }

    async fn list_by_status(&self, status: TxStatus) -> LedgerResult<Vec<PendingTransaction>> {
        let mut found: Vec<PendingTransaction> = self
            .load_all()?
            .into_iter()
            .filter(|p| p.status == status)
            .collect();
        found.sort_by_key(|p| p.created_at);
        Ok(found)
    }

    async fn in_flight(&self, entity_id: &str, kind: OperationKind) -> LedgerResult<Option<PendingId>> {
        match self.in_flight.get(reservation_key(entity_id, kind).as_bytes())? {
            Some(id) => Ok(Some(Self::parse_id(&id)?)),
            None => Ok(None),
        }
    }

    async fn insert_record(&self, record: &ReconciliationRecord) -> LedgerResult<bool> {
        let key = record.key();
        let inserted = self
            .records
            .compare_and_swap(
                key.as_bytes(),
                None as Option<&[u8]>,
                Some(Self::serialize(record)?),
            )?
            .is_ok();
        if inserted {
            if let Some(id) = record.pending_id {
                self.record_by_pending.insert(id.as_bytes(), key.as_bytes())?;
            }
        }
        Ok(inserted)
    }

    async fn get_record(
        &self,
        tx_hash: &str,
        kind: OperationKind,
    ) -> LedgerResult<Option<ReconciliationRecord>> {
        let key = record_key(&normalize_tx_hash(tx_hash), kind);
        match self.records.get(key.as_bytes())? {
            Some(bytes) => Ok(Some(Self::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn get_record_by_pending(&self, id: &PendingId) -> LedgerResult<Option<ReconciliationRecord>> {
        let key = match self.record_by_pending.get(id.as_bytes())? {
            Some(key) => key,
            None => return Ok(None),
        };
        match self.records.get(key)? {
            Some(bytes) => Ok(Some(Self::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn list_records(&self) -> LedgerResult<Vec<ReconciliationRecord>> {
        let mut records = Vec::new();
        for item in self.records.iter() {
            let (_, value) = item?;
            records.push(Self::deserialize::<ReconciliationRecord>(&value)?);
        }
        records.sort_by_key(|r| r.confirmed_at);
        Ok(records)
    }

    async fn watermark(&self, poller: &str) -> LedgerResult<Option<u64>> {
        match self.watermarks.get(poller.as_bytes())? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes.as_ref().try_into().map_err(|_| {
                    LedgerError::Storage(format!("Corrupt watermark for {}", poller))
                })?;
                Ok(Some(u64::from_be_bytes(raw)))
            }
            None => Ok(None),
        }
    }

    async fn set_watermark(&self, poller: &str, next_block: u64) -> LedgerResult<()> {
        self.watermarks
            .insert(poller.as_bytes(), next_block.to_be_bytes().as_slice())?;
        Ok(())
    }

    async fn stats(&self) -> LedgerResult<StoreStats> {
        let mut stats = StoreStats::default();
        for pending in self.load_all()? {
            stats.count(pending.status);
        }
        stats.in_flight = self.in_flight.len() as u64;
        for record in self.list_records().await? {
            stats.total_records += 1;
            if record.is_orphan() {
                stats.orphan_records += 1;
            }
        }
        Ok(stats)
    }
}
