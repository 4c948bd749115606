//! PendingTransaction - one ledger write tracked from request to confirmation
//!
//! The pending transaction is the audit unit of the engine: every attempt is
//! appended to `attempt_log`, and a record is never deleted to hide a failure.
//!
//! # State machine
//!
//! ```text
//! queued ──→ submitted ──┬──→ confirmed
//!   │   ▲                ├──→ failed ──(retry_failed)──→ queued
//!   │   │                └──→ orphaned ──→ confirmed | failed
//!   └───┴──→ failed
//! ```
//!
//! Reconciliation may also move `queued` or `failed` straight to `confirmed`
//! when the ledger proves the write landed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::common::PayloadHash;
use super::operation::{Operation, OperationKind};
use crate::error::{LedgerError, LedgerResult, OperationError};

/// Pending transaction identifier
pub type PendingId = Uuid;

/// Pending transaction status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
    /// Accepted, no attempt broadcast yet
    #[default]
    Queued,
    /// Broadcast accepted, waiting for a receipt
    Submitted,
    /// Included with a successful receipt
    Confirmed,
    /// Terminal failure, nothing pending on chain
    Failed,
    /// Broadcast but unresolved; may still land
    Orphaned,
}

impl TxStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Confirmed | Self::Failed)
    }

    /// Statuses that hold the single-flight reservation
    pub fn blocks_new_submission(&self) -> bool {
        matches!(self, Self::Queued | Self::Submitted | Self::Orphaned)
    }

    pub fn can_transition_to(&self, target: TxStatus) -> bool {
        match (self, target) {
            (Self::Queued, Self::Submitted) => true,
            (Self::Queued, Self::Failed) => true,
            (Self::Queued, Self::Confirmed) => true,

            (Self::Submitted, Self::Confirmed) => true,
            (Self::Submitted, Self::Failed) => true,
            (Self::Submitted, Self::Orphaned) => true,

            (Self::Orphaned, Self::Confirmed) => true,
            (Self::Orphaned, Self::Failed) => true,

            (Self::Failed, Self::Queued) => true,
            (Self::Failed, Self::Confirmed) => true,

            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Submitted => "submitted",
            Self::Confirmed => "confirmed",
            Self::Failed => "failed",
            Self::Orphaned => "orphaned",
        }
    }
}

impl std::fmt::Display for TxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a single attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Confirmed,
    Reverted,
    NonceConflict,
    Underpriced,
    Transient,
    Fatal,
    Timeout,
    Cancelled,
}

/// Single attempt record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// Zero-based attempt index
    pub attempt: u32,
    pub nonce: Option<u64>,
    pub gas_price: Option<u64>,
    pub outcome: AttemptOutcome,
    pub tx_hash: Option<String>,
    pub error: Option<String>,
    pub attempted_at: DateTime<Utc>,
}

impl AttemptRecord {
    pub fn new(attempt: u32, outcome: AttemptOutcome) -> Self {
        Self {
            attempt,
            nonce: None,
            gas_price: None,
            outcome,
            tx_hash: None,
            error: None,
            attempted_at: Utc::now(),
        }
    }

    pub fn with_nonce(mut self, nonce: u64, gas_price: u64) -> Self {
        self.nonce = Some(nonce);
        self.gas_price = Some(gas_price);
        self
    }

    pub fn with_tx_hash(mut self, tx_hash: impl Into<String>) -> Self {
        self.tx_hash = Some(tx_hash.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// A tracked ledger write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingTransaction {
    pub id: PendingId,
    pub operation: Operation,
    pub payload_hash: PayloadHash,
    /// Nonce of the latest attempt
    pub nonce: Option<u64>,
    /// Gas price (wei) of the latest attempt
    pub gas_price: Option<u64>,
    pub gas_limit: Option<u64>,
    pub status: TxStatus,
    /// Zero-based index of the current attempt
    pub attempt: u32,
    pub last_error: Option<String>,
    /// Hash of the latest broadcast attempt
    pub tx_hash: Option<String>,
    pub block_number: Option<u64>,
    /// Caller-facing failure once terminal
    pub terminal_error: Option<OperationError>,
    pub attempt_log: Vec<AttemptRecord>,
    /// Times an operator moved this record from failed back to queued
    pub requeue_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PendingTransaction {
    pub fn new(operation: Operation) -> Self {
        let now = Utc::now();
        let payload_hash = operation.payload_hash();
        Self {
            id: Uuid::new_v4(),
            operation,
            payload_hash,
            nonce: None,
            gas_price: None,
            gas_limit: None,
            status: TxStatus::Queued,
            attempt: 0,
            last_error: None,
            tx_hash: None,
            block_number: None,
            terminal_error: None,
            attempt_log: Vec::new(),
            requeue_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn kind(&self) -> OperationKind {
        self.operation.kind()
    }

    pub fn entity_id(&self) -> &str {
        self.operation.entity_id()
    }

    /// Single-flight key for this transaction
    pub fn reservation_key(&self) -> String {
        reservation_key(self.entity_id(), self.kind())
    }

    /// Move to `target`, rejecting transitions the state machine forbids
    pub fn transition(&mut self, target: TxStatus) -> LedgerResult<()> {
        if !self.status.can_transition_to(target) {
            return Err(LedgerError::StateTransition(format!(
                "{} -> {} for {}",
                self.status, target, self.id
            )));
        }
        self.status = target;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn record_attempt(&mut self, record: AttemptRecord) {
        if let Some(ref error) = record.error {
            self.last_error = Some(error.clone());
        }
        if let Some(ref hash) = record.tx_hash {
            self.tx_hash = Some(hash.clone());
        }
        self.attempt_log.push(record);
        self.updated_at = Utc::now();
    }

    /// Terminal failure caused by exhausted recoverable errors
    pub fn is_exhausted(&self) -> bool {
        self.status == TxStatus::Failed
            && matches!(
                self.terminal_error,
                Some(OperationError::MaxRetriesExceeded { .. })
            )
    }

    /// Every hash this transaction was ever broadcast under, including one
    /// still awaiting its receipt
    pub fn broadcast_hashes(&self) -> Vec<String> {
        let mut hashes: Vec<String> = self
            .attempt_log
            .iter()
            .filter_map(|a| a.tx_hash.clone())
            .collect();
        if let Some(ref current) = self.tx_hash {
            if !hashes.contains(current) {
                hashes.push(current.clone());
            }
        }
        hashes.dedup();
        hashes
    }
}

/// Single-flight key for `(entity_id, kind)`
pub fn reservation_key(entity_id: &str, kind: OperationKind) -> String {
    format!("{}:{}", kind.as_str(), entity_id)
}
