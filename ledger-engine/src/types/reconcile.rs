//! ReconciliationRecord - write-once proof that a confirmation was applied

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::common::PayloadHash;
use super::operation::{EntityType, OperationKind};
use super::pending::PendingId;

/// Applied confirmation. Unique per `(tx_hash, operation_kind)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationRecord {
    /// Off-chain entity the update was applied to
    pub entity_id: String,
    pub entity_type: EntityType,
    pub payload_hash: PayloadHash,
    pub confirmed_at: DateTime<Utc>,
    pub tx_hash: String,
    pub operation_kind: OperationKind,
    pub block_number: Option<u64>,
    /// Matching local transaction; `None` for orphans
    pub pending_id: Option<PendingId>,
}

impl ReconciliationRecord {
    /// Uniqueness key
    pub fn key(&self) -> String {
        record_key(&self.tx_hash, self.operation_kind)
    }

    pub fn is_orphan(&self) -> bool {
        self.pending_id.is_none()
    }
}

/// Uniqueness key for `(tx_hash, kind)`
pub fn record_key(tx_hash: &str, kind: OperationKind) -> String {
    format!("{}:{}", tx_hash.to_lowercase(), kind.as_str())
}

/// Result of reconciling one event or receipt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconciliationOutcome {
    /// Matched a local pending transaction
    Reconciled(ReconciliationRecord),
    /// No local transaction; applied from the event arguments alone
    ReconciledOrphan(ReconciliationRecord),
    /// Duplicate; nothing changed
    AlreadyReconciled,
}

impl ReconciliationOutcome {
    pub fn record(&self) -> Option<&ReconciliationRecord> {
        match self {
            ReconciliationOutcome::Reconciled(r) | ReconciliationOutcome::ReconciledOrphan(r) => {
                Some(r)
            }
            ReconciliationOutcome::AlreadyReconciled => None,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, ReconciliationOutcome::AlreadyReconciled)
    }
}
