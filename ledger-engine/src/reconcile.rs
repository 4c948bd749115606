//! Reconciliation Engine
//!
//! Applies confirmed ledger effects to off-chain entities exactly once.
//!
//! Every confirmation goes through one mutex, so checking for an existing
//! record, applying the entity patch and writing the record happen as one
//! step. The write-once record keyed on `(tx_hash, kind)` is what makes a
//! replayed event a no-op.
//!
//! Matching order for an observed event:
//!
//! 1. pending transaction broadcast under the event's tx hash
//! 2. oldest unreconciled pending transaction with the same payload hash
//! 3. none: apply from the event arguments alone (orphan)

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, error, info, warn};

use crate::entity::{EntityPatch, EntityRef, EntityStore};
use crate::error::{LedgerError, LedgerResult, OperationError};
use crate::metrics::EngineMetrics;
use crate::rpc::LedgerRpc;
use crate::storage::TransactionStore;
use crate::tx_builder::{decode_bool, OperationBuilder};
use crate::types::{
    normalize_address, EntityType, EventArgs, EventKind, LedgerEvent, Operation,
    PendingTransaction, ReconciliationOutcome, ReconciliationRecord, TxStatus,
};

const NOTIFY_CAPACITY: usize = 256;

/// Reconciliation engine
pub struct ReconciliationEngine {
    store: Arc<dyn TransactionStore>,
    entities: Arc<dyn EntityStore>,
    rpc: Arc<dyn LedgerRpc>,
    builder: Arc<OperationBuilder>,
    metrics: Arc<EngineMetrics>,
    lock: Mutex<()>,
    notify: broadcast::Sender<ReconciliationRecord>,
}

impl ReconciliationEngine {
    pub fn new(
        store: Arc<dyn TransactionStore>,
        entities: Arc<dyn EntityStore>,
        rpc: Arc<dyn LedgerRpc>,
        builder: Arc<OperationBuilder>,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        let (notify, _) = broadcast::channel(NOTIFY_CAPACITY);
        Self {
            store,
            entities,
            rpc,
            builder,
            metrics,
            lock: Mutex::new(()),
            notify,
        }
    }

    /// Receive every record written from now on
    pub fn subscribe(&self) -> broadcast::Receiver<ReconciliationRecord> {
        self.notify.subscribe()
    }

    /// Drain events in arrival order until every sender is gone
    pub async fn run(&self, mut events: mpsc::Receiver<LedgerEvent>) {
        info!("Reconciliation consumer started");
        while let Some(event) = events.recv().await {
            if let Err(e) = self.reconcile(&event).await {
                error!(
                    "Failed to reconcile {} in tx {}: {}",
                    event.kind, event.tx_hash, e
                );
            }
        }
        info!("Reconciliation consumer stopped");
    }

    /// Apply one observed event
    pub async fn reconcile(&self, event: &LedgerEvent) -> LedgerResult<ReconciliationOutcome> {
        let _guard = self.lock.lock().await;
        let kind = event.operation_kind();

        if self.store.get_record(&event.tx_hash, kind).await?.is_some() {
            debug!("Duplicate {} for tx {}", event.kind, event.tx_hash);
            self.metrics.duplicate_event();
            return Ok(ReconciliationOutcome::AlreadyReconciled);
        }

        let patch = patch_for(event);
        let payload_hash = event.payload_hash();

        if let Some(pending) = self.find_match(event).await? {
            if self.store.get_record_by_pending(&pending.id).await?.is_some() {
                debug!("Pending {} already reconciled", pending.id);
                self.metrics.duplicate_event();
                return Ok(ReconciliationOutcome::AlreadyReconciled);
            }

            let entity = EntityRef::new(pending.operation.entity_type(), pending.entity_id());
            self.entities.update_entity(&entity, &patch).await?;
            let pending = self
                .mark_confirmed(pending, &event.tx_hash, Some(event.block_number))
                .await?;

            let record = ReconciliationRecord {
                entity_id: entity.id,
                entity_type: entity.entity_type,
                payload_hash,
                confirmed_at: Utc::now(),
                tx_hash: event.tx_hash.clone(),
                operation_kind: kind,
                block_number: Some(event.block_number),
                pending_id: Some(pending.id),
            };
            self.write_record(&record).await?;
            self.metrics.reconciled();
            info!(
                "Reconciled {} for {} (pending {}, tx {})",
                event.kind, record.entity_id, pending.id, event.tx_hash
            );
            return Ok(ReconciliationOutcome::Reconciled(record));
        }

        let entity = orphan_entity(event);
        self.entities.update_entity(&entity, &patch).await?;
        let record = ReconciliationRecord {
            entity_id: entity.id,
            entity_type: entity.entity_type,
            payload_hash,
            confirmed_at: Utc::now(),
            tx_hash: event.tx_hash.clone(),
            operation_kind: kind,
            block_number: Some(event.block_number),
            pending_id: None,
        };
        self.write_record(&record).await?;
        self.metrics.reconciled_orphan();
        warn!(
            "Reconciled orphan {} for {} (tx {})",
            event.kind, record.entity_id, event.tx_hash
        );
        Ok(ReconciliationOutcome::ReconciledOrphan(record))
    }

    /// Reconcile an operation whose contract emits no event, from its
    /// receipt and a read-back of the ledger state.
    pub async fn reconcile_receipt(
        &self,
        pending: &PendingTransaction,
    ) -> LedgerResult<ReconciliationOutcome> {
        let review_id = match &pending.operation {
            Operation::VerifyReview { review_id, .. } => review_id.clone(),
            other => {
                return Err(OperationError::UnsupportedOperation(format!(
                    "{} is reconciled from its events",
                    other.kind()
                ))
                .into())
            }
        };
        let tx_hash = pending
            .tx_hash
            .clone()
            .ok_or_else(|| LedgerError::NotFound(format!("no receipt for pending {}", pending.id)))?;

        let _guard = self.lock.lock().await;
        let kind = pending.kind();
        if self.store.get_record(&tx_hash, kind).await?.is_some()
            || self.store.get_record_by_pending(&pending.id).await?.is_some()
        {
            self.metrics.duplicate_event();
            return Ok(ReconciliationOutcome::AlreadyReconciled);
        }

        let call = self.builder.is_review_verified(&review_id)?;
        let output = self.rpc.call_contract(call.contract, call.calldata()).await?;
        if !decode_bool(&output)? {
            return Err(LedgerError::NotFound(format!(
                "review {} not verified on ledger after tx {}",
                review_id, tx_hash
            )));
        }

        let entity = EntityRef::new(pending.operation.entity_type(), pending.entity_id());
        let patch = EntityPatch::ReviewVerified {
            tx_hash: tx_hash.clone(),
        };
        self.entities.update_entity(&entity, &patch).await?;

        let current = self
            .store
            .get(&pending.id)
            .await?
            .unwrap_or_else(|| pending.clone());
        let block_number = current.block_number;
        let current = self.mark_confirmed(current, &tx_hash, block_number).await?;

        let record = ReconciliationRecord {
            entity_id: entity.id,
            entity_type: entity.entity_type,
            payload_hash: current.payload_hash,
            confirmed_at: Utc::now(),
            tx_hash,
            operation_kind: kind,
            block_number: current.block_number,
            pending_id: Some(current.id),
        };
        self.write_record(&record).await?;
        self.metrics.reconciled();
        info!("Reconciled review {} from receipt", review_id);
        Ok(ReconciliationOutcome::Reconciled(record))
    }

    async fn find_match(&self, event: &LedgerEvent) -> LedgerResult<Option<PendingTransaction>> {
        let kind = event.operation_kind();
        if let Some(pending) = self.store.find_by_tx_hash(&event.tx_hash).await? {
            if pending.kind() == kind {
                return Ok(Some(pending));
            }
        }

        for candidate in self.store.find_by_payload_hash(&event.payload_hash()).await? {
            if candidate.kind() != kind {
                continue;
            }
            // Never broadcast, so it cannot be what landed
            if candidate.broadcast_hashes().is_empty() {
                continue;
            }
            if self.store.get_record_by_pending(&candidate.id).await?.is_none() {
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }

    async fn mark_confirmed(
        &self,
        mut pending: PendingTransaction,
        tx_hash: &str,
        block_number: Option<u64>,
    ) -> LedgerResult<PendingTransaction> {
        loop {
            let previous = pending.status;
            let mut next = pending.clone();
            if previous != TxStatus::Confirmed {
                next.transition(TxStatus::Confirmed)?;
                next.terminal_error = None;
            }
            next.tx_hash = Some(tx_hash.to_string());
            if block_number.is_some() {
                next.block_number = block_number;
            }

            if self.store.save_if(&next, previous).await? {
                if previous != TxStatus::Confirmed {
                    let latency = (Utc::now() - next.created_at).to_std().unwrap_or_default();
                    self.metrics.confirmed(latency).await;
                    if previous == TxStatus::Orphaned || previous == TxStatus::Failed {
                        self.metrics.orphan_resolved();
                    }
                }
                return Ok(next);
            }

            // Its driver wrote a newer status; confirm on top of that
            debug!("Pending {} moved off {}, reloading", pending.id, previous);
            pending = self
                .store
                .get(&pending.id)
                .await?
                .ok_or_else(|| LedgerError::NotFound(pending.id.to_string()))?;
        }
    }

    async fn write_record(&self, record: &ReconciliationRecord) -> LedgerResult<()> {
        if !self.store.insert_record(record).await? {
            // Unreachable while the mutex is held by every writer
            return Err(LedgerError::Storage(format!(
                "record {} written concurrently",
                record.key()
            )));
        }
        // No subscribers is fine
        let _ = self.notify.send(record.clone());
        Ok(())
    }
}

/// Entity patch carried by an event
pub fn patch_for(event: &LedgerEvent) -> EntityPatch {
    let tx_hash = event.tx_hash.clone();
    match (&event.args, event.kind) {
        (EventArgs::Certificate { token_id, tourist, destination }, _) => {
            EntityPatch::CertificateMinted {
                token_id: Some(*token_id),
                tourist: tourist.clone(),
                destination: destination.clone(),
                tx_hash,
            }
        }
        (EventArgs::Points { amount, description, .. }, EventKind::PointsRedeemed) => {
            EntityPatch::PointsDebited {
                points: *amount,
                description: description.clone(),
                tx_hash,
            }
        }
        (EventArgs::Points { amount, description, .. }, _) => EntityPatch::PointsCredited {
            points: *amount,
            description: description.clone(),
            tx_hash,
        },
        (EventArgs::Booking { booking_hash, .. }, _) => EntityPatch::BookingVerified {
            booking_hash: Some(booking_hash.clone()),
            tx_hash,
        },
    }
}

/// Natural key of the entity an unmatched event refers to
fn orphan_entity(event: &LedgerEvent) -> EntityRef {
    match &event.args {
        EventArgs::Certificate { tourist, .. } => {
            EntityRef::new(EntityType::Certificate, normalize_address(tourist))
        }
        EventArgs::Points { user, .. } => EntityRef::new(EntityType::Loyalty, normalize_address(user)),
        EventArgs::Booking { booking_hash, .. } => {
            EntityRef::new(EntityType::Booking, booking_hash.to_lowercase())
        }
    }
}
