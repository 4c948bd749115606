//! Retry Coordinator
//!
//! Drives one operation from request to a terminal outcome. Each request
//! runs in its own task; the caller gets a [`PendingTransactionHandle`] back
//! immediately.
//!
//! Each attempt is a broadcast followed by a bounded receipt wait. The
//! accepted hash is stored between the two, so a crash or a cancel during
//! the wait leaves a row the reconciler can still match.
//!
//! Reaction to each [`SubmitResult`]:
//!
//! | Outcome                         | Nonce             | Next step                        |
//! |---------------------------------|-------------------|----------------------------------|
//! | `Confirmed`                     | consumed          | `Confirmed`                      |
//! | `Reverted`                      | consumed          | `Failed` (`Reverted`)            |
//! | `Fatal`                         | returned          | `Failed`                         |
//! | `Recoverable(NonceConflict)`    | returned, resync  | backoff, retry                   |
//! | `Recoverable(Underpriced)`      | returned          | escalate gas, backoff, retry     |
//! | `Recoverable(Transient)`        | returned          | backoff, retry                   |
//! | `ConfirmationTimeout`           | consumed          | `Orphaned`, never retried        |
//!
//! Recoverable failures on the last attempt end in `MaxRetriesExceeded`.
//! Every status write is conditional on the status this driver last wrote;
//! when the reconciler confirmed the row first, the driver adopts that.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::RetryConfig;
use crate::error::{LedgerError, LedgerResult, OperationError};
use crate::gas::GasPolicy;
use crate::metrics::EngineMetrics;
use crate::nonce::NonceManager;
use crate::reconcile::ReconciliationEngine;
use crate::rpc::LedgerRpc;
use crate::storage::{Reservation, TransactionStore};
use crate::submitter::{BroadcastError, RecoverableReason, SubmitResult, TransactionSubmitter};
use crate::tx_builder::{CallDescriptor, OperationBuilder};
use crate::types::{
    AttemptOutcome, AttemptRecord, Operation, PendingId, PendingTransaction, TxStatus,
};

/// Backoff schedule
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Last attempt index
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub max_requeues: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            max_requeues: config.max_requeues,
        }
    }

    /// Sleep after failed attempt `attempt`: `initial * 2^attempt`, capped
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

/// Successful terminal outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Confirmation {
    pub pending_id: PendingId,
    pub tx_hash: String,
    pub block_number: Option<u64>,
}

/// What a caller eventually observes
pub type OperationOutcome = Result<Confirmation, OperationError>;

/// Handle to a submitted operation
#[derive(Clone)]
pub struct PendingTransactionHandle {
    id: PendingId,
    result: watch::Receiver<Option<OperationOutcome>>,
    cancel: Arc<watch::Sender<bool>>,
}

impl PendingTransactionHandle {
    pub fn id(&self) -> PendingId {
        self.id
    }

    /// Terminal outcome, if already known
    pub fn try_result(&self) -> Option<OperationOutcome> {
        self.result.borrow().clone()
    }

    /// Wait for the terminal outcome
    pub async fn wait(&self) -> OperationOutcome {
        let mut result = self.result.clone();
        loop {
            if let Some(outcome) = result.borrow_and_update().clone() {
                return outcome;
            }
            if result.changed().await.is_err() {
                // Driver task gone without reporting
                return result
                    .borrow()
                    .clone()
                    .unwrap_or(Err(OperationError::Cancelled { tx_hash: None }));
            }
        }
    }

    /// Ask the driver to stop. Before broadcast the operation fails with
    /// `Cancelled`; after broadcast it is left `Orphaned`.
    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }
}

impl std::fmt::Debug for PendingTransactionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingTransactionHandle")
            .field("id", &self.id)
            .field("done", &self.result.borrow().is_some())
            .finish()
    }
}

/// Result of one orphan sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrphanSweep {
    pub checked: u64,
    pub confirmed: u64,
    pub reverted: u64,
}

/// Per-request driver
pub struct RetryCoordinator {
    store: Arc<dyn TransactionStore>,
    rpc: Arc<dyn LedgerRpc>,
    builder: Arc<OperationBuilder>,
    gas: Arc<GasPolicy>,
    nonces: Arc<NonceManager>,
    submitter: Arc<TransactionSubmitter>,
    reconciler: Arc<ReconciliationEngine>,
    metrics: Arc<EngineMetrics>,
    policy: RetryPolicy,
}

impl RetryCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn TransactionStore>,
        rpc: Arc<dyn LedgerRpc>,
        builder: Arc<OperationBuilder>,
        gas: Arc<GasPolicy>,
        nonces: Arc<NonceManager>,
        submitter: Arc<TransactionSubmitter>,
        reconciler: Arc<ReconciliationEngine>,
        metrics: Arc<EngineMetrics>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            rpc,
            builder,
            gas,
            nonces,
            submitter,
            reconciler,
            metrics,
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Validate, reserve and start driving `operation`.
    ///
    /// Builder failures and single-flight conflicts are returned here and
    /// create no pending transaction.
    pub async fn execute(self: &Arc<Self>, operation: Operation) -> LedgerResult<PendingTransactionHandle> {
        let descriptor = self.builder.build(&operation)?;
        let pending = PendingTransaction::new(operation);
        self.reserve(&pending).await?;
        self.metrics.submitted();
        info!(
            "Accepted {} for {} as pending {}",
            pending.kind(),
            pending.entity_id(),
            pending.id
        );
        Ok(self.spawn(pending, descriptor))
    }

    /// Requeue a transaction that failed by exhausting its retries
    pub async fn resume(self: &Arc<Self>, id: &PendingId) -> LedgerResult<PendingTransactionHandle> {
        let mut pending = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(id.to_string()))?;

        if !pending.is_exhausted() {
            return Err(LedgerError::StateTransition(format!(
                "pending {} is {} and not retryable",
                id, pending.status
            )));
        }
        if pending.requeue_count >= self.policy.max_requeues {
            return Err(LedgerError::StateTransition(format!(
                "pending {} already requeued {} times",
                id, pending.requeue_count
            )));
        }

        let descriptor = self.builder.build(&pending.operation)?;
        pending.transition(TxStatus::Queued)?;
        pending.requeue_count += 1;
        pending.terminal_error = None;
        self.reserve(&pending).await?;
        info!("Requeued pending {} ({} of {})", id, pending.requeue_count, self.policy.max_requeues);
        Ok(self.spawn(pending, descriptor))
    }

    /// Operator action: give up on an orphaned transaction
    pub async fn close_orphan(&self, id: &PendingId) -> LedgerResult<PendingTransaction> {
        let mut pending = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(id.to_string()))?;
        if pending.status != TxStatus::Orphaned {
            return Err(LedgerError::StateTransition(format!(
                "pending {} is {}, not orphaned",
                id, pending.status
            )));
        }
        pending.transition(TxStatus::Failed)?;
        pending.last_error = Some("closed by operator".to_string());
        if !self.store.save_if(&pending, TxStatus::Orphaned).await? {
            return Err(LedgerError::StateTransition(format!(
                "pending {} changed while closing",
                id
            )));
        }
        self.metrics.failed();
        warn!("Closed orphaned pending {}", id);
        Ok(pending)
    }

    /// Re-read receipts of every orphaned transaction
    pub async fn recheck_orphans(&self) -> LedgerResult<OrphanSweep> {
        let mut sweep = OrphanSweep::default();
        for mut pending in self.store.list_by_status(TxStatus::Orphaned).await? {
            sweep.checked += 1;
            for hash in pending.broadcast_hashes() {
                let receipt = match self.rpc.transaction_receipt(&hash).await {
                    Ok(Some(receipt)) if receipt.block_number.is_some() => receipt,
                    Ok(_) => continue,
                    Err(e) => {
                        debug!("Receipt re-check for {} failed: {}", hash, e);
                        continue;
                    }
                };

                pending.tx_hash = Some(hash.clone());
                pending.block_number = receipt.block_number;
                if receipt.success {
                    pending.transition(TxStatus::Confirmed)?;
                    pending.terminal_error = None;
                    if !self.store.save_if(&pending, TxStatus::Orphaned).await? {
                        debug!("Orphaned pending {} settled elsewhere", pending.id);
                        break;
                    }
                    self.record_confirmed(&pending).await;
                    self.metrics.orphan_resolved();
                    sweep.confirmed += 1;
                    info!("Orphaned pending {} confirmed in tx {}", pending.id, hash);
                    self.after_confirmation(&pending).await;
                } else {
                    pending.transition(TxStatus::Failed)?;
                    pending.terminal_error = Some(OperationError::Reverted { tx_hash: hash.clone() });
                    if !self.store.save_if(&pending, TxStatus::Orphaned).await? {
                        debug!("Orphaned pending {} settled elsewhere", pending.id);
                        break;
                    }
                    self.metrics.reverted();
                    sweep.reverted += 1;
                    warn!("Orphaned pending {} reverted in tx {}", pending.id, hash);
                }
                break;
            }
        }
        Ok(sweep)
    }

    async fn reserve(&self, pending: &PendingTransaction) -> LedgerResult<()> {
        match self.store.reserve(pending).await? {
            Reservation::Reserved => Ok(()),
            Reservation::InFlight(holder) => {
                self.metrics.rejected_in_flight();
                warn!(
                    "Rejected {} for {}: pending {} still open",
                    pending.kind(),
                    pending.entity_id(),
                    holder
                );
                Err(OperationError::OperationAlreadyInFlight {
                    entity_id: pending.entity_id().to_string(),
                    kind: pending.kind().to_string(),
                }
                .into())
            }
        }
    }

    fn spawn(self: &Arc<Self>, pending: PendingTransaction, descriptor: CallDescriptor) -> PendingTransactionHandle {
        let (result_tx, result_rx) = watch::channel(None);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let id = pending.id;
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = this.drive(pending, descriptor, cancel_rx).await;
            let _ = result_tx.send(Some(outcome));
        });
        PendingTransactionHandle {
            id,
            result: result_rx,
            cancel: Arc::new(cancel_tx),
        }
    }

    async fn drive(
        &self,
        mut pending: PendingTransaction,
        descriptor: CallDescriptor,
        mut cancel: watch::Receiver<bool>,
    ) -> OperationOutcome {
        let gas_limit = self.gas.limit(pending.kind());
        pending.gas_limit = Some(gas_limit);
        let mut underpriced = 0u32;
        let mut attempt = 0u32;

        loop {
            if *cancel.borrow() {
                return self.cancel_unbroadcast(pending).await;
            }
            if self.adopt_reconciled(&mut pending).await {
                self.commit(&pending, TxStatus::Confirmed).await;
                return Ok(confirmation(&pending));
            }
            pending.attempt = attempt;
            self.metrics.attempt();

            let result = match self.attempt(&mut pending, &descriptor, gas_limit, underpriced).await {
                Ok(tx_hash) => {
                    let settled = tokio::select! {
                        result = self.submitter.settle(tx_hash.clone()) => Some(result),
                        _ = cancelled(&mut cancel) => None,
                    };
                    if self.adopt_reconciled(&mut pending).await {
                        pending.record_attempt(
                            attempt_record(&pending, AttemptOutcome::Confirmed).with_tx_hash(tx_hash),
                        );
                        self.commit(&pending, TxStatus::Confirmed).await;
                        return Ok(confirmation(&pending));
                    }
                    match settled {
                        Some(result) => result,
                        None => return self.cancel_broadcast(pending, tx_hash).await,
                    }
                }
                Err(e) => SubmitResult::from(e),
            };

            let reason = match result {
                SubmitResult::Recoverable(reason) => reason,
                SubmitResult::Confirmed { tx_hash, block_number } => {
                    return self.confirmed(pending, tx_hash, block_number).await
                }
                SubmitResult::Reverted { tx_hash } => {
                    pending.record_attempt(
                        attempt_record(&pending, AttemptOutcome::Reverted)
                            .with_tx_hash(tx_hash.clone())
                            .with_error("reverted"),
                    );
                    self.metrics.reverted();
                    warn!("Pending {} reverted in tx {}", pending.id, tx_hash);
                    return self.fail(pending, OperationError::Reverted { tx_hash }).await;
                }
                SubmitResult::ConfirmationTimeout { tx_hash } => {
                    pending.record_attempt(
                        attempt_record(&pending, AttemptOutcome::Timeout)
                            .with_tx_hash(tx_hash.clone())
                            .with_error("no receipt in time"),
                    );
                    let error = OperationError::ConfirmationTimeout { tx_hash };
                    warn!("Pending {} orphaned: {}", pending.id, error);
                    return self.orphan(pending, error).await;
                }
                SubmitResult::Fatal(reason) => {
                    let error: OperationError = reason.into();
                    pending.record_attempt(
                        AttemptRecord::new(attempt, AttemptOutcome::Fatal).with_error(error.to_string()),
                    );
                    self.metrics.failed();
                    error!("Pending {} failed: {}", pending.id, error);
                    return self.fail(pending, error).await;
                }
            };

            let outcome = match reason {
                RecoverableReason::NonceConflict => AttemptOutcome::NonceConflict,
                RecoverableReason::Underpriced => AttemptOutcome::Underpriced,
                RecoverableReason::Transient(_) => AttemptOutcome::Transient,
            };
            pending.record_attempt(attempt_record(&pending, outcome).with_error(reason.describe()));

            match reason {
                RecoverableReason::NonceConflict => {
                    self.metrics.nonce_resync();
                    if let Err(e) = self.nonces.resync().await {
                        warn!("Nonce resync failed: {}", e);
                    }
                }
                RecoverableReason::Underpriced => underpriced += 1,
                RecoverableReason::Transient(_) => {}
            }

            if attempt >= self.policy.max_retries {
                let error = OperationError::MaxRetriesExceeded {
                    attempts: attempt + 1,
                    last_error: reason.describe(),
                };
                self.metrics.failed();
                error!("Pending {} exhausted its retries: {}", pending.id, error);
                return self.fail(pending, error).await;
            }

            let delay = self.policy.delay_for_attempt(attempt);
            debug!(
                "Attempt {} of pending {} failed ({}), retrying in {:?}",
                attempt,
                pending.id,
                reason.describe(),
                delay
            );
            self.commit(&pending, pending.status).await;
            self.metrics.retry();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancelled(&mut cancel) => return self.cancel_unbroadcast(pending).await,
            }
            attempt += 1;
        }
    }

    /// One broadcast. On success the nonce is consumed and the status is
    /// `Submitted`.
    async fn attempt(
        &self,
        pending: &mut PendingTransaction,
        descriptor: &CallDescriptor,
        gas_limit: u64,
        underpriced: u32,
    ) -> Result<String, BroadcastError> {
        let nonce = self
            .nonces
            .allocate()
            .await
            .map_err(|e| BroadcastError::Recoverable(RecoverableReason::Transient(e.to_string())))?;
        let base = match self.gas.price().await {
            Ok(price) => price,
            Err(e) => {
                self.nonces.release(nonce, false).await;
                return Err(BroadcastError::Recoverable(RecoverableReason::Transient(e.to_string())));
            }
        };
        let gas_price = self.gas.escalated(base, underpriced);
        if underpriced > 0 {
            self.metrics.gas_escalation();
            debug!("Escalated gas {} -> {} after {} rejections", base, gas_price, underpriced);
        }
        pending.nonce = Some(nonce);
        pending.gas_price = Some(gas_price);

        match self.submitter.broadcast(descriptor, nonce, gas_price, gas_limit).await {
            Ok(tx_hash) => {
                self.nonces.release(nonce, true).await;
                pending.tx_hash = Some(tx_hash.clone());
                let expected = pending.status;
                if expected == TxStatus::Queued {
                    if let Err(e) = pending.transition(TxStatus::Submitted) {
                        warn!("{}", e);
                    }
                }
                self.commit(pending, expected).await;
                info!(
                    "Pending {} broadcast as {} (nonce {}, gas price {})",
                    pending.id, tx_hash, nonce, gas_price
                );
                Ok(tx_hash)
            }
            Err(e) => {
                self.nonces.release(nonce, false).await;
                Err(e)
            }
        }
    }

    async fn confirmed(
        &self,
        mut pending: PendingTransaction,
        tx_hash: String,
        block_number: Option<u64>,
    ) -> OperationOutcome {
        pending.record_attempt(attempt_record(&pending, AttemptOutcome::Confirmed).with_tx_hash(tx_hash));
        pending.block_number = block_number;
        let expected = pending.status;
        if let Err(e) = pending.transition(TxStatus::Confirmed) {
            warn!("{}", e);
        }
        if !matches!(self.write_transition(&mut pending, expected).await, WriteOutcome::Written) {
            return Ok(confirmation(&pending));
        }
        self.record_confirmed(&pending).await;
        info!("Pending {} confirmed in block {:?}", pending.id, block_number);
        self.after_confirmation(&pending).await;
        Ok(confirmation(&pending))
    }

    /// Cancelled while waiting for the receipt; it may still land
    async fn cancel_broadcast(&self, mut pending: PendingTransaction, tx_hash: String) -> OperationOutcome {
        pending.record_attempt(
            attempt_record(&pending, AttemptOutcome::Cancelled)
                .with_tx_hash(tx_hash.clone())
                .with_error("cancelled"),
        );
        self.metrics.cancelled();
        warn!("Pending {} cancelled after broadcast, left orphaned", pending.id);
        let error = OperationError::Cancelled {
            tx_hash: Some(tx_hash),
        };
        self.orphan(pending, error).await
    }

    async fn cancel_unbroadcast(&self, mut pending: PendingTransaction) -> OperationOutcome {
        pending.record_attempt(
            AttemptRecord::new(pending.attempt, AttemptOutcome::Cancelled).with_error("cancelled"),
        );
        self.metrics.cancelled();
        info!("Pending {} cancelled before broadcast", pending.id);
        self.fail(pending, OperationError::Cancelled { tx_hash: None }).await
    }

    async fn fail(&self, mut pending: PendingTransaction, error: OperationError) -> OperationOutcome {
        let expected = pending.status;
        if let Err(e) = pending.transition(TxStatus::Failed) {
            warn!("{}", e);
        }
        pending.last_error = Some(error.to_string());
        pending.terminal_error = Some(error.clone());
        if let WriteOutcome::Adopted = self.write_transition(&mut pending, expected).await {
            return Ok(confirmation(&pending));
        }
        Err(error)
    }

    async fn orphan(&self, mut pending: PendingTransaction, error: OperationError) -> OperationOutcome {
        let expected = pending.status;
        if let Err(e) = pending.transition(TxStatus::Orphaned) {
            warn!("{}", e);
        }
        pending.terminal_error = Some(error.clone());
        if let WriteOutcome::Adopted = self.write_transition(&mut pending, expected).await {
            return Ok(confirmation(&pending));
        }
        self.metrics.orphaned();
        Err(error)
    }

    /// Write a status change made from `expected`. If the stored row moved
    /// on because the reconciler confirmed it, take that confirmation.
    async fn write_transition(&self, pending: &mut PendingTransaction, expected: TxStatus) -> WriteOutcome {
        if self.commit(pending, expected).await {
            return WriteOutcome::Written;
        }
        if self.adopt_reconciled(pending).await {
            self.commit(pending, TxStatus::Confirmed).await;
            return WriteOutcome::Adopted;
        }
        warn!(
            "Pending {} is no longer {} in the store, keeping the stored row",
            pending.id, expected
        );
        WriteOutcome::Stale
    }

    /// Conditional write. A store error is logged and counts as written.
    async fn commit(&self, pending: &PendingTransaction, expected: TxStatus) -> bool {
        match self.store.save_if(pending, expected).await {
            Ok(written) => written,
            Err(e) => {
                error!("Failed to persist pending {}: {}", pending.id, e);
                true
            }
        }
    }

    /// Take over a confirmation the reconciler already stored
    async fn adopt_reconciled(&self, pending: &mut PendingTransaction) -> bool {
        match self.store.get(&pending.id).await {
            Ok(Some(stored)) if stored.status == TxStatus::Confirmed => {
                let log = std::mem::take(&mut pending.attempt_log);
                *pending = stored;
                pending.attempt_log = log;
                debug!("Pending {} was confirmed by reconciliation", pending.id);
                true
            }
            Ok(_) => false,
            Err(e) => {
                warn!("Failed to reload pending {}: {}", pending.id, e);
                false
            }
        }
    }

    async fn record_confirmed(&self, pending: &PendingTransaction) {
        let latency = (Utc::now() - pending.created_at).to_std().unwrap_or_default();
        self.metrics.confirmed(latency).await;
    }

    /// Operations without a confirming event reconcile from the receipt
    async fn after_confirmation(&self, pending: &PendingTransaction) {
        if pending.kind().has_confirming_event() {
            return;
        }
        if let Err(e) = self.reconciler.reconcile_receipt(pending).await {
            warn!("Receipt reconciliation for pending {} failed: {}", pending.id, e);
        }
    }
}

enum WriteOutcome {
    Written,
    /// The reconciler confirmed the row first
    Adopted,
    Stale,
}

/// Log entry for the current attempt, with its nonce and price if allocated
fn attempt_record(pending: &PendingTransaction, outcome: AttemptOutcome) -> AttemptRecord {
    let record = AttemptRecord::new(pending.attempt, outcome);
    match (pending.nonce, pending.gas_price) {
        (Some(nonce), Some(price)) => record.with_nonce(nonce, price),
        _ => record,
    }
}

fn confirmation(pending: &PendingTransaction) -> Confirmation {
    Confirmation {
        pending_id: pending.id,
        tx_hash: pending.tx_hash.clone().unwrap_or_default(),
        block_number: pending.block_number,
    }
}

/// Resolves once cancellation is requested; never if the handle is dropped
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
