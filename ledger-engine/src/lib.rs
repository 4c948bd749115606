//! Ledger Engine - Transaction Orchestration & Reconciliation
//!
//! Submits tourism-booking operations (certificate minting, loyalty points,
//! booking and review verification) to an EVM ledger and reconciles the
//! resulting ledger events back into off-chain entity state.
//!
//! # Architecture
//!
//! - **GasPolicy**: bounded, network-responsive gas price and per-operation limits
//! - **NonceManager**: serialized nonce allocation for the signing account
//! - **OperationBuilder**: typed operation to contract call
//! - **TransactionSubmitter**: sign, broadcast, bounded receipt wait, outcome classification
//! - **RetryCoordinator**: per-request driver reacting to each classified outcome
//! - **EventMonitor**: supervised poll loop per `(contract, event kind)`
//! - **ReconciliationEngine**: idempotent application of confirmations
//!
//! ```text
//! submit ──→ RetryCoordinator ──→ TransactionSubmitter ──→ ledger
//!                                                            │
//! EntityStore ←── ReconciliationEngine ←── EventMonitor ←────┘
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ledger_engine::{EngineConfig, LedgerEngine, MemoryEntityStore, Operation};
//!
//! async fn example() {
//!     let config = EngineConfig::development();
//!     let engine = LedgerEngine::connect(config, Arc::new(MemoryEntityStore::new()))
//!         .await
//!         .unwrap();
//!     engine.start().await.unwrap();
//!
//!     let handle = engine
//!         .submit(Operation::EarnPoints {
//!             entity_id: "U1".to_string(),
//!             user: "0x00000000000000000000000000000000000000aa".to_string(),
//!             booking_amount: 5000,
//!             description: "booking B9".to_string(),
//!         })
//!         .await
//!         .unwrap();
//!     let outcome = handle.wait().await;
//!     println!("{:?}", outcome);
//!
//!     engine.stop().await;
//! }
//! ```

pub mod config;
pub mod entity;
pub mod error;
pub mod gas;
pub mod metrics;
pub mod monitor;
pub mod nonce;
pub mod reconcile;
pub mod retry;
pub mod rpc;
pub mod storage;
pub mod submitter;
pub mod telemetry;
pub mod tx_builder;
pub mod types;

pub use config::{
    ContractAddresses, EngineConfig, GasConfig, LedgerNetwork, MonitorConfig, RetryConfig,
    RpcConfig, SigningKey, StorageBackend, StorageConfig,
};
pub use entity::{Entity, EntityPatch, EntityRef, EntityStore, MemoryEntityStore};
pub use error::{LedgerError, LedgerResult, OperationError};
pub use gas::{GasCostEstimate, GasPolicy};
pub use metrics::{EngineMetrics, MetricsSnapshot};
pub use monitor::EventMonitor;
pub use nonce::NonceManager;
pub use reconcile::ReconciliationEngine;
pub use retry::{
    Confirmation, OperationOutcome, OrphanSweep, PendingTransactionHandle, RetryCoordinator,
    RetryPolicy,
};
pub use rpc::{EthRpcClient, LedgerRpc, LogQuery, ReceiptInfo};
pub use storage::{MemoryStore, Reservation, SledStore, StoreStats, TransactionStore};
pub use submitter::{SubmitResult, TransactionSubmitter, TxSigner};
pub use telemetry::{init_logging, LogConfig, LogFormat, LogLevel};
pub use tx_builder::{CallDescriptor, OperationBuilder};
pub use types::*;

use ethers::types::{Address, U256};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Ledger connection summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockchainStatus {
    pub connected: bool,
    pub network: LedgerNetwork,
    pub chain_id: u64,
    pub latest_block: Option<u64>,
    /// Quoted price in wei, premium and bounds applied
    pub gas_price: Option<u64>,
    pub signer_address: String,
    pub contracts: ContractAddresses,
}

/// Balance of the signing account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountBalance {
    pub address: String,
    /// Decimal wei
    pub balance_wei: String,
    pub balance_eth: String,
}

/// Ledger engine
///
/// Owns every component and the background tasks (event pollers, the
/// reconciliation consumer and the orphan sweep).
pub struct LedgerEngine {
    config: EngineConfig,
    chain_id: u64,
    signer_address: Address,
    rpc: Arc<dyn LedgerRpc>,
    store: Arc<dyn TransactionStore>,
    builder: Arc<OperationBuilder>,
    gas: Arc<GasPolicy>,
    coordinator: Arc<RetryCoordinator>,
    reconciler: Arc<ReconciliationEngine>,
    monitor: Arc<EventMonitor>,
    metrics: Arc<EngineMetrics>,
    shutdown: watch::Sender<bool>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl LedgerEngine {
    /// Connect to the configured node and open the configured store
    pub async fn connect(config: EngineConfig, entities: Arc<dyn EntityStore>) -> LedgerResult<Self> {
        config.validate()?;
        info!("Connecting to {} ledger at {}", config.network, config.rpc.url);

        let rpc: Arc<dyn LedgerRpc> = Arc::new(EthRpcClient::new(config.rpc.clone())?);
        let node_chain_id = rpc.chain_id().await.map_err(|e| {
            LedgerError::RpcConnection(format!("Failed to reach ledger node: {}", e))
        })?;
        let expected = config.effective_chain_id();
        if node_chain_id != expected {
            return Err(LedgerError::Configuration(format!(
                "node reports chain id {}, expected {}",
                node_chain_id, expected
            )));
        }

        let store = open_store(&config.storage)?;
        Self::with_rpc(config, rpc, store, entities)
    }

    /// Assemble the engine over an existing client and store
    pub fn with_rpc(
        config: EngineConfig,
        rpc: Arc<dyn LedgerRpc>,
        store: Arc<dyn TransactionStore>,
        entities: Arc<dyn EntityStore>,
    ) -> LedgerResult<Self> {
        config.validate()?;
        let key = config
            .private_key
            .as_ref()
            .ok_or_else(|| LedgerError::Configuration("signing key is not set".to_string()))?;
        let chain_id = config.effective_chain_id();
        let signer = TxSigner::new(key, chain_id)?;
        let signer_address = signer.address();

        let metrics = Arc::new(EngineMetrics::new());
        let builder = Arc::new(OperationBuilder::new(config.contracts.clone()));
        let gas = Arc::new(GasPolicy::new(rpc.clone(), config.gas.clone()));
        let nonces = Arc::new(NonceManager::new(rpc.clone(), signer_address));
        let submitter = Arc::new(TransactionSubmitter::new(
            rpc.clone(),
            signer,
            config.receipt_timeout(),
            config.receipt_poll_interval(),
        ));
        let reconciler = Arc::new(ReconciliationEngine::new(
            store.clone(),
            entities,
            rpc.clone(),
            builder.clone(),
            metrics.clone(),
        ));
        let coordinator = Arc::new(RetryCoordinator::new(
            store.clone(),
            rpc.clone(),
            builder.clone(),
            gas.clone(),
            nonces,
            submitter,
            reconciler.clone(),
            metrics.clone(),
            RetryPolicy::from_config(&config.retry),
        ));
        let monitor = Arc::new(EventMonitor::new(
            rpc.clone(),
            store.clone(),
            config.contracts.clone(),
            config.monitor.clone(),
            metrics.clone(),
        ));
        let (shutdown, _) = watch::channel(false);

        info!(
            "Ledger engine ready on chain {} as {}",
            chain_id,
            format_address(&signer_address)
        );

        Ok(Self {
            config,
            chain_id,
            signer_address,
            rpc,
            store,
            builder,
            gas,
            coordinator,
            reconciler,
            monitor,
            metrics,
            shutdown,
            background: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn signer_address(&self) -> Address {
        self.signer_address
    }

    // ==================== Lifecycle ====================

    /// Start event polling, the reconciliation consumer and the orphan sweep
    pub async fn start(&self) -> LedgerResult<()> {
        let mut background = self.background.lock().await;
        if !background.is_empty() {
            return Err(LedgerError::Configuration("engine already started".to_string()));
        }
        self.shutdown.send_replace(false);

        let (events_tx, events_rx) = mpsc::channel(self.config.monitor.channel_capacity);
        let pollers = self.monitor.start(events_tx).await?;

        let reconciler = self.reconciler.clone();
        background.push(tokio::spawn(async move { reconciler.run(events_rx).await }));

        let coordinator = self.coordinator.clone();
        let interval = self.config.monitor.orphan_recheck_interval();
        let mut shutdown = self.shutdown.subscribe();
        background.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.changed() => break,
                }
                match coordinator.recheck_orphans().await {
                    Ok(sweep) if sweep.checked > 0 => info!(
                        "Orphan sweep: {} checked, {} confirmed, {} reverted",
                        sweep.checked, sweep.confirmed, sweep.reverted
                    ),
                    Ok(_) => {}
                    Err(e) => warn!("Orphan sweep failed: {}", e),
                }
            }
        }));

        info!("Ledger engine started ({} pollers)", pollers);
        Ok(())
    }

    /// Stop background work. Pollers finish the emission in progress and the
    /// consumer drains what was already queued.
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);
        self.monitor.stop().await;
        let tasks: Vec<JoinHandle<()>> = self.background.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }
        info!("Ledger engine stopped");
    }

    // ==================== Operations ====================

    /// Submit an operation. Returns as soon as it is reserved; the handle
    /// resolves once the operation reaches a terminal outcome.
    pub async fn submit(&self, operation: Operation) -> LedgerResult<PendingTransactionHandle> {
        self.coordinator.execute(operation).await
    }

    pub async fn status_of(&self, id: &PendingId) -> LedgerResult<Option<PendingTransaction>> {
        self.store.get(id).await
    }

    /// Reconciled confirmations from now on
    pub fn subscribe(&self) -> broadcast::Receiver<ReconciliationRecord> {
        self.reconciler.subscribe()
    }

    /// Apply an event obtained outside the monitor
    pub async fn reconcile(&self, event: &LedgerEvent) -> LedgerResult<ReconciliationOutcome> {
        self.reconciler.reconcile(event).await
    }

    /// Requeue a transaction that exhausted its retries
    pub async fn retry_failed(&self, id: &PendingId) -> LedgerResult<PendingTransactionHandle> {
        self.coordinator.resume(id).await
    }

    /// Give up on an orphaned transaction
    pub async fn close_orphan(&self, id: &PendingId) -> LedgerResult<PendingTransaction> {
        self.coordinator.close_orphan(id).await
    }

    pub async fn recheck_orphans(&self) -> LedgerResult<OrphanSweep> {
        self.coordinator.recheck_orphans().await
    }

    // ==================== Queries ====================

    pub async fn network_info(&self) -> BlockchainStatus {
        let latest_block = match self.rpc.block_number().await {
            Ok(block) => Some(block),
            Err(e) => {
                warn!("Ledger node unreachable: {}", e);
                None
            }
        };
        let gas_price = match latest_block {
            Some(_) => self.gas.price().await.ok(),
            None => None,
        };
        BlockchainStatus {
            connected: latest_block.is_some(),
            network: self.config.network,
            chain_id: self.chain_id,
            latest_block,
            gas_price,
            signer_address: format_address(&self.signer_address),
            contracts: self.config.contracts.clone(),
        }
    }

    pub async fn estimate_cost(&self, kind: OperationKind) -> LedgerResult<GasCostEstimate> {
        self.gas.estimate_cost(kind).await
    }

    pub async fn account_balance(&self) -> LedgerResult<AccountBalance> {
        let wei = self.rpc.balance(self.signer_address).await?;
        let capped = wei.min(U256::from(u128::MAX)).as_u128();
        Ok(AccountBalance {
            address: format_address(&self.signer_address),
            balance_wei: wei.to_string(),
            balance_eth: format_ether(capped),
        })
    }

    /// Read `isReviewVerified` from the reviews contract
    pub async fn is_review_verified(&self, review_id: &str) -> LedgerResult<bool> {
        let call = self.builder.is_review_verified(review_id)?;
        let output = self.rpc.call_contract(call.contract, call.calldata()).await?;
        tx_builder::decode_bool(&output)
    }

    pub fn validate_address(address: &str) -> bool {
        validate_address(address)
    }

    pub async fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot().await
    }

    pub async fn store_stats(&self) -> LedgerResult<StoreStats> {
        self.store.stats().await
    }
}

fn open_store(config: &StorageConfig) -> LedgerResult<Arc<dyn TransactionStore>> {
    match config.backend {
        StorageBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        StorageBackend::Sled => Ok(Arc::new(SledStore::new(config)?)),
    }
}
