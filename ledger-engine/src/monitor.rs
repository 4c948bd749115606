//! Event Monitor
//!
//! One poll loop per `(contract, event kind)`. Each loop keeps its own
//! watermark, so every log is emitted once per poller lifetime no matter how
//! the other loops fare. A supervisor restarts a loop that panics; the
//! watermark lives outside the loop and survives the restart.
//!
//! Watermarks are also written to the transaction store after every scanned
//! chunk, under `"<role>:<EventKind>"`. A fresh poller starts from, in order:
//!
//! 1. its persisted watermark
//! 2. `start_block` from the configuration
//! 3. the earliest block of a landed transaction that still has no record
//! 4. the current head

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{ContractAddresses, MonitorConfig};
use crate::error::{LedgerError, LedgerResult};
use crate::metrics::EngineMetrics;
use crate::rpc::{LedgerRpc, LogQuery};
use crate::storage::TransactionStore;
use crate::types::{format_address, parse_address, ContractRole, EventKind, LedgerEvent};

/// Watermark not yet initialized
const UNSET: u64 = u64::MAX;

type PollerKey = (ContractRole, EventKind);

/// State shared by one poll loop and its supervisor
struct Poller {
    rpc: Arc<dyn LedgerRpc>,
    store: Arc<dyn TransactionStore>,
    /// Persisted watermark key
    name: String,
    contract: ethers::types::Address,
    kind: EventKind,
    config: MonitorConfig,
    metrics: Arc<EngineMetrics>,
    /// Next block to scan
    next_block: Arc<AtomicU64>,
}

impl Poller {
    /// Scan `[next_block, head]` and emit what was found
    async fn poll_once(&self, events: &mpsc::Sender<LedgerEvent>) -> LedgerResult<usize> {
        let head = self.rpc.block_number().await?;
        let mut from = match self.next_block.load(Ordering::SeqCst) {
            UNSET => {
                let start = self.first_block(head).await?;
                info!("Poller {} starting at block {}", self.name, start);
                self.next_block.store(start, Ordering::SeqCst);
                start
            }
            next => next,
        };

        let range = self.config.max_block_range.max(1);
        let mut emitted = 0;
        while from <= head {
            let to = head.min(from.saturating_add(range - 1));
            let query = LogQuery {
                address: self.contract,
                topic0: self.kind.topic0(),
                from_block: from,
                to_block: to,
            };
            let mut logs = self.rpc.logs(&query).await?;
            logs.sort_by_key(|log| (log.block_number, log.log_index));

            for log in &logs {
                let event = match LedgerEvent::decode(self.kind, log) {
                    Ok(event) => event,
                    Err(e) => {
                        warn!("Skipping undecodable {} log: {}", self.kind, e);
                        continue;
                    }
                };
                debug!(
                    "Observed {} at block {} (tx {})",
                    event.kind, event.block_number, event.tx_hash
                );
                events
                    .send(event)
                    .await
                    .map_err(|_| LedgerError::Network("event channel closed".to_string()))?;
                self.metrics.event_observed();
                emitted += 1;
            }

            self.next_block.store(to + 1, Ordering::SeqCst);
            if let Err(e) = self.store.set_watermark(&self.name, to + 1).await {
                warn!("Failed to persist watermark of {}: {}", self.name, e);
            }
            from = to + 1;
        }
        Ok(emitted)
    }

    async fn first_block(&self, head: u64) -> LedgerResult<u64> {
        if let Some(next) = self.store.watermark(&self.name).await? {
            return Ok(next);
        }
        if let Some(start) = self.config.start_block {
            return Ok(start);
        }
        // Landed while nothing was watching
        let earliest = self.store.earliest_unreconciled_block().await?;
        Ok(earliest.map_or(head, |block| block.min(head)))
    }

    async fn run(&self, events: mpsc::Sender<LedgerEvent>, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            let delay = match self.poll_once(&events).await {
                Ok(_) => self.config.poll_interval(),
                Err(e) => {
                    self.metrics.poll_error();
                    warn!(
                        "Poll of {} on {} failed: {}",
                        self.kind,
                        format_address(&self.contract),
                        e
                    );
                    self.config.error_backoff()
                }
            };
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        debug!("Poller for {} stopped", self.kind);
    }
}

/// Restart the loop until it returns normally
async fn supervise(
    poller: Arc<Poller>,
    events: mpsc::Sender<LedgerEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let task = {
            let poller = poller.clone();
            let events = events.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { poller.run(events, shutdown).await })
        };
        match task.await {
            Ok(()) => break,
            Err(e) if e.is_panic() => {
                poller.metrics.poller_restarted();
                error!(
                    "Poller for {} on {} panicked, restarting",
                    poller.kind,
                    format_address(&poller.contract)
                );
                if *shutdown.borrow() {
                    break;
                }
                tokio::select! {
                    _ = tokio::time::sleep(poller.config.error_backoff()) => {}
                    _ = shutdown.changed() => break,
                }
            }
            Err(_) => break,
        }
    }
}

/// Ledger event monitor
pub struct EventMonitor {
    rpc: Arc<dyn LedgerRpc>,
    store: Arc<dyn TransactionStore>,
    contracts: ContractAddresses,
    config: MonitorConfig,
    metrics: Arc<EngineMetrics>,
    watermarks: std::sync::Mutex<HashMap<PollerKey, Arc<AtomicU64>>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl EventMonitor {
    pub fn new(
        rpc: Arc<dyn LedgerRpc>,
        store: Arc<dyn TransactionStore>,
        contracts: ContractAddresses,
        config: MonitorConfig,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            rpc,
            store,
            contracts,
            config,
            metrics,
            watermarks: std::sync::Mutex::new(HashMap::new()),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Spawn one supervised loop per configured contract and event kind.
    /// Returns how many loops run. Nothing is spawned unless every
    /// configured address parses.
    pub async fn start(&self, events: mpsc::Sender<LedgerEvent>) -> LedgerResult<usize> {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            return Err(LedgerError::Configuration("event monitor already running".to_string()));
        }

        let mut watched = Vec::new();
        for role in ContractRole::ALL {
            let kinds = EventKind::for_contract(role);
            if kinds.is_empty() {
                continue;
            }
            match self.contracts.get(role) {
                Some(address) => {
                    let contract = parse_address(address).ok_or_else(|| {
                        LedgerError::Configuration(format!("invalid {} address {}", role, address))
                    })?;
                    watched.push((role, contract, kinds));
                }
                None => debug!("No {} contract configured, not polling it", role),
            }
        }

        self.shutdown.send_replace(false);
        for (role, contract, kinds) in watched {
            for kind in kinds {
                let poller = Arc::new(Poller {
                    rpc: self.rpc.clone(),
                    store: self.store.clone(),
                    name: format!("{}:{}", role, kind),
                    contract,
                    kind: *kind,
                    config: self.config.clone(),
                    metrics: self.metrics.clone(),
                    next_block: self.watermark_cell(role, *kind),
                });
                tasks.push(tokio::spawn(supervise(
                    poller,
                    events.clone(),
                    self.shutdown.subscribe(),
                )));
            }
        }

        info!("Event monitor started with {} pollers", tasks.len());
        Ok(tasks.len())
    }

    /// Signal every loop and wait for them to finish
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Poller supervisor ended abnormally: {}", e);
            }
        }
        info!("Event monitor stopped");
    }

    pub async fn is_running(&self) -> bool {
        !self.tasks.lock().await.is_empty()
    }

    /// Highest block fully scanned for `(role, kind)`
    pub fn watermark(&self, role: ContractRole, kind: EventKind) -> Option<u64> {
        let cells = self.watermarks.lock().ok()?;
        match cells.get(&(role, kind))?.load(Ordering::SeqCst) {
            UNSET | 0 => None,
            next => Some(next - 1),
        }
    }

    fn watermark_cell(&self, role: ContractRole, kind: EventKind) -> Arc<AtomicU64> {
        match self.watermarks.lock() {
            Ok(mut cells) => cells
                .entry((role, kind))
                .or_insert_with(|| Arc::new(AtomicU64::new(UNSET)))
                .clone(),
            Err(poisoned) => poisoned
                .into_inner()
                .entry((role, kind))
                .or_insert_with(|| Arc::new(AtomicU64::new(UNSET)))
                .clone(),
        }
    }
}
