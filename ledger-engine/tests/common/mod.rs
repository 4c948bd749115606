//! Scripted in-process ledger shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use ethers::abi::{self, Token};
use ethers::types::{Address, U256};
use ethers::utils::keccak256;
use ledger_engine::{
    EngineConfig, EventArgs, EventKind, LedgerEngine, LedgerError, LedgerEvent, LedgerResult,
    LedgerRpc, LogEntry, LogQuery, MemoryEntityStore, MemoryStore, Operation, ReceiptInfo,
    TransactionStore,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

pub const USER: &str = "0x00000000000000000000000000000000000000aa";
pub const GWEI: u64 = 1_000_000_000;
pub const NETWORK_GAS_PRICE: u64 = 20 * GWEI;

pub const PROVIDER: &str = "0x00000000000000000000000000000000000000bb";

// Contracts of the development configuration
pub const CERTIFICATES: &str = "0x5fbdb2315678afecb367f032d93f642f64180aa3";
pub const LOYALTY: &str = "0xe7f1725e7734ce288f8367e1bb143e90bb3f0512";
pub const BOOKING: &str = "0x9fe46736679d2d9a65f0992f2272de9f3c7fa6e0";

/// Node answer to the next `eth_sendRawTransaction`
#[derive(Debug, Clone)]
pub enum Reply {
    Accept,
    Reject(&'static str),
    /// Another sender took the nonce; the chain nonce moves on
    NonceTooLow,
}

/// How accepted transactions resolve
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptMode {
    Success,
    Revert,
    /// No receipt until [`MockLedger::confirm`]
    Never,
}

struct State {
    chain_nonce: u64,
    head: u64,
    replies: VecDeque<Reply>,
    receipt_mode: ReceiptMode,
    receipts: HashMap<String, ReceiptInfo>,
    sent: Vec<String>,
    logs: Vec<LogEntry>,
    review_verified: bool,
}

pub struct MockLedger {
    state: Mutex<State>,
}

impl MockLedger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State {
                chain_nonce: 0,
                head: 0,
                replies: VecDeque::new(),
                receipt_mode: ReceiptMode::Success,
                receipts: HashMap::new(),
                sent: Vec::new(),
                logs: Vec::new(),
                review_verified: true,
            }),
        })
    }

    /// Queue replies; once drained every broadcast is accepted
    pub fn script(&self, replies: impl IntoIterator<Item = Reply>) {
        self.state.lock().unwrap().replies.extend(replies);
    }

    pub fn set_receipt_mode(&self, mode: ReceiptMode) {
        self.state.lock().unwrap().receipt_mode = mode;
    }

    pub fn set_chain_nonce(&self, nonce: u64) {
        self.state.lock().unwrap().chain_nonce = nonce;
    }

    pub fn set_review_verified(&self, verified: bool) {
        self.state.lock().unwrap().review_verified = verified;
    }

    /// Mine a successful receipt for an already accepted hash
    pub fn confirm(&self, tx_hash: &str) {
        let mut state = self.state.lock().unwrap();
        state.head += 1;
        let block = state.head;
        state
            .receipts
            .insert(tx_hash.to_string(), receipt(tx_hash, block, true));
    }

    /// Accepted transaction hashes, in broadcast order
    pub fn sent(&self) -> Vec<String> {
        self.state.lock().unwrap().sent.clone()
    }

    /// Emit `event` in a new block
    pub fn emit(&self, event: &LedgerEvent) {
        self.emit_all(std::slice::from_ref(event));
    }

    /// Emit `events` together in one new block, in order
    pub fn emit_all(&self, events: &[LedgerEvent]) {
        let mut state = self.state.lock().unwrap();
        state.head += 1;
        let block = state.head;
        for (index, event) in events.iter().enumerate() {
            let mut log = event.to_log_entry().unwrap();
            log.block_number = block;
            log.log_index = index as u64;
            state.logs.push(log);
        }
    }

    /// Mine `blocks` empty blocks
    pub fn advance(&self, blocks: u64) {
        self.state.lock().unwrap().head += blocks;
    }

    pub fn head(&self) -> u64 {
        self.state.lock().unwrap().head
    }
}

fn receipt(tx_hash: &str, block: u64, success: bool) -> ReceiptInfo {
    ReceiptInfo {
        tx_hash: tx_hash.to_string(),
        block_number: Some(block),
        success,
        gas_used: Some(60_000),
    }
}

#[async_trait]
impl LedgerRpc for MockLedger {
    async fn chain_id(&self) -> LedgerResult<u64> {
        Ok(31337)
    }

    async fn block_number(&self) -> LedgerResult<u64> {
        Ok(self.state.lock().unwrap().head)
    }

    async fn gas_price(&self) -> LedgerResult<u64> {
        Ok(NETWORK_GAS_PRICE)
    }

    async fn pending_nonce(&self, _address: Address) -> LedgerResult<u64> {
        Ok(self.state.lock().unwrap().chain_nonce)
    }

    async fn balance(&self, _address: Address) -> LedgerResult<U256> {
        Ok(U256::exp10(18) * 3)
    }

    async fn send_raw_transaction(&self, raw: Vec<u8>) -> LedgerResult<String> {
        let mut state = self.state.lock().unwrap();
        let reply = state.replies.pop_front().unwrap_or(Reply::Accept);
        let message = match reply {
            Reply::Accept => None,
            Reply::Reject(message) => Some(message.to_string()),
            Reply::NonceTooLow => {
                state.chain_nonce += 1;
                Some("nonce too low".to_string())
            }
        };
        if let Some(message) = message {
            return Err(LedgerError::RpcResponse {
                code: -32000,
                message,
            });
        }

        let tx_hash = format!("0x{}", hex::encode(keccak256(&raw)));
        state.chain_nonce += 1;
        state.sent.push(tx_hash.clone());
        match state.receipt_mode {
            ReceiptMode::Never => {}
            mode => {
                state.head += 1;
                let block = state.head;
                state.receipts.insert(
                    tx_hash.clone(),
                    receipt(&tx_hash, block, mode == ReceiptMode::Success),
                );
            }
        }
        Ok(tx_hash)
    }

    async fn transaction_receipt(&self, tx_hash: &str) -> LedgerResult<Option<ReceiptInfo>> {
        Ok(self.state.lock().unwrap().receipts.get(tx_hash).cloned())
    }

    async fn logs(&self, query: &LogQuery) -> LedgerResult<Vec<LogEntry>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .logs
            .iter()
            .filter(|log| {
                log.address == query.address
                    && log.topics.first() == Some(&query.topic0)
                    && log.block_number >= query.from_block
                    && log.block_number <= query.to_block
            })
            .cloned()
            .collect())
    }

    async fn call_contract(&self, _to: Address, _data: Vec<u8>) -> LedgerResult<Vec<u8>> {
        let verified = self.state.lock().unwrap().review_verified;
        Ok(abi::encode(&[Token::Bool(verified)]))
    }
}

pub struct Harness {
    pub engine: LedgerEngine,
    pub ledger: Arc<MockLedger>,
    pub entities: Arc<MemoryEntityStore>,
}

/// Engine over the mock ledger with the development configuration
pub fn harness() -> Harness {
    harness_with(
        EngineConfig::development(),
        MockLedger::new(),
        Arc::new(MemoryStore::new()),
    )
}

/// Engine over a given ledger and store, with its own entity store
pub fn harness_with(
    config: EngineConfig,
    ledger: Arc<MockLedger>,
    store: Arc<dyn TransactionStore>,
) -> Harness {
    let entities = Arc::new(MemoryEntityStore::new());
    let engine = LedgerEngine::with_rpc(config, ledger.clone(), store, entities.clone()).unwrap();
    Harness {
        engine,
        ledger,
        entities,
    }
}

pub fn earn(entity_id: &str, description: &str) -> Operation {
    Operation::EarnPoints {
        entity_id: entity_id.to_string(),
        user: USER.to_string(),
        booking_amount: 5_000,
        description: description.to_string(),
    }
}

pub fn redeem(entity_id: &str, points: u64) -> Operation {
    Operation::RedeemPoints {
        entity_id: entity_id.to_string(),
        user: USER.to_string(),
        points,
        description: "free night".to_string(),
    }
}

pub fn mint(entity_id: &str) -> Operation {
    Operation::MintCertificate {
        entity_id: entity_id.to_string(),
        tourist: USER.to_string(),
        destination: "Hampi".to_string(),
        tour_date: "2026-01-15".to_string(),
    }
}

pub fn verify_booking(entity_id: &str) -> Operation {
    Operation::VerifyBooking {
        entity_id: entity_id.to_string(),
        tourist: USER.to_string(),
        provider: PROVIDER.to_string(),
        destination: "Hampi".to_string(),
        amount: 12_000,
        booking_date: "2026-01-15".to_string(),
        ipfs_hash: "QmYwAPJzv5CZsnA625s3Xf2nemtYgPpHdWEz79ojWnPbdG".to_string(),
    }
}

fn event(kind: EventKind, contract: &str, args: EventArgs, tx_hash: &str) -> LedgerEvent {
    LedgerEvent {
        kind,
        contract: contract.to_string(),
        args,
        block_number: 0,
        tx_hash: tx_hash.to_string(),
        log_index: 0,
        observed_at: chrono::Utc::now(),
    }
}

pub fn certificate_issued(tx_hash: &str, token_id: u64) -> LedgerEvent {
    let args = EventArgs::Certificate {
        token_id,
        tourist: USER.to_string(),
        destination: "Hampi".to_string(),
    };
    event(EventKind::CertificateIssued, CERTIFICATES, args, tx_hash)
}

/// `BookingCreated` or `BookingVerified` for the booking of [`verify_booking`]
pub fn booking_event(kind: EventKind, tx_hash: &str, booking_hash: &str) -> LedgerEvent {
    let args = EventArgs::Booking {
        booking_hash: booking_hash.to_string(),
        tourist: USER.to_string(),
        provider: PROVIDER.to_string(),
    };
    event(kind, BOOKING, args, tx_hash)
}

pub fn points_earned(tx_hash: &str, amount: u64, description: &str) -> LedgerEvent {
    let args = EventArgs::Points {
        user: USER.to_string(),
        amount,
        description: description.to_string(),
    };
    event(EventKind::PointsEarned, LOYALTY, args, tx_hash)
}
