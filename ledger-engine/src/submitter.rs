//! Transaction Submitter
//!
//! Signs and broadcasts one attempt, then waits a bounded time for its
//! receipt. Node rejection text is classified here, once, into a closed set
//! of reasons; nothing above this module looks at raw error strings.

use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, TransactionRequest, U256};
use ethers::utils::keccak256;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::SigningKey;
use crate::error::{LedgerError, LedgerResult, OperationError};
use crate::rpc::LedgerRpc;
use crate::tx_builder::CallDescriptor;
use crate::types::{format_address, normalize_tx_hash};

/// Recoverable broadcast failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoverableReason {
    /// Nonce too low / too high / already used
    NonceConflict,
    /// Price below what the node accepts
    Underpriced,
    /// Network or node hiccup
    Transient(String),
}

impl RecoverableReason {
    pub fn describe(&self) -> String {
        match self {
            RecoverableReason::NonceConflict => "nonce conflict".to_string(),
            RecoverableReason::Underpriced => "transaction underpriced".to_string(),
            RecoverableReason::Transient(message) => format!("transient: {}", message),
        }
    }
}

/// Fatal broadcast failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FatalReason {
    InsufficientFunds,
    InvalidAddress(String),
    UnsupportedOperation(String),
}

impl From<FatalReason> for OperationError {
    fn from(reason: FatalReason) -> Self {
        match reason {
            FatalReason::InsufficientFunds => OperationError::InsufficientFunds,
            FatalReason::InvalidAddress(a) => OperationError::InvalidAddress(a),
            FatalReason::UnsupportedOperation(r) => OperationError::UnsupportedOperation(r),
        }
    }
}

/// Why a broadcast did not go through
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BroadcastError {
    Recoverable(RecoverableReason),
    Fatal(FatalReason),
}

/// Outcome of waiting for a receipt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiptOutcome {
    Confirmed { block_number: Option<u64> },
    Reverted,
    Timeout,
}

/// Outcome of one full attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitResult {
    Confirmed { tx_hash: String, block_number: Option<u64> },
    /// Receipt status 0; fatal
    Reverted { tx_hash: String },
    Recoverable(RecoverableReason),
    Fatal(FatalReason),
    /// Broadcast accepted, no receipt within the bound
    ConfirmationTimeout { tx_hash: String },
}

impl From<BroadcastError> for SubmitResult {
    fn from(err: BroadcastError) -> Self {
        match err {
            BroadcastError::Recoverable(reason) => SubmitResult::Recoverable(reason),
            BroadcastError::Fatal(reason) => SubmitResult::Fatal(reason),
        }
    }
}

/// Node rejection, classified
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// The node already holds this exact transaction
    AlreadyKnown,
    NonceConflict,
    Underpriced,
    InsufficientFunds,
    InvalidAddress,
    Transient,
}

/// Classify node rejection text
pub fn classify_rejection(message: &str) -> Rejection {
    let m = message.to_lowercase();
    if m.contains("already known") || m.contains("known transaction") {
        Rejection::AlreadyKnown
    } else if m.contains("nonce too low")
        || m.contains("nonce too high")
        || m.contains("replacement transaction underpriced")
        || m.contains("invalid nonce")
    {
        Rejection::NonceConflict
    } else if m.contains("transaction underpriced")
        || m.contains("fee too low")
        || m.contains("max fee per gas less than block base fee")
        || m.contains("gas price too low")
    {
        Rejection::Underpriced
    } else if m.contains("insufficient funds") {
        Rejection::InsufficientFunds
    } else if m.contains("invalid address") || m.contains("invalid sender") {
        Rejection::InvalidAddress
    } else {
        Rejection::Transient
    }
}

/// A signed, RLP-encoded transaction
#[derive(Debug, Clone)]
pub struct SignedTransaction {
    pub raw: Vec<u8>,
    /// keccak256 of `raw`
    pub tx_hash: String,
}

/// Local signer for the submitting account
pub struct TxSigner {
    wallet: LocalWallet,
    chain_id: u64,
}

impl TxSigner {
    pub fn new(key: &SigningKey, chain_id: u64) -> LedgerResult<Self> {
        let wallet: LocalWallet = key
            .expose()
            .parse()
            .map_err(|e| LedgerError::Configuration(format!("invalid signing key: {}", e)))?;
        Ok(Self {
            wallet: wallet.with_chain_id(chain_id),
            chain_id,
        })
    }

    pub fn address(&self) -> Address {
        self.wallet.address()
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn sign(
        &self,
        descriptor: &CallDescriptor,
        nonce: u64,
        gas_price: u64,
        gas_limit: u64,
    ) -> LedgerResult<SignedTransaction> {
        let request = TransactionRequest::new()
            .from(self.wallet.address())
            .to(descriptor.contract)
            .data(descriptor.calldata())
            .value(U256::zero())
            .nonce(nonce)
            .gas(gas_limit)
            .gas_price(gas_price)
            .chain_id(self.chain_id);
        let typed: TypedTransaction = request.into();
        let signature = self
            .wallet
            .sign_transaction_sync(&typed)
            .map_err(|e| LedgerError::TransactionSign(e.to_string()))?;
        let raw = typed.rlp_signed(&signature).to_vec();
        let tx_hash = format!("0x{}", hex::encode(keccak256(&raw)));
        Ok(SignedTransaction { raw, tx_hash })
    }
}

/// Signs, sends and awaits a single attempt
pub struct TransactionSubmitter {
    rpc: Arc<dyn LedgerRpc>,
    signer: TxSigner,
    receipt_timeout: Duration,
    poll_interval: Duration,
}

impl TransactionSubmitter {
    pub fn new(
        rpc: Arc<dyn LedgerRpc>,
        signer: TxSigner,
        receipt_timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            rpc,
            signer,
            receipt_timeout,
            poll_interval,
        }
    }

    pub fn signer(&self) -> &TxSigner {
        &self.signer
    }

    /// Sign and send; returns the transaction hash on acceptance
    pub async fn broadcast(
        &self,
        descriptor: &CallDescriptor,
        nonce: u64,
        gas_price: u64,
        gas_limit: u64,
    ) -> Result<String, BroadcastError> {
        let signed = self
            .signer
            .sign(descriptor, nonce, gas_price, gas_limit)
            .map_err(|e| BroadcastError::Recoverable(RecoverableReason::Transient(e.to_string())))?;

        debug!(
            "Broadcasting {} nonce={} gas_price={} gas_limit={}",
            descriptor.signature, nonce, gas_price, gas_limit
        );

        match self.rpc.send_raw_transaction(signed.raw).await {
            Ok(hash) => Ok(normalize_tx_hash(&hash)),
            Err(err) => {
                let message = rejection_message(&err);
                match classify_rejection(&message) {
                    Rejection::AlreadyKnown => {
                        info!("Node already holds {}, treating as accepted", signed.tx_hash);
                        Ok(signed.tx_hash)
                    }
                    Rejection::NonceConflict => {
                        warn!("Nonce {} rejected: {}", nonce, message);
                        Err(BroadcastError::Recoverable(RecoverableReason::NonceConflict))
                    }
                    Rejection::Underpriced => {
                        warn!("Gas price {} rejected: {}", gas_price, message);
                        Err(BroadcastError::Recoverable(RecoverableReason::Underpriced))
                    }
                    Rejection::InsufficientFunds => {
                        Err(BroadcastError::Fatal(FatalReason::InsufficientFunds))
                    }
                    Rejection::InvalidAddress => Err(BroadcastError::Fatal(FatalReason::InvalidAddress(
                        format_address(&descriptor.contract),
                    ))),
                    Rejection::Transient => {
                        warn!("Broadcast failed: {}", message);
                        Err(BroadcastError::Recoverable(RecoverableReason::Transient(message)))
                    }
                }
            }
        }
    }

    /// Poll for a receipt until the configured bound elapses
    pub async fn await_receipt(&self, tx_hash: &str) -> ReceiptOutcome {
        let deadline = Instant::now() + self.receipt_timeout;
        loop {
            match self.rpc.transaction_receipt(tx_hash).await {
                Ok(Some(receipt)) if receipt.block_number.is_some() => {
                    return if receipt.success {
                        ReceiptOutcome::Confirmed {
                            block_number: receipt.block_number,
                        }
                    } else {
                        ReceiptOutcome::Reverted
                    };
                }
                Ok(_) => {}
                Err(e) => debug!("Receipt poll for {} failed: {}", tx_hash, e),
            }

            let now = Instant::now();
            if now >= deadline {
                return ReceiptOutcome::Timeout;
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    /// Broadcast and wait in one step
    pub async fn submit(
        &self,
        descriptor: &CallDescriptor,
        nonce: u64,
        gas_price: u64,
        gas_limit: u64,
    ) -> SubmitResult {
        match self.broadcast(descriptor, nonce, gas_price, gas_limit).await {
            Ok(tx_hash) => self.settle(tx_hash).await,
            Err(e) => e.into(),
        }
    }

    /// Second half of [`submit`](Self::submit), for callers that record the
    /// accepted hash before waiting
    pub async fn settle(&self, tx_hash: String) -> SubmitResult {
        match self.await_receipt(&tx_hash).await {
            ReceiptOutcome::Confirmed { block_number } => SubmitResult::Confirmed {
                tx_hash,
                block_number,
            },
            ReceiptOutcome::Reverted => SubmitResult::Reverted { tx_hash },
            ReceiptOutcome::Timeout => SubmitResult::ConfirmationTimeout { tx_hash },
        }
    }
}

fn rejection_message(err: &LedgerError) -> String {
    match err {
        LedgerError::RpcResponse { message, .. } => message.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::rpc::{LogQuery, ReceiptInfo};
    use crate::types::{LogEntry, Operation};
    use async_trait::async_trait;

    /// Node with one canned answer to every send
    struct StubNode {
        rejection: Option<&'static str>,
        mined: Option<bool>,
    }

    #[async_trait]
    impl LedgerRpc for StubNode {
        async fn chain_id(&self) -> LedgerResult<u64> {
            Ok(31337)
        }
        async fn block_number(&self) -> LedgerResult<u64> {
            Ok(9)
        }
        async fn gas_price(&self) -> LedgerResult<u64> {
            Ok(0)
        }
        async fn pending_nonce(&self, _address: Address) -> LedgerResult<u64> {
            Ok(0)
        }
        async fn balance(&self, _address: Address) -> LedgerResult<U256> {
            Ok(U256::zero())
        }
        async fn send_raw_transaction(&self, raw: Vec<u8>) -> LedgerResult<String> {
            match self.rejection {
                Some(message) => Err(LedgerError::RpcResponse {
                    code: -32000,
                    message: message.to_string(),
                }),
                None => Ok(format!("0x{}", hex::encode(keccak256(&raw)))),
            }
        }
        async fn transaction_receipt(&self, tx_hash: &str) -> LedgerResult<Option<ReceiptInfo>> {
            Ok(self.mined.map(|success| ReceiptInfo {
                tx_hash: tx_hash.to_string(),
                block_number: Some(9),
                success,
                gas_used: Some(60_000),
            }))
        }
        async fn logs(&self, _query: &LogQuery) -> LedgerResult<Vec<LogEntry>> {
            Ok(Vec::new())
        }
        async fn call_contract(&self, _to: Address, _data: Vec<u8>) -> LedgerResult<Vec<u8>> {
            Ok(Vec::new())
        }
    }

    fn submitter(node: StubNode) -> (TransactionSubmitter, CallDescriptor) {
        let config = EngineConfig::development();
        let signer = TxSigner::new(config.private_key.as_ref().unwrap(), 31_337).unwrap();
        let desc = crate::tx_builder::OperationBuilder::new(config.contracts)
            .build(&Operation::EarnPoints {
                entity_id: "U1".to_string(),
                user: "0x00000000000000000000000000000000000000aa".to_string(),
                booking_amount: 100,
                description: "booking B1".to_string(),
            })
            .unwrap();
        let submitter = TransactionSubmitter::new(
            Arc::new(node),
            signer,
            Duration::from_secs(30),
            Duration::from_millis(500),
        );
        (submitter, desc)
    }

    #[test]
    fn test_classify_nonce_conflicts() {
        assert_eq!(classify_rejection("nonce too low"), Rejection::NonceConflict);
        assert_eq!(classify_rejection("Nonce too high"), Rejection::NonceConflict);
        assert_eq!(
            classify_rejection("replacement transaction underpriced"),
            Rejection::NonceConflict
        );
    }

    #[test]
    fn test_classify_pricing_and_funds() {
        assert_eq!(classify_rejection("transaction underpriced"), Rejection::Underpriced);
        assert_eq!(
            classify_rejection("max fee per gas less than block base fee"),
            Rejection::Underpriced
        );
        assert_eq!(
            classify_rejection("insufficient funds for gas * price + value"),
            Rejection::InsufficientFunds
        );
    }

    #[test]
    fn test_classify_already_known_and_unknown() {
        assert_eq!(classify_rejection("already known"), Rejection::AlreadyKnown);
        assert_eq!(classify_rejection("connection reset by peer"), Rejection::Transient);
        assert_eq!(classify_rejection("invalid sender"), Rejection::InvalidAddress);
    }

    #[test]
    fn test_rejection_message_prefers_node_text() {
        let err = LedgerError::RpcResponse {
            code: -32000,
            message: "nonce too low".to_string(),
        };
        assert_eq!(rejection_message(&err), "nonce too low");
        let err = LedgerError::Network("timed out".to_string());
        assert_eq!(rejection_message(&err), "Network error: timed out");
    }

    #[test]
    fn test_signer_is_deterministic() {
        let config = EngineConfig::development();
        let key = config.private_key.clone().unwrap();
        let signer = TxSigner::new(&key, 31_337).unwrap();
        assert_eq!(
            format_address(&signer.address()),
            "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266"
        );

        let builder = crate::tx_builder::OperationBuilder::new(config.contracts);
        let desc = builder
            .build(&crate::types::Operation::EarnPoints {
                entity_id: "U1".to_string(),
                user: "0x00000000000000000000000000000000000000aa".to_string(),
                booking_amount: 100,
                description: "booking B1".to_string(),
            })
            .unwrap();
        let a = signer.sign(&desc, 0, 20_000_000_000, 144_000).unwrap();
        let b = signer.sign(&desc, 0, 20_000_000_000, 144_000).unwrap();
        assert_eq!(a.raw, b.raw);
        assert_eq!(a.tx_hash, b.tx_hash);
        let c = signer.sign(&desc, 1, 20_000_000_000, 144_000).unwrap();
        assert_ne!(a.tx_hash, c.tx_hash);
    }

    #[tokio::test]
    async fn test_submit_confirms_with_receipt() {
        let (submitter, desc) = submitter(StubNode {
            rejection: None,
            mined: Some(true),
        });
        match submitter.submit(&desc, 0, 20_000_000_000, 144_000).await {
            SubmitResult::Confirmed { tx_hash, block_number } => {
                assert!(tx_hash.starts_with("0x"));
                assert_eq!(block_number, Some(9));
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_submit_classifies_rejection() {
        let (submitter, desc) = submitter(StubNode {
            rejection: Some("nonce too low"),
            mined: None,
        });
        assert_eq!(
            submitter.submit(&desc, 0, 20_000_000_000, 144_000).await,
            SubmitResult::Recoverable(RecoverableReason::NonceConflict)
        );
    }

    #[tokio::test]
    async fn test_submit_reports_revert() {
        let (submitter, desc) = submitter(StubNode {
            rejection: None,
            mined: Some(false),
        });
        assert!(matches!(
            submitter.submit(&desc, 0, 20_000_000_000, 144_000).await,
            SubmitResult::Reverted { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_settle_times_out_without_receipt() {
        let (submitter, _) = submitter(StubNode {
            rejection: None,
            mined: None,
        });
        let start = Instant::now();
        assert_eq!(
            submitter.settle("0xabc".to_string()).await,
            SubmitResult::ConfirmationTimeout {
                tx_hash: "0xabc".to_string()
            }
        );
        assert!(start.elapsed() >= Duration::from_secs(30));
    }

    #[test]
    fn test_fatal_reason_maps_to_operation_error() {
        assert_eq!(
            OperationError::from(FatalReason::InsufficientFunds),
            OperationError::InsufficientFunds
        );
    }
}
