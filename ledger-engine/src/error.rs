//! Ledger Engine Error Types
//!
//! Two layers of errors live here:
//!
//! - [`LedgerError`]: everything that can go wrong inside the engine
//!   (RPC, encoding, storage, configuration).
//! - [`OperationError`]: the closed set of terminal failures a caller of
//!   [`crate::LedgerEngine::submit`] can observe. Nothing below this
//!   boundary (raw RPC text, ABI errors) is exposed through it.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Caller-facing operation failure
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "error", content = "detail", rename_all = "snake_case")]
pub enum OperationError {
    /// Another transaction for the same entity and operation kind is still open
    #[error("Operation already in flight for {entity_id} ({kind})")]
    OperationAlreadyInFlight { entity_id: String, kind: String },

    /// Signing account cannot pay for gas
    #[error("Insufficient funds in signing account")]
    InsufficientFunds,

    /// An address argument or the configured contract address is malformed
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// No contract is configured for this operation
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// Broadcast succeeded but no receipt was seen in time
    #[error("Confirmation timeout for transaction {tx_hash}")]
    ConfirmationTimeout { tx_hash: String },

    /// Recoverable errors persisted past the retry budget
    #[error("Max retries exceeded after {attempts} attempts: {last_error}")]
    MaxRetriesExceeded { attempts: u32, last_error: String },

    /// Contract rejected the call (receipt status 0)
    #[error("Transaction {tx_hash} reverted")]
    Reverted { tx_hash: String },

    /// Caller cancelled the operation
    #[error("Operation cancelled")]
    Cancelled { tx_hash: Option<String> },
}

impl OperationError {
    /// Whether the failure leaves a transaction that may still land on chain
    pub fn may_still_confirm(&self) -> bool {
        match self {
            OperationError::ConfirmationTimeout { .. } => true,
            OperationError::Cancelled { tx_hash } => tx_hash.is_some(),
            _ => false,
        }
    }
}

/// Ledger Engine Error
#[derive(Error, Debug)]
pub enum LedgerError {
    /// Terminal operation failure surfaced to the caller
    #[error(transparent)]
    Operation(#[from] OperationError),

    /// RPC connection error
    #[error("Ledger RPC connection failed: {0}")]
    RpcConnection(String),

    /// RPC request error
    #[error("Ledger RPC request failed: {0}")]
    RpcRequest(String),

    /// RPC response error
    #[error("Ledger RPC response error: {message}")]
    RpcResponse { code: i64, message: String },

    /// Transaction signing error
    #[error("Transaction signing failed: {0}")]
    TransactionSign(String),

    /// ABI encoding / decoding error
    #[error("ABI error: {0}")]
    Abi(String),

    /// Event log could not be decoded
    #[error("Event decode failed: {0}")]
    EventDecode(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Network error
    #[error("Network error: {0}")]
    Network(String),

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Pending transaction not found
    #[error("Pending transaction not found: {0}")]
    NotFound(String),

    /// State transition error
    #[error("State transition error: {0}")]
    StateTransition(String),

    /// Off-chain entity store error
    #[error("Entity store error: {0}")]
    EntityStore(String),
}

/// Ledger Result type
pub type LedgerResult<T> = Result<T, LedgerError>;

impl LedgerError {
    /// Caller-facing error, if this is one
    pub fn operation_error(&self) -> Option<&OperationError> {
        match self {
            LedgerError::Operation(e) => Some(e),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for LedgerError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() {
            LedgerError::RpcConnection(e.to_string())
        } else {
            LedgerError::Network(e.to_string())
        }
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(e: serde_json::Error) -> Self {
        LedgerError::Serialization(e.to_string())
    }
}

impl From<hex::FromHexError> for LedgerError {
    fn from(e: hex::FromHexError) -> Self {
        LedgerError::Serialization(format!("Hex decode error: {}", e))
    }
}

impl From<sled::Error> for LedgerError {
    fn from(e: sled::Error) -> Self {
        LedgerError::Storage(e.to_string())
    }
}

impl From<ethers::abi::Error> for LedgerError {
    fn from(e: ethers::abi::Error) -> Self {
        LedgerError::Abi(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_error_is_transparent() {
        let err: LedgerError = OperationError::InsufficientFunds.into();
        assert_eq!(err.to_string(), "Insufficient funds in signing account");
        assert_eq!(err.operation_error(), Some(&OperationError::InsufficientFunds));
    }

    #[test]
    fn test_may_still_confirm() {
        assert!(OperationError::ConfirmationTimeout { tx_hash: "0xab".into() }.may_still_confirm());
        assert!(OperationError::Cancelled { tx_hash: Some("0xab".into()) }.may_still_confirm());
        assert!(!OperationError::Cancelled { tx_hash: None }.may_still_confirm());
        assert!(!OperationError::Reverted { tx_hash: "0xab".into() }.may_still_confirm());
    }
}
