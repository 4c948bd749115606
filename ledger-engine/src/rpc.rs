//! Ledger RPC Client
//!
//! [`LedgerRpc`] is the narrow call surface the engine needs from an EVM
//! node. [`EthRpcClient`] implements it over JSON-RPC/HTTP; tests swap in a
//! scripted ledger.

use async_trait::async_trait;
use base64::Engine;
use ethers::types::{Address, Bytes, Log, TransactionReceipt, H256, U256, U64};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

use crate::config::RpcConfig;
use crate::error::{LedgerError, LedgerResult};
use crate::types::{format_address, format_h256, normalize_tx_hash, u256_to_u64, LogEntry};

/// Receipt summary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiptInfo {
    pub tx_hash: String,
    pub block_number: Option<u64>,
    /// Receipt status 1
    pub success: bool,
    pub gas_used: Option<u64>,
}

/// `eth_getLogs` filter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogQuery {
    pub address: Address,
    pub topic0: H256,
    pub from_block: u64,
    pub to_block: u64,
}

/// Ledger node call surface
#[async_trait]
pub trait LedgerRpc: Send + Sync {
    async fn chain_id(&self) -> LedgerResult<u64>;

    /// Latest block number
    async fn block_number(&self) -> LedgerResult<u64>;

    /// Node-suggested gas price (wei)
    async fn gas_price(&self) -> LedgerResult<u64>;

    /// Transaction count including pending transactions
    async fn pending_nonce(&self, address: Address) -> LedgerResult<u64>;

    async fn balance(&self, address: Address) -> LedgerResult<U256>;

    /// Broadcast a signed transaction; returns its hash
    async fn send_raw_transaction(&self, raw: Vec<u8>) -> LedgerResult<String>;

    /// `None` while the transaction is not yet included
    async fn transaction_receipt(&self, tx_hash: &str) -> LedgerResult<Option<ReceiptInfo>>;

    async fn logs(&self, query: &LogQuery) -> LedgerResult<Vec<LogEntry>>;

    /// Read-only contract call at the latest block
    async fn call_contract(&self, to: Address, data: Vec<u8>) -> LedgerResult<Vec<u8>>;
}

/// JSON-RPC client for an EVM node
pub struct EthRpcClient {
    /// HTTP client
    client: Client,
    config: RpcConfig,
    /// Request ID counter
    request_id: AtomicU64,
}

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
    #[allow(dead_code)]
    id: u64,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

impl EthRpcClient {
    pub fn new(config: RpcConfig) -> LedgerResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| LedgerError::RpcConnection(e.to_string()))?;

        Ok(Self {
            client,
            config,
            request_id: AtomicU64::new(0),
        })
    }

    /// Make an RPC call whose result may be `null`
    async fn request_optional<T: for<'de> Deserialize<'de>>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> LedgerResult<Option<T>> {
        let id = self.request_id.fetch_add(1, Ordering::SeqCst);

        let request = RpcRequest {
            jsonrpc: "2.0",
            id,
            method,
            params,
        };

        debug!("Ledger RPC call: {} id={}", method, id);

        let mut builder = self
            .client
            .post(&self.config.url)
            .header("Content-Type", "application/json");

        if let Some(ref username) = self.config.username {
            let auth = format!(
                "{}:{}",
                username,
                self.config.password.as_deref().unwrap_or_default()
            );
            builder = builder.header(
                "Authorization",
                format!("Basic {}", base64::engine::general_purpose::STANDARD.encode(auth)),
            );
        }

        let response = builder.json(&request).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LedgerError::RpcRequest(format!("HTTP {} - {}", status, body)));
        }

        let rpc_response: RpcResponse<T> = response
            .json()
            .await
            .map_err(|e| LedgerError::RpcRequest(e.to_string()))?;

        if let Some(error) = rpc_response.error {
            return Err(LedgerError::RpcResponse {
                code: error.code,
                message: error.message,
            });
        }

        Ok(rpc_response.result)
    }

    /// Make an RPC call that must return a result
    async fn request<T: for<'de> Deserialize<'de>>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> LedgerResult<T> {
        self.request_optional(method, params)
            .await?
            .ok_or_else(|| LedgerError::RpcRequest(format!("Empty response to {}", method)))
    }

    async fn quantity(&self, method: &str, params: serde_json::Value) -> LedgerResult<u64> {
        let value: U256 = self.request(method, params).await?;
        u256_to_u64(value).map_err(|_| {
            LedgerError::RpcRequest(format!("{} returned an out-of-range quantity", method))
        })
    }
}

fn quantity(value: u64) -> String {
    format!("0x{:x}", value)
}

#[async_trait]
impl LedgerRpc for EthRpcClient {
    async fn chain_id(&self) -> LedgerResult<u64> {
        self.quantity("eth_chainId", serde_json::json!([])).await
    }

    async fn block_number(&self) -> LedgerResult<u64> {
        self.quantity("eth_blockNumber", serde_json::json!([])).await
    }

    async fn gas_price(&self) -> LedgerResult<u64> {
        self.quantity("eth_gasPrice", serde_json::json!([])).await
    }

    async fn pending_nonce(&self, address: Address) -> LedgerResult<u64> {
        self.quantity(
            "eth_getTransactionCount",
            serde_json::json!([format_address(&address), "pending"]),
        )
        .await
    }

    async fn balance(&self, address: Address) -> LedgerResult<U256> {
        self.request(
            "eth_getBalance",
            serde_json::json!([format_address(&address), "latest"]),
        )
        .await
    }

    async fn send_raw_transaction(&self, raw: Vec<u8>) -> LedgerResult<String> {
        let hash: H256 = self
            .request(
                "eth_sendRawTransaction",
                serde_json::json!([format!("0x{}", hex::encode(raw))]),
            )
            .await?;
        Ok(format_h256(&hash))
    }

    async fn transaction_receipt(&self, tx_hash: &str) -> LedgerResult<Option<ReceiptInfo>> {
        let receipt: Option<TransactionReceipt> = self
            .request_optional(
                "eth_getTransactionReceipt",
                serde_json::json!([normalize_tx_hash(tx_hash)]),
            )
            .await?;

        Ok(receipt.map(|r| ReceiptInfo {
            tx_hash: format_h256(&r.transaction_hash),
            block_number: r.block_number.map(|b| b.as_u64()),
            success: r.status == Some(U64::from(1u64)),
            gas_used: r.gas_used.and_then(|g| u256_to_u64(g).ok()),
        }))
    }

    async fn logs(&self, query: &LogQuery) -> LedgerResult<Vec<LogEntry>> {
        let filter = serde_json::json!([{
            "address": format_address(&query.address),
            "topics": [format_h256(&query.topic0)],
            "fromBlock": quantity(query.from_block),
            "toBlock": quantity(query.to_block),
        }]);
        let logs: Vec<Log> = self.request("eth_getLogs", filter).await?;

        logs.into_iter()
            .map(|log| {
                let tx_hash = log
                    .transaction_hash
                    .ok_or_else(|| LedgerError::EventDecode("log without transaction hash".to_string()))?;
                Ok(LogEntry {
                    address: log.address,
                    topics: log.topics,
                    data: log.data.to_vec(),
                    block_number: log.block_number.map(|b| b.as_u64()).unwrap_or(query.from_block),
                    tx_hash: format_h256(&tx_hash),
                    log_index: log.log_index.and_then(|i| u256_to_u64(i).ok()).unwrap_or_default(),
                })
            })
            .collect()
    }

    async fn call_contract(&self, to: Address, data: Vec<u8>) -> LedgerResult<Vec<u8>> {
        let result: Bytes = self
            .request(
                "eth_call",
                serde_json::json!([{
                    "to": format_address(&to),
                    "data": format!("0x{}", hex::encode(data)),
                }, "latest"]),
            )
            .await?;
        Ok(result.to_vec())
    }
}
