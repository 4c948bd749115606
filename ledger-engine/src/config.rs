//! Ledger Engine Configuration
//!
//! Configuration for the ledger connection, contracts, gas bounds, retry
//! policy and event polling. Supports loading from environment variables
//! with the `LEDGER_` prefix.

use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::time::Duration;

use crate::error::{LedgerError, LedgerResult};
use crate::types::{parse_address, ContractRole, GWEI};

/// Public endpoint used when no Infura project id is supplied
pub const PUBLIC_SEPOLIA_RPC: &str = "https://rpc.sepolia.org";

/// Ledger network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LedgerNetwork {
    Mainnet,
    /// Sepolia testnet
    #[default]
    Sepolia,
    /// Local development node
    Local,
}

impl LedgerNetwork {
    /// Parse from string (for environment variables)
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "mainnet" | "main" => Some(Self::Mainnet),
            "sepolia" | "testnet" => Some(Self::Sepolia),
            "local" | "localhost" | "dev" => Some(Self::Local),
            _ => None,
        }
    }

    pub fn chain_id(&self) -> u64 {
        match self {
            LedgerNetwork::Mainnet => 1,
            LedgerNetwork::Sepolia => 11_155_111,
            LedgerNetwork::Local => 31_337,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerNetwork::Mainnet => "mainnet",
            LedgerNetwork::Sepolia => "sepolia",
            LedgerNetwork::Local => "local",
        }
    }

    /// RPC endpoint for this network. Uses Infura when a project id is
    /// given, otherwise a public gateway.
    pub fn rpc_url(&self, infura_project_id: Option<&str>) -> String {
        match (self, infura_project_id) {
            (LedgerNetwork::Local, _) => "http://127.0.0.1:8545".to_string(),
            (network, Some(id)) if !id.is_empty() => {
                format!("https://{}.infura.io/v3/{}", network.as_str(), id)
            }
            (LedgerNetwork::Mainnet, _) => "https://cloudflare-eth.com".to_string(),
            (LedgerNetwork::Sepolia, _) => PUBLIC_SEPOLIA_RPC.to_string(),
        }
    }
}

impl fmt::Display for LedgerNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Signing key, redacted in debug output
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct SigningKey(String);

impl SigningKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn expose(&self) -> &str {
        self.0.strip_prefix("0x").unwrap_or(&self.0)
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SigningKey(***)")
    }
}

/// Ledger RPC configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcConfig {
    /// RPC endpoint URL
    pub url: String,
    /// Basic auth username (private nodes)
    #[serde(default)]
    pub username: Option<String>,
    /// Basic auth password
    #[serde(default)]
    pub password: Option<String>,
    /// Request timeout in seconds
    #[serde(default = "default_rpc_timeout")]
    pub timeout_secs: u64,
}

fn default_rpc_timeout() -> u64 {
    30
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            url: PUBLIC_SEPOLIA_RPC.to_string(),
            username: None,
            password: None,
            timeout_secs: 30,
        }
    }
}

impl RpcConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - LEDGER_RPC_URL: explicit endpoint (wins over derivation)
    /// - LEDGER_INFURA_PROJECT_ID: derive an Infura endpoint for the network
    /// - LEDGER_RPC_USER / LEDGER_RPC_PASS: basic auth (optional)
    /// - LEDGER_RPC_TIMEOUT: request timeout in seconds
    pub fn from_env(network: LedgerNetwork) -> Self {
        let infura = env::var("LEDGER_INFURA_PROJECT_ID").ok();
        Self {
            url: env::var("LEDGER_RPC_URL")
                .unwrap_or_else(|_| network.rpc_url(infura.as_deref())),
            username: env::var("LEDGER_RPC_USER").ok(),
            password: env::var("LEDGER_RPC_PASS").ok(),
            timeout_secs: env_parse("LEDGER_RPC_TIMEOUT").unwrap_or(30),
        }
    }
}

/// Deployed contract addresses
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContractAddresses {
    pub certificates: Option<String>,
    pub loyalty: Option<String>,
    pub booking: Option<String>,
    pub reviews: Option<String>,
}

impl ContractAddresses {
    pub fn get(&self, role: ContractRole) -> Option<&str> {
        let address = match role {
            ContractRole::Certificates => &self.certificates,
            ContractRole::Loyalty => &self.loyalty,
            ContractRole::Booking => &self.booking,
            ContractRole::Reviews => &self.reviews,
        };
        address.as_deref().filter(|a| !a.is_empty())
    }

    /// Environment variables:
    /// - LEDGER_CERTIFICATE_CONTRACT
    /// - LEDGER_LOYALTY_CONTRACT
    /// - LEDGER_BOOKING_CONTRACT
    /// - LEDGER_REVIEW_CONTRACT
    pub fn from_env() -> Self {
        Self {
            certificates: env::var("LEDGER_CERTIFICATE_CONTRACT").ok(),
            loyalty: env::var("LEDGER_LOYALTY_CONTRACT").ok(),
            booking: env::var("LEDGER_BOOKING_CONTRACT").ok(),
            reviews: env::var("LEDGER_REVIEW_CONTRACT").ok(),
        }
    }
}

/// Gas pricing bounds (wei)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GasConfig {
    /// Floor for the quoted price
    pub min_price: u64,
    /// Ceiling for the quoted price
    pub max_price: u64,
    /// Hard ceiling for escalated prices
    pub emergency_ceiling: u64,
    /// Premium over the network price, in percent
    #[serde(default = "default_premium")]
    pub premium_percent: u64,
    /// Multiplier applied per underpriced rejection
    #[serde(default = "default_escalation")]
    pub escalation_factor: f64,
    /// Headroom over the static gas limit, in percent
    #[serde(default = "default_headroom")]
    pub limit_headroom_percent: u64,
}

fn default_premium() -> u64 {
    10
}

fn default_escalation() -> f64 {
    1.5
}

fn default_headroom() -> u64 {
    20
}

impl Default for GasConfig {
    fn default() -> Self {
        Self {
            min_price: 5 * GWEI,
            max_price: 100 * GWEI,
            emergency_ceiling: 200 * GWEI,
            premium_percent: 10,
            escalation_factor: 1.5,
            limit_headroom_percent: 20,
        }
    }
}

/// Retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Last attempt index; attempts run 0..=max_retries
    pub max_retries: u32,
    /// Delay before attempt 1, in milliseconds; doubled each attempt
    pub initial_backoff_ms: u64,
    /// Cap on a single backoff delay, in milliseconds
    pub max_backoff_ms: u64,
    /// Times an exhausted transaction may be requeued by an operator
    pub max_requeues: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 60_000,
            max_requeues: 3,
        }
    }
}

/// Event polling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Sleep after a successful poll, in seconds
    pub poll_interval_secs: u64,
    /// Sleep after a failed poll, in seconds
    pub error_backoff_secs: u64,
    /// Largest block range per `eth_getLogs` call
    pub max_block_range: u64,
    /// First block to scan; `None` starts at the current head
    pub start_block: Option<u64>,
    /// Orphan receipt re-check interval, in seconds
    pub orphan_recheck_secs: u64,
    /// Event channel capacity
    pub channel_capacity: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 10,
            error_backoff_secs: 30,
            max_block_range: 2_000,
            start_block: None,
            orphan_recheck_secs: 300,
            channel_capacity: 1_024,
        }
    }
}

impl MonitorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_secs(self.error_backoff_secs)
    }

    pub fn orphan_recheck_interval(&self) -> Duration {
        Duration::from_secs(self.orphan_recheck_secs)
    }
}

/// Pending-transaction store backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    Sled,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Database path (sled only)
    pub path: Option<String>,
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub network: LedgerNetwork,
    /// Overrides the network's chain id; `None` asks the node
    #[serde(default)]
    pub chain_id: Option<u64>,
    pub rpc: RpcConfig,
    /// Signing account key (hex)
    pub private_key: Option<SigningKey>,
    pub contracts: ContractAddresses,
    #[serde(default)]
    pub gas: GasConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    /// Receipt wait bound per attempt, in seconds
    #[serde(default = "default_receipt_timeout")]
    pub receipt_timeout_secs: u64,
    /// Receipt polling interval, in milliseconds
    #[serde(default = "default_receipt_poll")]
    pub receipt_poll_interval_ms: u64,
}

fn default_receipt_timeout() -> u64 {
    120
}

fn default_receipt_poll() -> u64 {
    2_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            network: LedgerNetwork::Sepolia,
            chain_id: None,
            rpc: RpcConfig::default(),
            private_key: None,
            contracts: ContractAddresses::default(),
            gas: GasConfig::default(),
            retry: RetryConfig::default(),
            monitor: MonitorConfig::default(),
            storage: StorageConfig::default(),
            receipt_timeout_secs: 120,
            receipt_poll_interval_ms: 2_000,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - LEDGER_NETWORK: mainnet/sepolia/local (default sepolia)
    /// - LEDGER_CHAIN_ID: chain id override
    /// - LEDGER_PRIVATE_KEY: signing key
    /// - LEDGER_MAX_RETRIES, LEDGER_RETRY_INITIAL_BACKOFF_MS
    /// - LEDGER_GAS_MIN_GWEI, LEDGER_GAS_MAX_GWEI, LEDGER_GAS_CEILING_GWEI
    /// - LEDGER_POLL_INTERVAL, LEDGER_POLL_ERROR_BACKOFF, LEDGER_START_BLOCK
    /// - LEDGER_RECEIPT_TIMEOUT
    /// - LEDGER_STORAGE_PATH: use sled at this path
    ///
    /// Also reads RPC and contract config from their respective env vars.
    pub fn from_env() -> Self {
        let network = env::var("LEDGER_NETWORK")
            .ok()
            .and_then(|s| LedgerNetwork::from_str(&s))
            .unwrap_or_default();

        let defaults = GasConfig::default();
        let gas = GasConfig {
            min_price: env_parse::<u64>("LEDGER_GAS_MIN_GWEI")
                .map(|g| g * GWEI)
                .unwrap_or(defaults.min_price),
            max_price: env_parse::<u64>("LEDGER_GAS_MAX_GWEI")
                .map(|g| g * GWEI)
                .unwrap_or(defaults.max_price),
            emergency_ceiling: env_parse::<u64>("LEDGER_GAS_CEILING_GWEI")
                .map(|g| g * GWEI)
                .unwrap_or(defaults.emergency_ceiling),
            ..defaults
        };

        let retry = RetryConfig {
            max_retries: env_parse("LEDGER_MAX_RETRIES").unwrap_or(3),
            initial_backoff_ms: env_parse("LEDGER_RETRY_INITIAL_BACKOFF_MS").unwrap_or(1_000),
            ..RetryConfig::default()
        };

        let monitor = MonitorConfig {
            poll_interval_secs: env_parse("LEDGER_POLL_INTERVAL").unwrap_or(10),
            error_backoff_secs: env_parse("LEDGER_POLL_ERROR_BACKOFF").unwrap_or(30),
            start_block: env_parse("LEDGER_START_BLOCK"),
            ..MonitorConfig::default()
        };

        let storage = match env::var("LEDGER_STORAGE_PATH") {
            Ok(path) => StorageConfig {
                backend: StorageBackend::Sled,
                path: Some(path),
            },
            Err(_) => StorageConfig::default(),
        };

        Self {
            network,
            chain_id: env_parse("LEDGER_CHAIN_ID"),
            rpc: RpcConfig::from_env(network),
            private_key: env::var("LEDGER_PRIVATE_KEY").ok().map(SigningKey::new),
            contracts: ContractAddresses::from_env(),
            gas,
            retry,
            monitor,
            storage,
            receipt_timeout_secs: env_parse("LEDGER_RECEIPT_TIMEOUT").unwrap_or(120),
            receipt_poll_interval_ms: 2_000,
        }
    }

    /// Create a development configuration (local node, well-known dev key)
    pub fn development() -> Self {
        Self {
            network: LedgerNetwork::Local,
            chain_id: Some(LedgerNetwork::Local.chain_id()),
            rpc: RpcConfig {
                url: LedgerNetwork::Local.rpc_url(None),
                username: None,
                password: None,
                timeout_secs: 10,
            },
            private_key: Some(SigningKey::new(
                "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80",
            )),
            contracts: ContractAddresses {
                certificates: Some("0x5fbdb2315678afecb367f032d93f642f64180aa3".to_string()),
                loyalty: Some("0xe7f1725e7734ce288f8367e1bb143e90bb3f0512".to_string()),
                booking: Some("0x9fe46736679d2d9a65f0992f2272de9f3c7fa6e0".to_string()),
                reviews: Some("0xcf7ed3acca5a467e9e704c703e8d87f634fb0fc9".to_string()),
            },
            gas: GasConfig::default(),
            retry: RetryConfig {
                max_retries: 3,
                initial_backoff_ms: 200,
                max_backoff_ms: 5_000,
                max_requeues: 3,
            },
            monitor: MonitorConfig {
                poll_interval_secs: 2,
                error_backoff_secs: 5,
                start_block: Some(0),
                orphan_recheck_secs: 30,
                ..MonitorConfig::default()
            },
            storage: StorageConfig::default(),
            receipt_timeout_secs: 30,
            receipt_poll_interval_ms: 500,
        }
    }

    pub fn receipt_timeout(&self) -> Duration {
        Duration::from_secs(self.receipt_timeout_secs)
    }

    pub fn receipt_poll_interval(&self) -> Duration {
        Duration::from_millis(self.receipt_poll_interval_ms)
    }

    /// Chain id from config, falling back to the network default
    pub fn effective_chain_id(&self) -> u64 {
        self.chain_id.unwrap_or_else(|| self.network.chain_id())
    }

    /// Check internal consistency
    pub fn validate(&self) -> LedgerResult<()> {
        if self.rpc.url.trim().is_empty() {
            return Err(LedgerError::Configuration("RPC url is empty".to_string()));
        }
        if self.private_key.is_none() {
            return Err(LedgerError::Configuration("signing key is not set".to_string()));
        }
        for role in ContractRole::ALL {
            if let Some(address) = self.contracts.get(role) {
                if parse_address(address).is_none() {
                    return Err(LedgerError::Configuration(format!(
                        "{} contract address {} is malformed",
                        role, address
                    )));
                }
            }
        }
        let gas = &self.gas;
        if gas.min_price == 0 || gas.min_price > gas.max_price || gas.max_price > gas.emergency_ceiling {
            return Err(LedgerError::Configuration(format!(
                "gas bounds must satisfy 0 < min <= max <= ceiling (got {} / {} / {})",
                gas.min_price, gas.max_price, gas.emergency_ceiling
            )));
        }
        if gas.escalation_factor < 1.0 {
            return Err(LedgerError::Configuration(
                "gas escalation factor must be >= 1".to_string(),
            ));
        }
        if self.monitor.max_block_range == 0 {
            return Err(LedgerError::Configuration(
                "max_block_range must be positive".to_string(),
            ));
        }
        if self.monitor.channel_capacity == 0 {
            return Err(LedgerError::Configuration(
                "event channel capacity must be positive".to_string(),
            ));
        }
        if self.storage.backend == StorageBackend::Sled && self.storage.path.is_none() {
            return Err(LedgerError::Configuration(
                "sled storage requires a path".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|s| s.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_defaults() {
        let network = LedgerNetwork::default();
        assert_eq!(network, LedgerNetwork::Sepolia);
        assert_eq!(network.chain_id(), 11_155_111);
        assert_eq!(LedgerNetwork::from_str("MAINNET"), Some(LedgerNetwork::Mainnet));
        assert_eq!(LedgerNetwork::from_str("bogus"), None);
    }

    #[test]
    fn test_rpc_url_derivation() {
        assert_eq!(
            LedgerNetwork::Sepolia.rpc_url(Some("abc123")),
            "https://sepolia.infura.io/v3/abc123"
        );
        assert_eq!(LedgerNetwork::Sepolia.rpc_url(None), PUBLIC_SEPOLIA_RPC);
        assert_eq!(LedgerNetwork::Sepolia.rpc_url(Some("")), PUBLIC_SEPOLIA_RPC);
        assert_eq!(LedgerNetwork::Local.rpc_url(Some("abc")), "http://127.0.0.1:8545");
    }

    #[test]
    fn test_development_config_is_valid() {
        let config = EngineConfig::development();
        config.validate().unwrap();
        assert_eq!(config.effective_chain_id(), 31_337);
        assert!(config.contracts.get(ContractRole::Reviews).is_some());
    }

    #[test]
    fn test_validate_rejects_bad_gas_bounds() {
        let mut config = EngineConfig::development();
        config.gas.min_price = 200 * GWEI;
        assert!(matches!(config.validate(), Err(LedgerError::Configuration(_))));
    }

    #[test]
    fn test_validate_rejects_malformed_contract() {
        let mut config = EngineConfig::development();
        config.contracts.loyalty = Some("0x1234".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_contract_is_unset() {
        let contracts = ContractAddresses {
            booking: Some(String::new()),
            ..ContractAddresses::default()
        };
        assert_eq!(contracts.get(ContractRole::Booking), None);
    }

    #[test]
    fn test_signing_key_is_redacted() {
        let key = SigningKey::new("0xdeadbeef");
        assert_eq!(format!("{:?}", key), "SigningKey(***)");
        assert_eq!(key.expose(), "deadbeef");
    }
}
