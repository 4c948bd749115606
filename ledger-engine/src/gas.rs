//! Gas pricing and limits
//!
//! Prices follow the network but stay inside configured bounds. Escalation
//! after underpriced rejections may exceed the normal ceiling up to the
//! emergency ceiling, never beyond.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::config::GasConfig;
use crate::error::LedgerResult;
use crate::rpc::LedgerRpc;
use crate::types::{format_ether, OperationKind};

/// Static gas limit per operation, before headroom
pub fn base_gas_limit(kind: OperationKind) -> u64 {
    match kind {
        OperationKind::MintCertificate => 300_000,
        OperationKind::EarnPoints => 120_000,
        OperationKind::RedeemPoints => 150_000,
        OperationKind::VerifyBooking => 200_000,
        OperationKind::VerifyReview => 150_000,
    }
}

/// Cost estimate for one operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GasCostEstimate {
    pub operation: OperationKind,
    pub gas_limit: u64,
    /// Wei per gas
    pub gas_price: u64,
    pub total_cost_wei: u128,
    /// Decimal ether string
    pub total_cost_eth: String,
}

/// Gas price and limit policy
pub struct GasPolicy {
    rpc: Arc<dyn LedgerRpc>,
    config: GasConfig,
}

impl GasPolicy {
    pub fn new(rpc: Arc<dyn LedgerRpc>, config: GasConfig) -> Self {
        Self { rpc, config }
    }

    pub fn config(&self) -> &GasConfig {
        &self.config
    }

    /// Current price: network suggestion plus premium, clamped
    pub async fn price(&self) -> LedgerResult<u64> {
        let network = self.rpc.gas_price().await?;
        let price = self.quote(network);
        debug!("Gas price quote: network={} quoted={}", network, price);
        Ok(price)
    }

    /// Apply premium and bounds to a network price
    pub fn quote(&self, network_price: u64) -> u64 {
        let with_premium =
            network_price as u128 * (100 + self.config.premium_percent) as u128 / 100;
        let clamped = with_premium
            .max(self.config.min_price as u128)
            .min(self.config.max_price as u128);
        clamped as u64
    }

    /// Gas limit with headroom
    pub fn limit(&self, kind: OperationKind) -> u64 {
        base_gas_limit(kind) * (100 + self.config.limit_headroom_percent) / 100
    }

    /// One escalation step from `previous`, capped at the emergency ceiling
    pub fn escalate(&self, previous: u64, factor: f64) -> u64 {
        let next = (previous as f64 * factor).round();
        if next >= self.config.emergency_ceiling as f64 {
            self.config.emergency_ceiling
        } else {
            next as u64
        }
    }

    /// Price after `k` underpriced rejections: `min(base * factor^k, ceiling)`
    pub fn escalated(&self, base: u64, k: u32) -> u64 {
        let start = base.min(self.config.emergency_ceiling);
        (0..k).fold(start, |price, _| {
            self.escalate(price, self.config.escalation_factor)
        })
    }

    /// Estimated cost of `kind` at the current price
    pub async fn estimate_cost(&self, kind: OperationKind) -> LedgerResult<GasCostEstimate> {
        let gas_price = self.price().await?;
        let gas_limit = self.limit(kind);
        let total_cost_wei = gas_price as u128 * gas_limit as u128;
        Ok(GasCostEstimate {
            operation: kind,
            gas_limit,
            gas_price,
            total_cost_wei,
            total_cost_eth: format_ether(total_cost_wei),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LedgerError;
    use crate::rpc::{LogQuery, ReceiptInfo};
    use crate::types::{LogEntry, GWEI};
    use async_trait::async_trait;
    use ethers::types::{Address, U256};

    struct FixedPrice(u64);

    #[async_trait]
    impl LedgerRpc for FixedPrice {
        async fn chain_id(&self) -> LedgerResult<u64> {
            Ok(31_337)
        }
        async fn block_number(&self) -> LedgerResult<u64> {
            Ok(0)
        }
        async fn gas_price(&self) -> LedgerResult<u64> {
            Ok(self.0)
        }
        async fn pending_nonce(&self, _address: Address) -> LedgerResult<u64> {
            Ok(0)
        }
        async fn balance(&self, _address: Address) -> LedgerResult<U256> {
            Ok(U256::zero())
        }
        async fn send_raw_transaction(&self, _raw: Vec<u8>) -> LedgerResult<String> {
            Err(LedgerError::RpcRequest("unused".to_string()))
        }
        async fn transaction_receipt(&self, _tx_hash: &str) -> LedgerResult<Option<ReceiptInfo>> {
            Ok(None)
        }
        async fn logs(&self, _query: &LogQuery) -> LedgerResult<Vec<LogEntry>> {
            Ok(Vec::new())
        }
        async fn call_contract(&self, _to: Address, _data: Vec<u8>) -> LedgerResult<Vec<u8>> {
            Ok(Vec::new())
        }
    }

    fn policy(network_price: u64) -> GasPolicy {
        GasPolicy::new(Arc::new(FixedPrice(network_price)), GasConfig::default())
    }

    #[tokio::test]
    async fn test_price_adds_premium() {
        assert_eq!(policy(20 * GWEI).price().await.unwrap(), 22 * GWEI);
    }

    #[tokio::test]
    async fn test_price_is_clamped() {
        assert_eq!(policy(GWEI).price().await.unwrap(), 5 * GWEI);
        assert_eq!(policy(500 * GWEI).price().await.unwrap(), 100 * GWEI);
    }

    #[test]
    fn test_limit_has_headroom() {
        let gas = policy(GWEI);
        assert_eq!(gas.limit(OperationKind::MintCertificate), 360_000);
        assert_eq!(gas.limit(OperationKind::EarnPoints), 144_000);
        assert_eq!(gas.limit(OperationKind::RedeemPoints), 180_000);
        assert_eq!(gas.limit(OperationKind::VerifyBooking), 240_000);
        assert_eq!(gas.limit(OperationKind::VerifyReview), 180_000);
    }

    #[test]
    fn test_escalation_follows_closed_form() {
        let gas = policy(GWEI);
        let base = 20 * GWEI;
        assert_eq!(gas.escalated(base, 0), base);
        assert_eq!(gas.escalated(base, 1), 30 * GWEI);
        assert_eq!(gas.escalated(base, 2), 45 * GWEI);
        assert_eq!(gas.escalated(base, 3), 67_500_000_000);
        assert_eq!(gas.escalated(base, 5), 151_875_000_000);
        assert_eq!(gas.escalated(base, 6), 200 * GWEI);
        assert_eq!(gas.escalated(base, 40), 200 * GWEI);
    }

    #[test]
    fn test_escalate_single_step_is_capped() {
        let gas = policy(GWEI);
        assert_eq!(gas.escalate(40 * GWEI, 1.5), 60 * GWEI);
        assert_eq!(gas.escalate(180 * GWEI, 1.5), 200 * GWEI);
        assert_eq!(gas.escalated(250 * GWEI, 0), 200 * GWEI);
    }

    #[tokio::test]
    async fn test_estimate_cost() {
        let estimate = policy(20 * GWEI)
            .estimate_cost(OperationKind::EarnPoints)
            .await
            .unwrap();
        assert_eq!(estimate.gas_limit, 144_000);
        assert_eq!(estimate.gas_price, 22 * GWEI);
        assert_eq!(estimate.total_cost_wei, 144_000u128 * 22 * GWEI as u128);
        assert_eq!(estimate.total_cost_eth, "0.003168");
    }
}
