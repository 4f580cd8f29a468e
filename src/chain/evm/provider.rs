//! EVM provider with multi-RPC support and automatic failover

use crate::config::{EvmConfig, GasPriceStrategy};
use crate::error::{RelayerError, RelayerResult};
use crate::swap::Chain;

use ethers::prelude::*;
use ethers::providers::{Http, Provider};
use ethers::types::transaction::eip2718::TypedTransaction;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Multi-provider wrapper with automatic failover
pub struct EvmProvider {
    config: EvmConfig,
    /// HTTP providers (multiple for failover)
    http_providers: Vec<Provider<Http>>,
    /// Current active provider index
    current_provider: AtomicUsize,
    htlc_address: Address,
}

impl EvmProvider {
    /// Create a new provider over every configured RPC URL
    pub fn new(config: EvmConfig) -> RelayerResult<Self> {
        let mut http_providers = Vec::new();

        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    http_providers.push(provider.interval(Duration::from_millis(100)));
                    debug!("Added HTTP provider for {}: {}", config.name, url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if http_providers.is_empty() {
            return Err(RelayerError::ChainConnection {
                chain: Chain::Evm,
                message: "No valid RPC providers".to_string(),
            });
        }

        let htlc_address: Address = config
            .htlc_address
            .parse()
            .map_err(|e| RelayerError::Config(format!("Invalid HTLC address: {}", e)))?;

        Ok(Self {
            config,
            http_providers,
            current_provider: AtomicUsize::new(0),
            htlc_address,
        })
    }

    /// Get the active HTTP provider
    pub fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    /// Switch to next available provider
    pub fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!("{} failover to provider {}", self.config.name, next);
    }

    fn connection_error(&self, message: impl Into<String>) -> RelayerError {
        RelayerError::ChainConnection {
            chain: Chain::Evm,
            message: message.into(),
        }
    }

    /// Get current block number with failover
    pub async fn get_block_number(&self) -> RelayerResult<u64> {
        for _ in 0..self.http_providers.len() {
            match self.http().get_block_number().await {
                Ok(block) => return Ok(block.as_u64()),
                Err(e) => {
                    warn!("Failed to get block number from {}: {}", self.config.name, e);
                    self.failover();
                }
            }
        }

        Err(self.connection_error("All providers failed"))
    }

    /// Timestamp of a block, seconds since epoch
    pub async fn get_block_timestamp(&self, block_number: u64) -> RelayerResult<u64> {
        let block = self
            .http()
            .get_block(block_number)
            .await
            .map_err(|e| self.connection_error(e.to_string()))?
            .ok_or_else(|| self.connection_error(format!("block {} not found", block_number)))?;

        Ok(block.timestamp.as_u64())
    }

    /// Get transaction receipt
    pub async fn get_transaction_receipt(
        &self,
        tx_hash: H256,
    ) -> RelayerResult<Option<TransactionReceipt>> {
        self.http()
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(|e| self.connection_error(e.to_string()))
    }

    /// Get logs for a filter
    pub async fn get_logs(&self, filter: &Filter) -> RelayerResult<Vec<Log>> {
        for _ in 0..self.http_providers.len() {
            match self.http().get_logs(filter).await {
                Ok(logs) => return Ok(logs),
                Err(e) => {
                    warn!("Failed to get logs from {}: {}", self.config.name, e);
                    self.failover();
                }
            }
        }

        Err(self.connection_error("All providers failed to get logs"))
    }

    /// Estimate gas for a transaction; reverts surface here with their reason
    pub async fn estimate_gas(&self, tx: &TypedTransaction) -> RelayerResult<U256> {
        self.http()
            .estimate_gas(tx, None)
            .await
            .map_err(|e| RelayerError::GasEstimation(e.to_string()))
    }

    /// Get current gas price based on the configured strategy
    pub async fn get_gas_price(&self) -> RelayerResult<GasPrice> {
        match self.config.gas_price_strategy {
            GasPriceStrategy::Legacy => {
                let price = self
                    .http()
                    .get_gas_price()
                    .await
                    .map_err(|e| RelayerError::GasEstimation(e.to_string()))?;
                Ok(GasPrice::Legacy(std::cmp::min(price, self.max_gas_price())))
            }
            GasPriceStrategy::Eip1559 => {
                let (max_fee, priority_fee) = self.estimate_eip1559_fees().await?;
                Ok(GasPrice::Eip1559 {
                    max_fee_per_gas: max_fee,
                    max_priority_fee_per_gas: priority_fee,
                })
            }
        }
    }

    fn max_gas_price(&self) -> U256 {
        U256::from(self.config.max_gas_price_gwei) * U256::from(1_000_000_000u64)
    }

    /// Estimate EIP-1559 fees
    async fn estimate_eip1559_fees(&self) -> RelayerResult<(U256, U256)> {
        let block = self
            .http()
            .get_block(BlockNumber::Latest)
            .await
            .map_err(|e| RelayerError::GasEstimation(e.to_string()))?
            .ok_or_else(|| RelayerError::GasEstimation("No latest block".to_string()))?;

        let base_fee = block
            .base_fee_per_gas
            .ok_or_else(|| RelayerError::GasEstimation("No base fee in block".to_string()))?;

        let priority_fee = U256::from(2_000_000_000u64); // 2 gwei

        // Max fee = 2 * base_fee + priority_fee
        let max_fee = base_fee * 2 + priority_fee;
        let max_fee = std::cmp::min(max_fee, self.max_gas_price());

        Ok((max_fee, std::cmp::min(priority_fee, max_fee)))
    }

    /// Health check
    pub async fn health_check(&self) -> bool {
        match self.get_block_number().await {
            Ok(_) => true,
            Err(e) => {
                error!("Health check failed for {}: {}", self.config.name, e);
                false
            }
        }
    }

    pub fn chain_id(&self) -> u64 {
        self.config.chain_id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn htlc_address(&self) -> Address {
        self.htlc_address
    }

    pub fn confirmation_blocks(&self) -> u64 {
        self.config.confirmation_blocks
    }
}

/// Gas price types
#[derive(Debug, Clone, PartialEq)]
pub enum GasPrice {
    Legacy(U256),
    Eip1559 {
        max_fee_per_gas: U256,
        max_priority_fee_per_gas: U256,
    },
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn evm_config(rpc_urls: Vec<String>) -> EvmConfig {
        EvmConfig {
            chain_id: 31337,
            name: "anvil".into(),
            rpc_urls,
            htlc_address: "0x5FbDB2315678afecb367f032d93F642f64180aa3".into(),
            confirmation_blocks: 2,
            poll_interval_ms: 1000,
            max_block_range: 500,
            start_block: 0,
            gas_price_strategy: GasPriceStrategy::Legacy,
            max_gas_price_gwei: 100,
            private_key_env: "EVM_RELAYER_KEY".into(),
        }
    }

    #[test]
    fn test_new_rejects_empty_rpc_list() {
        let err = EvmProvider::new(evm_config(Vec::new())).err().unwrap();
        assert!(matches!(err, RelayerError::ChainConnection { .. }));
    }

    #[test]
    fn test_failover_rotates_providers() {
        let provider = EvmProvider::new(evm_config(vec![
            "http://127.0.0.1:8545".into(),
            "http://127.0.0.1:8546".into(),
        ]))
        .unwrap();

        assert_eq!(provider.current_provider.load(Ordering::Relaxed), 0);
        provider.failover();
        assert_eq!(provider.current_provider.load(Ordering::Relaxed), 1);
        provider.failover();
        assert_eq!(provider.current_provider.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_invalid_htlc_address_is_config_error() {
        let mut config = evm_config(vec!["http://127.0.0.1:8545".into()]);
        config.htlc_address = "not-an-address".into();
        let err = EvmProvider::new(config).err().unwrap();
        assert!(matches!(err, RelayerError::Config(_)));
    }
}
