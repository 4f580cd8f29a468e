//! Gas estimation with safety buffers

use crate::chain::evm::{EvmProvider, GasPrice};
use crate::error::RelayerResult;

use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::U256;
use tracing::debug;

/// Gas estimator for HTLC transactions
pub struct GasEstimator {
    /// Buffer percentage for gas limit (e.g., 20 = 20% buffer)
    gas_limit_buffer_percent: u64,
    /// Buffer percentage for gas price
    gas_price_buffer_percent: u64,
}

impl GasEstimator {
    pub fn new() -> Self {
        Self {
            gas_limit_buffer_percent: 20,
            gas_price_buffer_percent: 10,
        }
    }

    /// Estimate the gas limit for `tx`. A call that would revert fails here
    /// with the revert reason in the error.
    pub async fn estimate_gas_limit(
        &self,
        provider: &EvmProvider,
        tx: &TypedTransaction,
    ) -> RelayerResult<U256> {
        let estimate = provider.estimate_gas(tx).await?;
        Ok(add_percent(estimate, self.gas_limit_buffer_percent))
    }

    /// Get buffered gas price
    pub async fn get_gas_price(&self, provider: &EvmProvider) -> RelayerResult<GasPrice> {
        let gas_price = self.buffer_price(&provider.get_gas_price().await?);
        debug!("Gas price for {}: {:?}", provider.name(), gas_price);
        Ok(gas_price)
    }

    fn buffer_price(&self, gas_price: &GasPrice) -> GasPrice {
        self.speed_up_gas_price(gas_price, 100 + self.gas_price_buffer_percent)
    }

    /// Scale a gas price by `factor` percent, for replacing an underpriced transaction
    pub fn speed_up_gas_price(&self, current: &GasPrice, factor: u64) -> GasPrice {
        match current {
            GasPrice::Legacy(price) => GasPrice::Legacy(*price * factor / 100),
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => GasPrice::Eip1559 {
                max_fee_per_gas: *max_fee_per_gas * factor / 100,
                max_priority_fee_per_gas: *max_priority_fee_per_gas * factor / 100,
            },
        }
    }
}

impl Default for GasEstimator {
    fn default() -> Self {
        Self::new()
    }
}

fn add_percent(value: U256, percent: u64) -> U256 {
    value + value * percent / 100
}
