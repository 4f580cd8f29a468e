//! Transaction sender with retry logic and bounded confirmation waits

use super::gas::GasEstimator;
use super::nonce::NonceManager;
use crate::chain::evm::{Confirmation, ConfirmationTracker, EvmProvider, GasPrice};
use crate::config::RelayerConfig;
use crate::error::{RelayerError, RelayerResult};
use crate::swap::Chain;

use ethers::prelude::*;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{error, info, warn};

const SEND_TIMEOUT: Duration = Duration::from_secs(30);

/// Signs, broadcasts and confirms the relayer's EVM transactions
pub struct TransactionSender {
    provider: Arc<EvmProvider>,
    nonce_manager: NonceManager,
    gas_estimator: GasEstimator,
    confirmations: ConfirmationTracker,
    wallet: LocalWallet,
    max_retries: u32,
    retry_delay: Duration,
    confirmation_timeout: Duration,
}

impl TransactionSender {
    pub fn new(provider: Arc<EvmProvider>, wallet: LocalWallet, config: &RelayerConfig) -> Self {
        let wallet = wallet.with_chain_id(provider.chain_id());
        info!("Transaction sender initialized with wallet: {:?}", wallet.address());

        Self {
            nonce_manager: NonceManager::new(wallet.address()),
            gas_estimator: GasEstimator::new(),
            confirmations: ConfirmationTracker::new(
                provider.clone(),
                Duration::from_millis(config.retry_delay_ms.max(250)),
            ),
            provider,
            wallet,
            max_retries: config.max_retries.max(1),
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            confirmation_timeout: Duration::from_secs(config.confirmation_timeout_secs),
        }
    }

    /// Load the signing key from the environment variable named by `env_name`
    pub fn load_wallet(env_name: &str) -> RelayerResult<LocalWallet> {
        let key = std::env::var(env_name).map_err(|_| {
            RelayerError::Wallet(format!("No wallet configured. Set {}", env_name))
        })?;

        key.trim()
            .parse::<LocalWallet>()
            .map_err(|e| RelayerError::Wallet(format!("Invalid private key: {}", e)))
    }

    pub fn address(&self) -> Address {
        self.wallet.address()
    }

    /// Submit a contract call and wait for it to be confirmed.
    ///
    /// Reverts detected during gas estimation are returned immediately so the
    /// caller can classify the reason; broadcast errors are retried.
    pub async fn send(
        &self,
        to: Address,
        data: Bytes,
        value: U256,
        action: &str,
    ) -> RelayerResult<TransactionReceipt> {
        let result = self.send_inner(to, data, value, action).await;
        crate::metrics::record_chain_tx(Chain::Evm, action, result.is_ok());
        result
    }

    async fn send_inner(
        &self,
        to: Address,
        data: Bytes,
        value: U256,
        action: &str,
    ) -> RelayerResult<TransactionReceipt> {
        let mut replacement_price: Option<GasPrice> = None;
        let mut last_error = None;

        for attempt in 1..=self.max_retries {
            let nonce = self.nonce_manager.next(&self.provider).await?;

            let gas_price = match replacement_price.take() {
                Some(price) => price,
                None => match self.gas_estimator.get_gas_price(&self.provider).await {
                    Ok(price) => price,
                    Err(e) => {
                        self.nonce_manager.release(nonce).await;
                        return Err(e);
                    }
                },
            };

            let mut tx = self.build_tx(to, data.clone(), value, nonce, &gas_price);
            match self.gas_estimator.estimate_gas_limit(&self.provider, &tx).await {
                Ok(limit) => tx.set_gas(limit),
                Err(e) => {
                    self.nonce_manager.release(nonce).await;
                    return Err(e);
                }
            };

            let signature = match self.wallet.sign_transaction(&tx).await {
                Ok(sig) => sig,
                Err(e) => {
                    error!("Failed to sign transaction: {}", e);
                    self.nonce_manager.release(nonce).await;
                    return Err(RelayerError::Wallet(e.to_string()));
                }
            };
            let raw = tx.rlp_signed(&signature);

            let result = timeout(SEND_TIMEOUT, self.provider.http().send_raw_transaction(raw)).await;

            match result {
                Ok(Ok(pending_tx)) => {
                    let tx_hash = pending_tx.tx_hash();
                    info!(
                        "{} sent: {:?} (attempt {}/{})",
                        action, tx_hash, attempt, self.max_retries
                    );
                    self.nonce_manager.mark_pending(nonce, tx_hash).await;
                    return self.await_confirmation(nonce, tx_hash, action).await;
                }
                Ok(Err(e)) => {
                    let error_msg = e.to_string();

                    if error_msg.contains("nonce too low") {
                        warn!("Nonce too low, syncing and retrying");
                        self.nonce_manager.sync(&self.provider).await?;
                    } else if error_msg.contains("replacement transaction underpriced") {
                        warn!("Transaction underpriced, increasing gas");
                        self.nonce_manager.release(nonce).await;
                        replacement_price =
                            Some(self.gas_estimator.speed_up_gas_price(&gas_price, 125));
                    } else if error_msg.contains("insufficient funds") {
                        self.nonce_manager.release(nonce).await;
                        return Err(RelayerError::Transaction(error_msg));
                    } else {
                        self.nonce_manager.release(nonce).await;
                    }

                    last_error = Some(RelayerError::Transaction(error_msg));
                }
                Err(_) => {
                    // The node may still have accepted it; resync instead of reusing
                    warn!("{} send timeout (attempt {})", action, attempt);
                    if let Err(e) = self.nonce_manager.sync(&self.provider).await {
                        warn!("Nonce resync failed: {}", e);
                    }
                    last_error = Some(RelayerError::Timeout {
                        operation: format!("send {}", action),
                    });
                }
            }

            if attempt < self.max_retries {
                tokio::time::sleep(self.retry_delay).await;
            }
        }

        Err(last_error.unwrap_or_else(|| RelayerError::Transaction("Unknown error".to_string())))
    }

    async fn await_confirmation(
        &self,
        nonce: u64,
        tx_hash: H256,
        action: &str,
    ) -> RelayerResult<TransactionReceipt> {
        match self
            .confirmations
            .wait(tx_hash, self.confirmation_timeout)
            .await?
        {
            Confirmation::Confirmed(receipt) => {
                self.nonce_manager.confirm(nonce).await;
                Ok(receipt)
            }
            Confirmation::Reverted(_) => {
                self.nonce_manager.confirm(nonce).await;
                Err(RelayerError::Transaction(format!(
                    "{} reverted in transaction {:?}",
                    action, tx_hash
                )))
            }
        }
    }

    fn build_tx(
        &self,
        to: Address,
        data: Bytes,
        value: U256,
        nonce: u64,
        gas_price: &GasPrice,
    ) -> TypedTransaction {
        let chain_id = self.provider.chain_id();
        match gas_price {
            GasPrice::Legacy(price) => TransactionRequest::new()
                .from(self.wallet.address())
                .to(to)
                .data(data)
                .value(value)
                .nonce(nonce)
                .gas_price(*price)
                .chain_id(chain_id)
                .into(),
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => Eip1559TransactionRequest::new()
                .from(self.wallet.address())
                .to(to)
                .data(data)
                .value(value)
                .nonce(nonce)
                .max_fee_per_gas(*max_fee_per_gas)
                .max_priority_fee_per_gas(*max_priority_fee_per_gas)
                .chain_id(chain_id)
                .into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::evm::provider::tests::evm_config;

    const ANVIL_KEY: &str = "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    fn relayer_config() -> RelayerConfig {
        RelayerConfig {
            instance_id: "test".into(),
            sweep_interval_secs: 600,
            retry_interval_secs: 60,
            confirmation_timeout_secs: 5,
            max_retries: 3,
            retry_delay_ms: 10,
            timelock_safety_margin_secs: 600,
            min_timelock_window_secs: 300,
            event_queue_capacity: 16,
            health_check_interval_secs: 30,
        }
    }

    fn sender() -> TransactionSender {
        let provider =
            Arc::new(EvmProvider::new(evm_config(vec!["http://127.0.0.1:8545".into()])).unwrap());
        TransactionSender::new(provider, ANVIL_KEY.parse().unwrap(), &relayer_config())
    }

    #[test]
    fn test_load_wallet_from_env() {
        std::env::set_var("HTLC_TEST_EVM_KEY", format!(" {} ", ANVIL_KEY));
        let wallet = TransactionSender::load_wallet("HTLC_TEST_EVM_KEY").unwrap();
        assert_eq!(
            format!("{:?}", wallet.address()),
            "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266"
        );
        assert!(TransactionSender::load_wallet("HTLC_TEST_MISSING_KEY").is_err());
    }

    #[test]
    fn test_build_tx_matches_gas_strategy() {
        let sender = sender();
        let to = Address::repeat_byte(0x42);

        let legacy = sender.build_tx(to, Bytes::new(), U256::zero(), 3, &GasPrice::Legacy(U256::from(7)));
        assert!(matches!(legacy, TypedTransaction::Legacy(_)));
        assert_eq!(legacy.nonce(), Some(&U256::from(3)));
        assert_eq!(legacy.from(), Some(&sender.address()));

        let eip1559 = sender.build_tx(
            to,
            Bytes::new(),
            U256::from(1),
            4,
            &GasPrice::Eip1559 {
                max_fee_per_gas: U256::from(10),
                max_priority_fee_per_gas: U256::from(1),
            },
        );
        assert!(matches!(eip1559, TypedTransaction::Eip1559(_)));
        assert_eq!(eip1559.value(), Some(&U256::from(1)));
    }
}
