//! Confirmation tracking for submitted EVM transactions

use super::EvmProvider;
use crate::error::{RelayerError, RelayerResult};

use ethers::types::{TransactionReceipt, H256, U64};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Outcome of waiting on a transaction
#[derive(Debug, Clone, PartialEq)]
pub enum Confirmation {
    /// Mined, succeeded, and buried under enough blocks
    Confirmed(TransactionReceipt),
    /// Mined but reverted
    Reverted(TransactionReceipt),
}

/// Waits for transactions to reach the configured confirmation depth
pub struct ConfirmationTracker {
    provider: Arc<EvmProvider>,
    confirmation_blocks: u64,
    poll_interval: Duration,
}

impl ConfirmationTracker {
    pub fn new(provider: Arc<EvmProvider>, poll_interval: Duration) -> Self {
        let confirmation_blocks = provider.confirmation_blocks();
        Self {
            provider,
            confirmation_blocks,
            poll_interval,
        }
    }

    /// Poll until `tx_hash` is confirmed or `timeout` elapses.
    ///
    /// A receipt that disappears after being seen is a reorg; waiting
    /// continues in case the transaction is re-included.
    pub async fn wait(&self, tx_hash: H256, timeout: Duration) -> RelayerResult<Confirmation> {
        let deadline = Instant::now() + timeout;
        let mut seen_in: Option<u64> = None;

        loop {
            if let Some(receipt) = self.provider.get_transaction_receipt(tx_hash).await? {
                if receipt.status == Some(U64::zero()) {
                    warn!("Transaction {:?} reverted", tx_hash);
                    return Ok(Confirmation::Reverted(receipt));
                }

                if let Some(block) = receipt.block_number.map(|b| b.as_u64()) {
                    seen_in = Some(block);
                    let head = self.provider.get_block_number().await?;
                    let confirmations = confirmations(block, head);

                    if confirmations >= self.confirmation_blocks {
                        info!(
                            "Transaction {:?} confirmed on {} ({} confirmations)",
                            tx_hash,
                            self.provider.name(),
                            confirmations
                        );
                        return Ok(Confirmation::Confirmed(receipt));
                    }

                    debug!(
                        "Transaction {:?} has {} / {} confirmations",
                        tx_hash, confirmations, self.confirmation_blocks
                    );
                }
            } else if let Some(block) = seen_in.take() {
                warn!(
                    "Reorg detected: tx {:?} no longer included (was in block {})",
                    tx_hash, block
                );
            }

            if Instant::now() + self.poll_interval > deadline {
                return Err(RelayerError::Timeout {
                    operation: format!("confirmation of {:?}", tx_hash),
                });
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

/// Blocks mined on top of and including `tx_block`
pub fn confirmations(tx_block: u64, head: u64) -> u64 {
    if head < tx_block {
        0
    } else {
        head - tx_block + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confirmations_count_inclusion_block() {
        assert_eq!(confirmations(100, 100), 1);
        assert_eq!(confirmations(100, 111), 12);
        assert_eq!(confirmations(100, 99), 0);
    }
}
