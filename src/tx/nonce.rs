//! Nonce management for reliable transaction submission
//!
//! Handles:
//! - Local nonce tracking so concurrent swaps never reuse a nonce
//! - Re-syncing with the chain after "nonce too low"
//! - Releasing nonces of transactions that were never broadcast

use crate::chain::evm::EvmProvider;
use crate::error::{RelayerError, RelayerResult};
use crate::swap::Chain;

use ethers::prelude::*;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Local view of the relayer account's nonces
#[derive(Debug, Default)]
struct NonceState {
    /// Next nonce to hand out
    current: u64,
    /// Broadcast but not yet confirmed: nonce -> tx hash
    pending: HashMap<u64, H256>,
}

impl NonceState {
    fn allocate(&mut self) -> u64 {
        let nonce = self.current;
        self.current += 1;
        nonce
    }

    fn release(&mut self, nonce: u64) {
        self.pending.remove(&nonce);
        // Only the most recent nonce can be handed out again without a gap
        if nonce + 1 == self.current {
            self.current = nonce;
        }
    }

    fn apply_chain_nonce(&mut self, on_chain: u64) {
        self.pending.retain(|nonce, _| *nonce >= on_chain);
        if self.current < on_chain {
            self.current = on_chain;
        }
    }
}

/// Manages nonces for the relayer's EVM account
pub struct NonceManager {
    wallet_address: Address,
    state: Mutex<Option<NonceState>>,
}

impl NonceManager {
    pub fn new(wallet_address: Address) -> Self {
        Self {
            wallet_address,
            state: Mutex::new(None),
        }
    }

    /// Get the next nonce, fetching the account nonce on first use
    pub async fn next(&self, provider: &EvmProvider) -> RelayerResult<u64> {
        let mut guard = self.state.lock().await;
        if guard.is_none() {
            let on_chain = self.fetch_nonce(provider).await?;
            *guard = Some(NonceState {
                current: on_chain,
                pending: HashMap::new(),
            });
            debug!("Initialized nonce for {}: {}", provider.name(), on_chain);
        }

        let state = guard.get_or_insert_with(NonceState::default);
        let nonce = state.allocate();
        debug!("Allocated nonce {}", nonce);
        Ok(nonce)
    }

    /// Mark a nonce as broadcast
    pub async fn mark_pending(&self, nonce: u64, tx_hash: H256) {
        if let Some(state) = self.state.lock().await.as_mut() {
            state.pending.insert(nonce, tx_hash);
        }
    }

    /// Transaction mined
    pub async fn confirm(&self, nonce: u64) {
        if let Some(state) = self.state.lock().await.as_mut() {
            state.pending.remove(&nonce);
        }
    }

    /// Transaction never reached the mempool; the nonce may be reused
    pub async fn release(&self, nonce: u64) {
        if let Some(state) = self.state.lock().await.as_mut() {
            state.release(nonce);
        }
    }

    /// Sync with on-chain state
    pub async fn sync(&self, provider: &EvmProvider) -> RelayerResult<()> {
        let on_chain = self.fetch_nonce(provider).await?;
        let mut guard = self.state.lock().await;
        let state = guard.get_or_insert_with(NonceState::default);

        if on_chain > state.current {
            warn!(
                "Nonce gap on {}: local {}, chain {}",
                provider.name(),
                state.current,
                on_chain
            );
        }
        state.apply_chain_nonce(on_chain);
        Ok(())
    }

    async fn fetch_nonce(&self, provider: &EvmProvider) -> RelayerResult<u64> {
        let nonce = provider
            .http()
            .get_transaction_count(self.wallet_address, Some(BlockNumber::Pending.into()))
            .await
            .map_err(|e| RelayerError::Nonce {
                chain: Chain::Evm,
                message: e.to_string(),
            })?;

        Ok(nonce.as_u64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_is_sequential() {
        let mut state = NonceState {
            current: 7,
            ..Default::default()
        };
        assert_eq!(state.allocate(), 7);
        assert_eq!(state.allocate(), 8);
        assert_eq!(state.current, 9);
    }

    #[test]
    fn test_release_only_rewinds_latest_nonce() {
        let mut state = NonceState {
            current: 5,
            ..Default::default()
        };
        let a = state.allocate();
        let b = state.allocate();

        state.release(a);
        assert_eq!(state.current, 7);

        state.release(b);
        assert_eq!(state.current, 6);
    }

    #[test]
    fn test_chain_nonce_clears_mined_pending() {
        let mut state = NonceState {
            current: 10,
            ..Default::default()
        };
        state.pending.insert(8, H256::zero());
        state.pending.insert(9, H256::zero());

        state.apply_chain_nonce(9);
        assert_eq!(state.pending.len(), 1);
        assert_eq!(state.current, 10);

        state.apply_chain_nonce(12);
        assert!(state.pending.is_empty());
        assert_eq!(state.current, 12);
    }
}
