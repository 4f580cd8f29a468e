//! Chain module - HTLC adapters and event watchers for both chains
//!
//! This module provides:
//! - The [`HtlcAdapter`] seam the coordinator drives
//! - EVM and Aptos implementations of it
//! - Polling watchers that feed normalized events into the coordinator queue
//! - Health monitoring across both chains

pub mod aptos;
pub mod evm;

use crate::error::{ChainError, RelayerResult};
use crate::swap::{Amount, Chain, Hashlock, Preimage};

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Parameters for locking a new HTLC leg
#[derive(Debug, Clone, PartialEq)]
pub struct HtlcParams {
    pub receiver: String,
    pub hashlock: Hashlock,
    /// Expiry, seconds since epoch
    pub timelock: u64,
    pub token: String,
    pub amount: Amount,
}

/// Result of a confirmed `create_htlc`
#[derive(Debug, Clone, PartialEq)]
pub struct HtlcReceipt {
    pub contract_id: String,
    pub tx_hash: String,
}

/// Result of a confirmed withdraw or refund
#[derive(Debug, Clone, PartialEq)]
pub struct TxReceipt {
    pub tx_hash: String,
    pub block_number: Option<u64>,
}

/// On-chain state of one HTLC
#[derive(Debug, Clone, PartialEq)]
pub enum HtlcState {
    Locked,
    /// The preimage is `None` only when the contract does not store it
    Withdrawn { preimage: Option<Preimage> },
    Refunded,
    Missing,
}

/// Actions the coordinator can take on one chain's HTLC contract.
///
/// Every call returns only after the transaction is confirmed or has failed;
/// an unconfirmed submission surfaces as [`ChainError::Transient`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HtlcAdapter: Send + Sync {
    fn chain(&self) -> Chain;

    /// Account the relayer signs with on this chain
    fn relayer_address(&self) -> String;

    async fn create_htlc(&self, params: &HtlcParams) -> Result<HtlcReceipt, ChainError>;

    async fn withdraw(&self, contract_id: &str, preimage: &Preimage)
        -> Result<TxReceipt, ChainError>;

    async fn refund(&self, contract_id: &str) -> Result<TxReceipt, ChainError>;

    async fn get_htlc_state(&self, contract_id: &str) -> Result<HtlcState, ChainError>;

    async fn health_check(&self) -> bool;
}

/// One adapter per chain
#[derive(Clone)]
pub struct ChainAdapters {
    evm: Arc<dyn HtlcAdapter>,
    aptos: Arc<dyn HtlcAdapter>,
}

impl ChainAdapters {
    pub fn new(evm: Arc<dyn HtlcAdapter>, aptos: Arc<dyn HtlcAdapter>) -> Self {
        Self { evm, aptos }
    }

    pub fn get(&self, chain: Chain) -> &Arc<dyn HtlcAdapter> {
        match chain {
            Chain::Evm => &self.evm,
            Chain::Aptos => &self.aptos,
        }
    }
}

/// A source of normalized HTLC events
#[async_trait]
pub trait ChainWatcher: Send + Sync {
    fn chain(&self) -> Chain;

    fn poll_interval(&self) -> Duration;

    /// Fetch, forward and checkpoint whatever is new; returns events forwarded
    async fn poll_once(&self) -> RelayerResult<usize>;
}

/// Drive a watcher until shutdown
pub async fn run_watcher(watcher: Arc<dyn ChainWatcher>, mut shutdown: watch::Receiver<bool>) {
    let chain = watcher.chain();
    info!("Watcher for {} started", chain);

    loop {
        if *shutdown.borrow() {
            break;
        }

        let delay = match watcher.poll_once().await {
            Ok(0) => watcher.poll_interval(),
            Ok(n) => {
                debug!("{} watcher forwarded {} events", chain, n);
                // More may be waiting behind the range limit
                Duration::ZERO
            }
            Err(e) => {
                error!("Watcher error for {}: {}", chain, e);
                // Back off before retrying
                watcher.poll_interval() * 5
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => {}
        }
    }

    info!("Watcher for {} stopped", chain);
}

/// Owns the adapters and watchers of both chains
pub struct ChainManager {
    adapters: ChainAdapters,
    watchers: Vec<Arc<dyn ChainWatcher>>,
}

impl ChainManager {
    pub fn new(adapters: ChainAdapters, watchers: Vec<Arc<dyn ChainWatcher>>) -> Self {
        Self { adapters, watchers }
    }

    pub fn adapters(&self) -> &ChainAdapters {
        &self.adapters
    }

    /// Spawn one task per watcher
    pub fn start_watchers(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        self.watchers
            .iter()
            .map(|watcher| tokio::spawn(run_watcher(watcher.clone(), shutdown.clone())))
            .collect()
    }

    /// Health check for both chains
    pub async fn health_check(&self) -> Vec<(Chain, bool)> {
        let mut results = Vec::new();

        for chain in [Chain::Evm, Chain::Aptos] {
            let healthy = self.adapters.get(chain).health_check().await;
            crate::metrics::record_chain_health(chain, healthy);
            results.push((chain, healthy));
        }

        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingWatcher {
        polls: AtomicUsize,
    }

    #[async_trait]
    impl ChainWatcher for CountingWatcher {
        fn chain(&self) -> Chain {
            Chain::Aptos
        }

        fn poll_interval(&self) -> Duration {
            Duration::from_millis(5)
        }

        async fn poll_once(&self) -> RelayerResult<usize> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_watcher_stops_on_shutdown() {
        let watcher = Arc::new(CountingWatcher {
            polls: AtomicUsize::new(0),
        });
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(run_watcher(watcher.clone(), rx));

        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();

        assert!(watcher.polls.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_health_check_reports_each_chain() {
        let mut evm = MockHtlcAdapter::new();
        evm.expect_health_check().returning(|| true);
        let mut aptos = MockHtlcAdapter::new();
        aptos.expect_health_check().returning(|| false);

        let manager = ChainManager::new(
            ChainAdapters::new(Arc::new(evm), Arc::new(aptos)),
            Vec::new(),
        );
        let results = manager.health_check().await;
        assert_eq!(results, vec![(Chain::Evm, true), (Chain::Aptos, false)]);
    }
}
