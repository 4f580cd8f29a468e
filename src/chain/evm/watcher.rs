//! EVM log watcher with checkpointed HTTP polling

use super::contract::{decode_htlc_log, event_signatures};
use super::EvmProvider;
use crate::chain::ChainWatcher;
use crate::config::EvmConfig;
use crate::error::{RelayerError, RelayerResult};
use crate::events::HtlcEvent;
use crate::state::SwapStore;
use crate::swap::Chain;

use async_trait::async_trait;
use ethers::types::Filter;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Polls HTLC contract logs and forwards them to the coordinator
pub struct EvmWatcher {
    provider: Arc<EvmProvider>,
    store: Arc<dyn SwapStore>,
    events: mpsc::Sender<HtlcEvent>,
    stream: String,
    max_block_range: u64,
    start_block: u64,
    poll_interval: Duration,
}

impl EvmWatcher {
    pub fn new(
        config: &EvmConfig,
        provider: Arc<EvmProvider>,
        store: Arc<dyn SwapStore>,
        events: mpsc::Sender<HtlcEvent>,
    ) -> Self {
        Self {
            provider,
            store,
            events,
            stream: format!("evm:{}:logs", config.chain_id),
            max_block_range: config.max_block_range.max(1),
            start_block: config.start_block,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
        }
    }

    /// Inclusive block range to scan next, if any
    fn next_range(&self, checkpoint: Option<u64>, safe_head: u64) -> Option<(u64, u64)> {
        let from = checkpoint.map(|c| c + 1).unwrap_or(self.start_block);
        if from > safe_head {
            return None;
        }
        let to = std::cmp::min(safe_head, from + self.max_block_range - 1);
        Some((from, to))
    }
}

#[async_trait]
impl ChainWatcher for EvmWatcher {
    fn chain(&self) -> Chain {
        Chain::Evm
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    async fn poll_once(&self) -> RelayerResult<usize> {
        let head = self.provider.get_block_number().await?;
        // Only logs buried under enough blocks are forwarded
        let safe_head = head.saturating_sub(self.provider.confirmation_blocks());

        let checkpoint = self.store.get_checkpoint(&self.stream).await?;
        let Some((from_block, to_block)) = self.next_range(checkpoint, safe_head) else {
            return Ok(0);
        };

        debug!(
            "{}: Processing blocks {} to {}",
            self.provider.name(),
            from_block,
            to_block
        );

        let filter = Filter::new()
            .address(self.provider.htlc_address())
            .topic0(event_signatures())
            .from_block(from_block)
            .to_block(to_block);

        let logs = self.provider.get_logs(&filter).await?;

        let mut timestamps: HashMap<u64, u64> = HashMap::new();
        let mut forwarded = 0;
        for log in logs {
            let block_number = log.block_number.map(|b| b.as_u64()).unwrap_or_default();
            let timestamp = match timestamps.get(&block_number) {
                Some(ts) => *ts,
                None => {
                    let ts = self.provider.get_block_timestamp(block_number).await?;
                    timestamps.insert(block_number, ts);
                    ts
                }
            };

            match decode_htlc_log(&log, timestamp) {
                Ok(Some(event)) => {
                    crate::metrics::record_event(Chain::Evm, event.name());
                    self.events
                        .send(event)
                        .await
                        .map_err(|_| RelayerError::Internal("event queue closed".to_string()))?;
                    forwarded += 1;
                }
                Ok(None) => debug!("Skipping unrecognized log in block {}", block_number),
                Err(e) => warn!("Failed to decode log in block {}: {}", block_number, e),
            }
        }

        // Checkpoint only after every event in the range is queued
        self.store.save_checkpoint(&self.stream, to_block).await?;
        crate::metrics::record_checkpoint(Chain::Evm, to_block);

        Ok(forwarded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::evm::provider::tests::evm_config;
    use crate::state::InMemorySwapStore;

    fn watcher(start_block: u64, max_block_range: u64) -> EvmWatcher {
        let mut config = evm_config(vec!["http://127.0.0.1:8545".into()]);
        config.start_block = start_block;
        config.max_block_range = max_block_range;
        let provider = Arc::new(EvmProvider::new(config.clone()).unwrap());
        let (tx, _rx) = mpsc::channel(8);
        EvmWatcher::new(&config, provider, Arc::new(InMemorySwapStore::new()), tx)
    }

    #[test]
    fn test_range_starts_at_configured_block_without_checkpoint() {
        let w = watcher(100, 50);
        assert_eq!(w.next_range(None, 1_000), Some((100, 149)));
        assert_eq!(w.next_range(None, 120), Some((100, 120)));
        assert_eq!(w.next_range(None, 99), None);
    }

    #[test]
    fn test_range_resumes_after_checkpoint() {
        let w = watcher(0, 1000);
        assert_eq!(w.next_range(Some(500), 700), Some((501, 700)));
        assert_eq!(w.next_range(Some(700), 700), None);
    }

    #[test]
    fn test_stream_name_includes_chain_id() {
        assert_eq!(watcher(0, 10).stream, "evm:31337:logs");
    }
}
