//! In-memory swap store for development runs and tests

use super::store::{StatusTransition, SwapStats, SwapStore, SwapUpdate};
use crate::error::{RelayerError, RelayerResult};
use crate::swap::{Chain, Hashlock, Swap, SwapStatus};

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Default)]
struct Inner {
    swaps: HashMap<String, Swap>,
    /// (chain, contract id) -> swap id
    by_address: HashMap<(Chain, String), String>,
    by_hashlock: HashMap<Hashlock, String>,
    transitions: HashMap<String, Vec<StatusTransition>>,
    checkpoints: HashMap<String, u64>,
}

/// Swap store held entirely in process memory
#[derive(Default)]
pub struct InMemorySwapStore {
    inner: RwLock<Inner>,
}

impl InMemorySwapStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SwapStore for InMemorySwapStore {
    async fn insert_swap(&self, swap: &Swap) -> RelayerResult<()> {
        let mut inner = self.inner.write().await;
        if inner.swaps.contains_key(&swap.id) {
            return Err(RelayerError::Validation(format!("duplicate swap id {}", swap.id)));
        }
        if inner.by_hashlock.contains_key(&swap.hashlock) {
            return Err(RelayerError::Validation(format!(
                "hashlock {} is already used by another swap",
                swap.hashlock
            )));
        }

        inner.by_hashlock.insert(swap.hashlock, swap.id.clone());
        for (chain, address) in swap.legs() {
            inner.by_address.insert((chain, address), swap.id.clone());
        }
        inner.swaps.insert(swap.id.clone(), swap.clone());
        Ok(())
    }

    async fn get_swap(&self, id: &str) -> RelayerResult<Option<Swap>> {
        Ok(self.inner.read().await.swaps.get(id).cloned())
    }

    async fn find_by_htlc_address(
        &self,
        chain: Chain,
        address: &str,
    ) -> RelayerResult<Option<Swap>> {
        let inner = self.inner.read().await;
        Ok(inner
            .by_address
            .get(&(chain, address.to_string()))
            .and_then(|id| inner.swaps.get(id))
            .cloned())
    }

    async fn find_by_hashlock(&self, hashlock: &Hashlock) -> RelayerResult<Option<Swap>> {
        let inner = self.inner.read().await;
        Ok(inner
            .by_hashlock
            .get(hashlock)
            .and_then(|id| inner.swaps.get(id))
            .cloned())
    }

    async fn find_expired_unresolved(&self, now: u64) -> RelayerResult<Vec<Swap>> {
        let mut swaps: Vec<Swap> = self
            .inner
            .read()
            .await
            .swaps
            .values()
            .filter(|s| s.status.is_htlc_created() && s.is_expired(now))
            .cloned()
            .collect();
        swaps.sort_by_key(|s| s.timelock);
        Ok(swaps)
    }

    async fn find_by_status(&self, status: SwapStatus) -> RelayerResult<Vec<Swap>> {
        Ok(self
            .inner
            .read()
            .await
            .swaps
            .values()
            .filter(|s| s.status == status)
            .cloned()
            .collect())
    }

    async fn update_status(
        &self,
        id: &str,
        expected: SwapStatus,
        new: SwapStatus,
        update: SwapUpdate,
    ) -> RelayerResult<Option<Swap>> {
        let mut inner = self.inner.write().await;
        let current = inner
            .swaps
            .get(id)
            .ok_or_else(|| RelayerError::SwapNotFound {
                swap_id: id.to_string(),
            })?;

        if current.status != expected {
            return Ok(None);
        }
        update.validate(current, expected, new)?;

        let details = update.error_message.clone();
        let mut swap = current.clone();
        let now = Utc::now();
        update.apply(&mut swap, new, now);

        for (chain, address) in swap.legs() {
            inner.by_address.insert((chain, address), swap.id.clone());
        }
        if new != expected {
            inner
                .transitions
                .entry(id.to_string())
                .or_default()
                .push(StatusTransition {
                    from_status: expected,
                    to_status: new,
                    at: now,
                    details,
                });
        }
        inner.swaps.insert(id.to_string(), swap.clone());

        Ok(Some(swap))
    }

    async fn get_transitions(&self, id: &str) -> RelayerResult<Vec<StatusTransition>> {
        Ok(self
            .inner
            .read()
            .await
            .transitions
            .get(id)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_swaps(&self, limit: usize) -> RelayerResult<Vec<Swap>> {
        let mut swaps: Vec<Swap> = self.inner.read().await.swaps.values().cloned().collect();
        swaps.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        swaps.truncate(limit);
        Ok(swaps)
    }

    async fn get_stats(&self) -> RelayerResult<SwapStats> {
        let mut stats = SwapStats::default();
        for swap in self.inner.read().await.swaps.values() {
            stats.record(swap.status, 1);
        }
        Ok(stats)
    }

    async fn get_checkpoint(&self, stream: &str) -> RelayerResult<Option<u64>> {
        Ok(self.inner.read().await.checkpoints.get(stream).copied())
    }

    async fn save_checkpoint(&self, stream: &str, position: u64) -> RelayerResult<()> {
        self.inner
            .write()
            .await
            .checkpoints
            .insert(stream.to_string(), position);
        Ok(())
    }

    async fn health_check(&self) -> RelayerResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swap::{Preimage, SwapDirection, SwapRequest};

    fn swap(id: &str, secret: &[u8], timelock: u64) -> Swap {
        let preimage = Preimage::new(secret.to_vec()).unwrap();
        Swap::new(
            id.into(),
            SwapRequest {
                direction: SwapDirection::EvmToAptos,
                sender: "0xa".into(),
                recipient: "0xb".into(),
                from_token_address: "0xt".into(),
                to_token_address: "0x1::aptos_coin::AptosCoin".into(),
                amount: "10".parse().unwrap(),
                hashlock: Hashlock::from_preimage(&preimage),
                timelock,
            },
            timelock - 100,
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_conditional_update_only_applies_once() {
        let store = InMemorySwapStore::new();
        store.insert_swap(&swap("s1", b"a", 1_000)).await.unwrap();

        let first = store
            .update_status(
                "s1",
                SwapStatus::Pending,
                SwapStatus::EvmHtlcCreated,
                SwapUpdate::htlc_address(Chain::Evm, "0x01"),
            )
            .await
            .unwrap();
        assert!(first.is_some());

        let second = store
            .update_status(
                "s1",
                SwapStatus::Pending,
                SwapStatus::EvmHtlcCreated,
                SwapUpdate::htlc_address(Chain::Evm, "0x01"),
            )
            .await
            .unwrap();
        assert!(second.is_none());

        let found = store.find_by_htlc_address(Chain::Evm, "0x01").await.unwrap();
        assert_eq!(found.map(|s| s.id), Some("s1".to_string()));
        assert_eq!(store.get_transitions("s1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_hashlock_rejected() {
        let store = InMemorySwapStore::new();
        store.insert_swap(&swap("s1", b"a", 1_000)).await.unwrap();
        assert!(store.insert_swap(&swap("s2", b"a", 1_000)).await.is_err());
    }

    #[tokio::test]
    async fn test_expired_selection_skips_pending_and_terminal() {
        let store = InMemorySwapStore::new();
        for (id, secret) in [("pending", b"1"), ("created", b"2"), ("refunded", b"3")] {
            store.insert_swap(&swap(id, secret, 1_000)).await.unwrap();
        }
        for id in ["created", "refunded"] {
            store
                .update_status(
                    id,
                    SwapStatus::Pending,
                    SwapStatus::EvmHtlcCreated,
                    SwapUpdate::htlc_address(Chain::Evm, format!("0x{}", id.len())),
                )
                .await
                .unwrap();
        }
        store
            .update_status(
                "refunded",
                SwapStatus::EvmHtlcCreated,
                SwapStatus::Refunded,
                SwapUpdate::cancelled(Utc::now()),
            )
            .await
            .unwrap();

        let expired = store.find_expired_unresolved(2_000).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, "created");
        assert!(store.find_expired_unresolved(500).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_checkpoints_round_trip() {
        let store = InMemorySwapStore::new();
        assert_eq!(store.get_checkpoint("evm:logs").await.unwrap(), None);
        store.save_checkpoint("evm:logs", 42).await.unwrap();
        assert_eq!(store.get_checkpoint("evm:logs").await.unwrap(), Some(42));
    }
}
