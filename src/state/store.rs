//! Swap storage contract shared by the PostgreSQL and in-memory backends

use crate::error::{RelayerError, RelayerResult};
use crate::swap::{Chain, Hashlock, Preimage, Swap, SwapStatus};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Fields written alongside a status change.
///
/// Every field is set-once: `None` leaves the stored value alone and a value
/// may not replace a different one already stored.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SwapUpdate {
    pub evm_htlc_address: Option<String>,
    pub aptos_htlc_address: Option<String>,
    pub preimage: Option<Preimage>,
    pub error_message: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl SwapUpdate {
    pub fn htlc_address(chain: Chain, address: impl Into<String>) -> Self {
        let address = Some(address.into());
        match chain {
            Chain::Evm => Self {
                evm_htlc_address: address,
                ..Default::default()
            },
            Chain::Aptos => Self {
                aptos_htlc_address: address,
                ..Default::default()
            },
        }
    }

    pub fn preimage(preimage: Preimage) -> Self {
        Self {
            preimage: Some(preimage),
            ..Default::default()
        }
    }

    pub fn completed(at: DateTime<Utc>) -> Self {
        Self {
            completed_at: Some(at),
            ..Default::default()
        }
    }

    pub fn cancelled(at: DateTime<Utc>) -> Self {
        Self {
            cancelled_at: Some(at),
            ..Default::default()
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            error_message: Some(message.into()),
            ..Default::default()
        }
    }

    /// Check this update against the stored swap before writing it
    pub fn validate(
        &self,
        current: &Swap,
        expected: SwapStatus,
        new: SwapStatus,
    ) -> RelayerResult<()> {
        if new != expected && !expected.can_transition_to(new) {
            return Err(RelayerError::InvalidStateTransition {
                from: expected,
                to: new,
            });
        }

        check_set_once("evm_htlc_address", &current.evm_htlc_address, &self.evm_htlc_address)?;
        check_set_once(
            "aptos_htlc_address",
            &current.aptos_htlc_address,
            &self.aptos_htlc_address,
        )?;
        check_set_once("preimage", &current.preimage, &self.preimage)?;

        if let Some(preimage) = &self.preimage {
            if !preimage.verify(&current.hashlock) {
                return Err(RelayerError::Validation(format!(
                    "preimage does not match hashlock {} of swap {}",
                    current.hashlock, current.id
                )));
            }
        }

        let completed = self.completed_at.is_some() || current.completed_at.is_some();
        let cancelled = self.cancelled_at.is_some() || current.cancelled_at.is_some();
        if completed && cancelled {
            return Err(RelayerError::Validation(format!(
                "swap {} cannot be both completed and cancelled",
                current.id
            )));
        }

        Ok(())
    }

    /// Apply to an in-memory copy; call [`SwapUpdate::validate`] first
    pub fn apply(self, swap: &mut Swap, new: SwapStatus, now: DateTime<Utc>) {
        swap.status = new;
        swap.updated_at = now;
        if self.evm_htlc_address.is_some() {
            swap.evm_htlc_address = self.evm_htlc_address;
        }
        if self.aptos_htlc_address.is_some() {
            swap.aptos_htlc_address = self.aptos_htlc_address;
        }
        if self.preimage.is_some() {
            swap.preimage = self.preimage;
        }
        if self.error_message.is_some() {
            swap.error_message = self.error_message;
        }
        if self.completed_at.is_some() {
            swap.completed_at = self.completed_at;
        }
        if self.cancelled_at.is_some() {
            swap.cancelled_at = self.cancelled_at;
        }
    }
}

fn check_set_once<T: PartialEq>(
    field: &str,
    current: &Option<T>,
    incoming: &Option<T>,
) -> RelayerResult<()> {
    match (current, incoming) {
        (Some(a), Some(b)) if a != b => Err(RelayerError::Validation(format!(
            "{} is already set and cannot change",
            field
        ))),
        _ => Ok(()),
    }
}

/// One recorded status change
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusTransition {
    pub from_status: SwapStatus,
    pub to_status: SwapStatus,
    pub at: DateTime<Utc>,
    pub details: Option<String>,
}

/// Swap counts by status
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SwapStats {
    pub pending: u64,
    pub htlc_created: u64,
    pub preimage_revealed: u64,
    pub completed: u64,
    pub failed: u64,
    pub refunded: u64,
}

impl SwapStats {
    pub fn record(&mut self, status: SwapStatus, count: u64) {
        match status {
            SwapStatus::Pending => self.pending += count,
            SwapStatus::EvmHtlcCreated | SwapStatus::AptosHtlcCreated => {
                self.htlc_created += count
            }
            SwapStatus::PreimageRevealed => self.preimage_revealed += count,
            SwapStatus::Completed => self.completed += count,
            SwapStatus::Failed => self.failed += count,
            SwapStatus::Refunded => self.refunded += count,
        }
    }
}

/// Durable swap storage.
///
/// `update_status` is the only mutation path for existing swaps and must be
/// atomic: it writes only when the stored status still equals `expected`,
/// returning `None` otherwise. Passing `new == expected` updates fields
/// without a transition.
#[async_trait]
pub trait SwapStore: Send + Sync {
    async fn insert_swap(&self, swap: &Swap) -> RelayerResult<()>;

    async fn get_swap(&self, id: &str) -> RelayerResult<Option<Swap>>;

    async fn find_by_htlc_address(&self, chain: Chain, address: &str)
        -> RelayerResult<Option<Swap>>;

    async fn find_by_hashlock(&self, hashlock: &Hashlock) -> RelayerResult<Option<Swap>>;

    /// Swaps still waiting on their locks whose source timelock has passed
    async fn find_expired_unresolved(&self, now: u64) -> RelayerResult<Vec<Swap>>;

    async fn find_by_status(&self, status: SwapStatus) -> RelayerResult<Vec<Swap>>;

    async fn update_status(
        &self,
        id: &str,
        expected: SwapStatus,
        new: SwapStatus,
        update: SwapUpdate,
    ) -> RelayerResult<Option<Swap>>;

    async fn get_transitions(&self, id: &str) -> RelayerResult<Vec<StatusTransition>>;

    async fn list_swaps(&self, limit: usize) -> RelayerResult<Vec<Swap>>;

    async fn get_stats(&self) -> RelayerResult<SwapStats>;

    /// Last processed position of a watcher stream
    async fn get_checkpoint(&self, stream: &str) -> RelayerResult<Option<u64>>;

    async fn save_checkpoint(&self, stream: &str, position: u64) -> RelayerResult<()>;

    async fn health_check(&self) -> RelayerResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swap::{SwapDirection, SwapRequest};

    fn swap() -> Swap {
        let preimage = Preimage::new(b"secret".to_vec()).unwrap();
        Swap::new(
            "s1".into(),
            SwapRequest {
                direction: SwapDirection::EvmToAptos,
                sender: "0xa".into(),
                recipient: "0xb".into(),
                from_token_address: "0xt".into(),
                to_token_address: "0x1::aptos_coin::AptosCoin".into(),
                amount: "10".parse().unwrap(),
                hashlock: Hashlock::from_preimage(&preimage),
                timelock: 5_000,
            },
            4_000,
            Utc::now(),
        )
    }

    #[test]
    fn test_validate_rejects_illegal_edge() {
        let err = SwapUpdate::default()
            .validate(&swap(), SwapStatus::Pending, SwapStatus::Completed)
            .unwrap_err();
        assert!(matches!(err, RelayerError::InvalidStateTransition { .. }));
    }

    #[test]
    fn test_validate_rejects_wrong_preimage() {
        let mut current = swap();
        current.status = SwapStatus::EvmHtlcCreated;
        let update = SwapUpdate::preimage(Preimage::new(b"guess".to_vec()).unwrap());
        assert!(update
            .validate(&current, SwapStatus::EvmHtlcCreated, SwapStatus::PreimageRevealed)
            .is_err());
    }

    #[test]
    fn test_validate_rejects_changing_leg_address() {
        let mut current = swap();
        current.evm_htlc_address = Some("0x01".into());
        let update = SwapUpdate::htlc_address(Chain::Evm, "0x02");
        assert!(update
            .validate(&current, SwapStatus::Pending, SwapStatus::EvmHtlcCreated)
            .is_err());

        let same = SwapUpdate::htlc_address(Chain::Evm, "0x01");
        assert!(same
            .validate(&current, SwapStatus::Pending, SwapStatus::EvmHtlcCreated)
            .is_ok());
    }

    #[test]
    fn test_validate_rejects_completed_and_cancelled() {
        let mut current = swap();
        current.status = SwapStatus::PreimageRevealed;
        current.completed_at = Some(Utc::now());
        let update = SwapUpdate::cancelled(Utc::now());
        assert!(update
            .validate(&current, SwapStatus::PreimageRevealed, SwapStatus::Refunded)
            .is_err());
    }

    #[test]
    fn test_apply_keeps_unset_fields() {
        let mut current = swap();
        current.evm_htlc_address = Some("0x01".into());
        SwapUpdate::htlc_address(Chain::Aptos, "9").apply(
            &mut current,
            SwapStatus::EvmHtlcCreated,
            Utc::now(),
        );
        assert_eq!(current.evm_htlc_address.as_deref(), Some("0x01"));
        assert_eq!(current.aptos_htlc_address.as_deref(), Some("9"));
        assert_eq!(current.status, SwapStatus::EvmHtlcCreated);
    }
}
