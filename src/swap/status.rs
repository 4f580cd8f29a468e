//! Swap lifecycle state machine

use super::model::Chain;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle state of a swap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SwapStatus {
    Pending,
    EvmHtlcCreated,
    AptosHtlcCreated,
    PreimageRevealed,
    Completed,
    Failed,
    Refunded,
}

impl SwapStatus {
    pub const ALL: [SwapStatus; 7] = [
        SwapStatus::Pending,
        SwapStatus::EvmHtlcCreated,
        SwapStatus::AptosHtlcCreated,
        SwapStatus::PreimageRevealed,
        SwapStatus::Completed,
        SwapStatus::Failed,
        SwapStatus::Refunded,
    ];

    /// Status reached once the initiating lock on `chain` is confirmed
    pub fn created_for(chain: Chain) -> Self {
        match chain {
            Chain::Evm => SwapStatus::EvmHtlcCreated,
            Chain::Aptos => SwapStatus::AptosHtlcCreated,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SwapStatus::Completed | SwapStatus::Failed | SwapStatus::Refunded
        )
    }

    pub fn is_htlc_created(&self) -> bool {
        matches!(self, SwapStatus::EvmHtlcCreated | SwapStatus::AptosHtlcCreated)
    }

    /// Whether `next` is a directed edge of the lifecycle graph.
    ///
    /// `FAILED` and `REFUNDED` are reachable from every non-terminal state;
    /// everything else only moves forward one step.
    pub fn can_transition_to(&self, next: SwapStatus) -> bool {
        if self.is_terminal() {
            return false;
        }

        match next {
            SwapStatus::Failed | SwapStatus::Refunded => true,
            SwapStatus::EvmHtlcCreated | SwapStatus::AptosHtlcCreated => {
                *self == SwapStatus::Pending
            }
            SwapStatus::PreimageRevealed => self.is_htlc_created(),
            SwapStatus::Completed => *self == SwapStatus::PreimageRevealed,
            SwapStatus::Pending => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SwapStatus::Pending => "PENDING",
            SwapStatus::EvmHtlcCreated => "EVM_HTLC_CREATED",
            SwapStatus::AptosHtlcCreated => "APTOS_HTLC_CREATED",
            SwapStatus::PreimageRevealed => "PREIMAGE_REVEALED",
            SwapStatus::Completed => "COMPLETED",
            SwapStatus::Failed => "FAILED",
            SwapStatus::Refunded => "REFUNDED",
        }
    }
}

impl fmt::Display for SwapStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SwapStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SwapStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown swap status: {}", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_edges() {
        assert!(SwapStatus::Pending.can_transition_to(SwapStatus::EvmHtlcCreated));
        assert!(SwapStatus::Pending.can_transition_to(SwapStatus::AptosHtlcCreated));
        assert!(SwapStatus::EvmHtlcCreated.can_transition_to(SwapStatus::PreimageRevealed));
        assert!(SwapStatus::AptosHtlcCreated.can_transition_to(SwapStatus::PreimageRevealed));
        assert!(SwapStatus::PreimageRevealed.can_transition_to(SwapStatus::Completed));
    }

    #[test]
    fn test_failed_and_refunded_reachable_from_non_terminal() {
        for status in SwapStatus::ALL.iter().filter(|s| !s.is_terminal()) {
            assert!(status.can_transition_to(SwapStatus::Failed), "{} -> FAILED", status);
            assert!(status.can_transition_to(SwapStatus::Refunded), "{} -> REFUNDED", status);
        }
    }

    #[test]
    fn test_terminal_states_are_final() {
        for from in SwapStatus::ALL.iter().filter(|s| s.is_terminal()) {
            for to in SwapStatus::ALL {
                assert!(!from.can_transition_to(to), "{} -> {}", from, to);
            }
        }
    }

    #[test]
    fn test_no_backward_or_skipping_edges() {
        assert!(!SwapStatus::PreimageRevealed.can_transition_to(SwapStatus::EvmHtlcCreated));
        assert!(!SwapStatus::EvmHtlcCreated.can_transition_to(SwapStatus::Pending));
        assert!(!SwapStatus::EvmHtlcCreated.can_transition_to(SwapStatus::AptosHtlcCreated));
        assert!(!SwapStatus::Pending.can_transition_to(SwapStatus::PreimageRevealed));
        assert!(!SwapStatus::Pending.can_transition_to(SwapStatus::Completed));
        assert!(!SwapStatus::EvmHtlcCreated.can_transition_to(SwapStatus::Completed));
    }

    #[test]
    fn test_string_round_trip() {
        for status in SwapStatus::ALL {
            assert_eq!(status.as_str().parse::<SwapStatus>().unwrap(), status);
        }
        assert!("SETTLED".parse::<SwapStatus>().is_err());
    }
}
