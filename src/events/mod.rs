//! Chain-agnostic HTLC events
//!
//! Both watchers decode their chain's native logs into [`HtlcEvent`] before
//! handing them to the coordinator, so nothing past this point depends on a
//! chain wire format.

use crate::swap::{Amount, Chain, Hashlock, Preimage};

use serde::{Deserialize, Serialize};

/// What happened to an HTLC
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HtlcEventKind {
    Created {
        sender: String,
        receiver: String,
        token: String,
        amount: Amount,
        hashlock: Hashlock,
        timelock: u64,
    },
    Withdrawn {
        preimage: Preimage,
    },
    Refunded,
}

/// An HTLC event observed on one chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HtlcEvent {
    pub chain: Chain,
    /// Contract identifier of the leg: bytes32 id on EVM, HTLC id on Aptos
    pub contract_id: String,
    pub kind: HtlcEventKind,
    pub block_timestamp: u64,
    pub block_number: u64,
    pub tx_hash: String,
}

impl HtlcEvent {
    /// Get event name for metrics
    pub fn name(&self) -> &'static str {
        match self.kind {
            HtlcEventKind::Created { .. } => "htlc_created",
            HtlcEventKind::Withdrawn { .. } => "htlc_withdrawn",
            HtlcEventKind::Refunded => "htlc_refunded",
        }
    }

    /// Preimage revealed by this event, if any
    pub fn preimage(&self) -> Option<&Preimage> {
        match &self.kind {
            HtlcEventKind::Withdrawn { preimage } => Some(preimage),
            _ => None,
        }
    }
}

/// Normalize a contract id so both watchers and the store agree on its form.
///
/// EVM ids are lower-case 0x-prefixed hex; Aptos ids are decimal u64.
pub fn normalize_contract_id(chain: Chain, raw: &str) -> String {
    let raw = raw.trim();
    match chain {
        Chain::Evm => {
            let hex = raw.strip_prefix("0x").unwrap_or(raw);
            format!("0x{}", hex.to_ascii_lowercase())
        }
        Chain::Aptos => raw.to_string(),
    }
}
