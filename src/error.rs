//! Error types for the HTLC relayer

use crate::swap::{Chain, SwapStatus};
use thiserror::Error;

/// Main error type for the relayer
#[derive(Error, Debug)]
pub enum RelayerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Chain connection error for {chain}: {message}")]
    ChainConnection { chain: Chain, message: String },

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Nonce error for {chain}: {message}")]
    Nonce { chain: Chain, message: String },

    #[error("Gas estimation error: {0}")]
    GasEstimation(String),

    #[error("Event parsing error: {0}")]
    EventParsing(String),

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Swap {swap_id} not found")]
    SwapNotFound { swap_id: String },

    #[error("Invalid swap request: {0}")]
    Validation(String),

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: SwapStatus, to: SwapStatus },

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayerError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            RelayerError::ChainConnection { .. }
            | RelayerError::Timeout { .. }
            | RelayerError::Nonce { .. }
            | RelayerError::Database(_) => true,
            RelayerError::Chain(e) => e.class() == FailureClass::Transient,
            _ => false,
        }
    }
}

/// Result type for relayer operations
pub type RelayerResult<T> = Result<T, RelayerError>;

/// How the coordinator reacts to a failed chain action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Network, gas or nonce trouble; retry on the next event or tick
    Transient,
    /// The contract already reached the requested end state
    BenignDuplicate,
    /// Wrong preimage, unauthorized caller and similar contract rejections
    InvalidInput,
    /// Misconfiguration or anything else nobody should retry
    Fatal,
}

/// Errors surfaced by chain adapters
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ChainError {
    #[error("{chain}: transient failure: {message}")]
    Transient { chain: Chain, message: String },

    #[error("{chain}: HTLC {contract_id} already withdrawn")]
    AlreadyWithdrawn { chain: Chain, contract_id: String },

    #[error("{chain}: HTLC {contract_id} already refunded")]
    AlreadyRefunded { chain: Chain, contract_id: String },

    #[error("{chain}: rejected by contract: {reason}")]
    Rejected { chain: Chain, reason: String },

    #[error("{chain}: {message}")]
    Fatal { chain: Chain, message: String },
}

impl ChainError {
    pub fn transient(chain: Chain, message: impl Into<String>) -> Self {
        ChainError::Transient {
            chain,
            message: message.into(),
        }
    }

    pub fn fatal(chain: Chain, message: impl Into<String>) -> Self {
        ChainError::Fatal {
            chain,
            message: message.into(),
        }
    }

    pub fn class(&self) -> FailureClass {
        match self {
            ChainError::Transient { .. } => FailureClass::Transient,
            ChainError::AlreadyWithdrawn { .. } | ChainError::AlreadyRefunded { .. } => {
                FailureClass::BenignDuplicate
            }
            ChainError::Rejected { .. } => FailureClass::InvalidInput,
            ChainError::Fatal { .. } => FailureClass::Fatal,
        }
    }

    pub fn chain(&self) -> Chain {
        match self {
            ChainError::Transient { chain, .. }
            | ChainError::AlreadyWithdrawn { chain, .. }
            | ChainError::AlreadyRefunded { chain, .. }
            | ChainError::Rejected { chain, .. }
            | ChainError::Fatal { chain, .. } => *chain,
        }
    }

    /// Classify a node or VM error message for an action on `contract_id`.
    ///
    /// Both contracts use the same wording for their guards, so one table
    /// serves the EVM revert reasons and the Move abort names.
    pub fn classify(chain: Chain, contract_id: &str, message: &str) -> Self {
        let lower = message.to_ascii_lowercase();

        if lower.contains("already withdrawn") || lower.contains("e_already_withdrawn") {
            return ChainError::AlreadyWithdrawn {
                chain,
                contract_id: contract_id.to_string(),
            };
        }
        if lower.contains("already refunded") || lower.contains("e_already_refunded") {
            return ChainError::AlreadyRefunded {
                chain,
                contract_id: contract_id.to_string(),
            };
        }

        const REJECTIONS: [&str; 8] = [
            "hashlock hash must match",
            "e_invalid_preimage",
            "not receiver",
            "e_not_receiver",
            "not sender",
            "e_not_sender",
            "timelock time must be in the future",
            "e_expired",
        ];
        if REJECTIONS.iter().any(|r| lower.contains(r)) {
            return ChainError::Rejected {
                chain,
                reason: message.to_string(),
            };
        }

        // A lock that is "not yet expired" means the chain clock lags ours.
        const TRANSIENT: [&str; 14] = [
            "timelock not yet passed",
            "e_not_expired",
            "timeout",
            "timed out",
            "nonce too low",
            "replacement transaction underpriced",
            "connection",
            "rate limit",
            "429",
            "503",
            "502",
            "sequence_number_too_old",
            "mempool_is_full",
            "insufficient funds",
        ];
        if TRANSIENT.iter().any(|t| lower.contains(t)) {
            return ChainError::transient(chain, message);
        }

        if lower.contains("contract does not exist") || lower.contains("e_htlc_not_found") {
            return ChainError::Rejected {
                chain,
                reason: message.to_string(),
            };
        }

        ChainError::fatal(chain, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_evm_revert_reasons() {
        let e = ChainError::classify(
            Chain::Evm,
            "0x01",
            "execution reverted: withdrawable: already withdrawn",
        );
        assert_eq!(e.class(), FailureClass::BenignDuplicate);
        assert!(matches!(e, ChainError::AlreadyWithdrawn { .. }));

        let e = ChainError::classify(
            Chain::Evm,
            "0x01",
            "execution reverted: hashlock hash must match",
        );
        assert_eq!(e.class(), FailureClass::InvalidInput);

        let e = ChainError::classify(Chain::Evm, "0x01", "refundable: already refunded");
        assert!(matches!(e, ChainError::AlreadyRefunded { .. }));
    }

    #[test]
    fn test_classify_move_aborts() {
        let e = ChainError::classify(
            Chain::Aptos,
            "3",
            "Move abort in 0xabc::htlc: E_ALREADY_WITHDRAWN(0x10003)",
        );
        assert_eq!(e.class(), FailureClass::BenignDuplicate);

        let e = ChainError::classify(
            Chain::Aptos,
            "3",
            "Move abort in 0xabc::htlc: E_INVALID_PREIMAGE(0x10001)",
        );
        assert_eq!(e.class(), FailureClass::InvalidInput);
    }

    #[test]
    fn test_classify_transient_and_fatal() {
        let e = ChainError::classify(Chain::Evm, "0x01", "nonce too low");
        assert_eq!(e.class(), FailureClass::Transient);

        let e = ChainError::classify(Chain::Aptos, "1", "HTTP status 503 Service Unavailable");
        assert_eq!(e.class(), FailureClass::Transient);

        let e = ChainError::classify(
            Chain::Evm,
            "0x01",
            "execution reverted: refundable: timelock not yet passed",
        );
        assert_eq!(e.class(), FailureClass::Transient);

        let e = ChainError::classify(Chain::Evm, "0x01", "invalid opcode");
        assert_eq!(e.class(), FailureClass::Fatal);
    }

    #[test]
    fn test_relayer_error_retryable() {
        let transient: RelayerError = ChainError::transient(Chain::Evm, "rpc down").into();
        assert!(transient.is_retryable());

        let fatal: RelayerError = ChainError::fatal(Chain::Evm, "bad abi").into();
        assert!(!fatal.is_retryable());

        assert!(!RelayerError::Validation("bad".into()).is_retryable());
    }
}
