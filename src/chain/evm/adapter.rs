//! HTLC adapter for the EVM contract

use super::contract::{decode_htlc_log, parse_contract_id, Erc20, HtlcContract};
use super::EvmProvider;
use crate::chain::{HtlcAdapter, HtlcParams, HtlcReceipt, HtlcState, TxReceipt};
use crate::error::{ChainError, FailureClass, RelayerError};
use crate::events::HtlcEventKind;
use crate::swap::{Chain, Preimage};
use crate::tx::TransactionSender;

use async_trait::async_trait;
use ethers::prelude::*;
use std::sync::Arc;
use tracing::{debug, info};

pub struct EvmHtlcAdapter {
    provider: Arc<EvmProvider>,
    sender: Arc<TransactionSender>,
}

impl EvmHtlcAdapter {
    pub fn new(provider: Arc<EvmProvider>, sender: Arc<TransactionSender>) -> Self {
        Self { provider, sender }
    }

    fn client(&self) -> Arc<Provider<Http>> {
        Arc::new(self.provider.http().clone())
    }

    fn contract(&self) -> HtlcContract<Provider<Http>> {
        HtlcContract::new(self.provider.htlc_address(), self.client())
    }

    /// Approve the HTLC contract to pull `amount` of `token` if it cannot already
    async fn ensure_allowance(&self, token: Address, amount: U256) -> Result<(), ChainError> {
        let erc20 = Erc20::new(token, self.client());
        let spender = self.provider.htlc_address();

        let allowance = erc20
            .allowance(self.sender.address(), spender)
            .call()
            .await
            .map_err(|e| ChainError::transient(Chain::Evm, e.to_string()))?;
        if allowance >= amount {
            return Ok(());
        }

        info!("Approving {} of token {:?} for the HTLC contract", amount, token);
        let data = erc20
            .approve(spender, amount)
            .calldata()
            .ok_or_else(|| ChainError::fatal(Chain::Evm, "failed to encode approve"))?;
        self.sender
            .send(token, data, U256::zero(), "approve")
            .await
            .map_err(|e| chain_error("", e))?;
        Ok(())
    }

    /// Turn a failed settle call into the most precise error, checking the
    /// contract when the node gave no usable reason.
    async fn settle_error(&self, contract_id: &str, error: RelayerError) -> ChainError {
        let classified = chain_error(contract_id, error);
        if classified.class() != FailureClass::Fatal {
            return classified;
        }

        match self.get_htlc_state(contract_id).await {
            Ok(HtlcState::Withdrawn { .. }) => ChainError::AlreadyWithdrawn {
                chain: Chain::Evm,
                contract_id: contract_id.to_string(),
            },
            Ok(HtlcState::Refunded) => ChainError::AlreadyRefunded {
                chain: Chain::Evm,
                contract_id: contract_id.to_string(),
            },
            _ => classified,
        }
    }
}

/// Map a submission error to the coordinator's taxonomy
fn chain_error(contract_id: &str, error: RelayerError) -> ChainError {
    match error {
        RelayerError::Chain(e) => e,
        RelayerError::ChainConnection { .. }
        | RelayerError::Timeout { .. }
        | RelayerError::Nonce { .. } => ChainError::transient(Chain::Evm, error.to_string()),
        other => ChainError::classify(Chain::Evm, contract_id, &other.to_string()),
    }
}

fn rejected(reason: String) -> ChainError {
    ChainError::Rejected {
        chain: Chain::Evm,
        reason,
    }
}

fn parse_address(field: &str, value: &str) -> Result<Address, ChainError> {
    value
        .parse()
        .map_err(|e| rejected(format!("invalid {} address {}: {}", field, value, e)))
}

fn parse_id(contract_id: &str) -> Result<[u8; 32], ChainError> {
    parse_contract_id(contract_id).map_err(|e| rejected(e.to_string()))
}

fn tx_receipt(receipt: &TransactionReceipt) -> TxReceipt {
    TxReceipt {
        tx_hash: format!("{:?}", receipt.transaction_hash),
        block_number: receipt.block_number.map(|b| b.as_u64()),
    }
}

#[async_trait]
impl HtlcAdapter for EvmHtlcAdapter {
    fn chain(&self) -> Chain {
        Chain::Evm
    }

    fn relayer_address(&self) -> String {
        format!("{:?}", self.sender.address())
    }

    async fn create_htlc(&self, params: &HtlcParams) -> Result<HtlcReceipt, ChainError> {
        let receiver = parse_address("receiver", &params.receiver)?;
        let token = parse_address("token", &params.token)?;
        let amount = U256::from_dec_str(params.amount.as_str())
            .map_err(|e| rejected(format!("invalid amount {}: {}", params.amount, e)))?;

        // The zero address stands for the native currency
        let value = if token == Address::zero() {
            amount
        } else {
            self.ensure_allowance(token, amount).await?;
            U256::zero()
        };

        let data = self
            .contract()
            .new_contract(
                receiver,
                *params.hashlock.as_bytes(),
                U256::from(params.timelock),
                token,
                amount,
            )
            .calldata()
            .ok_or_else(|| ChainError::fatal(Chain::Evm, "failed to encode newContract"))?;

        let receipt = self
            .sender
            .send(self.provider.htlc_address(), data, value, "create_htlc")
            .await
            .map_err(|e| chain_error("", e))?;

        let contract_id = receipt
            .logs
            .iter()
            .filter(|log| log.address == self.provider.htlc_address())
            .find_map(|log| match decode_htlc_log(log, 0) {
                Ok(Some(event)) if matches!(event.kind, HtlcEventKind::Created { .. }) => {
                    Some(event.contract_id)
                }
                _ => None,
            })
            .ok_or_else(|| {
                ChainError::fatal(
                    Chain::Evm,
                    format!(
                        "no HTLCCreated log in transaction {:?}",
                        receipt.transaction_hash
                    ),
                )
            })?;

        info!("Created EVM HTLC {} for hashlock {}", contract_id, params.hashlock);
        Ok(HtlcReceipt {
            contract_id,
            tx_hash: format!("{:?}", receipt.transaction_hash),
        })
    }

    async fn withdraw(&self, contract_id: &str, preimage: &Preimage) -> Result<TxReceipt, ChainError> {
        let id = parse_id(contract_id)?;
        let data = self
            .contract()
            .withdraw(id, Bytes::from(preimage.as_bytes().to_vec()))
            .calldata()
            .ok_or_else(|| ChainError::fatal(Chain::Evm, "failed to encode withdraw"))?;

        match self
            .sender
            .send(self.provider.htlc_address(), data, U256::zero(), "withdraw")
            .await
        {
            Ok(receipt) => Ok(tx_receipt(&receipt)),
            Err(e) => Err(self.settle_error(contract_id, e).await),
        }
    }

    async fn refund(&self, contract_id: &str) -> Result<TxReceipt, ChainError> {
        let id = parse_id(contract_id)?;
        let data = self
            .contract()
            .refund(id)
            .calldata()
            .ok_or_else(|| ChainError::fatal(Chain::Evm, "failed to encode refund"))?;

        match self
            .sender
            .send(self.provider.htlc_address(), data, U256::zero(), "refund")
            .await
        {
            Ok(receipt) => Ok(tx_receipt(&receipt)),
            Err(e) => Err(self.settle_error(contract_id, e).await),
        }
    }

    async fn get_htlc_state(&self, contract_id: &str) -> Result<HtlcState, ChainError> {
        let id = parse_id(contract_id)?;
        let result = self.contract().get_contract(id).call().await;

        let (sender, _, _, _, _, _, withdrawn, refunded, preimage) = match result {
            Ok(fields) => fields,
            Err(e) => {
                let error = ChainError::classify(Chain::Evm, contract_id, &e.to_string());
                return match error {
                    ChainError::Rejected { .. } => Ok(HtlcState::Missing),
                    _ => Err(ChainError::transient(Chain::Evm, e.to_string())),
                };
            }
        };

        let state = if sender == Address::zero() {
            HtlcState::Missing
        } else if withdrawn {
            HtlcState::Withdrawn {
                preimage: Preimage::new(preimage.to_vec()).ok(),
            }
        } else if refunded {
            HtlcState::Refunded
        } else {
            HtlcState::Locked
        };

        debug!("EVM HTLC {} is {:?}", contract_id, state);
        Ok(state)
    }

    async fn health_check(&self) -> bool {
        self.provider.health_check().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_errors_are_transient() {
        let e = chain_error(
            "0x01",
            RelayerError::ChainConnection {
                chain: Chain::Evm,
                message: "All providers failed".into(),
            },
        );
        assert_eq!(e.class(), FailureClass::Transient);

        let e = chain_error(
            "0x01",
            RelayerError::Timeout {
                operation: "confirmation".into(),
            },
        );
        assert_eq!(e.class(), FailureClass::Transient);
    }

    #[test]
    fn test_estimation_reverts_are_classified() {
        let e = chain_error(
            "0x01",
            RelayerError::GasEstimation(
                "(code: 3, message: execution reverted: withdrawable: already withdrawn, data: None)"
                    .into(),
            ),
        );
        assert!(matches!(e, ChainError::AlreadyWithdrawn { ref contract_id, .. } if contract_id == "0x01"));

        let e = chain_error(
            "0x01",
            RelayerError::GasEstimation("execution reverted: hashlock hash must match".into()),
        );
        assert_eq!(e.class(), FailureClass::InvalidInput);
    }

    #[test]
    fn test_invalid_addresses_are_rejected() {
        let e = parse_address("receiver", "0xnothex").unwrap_err();
        assert_eq!(e.class(), FailureClass::InvalidInput);
        assert!(parse_id("0x12").is_err());
    }
}
