//! HTLC adapter for the Move `htlc` module

use super::client::{AptosApiError, AptosClient, AptosTransaction};
use super::signer::{normalize_address, AptosSigner};
use crate::chain::{HtlcAdapter, HtlcParams, HtlcReceipt, HtlcState, TxReceipt};
use crate::config::AptosConfig;
use crate::error::{ChainError, FailureClass};
use crate::swap::{Chain, Hashlock, Preimage};

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const CREATED_EVENT_SUFFIX: &str = "::htlc::HtlcCreatedEvent";

pub struct AptosHtlcAdapter {
    client: Arc<AptosClient>,
    signer: AptosSigner,
    module: String,
    max_gas_amount: u64,
    gas_unit_price: u64,
    txn_expiration_secs: u64,
    confirmation_timeout: Duration,
    poll_interval: Duration,
    /// Sequence numbers are fetched per submission, so submissions are serialized
    submit_lock: Mutex<()>,
}

impl AptosHtlcAdapter {
    pub fn new(
        client: Arc<AptosClient>,
        signer: AptosSigner,
        config: &AptosConfig,
        confirmation_timeout: Duration,
    ) -> Self {
        Self {
            client,
            signer,
            module: format!("{}::htlc", config.module_address),
            max_gas_amount: config.max_gas_amount,
            gas_unit_price: config.gas_unit_price,
            txn_expiration_secs: config.txn_expiration_secs,
            confirmation_timeout,
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(100)),
            submit_lock: Mutex::new(()),
        }
    }

    fn function(&self, name: &str) -> String {
        format!("{}::{}", self.module, name)
    }

    /// Sign, submit and wait for one entry function call
    async fn submit_entry(
        &self,
        function: &str,
        arguments: Vec<Value>,
        contract_id: &str,
        action: &str,
    ) -> Result<AptosTransaction, ChainError> {
        let result = self.submit_inner(function, arguments, contract_id).await;
        crate::metrics::record_chain_tx(Chain::Aptos, action, result.is_ok());
        result
    }

    async fn submit_inner(
        &self,
        function: &str,
        arguments: Vec<Value>,
        contract_id: &str,
    ) -> Result<AptosTransaction, ChainError> {
        let _guard = self.submit_lock.lock().await;
        let api_err = |e: AptosApiError| e.into_chain_error(contract_id);

        let sequence_number = self
            .client
            .sequence_number(self.signer.address())
            .await
            .map_err(api_err)?;
        let expiration = chrono::Utc::now().timestamp().max(0) as u64 + self.txn_expiration_secs;

        let mut txn = json!({
            "sender": self.signer.address(),
            "sequence_number": sequence_number.to_string(),
            "max_gas_amount": self.max_gas_amount.to_string(),
            "gas_unit_price": self.gas_unit_price.to_string(),
            "expiration_timestamp_secs": expiration.to_string(),
            "payload": {
                "type": "entry_function_payload",
                "function": function,
                "type_arguments": [],
                "arguments": arguments,
            },
        });

        let message = self.client.encode_submission(&txn).await.map_err(api_err)?;
        txn["signature"] = json!({
            "type": "ed25519_signature",
            "public_key": self.signer.public_key_hex(),
            "signature": self.signer.sign_hex(&message),
        });

        let hash = self.client.submit(&txn).await.map_err(api_err)?;
        debug!("Submitted Aptos transaction {} calling {}", hash, function);

        let committed = self
            .client
            .wait_for_transaction(&hash, self.confirmation_timeout, self.poll_interval)
            .await
            .map_err(api_err)?;

        if committed.success != Some(true) {
            let status = committed
                .vm_status
                .clone()
                .unwrap_or_else(|| "transaction failed without vm_status".to_string());
            return Err(ChainError::classify(Chain::Aptos, contract_id, &status));
        }

        Ok(committed)
    }

    /// Same as on EVM: an unexplained failure is checked against the contract
    async fn settle_error(&self, contract_id: &str, error: ChainError) -> ChainError {
        if error.class() != FailureClass::Fatal {
            return error;
        }

        match self.get_htlc_state(contract_id).await {
            Ok(HtlcState::Withdrawn { .. }) => ChainError::AlreadyWithdrawn {
                chain: Chain::Aptos,
                contract_id: contract_id.to_string(),
            },
            Ok(HtlcState::Refunded) => ChainError::AlreadyRefunded {
                chain: Chain::Aptos,
                contract_id: contract_id.to_string(),
            },
            _ => error,
        }
    }

    /// Look the id up through the module's hashlock index
    async fn id_by_hashlock(&self, hashlock: &Hashlock) -> Result<String, ChainError> {
        let values = self
            .client
            .view(
                &self.function("htlc_id_by_hashlock"),
                Vec::new(),
                vec![json!(hashlock.to_hex())],
            )
            .await
            .map_err(|e| e.into_chain_error(""))?;

        values
            .first()
            .and_then(value_as_string)
            .ok_or_else(|| ChainError::fatal(Chain::Aptos, "htlc_id_by_hashlock returned nothing"))
    }
}

fn rejected(reason: String) -> ChainError {
    ChainError::Rejected {
        chain: Chain::Aptos,
        reason,
    }
}

fn value_as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn parse_contract_id(contract_id: &str) -> Result<u64, ChainError> {
    contract_id
        .parse()
        .map_err(|_| rejected(format!("invalid Aptos HTLC id {:?}", contract_id)))
}

/// HTLC id carried by the created event of a committed transaction
fn created_id(txn: &AptosTransaction) -> Option<String> {
    txn.events
        .iter()
        .find(|e| e.event_type.ends_with(CREATED_EVENT_SUFFIX))
        .and_then(|e| e.data.get("id"))
        .and_then(value_as_string)
}

/// Decode `get_htlc`'s return values:
/// `[sender, receiver, amount, hashlock, timelock, withdrawn, refunded, preimage]`
pub fn parse_htlc_view(values: &[Value]) -> Result<HtlcState, String> {
    if values.len() < 8 {
        return Err(format!("get_htlc returned {} values, expected 8", values.len()));
    }

    let sender = values[0].as_str().ok_or("sender is not an address")?;
    let withdrawn = values[5].as_bool().ok_or("withdrawn is not a bool")?;
    let refunded = values[6].as_bool().ok_or("refunded is not a bool")?;

    if normalize_address(sender) == normalize_address("0x0") {
        return Ok(HtlcState::Missing);
    }
    if withdrawn {
        let preimage = values[7]
            .as_str()
            .and_then(|hex| hex.parse::<Preimage>().ok());
        return Ok(HtlcState::Withdrawn { preimage });
    }
    if refunded {
        return Ok(HtlcState::Refunded);
    }
    Ok(HtlcState::Locked)
}

fn tx_receipt(txn: &AptosTransaction) -> TxReceipt {
    TxReceipt {
        tx_hash: txn.hash.clone(),
        block_number: txn.version.as_deref().and_then(|v| v.parse().ok()),
    }
}

#[async_trait]
impl HtlcAdapter for AptosHtlcAdapter {
    fn chain(&self) -> Chain {
        Chain::Aptos
    }

    fn relayer_address(&self) -> String {
        self.signer.address().to_string()
    }

    async fn create_htlc(&self, params: &HtlcParams) -> Result<HtlcReceipt, ChainError> {
        // Move amounts are u64
        let amount: u64 = params
            .amount
            .as_str()
            .parse()
            .map_err(|_| rejected(format!("amount {} does not fit in u64", params.amount)))?;

        let txn = self
            .submit_entry(
                &self.function("create_htlc"),
                vec![
                    json!(params.receiver),
                    json!(params.hashlock.to_hex()),
                    json!(params.timelock.to_string()),
                    json!(params.token),
                    json!(amount.to_string()),
                ],
                "",
                "create_htlc",
            )
            .await?;

        let contract_id = match created_id(&txn) {
            Some(id) => id,
            None => {
                warn!(
                    "No created event in Aptos transaction {}, querying by hashlock",
                    txn.hash
                );
                self.id_by_hashlock(&params.hashlock).await?
            }
        };

        info!("Created Aptos HTLC {} for hashlock {}", contract_id, params.hashlock);
        Ok(HtlcReceipt {
            contract_id,
            tx_hash: txn.hash,
        })
    }

    async fn withdraw(&self, contract_id: &str, preimage: &Preimage) -> Result<TxReceipt, ChainError> {
        let id = parse_contract_id(contract_id)?;
        match self
            .submit_entry(
                &self.function("withdraw"),
                vec![json!(id.to_string()), json!(preimage.to_hex())],
                contract_id,
                "withdraw",
            )
            .await
        {
            Ok(txn) => Ok(tx_receipt(&txn)),
            Err(e) => Err(self.settle_error(contract_id, e).await),
        }
    }

    async fn refund(&self, contract_id: &str) -> Result<TxReceipt, ChainError> {
        let id = parse_contract_id(contract_id)?;
        match self
            .submit_entry(
                &self.function("refund"),
                vec![json!(id.to_string())],
                contract_id,
                "refund",
            )
            .await
        {
            Ok(txn) => Ok(tx_receipt(&txn)),
            Err(e) => Err(self.settle_error(contract_id, e).await),
        }
    }

    async fn get_htlc_state(&self, contract_id: &str) -> Result<HtlcState, ChainError> {
        let id = parse_contract_id(contract_id)?;
        let values = match self
            .client
            .view(&self.function("get_htlc"), Vec::new(), vec![json!(id.to_string())])
            .await
        {
            Ok(values) => values,
            Err(e) => {
                return match e.into_chain_error(contract_id) {
                    ChainError::Rejected { .. } => Ok(HtlcState::Missing),
                    ChainError::Fatal { message, .. } => {
                        Err(ChainError::transient(Chain::Aptos, message))
                    }
                    other => Err(other),
                };
            }
        };

        let state = parse_htlc_view(&values).map_err(|e| ChainError::fatal(Chain::Aptos, e))?;
        debug!("Aptos HTLC {} is {:?}", contract_id, state);
        Ok(state)
    }

    async fn health_check(&self) -> bool {
        match self.client.ledger_info().await {
            Ok(info) => {
                debug!(
                    "Aptos node at version {} (chain {}, ts {})",
                    info.ledger_version, info.chain_id, info.ledger_timestamp
                );
                true
            }
            Err(e) => {
                warn!("Aptos health check failed: {}", e);
                false
            }
        }
    }
}
