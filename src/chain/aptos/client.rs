//! Minimal Aptos node REST client

use crate::error::ChainError;
use crate::swap::Chain;

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Errors from the node API before they are tied to a contract
#[derive(Debug, thiserror::Error)]
pub enum AptosApiError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP {status} ({error_code:?}): {message}")]
    Api {
        status: u16,
        message: String,
        error_code: Option<String>,
    },

    #[error("unexpected response: {0}")]
    Decode(String),

    #[error("timed out waiting for transaction {0}")]
    Timeout(String),
}

impl AptosApiError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, AptosApiError::Api { status: 404, .. })
    }

    /// Classify for an action on `contract_id`
    pub fn into_chain_error(self, contract_id: &str) -> ChainError {
        match self {
            AptosApiError::Http(e) => ChainError::transient(Chain::Aptos, e.to_string()),
            AptosApiError::Timeout(hash) => {
                ChainError::transient(Chain::Aptos, format!("timeout waiting for {}", hash))
            }
            AptosApiError::Api { status, message, .. } if status == 429 || status >= 500 => {
                ChainError::transient(Chain::Aptos, format!("HTTP {}: {}", status, message))
            }
            AptosApiError::Api { message, .. } => {
                ChainError::classify(Chain::Aptos, contract_id, &message)
            }
            AptosApiError::Decode(message) => ChainError::fatal(Chain::Aptos, message),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    message: String,
    error_code: Option<String>,
}

/// Node ledger summary
#[derive(Debug, Clone, Deserialize)]
pub struct LedgerInfo {
    pub chain_id: u8,
    pub ledger_version: String,
    pub ledger_timestamp: String,
}

/// Event as returned by the events and transaction endpoints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AptosEvent {
    /// Present on event-handle queries, absent inside transactions
    #[serde(default)]
    pub version: Option<String>,
    pub sequence_number: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: Value,
}

/// A transaction as returned by the node, pending or committed
#[derive(Debug, Clone, Deserialize)]
pub struct AptosTransaction {
    #[serde(rename = "type")]
    pub kind: String,
    pub hash: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub vm_status: Option<String>,
    /// Microseconds since epoch
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub events: Vec<AptosEvent>,
}

impl AptosTransaction {
    pub fn is_pending(&self) -> bool {
        self.kind == "pending_transaction"
    }
}

pub fn parse_u64(field: &str, value: &str) -> Result<u64, AptosApiError> {
    value
        .parse()
        .map_err(|_| AptosApiError::Decode(format!("{} is not a u64: {:?}", field, value)))
}

/// REST client for one fullnode
pub struct AptosClient {
    http: reqwest::Client,
    base_url: String,
}

impl AptosClient {
    /// `node_url` is the API root, e.g. `https://fullnode.testnet.aptoslabs.com/v1`
    pub fn new(node_url: &str, request_timeout: Duration) -> Result<Self, AptosApiError> {
        let http = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            http,
            base_url: node_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        if path.is_empty() {
            self.base_url.clone()
        } else {
            format!("{}/{}", self.base_url, path.trim_start_matches('/'))
        }
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, AptosApiError> {
        let status = response.status();
        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|e| AptosApiError::Decode(e.to_string()));
        }

        let body = response.text().await.unwrap_or_default();
        Err(api_error(status, &body))
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, AptosApiError> {
        let response = self.http.get(self.url(path)).query(query).send().await?;
        Self::decode(response).await
    }

    async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, AptosApiError> {
        let response = self.http.post(self.url(path)).json(body).send().await?;
        Self::decode(response).await
    }

    pub async fn ledger_info(&self) -> Result<LedgerInfo, AptosApiError> {
        self.get_json("", &[]).await
    }

    pub async fn sequence_number(&self, address: &str) -> Result<u64, AptosApiError> {
        #[derive(Deserialize)]
        struct AccountData {
            sequence_number: String,
        }

        let account: AccountData = self.get_json(&format!("accounts/{}", address), &[]).await?;
        parse_u64("sequence_number", &account.sequence_number)
    }

    /// Events emitted to `{address}::{struct_tag}.{field}` starting at sequence `start`
    pub async fn events_by_handle(
        &self,
        address: &str,
        event_handle: &str,
        field: &str,
        start: u64,
        limit: u16,
    ) -> Result<Vec<AptosEvent>, AptosApiError> {
        let path = format!("accounts/{}/events/{}/{}", address, event_handle, field);
        let query = [("start", start.to_string()), ("limit", limit.to_string())];

        match self.get_json(&path, &query).await {
            // No events emitted yet
            Err(e) if e.is_not_found() => Ok(Vec::new()),
            other => other,
        }
    }

    /// Commit time of a transaction version, seconds since epoch
    pub async fn transaction_timestamp(&self, version: u64) -> Result<u64, AptosApiError> {
        let txn: AptosTransaction = self
            .get_json(&format!("transactions/by_version/{}", version), &[])
            .await?;
        let micros = txn
            .timestamp
            .ok_or_else(|| AptosApiError::Decode(format!("version {} has no timestamp", version)))?;
        Ok(parse_u64("timestamp", &micros)? / 1_000_000)
    }

    /// Call a view function
    pub async fn view(
        &self,
        function: &str,
        type_arguments: Vec<String>,
        arguments: Vec<Value>,
    ) -> Result<Vec<Value>, AptosApiError> {
        let body = serde_json::json!({
            "function": function,
            "type_arguments": type_arguments,
            "arguments": arguments,
        });
        self.post_json("view", &body).await
    }

    /// BCS signing message for an unsigned transaction
    pub async fn encode_submission(&self, unsigned: &Value) -> Result<Vec<u8>, AptosApiError> {
        let encoded: String = self
            .post_json("transactions/encode_submission", unsigned)
            .await?;
        hex::decode(encoded.trim_start_matches("0x"))
            .map_err(|e| AptosApiError::Decode(format!("signing message: {}", e)))
    }

    /// Submit a signed transaction, returning its hash
    pub async fn submit(&self, signed: &Value) -> Result<String, AptosApiError> {
        let pending: AptosTransaction = self.post_json("transactions", signed).await?;
        Ok(pending.hash)
    }

    /// Wait for `hash` to commit. Pending or unknown transactions are polled
    /// until `timeout` elapses.
    pub async fn wait_for_transaction(
        &self,
        hash: &str,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<AptosTransaction, AptosApiError> {
        let deadline = Instant::now() + timeout;
        let path = format!("transactions/wait_by_hash/{}", hash);

        loop {
            match self.get_json::<AptosTransaction>(&path, &[]).await {
                Ok(txn) if !txn.is_pending() => return Ok(txn),
                Ok(_) => debug!("Transaction {} still pending", hash),
                Err(e) if e.is_not_found() => debug!("Transaction {} not yet known", hash),
                Err(AptosApiError::Http(e)) if e.is_timeout() => {}
                Err(e) => return Err(e),
            }

            if Instant::now() + poll_interval > deadline {
                return Err(AptosApiError::Timeout(hash.to_string()));
            }
            tokio::time::sleep(poll_interval).await;
        }
    }
}

fn api_error(status: StatusCode, body: &str) -> AptosApiError {
    match serde_json::from_str::<ApiErrorBody>(body) {
        Ok(parsed) => AptosApiError::Api {
            status: status.as_u16(),
            message: parsed.message,
            error_code: parsed.error_code,
        },
        Err(_) => AptosApiError::Api {
            status: status.as_u16(),
            message: body.to_string(),
            error_code: None,
        },
    }
}
