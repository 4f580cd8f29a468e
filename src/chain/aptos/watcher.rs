//! Aptos event-handle watcher

use super::client::{parse_u64, AptosClient, AptosEvent};
use crate::chain::ChainWatcher;
use crate::config::AptosConfig;
use crate::error::{RelayerError, RelayerResult};
use crate::events::{normalize_contract_id, HtlcEvent, HtlcEventKind};
use crate::state::SwapStore;
use crate::swap::{Chain, Hashlock, Preimage};

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Event handle fields on the module's `HtlcStore` resource
pub const EVENT_FIELDS: [&str; 3] = ["created_events", "withdrawn_events", "refunded_events"];

const PAGE_SIZE: u16 = 100;

/// Polls the HTLC module's event handles and forwards them to the coordinator
pub struct AptosWatcher {
    client: Arc<AptosClient>,
    store: Arc<dyn SwapStore>,
    events: mpsc::Sender<HtlcEvent>,
    module_address: String,
    event_handle: String,
    poll_interval: Duration,
}

impl AptosWatcher {
    pub fn new(
        config: &AptosConfig,
        client: Arc<AptosClient>,
        store: Arc<dyn SwapStore>,
        events: mpsc::Sender<HtlcEvent>,
    ) -> Self {
        Self {
            client,
            store,
            events,
            event_handle: format!("{}::htlc::HtlcStore", config.module_address),
            module_address: config.module_address.clone(),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
        }
    }

    fn stream(field: &str) -> String {
        format!("aptos:{}", field)
    }

    /// Forward one page of a stream; returns events forwarded
    async fn poll_stream(
        &self,
        field: &str,
        timestamps: &mut HashMap<u64, u64>,
    ) -> RelayerResult<usize> {
        let stream = Self::stream(field);
        // Checkpoint holds the next sequence number to read
        let start = self.store.get_checkpoint(&stream).await?.unwrap_or(0);

        let page = self
            .client
            .events_by_handle(&self.module_address, &self.event_handle, field, start, PAGE_SIZE)
            .await
            .map_err(|e| RelayerError::ChainConnection {
                chain: Chain::Aptos,
                message: e.to_string(),
            })?;
        if page.is_empty() {
            return Ok(0);
        }

        let mut next = start;
        let mut forwarded = 0;
        for raw in &page {
            let sequence = parse_u64("sequence_number", &raw.sequence_number)
                .map_err(|e| RelayerError::EventParsing(e.to_string()))?;
            let version = raw
                .version
                .as_deref()
                .map(|v| parse_u64("version", v))
                .transpose()
                .map_err(|e| RelayerError::EventParsing(e.to_string()))?
                .unwrap_or_default();

            let timestamp = match timestamps.get(&version) {
                Some(ts) => *ts,
                None => {
                    let ts = self
                        .client
                        .transaction_timestamp(version)
                        .await
                        .map_err(|e| RelayerError::ChainConnection {
                            chain: Chain::Aptos,
                            message: e.to_string(),
                        })?;
                    timestamps.insert(version, ts);
                    ts
                }
            };

            match decode_event(field, raw, version, timestamp) {
                Ok(Some(event)) => {
                    crate::metrics::record_event(Chain::Aptos, event.name());
                    self.events
                        .send(event)
                        .await
                        .map_err(|_| RelayerError::Internal("event queue closed".to_string()))?;
                    forwarded += 1;
                }
                Ok(None) => debug!("Skipping unrecognized Aptos event {}", raw.event_type),
                Err(e) => warn!("Failed to decode Aptos event {} #{}: {}", field, sequence, e),
            }
            next = sequence + 1;
        }

        self.store.save_checkpoint(&stream, next).await?;
        crate::metrics::record_checkpoint(Chain::Aptos, next);
        Ok(forwarded)
    }
}

#[async_trait]
impl ChainWatcher for AptosWatcher {
    fn chain(&self) -> Chain {
        Chain::Aptos
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    async fn poll_once(&self) -> RelayerResult<usize> {
        let mut timestamps = HashMap::new();
        let mut forwarded = 0;
        for field in EVENT_FIELDS {
            forwarded += self.poll_stream(field, &mut timestamps).await?;
        }
        Ok(forwarded)
    }
}

fn field<'a>(data: &'a Value, name: &str) -> RelayerResult<&'a str> {
    data.get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| RelayerError::EventParsing(format!("missing string field {}", name)))
}

/// Normalize one event from the given handle field
pub fn decode_event(
    handle_field: &str,
    raw: &AptosEvent,
    version: u64,
    block_timestamp: u64,
) -> RelayerResult<Option<HtlcEvent>> {
    let data = &raw.data;
    let parse_err = |e: String| RelayerError::EventParsing(e);

    let kind = match handle_field {
        "created_events" => HtlcEventKind::Created {
            sender: field(data, "sender")?.to_string(),
            receiver: field(data, "receiver")?.to_string(),
            token: field(data, "token")?.to_string(),
            amount: field(data, "amount")?.parse().map_err(parse_err)?,
            hashlock: field(data, "hashlock")?
                .parse::<Hashlock>()
                .map_err(|e| parse_err(e.to_string()))?,
            timelock: parse_u64("timelock", field(data, "timelock")?)
                .map_err(|e| parse_err(e.to_string()))?,
        },
        "withdrawn_events" => {
            let hex_preimage = field(data, "preimage")?;
            let bytes = hex::decode(hex_preimage.trim_start_matches("0x"))
                .map_err(|e| parse_err(e.to_string()))?;
            HtlcEventKind::Withdrawn {
                preimage: Preimage::new(bytes).map_err(|e| parse_err(e.to_string()))?,
            }
        }
        "refunded_events" => HtlcEventKind::Refunded,
        _ => return Ok(None),
    };

    Ok(Some(HtlcEvent {
        chain: Chain::Aptos,
        contract_id: normalize_contract_id(Chain::Aptos, field(data, "id")?),
        kind,
        block_timestamp,
        block_number: version,
        tx_hash: format!("version:{}", version),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(event_type: &str, data: Value) -> AptosEvent {
        AptosEvent {
            version: Some("981".into()),
            sequence_number: "4".into(),
            event_type: event_type.into(),
            data,
        }
    }

    #[test]
    fn test_decode_created_event() {
        let event = decode_event(
            "created_events",
            &raw(
                "0xcafe::htlc::HtlcCreatedEvent",
                json!({
                    "id": "12",
                    "sender": "0xaa",
                    "receiver": "0xbb",
                    "token": "0xa",
                    "amount": "250000000",
                    "hashlock": "0x2bb80d537b1da3e38bd30361aa855686bde0eacd7162fef6a25fe97bf527a25b",
                    "timelock": "1700003600"
                }),
            ),
            981,
            1_700_000_000,
        )
        .unwrap()
        .unwrap();

        assert_eq!(event.chain, Chain::Aptos);
        assert_eq!(event.contract_id, "12");
        assert_eq!(event.block_number, 981);
        match event.kind {
            HtlcEventKind::Created {
                amount, timelock, hashlock, ..
            } => {
                assert_eq!(amount.as_str(), "250000000");
                assert_eq!(timelock, 1_700_003_600);
                let secret = Preimage::new(b"secret".to_vec()).unwrap();
                assert!(secret.verify(&hashlock));
            }
            other => panic!("unexpected kind {:?}", other),
        }
    }

    #[test]
    fn test_decode_withdrawn_event() {
        let event = decode_event(
            "withdrawn_events",
            &raw(
                "0xcafe::htlc::HtlcWithdrawnEvent",
                json!({"id": "12", "preimage": "0x736563726574"}),
            ),
            990,
            0,
        )
        .unwrap()
        .unwrap();
        assert_eq!(event.preimage().unwrap().as_bytes(), b"secret");
    }

    #[test]
    fn test_decode_rejects_missing_fields_and_skips_unknown_handles() {
        let missing = decode_event(
            "refunded_events",
            &raw("0xcafe::htlc::HtlcRefundedEvent", json!({})),
            1,
            0,
        );
        assert!(missing.is_err());

        let unknown = decode_event("other_events", &raw("x", json!({"id": "1"})), 1, 0).unwrap();
        assert!(unknown.is_none());
    }
}
