//! HTLC contract bindings and log decoding

use crate::error::{RelayerError, RelayerResult};
use crate::events::{normalize_contract_id, HtlcEvent, HtlcEventKind};
use crate::swap::{Chain, Hashlock, Preimage};

use ethers::contract::{abigen, parse_log, EthEvent, EthLogDecode};
use ethers::types::{Address, Bytes, Log, H256, U256};

abigen!(
    HtlcContract,
    r#"[
        function newContract(address receiver, bytes32 hashlock, uint256 timelock, address token, uint256 amount) external payable returns (bytes32)
        function withdraw(bytes32 contractId, bytes preimage) external returns (bool)
        function refund(bytes32 contractId) external returns (bool)
        function getContract(bytes32 contractId) external view returns (address, address, address, uint256, bytes32, uint256, bool, bool, bytes)
    ]"#
);

abigen!(
    Erc20,
    r#"[
        function allowance(address owner, address spender) external view returns (uint256)
        function approve(address spender, uint256 amount) external returns (bool)
    ]"#
);

#[derive(Clone, Debug, PartialEq, EthEvent)]
#[ethevent(
    name = "HTLCCreated",
    abi = "HTLCCreated(bytes32,address,address,address,uint256,bytes32,uint256)"
)]
pub struct HtlcCreatedLog {
    #[ethevent(indexed)]
    pub contract_id: [u8; 32],
    #[ethevent(indexed)]
    pub sender: Address,
    #[ethevent(indexed)]
    pub receiver: Address,
    pub token: Address,
    pub amount: U256,
    pub hashlock: [u8; 32],
    pub timelock: U256,
}

#[derive(Clone, Debug, PartialEq, EthEvent)]
#[ethevent(name = "HTLCWithdrawn", abi = "HTLCWithdrawn(bytes32,bytes)")]
pub struct HtlcWithdrawnLog {
    #[ethevent(indexed)]
    pub contract_id: [u8; 32],
    pub preimage: Bytes,
}

#[derive(Clone, Debug, PartialEq, EthEvent)]
#[ethevent(name = "HTLCRefunded", abi = "HTLCRefunded(bytes32)")]
pub struct HtlcRefundedLog {
    #[ethevent(indexed)]
    pub contract_id: [u8; 32],
}

/// Topics the watcher filters on
pub fn event_signatures() -> Vec<H256> {
    vec![
        HtlcCreatedLog::signature(),
        HtlcWithdrawnLog::signature(),
        HtlcRefundedLog::signature(),
    ]
}

/// Hex form of a bytes32 contract id as stored on swaps
pub fn contract_id_hex(id: &[u8; 32]) -> String {
    normalize_contract_id(Chain::Evm, &hex::encode(id))
}

/// Parse a stored contract id back into bytes32
pub fn parse_contract_id(contract_id: &str) -> RelayerResult<[u8; 32]> {
    let raw = contract_id.strip_prefix("0x").unwrap_or(contract_id);
    let bytes = hex::decode(raw)
        .map_err(|e| RelayerError::Validation(format!("invalid contract id {}: {}", contract_id, e)))?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| RelayerError::Validation(format!("contract id {} is not 32 bytes", contract_id)))
}

fn address_hex(address: Address) -> String {
    format!("{:?}", address)
}

/// Decode one HTLC log. Returns `None` for topics this relayer does not handle.
pub fn decode_htlc_log(log: &Log, block_timestamp: u64) -> RelayerResult<Option<HtlcEvent>> {
    let Some(topic) = log.topics.first().copied() else {
        return Ok(None);
    };

    let (contract_id, kind) = if topic == HtlcCreatedLog::signature() {
        let created: HtlcCreatedLog = decode(log)?;
        let kind = HtlcEventKind::Created {
            sender: address_hex(created.sender),
            receiver: address_hex(created.receiver),
            token: address_hex(created.token),
            amount: created
                .amount
                .to_string()
                .parse()
                .map_err(RelayerError::EventParsing)?,
            hashlock: Hashlock::new(created.hashlock),
            timelock: u256_to_u64(created.timelock, "timelock")?,
        };
        (created.contract_id, kind)
    } else if topic == HtlcWithdrawnLog::signature() {
        let withdrawn: HtlcWithdrawnLog = decode(log)?;
        let preimage = Preimage::new(withdrawn.preimage.to_vec())
            .map_err(|e| RelayerError::EventParsing(e.to_string()))?;
        (withdrawn.contract_id, HtlcEventKind::Withdrawn { preimage })
    } else if topic == HtlcRefundedLog::signature() {
        let refunded: HtlcRefundedLog = decode(log)?;
        (refunded.contract_id, HtlcEventKind::Refunded)
    } else {
        return Ok(None);
    };

    Ok(Some(HtlcEvent {
        chain: Chain::Evm,
        contract_id: contract_id_hex(&contract_id),
        kind,
        block_timestamp,
        block_number: log.block_number.map(|b| b.as_u64()).unwrap_or_default(),
        tx_hash: log
            .transaction_hash
            .map(|h| format!("{:?}", h))
            .unwrap_or_default(),
    }))
}

fn decode<T: EthLogDecode>(log: &Log) -> RelayerResult<T> {
    parse_log(log.clone()).map_err(|e| RelayerError::EventParsing(e.to_string()))
}

fn u256_to_u64(value: U256, field: &str) -> RelayerResult<u64> {
    if value > U256::from(u64::MAX) {
        return Err(RelayerError::EventParsing(format!("{} overflows u64: {}", field, value)));
    }
    Ok(value.as_u64())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::abi::{encode, Token};
    use ethers::types::U64;

    fn log(topics: Vec<H256>, data: Vec<u8>) -> Log {
        Log {
            topics,
            data: Bytes::from(data),
            block_number: Some(U64::from(42)),
            transaction_hash: Some(H256::repeat_byte(0xee)),
            ..Default::default()
        }
    }

    #[test]
    fn test_decode_created_log() {
        let preimage = Preimage::new(b"secret".to_vec()).unwrap();
        let hashlock = Hashlock::from_preimage(&preimage);
        let sender = Address::repeat_byte(0x11);
        let receiver = Address::repeat_byte(0x22);
        let token = Address::repeat_byte(0x33);

        let data = encode(&[
            Token::Address(token),
            Token::Uint(U256::from_dec_str("1000000000000000000000").unwrap()),
            Token::FixedBytes(hashlock.as_bytes().to_vec()),
            Token::Uint(U256::from(1_700_003_600u64)),
        ]);
        let raw = log(
            vec![
                HtlcCreatedLog::signature(),
                H256::repeat_byte(0xAB),
                H256::from(sender),
                H256::from(receiver),
            ],
            data,
        );

        let event = decode_htlc_log(&raw, 1_700_000_000).unwrap().unwrap();
        assert_eq!(event.chain, Chain::Evm);
        assert_eq!(event.contract_id, format!("0x{}", "ab".repeat(32)));
        assert_eq!(event.block_number, 42);
        match event.kind {
            HtlcEventKind::Created {
                sender: s,
                receiver: r,
                amount,
                hashlock: h,
                timelock,
                ..
            } => {
                assert_eq!(s, format!("0x{}", "11".repeat(20)));
                assert_eq!(r, format!("0x{}", "22".repeat(20)));
                assert_eq!(amount.as_str(), "1000000000000000000000");
                assert_eq!(h, hashlock);
                assert_eq!(timelock, 1_700_003_600);
            }
            other => panic!("unexpected kind {:?}", other),
        }
    }

    #[test]
    fn test_decode_withdrawn_log_carries_preimage() {
        let data = encode(&[Token::Bytes(b"secret".to_vec())]);
        let raw = log(
            vec![HtlcWithdrawnLog::signature(), H256::repeat_byte(0x01)],
            data,
        );

        let event = decode_htlc_log(&raw, 0).unwrap().unwrap();
        assert_eq!(event.preimage().unwrap().as_bytes(), b"secret");
    }

    #[test]
    fn test_decode_refunded_and_unknown_logs() {
        let raw = log(vec![HtlcRefundedLog::signature(), H256::repeat_byte(0x02)], Vec::new());
        let event = decode_htlc_log(&raw, 0).unwrap().unwrap();
        assert_eq!(event.kind, HtlcEventKind::Refunded);

        let unknown = log(vec![H256::repeat_byte(0x99)], Vec::new());
        assert!(decode_htlc_log(&unknown, 0).unwrap().is_none());
    }

    #[test]
    fn test_contract_id_round_trip() {
        let id = [0xCDu8; 32];
        let hex_id = contract_id_hex(&id);
        assert_eq!(parse_contract_id(&hex_id).unwrap(), id);
        assert!(parse_contract_id("0x1234").is_err());
    }
}
