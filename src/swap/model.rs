//! Swap record and the request that creates it

use super::secret::{Hashlock, Preimage};
use super::status::SwapStatus;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Chains a swap leg can live on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Chain {
    Evm,
    Aptos,
}

impl Chain {
    pub fn other(&self) -> Chain {
        match self {
            Chain::Evm => Chain::Aptos,
            Chain::Aptos => Chain::Evm,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Chain::Evm => "evm",
            Chain::Aptos => "aptos",
        }
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which chain holds the user's initiating lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SwapDirection {
    EvmToAptos,
    AptosToEvm,
}

impl SwapDirection {
    pub fn source(&self) -> Chain {
        match self {
            SwapDirection::EvmToAptos => Chain::Evm,
            SwapDirection::AptosToEvm => Chain::Aptos,
        }
    }

    pub fn destination(&self) -> Chain {
        self.source().other()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SwapDirection::EvmToAptos => "EVM_TO_APTOS",
            SwapDirection::AptosToEvm => "APTOS_TO_EVM",
        }
    }
}

impl FromStr for SwapDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "EVM_TO_APTOS" => Ok(SwapDirection::EvmToAptos),
            "APTOS_TO_EVM" => Ok(SwapDirection::AptosToEvm),
            other => Err(format!("unknown swap direction: {}", other)),
        }
    }
}

/// Which side of a swap a leg belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegRole {
    /// Locked by the user, received by the relayer
    Source,
    /// Locked by the relayer for the recipient
    Destination,
}

/// Token amount in base units, kept as a decimal string so no precision is
/// lost between chains with different integer widths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Amount(String);

impl Amount {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.bytes().all(|b| b == b'0')
    }
}

impl FromStr for Amount {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(format!("amount must be a non-negative integer string: {:?}", s));
        }
        // Strip leading zeros so equal amounts compare equal.
        let normalized = s.trim_start_matches('0');
        let normalized = if normalized.is_empty() { "0" } else { normalized };
        Ok(Self(normalized.to_string()))
    }
}

impl TryFrom<String> for Amount {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Amount> for String {
    fn from(value: Amount) -> Self {
        value.0
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Validated swap intent submitted through the API
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwapRequest {
    pub direction: SwapDirection,
    pub sender: String,
    pub recipient: String,
    pub from_token_address: String,
    pub to_token_address: String,
    pub amount: Amount,
    pub hashlock: Hashlock,
    pub timelock: u64,
}

/// A cross-chain swap and both of its HTLC legs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Swap {
    pub id: String,
    pub direction: SwapDirection,
    pub status: SwapStatus,
    pub sender: String,
    pub recipient: String,
    pub from_token_address: String,
    pub to_token_address: String,
    pub amount: Amount,
    pub evm_htlc_address: Option<String>,
    pub aptos_htlc_address: Option<String>,
    pub hashlock: Hashlock,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preimage: Option<Preimage>,
    /// Source leg expiry, seconds since epoch
    pub timelock: u64,
    /// Destination leg expiry, always earlier than `timelock`
    pub destination_timelock: u64,
    pub error_message: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl Swap {
    pub fn new(
        id: String,
        request: SwapRequest,
        destination_timelock: u64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            direction: request.direction,
            status: SwapStatus::Pending,
            sender: request.sender,
            recipient: request.recipient,
            from_token_address: request.from_token_address,
            to_token_address: request.to_token_address,
            amount: request.amount,
            evm_htlc_address: None,
            aptos_htlc_address: None,
            hashlock: request.hashlock,
            preimage: None,
            timelock: request.timelock,
            destination_timelock,
            error_message: None,
            timestamp: now,
            updated_at: now,
            completed_at: None,
            cancelled_at: None,
        }
    }

    pub fn source_chain(&self) -> Chain {
        self.direction.source()
    }

    pub fn destination_chain(&self) -> Chain {
        self.direction.destination()
    }

    pub fn htlc_address(&self, chain: Chain) -> Option<&str> {
        match chain {
            Chain::Evm => self.evm_htlc_address.as_deref(),
            Chain::Aptos => self.aptos_htlc_address.as_deref(),
        }
    }

    /// Role of the leg stored under `address` on `chain`, if it is one of ours
    pub fn leg_for_address(&self, chain: Chain, address: &str) -> Option<LegRole> {
        if self.htlc_address(chain) != Some(address) {
            return None;
        }
        if chain == self.source_chain() {
            Some(LegRole::Source)
        } else {
            Some(LegRole::Destination)
        }
    }

    /// Legs that have an on-chain contract, source first
    pub fn legs(&self) -> Vec<(Chain, String)> {
        [self.source_chain(), self.destination_chain()]
            .into_iter()
            .filter_map(|chain| self.htlc_address(chain).map(|a| (chain, a.to_string())))
            .collect()
    }

    /// Expiry of the leg on `chain`
    pub fn timelock_for(&self, chain: Chain) -> u64 {
        if chain == self.source_chain() {
            self.timelock
        } else {
            self.destination_timelock
        }
    }

    /// Token contract of the leg on `chain`
    pub fn token_for(&self, chain: Chain) -> &str {
        if chain == self.source_chain() {
            &self.from_token_address
        } else {
            &self.to_token_address
        }
    }

    pub fn is_expired(&self, now: u64) -> bool {
        self.timelock < now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(direction: SwapDirection) -> SwapRequest {
        SwapRequest {
            direction,
            sender: "0xsender".to_string(),
            recipient: "0xrecipient".to_string(),
            from_token_address: "0xfrom".to_string(),
            to_token_address: "0x1::aptos_coin::AptosCoin".to_string(),
            amount: "1000".parse().unwrap(),
            hashlock: Hashlock::new([7u8; 32]),
            timelock: 10_000,
        }
    }

    #[test]
    fn test_new_swap_is_pending_without_legs() {
        let swap = Swap::new("id".into(), request(SwapDirection::EvmToAptos), 9_000, Utc::now());
        assert_eq!(swap.status, SwapStatus::Pending);
        assert!(swap.legs().is_empty());
        assert_eq!(swap.source_chain(), Chain::Evm);
        assert_eq!(swap.destination_chain(), Chain::Aptos);
    }

    #[test]
    fn test_legs_and_timelocks_follow_direction() {
        let mut swap = Swap::new("id".into(), request(SwapDirection::AptosToEvm), 9_000, Utc::now());
        swap.evm_htlc_address = Some("0xdest".into());
        swap.aptos_htlc_address = Some("7".into());

        assert_eq!(
            swap.legs(),
            vec![(Chain::Aptos, "7".to_string()), (Chain::Evm, "0xdest".to_string())]
        );
        assert_eq!(swap.timelock_for(Chain::Aptos), 10_000);
        assert_eq!(swap.timelock_for(Chain::Evm), 9_000);
        assert_eq!(swap.token_for(Chain::Aptos), "0xfrom");
        assert_eq!(swap.leg_for_address(Chain::Aptos, "7"), Some(LegRole::Source));
        assert_eq!(swap.leg_for_address(Chain::Evm, "0xdest"), Some(LegRole::Destination));
        assert_eq!(swap.leg_for_address(Chain::Evm, "7"), None);
    }

    #[test]
    fn test_amount_parsing() {
        let amount: Amount = "000123456789012345678901234567890".parse().unwrap();
        assert_eq!(amount.as_str(), "123456789012345678901234567890");
        assert!("0".parse::<Amount>().unwrap().is_zero());
        assert!("1.5".parse::<Amount>().is_err());
        assert!("-1".parse::<Amount>().is_err());
        assert!("".parse::<Amount>().is_err());
    }

    #[test]
    fn test_request_deserializes_from_camel_case() {
        let json = serde_json::json!({
            "direction": "EVM_TO_APTOS",
            "sender": "0xabc",
            "recipient": "0xdef",
            "fromTokenAddress": "0x01",
            "toTokenAddress": "0x1::aptos_coin::AptosCoin",
            "amount": "5000",
            "hashlock": "0x2bb80d537b1da3e38bd30361aa855686bde0eacd7162fef6a25fe97bf527a25b",
            "timelock": 1_700_003_600u64
        });
        let request: SwapRequest = serde_json::from_value(json).unwrap();
        assert_eq!(request.direction, SwapDirection::EvmToAptos);
        assert_eq!(request.amount.as_str(), "5000");
    }
}
