//! Hashlock and preimage types
//!
//! Hashlocks are SHA-256 digests, the same hash both HTLC contracts check on
//! withdrawal.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Errors from parsing hex-encoded secrets
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SecretParseError {
    #[error("invalid hex: {0}")]
    InvalidHex(String),

    #[error("hashlock must be 32 bytes, got {0}")]
    InvalidLength(usize),

    #[error("preimage must not be empty")]
    EmptyPreimage,
}

fn decode_hex(input: &str) -> Result<Vec<u8>, SecretParseError> {
    let trimmed = input.strip_prefix("0x").unwrap_or(input);
    hex::decode(trimmed).map_err(|e| SecretParseError::InvalidHex(e.to_string()))
}

/// SHA-256 commitment fixed when a swap is created
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Hashlock([u8; 32]);

impl Hashlock {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Hash a preimage into the lock it opens
    pub fn from_preimage(preimage: &Preimage) -> Self {
        let digest = Sha256::digest(preimage.as_bytes());
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        Self(out)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }
}

impl FromStr for Hashlock {
    type Err = SecretParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = decode_hex(s)?;
        let array: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| SecretParseError::InvalidLength(bytes.len()))?;
        Ok(Self(array))
    }
}

impl TryFrom<String> for Hashlock {
    type Error = SecretParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Hashlock> for String {
    fn from(value: Hashlock) -> Self {
        value.to_hex()
    }
}

impl fmt::Display for Hashlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Hashlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hashlock({})", self.to_hex())
    }
}

/// Secret revealed on-chain when an HTLC leg is withdrawn
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Preimage(Vec<u8>);

impl Preimage {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Self, SecretParseError> {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Err(SecretParseError::EmptyPreimage);
        }
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(&self.0))
    }

    /// True when this preimage opens the given hashlock
    pub fn verify(&self, hashlock: &Hashlock) -> bool {
        Hashlock::from_preimage(self) == *hashlock
    }
}

impl FromStr for Preimage {
    type Err = SecretParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(decode_hex(s)?)
    }
}

impl TryFrom<String> for Preimage {
    type Error = SecretParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Preimage> for String {
    fn from(value: Preimage) -> Self {
        value.to_hex()
    }
}

// Never print the secret itself in logs.
impl fmt::Debug for Preimage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Preimage({} bytes)", self.0.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_hashes_to_known_digest() {
        let preimage = Preimage::new(b"secret".to_vec()).unwrap();
        let hashlock = Hashlock::from_preimage(&preimage);
        assert_eq!(
            hashlock.to_hex(),
            "0x2bb80d537b1da3e38bd30361aa855686bde0eacd7162fef6a25fe97bf527a25b"
        );
        assert!(preimage.verify(&hashlock));
    }

    #[test]
    fn test_wrong_preimage_does_not_verify() {
        let hashlock = Hashlock::from_preimage(&Preimage::new(b"secret".to_vec()).unwrap());
        let wrong = Preimage::new(b"not-the-secret".to_vec()).unwrap();
        assert!(!wrong.verify(&hashlock));
    }

    #[test]
    fn test_hashlock_parse_with_and_without_prefix() {
        let hex = "2bb80d537b1da3e38bd30361aa855686bde0eacd7162fef6a25fe97bf527a25b";
        let a: Hashlock = hex.parse().unwrap();
        let b: Hashlock = format!("0x{}", hex).parse().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_hashlock_rejects_wrong_length() {
        let err = "0xabcd".parse::<Hashlock>().unwrap_err();
        assert_eq!(err, SecretParseError::InvalidLength(2));
    }

    #[test]
    fn test_empty_preimage_rejected() {
        assert_eq!(Preimage::new(Vec::new()), Err(SecretParseError::EmptyPreimage));
        assert!("0x".parse::<Preimage>().is_err());
    }

    #[test]
    fn test_preimage_debug_hides_secret() {
        let preimage = Preimage::new(b"secret".to_vec()).unwrap();
        assert_eq!(format!("{:?}", preimage), "Preimage(6 bytes)");
    }
}
