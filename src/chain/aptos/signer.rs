//! Ed25519 account key for the relayer's Aptos account

use crate::error::{RelayerError, RelayerResult};

use ed25519_dalek::{Signer, SigningKey};
use sha3::{Digest, Sha3_256};

/// Single-key Ed25519 authentication scheme byte
const ED25519_SCHEME: u8 = 0x00;

pub struct AptosSigner {
    key: SigningKey,
    address: String,
}

impl AptosSigner {
    /// Parse a hex private key, with or without `0x` or the `ed25519-priv-` prefix
    pub fn from_hex(input: &str) -> RelayerResult<Self> {
        let trimmed = input.trim();
        let trimmed = trimmed.strip_prefix("ed25519-priv-").unwrap_or(trimmed);
        let trimmed = trimmed.strip_prefix("0x").unwrap_or(trimmed);

        let bytes = hex::decode(trimmed)
            .map_err(|e| RelayerError::Wallet(format!("Invalid Aptos private key: {}", e)))?;
        let seed: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            RelayerError::Wallet(format!("Aptos private key must be 32 bytes, got {}", bytes.len()))
        })?;

        let key = SigningKey::from_bytes(&seed);
        let address = derive_address(&key.verifying_key().to_bytes());
        Ok(Self { key, address })
    }

    /// Load the key from the environment variable named by `env_name`
    pub fn from_env(env_name: &str) -> RelayerResult<Self> {
        let key = std::env::var(env_name)
            .map_err(|_| RelayerError::Wallet(format!("No Aptos key configured. Set {}", env_name)))?;
        Self::from_hex(&key)
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn public_key_hex(&self) -> String {
        format!("0x{}", hex::encode(self.key.verifying_key().to_bytes()))
    }

    /// Sign a BCS signing message, returning the 0x-prefixed signature
    pub fn sign_hex(&self, message: &[u8]) -> String {
        format!("0x{}", hex::encode(self.key.sign(message).to_bytes()))
    }
}

/// Account address of a single Ed25519 key: `sha3_256(pubkey || 0x00)`
pub fn derive_address(public_key: &[u8; 32]) -> String {
    let mut hasher = Sha3_256::new();
    hasher.update(public_key);
    hasher.update([ED25519_SCHEME]);
    format!("0x{}", hex::encode(hasher.finalize()))
}

/// Canonical long form of an account address for comparisons
pub fn normalize_address(address: &str) -> String {
    let trimmed = address.trim();
    let raw = trimmed.strip_prefix("0x").unwrap_or(trimmed).to_ascii_lowercase();
    format!("0x{:0>64}", raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "0x9bf49a6a0755f953811fce125f2683d50429c3bb49e074147e0089a52eae155f";

    #[test]
    fn test_address_derivation() {
        let signer = AptosSigner::from_hex(KEY).unwrap();
        assert_eq!(
            signer.public_key_hex(),
            "0xb9c6ee1630ef3e711144a648db06bbb2284f7274cfbee53ffcee503cc1a49200"
        );
        assert_eq!(
            signer.address(),
            "0x7deeccb1080854f499ec8b4c1b213b82c5e34b925cf6875fec02d4b77adbd2d6"
        );
    }

    #[test]
    fn test_signature_is_deterministic() {
        let signer = AptosSigner::from_hex(&format!("ed25519-priv-{}", KEY)).unwrap();
        assert_eq!(
            signer.sign_hex(b"hello"),
            "0x26265ae9acbbce3ab9954589738e1a059d46aaafe6aaa1a5081707bf03e8dddcbfcf5be95b62a4cf2396d1a258417bb0a5a5c5aff3236bce4c5c368443572b08"
        );
    }

    #[test]
    fn test_rejects_short_key() {
        assert!(AptosSigner::from_hex("0x1234").is_err());
    }

    #[test]
    fn test_normalize_address_pads_short_form() {
        assert_eq!(normalize_address("0x1"), format!("0x{}1", "0".repeat(63)));
        assert_eq!(normalize_address("0xABC"), normalize_address("0x0abc"));
    }
}
