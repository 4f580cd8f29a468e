//! Aptos chain support
//!
//! Talks to a fullnode over its REST API; transactions are encoded by the
//! node and signed locally with the relayer's Ed25519 key.

mod adapter;
pub mod client;
mod signer;
mod watcher;

pub use adapter::AptosHtlcAdapter;
pub use client::AptosClient;
pub use signer::{normalize_address, AptosSigner};
pub use watcher::AptosWatcher;
