//! EVM chain support
//!
//! - Multi-RPC provider with failover
//! - HTLC contract bindings and log decoding
//! - Confirmation tracking for submitted transactions
//! - Log watcher and [`HtlcAdapter`](crate::chain::HtlcAdapter) implementation

mod adapter;
pub mod contract;
mod finality;
pub(crate) mod provider;
mod watcher;

pub use adapter::EvmHtlcAdapter;
pub use finality::{Confirmation, ConfirmationTracker};
pub use provider::{EvmProvider, GasPrice};
pub use watcher::EvmWatcher;
