//! Swap domain types
//!
//! A swap pairs two HTLC legs, one per chain, sharing a single hashlock.

pub mod model;
pub mod secret;
pub mod status;

pub use model::{Amount, Chain, LegRole, Swap, SwapDirection, SwapRequest};
pub use secret::{Hashlock, Preimage, SecretParseError};
pub use status::SwapStatus;
