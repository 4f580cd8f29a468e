//! Swap persistence
//!
//! Handles:
//! - Swap records and their guarded status transitions
//! - Transition history for the API
//! - Watcher checkpoints for restart recovery

mod manager;
mod memory;
mod store;

pub use manager::StateManager;
pub use memory::InMemorySwapStore;
pub use store::{StatusTransition, SwapStats, SwapStore, SwapUpdate};
