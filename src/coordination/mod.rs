//! Swap coordination
//!
//! The coordinator:
//! 1. Validates and records swap intents
//! 2. Reacts to HTLC events from both watchers
//! 3. Locks destination legs and claims source legs with revealed preimages
//! 4. Refunds expired swaps on a timer

mod clock;
mod engine;
mod queue;

#[cfg(test)]
pub use clock::ManualClock;
pub use clock::{Clock, SystemClock};
pub use engine::{Coordinator, CoordinatorSettings, SweepReport};
