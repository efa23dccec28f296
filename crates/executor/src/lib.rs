//! Price update submission
//!
//! Features:
//! - Standard pushes: one transaction per batch, fee-escalating retries
//! - Bundled pushes: sub-bundles fanned out to relays within a retry budget
//! - Dynamic bundle tips from a tip floor endpoint
//! - Signer balance tracking

pub mod balance;
pub mod bundled;
pub mod client;
pub mod pusher;
pub mod relay;
pub mod standard;
pub mod tip;

#[cfg(test)]
mod test_utils;

pub use balance::BalanceTracker;
pub use bundled::{BundleAttempt, BundleOutcome, BundledPusher};
pub use client::{BalanceSource, BundleRelay, SignedTransaction, TransactionClient};
pub use pusher::{PushReceipt, PushStrategy, Pusher};
pub use relay::HttpRelay;
pub use standard::StandardPusher;
pub use tip::{HttpTipFloor, TipOracle, TipPolicy};
