//! Off-chain and on-chain price caches
//!
//! Features:
//! - Per-feed state with one writer per field
//! - Push-fed off-chain cache that drops out-of-order updates
//! - Poll-fed on-chain cache with batched refresh
//! - Hermes WebSocket streaming source with automatic reconnection

pub mod state;
pub mod offchain;
pub mod onchain;
pub mod hermes;

pub use state::{FeedSnapshot, FeedState, FeedStates, OffChainEntry};
pub use offchain::{
    filter_valid_feeds, validate_feed, OffChainPriceCache, OffChainPriceSource, UpdateCallback, UpdateOutcome,
};
pub use onchain::{OnChainPriceCache, OnChainPriceSource, RefreshReport};
pub use hermes::{HermesStream, HermesUpdate};
