//! Update scheduling
//!
//! Features:
//! - Pure staleness / deviation / confidence update policy
//! - Fixed-cadence scheduler with at most one push in flight per shard
//! - Parallel policy evaluation with rayon

pub mod policy;
pub mod scheduler;

pub use policy::{deviation_bps, evaluate, should_update, Decision, SkipReason, Trigger};
pub use scheduler::{Controller, TickOutcome};
