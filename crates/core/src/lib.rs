//! Core types and utilities for the price pusher
//!
//! This crate provides shared types used across all components:
//! - Feed identifiers, price points and push batches
//! - Shard and chain identity
//! - Agent configuration and its validation
//! - Error taxonomy and the metrics sink interface

pub mod types;
pub mod config;
pub mod errors;
pub mod metrics;

pub use types::*;
pub use config::*;
pub use errors::*;
pub use metrics::*;
