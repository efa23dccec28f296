//! Metrics sink abstraction
//!
//! Components report through this trait; the agent crate provides a Prometheus-backed sink.

use std::time::Duration;

use crate::ShardKey;

pub trait MetricsSink: Send + Sync {
    /// One scheduler tick evaluated `evaluated` feeds and selected `selected` of them
    fn tick_evaluated(&self, shard: &ShardKey, evaluated: usize, selected: usize);

    /// A tick fired while a push was still in flight
    fn tick_skipped(&self, shard: &ShardKey);

    fn push_attempted(&self, shard: &ShardKey, feeds: usize);

    fn push_succeeded(&self, shard: &ShardKey, feeds: usize, latency: Duration);

    fn push_failed(&self, shard: &ShardKey, feeds: usize, reason: &str);

    /// Seconds since the on-chain price of a feed was published
    fn feed_staleness(&self, shard: &ShardKey, alias: &str, secs: u64);

    fn signer_balance(&self, shard: &ShardKey, amount: u64);

    fn bundle_tip(&self, shard: &ShardKey, tip: u64);
}

/// Sink that drops everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn tick_evaluated(&self, _: &ShardKey, _: usize, _: usize) {}
    fn tick_skipped(&self, _: &ShardKey) {}
    fn push_attempted(&self, _: &ShardKey, _: usize) {}
    fn push_succeeded(&self, _: &ShardKey, _: usize, _: Duration) {}
    fn push_failed(&self, _: &ShardKey, _: usize, _: &str) {}
    fn feed_staleness(&self, _: &ShardKey, _: &str, _: u64) {}
    fn signer_balance(&self, _: &ShardKey, _: u64) {}
    fn bundle_tip(&self, _: &ShardKey, _: u64) {}
}
