//! Prometheus-backed metrics sink

use anyhow::{anyhow, Result};
use prometheus::{
    register_histogram_vec_with_registry, register_int_counter_vec_with_registry,
    register_int_gauge_vec_with_registry, Encoder, HistogramOpts, HistogramVec, IntCounterVec,
    IntGaugeVec, Opts, Registry,
};
use std::time::Duration;

use pusher_core::{MetricsSink, ShardKey};

fn gauge_value(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Counters and gauges labelled by shard (and feed where relevant)
#[derive(Clone)]
pub struct PrometheusMetrics {
    registry: Registry,

    ticks_total: IntCounterVec,
    feeds_evaluated: IntGaugeVec,
    feeds_selected: IntGaugeVec,

    pushes_total: IntCounterVec,
    push_failures_total: IntCounterVec,
    feeds_pushed_total: IntCounterVec,
    push_latency: HistogramVec,

    feed_staleness: IntGaugeVec,
    signer_balance: IntGaugeVec,
    bundle_tip: IntGaugeVec,
}

impl PrometheusMetrics {
    pub fn new() -> Result<Self> {
        Self::with_registry(Registry::new())
    }

    pub fn with_registry(registry: Registry) -> Result<Self> {
        let ticks_total = register_int_counter_vec_with_registry!(
            Opts::new("pusher_ticks_total", "Scheduler ticks by outcome"),
            &["shard", "outcome"],
            registry
        )?;
        let feeds_evaluated = register_int_gauge_vec_with_registry!(
            Opts::new("pusher_feeds_evaluated", "Feeds evaluated in the last tick"),
            &["shard"],
            registry
        )?;
        let feeds_selected = register_int_gauge_vec_with_registry!(
            Opts::new("pusher_feeds_selected", "Feeds selected for push in the last tick"),
            &["shard"],
            registry
        )?;

        let pushes_total = register_int_counter_vec_with_registry!(
            Opts::new("pusher_pushes_total", "Push attempts and their results"),
            &["shard", "result"],
            registry
        )?;
        let push_failures_total = register_int_counter_vec_with_registry!(
            Opts::new("pusher_push_failures_total", "Failed pushes by reason"),
            &["shard", "reason"],
            registry
        )?;
        let feeds_pushed_total = register_int_counter_vec_with_registry!(
            Opts::new("pusher_feeds_pushed_total", "Feed updates included in successful pushes"),
            &["shard"],
            registry
        )?;
        let push_latency = register_histogram_vec_with_registry!(
            HistogramOpts::new("pusher_push_latency_seconds", "Time from dispatch to push result")
                .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
            &["shard"],
            registry
        )?;

        let feed_staleness = register_int_gauge_vec_with_registry!(
            Opts::new("pusher_feed_staleness_seconds", "Age of the on-chain price"),
            &["shard", "feed"],
            registry
        )?;
        let signer_balance = register_int_gauge_vec_with_registry!(
            Opts::new("pusher_signer_balance", "Signer balance in the chain's base unit"),
            &["shard"],
            registry
        )?;
        let bundle_tip = register_int_gauge_vec_with_registry!(
            Opts::new("pusher_bundle_tip", "Tip attached to the last bundle push"),
            &["shard"],
            registry
        )?;

        Ok(Self {
            registry,
            ticks_total,
            feeds_evaluated,
            feeds_selected,
            pushes_total,
            push_failures_total,
            feeds_pushed_total,
            push_latency,
            feed_staleness,
            signer_balance,
            bundle_tip,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Text exposition format, for serving on a scrape endpoint
    pub fn encode_text(&self) -> Result<String> {
        let families = self.registry.gather();
        let encoder = prometheus::TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&families, &mut buffer)
            .map_err(|e| anyhow!("Failed to encode metrics: {}", e))?;
        String::from_utf8(buffer).map_err(|e| anyhow!("Metrics are not valid UTF-8: {}", e))
    }
}

impl MetricsSink for PrometheusMetrics {
    fn tick_evaluated(&self, shard: &ShardKey, evaluated: usize, selected: usize) {
        let shard = shard.to_string();
        self.ticks_total.with_label_values(&[&shard, "evaluated"]).inc();
        self.feeds_evaluated.with_label_values(&[&shard]).set(evaluated as i64);
        self.feeds_selected.with_label_values(&[&shard]).set(selected as i64);
    }

    fn tick_skipped(&self, shard: &ShardKey) {
        self.ticks_total
            .with_label_values(&[&shard.to_string(), "skipped"])
            .inc();
    }

    fn push_attempted(&self, shard: &ShardKey, _feeds: usize) {
        self.pushes_total
            .with_label_values(&[&shard.to_string(), "attempted"])
            .inc();
    }

    fn push_succeeded(&self, shard: &ShardKey, feeds: usize, latency: Duration) {
        let shard = shard.to_string();
        self.pushes_total.with_label_values(&[&shard, "succeeded"]).inc();
        self.feeds_pushed_total.with_label_values(&[&shard]).inc_by(feeds as u64);
        self.push_latency
            .with_label_values(&[&shard])
            .observe(latency.as_secs_f64());
    }

    fn push_failed(&self, shard: &ShardKey, _feeds: usize, reason: &str) {
        let shard = shard.to_string();
        self.pushes_total.with_label_values(&[&shard, "failed"]).inc();
        self.push_failures_total
            .with_label_values(&[&shard, reason])
            .inc();
    }

    fn feed_staleness(&self, shard: &ShardKey, alias: &str, secs: u64) {
        self.feed_staleness
            .with_label_values(&[&shard.to_string(), alias])
            .set(gauge_value(secs));
    }

    fn signer_balance(&self, shard: &ShardKey, amount: u64) {
        self.signer_balance
            .with_label_values(&[&shard.to_string()])
            .set(gauge_value(amount));
    }

    fn bundle_tip(&self, shard: &ShardKey, tip: u64) {
        self.bundle_tip
            .with_label_values(&[&shard.to_string()])
            .set(gauge_value(tip));
    }
}
