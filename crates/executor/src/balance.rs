//! Periodic signer balance sampling

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use pusher_core::{BalanceConfig, MetricsSink, ShardKey, SourceResult};

use crate::client::BalanceSource;

/// Reports the signer balance of one shard to the metrics sink
pub struct BalanceTracker {
    shard: ShardKey,
    source: Arc<dyn BalanceSource>,
    metrics: Arc<dyn MetricsSink>,
    interval: Duration,
    low_threshold: Option<u64>,
}

impl BalanceTracker {
    pub fn new(
        shard: ShardKey,
        config: &BalanceConfig,
        source: Arc<dyn BalanceSource>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            shard,
            source,
            metrics,
            interval: Duration::from_secs(config.interval_secs.max(1)),
            low_threshold: config.low_balance_threshold,
        }
    }

    pub async fn sample_once(&self) -> SourceResult<u64> {
        let balance = self.source.signer_balance().await?;
        self.metrics.signer_balance(&self.shard, balance);

        match self.low_threshold {
            Some(threshold) if balance < threshold => {
                warn!(shard = %self.shard, balance, threshold, "Signer balance is low");
            }
            _ => debug!(shard = %self.shard, balance, "Sampled signer balance"),
        }
        Ok(balance)
    }

    /// Sample immediately, then every interval until shutdown
    pub fn start(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            info!(shard = %self.shard, "Balance tracker started ({:?} interval)", self.interval);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = self.sample_once().await {
                            warn!(shard = %self.shard, error = %e, "Balance query failed");
                        }
                    }
                    _ = shutdown.changed() => {
                        info!(shard = %self.shard, "Balance tracker stopping");
                        break;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use pusher_core::{ChainId, NoopMetrics, SourceError};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSource {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl BalanceSource for CountingSource {
        async fn signer_balance(&self) -> SourceResult<u64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(SourceError::Rpc("node unhealthy".into()))
            } else {
                Ok(42)
            }
        }
    }

    #[derive(Default)]
    struct RecordingMetrics(Mutex<Vec<u64>>);

    impl MetricsSink for RecordingMetrics {
        fn tick_evaluated(&self, _: &ShardKey, _: usize, _: usize) {}
        fn tick_skipped(&self, _: &ShardKey) {}
        fn push_attempted(&self, _: &ShardKey, _: usize) {}
        fn push_succeeded(&self, _: &ShardKey, _: usize, _: Duration) {}
        fn push_failed(&self, _: &ShardKey, _: usize, _: &str) {}
        fn feed_staleness(&self, _: &ShardKey, _: &str, _: u64) {}
        fn signer_balance(&self, _: &ShardKey, amount: u64) {
            self.0.lock().push(amount);
        }
        fn bundle_tip(&self, _: &ShardKey, _: u64) {}
    }

    fn config() -> BalanceConfig {
        BalanceConfig {
            enabled: true,
            interval_secs: 60,
            low_balance_threshold: Some(100),
        }
    }

    fn shard() -> ShardKey {
        ShardKey::new(ChainId::new("solana"), 0)
    }

    #[tokio::test]
    async fn test_sample_reports_balance() {
        let source = Arc::new(CountingSource { calls: AtomicUsize::new(0), fail: false });
        let metrics = Arc::new(RecordingMetrics::default());
        let tracker = BalanceTracker::new(shard(), &config(), source, metrics.clone());

        assert_eq!(tracker.sample_once().await.unwrap(), 42);
        assert_eq!(*metrics.0.lock(), vec![42]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_samples_every_interval_until_shutdown() {
        let source = Arc::new(CountingSource { calls: AtomicUsize::new(0), fail: true });
        let tracker = Arc::new(BalanceTracker::new(shard(), &config(), source.clone(), Arc::new(NoopMetrics)));
        let (tx, rx) = watch::channel(false);

        let handle = tracker.start(rx);
        tokio::time::sleep(Duration::from_secs(150)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        // t = 0, 60, 120; failures keep the loop alive
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    }
}
