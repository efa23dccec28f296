//! On-chain price cache, refreshed by polling the target chain

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use pusher_core::{
    now_unix, FeedId, MetricsSink, OnChainPricePoint, ShardKey, SourceResult,
};

use crate::state::FeedStates;

/// Batched reader of prices stored on the target chain
#[async_trait]
pub trait OnChainPriceSource: Send + Sync {
    /// Feeds absent from the returned map have no on-chain price (or could not be read)
    async fn get_prices(&self, ids: &[FeedId]) -> SourceResult<HashMap<FeedId, OnChainPricePoint>>;
}

/// Outcome of one refresh round
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshReport {
    pub updated: usize,
    pub missing: Vec<FeedId>,
}

#[derive(Clone)]
pub struct OnChainPriceCache {
    shard: ShardKey,
    states: Arc<FeedStates>,
    source: Arc<dyn OnChainPriceSource>,
    metrics: Arc<dyn MetricsSink>,
}

impl OnChainPriceCache {
    pub fn new(
        shard: ShardKey,
        states: Arc<FeedStates>,
        source: Arc<dyn OnChainPriceSource>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            shard,
            states,
            source,
            metrics,
        }
    }

    pub fn get(&self, id: &FeedId) -> Option<OnChainPricePoint> {
        self.states.get(id).and_then(|s| s.latest_on_chain())
    }

    /// Poll every tracked feed in one batched call
    pub async fn refresh_all(&self) -> SourceResult<RefreshReport> {
        self.refresh(self.states.ids()).await
    }

    /// Poll `ids` in one batched call.
    ///
    /// Feeds missing from the response keep their previous value. A failed call
    /// leaves every feed untouched and is reported to the caller.
    pub async fn refresh(&self, ids: &[FeedId]) -> SourceResult<RefreshReport> {
        let prices = self.source.get_prices(ids).await?;
        let now = now_unix();
        let mut report = RefreshReport::default();

        for id in ids {
            let Some(state) = self.states.get(id) else {
                continue;
            };

            match prices.get(id) {
                Some(point) => {
                    state.store_on_chain(*point);
                    report.updated += 1;
                    self.metrics.feed_staleness(
                        &self.shard,
                        &state.config().alias,
                        point.point.age_secs(now),
                    );
                }
                None => report.missing.push(*id),
            }
        }

        if !report.missing.is_empty() {
            warn!(
                shard = %self.shard,
                missing = report.missing.len(),
                "Some feeds have no on-chain price, they will be pushed"
            );
        }
        debug!(shard = %self.shard, updated = report.updated, "On-chain prices refreshed");

        Ok(report)
    }

    /// Refresh on a fixed interval until `shutdown` flips to true.
    ///
    /// The interval itself is the backoff after a failed refresh.
    pub async fn run(self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(shard = %self.shard, ?interval, "Starting on-chain price poller");

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.refresh_all().await {
                        error!(shard = %self.shard, error = %e, "On-chain price refresh failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!(shard = %self.shard, "On-chain price poller stopped");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tests::feed_config;
    use parking_lot::Mutex;
    use pusher_core::{ChainId, NoopMetrics, PricePoint, SourceError};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Serves a scripted sequence of responses, repeating the last one
    struct ScriptedSource {
        responses: Mutex<Vec<SourceResult<HashMap<FeedId, OnChainPricePoint>>>>,
        calls: AtomicUsize,
    }

    impl ScriptedSource {
        fn new(responses: Vec<SourceResult<HashMap<FeedId, OnChainPricePoint>>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl OnChainPriceSource for ScriptedSource {
        async fn get_prices(&self, _ids: &[FeedId]) -> SourceResult<HashMap<FeedId, OnChainPricePoint>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut responses = self.responses.lock();
            if responses.len() > 1 {
                responses.remove(0)
            } else {
                responses[0].clone()
            }
        }
    }

    fn on_chain(price: i64, slot: u64) -> OnChainPricePoint {
        OnChainPricePoint::new(PricePoint::new(price, 0, -2, 1_000 + slot), slot)
    }

    fn cache(source: Arc<ScriptedSource>) -> OnChainPriceCache {
        let states = FeedStates::new(vec![feed_config(1), feed_config(2)]).unwrap();
        OnChainPriceCache::new(
            ShardKey::new(ChainId::new("test"), 0),
            Arc::new(states),
            source,
            Arc::new(NoopMetrics),
        )
    }

    #[tokio::test]
    async fn test_partial_refresh_keeps_previous_value() {
        let a = FeedId::new([1; 32]);
        let b = FeedId::new([2; 32]);

        let source = ScriptedSource::new(vec![
            Ok(HashMap::from([(a, on_chain(100, 1)), (b, on_chain(200, 1))])),
            Ok(HashMap::from([(a, on_chain(101, 2))])),
        ]);
        let cache = cache(source);

        let first = cache.refresh_all().await.unwrap();
        assert_eq!(first.updated, 2);

        let second = cache.refresh_all().await.unwrap();
        assert_eq!(second.updated, 1);
        assert_eq!(second.missing, vec![b]);

        assert_eq!(cache.get(&a).unwrap().point.price, 101);
        assert_eq!(cache.get(&b).unwrap().point.price, 200);
    }

    #[tokio::test]
    async fn test_failed_refresh_leaves_state_untouched() {
        let a = FeedId::new([1; 32]);
        let source = ScriptedSource::new(vec![
            Ok(HashMap::from([(a, on_chain(100, 1))])),
            Err(SourceError::Rpc("unreachable".into())),
        ]);
        let cache = cache(source);

        cache.refresh_all().await.unwrap();
        assert!(cache.refresh_all().await.is_err());
        assert_eq!(cache.get(&a).unwrap().slot, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poller_keeps_running_after_failures() {
        let source = ScriptedSource::new(vec![Err(SourceError::Timeout)]);
        let cache = cache(Arc::clone(&source));
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(cache.run(Duration::from_secs(5), rx));
        tokio::time::sleep(Duration::from_secs(12)).await;

        tx.send(true).unwrap();
        handle.await.unwrap();

        // ticks at 0s, 5s and 10s
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    }
}
