//! Off-chain price cache, fed by a push-based streaming source

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

use pusher_core::{CoreError, FeedConfig, FeedId, PricePoint, SourceResult, UpdateData};

use crate::state::{FeedStates, OffChainEntry};

/// Callback invoked by a streaming source for every received price
pub type UpdateCallback = Arc<dyn Fn(FeedId, PricePoint, UpdateData) + Send + Sync>;

/// Push-based off-chain price source
#[async_trait]
pub trait OffChainPriceSource: Send + Sync {
    /// Whether the source knows this feed; used once at startup
    async fn is_feed_id_valid(&self, id: &FeedId) -> SourceResult<bool>;

    /// Start delivering updates for `feed_ids` to `callback`. Returns once the
    /// subscription is running; delivery continues in the background until `shutdown`
    /// flips to true.
    async fn subscribe(
        &self,
        feed_ids: Vec<FeedId>,
        callback: UpdateCallback,
        shutdown: watch::Receiver<bool>,
    ) -> SourceResult<()>;
}

/// Result of offering a price to the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Accepted,
    /// Older than the cached point; dropped
    Outdated,
    UnknownFeed,
}

#[derive(Debug, Clone)]
pub struct OffChainPriceCache {
    states: Arc<FeedStates>,
}

impl OffChainPriceCache {
    pub fn new(states: Arc<FeedStates>) -> Self {
        Self { states }
    }

    /// Store a newly received price. Never suspends.
    pub fn on_update(&self, id: FeedId, point: PricePoint, update_data: UpdateData) -> UpdateOutcome {
        let Some(state) = self.states.get(&id) else {
            return UpdateOutcome::UnknownFeed;
        };

        if state.store_off_chain(OffChainEntry { point, update_data }) {
            UpdateOutcome::Accepted
        } else {
            debug!(
                feed = %state.config().alias,
                publish_time = point.publish_time,
                "Dropping out-of-order off-chain update"
            );
            UpdateOutcome::Outdated
        }
    }

    pub fn get(&self, id: &FeedId) -> Option<PricePoint> {
        self.states.get(id).and_then(|s| s.latest_off_chain())
    }

    pub fn update_data(&self, id: &FeedId) -> Option<UpdateData> {
        self.states
            .get(id)
            .and_then(|s| s.latest_off_chain_entry())
            .map(|e| e.update_data)
    }

    pub fn feed_ids(&self) -> &[FeedId] {
        self.states.ids()
    }

    /// Callback handle to hand to a streaming source
    pub fn callback(&self) -> UpdateCallback {
        let cache = self.clone();
        Arc::new(move |id, point, data| {
            cache.on_update(id, point, data);
        })
    }
}

/// Check one configured feed against the source.
///
/// `Err(CoreError::InvalidFeed)` only when the source answers that it does not know the
/// feed; a source that cannot answer is logged and the feed is kept.
pub async fn validate_feed(source: &dyn OffChainPriceSource, feed: &FeedConfig) -> Result<(), CoreError> {
    match source.is_feed_id_valid(&feed.id).await {
        Ok(true) => Ok(()),
        Ok(false) => Err(CoreError::InvalidFeed(feed.id)),
        Err(e) => {
            warn!(feed = %feed.alias, error = %e, "Could not validate feed, keeping it");
            Ok(())
        }
    }
}

/// Drop feeds the source does not recognise
pub async fn filter_valid_feeds(
    source: &dyn OffChainPriceSource,
    feeds: Vec<FeedConfig>,
) -> Vec<FeedConfig> {
    let mut valid = Vec::with_capacity(feeds.len());

    for feed in feeds {
        match validate_feed(source, &feed).await {
            Ok(()) => valid.push(feed),
            Err(error) => warn!(feed = %feed.alias, %error, "Excluding feed"),
        }
    }

    valid
}
