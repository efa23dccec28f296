//! Per-feed state shared by the two caches and the controller
//!
//! Every field of a [`FeedState`] has exactly one writer:
//! - `off_chain`: the off-chain cache (push callback)
//! - `on_chain`: the on-chain cache (poll refresh)
//! - `last_push_attempt`: the controller
//!
//! Each field sits behind its own lock (or atomic), so no lock spans fields and readers
//! may observe a torn view across fields.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use pusher_core::{
    CoreError, CoreResult, FeedConfig, FeedId, OnChainPricePoint, PricePoint, UnixTimestamp,
    UpdateData,
};

/// Latest off-chain observation together with its binary update payload
#[derive(Debug, Clone)]
pub struct OffChainEntry {
    pub point: PricePoint,
    pub update_data: UpdateData,
}

#[derive(Debug)]
pub struct FeedState {
    config: FeedConfig,
    off_chain: RwLock<Option<OffChainEntry>>,
    on_chain: RwLock<Option<OnChainPricePoint>>,
    /// 0 = never attempted
    last_push_attempt: AtomicU64,
}

impl FeedState {
    pub fn new(config: FeedConfig) -> Self {
        Self {
            config,
            off_chain: RwLock::new(None),
            on_chain: RwLock::new(None),
            last_push_attempt: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &FeedConfig {
        &self.config
    }

    pub fn id(&self) -> FeedId {
        self.config.id
    }

    pub fn latest_off_chain(&self) -> Option<PricePoint> {
        self.off_chain.read().as_ref().map(|e| e.point)
    }

    pub fn latest_off_chain_entry(&self) -> Option<OffChainEntry> {
        self.off_chain.read().clone()
    }

    pub fn latest_on_chain(&self) -> Option<OnChainPricePoint> {
        *self.on_chain.read()
    }

    pub fn last_push_attempt(&self) -> Option<UnixTimestamp> {
        match self.last_push_attempt.load(Ordering::Acquire) {
            0 => None,
            ts => Some(ts),
        }
    }

    /// Record a push attempt. The stored value never moves backwards.
    pub fn record_push_attempt(&self, at: UnixTimestamp) {
        self.last_push_attempt.fetch_max(at, Ordering::AcqRel);
    }

    /// Store an off-chain point unless it is older than the cached one
    pub(crate) fn store_off_chain(&self, entry: OffChainEntry) -> bool {
        let mut slot = self.off_chain.write();
        if let Some(current) = slot.as_ref() {
            if entry.point.publish_time < current.point.publish_time {
                return false;
            }
        }
        *slot = Some(entry);
        true
    }

    pub(crate) fn store_on_chain(&self, point: OnChainPricePoint) {
        *self.on_chain.write() = Some(point);
    }

    /// Point-in-time copy of every field, read one field at a time
    pub fn snapshot(&self) -> FeedSnapshot {
        FeedSnapshot {
            config: self.config.clone(),
            off_chain: self.latest_off_chain_entry(),
            on_chain: self.latest_on_chain(),
            last_push_attempt: self.last_push_attempt(),
        }
    }
}

/// Copy of a feed's state taken at tick time
#[derive(Debug, Clone)]
pub struct FeedSnapshot {
    pub config: FeedConfig,
    pub off_chain: Option<OffChainEntry>,
    pub on_chain: Option<OnChainPricePoint>,
    pub last_push_attempt: Option<UnixTimestamp>,
}

/// Fixed set of feed states for one shard. Feeds are never added or removed after creation.
#[derive(Debug)]
pub struct FeedStates {
    feeds: HashMap<FeedId, Arc<FeedState>>,
    /// Configuration order
    order: Vec<FeedId>,
}

impl FeedStates {
    pub fn new(configs: Vec<FeedConfig>) -> CoreResult<Self> {
        let mut feeds = HashMap::with_capacity(configs.len());
        let mut order = Vec::with_capacity(configs.len());

        for config in configs {
            let id = config.id;
            if feeds.insert(id, Arc::new(FeedState::new(config))).is_some() {
                return Err(CoreError::DuplicateFeed(id));
            }
            order.push(id);
        }

        Ok(Self { feeds, order })
    }

    pub fn get(&self, id: &FeedId) -> Option<&Arc<FeedState>> {
        self.feeds.get(id)
    }

    pub fn contains(&self, id: &FeedId) -> bool {
        self.feeds.contains_key(id)
    }

    pub fn ids(&self) -> &[FeedId] {
        &self.order
    }

    /// Feed states in configuration order
    pub fn iter(&self) -> impl Iterator<Item = &Arc<FeedState>> {
        self.order.iter().filter_map(|id| self.feeds.get(id))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn snapshot(&self) -> Vec<FeedSnapshot> {
        self.iter().map(|state| state.snapshot()).collect()
    }
}
