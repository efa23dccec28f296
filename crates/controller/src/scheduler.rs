//! Push scheduler for one shard

use parking_lot::Mutex;
use rayon::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use pusher_core::{
    now_unix, ControllerConfig, FeedId, MetricsSink, PushBatch, ShardKey, UnixTimestamp,
};
use pusher_executor::{PushStrategy, Pusher};
use pusher_price_feed::{FeedSnapshot, FeedStates};

use crate::policy::{evaluate, Decision};

/// What a single tick did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// No feed needed a push
    Idle { evaluated: usize },
    /// A push of `feeds` feeds was started
    Dispatched { evaluated: usize, feeds: usize },
    /// The previous push is still running
    SkippedInFlight,
}

/// Holds the shard's in-flight flag; clears it when dropped
struct InFlightGuard(Arc<AtomicBool>);

impl InFlightGuard {
    fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(Arc::clone(flag)))
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Evaluates the policy for every feed of a shard on a fixed cadence and hands the
/// selected feeds to the pusher.
///
/// At most one push is in flight per shard. A tick that fires while the previous push is
/// still running is skipped entirely.
pub struct Controller<P = Pusher> {
    shard: ShardKey,
    states: Arc<FeedStates>,
    pusher: Arc<P>,
    metrics: Arc<dyn MetricsSink>,
    pushing_frequency: Duration,
    push_cooldown_secs: u64,
    in_flight: Arc<AtomicBool>,
    current: Mutex<Option<JoinHandle<()>>>,
}

impl<P: PushStrategy + 'static> Controller<P> {
    pub fn new(
        shard: ShardKey,
        config: &ControllerConfig,
        states: Arc<FeedStates>,
        pusher: Arc<P>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            shard,
            states,
            pusher,
            metrics,
            pushing_frequency: config.pushing_frequency(),
            push_cooldown_secs: config.push_cooldown_secs(),
            in_flight: Arc::new(AtomicBool::new(false)),
            current: Mutex::new(None),
        }
    }

    pub fn shard(&self) -> &ShardKey {
        &self.shard
    }

    pub fn is_pushing(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Tick on the pushing frequency until shutdown, then wait for the in-flight push
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            shard = %self.shard,
            feeds = self.states.len(),
            pusher = self.pusher.name(),
            "Starting controller ({:?} interval)",
            self.pushing_frequency
        );

        let mut interval = tokio::time::interval(self.pushing_frequency);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick();
                }
                _ = shutdown.changed() => {
                    info!(shard = %self.shard, "Controller shutdown requested");
                    break;
                }
            }
        }

        self.wait_idle().await;
        info!(shard = %self.shard, "Controller stopped");
    }

    pub fn tick(&self) -> TickOutcome {
        self.tick_at(now_unix())
    }

    /// Run one scheduling round as of `now`.
    ///
    /// Never waits for the push itself; it runs on a spawned task.
    pub fn tick_at(&self, now: UnixTimestamp) -> TickOutcome {
        let Some(guard) = InFlightGuard::acquire(&self.in_flight) else {
            debug!(shard = %self.shard, "Previous push still in flight, skipping tick");
            self.metrics.tick_skipped(&self.shard);
            return TickOutcome::SkippedInFlight;
        };

        let snapshots = self.states.snapshot();
        let evaluated = snapshots.len();
        let cooldown = self.push_cooldown_secs;

        let selected: Vec<(FeedSnapshot, Decision)> = snapshots
            .into_par_iter()
            .filter_map(|snapshot| {
                let decision = decide(&snapshot, now, cooldown)?;
                Some((snapshot, decision))
            })
            .collect();

        let mut batch = PushBatch::new();
        let mut aliases = Vec::new();
        for (snapshot, decision) in selected {
            match decision {
                Decision::Push(trigger) => {
                    if let Some(entry) = snapshot.off_chain {
                        info!(shard = %self.shard, feed = %snapshot.config.alias, %trigger, "Feed needs update");
                        batch.push(snapshot.config.id, entry.update_data);
                        aliases.push((snapshot.config.id, snapshot.config.alias));
                    }
                }
                Decision::Skip(reason) => {
                    debug!(shard = %self.shard, feed = %snapshot.config.alias, %reason, "Feed up to date");
                }
            }
        }

        self.metrics.tick_evaluated(&self.shard, evaluated, batch.len());
        if batch.is_empty() {
            debug!(shard = %self.shard, evaluated, "No feeds to push");
            return TickOutcome::Idle { evaluated };
        }

        let feeds = batch.len();
        info!(shard = %self.shard, evaluated, feeds, "Pushing {} feeds", feeds);
        self.metrics.push_attempted(&self.shard, feeds);

        let handle = tokio::spawn(push_batch(
            guard,
            self.shard.clone(),
            Arc::clone(&self.pusher),
            Arc::clone(&self.states),
            Arc::clone(&self.metrics),
            batch,
            aliases,
            now,
        ));
        *self.current.lock() = Some(handle);

        TickOutcome::Dispatched { evaluated, feeds }
    }

    /// Wait for the in-flight push, if any, to finish
    pub async fn wait_idle(&self) {
        let handle = self.current.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(shard = %self.shard, error = %e, "Push task failed");
            }
        }
    }
}

/// `None` when the feed has no off-chain price yet or was attempted within the cooldown
fn decide(snapshot: &FeedSnapshot, now: UnixTimestamp, cooldown_secs: u64) -> Option<Decision> {
    let off = snapshot.off_chain.as_ref()?;

    if let Some(last) = snapshot.last_push_attempt {
        if now.saturating_sub(last) < cooldown_secs {
            return None;
        }
    }

    Some(evaluate(&snapshot.config, &off.point, snapshot.on_chain.as_ref(), now))
}

#[allow(clippy::too_many_arguments)]
async fn push_batch<P: PushStrategy>(
    _guard: InFlightGuard,
    shard: ShardKey,
    pusher: Arc<P>,
    states: Arc<FeedStates>,
    metrics: Arc<dyn MetricsSink>,
    batch: PushBatch,
    aliases: Vec<(FeedId, String)>,
    attempted_at: UnixTimestamp,
) {
    let feeds = batch.len();
    let started = Instant::now();
    let result = pusher.push(batch).await;
    let latency = started.elapsed();

    for (id, _) in &aliases {
        if let Some(state) = states.get(id) {
            state.record_push_attempt(attempted_at);
        }
    }

    match result {
        Ok(receipt) => {
            metrics.push_succeeded(&shard, feeds, latency);
            for (id, alias) in &aliases {
                if receipt.abandoned.contains(id) {
                    warn!(%shard, feed = %alias, "Update abandoned");
                } else {
                    info!(%shard, feed = %alias, "Update submitted");
                }
            }
            info!(
                %shard,
                feeds,
                txs = receipt.tx_ids.len(),
                attempts = receipt.attempts,
                "Push completed in {:?}",
                latency
            );
        }
        Err(e) => {
            metrics.push_failed(&shard, feeds, e.kind());
            for (_, alias) in &aliases {
                warn!(%shard, feed = %alias, "Update failed");
            }
            error!(%shard, feeds, error = %e, "Push failed after {:?}", latency);
        }
    }
}
