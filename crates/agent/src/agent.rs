//! Shard wiring and lifecycle

use anyhow::{Context, Result};
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use pusher_controller::Controller;
use pusher_core::{AgentConfig, FeedId, MetricsSink, PricePoint, ShardKey, UpdateData};
use pusher_executor::{
    BalanceSource, BalanceTracker, BundleRelay, HttpRelay, HttpTipFloor, Pusher, TipOracle,
    TransactionClient,
};
use pusher_price_feed::{
    filter_valid_feeds, FeedStates, OffChainPriceCache, OffChainPriceSource, OnChainPriceCache,
    OnChainPriceSource, UpdateCallback,
};

/// Chain clients of one shard
pub struct ShardClients {
    pub on_chain: Arc<dyn OnChainPriceSource>,
    pub transactions: Arc<dyn TransactionClient>,
    /// `None` disables balance tracking for the shard
    pub balance: Option<Arc<dyn BalanceSource>>,
}

/// Builds the chain clients for each shard; shards sign with separate wallets
pub trait ClientFactory: Send + Sync {
    fn shard_clients(&self, shard: &ShardKey) -> Result<ShardClients>;
}

struct Shard {
    key: ShardKey,
    off_chain: OffChainPriceCache,
    on_chain: OnChainPriceCache,
    controller: Arc<Controller>,
    balance: Option<Arc<BalanceTracker>>,
}

/// All shards of one chain behind a single start/stop lifecycle
pub struct Agent {
    config: AgentConfig,
    source: Arc<dyn OffChainPriceSource>,
    shards: Vec<Shard>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Agent {
    /// Validate the configured feeds against the off-chain source and build every shard.
    ///
    /// Feeds the source does not recognise are excluded with a warning.
    pub async fn new(
        mut config: AgentConfig,
        source: Arc<dyn OffChainPriceSource>,
        clients: &dyn ClientFactory,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self> {
        config.validate()?;

        let configured = config.feeds.len();
        config.feeds = filter_valid_feeds(source.as_ref(), std::mem::take(&mut config.feeds)).await;
        if config.feeds.len() < configured {
            warn!(
                excluded = configured - config.feeds.len(),
                tracked = config.feeds.len(),
                "Some configured feeds were excluded"
            );
        }
        let grouped = config.shards();

        let relays = build_relays(&config)?;
        let tip_oracle = build_tip_oracle(&config)?;

        let mut shards = Vec::with_capacity(grouped.len());
        for (key, feeds) in grouped {
            let clients = clients
                .shard_clients(&key)
                .with_context(|| format!("building clients for shard {key}"))?;
            let states = Arc::new(FeedStates::new(feeds)?);

            let off_chain = OffChainPriceCache::new(Arc::clone(&states));
            let on_chain = OnChainPriceCache::new(
                key.clone(),
                Arc::clone(&states),
                clients.on_chain,
                Arc::clone(&metrics),
            );
            let pusher = Pusher::from_config(
                &config,
                key.clone(),
                clients.transactions,
                relays.clone(),
                tip_oracle.clone(),
                Arc::clone(&metrics),
            );
            let controller = Arc::new(Controller::new(
                key.clone(),
                &config.controller,
                Arc::clone(&states),
                Arc::new(pusher),
                Arc::clone(&metrics),
            ));
            let balance = match (config.balance.enabled, clients.balance) {
                (true, Some(source)) => Some(Arc::new(BalanceTracker::new(
                    key.clone(),
                    &config.balance,
                    source,
                    Arc::clone(&metrics),
                ))),
                _ => None,
            };

            info!(shard = %key, feeds = states.len(), "Shard ready");
            shards.push(Shard {
                key,
                off_chain,
                on_chain,
                controller,
                balance,
            });
        }

        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            config,
            source,
            shards,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn shard_keys(&self) -> impl Iterator<Item = &ShardKey> {
        self.shards.iter().map(|s| &s.key)
    }

    pub fn controller(&self, key: &ShardKey) -> Option<&Arc<Controller>> {
        self.shard(key).map(|s| &s.controller)
    }

    pub fn off_chain_cache(&self, key: &ShardKey) -> Option<&OffChainPriceCache> {
        self.shard(key).map(|s| &s.off_chain)
    }

    pub fn on_chain_cache(&self, key: &ShardKey) -> Option<&OnChainPriceCache> {
        self.shard(key).map(|s| &s.on_chain)
    }

    fn shard(&self, key: &ShardKey) -> Option<&Shard> {
        self.shards.iter().find(|s| &s.key == key)
    }

    /// Callback that routes each off-chain update to the cache of the owning shard
    pub fn router(&self) -> UpdateCallback {
        let routes: HashMap<FeedId, OffChainPriceCache> = self
            .shards
            .iter()
            .flat_map(|shard| {
                shard
                    .off_chain
                    .feed_ids()
                    .iter()
                    .map(move |id| (*id, shard.off_chain.clone()))
            })
            .collect();

        Arc::new(move |id: FeedId, point: PricePoint, update_data: UpdateData| match routes.get(&id) {
            Some(cache) => {
                cache.on_update(id, point, update_data);
            }
            None => debug!(feed = %id, "Update for untracked feed"),
        })
    }

    /// Subscribe to the off-chain source and start every shard's timers
    pub async fn start(&self) -> Result<()> {
        let feed_ids: Vec<FeedId> = self
            .shards
            .iter()
            .flat_map(|s| s.off_chain.feed_ids().iter().copied())
            .collect();

        self.source
            .subscribe(feed_ids.clone(), self.router(), self.shutdown.subscribe())
            .await
            .context("subscribing to off-chain prices")?;
        info!(feeds = feed_ids.len(), shards = self.shards.len(), "Subscribed to off-chain prices");

        let polling = self.config.controller.polling_frequency();
        let mut tasks = self.tasks.lock();

        for shard in &self.shards {
            let on_chain = shard.on_chain.clone();
            tasks.push(tokio::spawn(on_chain.run(polling, self.shutdown.subscribe())));

            let controller = Arc::clone(&shard.controller);
            let shutdown = self.shutdown.subscribe();
            tasks.push(tokio::spawn(async move { controller.run(shutdown).await }));

            if let Some(tracker) = &shard.balance {
                tasks.push(Arc::clone(tracker).start(self.shutdown.subscribe()));
            }
        }

        info!("Agent started");
        Ok(())
    }

    /// Stop the off-chain subscription and every timer, then wait for in-flight pushes to finish
    pub async fn stop(&self) {
        info!("Stopping agent");
        let _ = self.shutdown.send(true);

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for result in join_all(tasks).await {
            if let Err(e) = result {
                error!(error = %e, "Agent task failed");
            }
        }

        info!("All services stopped");
    }
}

fn build_relays(config: &AgentConfig) -> Result<Vec<Arc<dyn BundleRelay>>> {
    let Some(bundle) = &config.bundle else {
        return Ok(Vec::new());
    };

    let timeout = Duration::from_millis(bundle.request_timeout_ms);
    bundle
        .relay_endpoints
        .iter()
        .map(|endpoint| {
            let relay = HttpRelay::new(endpoint.as_str(), timeout)
                .with_context(|| format!("creating relay client for {endpoint}"))?;
            Ok(Arc::new(relay) as Arc<dyn BundleRelay>)
        })
        .collect()
}

fn build_tip_oracle(config: &AgentConfig) -> Result<Option<Arc<dyn TipOracle>>> {
    match &config.bundle {
        Some(bundle) if bundle.dynamic_tips => match &bundle.tip_floor_url {
            Some(url) => {
                let timeout = Duration::from_millis(bundle.request_timeout_ms);
                let oracle = HttpTipFloor::new(url.as_str(), timeout).context("creating tip floor client")?;
                Ok(Some(Arc::new(oracle)))
            }
            None => {
                warn!("Dynamic tips enabled without a tip floor URL, using the default tip");
                Ok(None)
            }
        },
        _ => Ok(None),
    }
}
