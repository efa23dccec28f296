//! Push strategy selection

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use pusher_core::{
    AgentConfig, FeedId, MetricsSink, PushBatch, PushResult, ShardKey, TxId,
};

use crate::bundled::BundledPusher;
use crate::client::{BundleRelay, TransactionClient};
use crate::standard::StandardPusher;
use crate::tip::TipOracle;

/// `now + budget`, clamped to a year for budgets too large to represent
pub(crate) fn deadline_after(budget: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(budget)
        .unwrap_or_else(|| now + Duration::from_secs(365 * 24 * 3600))
}

/// Successful push outcome
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushReceipt {
    pub tx_ids: Vec<TxId>,
    /// Total submission rounds across the batch
    pub attempts: u32,
    /// Feeds whose sub-bundle ran out of retry budget
    pub abandoned: Vec<FeedId>,
}

/// Turns a batch of selected feeds into submitted transactions
#[async_trait]
pub trait PushStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn push(&self, batch: PushBatch) -> PushResult<PushReceipt>;
}

/// The push strategies, chosen once at startup
pub enum Pusher {
    Standard(StandardPusher),
    Bundled(BundledPusher),
}

impl Pusher {
    /// Bundled when the config carries a bundle section, standard otherwise
    pub fn from_config(
        config: &AgentConfig,
        shard: ShardKey,
        client: Arc<dyn TransactionClient>,
        relays: Vec<Arc<dyn BundleRelay>>,
        tip_oracle: Option<Arc<dyn TipOracle>>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        match &config.bundle {
            Some(bundle) => Pusher::Bundled(BundledPusher::new(
                shard,
                bundle.clone(),
                config.push_retry_budget(),
                client,
                relays,
                tip_oracle,
                metrics,
            )),
            None => Pusher::Standard(StandardPusher::new(
                config.standard.clone(),
                config.push_retry_budget(),
                client,
            )),
        }
    }
}

#[async_trait]
impl PushStrategy for Pusher {
    fn name(&self) -> &'static str {
        match self {
            Pusher::Standard(p) => p.name(),
            Pusher::Bundled(p) => p.name(),
        }
    }

    async fn push(&self, batch: PushBatch) -> PushResult<PushReceipt> {
        match self {
            Pusher::Standard(p) => p.push(batch).await,
            Pusher::Bundled(p) => p.push(batch).await,
        }
    }
}
