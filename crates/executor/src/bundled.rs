//! Bundle pusher with a bounded retry budget

use async_trait::async_trait;
use futures::future::join_all;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use pusher_core::{
    now_unix, BundleConfig, FeedId, MetricsSink, PushBatch, PushError, PushResult, ShardKey,
    SubmissionError, SubmissionResult, TxId, UnixTimestamp,
};

use crate::client::{BundleRelay, SignedTransaction, TransactionClient};
use crate::pusher::{deadline_after, PushReceipt, PushStrategy};
use crate::tip::{TipOracle, TipPolicy};

/// One fan-out round of a sub-bundle and the answer of every relay
#[derive(Debug, Clone)]
pub struct BundleAttempt {
    pub bundle_id: Uuid,
    /// 1-based round number within the sub-bundle
    pub round: u32,
    pub feeds: Vec<FeedId>,
    pub tip: u64,
    pub submitted_at: UnixTimestamp,
    pub relay_results: BTreeMap<String, SubmissionResult<TxId>>,
}

impl BundleAttempt {
    fn new(bundle_id: Uuid, round: u32, feeds: Vec<FeedId>, tip: u64) -> Self {
        Self {
            bundle_id,
            round,
            feeds,
            tip,
            submitted_at: now_unix(),
            relay_results: BTreeMap::new(),
        }
    }

    pub fn accepted(&self) -> usize {
        self.relay_results.values().filter(|r| r.is_ok()).count()
    }

    /// Every relay error of the round, or a note when no relay answered
    pub fn errors(&self) -> String {
        let errors: Vec<String> = self
            .relay_results
            .iter()
            .filter_map(|(relay, result)| result.as_ref().err().map(|e| format!("{relay}: {e}")))
            .collect();
        if errors.is_empty() {
            String::from("no relays configured")
        } else {
            errors.join("; ")
        }
    }

    fn log(&self) {
        debug!(
            bundle_id = %self.bundle_id,
            round = self.round,
            feeds = self.feeds.len(),
            tip = self.tip,
            submitted_at = self.submitted_at,
            relays = self.relay_results.len(),
            accepted = self.accepted(),
            results = ?self.relay_results,
            "Bundle round finished"
        );
    }
}

/// How a single sub-bundle ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BundleOutcome {
    Landed { tx_id: TxId, attempts: u32 },
    /// The client refused to build the bundle
    Rejected { attempts: u32, reason: String },
    /// The retry budget ran out
    Expired { attempts: u32, last_error: String },
}

impl BundleOutcome {
    fn attempts(&self) -> u32 {
        match self {
            BundleOutcome::Landed { attempts, .. }
            | BundleOutcome::Rejected { attempts, .. }
            | BundleOutcome::Expired { attempts, .. } => *attempts,
        }
    }
}

/// Splits a batch into sub-bundles of at most `updates_per_bundle` feeds and submits each
/// to every relay until one accepts it or the retry budget elapses.
///
/// All sub-bundles share one deadline, so a push never outlives the budget even when
/// relays hang.
pub struct BundledPusher {
    shard: ShardKey,
    config: BundleConfig,
    tip_policy: TipPolicy,
    retry_budget: Duration,
    client: Arc<dyn TransactionClient>,
    relays: Vec<Arc<dyn BundleRelay>>,
    tip_oracle: Option<Arc<dyn TipOracle>>,
    metrics: Arc<dyn MetricsSink>,
}

impl BundledPusher {
    pub fn new(
        shard: ShardKey,
        config: BundleConfig,
        retry_budget: Duration,
        client: Arc<dyn TransactionClient>,
        relays: Vec<Arc<dyn BundleRelay>>,
        tip_oracle: Option<Arc<dyn TipOracle>>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            shard,
            tip_policy: TipPolicy::from_config(&config),
            config,
            retry_budget,
            client,
            relays,
            tip_oracle,
            metrics,
        }
    }

    pub fn retry_budget(&self) -> Duration {
        self.retry_budget
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.config.request_timeout_ms)
    }

    fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.config.retry_interval_ms)
    }

    /// Tip for this push; the default when the oracle is absent or fails
    async fn resolve_tip(&self) -> u64 {
        let recent = match (&self.tip_oracle, self.tip_policy.dynamic) {
            (Some(oracle), true) => match timeout(self.request_timeout(), oracle.recent_tip()).await {
                Ok(Ok(tip)) => Some(tip),
                Ok(Err(e)) => {
                    warn!(shard = %self.shard, error = %e, "Tip oracle failed, using default tip");
                    None
                }
                Err(_) => {
                    warn!(shard = %self.shard, "Tip oracle timed out, using default tip");
                    None
                }
            },
            _ => None,
        };
        self.tip_policy.resolve(recent)
    }

    /// Submit to every relay and return the first acceptance, or every error.
    ///
    /// Relays still running after the first acceptance are left to finish in the
    /// background; the round is logged once all of them have answered or timed out.
    async fn fan_out(
        &self,
        mut attempt: BundleAttempt,
        txs: Vec<SignedTransaction>,
        per_call: Duration,
    ) -> Result<TxId, String> {
        let txs: Arc<[SignedTransaction]> = txs.into();
        let mut pending: FuturesUnordered<_> = self
            .relays
            .iter()
            .map(|relay| {
                let relay = Arc::clone(relay);
                let txs = Arc::clone(&txs);
                async move {
                    let result = match timeout(per_call, relay.submit_bundle(&txs)).await {
                        Ok(result) => result,
                        Err(_) => Err(SubmissionError::Transient("relay request timed out".into())),
                    };
                    (relay.id().to_string(), result)
                }
            })
            .collect();

        while let Some((relay, result)) = pending.next().await {
            let accepted = match &result {
                Ok(tx_id) => Some(tx_id.clone()),
                Err(e) => {
                    debug!(relay = %relay, error = %e, "Relay did not accept bundle");
                    None
                }
            };
            attempt.relay_results.insert(relay, result);

            if let Some(tx_id) = accepted {
                tokio::spawn(async move {
                    while let Some((relay, result)) = pending.next().await {
                        attempt.relay_results.insert(relay, result);
                    }
                    attempt.log();
                });
                return Ok(tx_id);
            }
        }

        attempt.log();
        Err(attempt.errors())
    }

    async fn submit_bundle(&self, batch: PushBatch, tip: u64, deadline: Instant) -> (Vec<FeedId>, BundleOutcome) {
        let bundle_id = Uuid::new_v4();
        let feeds = batch.feed_ids().to_vec();
        let mut attempts = 0u32;
        let mut last_error = String::from("retry budget elapsed before first attempt");

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(%bundle_id, feeds = feeds.len(), attempts, %last_error, "Bundle abandoned, retry budget exhausted");
                return (feeds, BundleOutcome::Expired { attempts, last_error });
            }
            attempts += 1;

            match timeout(remaining, self.client.build_update_bundle(&batch, tip)).await {
                Ok(Ok(txs)) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    let per_call = self.request_timeout().min(remaining);
                    let round = BundleAttempt::new(bundle_id, attempts, feeds.clone(), tip);
                    match self.fan_out(round, txs, per_call).await {
                        Ok(tx_id) => {
                            info!(%bundle_id, %tx_id, feeds = feeds.len(), tip, attempts, "Bundle accepted");
                            return (feeds, BundleOutcome::Landed { tx_id, attempts });
                        }
                        Err(e) => last_error = e,
                    }
                }
                Ok(Err(SubmissionError::Rejected(reason))) => {
                    warn!(%bundle_id, %reason, "Bundle could not be built");
                    return (feeds, BundleOutcome::Rejected { attempts, reason });
                }
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => last_error = "building bundle timed out".into(),
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            debug!(%bundle_id, attempts, %last_error, "Bundle not accepted, retrying");
            sleep(self.retry_interval().min(remaining)).await;
        }
    }
}

#[async_trait]
impl PushStrategy for BundledPusher {
    fn name(&self) -> &'static str {
        "bundled"
    }

    async fn push(&self, batch: PushBatch) -> PushResult<PushReceipt> {
        if batch.is_empty() {
            return Err(PushError::EmptyBatch);
        }

        let deadline = deadline_after(self.retry_budget);
        let tip = self.resolve_tip().await;
        self.metrics.bundle_tip(&self.shard, tip);

        let chunks = batch.chunks(self.config.updates_per_bundle);
        let total = chunks.len();
        debug!(shard = %self.shard, feeds = batch.len(), bundles = total, tip, "Submitting bundles");

        let outcomes = join_all(
            chunks
                .into_iter()
                .map(|chunk| self.submit_bundle(chunk, tip, deadline)),
        )
        .await;

        let mut receipt = PushReceipt::default();
        let mut rejections = Vec::new();
        for (feeds, outcome) in outcomes {
            receipt.attempts += outcome.attempts();
            match outcome {
                BundleOutcome::Landed { tx_id, .. } => receipt.tx_ids.push(tx_id),
                BundleOutcome::Rejected { reason, .. } => {
                    rejections.push(reason);
                    receipt.abandoned.extend(feeds);
                }
                BundleOutcome::Expired { .. } => receipt.abandoned.extend(feeds),
            }
        }

        if receipt.tx_ids.is_empty() {
            let failed = total;
            if rejections.len() == failed {
                return Err(PushError::Build(rejections.swap_remove(0)));
            }
            return Err(PushError::BudgetExhausted {
                budget_ms: self.retry_budget.as_millis() as u64,
                failed,
                total,
            });
        }

        if !receipt.abandoned.is_empty() {
            warn!(
                shard = %self.shard,
                abandoned = receipt.abandoned.len(),
                landed = receipt.tx_ids.len(),
                "Push partially succeeded"
            );
        }
        Ok(receipt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{batch, MockClient, MockRelay, RelayBehaviour};
    use pusher_core::{ChainId, NoopMetrics, SourceError, SourceResult};

    struct FixedTip(u64);

    #[async_trait]
    impl TipOracle for FixedTip {
        async fn recent_tip(&self) -> SourceResult<u64> {
            Ok(self.0)
        }
    }

    struct BrokenTip;

    #[async_trait]
    impl TipOracle for BrokenTip {
        async fn recent_tip(&self) -> SourceResult<u64> {
            Err(SourceError::Rpc("tip floor unavailable".into()))
        }
    }

    struct SilentTip;

    #[async_trait]
    impl TipOracle for SilentTip {
        async fn recent_tip(&self) -> SourceResult<u64> {
            std::future::pending().await
        }
    }

    #[derive(Default)]
    struct TipRecorder(parking_lot::Mutex<Vec<u64>>);

    impl MetricsSink for TipRecorder {
        fn tick_evaluated(&self, _: &ShardKey, _: usize, _: usize) {}
        fn tick_skipped(&self, _: &ShardKey) {}
        fn push_attempted(&self, _: &ShardKey, _: usize) {}
        fn push_succeeded(&self, _: &ShardKey, _: usize, _: Duration) {}
        fn push_failed(&self, _: &ShardKey, _: usize, _: &str) {}
        fn feed_staleness(&self, _: &ShardKey, _: &str, _: u64) {}
        fn signer_balance(&self, _: &ShardKey, _: u64) {}
        fn bundle_tip(&self, _: &ShardKey, tip: u64) {
            self.0.lock().push(tip);
        }
    }

    fn config(updates_per_bundle: usize) -> BundleConfig {
        BundleConfig {
            default_tip_lamports: 10_000,
            dynamic_tips: true,
            max_tip_lamports: 100_000,
            updates_per_bundle,
            relay_endpoints: vec![],
            retry_interval_ms: 500,
            request_timeout_ms: 2_000,
            tip_floor_url: None,
        }
    }

    fn pusher(
        updates_per_bundle: usize,
        budget: Duration,
        client: Arc<MockClient>,
        relays: Vec<Arc<MockRelay>>,
        tip_oracle: Option<Arc<dyn TipOracle>>,
    ) -> BundledPusher {
        BundledPusher::new(
            ShardKey::new(ChainId::new("solana"), 0),
            config(updates_per_bundle),
            budget,
            client,
            relays.into_iter().map(|r| r as Arc<dyn BundleRelay>).collect(),
            tip_oracle,
            Arc::new(NoopMetrics),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_splits_batch_into_sub_bundles() {
        let client = MockClient::new(vec![]);
        let relay = MockRelay::new("a", RelayBehaviour::Accept);
        let p = pusher(2, Duration::from_secs(10), client.clone(), vec![relay], None);

        let receipt = p.push(batch(5)).await.unwrap();

        assert_eq!(receipt.tx_ids.len(), 3);
        assert_eq!(receipt.attempts, 3);
        assert!(receipt.abandoned.is_empty());
        let mut sizes = client.bundle_sizes.lock().clone();
        sizes.sort_unstable();
        assert_eq!(sizes, vec![1, 2, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_relays_stop_at_budget() {
        let client = MockClient::new(vec![]);
        let relays = vec![
            MockRelay::new("a", RelayBehaviour::Fail),
            MockRelay::new("b", RelayBehaviour::Fail),
        ];
        let budget = Duration::from_secs(3);
        let p = pusher(6, budget, client, relays.clone(), None);

        let started = Instant::now();
        let err = p.push(batch(2)).await.unwrap_err();

        assert!(started.elapsed() <= budget);
        match err {
            PushError::BudgetExhausted { failed, total, budget_ms } => {
                assert_eq!((failed, total, budget_ms), (1, 1, 3_000));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        // one round every 500ms
        assert_eq!(relays[0].call_count(), 6);
        assert_eq!(relays[1].call_count(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_relay_cannot_exceed_budget() {
        let client = MockClient::new(vec![]);
        let relay = MockRelay::new("slow", RelayBehaviour::Hang);
        let budget = Duration::from_secs(5);
        let p = pusher(6, budget, client, vec![relay.clone()], None);

        let started = Instant::now();
        let result = p.push(batch(1)).await;

        assert!(matches!(result, Err(PushError::BudgetExhausted { .. })));
        assert!(started.elapsed() <= budget);
        assert!(relay.call_count() >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_acceptance_wins_over_hanging_relay() {
        let client = MockClient::new(vec![]);
        let relays = vec![
            MockRelay::new("slow", RelayBehaviour::Hang),
            MockRelay::new("fast", RelayBehaviour::Accept),
        ];
        let p = pusher(6, Duration::from_secs(10), client, relays, None);

        let started = Instant::now();
        let receipt = p.push(batch(2)).await.unwrap();

        assert_eq!(receipt.tx_ids, vec![TxId("fast-0-2".into())]);
        assert!(started.elapsed() < Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dynamic_tip_is_capped() {
        let client = MockClient::new(vec![]);
        let relay = MockRelay::new("a", RelayBehaviour::Accept);
        let oracle: Arc<dyn TipOracle> = Arc::new(FixedTip(5_000_000));
        let p = pusher(1, Duration::from_secs(10), client.clone(), vec![relay], Some(oracle));

        p.push(batch(3)).await.unwrap();

        assert_eq!(*client.tips.lock(), vec![100_000; 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tip_falls_back_to_default_when_oracle_fails() {
        let oracles: [Arc<dyn TipOracle>; 2] = [Arc::new(BrokenTip), Arc::new(SilentTip)];
        for oracle in oracles {
            let client = MockClient::new(vec![]);
            let relay = MockRelay::new("a", RelayBehaviour::Accept);
            let metrics = Arc::new(TipRecorder::default());
            let p = BundledPusher::new(
                ShardKey::new(ChainId::new("solana"), 0),
                config(6),
                Duration::from_secs(10),
                client.clone(),
                vec![relay as Arc<dyn BundleRelay>],
                Some(oracle),
                metrics.clone(),
            );

            let started = Instant::now();
            p.push(batch(2)).await.unwrap();

            // a silent oracle costs at most one request timeout
            assert!(started.elapsed() <= Duration::from_millis(2_000));
            assert_eq!(*metrics.0.lock(), vec![10_000]);
            assert_eq!(*client.tips.lock(), vec![10_000]);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_slower_relays_finish_after_first_acceptance() {
        let client = MockClient::new(vec![]);
        let slow = MockRelay::new("slow", RelayBehaviour::SlowFail(Duration::from_millis(50)));
        let fast = MockRelay::new("fast", RelayBehaviour::Accept);
        let p = pusher(6, Duration::from_secs(10), client, vec![slow.clone(), fast], None);

        let receipt = p.push(batch(2)).await.unwrap();
        assert_eq!(receipt.tx_ids, vec![TxId("fast-0-2".into())]);

        sleep(Duration::from_secs(1)).await;
        assert_eq!(slow.call_count(), 1);
        assert_eq!(slow.completed.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_round_records_every_relay() {
        let client = MockClient::new(vec![]);
        let relays = vec![
            MockRelay::new("a", RelayBehaviour::Fail),
            MockRelay::new("b", RelayBehaviour::SlowFail(Duration::from_millis(10))),
        ];
        let p = pusher(6, Duration::from_secs(10), client, relays, None);

        let round = BundleAttempt::new(Uuid::new_v4(), 1, vec![FeedId::new([1; 32])], 10_000);
        let err = p
            .fan_out(round, vec![vec![1]], Duration::from_secs(1))
            .await
            .unwrap_err();

        assert_eq!(err, "a: Transient network error: relay unavailable; b: Transient network error: relay congested");
    }

    #[test]
    fn test_round_without_relays() {
        let round = BundleAttempt::new(Uuid::new_v4(), 1, vec![], 0);
        assert_eq!(round.accepted(), 0);
        assert_eq!(round.errors(), "no relays configured");
    }

    #[tokio::test(start_paused = true)]
    async fn test_build_rejection_abandons_without_retry() {
        let client = Arc::new(MockClient::with_build_error(
            vec![],
            Some(SubmissionError::Rejected("too many accounts".into())),
        ));
        let relay = MockRelay::new("a", RelayBehaviour::Accept);
        let p = pusher(6, Duration::from_secs(10), client, vec![relay.clone()], None);

        let err = p.push(batch(2)).await.unwrap_err();

        assert!(matches!(err, PushError::Build(_)));
        assert_eq!(relay.call_count(), 0);
    }
}
