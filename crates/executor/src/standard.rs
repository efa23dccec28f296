//! Single-transaction pusher with fee-escalating retries

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use pusher_core::{
    PushBatch, PushError, PushResult, StandardPusherConfig, SubmissionError, SubmissionResult, TxId,
};

use crate::client::TransactionClient;
use crate::pusher::{deadline_after, PushReceipt, PushStrategy};

/// Posts the whole batch in one transaction.
///
/// Transient errors are retried up to `max_retries` times with capped exponential backoff,
/// raising the fee price on every retry. Rejections are returned immediately.
/// Every call is bounded by `request_timeout_ms` and the whole push by the retry budget,
/// so a node that stops answering cannot keep the push in flight.
/// Confirmation is not awaited; the next on-chain poll observes the result.
pub struct StandardPusher {
    config: StandardPusherConfig,
    retry_budget: Duration,
    client: Arc<dyn TransactionClient>,
}

impl StandardPusher {
    pub fn new(config: StandardPusherConfig, retry_budget: Duration, client: Arc<dyn TransactionClient>) -> Self {
        Self {
            config,
            retry_budget,
            client,
        }
    }

    /// Run one client call, turning an elapsed timeout into a transient error
    async fn call<T>(
        &self,
        deadline: Instant,
        what: &str,
        call: impl Future<Output = SubmissionResult<T>>,
    ) -> SubmissionResult<T> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let limit = self.config.request_timeout().min(remaining);
        match timeout(limit, call).await {
            Ok(result) => result,
            Err(_) => Err(SubmissionError::Transient(format!("{what} timed out after {limit:?}"))),
        }
    }

    /// Submit `batch`, returning the transaction id and the number of attempts made
    pub async fn submit_with_retry(&self, batch: &PushBatch) -> PushResult<(TxId, u32)> {
        if batch.is_empty() {
            return Err(PushError::EmptyBatch);
        }

        let deadline = deadline_after(self.retry_budget);
        let mut attempt = 0u32;
        loop {
            let fee_price = self.config.fee_for_attempt(attempt);
            attempt += 1;

            let built = self
                .call(deadline, "building transaction", self.client.build_update_transaction(batch, fee_price))
                .await;
            let error = match built {
                Ok(tx) => match self.call(deadline, "submitting transaction", self.client.submit(&tx)).await {
                    Ok(tx_id) => {
                        info!(%tx_id, feeds = batch.len(), fee_price, attempt, "Update transaction submitted");
                        return Ok((tx_id, attempt));
                    }
                    Err(SubmissionError::Rejected(reason)) => {
                        warn!(%reason, feeds = batch.len(), "Update transaction rejected");
                        return Err(PushError::Rejected(reason));
                    }
                    Err(e) => e,
                },
                Err(SubmissionError::Rejected(reason)) => return Err(PushError::Build(reason)),
                Err(e) => e,
            };

            let remaining = deadline.saturating_duration_since(Instant::now());
            if attempt > self.config.max_retries || remaining.is_zero() {
                warn!(error = %error, attempt, "Giving up on update transaction");
                return Err(PushError::RetriesExhausted {
                    attempts: attempt,
                    last_error: error.to_string(),
                });
            }

            let delay = self.config.retry_delay(attempt).min(remaining);
            warn!(
                error = %error,
                "Submission failed, retrying in {:?} (attempt {}/{})",
                delay,
                attempt,
                self.config.max_retries + 1
            );
            sleep(delay).await;
            debug!(next_fee = self.config.fee_for_attempt(attempt), "Escalating fee price");
        }
    }
}

#[async_trait]
impl PushStrategy for StandardPusher {
    fn name(&self) -> &'static str {
        "standard"
    }

    async fn push(&self, batch: PushBatch) -> PushResult<PushReceipt> {
        let (tx_id, attempts) = self.submit_with_retry(&batch).await?;
        Ok(PushReceipt {
            tx_ids: vec![tx_id],
            attempts,
            abandoned: vec![],
        })
    }
}
