//! Scripted fakes of the chain client traits

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pusher_core::{FeedId, PushBatch, SubmissionError, SubmissionResult, TxId, UpdateData};

use crate::client::{BundleRelay, SignedTransaction, TransactionClient};

pub fn batch(n: u8) -> PushBatch {
    (0..n)
        .map(|i| (FeedId::new([i; 32]), UpdateData::from(vec![i])))
        .collect()
}

/// Transaction client whose `submit` plays back a script, repeating the last entry
pub struct MockClient {
    script: Mutex<Vec<SubmissionResult<TxId>>>,
    pub fees: Mutex<Vec<u64>>,
    pub tips: Mutex<Vec<u64>>,
    pub bundle_sizes: Mutex<Vec<usize>>,
    pub submits: AtomicUsize,
    pub build_error: Option<SubmissionError>,
}

impl MockClient {
    pub fn new(script: Vec<SubmissionResult<TxId>>) -> Arc<Self> {
        Arc::new(Self::with_build_error(script, None))
    }

    pub fn with_build_error(script: Vec<SubmissionResult<TxId>>, build_error: Option<SubmissionError>) -> Self {
        Self {
            script: Mutex::new(script),
            fees: Mutex::new(vec![]),
            tips: Mutex::new(vec![]),
            bundle_sizes: Mutex::new(vec![]),
            submits: AtomicUsize::new(0),
            build_error,
        }
    }

    pub fn submit_count(&self) -> usize {
        self.submits.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransactionClient for MockClient {
    async fn build_update_transaction(
        &self,
        batch: &PushBatch,
        fee_price: u64,
    ) -> SubmissionResult<SignedTransaction> {
        if let Some(e) = &self.build_error {
            return Err(e.clone());
        }
        self.fees.lock().push(fee_price);
        Ok(vec![batch.len() as u8])
    }

    async fn build_update_bundle(
        &self,
        batch: &PushBatch,
        tip: u64,
    ) -> SubmissionResult<Vec<SignedTransaction>> {
        if let Some(e) = &self.build_error {
            return Err(e.clone());
        }
        self.tips.lock().push(tip);
        self.bundle_sizes.lock().push(batch.len());
        Ok(vec![vec![batch.len() as u8], vec![0xff]])
    }

    async fn submit(&self, _tx: &SignedTransaction) -> SubmissionResult<TxId> {
        self.submits.fetch_add(1, Ordering::SeqCst);
        let mut script = self.script.lock();
        if script.len() > 1 {
            script.remove(0)
        } else {
            script[0].clone()
        }
    }
}

#[derive(Clone, Copy)]
pub enum RelayBehaviour {
    Accept,
    Fail,
    Hang,
    /// Answer with an error after a delay
    SlowFail(Duration),
}

pub struct MockRelay {
    id: String,
    behaviour: RelayBehaviour,
    pub calls: AtomicUsize,
    /// Calls that ran to completion instead of being dropped
    pub completed: AtomicUsize,
}

impl MockRelay {
    pub fn new(id: &str, behaviour: RelayBehaviour) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            behaviour,
            calls: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BundleRelay for MockRelay {
    fn id(&self) -> &str {
        &self.id
    }

    async fn submit_bundle(&self, bundle: &[SignedTransaction]) -> SubmissionResult<TxId> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        let result = match self.behaviour {
            RelayBehaviour::Accept => Ok(TxId(format!("{}-{}-{}", self.id, n, bundle.len()))),
            RelayBehaviour::Fail => Err(SubmissionError::Transient("relay unavailable".into())),
            RelayBehaviour::Hang => std::future::pending().await,
            RelayBehaviour::SlowFail(delay) => {
                tokio::time::sleep(delay).await;
                Err(SubmissionError::Transient("relay congested".into()))
            }
        };
        self.completed.fetch_add(1, Ordering::SeqCst);
        result
    }
}
