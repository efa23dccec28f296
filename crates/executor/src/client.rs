//! Chain client capabilities used by the pushers
//!
//! Implementations are chain specific (transaction layout, signing, RPC transport)
//! and are supplied by the embedding application.

use async_trait::async_trait;

use pusher_core::{PushBatch, SourceResult, SubmissionResult, TxId};

/// Serialized, signed transaction ready for submission
pub type SignedTransaction = Vec<u8>;

#[async_trait]
pub trait TransactionClient: Send + Sync {
    /// Build and sign one transaction posting every update in `batch`,
    /// paying `fee_price` as priority fee.
    async fn build_update_transaction(
        &self,
        batch: &PushBatch,
        fee_price: u64,
    ) -> SubmissionResult<SignedTransaction>;

    /// Build and sign the transactions of one bundle posting `batch`,
    /// including a tip transfer of `tip`.
    async fn build_update_bundle(
        &self,
        batch: &PushBatch,
        tip: u64,
    ) -> SubmissionResult<Vec<SignedTransaction>>;

    /// Send a transaction without waiting for confirmation
    async fn submit(&self, tx: &SignedTransaction) -> SubmissionResult<TxId>;
}

/// Priority relay accepting transaction bundles
#[async_trait]
pub trait BundleRelay: Send + Sync {
    fn id(&self) -> &str;

    async fn submit_bundle(&self, bundle: &[SignedTransaction]) -> SubmissionResult<TxId>;
}

/// Reads the spendable balance of the shard's signer
#[async_trait]
pub trait BalanceSource: Send + Sync {
    async fn signer_balance(&self) -> SourceResult<u64>;
}
