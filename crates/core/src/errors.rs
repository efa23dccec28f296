//! Error types

use thiserror::Error;

use crate::FeedId;

/// Configuration and registry errors
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid feed id: {0}")]
    InvalidFeedId(String),

    #[error("Feed {0} is not recognised by the off-chain source")]
    InvalidFeed(FeedId),

    #[error("Feed {0} configured more than once")]
    DuplicateFeed(FeedId),

    #[error("Config loading failed: {0}")]
    ConfigLoad(#[from] config::ConfigError),
}

/// Failures of the external price, balance and tip sources
#[derive(Debug, Clone, Error)]
pub enum SourceError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Invalid message format: {0}")]
    Decode(String),

    #[error("Timeout waiting for data")]
    Timeout,
}

/// Failure of a single transaction or bundle submission
#[derive(Debug, Clone, Error)]
pub enum SubmissionError {
    /// RPC or relay unreachable / timed out; safe to retry
    #[error("Transient network error: {0}")]
    Transient(String),

    /// The chain or relay refused the transaction; retrying it unchanged is pointless
    #[error("Submission rejected: {0}")]
    Rejected(String),
}

impl SubmissionError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SubmissionError::Transient(_))
    }
}

/// Outcome of a failed push for a whole batch
#[derive(Debug, Clone, Error)]
pub enum PushError {
    #[error("Nothing to push")]
    EmptyBatch,

    #[error("Building transaction failed: {0}")]
    Build(String),

    #[error("Transaction rejected: {0}")]
    Rejected(String),

    #[error("Giving up after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("Retry budget of {budget_ms}ms exhausted for {failed} of {total} bundles")]
    BudgetExhausted {
        budget_ms: u64,
        failed: usize,
        total: usize,
    },
}

impl PushError {
    /// Short machine-friendly label for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            PushError::EmptyBatch => "empty_batch",
            PushError::Build(_) => "build",
            PushError::Rejected(_) => "rejected",
            PushError::RetriesExhausted { .. } => "retries_exhausted",
            PushError::BudgetExhausted { .. } => "budget_exhausted",
        }
    }
}

/// Result type alias
pub type CoreResult<T> = Result<T, CoreError>;
pub type SourceResult<T> = Result<T, SourceError>;
pub type SubmissionResult<T> = Result<T, SubmissionError>;
pub type PushResult<T> = Result<T, PushError>;
