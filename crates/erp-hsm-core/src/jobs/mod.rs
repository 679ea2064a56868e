//! Periodic background jobs
//!
//! Every job runs on its own task under a [`JobRunner`]. Job failures are
//! typed: recoverable failures are logged and the job runs again on its next
//! interval, an [`JobError::Unrecognized`] failure stops the runner.

pub mod blob_cache_refresh;
pub mod keep_alive;
pub mod pseudonym_key;
pub mod runner;
pub mod tee_token;
pub mod trust_store;

use crate::error::Error;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

pub use blob_cache_refresh::BlobCacheRefreshJob;
pub use keep_alive::KeepAliveJob;
pub use pseudonym_key::{PseudonymKeyHolder, PseudonymKeyRefreshJob};
pub use runner::JobRunner;
pub use tee_token::TeeTokenRefreshJob;
pub use trust_store::{CoalescingTrustStore, NullTrustStore, TrustStore, TrustStoreRefreshJob};

/// Result type for job bodies
pub type JobResult<T> = std::result::Result<T, JobError>;

/// Trust store refresh errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TrustStoreError {
    /// The trust material could not be fetched
    #[error("Trust material unavailable: {0}")]
    Unavailable(String),

    /// The fetched trust material failed verification
    #[error("Trust material rejected: {0}")]
    Rejected(String),
}

/// Job failures
#[derive(Error, Debug)]
pub enum JobError {
    #[error("Trust store refresh failed: {0}")]
    TrustStore(#[from] TrustStoreError),

    #[error(transparent)]
    Runtime(#[from] Error),

    #[error("Job logic error: {0}")]
    Logic(String),

    /// Anything the job did not anticipate; stops the runner
    #[error("Unrecognized job failure: {0}")]
    Unrecognized(anyhow::Error),
}

impl JobError {
    /// Whether the runner keeps going after this failure
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::TrustStore(_) | Self::Runtime(_) | Self::Logic(_) => true,
            Self::Unrecognized(_) => false,
        }
    }
}

/// A job run by a [`JobRunner`]
#[async_trait]
pub trait PeriodicJob: Send + 'static {
    fn name(&self) -> &str;

    /// Called once before the first interval
    async fn on_start(&mut self) -> JobResult<()> {
        Ok(())
    }

    /// One cycle of work
    async fn execute_job(&mut self) -> JobResult<()>;

    /// Called once when the runner stops, including after an unrecognized failure
    async fn on_finish(&mut self) {}

    /// Wait before the next cycle; `None` uses the runner's interval
    fn next_interval(&self) -> Option<Duration> {
        None
    }
}
