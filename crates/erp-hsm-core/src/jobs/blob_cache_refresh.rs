//! Blob cache refresh
//!
//! Reloads the cache snapshot so blobs written by other processes sharing the
//! store become visible.

use super::{JobResult, PeriodicJob};
use crate::hsm::BlobCache;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

pub struct BlobCacheRefreshJob {
    cache: Arc<BlobCache>,
}

impl BlobCacheRefreshJob {
    pub fn new(cache: Arc<BlobCache>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl PeriodicJob for BlobCacheRefreshJob {
    fn name(&self) -> &str {
        "blob-cache-refresh"
    }

    async fn execute_job(&mut self) -> JobResult<()> {
        self.cache.rebuild().await?;
        debug!(blobs = self.cache.len()?, "Blob cache refreshed");
        Ok(())
    }
}
