//! Keep-alive for idle pooled sessions

use super::{JobError, JobResult, PeriodicJob};
use crate::hsm::{HsmClient, HsmPool};
use async_trait::async_trait;
use tracing::debug;

/// Pings idle sessions so the HSM does not close them
///
/// Runs every quarter of the idle timeout.
pub struct KeepAliveJob<C: HsmClient> {
    pool: HsmPool<C>,
}

impl<C: HsmClient> KeepAliveJob<C> {
    pub fn new(pool: HsmPool<C>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl<C: HsmClient> PeriodicJob for KeepAliveJob<C> {
    fn name(&self) -> &str {
        "keep-alive"
    }

    async fn execute_job(&mut self) -> JobResult<()> {
        let pool = self.pool.clone();
        let discarded = tokio::task::spawn_blocking(move || pool.keep_idle_sessions_alive())
            .await
            .map_err(|e| JobError::Unrecognized(anyhow::anyhow!("keep-alive task failed: {}", e)))?;

        debug!(
            discarded = discarded,
            idle = self.pool.idle_count(),
            "Idle HSM sessions kept alive"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigKey;
    use crate::hsm::{BlobCache, HsmFactory, IdentityResolver, InMemoryBlobStore, PoolOptions, SimulatedHsmClient};
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_healthy_sessions_survive() {
        let client = Arc::new(SimulatedHsmClient::new());
        let cache = Arc::new(BlobCache::new(Arc::new(InMemoryBlobStore::new())));
        let resolver = IdentityResolver::new(HashMap::<ConfigKey, String>::new());
        let pool = HsmPool::new(
            HsmFactory::new(client.clone(), "simulated", cache, &resolver),
            PoolOptions {
                max_sessions: 2,
                acquire_timeout: Duration::from_millis(100),
                idle_timeout: Duration::ZERO,
            },
        );
        pool.prewarm(2).await.unwrap();

        let mut job = KeepAliveJob::new(pool.clone());
        job.execute_job().await.unwrap();

        assert_eq!(pool.idle_count(), 2);
        assert_eq!(client.disconnect_count(), 0);
    }
}
