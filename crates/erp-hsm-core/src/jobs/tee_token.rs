//! TEE token refresh
//!
//! Most HSM operations need a TEE token. This job fetches a fresh one on a
//! schedule and stores it in the blob cache; sessions always read the newest
//! valid token from there. A failed refresh leaves the previous token in place
//! until it expires.

use super::{JobResult, PeriodicJob};
use crate::error::{Error, Result};
use crate::hsm::{BlobCache, BlobId, BlobType, HsmClient, HsmPool, NewBlob, Validity};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

pub struct TeeTokenRefreshJob<C: HsmClient> {
    pool: HsmPool<C>,
    cache: Arc<BlobCache>,
    validity: Duration,
    retry_interval: Duration,
    last_failed: bool,
}

impl<C: HsmClient> TeeTokenRefreshJob<C> {
    pub fn new(pool: HsmPool<C>, cache: Arc<BlobCache>, validity: Duration, retry_interval: Duration) -> Self {
        Self {
            pool,
            cache,
            validity,
            retry_interval,
            last_failed: false,
        }
    }

    /// Fetch and store a new token, then drop expired ones
    pub async fn refresh(&self) -> Result<BlobId> {
        let token = self.pool.with_session(|session| session.create_tee_token()).await?;

        let now = Utc::now();
        let length = chrono::Duration::from_std(self.validity)
            .map_err(|e| Error::Config(format!("TEE token validity out of range: {}", e)))?;
        let name = format!("tee-token-{}", Uuid::new_v4());
        let id = self
            .cache
            .store(NewBlob::new(BlobType::TeeToken, name, token, Validity::starting_at(now, length)?))
            .await?;
        info!(blob_type = %BlobType::TeeToken, blob_id = %id, "TEE token refreshed");

        self.prune(now).await?;
        Ok(id)
    }

    async fn prune(&self, now: DateTime<Utc>) -> Result<()> {
        for entry in self.cache.entries_of_type(BlobType::TeeToken)? {
            if entry.validity.not_after() > now {
                continue;
            }
            match self.cache.delete(BlobType::TeeToken, &entry.name).await {
                Ok(()) | Err(Error::BlobNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl<C: HsmClient> PeriodicJob for TeeTokenRefreshJob<C> {
    fn name(&self) -> &str {
        "tee-token-refresh"
    }

    async fn execute_job(&mut self) -> JobResult<()> {
        match self.refresh().await {
            Ok(_) => {
                self.last_failed = false;
                Ok(())
            }
            Err(e) => {
                self.last_failed = true;
                if self.cache.current(BlobType::TeeToken, Utc::now()).is_ok() {
                    warn!("TEE token refresh failed; previous token remains in use");
                }
                Err(e.into())
            }
        }
    }

    fn next_interval(&self) -> Option<Duration> {
        self.last_failed.then_some(self.retry_interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigKey;
    use crate::hsm::{HsmFactory, IdentityResolver, InMemoryBlobStore, PoolOptions, SimulatedHsmClient};
    use crate::jobs::JobError;
    use std::collections::HashMap;

    fn setup(client: Arc<SimulatedHsmClient>) -> (HsmPool<SimulatedHsmClient>, Arc<BlobCache>) {
        let cache = Arc::new(BlobCache::new(Arc::new(InMemoryBlobStore::new())));
        let resolver = IdentityResolver::new(HashMap::<ConfigKey, String>::new());
        let pool = HsmPool::new(
            HsmFactory::new(client, "simulated", cache.clone(), &resolver),
            PoolOptions {
                max_sessions: 1,
                acquire_timeout: Duration::from_millis(100),
                idle_timeout: Duration::from_secs(900),
            },
        );
        (pool, cache)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_refresh_stores_unique_tokens() {
        let client = Arc::new(SimulatedHsmClient::new());
        let (pool, cache) = setup(client);
        let job = TeeTokenRefreshJob::new(pool, cache.clone(), Duration::from_secs(1800), Duration::from_secs(10));

        let first = job.refresh().await.unwrap();
        let second = job.refresh().await.unwrap();
        assert!(second > first);

        let current = cache.current(BlobType::TeeToken, Utc::now()).unwrap();
        assert_eq!(current.id, second);
        assert_eq!(cache.entries_of_type(BlobType::TeeToken).unwrap().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failure_switches_to_retry_interval() {
        let client = Arc::new(SimulatedHsmClient::new());
        let (pool, cache) = setup(client.clone());
        let mut job = TeeTokenRefreshJob::new(pool, cache.clone(), Duration::from_secs(1800), Duration::from_secs(10));

        job.execute_job().await.unwrap();
        assert_eq!(job.next_interval(), None);

        client.set_fail_tee_token(true);
        let result = job.execute_job().await;
        assert!(matches!(result, Err(JobError::Runtime(Error::HsmOperation { .. }))));
        assert_eq!(job.next_interval(), Some(Duration::from_secs(10)));
        assert!(cache.current(BlobType::TeeToken, Utc::now()).is_ok());

        client.set_fail_tee_token(false);
        job.execute_job().await.unwrap();
        assert_eq!(job.next_interval(), None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_expired_tokens_are_pruned() {
        let client = Arc::new(SimulatedHsmClient::new());
        let (pool, cache) = setup(client);

        let past = Utc::now() - chrono::Duration::hours(2);
        let expired = Validity::starting_at(past, chrono::Duration::minutes(30)).unwrap();
        cache
            .store(NewBlob::new(BlobType::TeeToken, "stale-token", vec![0; 16], expired))
            .await
            .unwrap();

        let job = TeeTokenRefreshJob::new(pool, cache.clone(), Duration::from_secs(1800), Duration::from_secs(10));
        job.refresh().await.unwrap();

        let tokens = cache.entries_of_type(BlobType::TeeToken).unwrap();
        assert_eq!(tokens.len(), 1);
        assert_ne!(tokens[0].name, "stale-token");
    }
}
