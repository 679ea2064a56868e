//! Pseudonym key refresh
//!
//! Keeps exactly one valid pseudonym key. When none is valid, a new key is
//! generated inside the HSM, stored wrapped, and every older pseudonym key
//! blob is deleted. The unwrapped key is published through a
//! [`PseudonymKeyHolder`].

use super::{JobResult, PeriodicJob};
use crate::error::{Error, Result};
use crate::hsm::{BlobCache, BlobType, HsmClient, HsmPool, NewBlob, Validity};
use crate::secret::SecretBytes;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// Shared slot for the current unwrapped pseudonym key
#[derive(Debug, Clone, Default)]
pub struct PseudonymKeyHolder {
    key: Arc<RwLock<Option<Arc<SecretBytes>>>>,
}

impl PseudonymKeyHolder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<Arc<SecretBytes>> {
        self.key.read().ok().and_then(|slot| slot.clone())
    }

    fn set(&self, key: SecretBytes) -> Result<()> {
        let mut slot = self
            .key
            .write()
            .map_err(|_| Error::Internal("Pseudonym key lock poisoned".into()))?;
        *slot = Some(Arc::new(key));
        Ok(())
    }
}

pub struct PseudonymKeyRefreshJob<C: HsmClient> {
    pool: HsmPool<C>,
    cache: Arc<BlobCache>,
    holder: PseudonymKeyHolder,
    expire: Duration,
    failed_check_interval: Duration,
    last_failed: bool,
}

impl<C: HsmClient> PseudonymKeyRefreshJob<C> {
    pub fn new(
        pool: HsmPool<C>,
        cache: Arc<BlobCache>,
        holder: PseudonymKeyHolder,
        expire: Duration,
        failed_check_interval: Duration,
    ) -> Self {
        Self {
            pool,
            cache,
            holder,
            expire,
            failed_check_interval,
            last_failed: false,
        }
    }

    /// Make sure a valid key exists and is loaded
    ///
    /// Returns whether a new key was generated.
    pub async fn check(&self) -> Result<bool> {
        let now = Utc::now();
        let has_valid = self.cache.has_valid_of_type(&[BlobType::PseudonymKey], now).await?;

        if has_valid.first().copied().unwrap_or(false) {
            if self.holder.get().is_none() {
                let blob = self.cache.current(BlobType::PseudonymKey, now)?;
                let key = self
                    .pool
                    .with_session(move |session| session.unwrap_pseudonym_key(&blob))
                    .await?;
                self.holder.set(key)?;
                debug!("Pseudonym key loaded");
            }
            return Ok(false);
        }

        self.replace().await?;
        Ok(true)
    }

    async fn replace(&self) -> Result<()> {
        let wrapped = self
            .pool
            .with_session(|session| session.generate_pseudonym_key())
            .await?;

        let previous = self.cache.entries_of_type(BlobType::PseudonymKey)?;
        let generation = previous.iter().map(|e| e.generation).max().map_or(1, |g| g + 1);

        let now = Utc::now();
        let length = chrono::Duration::from_std(self.expire)
            .map_err(|e| Error::Config(format!("Pseudonym key lifetime out of range: {}", e)))?;
        let name = format!("pseudonym-key-{}", Uuid::new_v4());
        let id = self
            .cache
            .store(
                NewBlob::new(BlobType::PseudonymKey, name, wrapped, Validity::starting_at(now, length)?)
                    .with_generation(generation),
            )
            .await?;

        for entry in previous {
            self.cache.delete(BlobType::PseudonymKey, &entry.name).await?;
        }

        let blob = self.cache.get(BlobType::PseudonymKey, id).await?;
        let key = self
            .pool
            .with_session(move |session| session.unwrap_pseudonym_key(&blob))
            .await?;
        self.holder.set(key)?;

        info!(blob_type = %BlobType::PseudonymKey, blob_id = %id, generation = generation, "Pseudonym key replaced");
        Ok(())
    }
}

#[async_trait]
impl<C: HsmClient> PeriodicJob for PseudonymKeyRefreshJob<C> {
    fn name(&self) -> &str {
        "pseudonym-key-refresh"
    }

    async fn on_start(&mut self) -> JobResult<()> {
        self.execute_job().await
    }

    async fn execute_job(&mut self) -> JobResult<()> {
        let result = self.check().await;
        self.last_failed = result.is_err();
        result?;
        Ok(())
    }

    fn next_interval(&self) -> Option<Duration> {
        self.last_failed.then_some(self.failed_check_interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigKey;
    use crate::hsm::{HsmFactory, IdentityResolver, InMemoryBlobStore, PoolOptions, SimulatedHsmClient};
    use std::collections::HashMap;

    async fn setup(client: Arc<SimulatedHsmClient>) -> (HsmPool<SimulatedHsmClient>, Arc<BlobCache>) {
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

        let token = pool.with_session(|s| s.create_tee_token()).await.unwrap();
        let validity = Validity::starting_at(Utc::now(), chrono::Duration::hours(1)).unwrap();
        cache
            .store(NewBlob::new(BlobType::TeeToken, "tee-token", token, validity))
            .await
            .unwrap();
        (pool, cache)
    }

    fn job(pool: HsmPool<SimulatedHsmClient>, cache: Arc<BlobCache>, holder: PseudonymKeyHolder) -> PseudonymKeyRefreshJob<SimulatedHsmClient> {
        PseudonymKeyRefreshJob::new(pool, cache, holder, Duration::from_secs(86_400), Duration::from_secs(300))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_generates_key_once() {
        let client = Arc::new(SimulatedHsmClient::new());
        let (pool, cache) = setup(client).await;
        let holder = PseudonymKeyHolder::new();
        let job = job(pool, cache.clone(), holder.clone());

        assert!(job.check().await.unwrap());
        assert!(!job.check().await.unwrap());

        let keys = cache.entries_of_type(BlobType::PseudonymKey).unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].generation, 1);
        assert_eq!(holder.get().unwrap().len(), 32);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_loads_existing_key_without_generating() {
        let client = Arc::new(SimulatedHsmClient::new());
        let (pool, cache) = setup(client).await;

        let first = PseudonymKeyHolder::new();
        job(pool.clone(), cache.clone(), first.clone()).check().await.unwrap();

        let second = PseudonymKeyHolder::new();
        let generated = job(pool, cache.clone(), second.clone()).check().await.unwrap();
        assert!(!generated);
        assert_eq!(*second.get().unwrap(), *first.get().unwrap());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failure_uses_failed_check_interval() {
        let client = Arc::new(SimulatedHsmClient::new());
        let (pool, cache) = setup(client.clone()).await;
        let mut job = job(pool, cache, PseudonymKeyHolder::new());

        client.expire_all_handles();
        assert!(job.execute_job().await.is_err());
        assert_eq!(job.next_interval(), Some(Duration::from_secs(300)));

        job.execute_job().await.unwrap();
        assert_eq!(job.next_interval(), None);
    }
}
