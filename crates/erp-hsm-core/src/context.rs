//! Service context
//!
//! Builds the blob cache, pool and background jobs from configuration and
//! owns them until [`HsmServiceContext::shutdown`]. Everything that needs HSM
//! access receives the context (or a pool handle) explicitly.

use crate::config::Config;
use crate::error::Result;
use crate::hsm::{
    BlobCache, BlobStore, HsmClient, HsmFactory, HsmPool, IdentityResolver, PoolOptions,
};
use crate::jobs::{
    BlobCacheRefreshJob, CoalescingTrustStore, JobError, JobRunner, KeepAliveJob, PeriodicJob,
    PseudonymKeyHolder, PseudonymKeyRefreshJob, TeeTokenRefreshJob, TrustStore,
    TrustStoreRefreshJob,
};
use std::sync::Arc;
use tracing::{error, info, warn};

pub struct HsmServiceContext<C: HsmClient> {
    config: Config,
    cache: Arc<BlobCache>,
    pool: HsmPool<C>,
    trust_store: Arc<dyn TrustStore>,
    pseudonym_key: PseudonymKeyHolder,
    jobs: Vec<JobRunner>,
}

impl<C: HsmClient> HsmServiceContext<C> {
    /// Build the context and start the background jobs
    ///
    /// A TEE token is requested before the jobs start. If that fails the
    /// context still starts and the token job retries on its retry interval.
    pub async fn start(
        config: Config,
        client: Arc<C>,
        store: Arc<dyn BlobStore>,
        trust_store: Arc<dyn TrustStore>,
    ) -> Result<Self> {
        let cache = Arc::new(BlobCache::load(store).await?);
        let resolver = IdentityResolver::new(config.clone());
        let factory = HsmFactory::new(client, config.hsm.device.clone(), cache.clone(), &resolver);
        let pool = HsmPool::new(factory, PoolOptions::from(&config.pool));
        let trust_store: Arc<dyn TrustStore> = Arc::new(CoalescingTrustStore::new(trust_store));

        let mut token_job = TeeTokenRefreshJob::new(
            pool.clone(),
            cache.clone(),
            config.jobs.tee_token_validity(),
            config.jobs.tee_token_retry(),
        );
        if let Err(e) = token_job.execute_job().await {
            warn!(error = %e, "Initial TEE token refresh failed");
        }

        let pseudonym_key = PseudonymKeyHolder::new();
        let mut jobs = vec![
            JobRunner::start(token_job, config.jobs.tee_token_update()),
            JobRunner::start(
                TrustStoreRefreshJob::new(trust_store.clone()),
                config.jobs.trust_store_refresh(),
            ),
            JobRunner::start(BlobCacheRefreshJob::new(cache.clone()), config.jobs.cache_refresh()),
            JobRunner::start(KeepAliveJob::new(pool.clone()), config.pool.keep_alive_interval()),
        ];
        if config.jobs.pseudonym_key_enabled {
            jobs.push(JobRunner::start(
                PseudonymKeyRefreshJob::new(
                    pool.clone(),
                    cache.clone(),
                    pseudonym_key.clone(),
                    config.jobs.pseudonym_key_expire(),
                    config.jobs.pseudonym_key_failed_check(),
                ),
                config.jobs.pseudonym_key_check(),
            ));
        }

        info!(
            device = %config.hsm.device,
            max_sessions = pool.options().max_sessions,
            jobs = jobs.len(),
            "HSM service started"
        );

        Ok(Self {
            config,
            cache,
            pool,
            trust_store,
            pseudonym_key,
            jobs,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cache(&self) -> &Arc<BlobCache> {
        &self.cache
    }

    pub fn pool(&self) -> &HsmPool<C> {
        &self.pool
    }

    /// The trust store, with concurrent refreshes coalesced
    pub fn trust_store(&self) -> &Arc<dyn TrustStore> {
        &self.trust_store
    }

    /// The current pseudonym key, when the pseudonym key job is enabled
    pub fn pseudonym_key(&self) -> &PseudonymKeyHolder {
        &self.pseudonym_key
    }

    /// Running jobs, for health reporting
    pub fn jobs(&self) -> &[JobRunner] {
        &self.jobs
    }

    /// Stop every job, then close the pool
    ///
    /// Returns the first error a job terminated with.
    pub async fn shutdown(mut self) -> std::result::Result<(), JobError> {
        let mut first_error = None;
        for runner in &mut self.jobs {
            if let Err(e) = runner.stop().await {
                error!(job = %runner.name(), error = %e, "Job ended with an error");
                first_error.get_or_insert(e);
            }
        }

        self.pool.shutdown();
        info!("HSM service stopped");

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
