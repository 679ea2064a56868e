//! Trust store refresh
//!
//! The trust store itself (TSL/certificate material) lives outside this
//! crate. This job only triggers its on-demand update.

use super::{JobResult, PeriodicJob, TrustStoreError};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

/// Source of trust material that can be refreshed on demand
#[async_trait]
pub trait TrustStore: Send + Sync {
    /// Refresh the trust material if it is due
    ///
    /// Must be idempotent; concurrent calls must be safe.
    async fn update_on_demand(&self) -> Result<(), TrustStoreError>;
}

#[async_trait]
impl<T: TrustStore + ?Sized> TrustStore for Arc<T> {
    async fn update_on_demand(&self) -> Result<(), TrustStoreError> {
        (**self).update_on_demand().await
    }
}

/// Trust store used when none is configured
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTrustStore;

#[async_trait]
impl TrustStore for NullTrustStore {
    async fn update_on_demand(&self) -> Result<(), TrustStoreError> {
        debug!("No trust store configured; skipping refresh");
        Ok(())
    }
}

/// Collapses overlapping refreshes into one
///
/// A refresh requested while another is in flight returns immediately.
#[derive(Debug)]
pub struct CoalescingTrustStore<T> {
    inner: T,
    refreshing: AtomicBool,
}

impl<T: TrustStore> CoalescingTrustStore<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            refreshing: AtomicBool::new(false),
        }
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }

    pub fn is_refreshing(&self) -> bool {
        self.refreshing.load(Ordering::Acquire)
    }
}

/// Clears the in-flight flag, also when the refresh future is dropped
struct RefreshGuard<'a>(&'a AtomicBool);

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[async_trait]
impl<T: TrustStore> TrustStore for CoalescingTrustStore<T> {
    async fn update_on_demand(&self) -> Result<(), TrustStoreError> {
        if self.refreshing.swap(true, Ordering::AcqRel) {
            debug!("Trust store refresh already running; coalesced");
            return Ok(());
        }
        let _guard = RefreshGuard(&self.refreshing);
        self.inner.update_on_demand().await
    }
}

/// Periodically triggers [`TrustStore::update_on_demand`]
pub struct TrustStoreRefreshJob {
    store: Arc<dyn TrustStore>,
}

impl TrustStoreRefreshJob {
    pub fn new(store: Arc<dyn TrustStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl PeriodicJob for TrustStoreRefreshJob {
    fn name(&self) -> &str {
        "trust-store-refresh"
    }

    async fn execute_job(&mut self) -> JobResult<()> {
        self.store.update_on_demand().await?;
        info!("Trust store refreshed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobError;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::Notify;

    #[derive(Default)]
    struct SlowTrustStore {
        calls: AtomicUsize,
        release: Notify,
    }

    #[async_trait]
    impl TrustStore for SlowTrustStore {
        async fn update_on_demand(&self) -> Result<(), TrustStoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.release.notified().await;
            Ok(())
        }
    }

    struct OfflineTrustStore;

    #[async_trait]
    impl TrustStore for OfflineTrustStore {
        async fn update_on_demand(&self) -> Result<(), TrustStoreError> {
            Err(TrustStoreError::Unavailable("TSL download failed".into()))
        }
    }

    #[tokio::test]
    async fn test_concurrent_refreshes_coalesce() {
        let store = Arc::new(CoalescingTrustStore::new(SlowTrustStore::default()));

        let first = tokio::spawn({
            let store = store.clone();
            async move { store.update_on_demand().await }
        });
        while !store.is_refreshing() {
            tokio::task::yield_now().await;
        }

        store.update_on_demand().await.unwrap();
        assert_eq!(store.inner().calls.load(Ordering::SeqCst), 1);

        store.inner().release.notify_one();
        first.await.unwrap().unwrap();
        assert!(!store.is_refreshing());
    }

    #[tokio::test]
    async fn test_cancelled_refresh_clears_flag() {
        let store = CoalescingTrustStore::new(SlowTrustStore::default());

        let result = tokio::time::timeout(Duration::from_millis(10), store.update_on_demand()).await;
        assert!(result.is_err());
        assert!(!store.is_refreshing());
    }

    #[tokio::test]
    async fn test_job_surfaces_trust_store_error() {
        let mut job = TrustStoreRefreshJob::new(Arc::new(OfflineTrustStore));
        let result = job.execute_job().await;
        assert!(matches!(result, Err(JobError::TrustStore(TrustStoreError::Unavailable(_)))));
    }
}
