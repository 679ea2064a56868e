//! Snapshot cache over a [`BlobStore`]
//!
//! Sessions read key material on every HSM call, so reads must not touch the
//! backing store. The cache keeps an immutable snapshot of all blobs which is
//! rebuilt after every write and swapped in as a whole; readers see either the
//! old or the new snapshot, never a partial one.

use super::blob::{BlobEntry, BlobId, BlobType, NewBlob};
use super::blob_store::BlobStore;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct Snapshot {
    entries: BTreeMap<(BlobType, BlobId), BlobEntry>,
}

impl Snapshot {
    fn of_type(&self, blob_type: BlobType) -> impl DoubleEndedIterator<Item = &BlobEntry> {
        self.entries
            .range((blob_type, BlobId(0))..=(blob_type, BlobId(u32::MAX)))
            .map(|(_, entry)| entry)
    }
}

/// Cached view of the blob store
pub struct BlobCache {
    store: Arc<dyn BlobStore>,
    // Serializes writes and snapshot rebuilds
    write_lock: Mutex<()>,
    snapshot: RwLock<Arc<Snapshot>>,
}

impl BlobCache {
    /// Create a cache with an empty snapshot; call [`rebuild`](Self::rebuild) to load it
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
            snapshot: RwLock::new(Arc::new(Snapshot::default())),
        }
    }

    /// Create a cache and load the current store contents
    pub async fn load(store: Arc<dyn BlobStore>) -> Result<Self> {
        let cache = Self::new(store);
        cache.rebuild().await?;
        Ok(cache)
    }

    /// Store a new blob and refresh the snapshot
    ///
    /// Succeeds once the backing store has the blob. A failed snapshot
    /// refresh is logged and leaves the old snapshot in place until the next
    /// rebuild.
    pub async fn store(&self, blob: NewBlob) -> Result<BlobId> {
        let _guard = self.write_lock.lock().await;
        let blob_type = blob.blob_type;
        let name = blob.name.clone();

        let id = self.store.store(blob).await?;
        info!(blob_type = %blob_type, blob_id = id.0, name = %name, "Stored blob");

        if let Err(e) = self.rebuild_locked().await {
            warn!(blob_type = %blob_type, blob_id = id.0, error = %e, "Blob stored but cache refresh failed");
        }
        Ok(id)
    }

    /// Delete a blob by name and refresh the snapshot
    ///
    /// Like [`store`](Self::store), a failed refresh after a successful
    /// delete is only logged.
    pub async fn delete(&self, blob_type: BlobType, name: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        self.store.delete(blob_type, name).await?;
        info!(blob_type = %blob_type, name = %name, "Deleted blob");

        if let Err(e) = self.rebuild_locked().await {
            warn!(blob_type = %blob_type, name = %name, error = %e, "Blob deleted but cache refresh failed");
        }
        Ok(())
    }

    /// Look up a blob, reloading the snapshot once if it is not cached
    pub async fn get(&self, blob_type: BlobType, id: BlobId) -> Result<BlobEntry> {
        if let Some(entry) = self.snapshot()?.entries.get(&(blob_type, id)) {
            return Ok(entry.clone());
        }

        debug!(blob_type = %blob_type, blob_id = id.0, "Blob not cached, rebuilding");
        self.rebuild().await?;

        self.snapshot()?
            .entries
            .get(&(blob_type, id))
            .cloned()
            .ok_or_else(|| Error::BlobNotFound(format!("({}, {})", blob_type, id)))
    }

    pub async fn all_sorted_by_id(&self) -> Result<Vec<BlobEntry>> {
        self.store.all_sorted_by_id().await
    }

    pub async fn has_valid_of_type(&self, types: &[BlobType], now: DateTime<Utc>) -> Result<Vec<bool>> {
        self.store.has_valid_of_type(types, now).await
    }

    /// True if at least one blob of the type is valid now
    pub async fn is_type_initialized(&self, blob_type: BlobType) -> Result<bool> {
        let flags = self.has_valid_of_type(&[blob_type], Utc::now()).await?;
        Ok(flags.first().copied().unwrap_or(false))
    }

    /// Newest blob of the type that is valid at `now`
    ///
    /// Reads the snapshot only. Fails with `BlobNotValid` if blobs of the type
    /// exist but none is valid, `BlobNotFound` if there are none at all.
    pub fn current(&self, blob_type: BlobType, now: DateTime<Utc>) -> Result<BlobEntry> {
        let snapshot = self.snapshot()?;
        let mut any = false;

        for entry in snapshot.of_type(blob_type).rev() {
            any = true;
            if entry.is_valid_at(now) {
                return Ok(entry.clone());
            }
        }

        if any {
            Err(Error::BlobNotValid(blob_type.to_string()))
        } else {
            Err(Error::BlobNotFound(format!("of type {}", blob_type)))
        }
    }

    /// All cached blobs of one type, ascending by id
    pub fn entries_of_type(&self, blob_type: BlobType) -> Result<Vec<BlobEntry>> {
        Ok(self.snapshot()?.of_type(blob_type).cloned().collect())
    }

    /// Number of cached blobs
    pub fn len(&self) -> Result<usize> {
        Ok(self.snapshot()?.entries.len())
    }

    /// Reload the snapshot from the backing store
    pub async fn rebuild(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.rebuild_locked().await
    }

    async fn rebuild_locked(&self) -> Result<()> {
        let entries = self
            .store
            .all_sorted_by_id()
            .await?
            .into_iter()
            .map(|entry| ((entry.blob_type, entry.id), entry))
            .collect::<BTreeMap<_, _>>();
        let count = entries.len();

        let mut slot = self
            .snapshot
            .write()
            .map_err(|_| Error::Internal("Blob cache lock poisoned".into()))?;
        *slot = Arc::new(Snapshot { entries });
        debug!(blobs = count, "Rebuilt blob cache");
        Ok(())
    }

    fn snapshot(&self) -> Result<Arc<Snapshot>> {
        self.snapshot
            .read()
            .map(|guard| Arc::clone(&*guard))
            .map_err(|_| Error::Internal("Blob cache lock poisoned".into()))
    }
}

impl std::fmt::Debug for BlobCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobCache")
            .field("cached", &self.len().unwrap_or(0))
            .finish_non_exhaustive()
    }
}
