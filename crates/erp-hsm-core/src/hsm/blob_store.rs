//! Blob store repository trait
//!
//! Defines the persistence interface for blobs and an in-memory reference
//! implementation. Production deployments use
//! [`SqliteBlobStore`](super::sqlite_blob_store::SqliteBlobStore).

use super::blob::{BlobEntry, BlobId, BlobType, NewBlob};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

/// Repository for named, typed, versioned blobs
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store a new blob and return the id assigned to it
    ///
    /// Fails with `DuplicateName` if any blob, of any type, already uses the name.
    async fn store(&self, blob: NewBlob) -> Result<BlobId>;

    /// Retrieve a blob by type and id
    async fn get(&self, blob_type: BlobType, id: BlobId) -> Result<BlobEntry>;

    /// All blobs, ascending by id regardless of type
    async fn all_sorted_by_id(&self) -> Result<Vec<BlobEntry>>;

    /// Delete the blob with the given name
    ///
    /// Fails with `BlobNotFound` if no such name exists and with `TypeMismatch`
    /// if it exists under a different type.
    async fn delete(&self, blob_type: BlobType, name: &str) -> Result<()>;

    /// One flag per requested type: is at least one blob of that type valid at `now`
    async fn has_valid_of_type(&self, types: &[BlobType], now: DateTime<Utc>) -> Result<Vec<bool>>;
}

/// Sort blobs by id; blobs of different types with the same id keep type order
pub(crate) fn sort_by_id(entries: &mut [BlobEntry]) {
    entries.sort_by(|a, b| a.id.cmp(&b.id).then(a.blob_type.cmp(&b.blob_type)));
}

/// In-memory blob store
///
/// Keeps entries in a name-keyed map under a single lock. Intended for tests
/// and for the simulated HSM setup.
#[derive(Debug, Default)]
pub struct InMemoryBlobStore {
    entries: Mutex<HashMap<String, BlobEntry>>,
}

impl InMemoryBlobStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, BlobEntry>>> {
        self.entries
            .lock()
            .map_err(|_| Error::Internal("Blob store lock poisoned".into()))
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn store(&self, blob: NewBlob) -> Result<BlobId> {
        let mut entries = self.entries()?;

        if entries.contains_key(&blob.name) {
            return Err(Error::DuplicateName(blob.name));
        }

        let next = entries
            .values()
            .filter(|e| e.blob_type == blob.blob_type)
            .map(|e| e.id.0)
            .max()
            .unwrap_or(0)
            + 1;
        let id = BlobId(next);

        entries.insert(blob.name.clone(), blob.into_entry(id));
        Ok(id)
    }

    async fn get(&self, blob_type: BlobType, id: BlobId) -> Result<BlobEntry> {
        self.entries()?
            .values()
            .find(|e| e.blob_type == blob_type && e.id == id)
            .cloned()
            .ok_or_else(|| Error::BlobNotFound(format!("({}, {})", blob_type, id)))
    }

    async fn all_sorted_by_id(&self) -> Result<Vec<BlobEntry>> {
        let mut all: Vec<BlobEntry> = self.entries()?.values().cloned().collect();
        sort_by_id(&mut all);
        Ok(all)
    }

    async fn delete(&self, blob_type: BlobType, name: &str) -> Result<()> {
        let mut entries = self.entries()?;

        match entries.get(name) {
            None => Err(Error::BlobNotFound(format!("'{}'", name))),
            Some(existing) if existing.blob_type != blob_type => Err(Error::TypeMismatch {
                name: name.to_string(),
                expected: blob_type.to_string(),
                actual: existing.blob_type.to_string(),
            }),
            Some(_) => {
                entries.remove(name);
                Ok(())
            }
        }
    }

    async fn has_valid_of_type(&self, types: &[BlobType], now: DateTime<Utc>) -> Result<Vec<bool>> {
        let entries = self.entries()?;
        Ok(types
            .iter()
            .map(|t| {
                entries
                    .values()
                    .any(|e| e.blob_type == *t && e.is_valid_at(now))
            })
            .collect())
    }
}
