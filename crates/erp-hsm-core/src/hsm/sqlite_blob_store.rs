//! SQLite-backed blob store
//!
//! Persists blobs with parameterized queries. Name uniqueness is enforced by the
//! schema; per-type id assignment happens inside the insert statement so that
//! concurrent writers never hand out the same id twice. Validity bounds are
//! stored as microseconds since the epoch so range queries compare numerically.

use super::blob::{BlobEntry, BlobId, BlobType, NewBlob, Validity};
use super::blob_store::{BlobStore, sort_by_id};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use tracing::debug;

/// SQL to create the blobs table
pub const CREATE_BLOBS_TABLE_SQL: &str = r#"
    CREATE TABLE IF NOT EXISTS blobs (
        blob_type TEXT NOT NULL,
        id INTEGER NOT NULL,
        name TEXT NOT NULL UNIQUE,
        data BLOB NOT NULL,
        generation INTEGER NOT NULL DEFAULT 0,
        not_before INTEGER NOT NULL,
        not_after INTEGER NOT NULL,
        PRIMARY KEY (blob_type, id)
    );

    CREATE INDEX IF NOT EXISTS idx_blobs_validity ON blobs(blob_type, not_after);
"#;

/// SQLite-backed implementation of [`BlobStore`]
#[derive(Debug, Clone)]
pub struct SqliteBlobStore {
    pool: SqlitePool,
}

impl SqliteBlobStore {
    /// Wrap an existing pool; call [`initialize`](Self::initialize) before use
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) a database file and initialize the schema
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    Error::Config(format!(
                        "Failed to create blob store directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .journal_mode(SqliteJournalMode::Wal)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let store = Self::new(pool);
        store.initialize().await?;
        debug!(path = %path.display(), "Opened SQLite blob store");
        Ok(store)
    }

    /// In-memory database on a single connection
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        let store = Self::new(pool);
        store.initialize().await?;
        Ok(store)
    }

    /// Create the blobs table if it doesn't exist
    pub async fn initialize(&self) -> Result<()> {
        sqlx::raw_sql(CREATE_BLOBS_TABLE_SQL)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    fn row_to_entry(row: sqlx::sqlite::SqliteRow) -> Result<BlobEntry> {
        let blob_type: String = row.get("blob_type");
        let id: i64 = row.get("id");
        let generation: i64 = row.get("generation");
        let not_before = from_micros(row.get("not_before"))?;
        let not_after = from_micros(row.get("not_after"))?;

        Ok(BlobEntry {
            blob_type: blob_type.parse()?,
            id: BlobId(u32::try_from(id).map_err(|_| {
                Error::Internal(format!("Stored blob id {} out of range", id))
            })?),
            name: row.get("name"),
            data: row.get("data"),
            generation: u32::try_from(generation).map_err(|_| {
                Error::Internal(format!("Stored blob generation {} out of range", generation))
            })?,
            validity: Validity::new(not_before, not_after)?,
        })
    }
}

fn from_micros(micros: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| Error::Internal(format!("Stored timestamp {} out of range", micros)))
}

#[async_trait]
impl BlobStore for SqliteBlobStore {
    async fn store(&self, blob: NewBlob) -> Result<BlobId> {
        let mut tx = self.pool.begin().await?;

        let taken = sqlx::query("SELECT 1 FROM blobs WHERE name = ?")
            .bind(&blob.name)
            .fetch_optional(&mut *tx)
            .await?;
        if taken.is_some() {
            return Err(Error::DuplicateName(blob.name));
        }

        let row = sqlx::query(
            r#"
            INSERT INTO blobs (blob_type, id, name, data, generation, not_before, not_after)
            SELECT ?, COALESCE(MAX(id), 0) + 1, ?, ?, ?, ?, ?
            FROM blobs WHERE blob_type = ?
            RETURNING id
            "#,
        )
        .bind(blob.blob_type.as_str())
        .bind(&blob.name)
        .bind(&blob.data)
        .bind(i64::from(blob.generation))
        .bind(blob.validity.not_before().timestamp_micros())
        .bind(blob.validity.not_after().timestamp_micros())
        .bind(blob.blob_type.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                Error::DuplicateName(blob.name.clone())
            }
            other => Error::Database(other),
        })?;

        tx.commit().await?;

        let id: i64 = row.get("id");
        let id = u32::try_from(id)
            .map_err(|_| Error::Internal(format!("Assigned blob id {} out of range", id)))?;
        Ok(BlobId(id))
    }

    async fn get(&self, blob_type: BlobType, id: BlobId) -> Result<BlobEntry> {
        let row = sqlx::query("SELECT * FROM blobs WHERE blob_type = ? AND id = ?")
            .bind(blob_type.as_str())
            .bind(i64::from(id.0))
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(r) => Self::row_to_entry(r),
            None => Err(Error::BlobNotFound(format!("({}, {})", blob_type, id))),
        }
    }

    async fn all_sorted_by_id(&self) -> Result<Vec<BlobEntry>> {
        let rows = sqlx::query("SELECT * FROM blobs ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        // Type order is an enum order, not the string order of the column
        let mut entries = rows
            .into_iter()
            .map(Self::row_to_entry)
            .collect::<Result<Vec<_>>>()?;
        sort_by_id(&mut entries);
        Ok(entries)
    }

    async fn delete(&self, blob_type: BlobType, name: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT blob_type FROM blobs WHERE name = ?")
            .bind(name)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(row) = row else {
            return Err(Error::BlobNotFound(format!("'{}'", name)));
        };

        let stored: String = row.get("blob_type");
        if stored != blob_type.as_str() {
            return Err(Error::TypeMismatch {
                name: name.to_string(),
                expected: blob_type.to_string(),
                actual: stored,
            });
        }

        sqlx::query("DELETE FROM blobs WHERE name = ?")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn has_valid_of_type(&self, types: &[BlobType], now: DateTime<Utc>) -> Result<Vec<bool>> {
        let mut flags = Vec::with_capacity(types.len());
        for blob_type in types {
            let row = sqlx::query(
                "SELECT 1 FROM blobs WHERE blob_type = ? AND not_before <= ? AND not_after > ? LIMIT 1",
            )
            .bind(blob_type.as_str())
            .bind(now.timestamp_micros())
            .bind(now.timestamp_micros())
            .fetch_optional(&self.pool)
            .await?;
            flags.push(row.is_some());
        }
        Ok(flags)
    }
}
