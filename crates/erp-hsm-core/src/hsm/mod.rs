//! HSM access
//!
//! # Architecture
//!
//! - **Blobs**: `BlobStore` persistence with in-memory and SQLite backends,
//!   fronted by the snapshot `BlobCache`
//! - **Identities**: `IdentityResolver` maps configuration to logon identities
//! - **Sessions**: `HsmClient` vendor seam, `RawSession` handle ownership and
//!   the `Session` domain operations
//! - **Pool**: `HsmFactory`, `HsmPool` and the RAII `PoolLease`
//!
//! # Example
//!
//! ```ignore
//! use erp_hsm_core::hsm::{DerivationKind, HsmPool};
//!
//! let key = pool
//!     .with_session(|session| session.derive_key(DerivationKind::Task, b"task-id"))
//!     .await?;
//! ```

pub mod blob;
pub mod blob_cache;
pub mod blob_store;
pub mod client;
pub mod factory;
pub mod identity;
pub mod lease;
pub mod pool;
pub mod raw_session;
pub mod session;
pub mod simulated;
pub mod sqlite_blob_store;

// Re-export main types
pub use blob::{BlobEntry, BlobId, BlobType, NewBlob, Validity};
pub use blob_cache::BlobCache;
pub use blob_store::{BlobStore, InMemoryBlobStore};
pub use client::{Credential, HsmClient, NativeHandle, VendorError, VendorResult};
pub use factory::HsmFactory;
pub use identity::{HsmIdentity, IdentityKind, IdentityResolver};
pub use lease::PoolLease;
pub use pool::{HsmPool, PoolOptions};
pub use raw_session::RawSession;
pub use session::{DerivationKind, DerivedKey, Session};
pub use simulated::SimulatedHsmClient;
pub use sqlite_blob_store::SqliteBlobStore;
