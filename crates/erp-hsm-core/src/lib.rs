//! erp-hsm core library
//!
//! This crate provides pooled access to the HSM of a prescription backend:
//! - Blob store and snapshot blob cache for wrapped key material
//! - HSM identities resolved from configuration
//! - Bounded session pool with RAII leases
//! - Periodic refresh jobs (TEE token, trust store, pseudonym key, keep-alive)
//! - Service context wiring it all together

pub mod config;
pub mod context;
pub mod error;
pub mod hsm;
pub mod jobs;
pub mod secret;

pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::context::HsmServiceContext;
    pub use crate::error::{Error, Result};
    pub use crate::hsm::{BlobCache, BlobType, HsmClient, HsmPool, PoolLease, Session};
}
