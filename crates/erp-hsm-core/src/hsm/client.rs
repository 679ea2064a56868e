//! Vendor client seam
//!
//! The HSM is reached through a synchronous, PKCS#11-like client. Every call
//! blocks the calling thread, so async code runs them on blocking threads.
//! Production deployments implement [`HsmClient`] over the vendor library;
//! [`SimulatedHsmClient`](super::simulated::SimulatedHsmClient) is the
//! software device used for development and tests.

use thiserror::Error;

/// Opaque connection handle issued by the vendor library
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeHandle(pub u64);

impl std::fmt::Display for NativeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Failure reported by the vendor library
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VendorError {
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    #[error("logon rejected for {username}")]
    LogonRejected { username: String },

    #[error("session expired (code {code:#010x})")]
    SessionExpired { code: u32 },

    #[error("session broken (code {code:#010x})")]
    SessionBroken { code: u32 },

    #[error("{operation} failed (code {code:#010x})")]
    Operation { operation: &'static str, code: u32 },
}

pub type VendorResult<T> = std::result::Result<T, VendorError>;

/// Secret presented at logon
#[derive(Clone, Copy)]
pub enum Credential<'a> {
    Password(&'a str),
    Keyspec(&'a str),
}

impl std::fmt::Debug for Credential<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Password(_) => f.write_str("Password([REDACTED])"),
            Self::Keyspec(_) => f.write_str("Keyspec([REDACTED])"),
        }
    }
}

/// Synchronous HSM client
///
/// Handles are not thread-affine but a single handle must not be used from two
/// threads at once; the session pool guarantees this.
pub trait HsmClient: Send + Sync + 'static {
    /// Open a network connection to the device
    fn connect(&self, device: &str) -> VendorResult<NativeHandle>;

    /// Authenticate an open connection
    fn logon(&self, handle: NativeHandle, username: &str, credential: Credential<'_>) -> VendorResult<()>;

    /// Close a connection; closing an unknown handle is a no-op
    fn disconnect(&self, handle: NativeHandle);

    /// Cheap round trip that keeps the connection from idling out
    fn keep_alive(&self, handle: NativeHandle) -> VendorResult<()>;

    /// Issue a fresh TEE token
    fn tee_token(&self, handle: NativeHandle) -> VendorResult<Vec<u8>>;

    /// Derive a key from a wrapped derivation secret and caller input
    fn derive_key(
        &self,
        handle: NativeHandle,
        tee_token: &[u8],
        derivation_blob: &[u8],
        input: &[u8],
    ) -> VendorResult<Vec<u8>>;

    /// Sign `data` with a wrapped signing key
    fn sign(&self, handle: NativeHandle, tee_token: &[u8], key_blob: &[u8], data: &[u8]) -> VendorResult<Vec<u8>>;

    fn random_bytes(&self, handle: NativeHandle, count: usize) -> VendorResult<Vec<u8>>;

    /// Generate a symmetric key inside the HSM and return it wrapped
    fn generate_wrapped_key(&self, handle: NativeHandle, tee_token: &[u8]) -> VendorResult<Vec<u8>>;

    /// Unwrap a key created by [`generate_wrapped_key`](Self::generate_wrapped_key)
    fn unwrap_key(&self, handle: NativeHandle, tee_token: &[u8], wrapped: &[u8]) -> VendorResult<Vec<u8>>;
}
