//! HSM session with domain operations
//!
//! A [`Session`] pairs a [`RawSession`] with the shared blob cache. Every
//! operation looks up the currently valid key material in the cache and runs
//! one vendor call. Operations never reconnect or retry; session-level
//! failures are reported through [`Error::is_session_invalid`] so the holder
//! can discard the session.

use super::blob::{BlobEntry, BlobId, BlobType};
use super::blob_cache::BlobCache;
use super::client::{HsmClient, NativeHandle, VendorResult};
use super::identity::HsmIdentity;
use super::raw_session::RawSession;
use crate::error::{Error, Result};
use crate::secret::SecretBytes;
use chrono::Utc;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// Which derivation key a derived key belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DerivationKind {
    Task,
    Communication,
    AuditLog,
    ChargeItem,
}

impl DerivationKind {
    pub fn blob_type(&self) -> BlobType {
        match self {
            Self::Task => BlobType::TaskKeyDerivation,
            Self::Communication => BlobType::CommunicationKeyDerivation,
            Self::AuditLog => BlobType::AuditLogKeyDerivation,
            Self::ChargeItem => BlobType::ChargeItemKeyDerivation,
        }
    }
}

/// A derived key and the derivation blob it came from
///
/// Callers persist `blob_id` next to their data so the same key can be
/// derived again after the derivation blob has been rolled over.
#[derive(Debug)]
pub struct DerivedKey {
    pub key: SecretBytes,
    pub blob_id: BlobId,
    pub generation: u32,
}

/// Logged-on HSM session
pub struct Session<C: HsmClient> {
    raw: RawSession<C>,
    cache: Arc<BlobCache>,
    last_used: Instant,
}

impl<C: HsmClient> Session<C> {
    pub fn new(raw: RawSession<C>, cache: Arc<BlobCache>) -> Self {
        Self {
            raw,
            cache,
            last_used: Instant::now(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.raw.id()
    }

    pub fn identity(&self) -> &HsmIdentity {
        self.raw.identity()
    }

    pub fn native_handle(&self) -> Option<NativeHandle> {
        self.raw.native_handle()
    }

    pub fn cache(&self) -> &Arc<BlobCache> {
        &self.cache
    }

    /// When the session last talked to the HSM
    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    /// Request a new TEE token
    pub fn create_tee_token(&mut self) -> Result<Vec<u8>> {
        self.call("tee_token", |client, handle| client.tee_token(handle))
    }

    /// Derive a key with the newest valid derivation blob of `kind`
    pub fn derive_key(&mut self, kind: DerivationKind, input: &[u8]) -> Result<DerivedKey> {
        let blob = self.current(kind.blob_type())?;
        self.derive_key_with(&blob, input)
    }

    /// Derive a key with a specific derivation blob, e.g. one recorded earlier
    pub fn derive_key_with(&mut self, blob: &BlobEntry, input: &[u8]) -> Result<DerivedKey> {
        let token = self.current(BlobType::TeeToken)?;
        let key = self.call("derive_key", |client, handle| {
            client.derive_key(handle, &token.data, &blob.data, input)
        })?;

        Ok(DerivedKey {
            key: SecretBytes::new(key),
            blob_id: blob.id,
            generation: blob.generation,
        })
    }

    /// Sign with the service signing key
    pub fn sign_vau(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let token = self.current(BlobType::TeeToken)?;
        let key = self.current(BlobType::VauSig)?;
        self.call("sign", |client, handle| {
            client.sign(handle, &token.data, &key.data, data)
        })
    }

    pub fn random_bytes(&mut self, count: usize) -> Result<Vec<u8>> {
        self.call("random_bytes", |client, handle| client.random_bytes(handle, count))
    }

    /// Generate a new pseudonym key; the returned bytes are wrapped
    pub fn generate_pseudonym_key(&mut self) -> Result<Vec<u8>> {
        let token = self.current(BlobType::TeeToken)?;
        self.call("generate_wrapped_key", |client, handle| {
            client.generate_wrapped_key(handle, &token.data)
        })
    }

    /// Unwrap a stored pseudonym key
    pub fn unwrap_pseudonym_key(&mut self, blob: &BlobEntry) -> Result<SecretBytes> {
        if blob.blob_type != BlobType::PseudonymKey {
            return Err(Error::TypeMismatch {
                name: blob.name.clone(),
                expected: BlobType::PseudonymKey.to_string(),
                actual: blob.blob_type.to_string(),
            });
        }
        let token = self.current(BlobType::TeeToken)?;
        let key = self.call("unwrap_key", |client, handle| {
            client.unwrap_key(handle, &token.data, &blob.data)
        })?;
        Ok(SecretBytes::new(key))
    }

    /// Ping the HSM if the session has been idle since before `threshold`
    ///
    /// Returns whether a ping was sent.
    pub fn keep_alive(&mut self, threshold: Instant) -> Result<bool> {
        if self.last_used >= threshold {
            return Ok(false);
        }
        self.call("keep_alive", |client, handle| client.keep_alive(handle))?;
        Ok(true)
    }

    fn current(&self, blob_type: BlobType) -> Result<BlobEntry> {
        self.cache.current(blob_type, Utc::now())
    }

    fn call<T>(
        &mut self,
        operation: &'static str,
        f: impl FnOnce(&C, NativeHandle) -> VendorResult<T>,
    ) -> Result<T> {
        let handle = self.raw.handle()?;
        let result = f(self.raw.client(), handle);
        self.last_used = Instant::now();

        match result {
            Ok(value) => {
                debug!(session_id = %self.raw.id(), operation = operation, "HSM call succeeded");
                Ok(value)
            }
            Err(e) => {
                warn!(session_id = %self.raw.id(), operation = operation, error = %e, "HSM call failed");
                Err(e.into())
            }
        }
    }
}

impl<C: HsmClient> fmt::Debug for Session<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("raw", &self.raw)
            .field("last_used", &self.last_used)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hsm::blob::{NewBlob, Validity};
    use crate::hsm::blob_store::InMemoryBlobStore;
    use crate::hsm::identity::IdentityKind;
    use crate::hsm::simulated::SimulatedHsmClient;
    use crate::secret::SecureString;
    use chrono::Duration;

    fn identity() -> HsmIdentity {
        HsmIdentity {
            kind: IdentityKind::Work,
            username: "ERP_WORK".to_string(),
            password: SecureString::new("password"),
            keyspec: None,
        }
    }

    async fn session_with_token(client: &Arc<SimulatedHsmClient>) -> Session<SimulatedHsmClient> {
        let cache = Arc::new(BlobCache::new(Arc::new(InMemoryBlobStore::new())));
        let raw = RawSession::open(client.clone(), "simulated", identity()).unwrap();
        let mut session = Session::new(raw, cache.clone());

        let token = session.create_tee_token().unwrap();
        let validity = Validity::starting_at(Utc::now(), Duration::minutes(30)).unwrap();
        cache
            .store(NewBlob::new(BlobType::TeeToken, "tee-token-1", token, validity))
            .await
            .unwrap();
        session
    }

    async fn provision(client: &SimulatedHsmClient, cache: &BlobCache, blob_type: BlobType, name: &str) -> BlobId {
        let validity = Validity::starting_at(Utc::now() - Duration::minutes(1), Duration::days(1)).unwrap();
        cache
            .store(NewBlob::new(blob_type, name, client.provision(blob_type).unwrap(), validity))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_derive_key_reports_blob_id() {
        let client = Arc::new(SimulatedHsmClient::new());
        let mut session = session_with_token(&client).await;
        let cache = session.cache().clone();

        provision(&client, &cache, BlobType::TaskKeyDerivation, "task-1").await;
        let second = provision(&client, &cache, BlobType::TaskKeyDerivation, "task-2").await;

        let derived = session.derive_key(DerivationKind::Task, b"resource").unwrap();
        assert_eq!(derived.blob_id, second);
        assert_eq!(derived.key.len(), 32);

        let older = cache.get(BlobType::TaskKeyDerivation, BlobId(1)).await.unwrap();
        let again = session.derive_key_with(&older, b"resource").unwrap();
        assert_ne!(again.key, derived.key);
    }

    #[tokio::test]
    async fn test_missing_key_material() {
        let client = Arc::new(SimulatedHsmClient::new());
        let mut session = session_with_token(&client).await;

        let result = session.sign_vau(b"data");
        assert!(matches!(result, Err(Error::BlobNotFound(_))));
    }

    #[tokio::test]
    async fn test_sign_vau() {
        let client = Arc::new(SimulatedHsmClient::new());
        let mut session = session_with_token(&client).await;
        let cache = session.cache().clone();
        provision(&client, &cache, BlobType::VauSig, "vau-sig").await;

        let signature = session.sign_vau(b"data").unwrap();
        assert_eq!(signature.len(), 64);
    }

    #[tokio::test]
    async fn test_pseudonym_key_round_trip() {
        let client = Arc::new(SimulatedHsmClient::new());
        let mut session = session_with_token(&client).await;
        let cache = session.cache().clone();

        let wrapped = session.generate_pseudonym_key().unwrap();
        let validity = Validity::starting_at(Utc::now(), Duration::days(1)).unwrap();
        let id = cache
            .store(NewBlob::new(BlobType::PseudonymKey, "pseudonym-1", wrapped, validity))
            .await
            .unwrap();
        let blob = cache.get(BlobType::PseudonymKey, id).await.unwrap();

        let key = session.unwrap_pseudonym_key(&blob).unwrap();
        assert_eq!(key.len(), 32);

        let token = cache.current(BlobType::TeeToken, Utc::now()).unwrap();
        assert!(matches!(
            session.unwrap_pseudonym_key(&token),
            Err(Error::TypeMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_expired_session_is_session_invalid() {
        let client = Arc::new(SimulatedHsmClient::new());
        let mut session = session_with_token(&client).await;

        client.expire_all_handles();
        let err = session.random_bytes(8).unwrap_err();
        assert!(err.is_session_invalid());
    }

    #[tokio::test]
    async fn test_keep_alive_respects_threshold() {
        let client = Arc::new(SimulatedHsmClient::new());
        let mut session = session_with_token(&client).await;

        let before = Instant::now() - std::time::Duration::from_secs(60);
        assert!(!session.keep_alive(before).unwrap());

        let after = Instant::now() + std::time::Duration::from_secs(1);
        assert!(session.keep_alive(after).unwrap());
    }
}
