//! Session factory
//!
//! Creates logged-on sessions for the pool. Identities are resolved once at
//! construction; connecting is a blocking vendor call.

use super::blob_cache::BlobCache;
use super::client::HsmClient;
use super::identity::{HsmIdentity, IdentityKind, IdentityResolver};
use super::raw_session::RawSession;
use super::session::Session;
use crate::config::ConfigLookup;
use crate::error::Result;
use std::sync::Arc;
use tracing::info;

pub struct HsmFactory<C: HsmClient> {
    client: Arc<C>,
    device: String,
    cache: Arc<BlobCache>,
    work: HsmIdentity,
    setup: HsmIdentity,
}

impl<C: HsmClient> HsmFactory<C> {
    pub fn new<L: ConfigLookup>(
        client: Arc<C>,
        device: impl Into<String>,
        cache: Arc<BlobCache>,
        resolver: &IdentityResolver<L>,
    ) -> Self {
        let work = resolver.work();
        let setup = resolver.setup();
        let device = device.into();
        info!(device = %device, identity = %work.display_name(), "HSM factory created");

        Self {
            client,
            device,
            cache,
            work,
            setup,
        }
    }

    pub fn client(&self) -> &Arc<C> {
        &self.client
    }

    pub fn cache(&self) -> &Arc<BlobCache> {
        &self.cache
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn identity(&self, kind: IdentityKind) -> &HsmIdentity {
        match kind {
            IdentityKind::Work => &self.work,
            IdentityKind::Setup => &self.setup,
        }
    }

    /// Connect and log on with the work identity
    pub fn raw_connect(&self) -> Result<RawSession<C>> {
        self.raw_connect_as(IdentityKind::Work)
    }

    pub fn raw_connect_as(&self, kind: IdentityKind) -> Result<RawSession<C>> {
        RawSession::open(self.client.clone(), &self.device, self.identity(kind).clone())
    }

    /// Connect with the work identity and attach the blob cache
    pub fn connect(&self) -> Result<Session<C>> {
        self.connect_as(IdentityKind::Work)
    }

    /// Connect with an explicit identity, e.g. the setup user for enrolment
    pub fn connect_as(&self, kind: IdentityKind) -> Result<Session<C>> {
        let raw = self.raw_connect_as(kind)?;
        Ok(Session::new(raw, self.cache.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigKey;
    use crate::error::Error;
    use crate::hsm::blob_store::InMemoryBlobStore;
    use crate::hsm::simulated::SimulatedHsmClient;
    use std::collections::HashMap;

    fn factory(client: Arc<SimulatedHsmClient>) -> HsmFactory<SimulatedHsmClient> {
        let lookup: HashMap<ConfigKey, String> =
            [(ConfigKey::HsmSetupUsername, "enrolment".to_string())].into();
        let cache = Arc::new(BlobCache::new(Arc::new(InMemoryBlobStore::new())));
        HsmFactory::new(client, "simulated", cache, &IdentityResolver::new(lookup))
    }

    #[test]
    fn test_connect_uses_work_identity() {
        let client = Arc::new(SimulatedHsmClient::new());
        let factory = factory(client.clone());

        let session = factory.connect().unwrap();
        assert_eq!(session.identity().username, "ERP_WORK");
        assert_eq!(client.open_handle_count(), 1);
    }

    #[test]
    fn test_connect_as_setup() {
        let client = Arc::new(SimulatedHsmClient::new());
        let factory = factory(client);

        let session = factory.connect_as(IdentityKind::Setup).unwrap();
        assert_eq!(session.identity().display_name(), "Setup enrolment");
    }

    #[test]
    fn test_connect_errors_are_not_retried() {
        let client = Arc::new(SimulatedHsmClient::new());
        let factory = factory(client.clone());

        client.set_fail_connect(true);
        assert!(matches!(factory.connect(), Err(Error::ConnectError(_))));
        assert_eq!(client.connect_count(), 0);

        client.set_fail_connect(false);
        client.set_reject_logon(true);
        assert!(matches!(factory.raw_connect(), Err(Error::AuthError(_))));
        assert_eq!(client.connect_count(), 1);
        assert_eq!(client.disconnect_count(), 1);
    }
}
