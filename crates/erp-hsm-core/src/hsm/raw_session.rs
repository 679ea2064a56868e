//! Raw HSM session
//!
//! Owns exactly one native handle between a successful connect and the
//! disconnect. The handle is disconnected when the session is dropped, so a
//! session that fails to log on is cleaned up without further action.

use super::client::{Credential, HsmClient, NativeHandle};
use super::identity::HsmIdentity;
use crate::error::{Error, Result};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// A connected, logged-on HSM handle
pub struct RawSession<C: HsmClient> {
    id: Uuid,
    client: Arc<C>,
    handle: Option<NativeHandle>,
    identity: HsmIdentity,
}

impl<C: HsmClient> RawSession<C> {
    /// Connect to `device` and log on as `identity`
    ///
    /// The keyspec is preferred over the password when both are configured.
    /// No retries: a network failure surfaces as `ConnectError`, a rejected
    /// logon as `AuthError`.
    pub fn open(client: Arc<C>, device: &str, identity: HsmIdentity) -> Result<Self> {
        let handle = client.connect(device)?;
        let session = Self {
            id: Uuid::new_v4(),
            client,
            handle: Some(handle),
            identity,
        };

        let credential = match &session.identity.keyspec {
            Some(keyspec) => Credential::Keyspec(keyspec.as_str()),
            None => Credential::Password(session.identity.password.as_str()),
        };

        if let Err(e) = session
            .client
            .logon(handle, &session.identity.username, credential)
        {
            warn!(
                session_id = %session.id,
                identity = %session.identity.display_name(),
                "HSM logon failed"
            );
            // Dropping the session disconnects the handle
            return Err(e.into());
        }

        debug!(
            session_id = %session.id,
            identity = %session.identity.display_name(),
            "HSM session opened"
        );
        Ok(session)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn identity(&self) -> &HsmIdentity {
        &self.identity
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    /// The native handle, while connected
    pub fn native_handle(&self) -> Option<NativeHandle> {
        self.handle
    }

    /// The native handle, or `SessionBroken` after disconnect
    pub fn handle(&self) -> Result<NativeHandle> {
        self.handle.ok_or(Error::SessionBroken { code: 0 })
    }

    pub fn is_connected(&self) -> bool {
        self.handle.is_some()
    }

    /// Close the handle; further calls are no-ops
    pub fn disconnect(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.client.disconnect(handle);
            debug!(session_id = %self.id, "HSM session closed");
        }
    }
}

impl<C: HsmClient> Drop for RawSession<C> {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl<C: HsmClient> fmt::Debug for RawSession<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawSession")
            .field("id", &self.id)
            .field("handle", &self.handle)
            .field("identity", &self.identity.display_name())
            .finish()
    }
}
