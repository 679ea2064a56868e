//! Pool lease
//!
//! RAII handle to a leased session. The session goes back to the pool exactly
//! once: through [`PoolLease::release`], [`PoolLease::discard`] or drop.
//! The capacity permit is returned after the session, so a waiter woken by
//! the permit finds the session in the ready set.

use super::client::HsmClient;
use super::pool::PoolShared;
use super::session::Session;
use crate::error::{Error, Result};
use std::sync::Arc;
use tokio::sync::OwnedSemaphorePermit;
use tracing::error;

pub struct PoolLease<C: HsmClient> {
    session: Option<Session<C>>,
    pool: Arc<PoolShared<C>>,
    permit: Option<OwnedSemaphorePermit>,
}

impl<C: HsmClient> PoolLease<C> {
    pub(crate) fn new(session: Session<C>, pool: Arc<PoolShared<C>>, permit: OwnedSemaphorePermit) -> Self {
        Self {
            session: Some(session),
            pool,
            permit: Some(permit),
        }
    }

    /// The leased session
    pub fn session(&mut self) -> Result<&mut Session<C>> {
        match self.session.as_mut() {
            Some(session) => Ok(session),
            None => Err(use_after_release("session")),
        }
    }

    pub fn is_released(&self) -> bool {
        self.session.is_none()
    }

    /// Return the session to the pool for reuse
    pub fn release(&mut self) -> Result<()> {
        self.give_back(true, "release")
    }

    /// Return the session as unusable; it is disconnected
    pub fn discard(&mut self) -> Result<()> {
        self.give_back(false, "discard")
    }

    /// Run `f` on the session, then release the lease
    ///
    /// The session is discarded when `f` fails with a session-invalid error
    /// and released healthy otherwise.
    pub fn run<T>(&mut self, f: impl FnOnce(&mut Session<C>) -> Result<T>) -> Result<T> {
        let result = f(self.session()?);
        let healthy = !matches!(&result, Err(e) if e.is_session_invalid());
        self.give_back(healthy, "run")?;
        result
    }

    fn give_back(&mut self, healthy: bool, operation: &'static str) -> Result<()> {
        let session = self.session.take().ok_or_else(|| use_after_release(operation))?;
        self.pool.release(session, healthy);
        drop(self.permit.take());
        Ok(())
    }
}

fn use_after_release(operation: &'static str) -> Error {
    error!(operation = operation, "Pool lease used after release");
    Error::UseAfterRelease
}

impl<C: HsmClient> Drop for PoolLease<C> {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.pool.release(session, true);
        }
        drop(self.permit.take());
    }
}

impl<C: HsmClient> std::fmt::Debug for PoolLease<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolLease")
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}
