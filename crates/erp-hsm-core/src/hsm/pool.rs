//! Bounded HSM session pool
//!
//! Capacity is a semaphore with one permit per session slot. A lease owns its
//! permit, so at most `max_sessions` sessions are ever leased and waiters are
//! served in arrival order. The ready set and counters share a single mutex;
//! sessions are only used outside of it.
//!
//! Sessions are created lazily on a blocking thread. Broken sessions are
//! disconnected on release and replaced by the next `acquire`.

use super::client::HsmClient;
use super::factory::HsmFactory;
use super::lease::PoolLease;
use super::session::Session;
use crate::config::PoolConfig;
use crate::error::{Error, Result};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Pool sizing and timing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolOptions {
    pub max_sessions: usize,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
}

impl From<&PoolConfig> for PoolOptions {
    fn from(config: &PoolConfig) -> Self {
        Self {
            max_sessions: config.session_bound(),
            acquire_timeout: config.acquire_timeout(),
            idle_timeout: config.idle_timeout(),
        }
    }
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self::from(&PoolConfig::default())
    }
}

struct PoolState<C: HsmClient> {
    ready: VecDeque<Session<C>>,
    active: usize,
    // Taken out of `ready` for a keep-alive ping
    pinging: usize,
    max_used: usize,
    shut_down: bool,
}

impl<C: HsmClient> PoolState<C> {
    fn open_sessions(&self) -> usize {
        self.ready.len() + self.active + self.pinging
    }
}

/// State shared between the pool handle and its leases
pub(crate) struct PoolShared<C: HsmClient> {
    factory: HsmFactory<C>,
    state: Mutex<PoolState<C>>,
    permits: Arc<Semaphore>,
    options: PoolOptions,
}

impl<C: HsmClient> PoolShared<C> {
    // Nothing panics while the lock is held, so a poisoned lock still guards
    // consistent counters.
    fn state(&self) -> MutexGuard<'_, PoolState<C>> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Return a leased session to the pool
    pub(crate) fn release(&self, session: Session<C>, healthy: bool) {
        let discarded = {
            let mut state = self.state();
            state.active = state.active.saturating_sub(1);
            if healthy && !state.shut_down {
                state.ready.push_back(session);
                None
            } else {
                Some(session)
            }
        };

        match discarded {
            None => debug!("HSM session returned to pool"),
            Some(session) => {
                debug!(session_id = %session.id(), healthy = healthy, "HSM session discarded");
                // Dropping disconnects
                drop(session);
            }
        }
    }
}

/// Cloneable handle to a session pool
pub struct HsmPool<C: HsmClient> {
    shared: Arc<PoolShared<C>>,
}

impl<C: HsmClient> Clone for HsmPool<C> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<C: HsmClient> HsmPool<C> {
    pub fn new(factory: HsmFactory<C>, options: PoolOptions) -> Self {
        let options = PoolOptions {
            max_sessions: options.max_sessions.max(1),
            ..options
        };
        info!(
            max_sessions = options.max_sessions,
            acquire_timeout_ms = options.acquire_timeout.as_millis() as u64,
            "HSM pool created"
        );

        Self {
            shared: Arc::new(PoolShared {
                factory,
                state: Mutex::new(PoolState {
                    ready: VecDeque::new(),
                    active: 0,
                    pinging: 0,
                    max_used: 0,
                    shut_down: false,
                }),
                permits: Arc::new(Semaphore::new(options.max_sessions)),
                options,
            }),
        }
    }

    pub fn options(&self) -> PoolOptions {
        self.shared.options
    }

    pub fn factory(&self) -> &HsmFactory<C> {
        &self.shared.factory
    }

    /// Lease a session, waiting up to the acquire timeout for a free slot
    pub async fn acquire(&self) -> Result<PoolLease<C>> {
        let started = Instant::now();
        let timeout = self.shared.options.acquire_timeout;

        let permit = match tokio::time::timeout(timeout, self.shared.permits.clone().acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(Error::PoolShutdown),
            Err(_) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "HSM pool exhausted");
                return Err(Error::PoolExhausted(timeout.as_millis() as u64));
            }
        };

        let ready = {
            let mut state = self.shared.state();
            if state.shut_down {
                return Err(Error::PoolShutdown);
            }
            state.active += 1;
            state.ready.pop_front()
        };

        // Gives the slot back on a failed connect or when this future is dropped
        let claim = ActiveClaim {
            shared: &self.shared,
            armed: true,
        };
        let session = match ready {
            Some(session) => session,
            None => self.connect().await?,
        };
        claim.keep();

        debug!(
            session_id = %session.id(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "HSM session leased"
        );
        Ok(PoolLease::new(session, self.shared.clone(), permit))
    }

    /// Lease a session and run `f` on it on a blocking thread
    ///
    /// The lease is released unhealthy when `f` fails with a session-invalid
    /// error.
    pub async fn with_session<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Session<C>) -> Result<T> + Send + 'static,
    {
        let mut lease = self.acquire().await?;
        tokio::task::spawn_blocking(move || lease.run(f))
            .await
            .map_err(|e| Error::Internal(format!("HSM task failed: {}", e)))?
    }

    /// Open up to `count` sessions ahead of demand
    ///
    /// Never exceeds the session bound. Returns how many were opened.
    pub async fn prewarm(&self, count: usize) -> Result<usize> {
        let wanted = {
            let state = self.shared.state();
            if state.shut_down {
                return Err(Error::PoolShutdown);
            }
            let open = state.open_sessions();
            count.min(self.shared.options.max_sessions.saturating_sub(open))
        };

        let mut opened = 0;
        for _ in 0..wanted {
            let session = self.connect().await?;
            let mut state = self.shared.state();
            if state.shut_down || state.open_sessions() >= self.shared.options.max_sessions {
                break;
            }
            state.ready.push_back(session);
            opened += 1;
        }

        info!(opened = opened, "HSM pool prewarmed");
        Ok(opened)
    }

    /// Ping ready sessions unused for more than half the idle timeout
    ///
    /// Stale sessions are taken out of the pool and pinged without holding the
    /// pool lock; the pings block, so call it from a blocking thread. Sessions
    /// whose ping fails are discarded. Returns how many were discarded.
    pub fn keep_idle_sessions_alive(&self) -> usize {
        let Some(threshold) = Instant::now().checked_sub(self.shared.options.idle_timeout / 2) else {
            return 0;
        };

        let stale: VecDeque<Session<C>> = {
            let mut state = self.shared.state();
            let (stale, fresh): (VecDeque<_>, VecDeque<_>) = std::mem::take(&mut state.ready)
                .into_iter()
                .partition(|session| session.last_used() < threshold);
            state.ready = fresh;
            state.pinging += stale.len();
            stale
        };
        let pinged = stale.len();

        let mut alive = Vec::with_capacity(pinged);
        let mut discarded = 0;
        for mut session in stale {
            match session.keep_alive(threshold) {
                Ok(_) => alive.push(session),
                Err(e) => {
                    warn!(session_id = %session.id(), error = %e, "Keep-alive failed; discarding session");
                    discarded += 1;
                }
            }
        }

        let closed = {
            let mut state = self.shared.state();
            state.pinging = state.pinging.saturating_sub(pinged);
            if state.shut_down {
                alive
            } else {
                state.ready.extend(alive);
                Vec::new()
            }
        };
        drop(closed);

        discarded
    }

    /// Close the pool
    ///
    /// Waiting and later `acquire` calls fail with `PoolShutdown`. Idle
    /// sessions are disconnected now; leased ones when they come back.
    pub fn shutdown(&self) {
        let idle = {
            let mut state = self.shared.state();
            if state.shut_down {
                return;
            }
            state.shut_down = true;
            std::mem::take(&mut state.ready)
        };
        self.shared.permits.close();

        info!(idle_sessions = idle.len(), "HSM pool shut down");
        drop(idle);
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.state().shut_down
    }

    /// Sessions currently leased
    pub fn active_count(&self) -> usize {
        self.shared.state().active
    }

    /// Sessions connected and waiting in the pool
    pub fn idle_count(&self) -> usize {
        self.shared.state().ready.len()
    }

    /// Highest number of simultaneously leased sessions
    pub fn max_used_count(&self) -> usize {
        self.shared.state().max_used
    }

    pub fn reset_max_used_count(&self) {
        let mut state = self.shared.state();
        state.max_used = state.active;
    }

    async fn connect(&self) -> Result<Session<C>> {
        let shared = self.shared.clone();
        tokio::task::spawn_blocking(move || shared.factory.connect())
            .await
            .map_err(|e| Error::Internal(format!("HSM connect task failed: {}", e)))?
    }
}

/// Counts a session as leased while `acquire` is still connecting it
struct ActiveClaim<'a, C: HsmClient> {
    shared: &'a PoolShared<C>,
    armed: bool,
}

impl<C: HsmClient> ActiveClaim<'_, C> {
    /// The lease now owns the count
    fn keep(mut self) {
        self.armed = false;
        let mut state = self.shared.state();
        state.max_used = state.max_used.max(state.active);
    }
}

impl<C: HsmClient> Drop for ActiveClaim<'_, C> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.shared.state();
            state.active = state.active.saturating_sub(1);
        }
    }
}

impl<C: HsmClient> std::fmt::Debug for HsmPool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state();
        f.debug_struct("HsmPool")
            .field("max_sessions", &self.shared.options.max_sessions)
            .field("active", &state.active)
            .field("idle", &state.ready.len())
            .field("pinging", &state.pinging)
            .field("shut_down", &state.shut_down)
            .finish()
    }
}
