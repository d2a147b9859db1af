//! Bounded reuse of another factory's connections.
//!
//! [`CachingConnectionFactory`] holds at most `pool_size` connections of its target, idle or
//! checked out. A checkout prefers an idle open connection and only asks the target for a new one
//! when none is available. Releasing a connection returns it to the idle set, unless it has closed
//! in the meantime, in which case its capacity is freed for a fresh connection.
//!
//! The checkout discipline follows the target's single-use setting:
//! - **Exclusive** (single-use target): a connection belongs to one caller until released. Once
//!   capacity is used up callers wait, or fail, per [`PoolExhaustion`].
//! - **Multiplex** (shared target): once capacity is used up, an already checked-out connection is
//!   leased again instead of waiting, so several callers may have requests in flight on it.

use std::{
    collections::{HashMap, VecDeque},
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use bytes::Bytes;
use futures::{future::BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, trace};

use crate::{
    connection::{Connection, ConnectionId, ConnectionListener, SharedConnection},
    error::{ConnectionError, SendError},
};

use super::{ConnectionFactory, Lifecycle, SharedFactory};

/// What a checkout does once the pool's capacity is used up.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolExhaustion {
    /// Wait for a connection to be released, up to `timeout` (forever if `None`).
    Wait {
        /// Upper bound on the wait.
        timeout: Option<Duration>,
    },
    /// Fail immediately with [`ConnectionError::PoolExhausted`].
    Fail,
}

impl Default for PoolExhaustion {
    fn default() -> Self {
        PoolExhaustion::Wait {
            timeout: Some(Duration::from_secs(2)),
        }
    }
}

/// A factory pooling up to `pool_size` connections of a target factory.
pub struct CachingConnectionFactory {
    target: SharedFactory,
    pool: Arc<Pool>,
    exhaustion: PoolExhaustion,
}

enum Checkout {
    Permit(OwnedSemaphorePermit),
    Leased(PooledConnection),
}

impl CachingConnectionFactory {
    /// Creates a stopped caching factory over `target`.
    ///
    /// # Panics
    ///
    /// Panics if `pool_size` is 0.
    pub fn new(target: impl ConnectionFactory, pool_size: usize) -> Self {
        assert_ne!(pool_size, 0, "pool size must be greater than 0");
        let multiplex = !target.is_single_use();
        CachingConnectionFactory {
            target: Arc::new(target),
            exhaustion: PoolExhaustion::default(),
            pool: Arc::new(Pool {
                pool_size,
                multiplex,
                permits: Arc::new(Semaphore::new(pool_size)),
                state: Mutex::new(PoolState::default()),
                lifecycle: Lifecycle::default(),
            }),
        }
    }

    /// Sets the exhaustion policy.
    pub fn exhaustion(mut self, exhaustion: PoolExhaustion) -> Self {
        self.exhaustion = exhaustion;
        self
    }

    /// The pool's capacity.
    pub fn pool_size(&self) -> usize {
        self.pool.pool_size
    }

    /// Number of idle connections.
    pub fn idle_count(&self) -> usize {
        self.pool.lock().idle.len()
    }

    /// Number of distinct connections currently checked out.
    pub fn active_count(&self) -> usize {
        self.pool.lock().active.len()
    }

    /// Whether checked-out connections may be leased to more than one caller.
    pub fn is_multiplex(&self) -> bool {
        self.pool.multiplex
    }

    async fn checkout(&self) -> Result<Checkout, ConnectionError> {
        if let Ok(permit) = self.pool.permits.clone().try_acquire_owned() {
            return Ok(Checkout::Permit(permit));
        }
        if self.pool.multiplex {
            if let Some(conn) = Pool::lease_active(&self.pool) {
                return Ok(Checkout::Leased(conn));
            }
        }

        let exhausted = ConnectionError::PoolExhausted {
            pool_size: self.pool.pool_size,
        };
        let acquire = self.pool.permits.clone().acquire_owned();
        let permit = match self.exhaustion {
            PoolExhaustion::Fail => return Err(exhausted),
            PoolExhaustion::Wait { timeout: None } => acquire.await,
            PoolExhaustion::Wait {
                timeout: Some(timeout),
            } => tokio::time::timeout(timeout, acquire)
                .await
                .map_err(|_| exhausted.clone())?,
        };
        permit.map(Checkout::Permit).map_err(|_| exhausted)
    }
}

impl ConnectionFactory for CachingConnectionFactory {
    fn get_connection(&self) -> BoxFuture<'_, Result<SharedConnection, ConnectionError>> {
        async move {
            self.pool.lifecycle.ensure_running()?;
            let permit = match self.checkout().await? {
                Checkout::Permit(permit) => permit,
                Checkout::Leased(leased) => return Ok(Arc::new(leased) as SharedConnection),
            };

            if let Some(idle) = self.pool.take_idle() {
                trace!(connection = %idle.id(), "reusing idle connection");
                return Ok(Arc::new(Pool::activate(&self.pool, idle, permit)) as SharedConnection);
            }

            let conn = self.target.get_connection().await?;
            debug!(connection = %conn.id(), pool_size = self.pool.pool_size, "pooling new connection");
            Ok(Arc::new(Pool::activate(&self.pool, conn, permit)) as SharedConnection)
        }
        .boxed()
    }

    /// Pooled connections are released, never closed, by the gateway.
    fn is_single_use(&self) -> bool {
        false
    }

    fn start(&self) {
        self.target.start();
        self.pool.lifecycle.start();
    }

    fn stop(&self) {
        if self.pool.lifecycle.stop() {
            let idle: Vec<_> = self.pool.lock().idle.drain(..).collect();
            debug!(closed = idle.len(), "caching connection factory stopped");
            for conn in idle {
                conn.close();
            }
        }
        self.target.stop();
    }

    fn is_running(&self) -> bool {
        self.pool.lifecycle.is_running()
    }
}

impl fmt::Debug for CachingConnectionFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachingConnectionFactory")
            .field("target", &self.target)
            .field("pool_size", &self.pool.pool_size)
            .field("multiplex", &self.pool.multiplex)
            .field("exhaustion", &self.exhaustion)
            .finish()
    }
}

struct Pool {
    pool_size: usize,
    multiplex: bool,
    /// One permit per checkout holding capacity; idle connections hold none.
    permits: Arc<Semaphore>,
    state: Mutex<PoolState>,
    lifecycle: Lifecycle,
}

#[derive(Default)]
struct PoolState {
    idle: VecDeque<SharedConnection>,
    active: HashMap<ConnectionId, Active>,
}

struct Active {
    conn: SharedConnection,
    leases: usize,
    _permit: OwnedSemaphorePermit,
}

impl Pool {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|err| err.into_inner())
    }

    fn take_idle(&self) -> Option<SharedConnection> {
        let mut state = self.lock();
        while let Some(conn) = state.idle.pop_front() {
            if conn.is_open() {
                return Some(conn);
            }
            trace!(connection = %conn.id(), "discarding closed idle connection");
        }
        None
    }

    fn activate(
        pool: &Arc<Pool>,
        conn: SharedConnection,
        permit: OwnedSemaphorePermit,
    ) -> PooledConnection {
        let mut state = pool.lock();
        match state.active.get_mut(&conn.id()) {
            // A shared target handed out a connection that is already checked out.
            Some(active) => active.leases += 1,
            None => {
                state.active.insert(
                    conn.id(),
                    Active {
                        conn: conn.clone(),
                        leases: 1,
                        _permit: permit,
                    },
                );
            }
        }
        PooledConnection::new(conn, pool.clone())
    }

    fn lease_active(pool: &Arc<Pool>) -> Option<PooledConnection> {
        let mut state = pool.lock();
        let active = state
            .active
            .values_mut()
            .filter(|active| active.conn.is_open())
            .min_by_key(|active| active.leases)?;
        active.leases += 1;
        trace!(connection = %active.conn.id(), leases = active.leases, "leasing busy connection");
        Some(PooledConnection::new(active.conn.clone(), pool.clone()))
    }

    fn release(&self, id: ConnectionId, discard: bool) {
        let discarded = {
            let mut state = self.lock();
            let Some(active) = state.active.get_mut(&id) else {
                return;
            };
            active.leases -= 1;
            let reusable = !discard && active.conn.is_open() && self.lifecycle.is_running();
            if !reusable {
                state.active.remove(&id).map(|active| active.conn)
            } else if active.leases == 0 {
                if let Some(active) = state.active.remove(&id) {
                    state.idle.push_back(active.conn);
                }
                None
            } else {
                None
            }
        };

        if let Some(conn) = discarded {
            debug!(connection = %id, "discarding pooled connection");
            conn.close();
        }
    }
}

/// A connection checked out of a [`CachingConnectionFactory`].
///
/// Releasing it returns the underlying connection to the pool; closing it discards the
/// underlying connection. Dropping it without either releases it.
pub struct PooledConnection {
    inner: SharedConnection,
    pool: Arc<Pool>,
    released: AtomicBool,
}

impl PooledConnection {
    fn new(inner: SharedConnection, pool: Arc<Pool>) -> Self {
        PooledConnection {
            inner,
            pool,
            released: AtomicBool::new(false),
        }
    }

    /// The pooled connection.
    pub fn inner(&self) -> &SharedConnection {
        &self.inner
    }

    fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl Connection for PooledConnection {
    fn id(&self) -> ConnectionId {
        self.inner.id()
    }

    fn is_open(&self) -> bool {
        !self.is_released() && self.inner.is_open()
    }

    fn is_single_use(&self) -> bool {
        false
    }

    fn send(&self, payload: Bytes) -> BoxFuture<'_, Result<(), SendError>> {
        if self.is_released() {
            let id = self.id();
            return async move { Err(SendError::closed(id)) }.boxed();
        }
        self.inner.send(payload)
    }

    fn register_listener(&self, listener: ConnectionListener) {
        self.inner.register_listener(listener);
    }

    fn detach_listener(&self) {
        self.inner.detach_listener();
    }

    fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.pool.release(self.inner.id(), false);
        }
    }

    fn close(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.pool.release(self.inner.id(), true);
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if !*self.released.get_mut() {
            self.pool.release(self.inner.id(), false);
        }
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("inner", &self.inner)
            .field("released", &self.is_released())
            .finish()
    }
}
