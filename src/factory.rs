//! Strategies for obtaining connections.
//!
//! Every strategy implements [`ConnectionFactory`], so the gateway and the wrapping strategies
//! depend only on the trait:
//!
//! - [`BlockingConnectionFactory`](crate::connection::blocking::BlockingConnectionFactory) and
//!   [`ReactorConnectionFactory`](crate::connection::reactor::ReactorConnectionFactory) open sockets.
//! - [`CachingConnectionFactory`] bounds and reuses the connections of another factory.
//! - [`FailoverConnectionFactory`] masks failures of a prefix of an ordered candidate list.
//!
//! Caching and failover compose in either order.

pub mod caching;
pub mod failover;
#[cfg(test)]
pub(crate) mod testing;

use std::{
    fmt,
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use futures::future::BoxFuture;
use tokio::sync::Mutex as AsyncMutex;

use crate::{connection::SharedConnection, error::ConnectionError};

pub use caching::{CachingConnectionFactory, PoolExhaustion, PooledConnection};
pub use failover::{FailoverConnection, FailoverConnectionFactory};

/// Produces [`Connection`](crate::connection::Connection)s.
///
/// Factories are long-lived and shared across every gateway call. They are created stopped;
/// acquisition fails with [`ConnectionError::Stopped`] until [`start`](ConnectionFactory::start)
/// is called. Lifecycle calls are idempotent and wrapping factories forward them to every
/// wrapped factory.
pub trait ConnectionFactory: fmt::Debug + Send + Sync + 'static {
    /// Returns an open connection.
    fn get_connection(&self) -> BoxFuture<'_, Result<SharedConnection, ConnectionError>>;

    /// Whether produced connections are discarded after one request/reply cycle.
    fn is_single_use(&self) -> bool;

    /// Allows acquisition.
    fn start(&self);

    /// Refuses further acquisition and closes the connections this factory holds on to.
    fn stop(&self);

    /// Whether the factory is started.
    fn is_running(&self) -> bool;
}

/// A factory shared between gateways and wrapping strategies.
pub type SharedFactory = Arc<dyn ConnectionFactory>;

impl<F> ConnectionFactory for Arc<F>
where
    F: ConnectionFactory + ?Sized,
{
    fn get_connection(&self) -> BoxFuture<'_, Result<SharedConnection, ConnectionError>> {
        (**self).get_connection()
    }

    fn is_single_use(&self) -> bool {
        (**self).is_single_use()
    }

    fn start(&self) {
        (**self).start()
    }

    fn stop(&self) {
        (**self).stop()
    }

    fn is_running(&self) -> bool {
        (**self).is_running()
    }
}

/// Started/stopped flag.
#[derive(Debug, Default)]
pub(crate) struct Lifecycle {
    running: AtomicBool,
}

impl Lifecycle {
    /// Returns `true` if this call started it.
    pub(crate) fn start(&self) -> bool {
        !self.running.swap(true, Ordering::AcqRel)
    }

    /// Returns `true` if this call stopped it.
    pub(crate) fn stop(&self) -> bool {
        self.running.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn ensure_running(&self) -> Result<(), ConnectionError> {
        if self.is_running() {
            Ok(())
        } else {
            Err(ConnectionError::Stopped)
        }
    }
}

/// The one connection a shared (non single-use) factory hands out while it stays open.
#[derive(Default)]
pub(crate) struct SharedSlot {
    current: Mutex<Option<SharedConnection>>,
    opening: AsyncMutex<()>,
}

impl SharedSlot {
    /// Returns the current connection if it is open, otherwise opens and stores a new one.
    ///
    /// Concurrent callers racing on a closed slot open only one replacement.
    pub(crate) async fn get_or_open<F, Fut>(&self, open: F) -> Result<SharedConnection, ConnectionError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<SharedConnection, ConnectionError>>,
    {
        if let Some(conn) = self.current_open() {
            return Ok(conn);
        }
        let _opening = self.opening.lock().await;
        if let Some(conn) = self.current_open() {
            return Ok(conn);
        }
        let conn = open().await?;
        *self.current.lock().unwrap_or_else(|err| err.into_inner()) = Some(conn.clone());
        Ok(conn)
    }

    /// Closes and forgets the current connection.
    pub(crate) fn close(&self) {
        let conn = self
            .current
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .take();
        if let Some(conn) = conn {
            conn.close();
        }
    }

    fn current_open(&self) -> Option<SharedConnection> {
        self.current
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .as_ref()
            .filter(|conn| conn.is_open())
            .cloned()
    }
}

impl fmt::Debug for SharedSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let current = self
            .current
            .lock()
            .ok()
            .and_then(|current| current.as_ref().map(|conn| conn.id()));
        f.debug_struct("SharedSlot")
            .field("current", &current)
            .finish()
    }
}
