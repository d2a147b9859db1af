//! In-memory connections for unit tests.

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, Mutex,
};

use bytes::Bytes;
use futures::{future::BoxFuture, FutureExt};

use crate::{
    connection::{
        CloseReason, Connection, ConnectionId, ConnectionListener, ConnectionState,
        SharedConnection,
    },
    error::{ConnectionError, SendError},
};

use super::{ConnectionFactory, Lifecycle, SharedSlot};

/// A connection that answers every request with `Reply<n>` unless it is told to fail sends.
#[derive(Debug)]
pub(crate) struct MockConnection {
    state: ConnectionState,
    single_use: bool,
    echo: bool,
    fail_sends: bool,
    stall_sends: bool,
    sends: AtomicUsize,
}

impl MockConnection {
    pub(crate) fn new(single_use: bool, echo: bool, fail_sends: bool) -> Self {
        MockConnection {
            state: ConnectionState::new(ConnectionId::next()),
            single_use,
            echo,
            fail_sends,
            stall_sends: false,
            sends: AtomicUsize::new(0),
        }
    }

    /// Makes every send hang forever, like a write to a peer that stopped reading.
    pub(crate) fn stalled(mut self) -> Self {
        self.stall_sends = true;
        self
    }

    pub(crate) fn sends(&self) -> usize {
        self.sends.load(Ordering::SeqCst)
    }

    /// Simulates the peer closing the socket.
    pub(crate) fn peer_close(&self) {
        self.state.terminate(CloseReason::PeerClosed);
    }
}

impl Connection for MockConnection {
    fn id(&self) -> ConnectionId {
        self.state.id()
    }

    fn is_open(&self) -> bool {
        self.state.is_open()
    }

    fn is_single_use(&self) -> bool {
        self.single_use
    }

    fn send(&self, _payload: Bytes) -> BoxFuture<'_, Result<(), SendError>> {
        async move {
            let n = self.sends.fetch_add(1, Ordering::SeqCst);
            if self.stall_sends {
                futures::future::pending::<()>().await;
            }
            if !self.state.is_open() {
                return Err(SendError::closed(self.state.id()));
            }
            if self.fail_sends {
                let err = SendError::new(
                    self.state.id(),
                    std::io::Error::from(std::io::ErrorKind::BrokenPipe),
                );
                self.state.terminate(CloseReason::Io(err.source.clone()));
                return Err(err);
            }
            if self.echo {
                self.state.deliver(Bytes::from(format!("Reply{n}")));
            }
            Ok(())
        }
        .boxed()
    }

    fn register_listener(&self, listener: ConnectionListener) {
        self.state.register(listener);
    }

    fn detach_listener(&self) {
        self.state.detach();
    }

    fn close(&self) {
        self.state.terminate(CloseReason::Local);
    }
}

/// A factory producing [`MockConnection`]s and remembering each one.
#[derive(Debug)]
pub(crate) struct MockFactory {
    single_use: bool,
    echo: bool,
    fail_sends: bool,
    stall_sends: bool,
    fail_connect: AtomicBool,
    created: Mutex<Vec<Arc<MockConnection>>>,
    lifecycle: Lifecycle,
    shared: SharedSlot,
}

impl MockFactory {
    fn new(single_use: bool) -> Self {
        MockFactory {
            single_use,
            echo: true,
            fail_sends: false,
            stall_sends: false,
            fail_connect: AtomicBool::new(false),
            created: Mutex::default(),
            lifecycle: Lifecycle::default(),
            shared: SharedSlot::default(),
        }
    }

    pub(crate) fn single_use() -> Self {
        MockFactory::new(true)
    }

    pub(crate) fn shared() -> Self {
        MockFactory::new(false)
    }

    pub(crate) fn failing_sends(mut self) -> Self {
        self.fail_sends = true;
        self
    }

    pub(crate) fn stalled_sends(mut self) -> Self {
        self.stall_sends = true;
        self
    }

    pub(crate) fn silent(mut self) -> Self {
        self.echo = false;
        self
    }

    pub(crate) fn fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn created(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    pub(crate) fn connection(&self, index: usize) -> Arc<MockConnection> {
        self.created.lock().unwrap()[index].clone()
    }

    fn open(&self) -> Result<SharedConnection, ConnectionError> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(ConnectionError::connect(
                "mock:0",
                std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
            ));
        }
        let mut conn = MockConnection::new(self.single_use, self.echo, self.fail_sends);
        if self.stall_sends {
            conn = conn.stalled();
        }
        let conn = Arc::new(conn);
        self.created.lock().unwrap().push(conn.clone());
        Ok(conn)
    }
}

impl ConnectionFactory for MockFactory {
    fn get_connection(&self) -> BoxFuture<'_, Result<SharedConnection, ConnectionError>> {
        async move {
            self.lifecycle.ensure_running()?;
            if self.single_use {
                self.open()
            } else {
                self.shared.get_or_open(|| async { self.open() }).await
            }
        }
        .boxed()
    }

    fn is_single_use(&self) -> bool {
        self.single_use
    }

    fn start(&self) {
        self.lifecycle.start();
    }

    fn stop(&self) {
        if self.lifecycle.stop() {
            self.shared.close();
        }
    }

    fn is_running(&self) -> bool {
        self.lifecycle.is_running()
    }
}
