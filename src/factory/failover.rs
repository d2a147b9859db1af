//! Masking failures of a prefix of an ordered candidate list.
//!
//! [`FailoverConnectionFactory`] tries its candidate factories in order and hands out a
//! [`FailoverConnection`] wrapping the first connection obtained. If a send on that connection
//! fails, the failed delegate is closed and the same payload is retried on a connection from each
//! subsequent candidate in turn. Callers only see a failure once every remaining candidate has
//! failed.
//!
//! Events from the current delegate are relayed under the failover connection's own id. Events
//! from delegates that have been failed over are dropped.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use bytes::Bytes;
use futures::{future::BoxFuture, FutureExt};
use tokio::{
    sync::{mpsc, Mutex as AsyncMutex},
    task::JoinHandle,
};
use tracing::{debug, trace, warn};

use crate::{
    connection::{
        finish, CloseReason, Connection, ConnectionEvent, ConnectionId, ConnectionListener,
        ConnectionState, SharedConnection,
    },
    error::{ConnectionError, SendError},
};

use super::{ConnectionFactory, Lifecycle, SharedFactory, SharedSlot};

/// A factory trying an ordered list of candidate factories.
pub struct FailoverConnectionFactory {
    candidates: Arc<[SharedFactory]>,
    single_use: bool,
    lifecycle: Lifecycle,
    shared: SharedSlot,
}

impl FailoverConnectionFactory {
    /// Creates a stopped failover factory over `candidates`, tried in order.
    ///
    /// Produced connections are single-use if every candidate is.
    pub fn new(candidates: Vec<SharedFactory>) -> Self {
        let single_use =
            !candidates.is_empty() && candidates.iter().all(|candidate| candidate.is_single_use());
        FailoverConnectionFactory {
            candidates: candidates.into(),
            single_use,
            lifecycle: Lifecycle::default(),
            shared: SharedSlot::default(),
        }
    }

    /// Sets whether produced connections are single-use.
    ///
    /// When they are not, every caller shares one failover connection until it closes.
    pub fn single_use(mut self, single_use: bool) -> Self {
        self.single_use = single_use;
        self
    }

    /// The candidate factories, in the order they are tried.
    pub fn candidates(&self) -> &[SharedFactory] {
        &self.candidates
    }

    async fn open(&self) -> Result<SharedConnection, ConnectionError> {
        let (index, delegate) = acquire_from(&self.candidates, 0).await?;
        let conn = FailoverConnection::new(self.candidates.clone(), self.single_use);
        debug!(
            connection = %conn.id(),
            delegate = %delegate.id(),
            candidate = index,
            "failover connection opened"
        );
        conn.install(index, delegate);
        Ok(Arc::new(conn))
    }
}

impl ConnectionFactory for FailoverConnectionFactory {
    fn get_connection(&self) -> BoxFuture<'_, Result<SharedConnection, ConnectionError>> {
        async move {
            self.lifecycle.ensure_running()?;
            if self.single_use {
                self.open().await
            } else {
                self.shared.get_or_open(|| self.open()).await
            }
        }
        .boxed()
    }

    fn is_single_use(&self) -> bool {
        self.single_use
    }

    fn start(&self) {
        for candidate in self.candidates.iter() {
            candidate.start();
        }
        if self.lifecycle.start() {
            debug!(candidates = self.candidates.len(), "failover connection factory started");
        }
    }

    fn stop(&self) {
        if self.lifecycle.stop() {
            self.shared.close();
            debug!("failover connection factory stopped");
        }
        for candidate in self.candidates.iter() {
            candidate.stop();
        }
    }

    fn is_running(&self) -> bool {
        self.lifecycle.is_running()
    }
}

impl fmt::Debug for FailoverConnectionFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FailoverConnectionFactory")
            .field("candidates", &self.candidates)
            .field("single_use", &self.single_use)
            .field("running", &self.lifecycle.is_running())
            .finish()
    }
}

/// Obtains a connection from the first candidate at or after `start` that yields one.
async fn acquire_from(
    candidates: &[SharedFactory],
    start: usize,
) -> Result<(usize, SharedConnection), ConnectionError> {
    if candidates.is_empty() {
        return Err(ConnectionError::NoCandidates);
    }
    let mut last = None;
    for (index, candidate) in candidates.iter().enumerate().skip(start) {
        match candidate.get_connection().await {
            Ok(conn) => return Ok((index, conn)),
            Err(err) => {
                warn!(candidate = index, %err, "failover candidate failed to connect");
                last = Some(err);
            }
        }
    }
    Err(ConnectionError::Exhausted {
        attempts: candidates.len().saturating_sub(start),
        last: Box::new(last.unwrap_or(ConnectionError::NoCandidates)),
    })
}

/// State the relay tasks share with their connection.
#[derive(Debug)]
struct Shared {
    state: ConnectionState,
    /// Bumped whenever the current delegate is abandoned.
    epoch: AtomicU64,
    send_lock: AsyncMutex<()>,
}

struct Current {
    index: usize,
    delegate: SharedConnection,
    relay: JoinHandle<()>,
}

/// A connection delegating to one candidate at a time.
pub struct FailoverConnection {
    shared: Arc<Shared>,
    candidates: Arc<[SharedFactory]>,
    single_use: bool,
    current: Mutex<Option<Current>>,
    finished: AtomicBool,
}

impl FailoverConnection {
    fn new(candidates: Arc<[SharedFactory]>, single_use: bool) -> Self {
        FailoverConnection {
            shared: Arc::new(Shared {
                state: ConnectionState::new(ConnectionId::next()),
                epoch: AtomicU64::new(0),
                send_lock: AsyncMutex::new(()),
            }),
            candidates,
            single_use,
            current: Mutex::new(None),
            finished: AtomicBool::new(false),
        }
    }

    /// The id of the connection currently delegated to.
    pub fn delegate_id(&self) -> Option<ConnectionId> {
        self.lock_current().as_ref().map(|current| current.delegate.id())
    }

    /// The index of the candidate currently delegated to.
    pub fn candidate_index(&self) -> Option<usize> {
        self.lock_current().as_ref().map(|current| current.index)
    }

    fn lock_current(&self) -> std::sync::MutexGuard<'_, Option<Current>> {
        self.current.lock().unwrap_or_else(|err| err.into_inner())
    }

    fn current(&self) -> Option<(usize, SharedConnection)> {
        self.lock_current()
            .as_ref()
            .map(|current| (current.index, current.delegate.clone()))
    }

    /// Makes `delegate` current and starts relaying its events.
    fn install(&self, index: usize, delegate: SharedConnection) {
        let epoch = self.shared.epoch.load(Ordering::Acquire);
        let (tx, rx) = mpsc::unbounded_channel();
        delegate.register_listener(ConnectionListener::new(delegate.id(), tx));
        let relay = tokio::spawn(relay(self.shared.clone(), epoch, rx));

        let previous = self.lock_current().replace(Current {
            index,
            delegate,
            relay,
        });
        if let Some(previous) = previous {
            previous.relay.abort();
        }
    }

    /// Abandons the current delegate, closing it.
    fn abandon(&self, delegate: &SharedConnection) {
        self.shared.epoch.fetch_add(1, Ordering::AcqRel);
        delegate.detach_listener();
        delegate.close();
    }
}

async fn relay(shared: Arc<Shared>, epoch: u64, mut rx: mpsc::UnboundedReceiver<ConnectionEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            ConnectionEvent::Reply { payload, .. } => {
                if shared.epoch.load(Ordering::Acquire) == epoch {
                    shared.state.deliver(payload);
                }
            }
            ConnectionEvent::Closed { connection, reason } => {
                // A failing send abandons its delegate while holding the lock.
                let _send = shared.send_lock.lock().await;
                if shared.epoch.load(Ordering::Acquire) == epoch {
                    debug!(connection = %shared.state.id(), delegate = %connection, %reason, "failover delegate closed");
                    shared.state.terminate(reason);
                } else {
                    trace!(connection = %shared.state.id(), delegate = %connection, "ignoring close of abandoned delegate");
                }
                return;
            }
        }
    }
}

impl Connection for FailoverConnection {
    fn id(&self) -> ConnectionId {
        self.shared.state.id()
    }

    fn is_open(&self) -> bool {
        self.shared.state.is_open()
    }

    fn is_single_use(&self) -> bool {
        self.single_use
    }

    fn send(&self, payload: Bytes) -> BoxFuture<'_, Result<(), SendError>> {
        async move {
            let _send = self.shared.send_lock.lock().await;
            let id = self.id();
            let Some((mut index, mut delegate)) = self.current().filter(|_| self.is_open()) else {
                return Err(SendError::closed(id));
            };

            let first = index;
            loop {
                let err = match delegate.send(payload.clone()).await {
                    Ok(()) => return Ok(()),
                    Err(err) => err,
                };
                warn!(
                    connection = %id,
                    delegate = %delegate.id(),
                    candidate = index,
                    %err,
                    "send failed, failing over"
                );
                self.abandon(&delegate);

                let next = if index + 1 < self.candidates.len() {
                    acquire_from(&self.candidates, index + 1).await
                } else {
                    Err(ConnectionError::Send(err.clone()))
                };
                match next {
                    Ok((next_index, next_delegate)) => {
                        debug!(connection = %id, delegate = %next_delegate.id(), candidate = next_index, "failed over");
                        self.install(next_index, next_delegate.clone());
                        index = next_index;
                        delegate = next_delegate;
                    }
                    Err(conn_err) => {
                        let last = match conn_err {
                            ConnectionError::Exhausted { last, .. } => *last,
                            other => other,
                        };
                        warn!(connection = %id, err = %last, "no failover candidate left");
                        self.shared
                            .state
                            .terminate(CloseReason::Io(err.source.clone()));
                        return Err(SendError::exhausted(
                            id,
                            err.source,
                            ConnectionError::Exhausted {
                                attempts: self.candidates.len() - first,
                                last: Box::new(last),
                            },
                        ));
                    }
                }
            }
        }
        .boxed()
    }

    fn register_listener(&self, listener: ConnectionListener) {
        self.shared.state.register(listener);
    }

    fn detach_listener(&self) {
        self.shared.state.detach();
    }

    fn release(&self) {
        if self.single_use {
            self.close();
        }
    }

    fn close(&self) {
        self.shared.epoch.fetch_add(1, Ordering::AcqRel);
        if self.shared.state.terminate(CloseReason::Local) {
            debug!(connection = %self.id(), "closing failover connection");
        }
        if !self.finished.swap(true, Ordering::AcqRel) {
            let current = self.lock_current().take();
            if let Some(current) = current {
                current.relay.abort();
                current.delegate.detach_listener();
                finish(&*current.delegate);
            }
        }
    }
}

impl Drop for FailoverConnection {
    fn drop(&mut self) {
        if let Some(current) = self
            .current
            .get_mut()
            .unwrap_or_else(|err| err.into_inner())
            .take()
        {
            current.relay.abort();
        }
    }
}

impl fmt::Debug for FailoverConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FailoverConnection")
            .field("id", &self.id())
            .field("delegate", &self.delegate_id())
            .field("candidate", &self.candidate_index())
            .field("open", &self.is_open())
            .field("single_use", &self.single_use)
            .finish()
    }
}
