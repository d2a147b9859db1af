//! The request/reply correlation engine.
//!
//! An [`OutboundGateway`] sends each request on a connection obtained from its
//! [`ConnectionFactory`](crate::factory::ConnectionFactory) and suspends the caller until the
//! reply arrives, a deadline expires, or the connection fails.
//!
//! Every connection the gateway uses publishes its events to one channel consumed by a single
//! dispatcher task. The dispatcher is the only place replies are matched to callers: a reply
//! completes the oldest request still pending on its connection, and a terminal event fails
//! every request pending on it.
//!
//! # Timeouts
//!
//! Two deadlines bound a call:
//! - the *request timeout* (optional) covers acquiring a connection, sending the request and
//!   waiting for the reply;
//! - the *remote timeout* (default 10 seconds, or computed per request by a [`RemoteTimeout`]
//!   provider) covers waiting for the reply once the request has been sent.
//!
//! Whichever expires first evicts the caller's pending slot. A reply arriving afterwards is
//! matched to the next request pending on that connection, if any.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use tcpgate::{
//!     connection::{reactor::ReactorConnectionFactory, TcpConfig},
//!     gateway::OutboundGateway,
//! };
//!
//! # tokio_test::block_on(async {
//! let factory = ReactorConnectionFactory::new(TcpConfig::new("localhost", 9000));
//! let gateway = OutboundGateway::builder(factory)
//!     .request_timeout(Duration::from_secs(5))
//!     .build();
//! gateway.start();
//!
//! let reply = gateway.handle("ping").await?;
//! println!("{reply:?}");
//! # Ok::<(), tcpgate::error::GatewayError>(())
//! # });
//! ```

mod pending;
mod timeout;

use std::{
    collections::HashMap,
    fmt,
    future::Future,
    sync::{Arc, Mutex},
    time::Duration,
};

use bytes::Bytes;
use tokio::{
    sync::{mpsc, Mutex as AsyncMutex},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, trace, warn};

use crate::{
    channel::ReplyChannel,
    connection::{
        finish, CloseReason, Connection, ConnectionEvent, ConnectionId, ConnectionListener,
        SharedConnection,
    },
    error::{GatewayError, TimeoutKind},
    factory::{ConnectionFactory, SharedFactory},
};

use self::pending::PendingReplies;

pub use self::timeout::{BoxRemoteTimeout, FnRemoteTimeout, RemoteTimeout};

/// Remote timeout used when none is configured.
pub const DEFAULT_REMOTE_TIMEOUT: Duration = Duration::from_secs(10);

/// Sends requests and correlates their replies.
///
/// Dropping the gateway stops its dispatcher; calls still in flight then fail once their
/// deadline expires.
pub struct OutboundGateway {
    factory: SharedFactory,
    correlator: Arc<Correlator>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    dispatcher: JoinHandle<()>,
    request_timeout: Option<Duration>,
    remote_timeout: BoxRemoteTimeout,
    requires_reply: bool,
    output: Option<ReplyChannel>,
}

impl OutboundGateway {
    /// Creates a gateway over `factory` with default settings.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a tokio runtime.
    pub fn new(factory: impl ConnectionFactory) -> Self {
        OutboundGateway::builder(factory).build()
    }

    /// Returns a builder for configuring a gateway over `factory`.
    pub fn builder(factory: impl ConnectionFactory) -> GatewayBuilder {
        GatewayBuilder::new(Arc::new(factory))
    }

    /// Sends `request` and waits for its reply.
    ///
    /// Returns `Ok(None)` only when the remote timeout expires and replies are not required.
    pub async fn handle(&self, request: impl Into<Bytes>) -> Result<Option<Bytes>, GatewayError> {
        let request = request.into();
        let remote_timeout = self.remote_timeout.remote_timeout(&request);
        let local_deadline = self
            .request_timeout
            .map(|timeout| (Instant::now() + timeout, timeout));

        let conn = within(local_deadline, self.factory.get_connection()).await??;
        let mut conn = CheckedOut::new(conn);
        let id = conn.id();
        conn.register_listener(ConnectionListener::new(id, self.events.clone()));

        let lock = self.correlator.send_lock(id);
        let sending = within(local_deadline, lock.lock()).await?;
        let (slot, mut rx) = self.correlator.pending.register(id);
        let sent = within(local_deadline, conn.send(request)).await;
        match sent {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                debug!(connection = %id, %err, "request could not be sent");
                drop(slot);
                conn.close();
                return Err(err.into());
            }
            Err(err) => {
                // The frame may be partially written.
                debug!(connection = %id, "request timed out while sending");
                drop(slot);
                conn.close();
                return Err(err);
            }
        }
        drop(sending);
        trace!(connection = %id, ?remote_timeout, "awaiting reply");

        let remote_deadline = Instant::now() + remote_timeout;
        let (deadline, timeout, kind) = match local_deadline {
            Some((local, timeout)) if local <= remote_deadline => {
                (local, timeout, TimeoutKind::Request)
            }
            _ => (remote_deadline, remote_timeout, TimeoutKind::Remote),
        };

        let outcome = match tokio::time::timeout_at(deadline, &mut rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(GatewayError::from_close(id, &CloseReason::Local)),
            Err(_) => {
                slot.evict();
                match rx.try_recv() {
                    // The reply raced the deadline.
                    Ok(outcome) => outcome,
                    Err(_) => {
                        drop(slot);
                        conn.finish();
                        debug!(connection = %id, %kind, ?timeout, "timed out awaiting reply");
                        return if kind == TimeoutKind::Remote && !self.requires_reply {
                            Ok(None)
                        } else {
                            Err(GatewayError::RequestTimeout { timeout, kind })
                        };
                    }
                }
            }
        };
        drop(slot);

        match outcome {
            Ok(reply) => {
                conn.finish();
                Ok(Some(reply))
            }
            Err(err) => {
                conn.close();
                Err(err)
            }
        }
    }

    /// Like [`handle`](OutboundGateway::handle), but emits the reply on the output channel.
    ///
    /// Without an output channel the reply is returned instead.
    pub async fn handle_message(
        &self,
        request: impl Into<Bytes>,
    ) -> Result<Option<Bytes>, GatewayError> {
        let reply = self.handle(request).await?;
        match (reply, &self.output) {
            (Some(reply), Some(output)) => {
                if !output.send(reply) {
                    warn!("reply dropped, output channel is closed");
                }
                Ok(None)
            }
            (reply, _) => Ok(reply),
        }
    }

    /// Number of requests currently awaiting a reply.
    pub fn pending_replies(&self) -> usize {
        self.correlator.pending.len()
    }

    /// Starts the connection factory.
    pub fn start(&self) {
        self.factory.start();
    }

    /// Stops the connection factory. Further requests fail with
    /// [`ConnectionError::Stopped`](crate::error::ConnectionError::Stopped).
    pub fn stop(&self) {
        self.factory.stop();
    }

    /// Whether the connection factory is running.
    pub fn is_running(&self) -> bool {
        self.factory.is_running()
    }

    /// The gateway's connection factory.
    pub fn factory(&self) -> &SharedFactory {
        &self.factory
    }
}

impl Drop for OutboundGateway {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

impl fmt::Debug for OutboundGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundGateway")
            .field("factory", &self.factory)
            .field("request_timeout", &self.request_timeout)
            .field("remote_timeout", &self.remote_timeout)
            .field("requires_reply", &self.requires_reply)
            .field("pending_replies", &self.pending_replies())
            .finish()
    }
}

/// Configures an [`OutboundGateway`].
#[derive(Clone, Debug)]
pub struct GatewayBuilder {
    factory: SharedFactory,
    request_timeout: Option<Duration>,
    remote_timeout: BoxRemoteTimeout,
    requires_reply: bool,
    output: Option<ReplyChannel>,
}

impl GatewayBuilder {
    pub(crate) fn new(factory: SharedFactory) -> Self {
        GatewayBuilder {
            factory,
            request_timeout: None,
            remote_timeout: Box::new(DEFAULT_REMOTE_TIMEOUT),
            requires_reply: true,
            output: None,
        }
    }

    /// Bounds the whole call: acquisition, sending and the wait for a reply. Unbounded by
    /// default.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Bounds the wait for a reply once the request is sent.
    pub fn remote_timeout(mut self, timeout: Duration) -> Self {
        self.remote_timeout = Box::new(timeout);
        self
    }

    /// Computes the remote timeout from each request.
    pub fn remote_timeout_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&Bytes) -> Duration + Clone + Send + Sync + 'static,
    {
        self.remote_timeout = Box::new(FnRemoteTimeout(f));
        self
    }

    /// Uses a custom remote timeout provider.
    pub fn remote_timeout_provider(mut self, provider: impl RemoteTimeout) -> Self {
        self.remote_timeout = Box::new(provider);
        self
    }

    /// Whether an expired remote timeout is an error. Defaults to `true`.
    pub fn requires_reply(mut self, requires_reply: bool) -> Self {
        self.requires_reply = requires_reply;
        self
    }

    /// Emits replies from [`OutboundGateway::handle_message`] on `output`.
    pub fn output_channel(mut self, output: ReplyChannel) -> Self {
        self.output = Some(output);
        self
    }

    /// Builds the gateway and spawns its dispatcher.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a tokio runtime.
    pub fn build(self) -> OutboundGateway {
        let correlator = Arc::new(Correlator::default());
        let (events, rx) = mpsc::unbounded_channel();
        let dispatcher = tokio::spawn(dispatch(correlator.clone(), rx));
        OutboundGateway {
            factory: self.factory,
            correlator,
            events,
            dispatcher,
            request_timeout: self.request_timeout,
            remote_timeout: self.remote_timeout,
            requires_reply: self.requires_reply,
            output: self.output,
        }
    }
}

/// Runs `fut` until the request deadline, if there is one.
async fn within<F: Future>(
    deadline: Option<(Instant, Duration)>,
    fut: F,
) -> Result<F::Output, GatewayError> {
    match deadline {
        Some((deadline, timeout)) => tokio::time::timeout_at(deadline, fut)
            .await
            .map_err(|_| GatewayError::RequestTimeout {
                timeout,
                kind: TimeoutKind::Request,
            }),
        None => Ok(fut.await),
    }
}

/// State shared between callers and the dispatcher.
#[derive(Debug, Default)]
struct Correlator {
    pending: Arc<PendingReplies>,
    /// Held across enqueue and send, so queue order is wire order.
    send_locks: Mutex<HashMap<ConnectionId, Arc<AsyncMutex<()>>>>,
}

impl Correlator {
    fn send_lock(&self, connection: ConnectionId) -> Arc<AsyncMutex<()>> {
        self.send_locks
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .entry(connection)
            .or_default()
            .clone()
    }

    fn forget(&self, connection: ConnectionId) {
        self.send_locks
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .remove(&connection);
    }
}

async fn dispatch(correlator: Arc<Correlator>, mut events: mpsc::UnboundedReceiver<ConnectionEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            ConnectionEvent::Reply {
                connection,
                payload,
            } => {
                if !correlator.pending.complete_head(connection, payload) {
                    warn!(%connection, "unsolicited reply dropped");
                }
            }
            ConnectionEvent::Closed { connection, reason } => {
                let err = GatewayError::from_close(connection, &reason);
                let failed = correlator.pending.fail_all(connection, &err);
                correlator.forget(connection);
                debug!(%connection, %reason, failed, "connection closed");
            }
        }
    }
}

/// A connection the gateway holds for one request/reply cycle.
///
/// Finished on drop unless explicitly finished or closed, so a cancelled call still hands the
/// connection back.
struct CheckedOut {
    conn: SharedConnection,
    handed_back: bool,
}

impl CheckedOut {
    fn new(conn: SharedConnection) -> Self {
        CheckedOut {
            conn,
            handed_back: false,
        }
    }

    fn finish(&mut self) {
        if !std::mem::replace(&mut self.handed_back, true) {
            finish(&*self.conn);
        }
    }

    fn close(&mut self) {
        if !std::mem::replace(&mut self.handed_back, true) {
            self.conn.close();
        }
    }
}

impl std::ops::Deref for CheckedOut {
    type Target = dyn Connection;

    fn deref(&self) -> &Self::Target {
        &*self.conn
    }
}

impl Drop for CheckedOut {
    fn drop(&mut self) {
        self.finish();
    }
}
