//! Connections and the events they publish.
//!
//! A [`Connection`] wraps one socket (or, for wrapping strategies, one logical socket). It sends
//! framed requests and publishes every decoded reply, followed by exactly one terminal
//! [`Closed`](ConnectionEvent::Closed) notification, onto the [`ConnectionListener`] currently
//! registered with it.
//!
//! Two base implementations are provided:
//! - [`blocking`]: std sockets with a dedicated receive thread per connection.
//! - [`reactor`]: tokio sockets driven by the runtime's shared reactor.

pub mod blocking;
pub mod reactor;

use std::{
    fmt, io,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use bytes::Bytes;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::trace;

use crate::{codec::CodecConfig, error::SendError};

static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A process-unique connection identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocates the next identifier.
    pub fn next() -> Self {
        ConnectionId(CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the sequence number backing this id.
    pub fn sequence_id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Why a connection stopped.
#[derive(Clone, Debug)]
pub enum CloseReason {
    /// The peer closed the socket.
    PeerClosed,
    /// No bytes arrived within the socket read timeout.
    ReadTimeout(Duration),
    /// Reading or writing failed.
    Io(Arc<io::Error>),
    /// The inbound byte stream could not be decoded.
    Decode(Arc<io::Error>),
    /// The connection was closed by this side.
    Local,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::PeerClosed => write!(f, "closed by peer"),
            CloseReason::ReadTimeout(timeout) => write!(f, "read timed out after {timeout:?}"),
            CloseReason::Io(err) => write!(f, "io error: {err}"),
            CloseReason::Decode(err) => write!(f, "decode error: {err}"),
            CloseReason::Local => write!(f, "closed locally"),
        }
    }
}

/// An event published by a connection's receive path.
#[derive(Clone, Debug)]
pub enum ConnectionEvent {
    /// A decoded reply frame.
    Reply {
        /// The connection the reply arrived on.
        connection: ConnectionId,
        /// The reply payload.
        payload: Bytes,
    },
    /// The terminal notification. Nothing follows it.
    Closed {
        /// The connection that closed.
        connection: ConnectionId,
        /// Why it closed.
        reason: CloseReason,
    },
}

impl ConnectionEvent {
    /// The connection this event is stamped with.
    pub fn connection(&self) -> ConnectionId {
        match self {
            ConnectionEvent::Reply { connection, .. } | ConnectionEvent::Closed { connection, .. } => {
                *connection
            }
        }
    }
}

/// Where a connection publishes its events.
///
/// Events are stamped with the listener's connection id rather than the publishing connection's
/// own, which lets a wrapping connection route its delegate's events under its own identity.
#[derive(Clone, Debug)]
pub struct ConnectionListener {
    connection: ConnectionId,
    tx: mpsc::UnboundedSender<ConnectionEvent>,
}

impl ConnectionListener {
    /// Creates a listener stamping events with `connection`.
    pub fn new(connection: ConnectionId, tx: mpsc::UnboundedSender<ConnectionEvent>) -> Self {
        ConnectionListener { connection, tx }
    }

    /// The id events are stamped with.
    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    /// Publishes a reply. Returns `false` if the consumer is gone.
    pub fn on_reply(&self, payload: Bytes) -> bool {
        self.tx
            .send(ConnectionEvent::Reply {
                connection: self.connection,
                payload,
            })
            .is_ok()
    }

    /// Publishes the terminal notification. Returns `false` if the consumer is gone.
    pub fn on_close(&self, reason: CloseReason) -> bool {
        self.tx
            .send(ConnectionEvent::Closed {
                connection: self.connection,
                reason,
            })
            .is_ok()
    }
}

/// One logical socket used for one or more request/reply cycles.
pub trait Connection: fmt::Debug + Send + Sync + 'static {
    /// The connection's id.
    fn id(&self) -> ConnectionId;

    /// Whether the connection can still be used.
    fn is_open(&self) -> bool;

    /// Whether the connection must be closed after exactly one request/reply cycle.
    fn is_single_use(&self) -> bool;

    /// Writes one framed request.
    ///
    /// Concurrent sends are serialized. A failed send leaves the connection closed.
    fn send(&self, payload: Bytes) -> BoxFuture<'_, Result<(), SendError>>;

    /// Replaces the listener events are published to.
    fn register_listener(&self, listener: ConnectionListener);

    /// Removes the current listener; subsequent events are dropped.
    fn detach_listener(&self);

    /// Hands the connection back to whatever produced it once a request/reply cycle is done.
    ///
    /// Plain connections stay open; pooled connections return to their pool.
    fn release(&self) {}

    /// Closes the connection, publishing the terminal notification if it hasn't been already.
    fn close(&self);
}

/// A connection shared between the gateway, its factory, and any wrapping strategies.
pub type SharedConnection = Arc<dyn Connection>;

/// Ends a request/reply cycle: single-use connections are closed, everything else is released.
pub fn finish(connection: &dyn Connection) {
    if connection.is_single_use() {
        connection.close();
    } else {
        connection.release();
    }
}

/// Socket settings shared by the base factories.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpConfig {
    /// Host to connect to.
    pub host: String,
    /// Port to connect to.
    pub port: u16,
    /// Open a new socket for every request/reply cycle.
    pub single_use: bool,
    /// Socket read timeout; `None` waits forever.
    pub so_timeout: Option<Duration>,
    /// Upper bound on establishing the socket.
    pub connect_timeout: Duration,
    /// Disable Nagle's algorithm.
    pub nodelay: bool,
    /// Wire framing.
    pub codec: CodecConfig,
}

impl TcpConfig {
    /// Creates a config for `host:port` with default settings.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        TcpConfig {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    /// Sets whether connections are single-use.
    pub fn single_use(mut self, single_use: bool) -> Self {
        self.single_use = single_use;
        self
    }

    /// Sets the socket read timeout.
    pub fn so_timeout(mut self, timeout: Duration) -> Self {
        self.so_timeout = Some(timeout);
        self
    }

    /// Sets the connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the wire framing.
    pub fn codec(mut self, codec: CodecConfig) -> Self {
        self.codec = codec;
        self
    }

    pub(crate) fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for TcpConfig {
    fn default() -> Self {
        TcpConfig {
            host: "localhost".to_string(),
            port: 0,
            single_use: false,
            so_timeout: None,
            connect_timeout: Duration::from_secs(10),
            nodelay: true,
            codec: CodecConfig::default(),
        }
    }
}

/// Listener and open/closed bookkeeping shared by the base connections.
///
/// Guarantees the terminal notification is published at most once.
#[derive(Debug)]
pub(crate) struct ConnectionState {
    id: ConnectionId,
    open: AtomicBool,
    listener: Mutex<Option<ConnectionListener>>,
}

impl ConnectionState {
    pub(crate) fn new(id: ConnectionId) -> Self {
        ConnectionState {
            id,
            open: AtomicBool::new(true),
            listener: Mutex::new(None),
        }
    }

    pub(crate) fn id(&self) -> ConnectionId {
        self.id
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub(crate) fn register(&self, listener: ConnectionListener) {
        *self.listener.lock().unwrap_or_else(|err| err.into_inner()) = Some(listener);
    }

    pub(crate) fn detach(&self) {
        self.listener
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .take();
    }

    pub(crate) fn deliver(&self, payload: Bytes) {
        if !self.is_open() {
            return;
        }
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .clone();
        match listener {
            Some(listener) => {
                trace!(connection = %self.id, len = payload.len(), "reply received");
                listener.on_reply(payload);
            }
            None => trace!(connection = %self.id, "reply dropped, no listener registered"),
        }
    }

    /// Marks the connection closed. Returns `true` for the call that actually closed it.
    pub(crate) fn terminate(&self, reason: CloseReason) -> bool {
        if !self.open.swap(false, Ordering::AcqRel) {
            return false;
        }
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .take();
        trace!(connection = %self.id, %reason, "connection terminated");
        if let Some(listener) = listener {
            listener.on_close(reason);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_notification_is_published_once() {
        let state = ConnectionState::new(ConnectionId::next());
        let (tx, mut rx) = mpsc::unbounded_channel();
        state.register(ConnectionListener::new(state.id(), tx));

        state.deliver(Bytes::from_static(b"Reply0"));
        assert!(state.terminate(CloseReason::PeerClosed));
        assert!(!state.terminate(CloseReason::Local));
        state.deliver(Bytes::from_static(b"late"));

        assert!(matches!(rx.try_recv(), Ok(ConnectionEvent::Reply { .. })));
        assert!(matches!(
            rx.try_recv(),
            Ok(ConnectionEvent::Closed {
                reason: CloseReason::PeerClosed,
                ..
            })
        ));
        // The listener was dropped with the terminal notification.
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn events_are_stamped_with_listener_id() {
        let state = ConnectionState::new(ConnectionId::next());
        let outer = ConnectionId::next();
        let (tx, mut rx) = mpsc::unbounded_channel();
        state.register(ConnectionListener::new(outer, tx));
        state.deliver(Bytes::from_static(b"x"));
        assert_eq!(rx.try_recv().unwrap().connection(), outer);
    }

    #[test]
    fn tcp_config_deserializes_with_defaults() {
        let config: TcpConfig =
            serde_json::from_str(r#"{ "host": "10.0.0.1", "port": 9000 }"#).unwrap();
        assert_eq!(config.addr(), "10.0.0.1:9000");
        assert!(!config.single_use);
        assert_eq!(config.so_timeout, None);
        assert_eq!(config.codec, CodecConfig::default());
    }
}
