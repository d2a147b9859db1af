//! Defines error handling constructs for tcpgate.
//!
//! Failures are grouped by where they happen in a request/reply cycle: obtaining a connection
//! ([`ConnectionError`]), writing the request ([`SendError`]), and waiting for the reply
//! ([`GatewayError`], which also wraps the first two).

use std::{error, fmt, io, sync::Arc, time::Duration};

use crate::connection::{CloseReason, ConnectionId};

/// A dyn boxed error.
pub type BoxError = Box<dyn error::Error + Send + Sync + 'static>;

/// No usable connection could be obtained.
#[derive(Clone, Debug)]
pub enum ConnectionError {
    /// The factory is stopped.
    Stopped,
    /// A failover factory was built without candidates.
    NoCandidates,
    /// Opening the socket failed.
    Connect {
        /// The address being connected to.
        addr: String,
        /// The underlying io error.
        source: Arc<io::Error>,
    },
    /// The pool had no capacity left and the exhaustion policy gave up.
    PoolExhausted {
        /// Capacity of the pool.
        pool_size: usize,
    },
    /// A connection was obtained, but writing the request to it failed.
    Send(SendError),
    /// Every failover candidate was tried and failed.
    Exhausted {
        /// Number of candidates tried.
        attempts: usize,
        /// The failure reported by the last candidate.
        last: Box<ConnectionError>,
    },
}

impl ConnectionError {
    pub(crate) fn connect(addr: impl Into<String>, err: io::Error) -> Self {
        ConnectionError::Connect {
            addr: addr.into(),
            source: Arc::new(err),
        }
    }

    /// Returns the io error kind of the underlying cause, if there is one.
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            ConnectionError::Connect { source, .. } => Some(source.kind()),
            ConnectionError::Send(err) => Some(err.source.kind()),
            ConnectionError::Exhausted { last, .. } => last.io_kind(),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionError::Stopped => write!(f, "connection factory stopped"),
            ConnectionError::NoCandidates => write!(f, "no failover candidates"),
            ConnectionError::Connect { addr, source } => {
                write!(f, "failed to connect to {addr}: {source}")
            }
            ConnectionError::PoolExhausted { pool_size } => {
                write!(f, "connection pool exhausted ({pool_size} connections in use)")
            }
            ConnectionError::Send(err) => err.fmt(f),
            ConnectionError::Exhausted { attempts, last } => {
                write!(f, "all {attempts} failover candidates failed; last: {last}")
            }
        }
    }
}

impl error::Error for ConnectionError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            ConnectionError::Connect { source, .. } => Some(source.as_ref()),
            ConnectionError::Send(err) => Some(err),
            ConnectionError::Exhausted { last, .. } => Some(last.as_ref()),
            _ => None,
        }
    }
}

/// Writing a request to a connection failed. The connection is closed afterwards.
#[derive(Clone, Debug)]
pub struct SendError {
    /// The connection the write was attempted on.
    pub connection: ConnectionId,
    /// The underlying io error.
    pub source: Arc<io::Error>,
    /// Set when a failover connection ran out of candidates to resend on.
    ///
    /// The gateway reports this as [`GatewayError::Connection`].
    pub exhausted: Option<Box<ConnectionError>>,
}

impl SendError {
    /// Creates a send error for a write that failed with `err`.
    pub fn new(connection: ConnectionId, err: io::Error) -> Self {
        SendError {
            connection,
            source: Arc::new(err),
            exhausted: None,
        }
    }

    pub(crate) fn exhausted(
        connection: ConnectionId,
        source: Arc<io::Error>,
        exhausted: ConnectionError,
    ) -> Self {
        SendError {
            connection,
            source,
            exhausted: Some(Box::new(exhausted)),
        }
    }

    pub(crate) fn closed(connection: ConnectionId) -> Self {
        SendError::new(
            connection,
            io::Error::new(io::ErrorKind::NotConnected, "connection is closed"),
        )
    }
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to send on {}: {}", self.connection, self.source)
    }
}

impl error::Error for SendError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

/// Which deadline expired while waiting for a reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TimeoutKind {
    /// The caller-side request timeout, covering acquisition, sending and the wait for a reply.
    Request,
    /// The per-request remote timeout, covering the wait for a reply once sent.
    Remote,
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutKind::Request => write!(f, "request"),
            TimeoutKind::Remote => write!(f, "remote"),
        }
    }
}

/// Error returned by [`OutboundGateway::handle`](crate::gateway::OutboundGateway::handle).
#[derive(Clone, Debug)]
pub enum GatewayError {
    /// No usable connection could be obtained.
    Connection(ConnectionError),
    /// The request could not be written.
    Send(SendError),
    /// A deadline expired before a reply arrived.
    ///
    /// The pending slot has been evicted. The connection is left open, unless the deadline
    /// expired while the request was being sent.
    RequestTimeout {
        /// The deadline that expired.
        timeout: Duration,
        /// Which deadline it was.
        kind: TimeoutKind,
    },
    /// The peer closed the connection, or it failed, before a reply arrived.
    ConnectionClosed {
        /// The connection that closed.
        connection: ConnectionId,
        /// The underlying cause.
        cause: Arc<io::Error>,
    },
    /// The socket read timeout elapsed while waiting for a reply.
    SocketTimeout {
        /// The connection that timed out.
        connection: ConnectionId,
        /// The configured read timeout.
        timeout: Duration,
        /// The underlying cause.
        cause: Arc<io::Error>,
    },
}

impl GatewayError {
    /// Maps a terminal connection notification to the error delivered to every caller
    /// still waiting on that connection.
    pub(crate) fn from_close(connection: ConnectionId, reason: &CloseReason) -> Self {
        match reason {
            CloseReason::ReadTimeout(timeout) => GatewayError::SocketTimeout {
                connection,
                timeout: *timeout,
                cause: Arc::new(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("read timed out after {timeout:?}"),
                )),
            },
            CloseReason::PeerClosed => GatewayError::ConnectionClosed {
                connection,
                cause: Arc::new(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed by peer",
                )),
            },
            CloseReason::Io(err) | CloseReason::Decode(err) => GatewayError::ConnectionClosed {
                connection,
                cause: err.clone(),
            },
            CloseReason::Local => GatewayError::ConnectionClosed {
                connection,
                cause: Arc::new(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    "connection closed locally",
                )),
            },
        }
    }

    /// Returns `true` if this is a [`RequestTimeout`](GatewayError::RequestTimeout).
    pub fn is_timeout(&self) -> bool {
        matches!(self, GatewayError::RequestTimeout { .. })
    }

    /// Returns the io error kind of the underlying cause, if there is one.
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            GatewayError::Connection(err) => err.io_kind(),
            GatewayError::Send(err) => Some(err.source.kind()),
            GatewayError::ConnectionClosed { cause, .. }
            | GatewayError::SocketTimeout { cause, .. } => Some(cause.kind()),
            _ => None,
        }
    }
}

impl From<ConnectionError> for GatewayError {
    fn from(err: ConnectionError) -> Self {
        GatewayError::Connection(err)
    }
}

impl From<SendError> for GatewayError {
    fn from(mut err: SendError) -> Self {
        match err.exhausted.take() {
            Some(exhausted) => GatewayError::Connection(*exhausted),
            None => GatewayError::Send(err),
        }
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::Connection(err) => err.fmt(f),
            GatewayError::Send(err) => err.fmt(f),
            GatewayError::RequestTimeout { timeout, kind } => {
                write!(f, "{kind} timeout of {timeout:?} elapsed waiting for a reply")
            }
            GatewayError::ConnectionClosed { connection, cause } => {
                write!(f, "{connection} closed while awaiting a reply: {cause}")
            }
            GatewayError::SocketTimeout {
                connection,
                timeout,
                ..
            } => write!(
                f,
                "socket read timeout of {timeout:?} on {connection} while awaiting a reply"
            ),
        }
    }
}

impl error::Error for GatewayError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            GatewayError::Connection(err) => Some(err),
            GatewayError::Send(err) => Some(err),
            GatewayError::RequestTimeout { .. } => None,
            GatewayError::ConnectionClosed { cause, .. }
            | GatewayError::SocketTimeout { cause, .. } => Some(cause.as_ref()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::*;

    #[test]
    fn close_reasons_map_to_distinct_causes() {
        let id = ConnectionId::next();

        let closed = GatewayError::from_close(id, &CloseReason::PeerClosed);
        assert!(matches!(closed, GatewayError::ConnectionClosed { .. }));
        assert_eq!(closed.io_kind(), Some(io::ErrorKind::UnexpectedEof));

        let timed_out =
            GatewayError::from_close(id, &CloseReason::ReadTimeout(Duration::from_millis(100)));
        assert!(matches!(timed_out, GatewayError::SocketTimeout { .. }));
        assert_eq!(timed_out.io_kind(), Some(io::ErrorKind::TimedOut));
        assert!(timed_out.source().is_some());
    }

    #[test]
    fn exhausted_exposes_last_cause() {
        let last = ConnectionError::connect(
            "localhost:1",
            io::Error::from(io::ErrorKind::ConnectionRefused),
        );
        let err = ConnectionError::Exhausted {
            attempts: 2,
            last: Box::new(last),
        };
        let source = err.source().expect("exhausted has a source");
        assert!(source.to_string().contains("localhost:1"));
    }

    #[test]
    fn failover_exhaustion_on_send_maps_to_connection_error() {
        let last = SendError::new(ConnectionId::next(), io::Error::from(io::ErrorKind::BrokenPipe));
        let err = SendError::exhausted(
            ConnectionId::next(),
            last.source.clone(),
            ConnectionError::Exhausted {
                attempts: 2,
                last: Box::new(ConnectionError::Send(last)),
            },
        );
        let err = GatewayError::from(err);
        assert!(matches!(
            err,
            GatewayError::Connection(ConnectionError::Exhausted { attempts: 2, .. })
        ));
        assert_eq!(err.io_kind(), Some(io::ErrorKind::BrokenPipe));

        let plain = SendError::closed(ConnectionId::next());
        assert!(matches!(GatewayError::from(plain), GatewayError::Send(_)));
    }
}
