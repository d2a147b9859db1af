//! Connections over std sockets, each with a dedicated receive thread.

use std::{
    fmt,
    io::{self, Read, Write},
    net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs},
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use futures::{future::BoxFuture, FutureExt};
use tracing::{debug, error, trace};

use crate::{
    codec::{BoxCodec, Codec},
    error::{ConnectionError, SendError},
    factory::{ConnectionFactory, Lifecycle, SharedSlot},
};

use super::{
    CloseReason, Connection, ConnectionId, ConnectionListener, ConnectionState, SharedConnection,
    TcpConfig,
};

const READ_CHUNK: usize = 8 * 1024;

/// A connection over a blocking [`TcpStream`].
///
/// Replies are read by a thread owned by the connection, which exits once the connection
/// terminates. Writes run on tokio's blocking pool.
pub struct BlockingConnection {
    state: Arc<ConnectionState>,
    writer: Arc<Mutex<TcpStream>>,
    /// Shuts the socket down without waiting for a write in progress.
    control: TcpStream,
    codec: BoxCodec,
    single_use: bool,
    peer_addr: SocketAddr,
}

impl BlockingConnection {
    /// Connects to the configured address and starts the receive thread.
    ///
    /// This blocks the calling thread until the socket is established.
    pub fn connect(config: &TcpConfig, codec: BoxCodec) -> io::Result<Self> {
        let stream = connect_timeout(&config.addr(), config.connect_timeout)?;
        stream.set_nodelay(config.nodelay)?;
        stream.set_read_timeout(config.so_timeout)?;
        let peer_addr = stream.peer_addr()?;
        let reader = stream.try_clone()?;
        let control = stream.try_clone()?;

        let state = Arc::new(ConnectionState::new(ConnectionId::next()));
        let id = state.id();
        thread::Builder::new()
            .name(format!("tcpgate-{id}"))
            .spawn({
                let state = state.clone();
                let codec = codec.clone();
                let so_timeout = config.so_timeout;
                move || read_loop(state, reader, codec, so_timeout)
            })?;
        debug!(connection = %id, %peer_addr, single_use = config.single_use, "blocking connection opened");

        Ok(BlockingConnection {
            state,
            writer: Arc::new(Mutex::new(stream)),
            control,
            codec,
            single_use: config.single_use,
            peer_addr,
        })
    }

    /// The remote address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    fn fail(&self, err: io::Error) -> SendError {
        let err = SendError::new(self.state.id(), err);
        if self.state.terminate(CloseReason::Io(err.source.clone())) {
            self.shutdown();
        }
        err
    }

    fn shutdown(&self) {
        let _ = self.control.shutdown(Shutdown::Both);
    }
}

impl Connection for BlockingConnection {
    fn id(&self) -> ConnectionId {
        self.state.id()
    }

    fn is_open(&self) -> bool {
        self.state.is_open()
    }

    fn is_single_use(&self) -> bool {
        self.single_use
    }

    fn send(&self, payload: Bytes) -> BoxFuture<'_, Result<(), SendError>> {
        async move {
            if !self.state.is_open() {
                return Err(SendError::closed(self.state.id()));
            }
            let mut frame = BytesMut::new();
            self.codec
                .encode(&payload, &mut frame)
                .map_err(|err| self.fail(err))?;

            let writer = self.writer.clone();
            let written = tokio::task::spawn_blocking(move || {
                let mut stream = writer
                    .lock()
                    .map_err(|_| io::Error::new(io::ErrorKind::Other, "writer poisoned"))?;
                stream.write_all(&frame)?;
                stream.flush()
            })
            .await;

            match written {
                Ok(Ok(())) => {
                    trace!(connection = %self.state.id(), len = payload.len(), "request sent");
                    Ok(())
                }
                Ok(Err(err)) => Err(self.fail(err)),
                Err(err) => Err(self.fail(io::Error::new(io::ErrorKind::Other, err))),
            }
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
        if self.state.terminate(CloseReason::Local) {
            debug!(connection = %self.state.id(), "closing blocking connection");
            self.shutdown();
        }
    }
}

impl fmt::Debug for BlockingConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockingConnection")
            .field("id", &self.state.id())
            .field("peer_addr", &self.peer_addr)
            .field("open", &self.state.is_open())
            .field("single_use", &self.single_use)
            .finish()
    }
}

fn connect_timeout(addr: &str, timeout: Duration) -> io::Result<TcpStream> {
    let mut last_err = None;
    for addr in addr.to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(err) => last_err = Some(err),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "address resolved to nothing")
    }))
}

fn read_loop(
    state: Arc<ConnectionState>,
    mut stream: TcpStream,
    codec: BoxCodec,
    so_timeout: Option<Duration>,
) {
    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        loop {
            match codec.decode(&mut buf) {
                Ok(Some(frame)) => state.deliver(frame),
                Ok(None) => break,
                Err(err) => {
                    error!(connection = %state.id(), %err, "failed to decode reply");
                    state.terminate(CloseReason::Decode(Arc::new(err)));
                    let _ = stream.shutdown(Shutdown::Both);
                    return;
                }
            }
        }

        match stream.read(&mut chunk) {
            Ok(0) => {
                state.terminate(CloseReason::PeerClosed);
                break;
            }
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            // Unix reports an elapsed SO_RCVTIMEO as WouldBlock, Windows as TimedOut.
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ) =>
            {
                state.terminate(CloseReason::ReadTimeout(so_timeout.unwrap_or_default()));
                break;
            }
            Err(err) => {
                state.terminate(CloseReason::Io(Arc::new(err)));
                break;
            }
        }
    }
    let _ = stream.shutdown(Shutdown::Both);
    trace!(connection = %state.id(), "receive thread exiting");
}

/// Produces [`BlockingConnection`]s.
///
/// Single-use factories open a socket per acquisition; shared factories hand out one connection
/// for as long as it stays open.
pub struct BlockingConnectionFactory {
    config: TcpConfig,
    codec: BoxCodec,
    lifecycle: Lifecycle,
    shared: SharedSlot,
}

impl BlockingConnectionFactory {
    /// Creates a stopped factory using the configured codec.
    pub fn new(config: TcpConfig) -> Self {
        let codec = config.codec.build();
        BlockingConnectionFactory {
            config,
            codec,
            lifecycle: Lifecycle::default(),
            shared: SharedSlot::default(),
        }
    }

    /// Replaces the codec with a custom implementation.
    pub fn with_codec(mut self, codec: impl Codec) -> Self {
        self.codec = Box::new(codec);
        self
    }

    /// The factory's configuration.
    pub fn config(&self) -> &TcpConfig {
        &self.config
    }

    async fn open(&self) -> Result<SharedConnection, ConnectionError> {
        let config = self.config.clone();
        let codec = self.codec.clone();
        let addr = config.addr();
        let conn = tokio::task::spawn_blocking(move || BlockingConnection::connect(&config, codec))
            .await
            .map_err(|err| {
                ConnectionError::connect(addr.clone(), io::Error::new(io::ErrorKind::Other, err))
            })?
            .map_err(|err| ConnectionError::connect(addr, err))?;
        Ok(Arc::new(conn))
    }
}

impl ConnectionFactory for BlockingConnectionFactory {
    fn get_connection(&self) -> BoxFuture<'_, Result<SharedConnection, ConnectionError>> {
        async move {
            self.lifecycle.ensure_running()?;
            if self.config.single_use {
                self.open().await
            } else {
                self.shared.get_or_open(|| self.open()).await
            }
        }
        .boxed()
    }

    fn is_single_use(&self) -> bool {
        self.config.single_use
    }

    fn start(&self) {
        if self.lifecycle.start() {
            debug!(addr = %self.config.addr(), "blocking connection factory started");
        }
    }

    fn stop(&self) {
        if self.lifecycle.stop() {
            self.shared.close();
            debug!(addr = %self.config.addr(), "blocking connection factory stopped");
        }
    }

    fn is_running(&self) -> bool {
        self.lifecycle.is_running()
    }
}

impl fmt::Debug for BlockingConnectionFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockingConnectionFactory")
            .field("config", &self.config)
            .field("codec", &self.codec)
            .field("running", &self.lifecycle.is_running())
            .finish()
    }
}
