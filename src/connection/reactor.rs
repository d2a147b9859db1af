//! Connections over tokio sockets, driven by the runtime's shared reactor.

use std::{
    fmt, io,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use futures::{future::BoxFuture, FutureExt};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::Mutex as AsyncMutex,
    task::JoinHandle,
};
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

/// A connection over a tokio [`TcpStream`].
///
/// The receive loop is a task on the current runtime; closing the connection aborts it.
pub struct ReactorConnection {
    state: Arc<ConnectionState>,
    writer: Arc<AsyncMutex<OwnedWriteHalf>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    codec: BoxCodec,
    single_use: bool,
    peer_addr: SocketAddr,
}

impl ReactorConnection {
    /// Connects to the configured address and spawns the receive loop.
    pub async fn connect(config: &TcpConfig, codec: BoxCodec) -> io::Result<Self> {
        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(config.addr()))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
        stream.set_nodelay(config.nodelay)?;
        let peer_addr = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();

        let state = Arc::new(ConnectionState::new(ConnectionId::next()));
        let reader = tokio::spawn(read_loop(
            state.clone(),
            read_half,
            codec.clone(),
            config.so_timeout,
        ));
        debug!(connection = %state.id(), %peer_addr, single_use = config.single_use, "reactor connection opened");

        Ok(ReactorConnection {
            state,
            writer: Arc::new(AsyncMutex::new(write_half)),
            reader: Mutex::new(Some(reader)),
            codec,
            single_use: config.single_use,
            peer_addr,
        })
    }

    /// The remote address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    fn teardown(&self) {
        if let Some(reader) = self
            .reader
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .take()
        {
            reader.abort();
        }
        let writer = self.writer.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = writer.lock().await.shutdown().await;
            });
        }
    }

    fn fail(&self, err: io::Error) -> SendError {
        let err = SendError::new(self.state.id(), err);
        if self.state.terminate(CloseReason::Io(err.source.clone())) {
            self.teardown();
        }
        err
    }
}

impl Connection for ReactorConnection {
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

            let written = {
                let mut writer = self.writer.lock().await;
                match writer.write_all(&frame).await {
                    Ok(()) => writer.flush().await,
                    Err(err) => Err(err),
                }
            };
            match written {
                Ok(()) => {
                    trace!(connection = %self.state.id(), len = payload.len(), "request sent");
                    Ok(())
                }
                Err(err) => Err(self.fail(err)),
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
            debug!(connection = %self.state.id(), "closing reactor connection");
            self.teardown();
        }
    }
}

impl Drop for ReactorConnection {
    fn drop(&mut self) {
        if let Some(reader) = self
            .reader
            .get_mut()
            .unwrap_or_else(|err| err.into_inner())
            .take()
        {
            reader.abort();
        }
    }
}

impl fmt::Debug for ReactorConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReactorConnection")
            .field("id", &self.state.id())
            .field("peer_addr", &self.peer_addr)
            .field("open", &self.state.is_open())
            .field("single_use", &self.single_use)
            .finish()
    }
}

async fn read_loop(
    state: Arc<ConnectionState>,
    mut reader: OwnedReadHalf,
    codec: BoxCodec,
    so_timeout: Option<Duration>,
) {
    let mut buf = BytesMut::with_capacity(8 * 1024);
    loop {
        loop {
            match codec.decode(&mut buf) {
                Ok(Some(frame)) => state.deliver(frame),
                Ok(None) => break,
                Err(err) => {
                    error!(connection = %state.id(), %err, "failed to decode reply");
                    state.terminate(CloseReason::Decode(Arc::new(err)));
                    return;
                }
            }
        }

        let read = match so_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, reader.read_buf(&mut buf)).await
            {
                Ok(read) => read,
                Err(_) => {
                    state.terminate(CloseReason::ReadTimeout(timeout));
                    return;
                }
            },
            None => reader.read_buf(&mut buf).await,
        };

        match read {
            Ok(0) => {
                state.terminate(CloseReason::PeerClosed);
                return;
            }
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => {
                state.terminate(CloseReason::Io(Arc::new(err)));
                return;
            }
        }
    }
}

/// Produces [`ReactorConnection`]s.
///
/// Must be used from within a tokio runtime.
pub struct ReactorConnectionFactory {
    config: TcpConfig,
    codec: BoxCodec,
    lifecycle: Lifecycle,
    shared: SharedSlot,
}

impl ReactorConnectionFactory {
    /// Creates a stopped factory using the configured codec.
    pub fn new(config: TcpConfig) -> Self {
        let codec = config.codec.build();
        ReactorConnectionFactory {
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
        let conn = ReactorConnection::connect(&self.config, self.codec.clone())
            .await
            .map_err(|err| ConnectionError::connect(self.config.addr(), err))?;
        Ok(Arc::new(conn))
    }
}

impl ConnectionFactory for ReactorConnectionFactory {
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
            debug!(addr = %self.config.addr(), "reactor connection factory started");
        }
    }

    fn stop(&self) {
        if self.lifecycle.stop() {
            self.shared.close();
            debug!(addr = %self.config.addr(), "reactor connection factory stopped");
        }
    }

    fn is_running(&self) -> bool {
        self.lifecycle.is_running()
    }
}

impl fmt::Debug for ReactorConnectionFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReactorConnectionFactory")
            .field("config", &self.config)
            .field("codec", &self.codec)
            .field("running", &self.lifecycle.is_running())
            .finish()
    }
}
