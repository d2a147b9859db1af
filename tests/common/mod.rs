#![allow(dead_code)]

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use bytes::Bytes;
use futures::{future::BoxFuture, FutureExt};
use tcpgate::{
    codec::{CodecConfig, CrLfCodec},
    connection::{CloseReason, Connection, ConnectionId, ConnectionListener, SharedConnection},
    error::{ConnectionError, SendError},
    factory::ConnectionFactory,
    TcpConfig,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    task::JoinHandle,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("tcpgate=debug")
        .with_test_writer()
        .try_init();
}

/// Socket settings for the line-oriented test servers.
pub fn tcp_config(addr: SocketAddr) -> TcpConfig {
    TcpConfig::new(addr.ip().to_string(), addr.port()).codec(CodecConfig::CrLf {
        max_frame_len: CrLfCodec::DEFAULT_MAX_FRAME_LEN,
    })
}

/// How a test server treats each connection.
#[derive(Clone, Copy, Debug)]
pub enum Behavior {
    /// Answers every line with `Reply<n>`, `n` counting across all connections.
    Echo,
    /// Like `Echo`, but waits before answering the first line of each connection.
    DelayFirst(Duration),
    /// Reads one line, then closes the socket.
    CloseOnRead,
    /// Reads forever and never answers.
    Silent,
    /// Answers `Test<n>` with `Reply<n>`, so each reply names the request it belongs to.
    Mirror,
}

pub struct TestServer {
    pub addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
    handle: JoinHandle<()>,
}

impl TestServer {
    pub async fn start(behavior: Behavior) -> TestServer {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind test server");
        let addr = listener.local_addr().expect("test server has no address");
        let accepted = Arc::new(AtomicUsize::new(0));
        let replies = Arc::new(AtomicUsize::new(0));

        let handle = tokio::spawn({
            let accepted = accepted.clone();
            async move {
                while let Ok((socket, _)) = listener.accept().await {
                    accepted.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(serve(socket, behavior, replies.clone()));
                }
            }
        });

        TestServer {
            addr,
            accepted,
            handle,
        }
    }

    /// Number of connections accepted so far.
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    pub fn tcp_config(&self) -> TcpConfig {
        tcp_config(self.addr)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn serve(socket: TcpStream, behavior: Behavior, replies: Arc<AtomicUsize>) {
    let (read_half, mut write_half) = socket.into_split();
    let mut lines = BufReader::new(read_half).lines();
    let mut first = true;
    while let Ok(Some(line)) = lines.next_line().await {
        match behavior {
            Behavior::Mirror => {
                let reply = format!("Reply{}\r\n", line.trim_start_matches("Test"));
                if write_half.write_all(reply.as_bytes()).await.is_err() {
                    return;
                }
                continue;
            }
            Behavior::Echo => {}
            Behavior::DelayFirst(delay) => {
                if first {
                    tokio::time::sleep(delay).await;
                }
            }
            Behavior::CloseOnRead => return,
            Behavior::Silent => continue,
        }
        first = false;
        let n = replies.fetch_add(1, Ordering::SeqCst);
        if write_half
            .write_all(format!("Reply{n}\r\n").as_bytes())
            .await
            .is_err()
        {
            return;
        }
    }
}

/// A connection whose sends always fail.
#[derive(Debug)]
pub struct BrokenConnection {
    id: ConnectionId,
    open: AtomicBool,
    sends: Arc<AtomicUsize>,
    listener: Mutex<Option<ConnectionListener>>,
}

impl Connection for BrokenConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn is_single_use(&self) -> bool {
        false
    }

    fn send(&self, _payload: Bytes) -> BoxFuture<'_, Result<(), SendError>> {
        async move {
            self.sends.fetch_add(1, Ordering::SeqCst);
            self.close();
            Err(SendError::new(
                self.id,
                std::io::Error::from(std::io::ErrorKind::BrokenPipe),
            ))
        }
        .boxed()
    }

    fn register_listener(&self, listener: ConnectionListener) {
        *self.listener.lock().unwrap() = Some(listener);
    }

    fn detach_listener(&self) {
        self.listener.lock().unwrap().take();
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            if let Some(listener) = self.listener.lock().unwrap().take() {
                listener.on_close(CloseReason::Local);
            }
        }
    }
}

/// A factory handing out [`BrokenConnection`]s, counting every send attempted on them.
#[derive(Debug, Default)]
pub struct BrokenFactory {
    running: AtomicBool,
    sends: Arc<AtomicUsize>,
}

impl BrokenFactory {
    pub fn sends(&self) -> usize {
        self.sends.load(Ordering::SeqCst)
    }
}

impl ConnectionFactory for BrokenFactory {
    fn get_connection(&self) -> BoxFuture<'_, Result<SharedConnection, ConnectionError>> {
        async move {
            if !self.running.load(Ordering::SeqCst) {
                return Err(ConnectionError::Stopped);
            }
            let conn: SharedConnection = Arc::new(BrokenConnection {
                id: ConnectionId::next(),
                open: AtomicBool::new(true),
                sends: self.sends.clone(),
                listener: Mutex::new(None),
            });
            Ok(conn)
        }
        .boxed()
    }

    fn is_single_use(&self) -> bool {
        false
    }

    fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
