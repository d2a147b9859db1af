//! The output queue replies are emitted on by
//! [`OutboundGateway::handle_message`](crate::gateway::OutboundGateway::handle_message).
//!
//! Delivery is FIFO and unbounded. The receiving side can be polled directly or consumed as a
//! [`Stream`](futures::Stream).

use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Creates a connected reply channel and receiver.
pub fn reply_channel() -> (ReplyChannel, ReplyReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ReplyChannel { tx }, ReplyReceiver { rx })
}

/// The sending half of a reply channel.
#[derive(Clone, Debug)]
pub struct ReplyChannel {
    tx: mpsc::UnboundedSender<Bytes>,
}

impl ReplyChannel {
    /// Enqueues a reply. Returns `false` if the receiver has been dropped.
    pub fn send(&self, reply: Bytes) -> bool {
        self.tx.send(reply).is_ok()
    }

    /// Returns `true` if the receiver has been dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// The receiving half of a reply channel.
#[derive(Debug)]
pub struct ReplyReceiver {
    rx: mpsc::UnboundedReceiver<Bytes>,
}

impl ReplyReceiver {
    /// Waits for the next reply. Returns `None` once every sender is gone and the queue is empty.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Waits up to `timeout` for the next reply.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<Bytes> {
        tokio::time::timeout(timeout, self.rx.recv())
            .await
            .ok()
            .flatten()
    }

    /// Takes the next reply if one is queued.
    pub fn try_recv(&mut self) -> Option<Bytes> {
        self.rx.try_recv().ok()
    }

    /// Converts the receiver into a stream of replies.
    pub fn into_stream(self) -> UnboundedReceiverStream<Bytes> {
        UnboundedReceiverStream::new(self.rx)
    }
}
