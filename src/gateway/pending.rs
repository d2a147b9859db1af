//! Pending replies, queued per connection in send order.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Instant,
};

use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::trace;

use crate::{connection::ConnectionId, error::GatewayError};

pub(crate) type ReplyResult = Result<Bytes, GatewayError>;

#[derive(Debug)]
struct PendingSlot {
    id: u64,
    registered_at: Instant,
    tx: oneshot::Sender<ReplyResult>,
}

/// Requests awaiting a reply, queued per connection in send order.
///
/// Replies carry no correlation token: a reply completes whatever slot is at the head of its
/// connection's queue when it arrives.
#[derive(Debug, Default)]
pub(crate) struct PendingReplies {
    queues: Mutex<HashMap<ConnectionId, VecDeque<PendingSlot>>>,
    next_slot: AtomicU64,
}

impl PendingReplies {
    fn lock(&self) -> MutexGuard<'_, HashMap<ConnectionId, VecDeque<PendingSlot>>> {
        self.queues.lock().unwrap_or_else(|err| err.into_inner())
    }

    /// Appends a slot to `connection`'s queue.
    ///
    /// The slot is evicted when the returned guard drops, unless a reply or failure consumed it
    /// first.
    pub(crate) fn register(
        self: &Arc<Self>,
        connection: ConnectionId,
    ) -> (SlotGuard, oneshot::Receiver<ReplyResult>) {
        let id = self.next_slot.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.lock()
            .entry(connection)
            .or_default()
            .push_back(PendingSlot {
                id,
                registered_at: Instant::now(),
                tx,
            });
        let guard = SlotGuard {
            pending: self.clone(),
            connection,
            slot: id,
        };
        (guard, rx)
    }

    /// Completes the head of `connection`'s queue. Returns `false` if nothing was pending.
    pub(crate) fn complete_head(&self, connection: ConnectionId, reply: Bytes) -> bool {
        let slot = {
            let mut queues = self.lock();
            let Some(queue) = queues.get_mut(&connection) else {
                return false;
            };
            let slot = queue.pop_front();
            if queue.is_empty() {
                queues.remove(&connection);
            }
            slot
        };
        match slot {
            Some(slot) => {
                trace!(
                    %connection,
                    slot = slot.id,
                    elapsed = ?slot.registered_at.elapsed(),
                    "reply correlated"
                );
                let _ = slot.tx.send(Ok(reply));
                true
            }
            None => false,
        }
    }

    /// Fails every slot queued on `connection`. Returns how many were failed.
    pub(crate) fn fail_all(&self, connection: ConnectionId, err: &GatewayError) -> usize {
        let Some(queue) = self.lock().remove(&connection) else {
            return 0;
        };
        let failed = queue.len();
        for slot in queue {
            let _ = slot.tx.send(Err(err.clone()));
        }
        failed
    }

    /// Removes one slot wherever it sits in its queue. Returns `false` if it was already gone.
    pub(crate) fn evict(&self, connection: ConnectionId, slot: u64) -> bool {
        let mut queues = self.lock();
        let Some(queue) = queues.get_mut(&connection) else {
            return false;
        };
        let Some(position) = queue.iter().position(|pending| pending.id == slot) else {
            return false;
        };
        queue.remove(position);
        if queue.is_empty() {
            queues.remove(&connection);
        }
        trace!(%connection, slot, "pending reply evicted");
        true
    }

    /// Total number of pending slots across every connection.
    pub(crate) fn len(&self) -> usize {
        self.lock().values().map(VecDeque::len).sum()
    }
}

/// Evicts its slot on drop, so an abandoned wait never leaves a slot behind.
#[derive(Debug)]
pub(crate) struct SlotGuard {
    pending: Arc<PendingReplies>,
    connection: ConnectionId,
    slot: u64,
}

impl SlotGuard {
    /// Evicts the slot now. Returns `false` if a reply or failure already consumed it.
    pub(crate) fn evict(&self) -> bool {
        self.pending.evict(self.connection, self.slot)
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.evict();
    }
}
