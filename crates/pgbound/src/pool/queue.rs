//! FIFO queue of acquirers waiting for a connection or a free slot.

use std::collections::VecDeque;

use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// What a waiter receives when it reaches the front of the queue.
pub(crate) enum Grant<C> {
    /// A healthy connection, already rebound to the waiter's runtime.
    Connection(C),
    /// A live slot freed by a discarded connection or failed handshake.
    /// The waiter must establish a connection itself.
    Slot,
}

pub(crate) struct Waiter<C> {
    pub(crate) id: u64,
    pub(crate) tx: oneshot::Sender<Grant<C>>,
    /// Runtime the waiter's connection must be bound to.
    pub(crate) io: Handle,
    pub(crate) enqueued_at: Instant,
}

pub(crate) struct WaitQueue<C> {
    waiters: VecDeque<Waiter<C>>,
    next_id: u64,
}

impl<C> WaitQueue<C> {
    pub(crate) fn new() -> Self {
        Self {
            waiters: VecDeque::new(),
            next_id: 1,
        }
    }

    /// Append a waiter bound to `io`.
    pub(crate) fn push(&mut self, io: Handle) -> (u64, oneshot::Receiver<Grant<C>>) {
        let (tx, rx) = oneshot::channel();
        let id = self.next_id;
        self.next_id += 1;
        self.waiters.push_back(Waiter {
            id,
            tx,
            io,
            enqueued_at: Instant::now(),
        });
        (id, rx)
    }

    /// Remove a waiter, keeping the others in order. False if it was
    /// already granted or dropped.
    pub(crate) fn remove(&mut self, id: u64) -> bool {
        match self.waiters.iter().position(|w| w.id == id) {
            Some(index) => {
                self.waiters.remove(index);
                true
            }
            None => false,
        }
    }

    /// Oldest waiter whose acquirer is still listening.
    pub(crate) fn pop_front(&mut self) -> Option<Waiter<C>> {
        while let Some(waiter) = self.waiters.pop_front() {
            if !waiter.tx.is_closed() {
                return Some(waiter);
            }
        }
        None
    }

    /// Whether another waiter would exceed `capacity`. Abandoned waiters
    /// are pruned first and do not count.
    pub(crate) fn is_full(&mut self, capacity: usize) -> bool {
        self.waiters.retain(|w| !w.tx.is_closed());
        self.waiters.len() >= capacity
    }

    pub(crate) fn len(&self) -> usize {
        self.waiters.iter().filter(|w| !w.tx.is_closed()).count()
    }

    /// Drop every waiter. Their receivers observe a closed channel.
    pub(crate) fn close(&mut self) -> usize {
        let count = self.waiters.len();
        self.waiters.clear();
        count
    }
}
