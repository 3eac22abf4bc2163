//! Bounded connection pool.
//!
//! Keeps at most `capacity` live connections. A live connection is idle
//! (owned by the pool), in use (owned by one [`PooledConnection`]) or being
//! established (its slot reserved by an acquirer).
//!
//! ```text
//! acquire(io, timeouts)
//!   → evict bad or expired idle entries, passing their slots to waiters
//!   → newest idle entry      → rebind to io → PooledConnection
//!   → live < capacity        → reserve slot → source.connect(io, connect timeout)
//!   → queue full             → PoolOverflow
//!   → otherwise              → wait for a Grant until the queue deadline
//!                                 Connection → PooledConnection
//!                                 Slot       → source.connect(...)
//! ```
//!
//! All state lives behind one mutex that is never held across an await, so
//! acquirers and releasers on any runtime serialize on it. A connection moves
//! between the idle store, the wait queue and an acquirer only while that
//! lock is held.

mod pooled;
mod queue;

pub use pooled::PooledConnection;

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::error::{ConnectError, Error};
use crate::source::ConnectionSource;
use crate::time::TimeConstraint;
use queue::{Grant, WaitQueue};

/// Configuration for a [`ConnectionPool`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    /// Maximum live connections (default: 10).
    pub capacity: usize,
    /// Maximum acquirers waiting while the pool is at capacity (default: 128).
    pub queue_capacity: usize,
    /// Idle connections older than this are closed instead of reused (default: 60s).
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            queue_capacity: 128,
            idle_timeout: Duration::from_secs(60),
        }
    }
}

/// Per-acquire time limits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolTimeouts {
    /// Limit on establishing a new connection (default: 10s).
    pub connect: Duration,
    /// Limit on waiting in the queue (default: 10s).
    pub queue: Duration,
}

impl Default for PoolTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            queue: Duration::from_secs(10),
        }
    }
}

/// Point-in-time pool statistics.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    /// Connections counted against capacity: idle, in use or being established.
    pub live: usize,
    pub idle: usize,
    /// Live connections not sitting in the idle store.
    pub in_use: usize,
    /// Acquirers currently queued.
    pub waiting: usize,
    /// Connections established by the pool.
    pub created: u64,
    /// Checkouts served by an existing connection.
    pub reused: u64,
    /// Connections closed because they were bad, expired or unbindable.
    pub discarded: u64,
    /// Acquires rejected with `PoolOverflow`.
    pub overflows: u64,
    /// Acquires that failed with `QueueTimeout`.
    pub queue_timeouts: u64,
}

struct IdleEntry<C> {
    conn: C,
    released_at: Instant,
}

struct Shared<C> {
    config: PoolConfig,
    state: Mutex<PoolState<C>>,
}

struct PoolState<C> {
    /// Oldest release at the front.
    idle: VecDeque<IdleEntry<C>>,
    live: usize,
    queue: WaitQueue<C>,
    closed: bool,
    created: u64,
    reused: u64,
    discarded: u64,
    overflows: u64,
    queue_timeouts: u64,
}

impl<C: Connection> PoolState<C> {
    fn new() -> Self {
        Self {
            idle: VecDeque::new(),
            live: 0,
            queue: WaitQueue::new(),
            closed: false,
            created: 0,
            reused: 0,
            discarded: 0,
            overflows: 0,
            queue_timeouts: 0,
        }
    }

    fn discard(&mut self, mut conn: C) {
        if let Err(err) = conn.close() {
            debug!(error = %err, "error closing discarded connection");
        }
        self.discarded += 1;
    }

    /// Hand a freed slot to the oldest waiter, or shrink the live count.
    fn release_slot(&mut self) {
        while let Some(waiter) = self.queue.pop_front() {
            if waiter.tx.send(Grant::Slot).is_ok() {
                debug!(
                    waiter = waiter.id,
                    waited = ?waiter.enqueued_at.elapsed(),
                    "handed free slot to waiter"
                );
                return;
            }
        }
        self.live = self.live.saturating_sub(1);
    }

    /// Take back a connection from its holder.
    fn recycle(&mut self, mut conn: C) {
        if self.closed || conn.is_bad() {
            debug!(closed = self.closed, "discarding returned connection");
            self.discard(conn);
            self.release_slot();
            return;
        }

        while let Some(waiter) = self.queue.pop_front() {
            if let Err(err) = conn.set_executor(waiter.io.clone()) {
                warn!(
                    waiter = waiter.id,
                    error = %err,
                    "cannot rebind connection to waiter runtime, discarding"
                );
                self.discard(conn);
                if waiter.tx.send(Grant::Slot).is_err() {
                    self.release_slot();
                }
                return;
            }
            match waiter.tx.send(Grant::Connection(conn)) {
                Ok(()) => {
                    debug!(
                        waiter = waiter.id,
                        waited = ?waiter.enqueued_at.elapsed(),
                        "handed connection to waiter"
                    );
                    return;
                }
                Err(Grant::Connection(returned)) => conn = returned,
                Err(Grant::Slot) => return,
            }
        }

        self.idle.push_back(IdleEntry {
            conn,
            released_at: Instant::now(),
        });
        debug!(idle = self.idle.len(), "returned connection to idle store");
    }

    /// Close idle entries that are bad or idle longer than `idle_timeout`.
    fn evict_stale(&mut self, idle_timeout: Duration) -> usize {
        let now = Instant::now();
        let mut stale = Vec::new();
        let mut kept = VecDeque::with_capacity(self.idle.len());
        for entry in self.idle.drain(..) {
            if entry.conn.is_bad() || now.duration_since(entry.released_at) > idle_timeout {
                stale.push(entry.conn);
            } else {
                kept.push_back(entry);
            }
        }
        self.idle = kept;

        let count = stale.len();
        for conn in stale {
            self.discard(conn);
            self.release_slot();
        }
        count
    }
}

impl<C: Connection> Shared<C> {
    fn reap_idle(&self) -> usize {
        let mut state = self.state.lock();
        let evicted = state.evict_stale(self.config.idle_timeout);
        if evicted > 0 {
            info!(
                evicted,
                remaining_idle = state.idle.len(),
                live = state.live,
                "reaped idle connections"
            );
        }
        evicted
    }

    fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            capacity: self.config.capacity,
            live: state.live,
            idle: state.idle.len(),
            in_use: state.live.saturating_sub(state.idle.len()),
            waiting: state.queue.len(),
            created: state.created,
            reused: state.reused,
            discarded: state.discarded,
            overflows: state.overflows,
            queue_timeouts: state.queue_timeouts,
        }
    }

    fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

enum Checkout<C: Connection> {
    Idle(C),
    Reserved,
    Queued(Waiting<C>),
}

/// An acquirer's place in the wait queue.
///
/// If dropped before it settles, the waiter leaves the queue, and a grant
/// that already reached it goes back to the pool.
struct Waiting<C: Connection> {
    shared: Arc<Shared<C>>,
    id: u64,
    rx: oneshot::Receiver<Grant<C>>,
    deadline: Option<Instant>,
    settled: bool,
}

impl<C: Connection> Waiting<C> {
    async fn wait(mut self) -> Result<Grant<C>, Error> {
        let received = match self.deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, &mut self.rx).await.ok(),
            None => Some((&mut self.rx).await),
        };
        let outcome = match received {
            Some(Ok(grant)) => Ok(grant),
            // Sender dropped without a grant: the queue was closed.
            Some(Err(_)) => Err(Error::PoolClosed),
            None => self.expire(),
        };
        self.settled = true;
        outcome
    }

    fn expire(&mut self) -> Result<Grant<C>, Error> {
        let mut state = self.shared.state.lock();
        if state.queue.remove(self.id) {
            state.queue_timeouts += 1;
            warn!(waiter = self.id, "timed out waiting for a pooled connection");
            return Err(Error::QueueTimeout);
        }
        // Granted after the timer fired but before the lock was taken.
        self.rx.try_recv().map_err(|_| Error::PoolClosed)
    }
}

impl<C: Connection> Drop for Waiting<C> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut state = self.shared.state.lock();
        if state.queue.remove(self.id) {
            debug!(waiter = self.id, "waiter abandoned");
            return;
        }
        match self.rx.try_recv() {
            Ok(Grant::Connection(conn)) => state.recycle(conn),
            Ok(Grant::Slot) => state.release_slot(),
            Err(_) => {}
        }
    }
}

/// A reserved live slot. Freed on drop unless a connection filled it.
struct Reservation<C: Connection> {
    shared: Arc<Shared<C>>,
    committed: bool,
}

impl<C: Connection> Reservation<C> {
    fn new(shared: Arc<Shared<C>>) -> Self {
        Self {
            shared,
            committed: false,
        }
    }

    fn commit(mut self) {
        self.committed = true;
        self.shared.state.lock().created += 1;
    }
}

impl<C: Connection> Drop for Reservation<C> {
    fn drop(&mut self) {
        if !self.committed {
            self.shared.state.lock().release_slot();
        }
    }
}

/// A bounded pool of connections manufactured by a [`ConnectionSource`].
///
/// Cloning the pool yields another handle to the same state.
pub struct ConnectionPool<S: ConnectionSource> {
    shared: Arc<Shared<S::Connection>>,
    source: Arc<S>,
}

impl<S: ConnectionSource> Clone for ConnectionPool<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            source: Arc::clone(&self.source),
        }
    }
}

impl<S: ConnectionSource> ConnectionPool<S> {
    pub fn new(source: S, config: PoolConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(PoolState::new()),
            }),
            source: Arc::new(source),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Acquire a connection bound to `io`.
    ///
    /// Reuses the most recently released healthy idle connection, otherwise
    /// establishes a new one within `timeouts.connect` if the pool has room,
    /// otherwise waits in the queue for up to `timeouts.queue`.
    ///
    /// A failed handshake returns its connection inside the error; it is not
    /// pooled. Dropping the returned future at any point gives back whatever
    /// slot or connection it held.
    pub async fn acquire(
        &self,
        io: &Handle,
        timeouts: PoolTimeouts,
    ) -> Result<PooledConnection<S::Connection>, ConnectError<S::Connection>> {
        match self.checkout(io, timeouts.queue)? {
            Checkout::Idle(conn) => return Ok(PooledConnection::new(Arc::clone(&self.shared), conn)),
            Checkout::Reserved => {}
            Checkout::Queued(waiting) => match waiting.wait().await? {
                Grant::Connection(conn) => {
                    self.shared.state.lock().reused += 1;
                    return Ok(PooledConnection::new(Arc::clone(&self.shared), conn));
                }
                Grant::Slot => {}
            },
        }
        self.establish(io, timeouts.connect).await
    }

    fn checkout(&self, io: &Handle, queue_timeout: Duration) -> Result<Checkout<S::Connection>, Error> {
        let config = &self.shared.config;
        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(Error::PoolClosed);
        }

        let evicted = state.evict_stale(config.idle_timeout);
        if evicted > 0 {
            debug!(evicted, "evicted stale idle connections");
        }

        while let Some(entry) = state.idle.pop_back() {
            let mut conn = entry.conn;
            match conn.set_executor(io.clone()) {
                Ok(()) => {
                    state.reused += 1;
                    debug!(idle = state.idle.len(), live = state.live, "reused idle connection");
                    return Ok(Checkout::Idle(conn));
                }
                Err(err) => {
                    warn!(error = %err, "cannot rebind idle connection, discarding");
                    state.discard(conn);
                    state.release_slot();
                }
            }
        }

        if state.live < config.capacity {
            state.live += 1;
            return Ok(Checkout::Reserved);
        }

        if state.queue.is_full(config.queue_capacity) {
            state.overflows += 1;
            warn!(
                capacity = config.capacity,
                queue_capacity = config.queue_capacity,
                "connection pool overflow"
            );
            return Err(Error::PoolOverflow);
        }

        let (id, rx) = state.queue.push(io.clone());
        debug!(waiter = id, waiting = state.queue.len(), "waiting for a pooled connection");
        Ok(Checkout::Queued(Waiting {
            shared: Arc::clone(&self.shared),
            id,
            rx,
            deadline: Instant::now().checked_add(queue_timeout),
            settled: false,
        }))
    }

    async fn establish(
        &self,
        io: &Handle,
        connect_timeout: Duration,
    ) -> Result<PooledConnection<S::Connection>, ConnectError<S::Connection>> {
        let reservation = Reservation::new(Arc::clone(&self.shared));
        match self
            .source
            .connect(io, TimeConstraint::Duration(connect_timeout))
            .await
        {
            Ok(conn) => {
                reservation.commit();
                debug!("created new pooled connection");
                Ok(PooledConnection::new(Arc::clone(&self.shared), conn))
            }
            Err(err) => {
                drop(reservation);
                debug!(
                    error = %err,
                    context = err.context().unwrap_or_default(),
                    "connection establishment failed"
                );
                Err(err)
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        self.shared.stats()
    }

    /// Close idle connections that are bad or expired. Returns how many.
    pub fn reap_idle(&self) -> usize {
        self.shared.reap_idle()
    }

    /// Run [`reap_idle`](Self::reap_idle) every `period` on `io`.
    ///
    /// The task ends once the pool is closed or its last handle (including
    /// checked-out connections) is dropped.
    pub fn spawn_reaper(&self, io: &Handle, period: Duration) -> JoinHandle<()> {
        let period = period.max(Duration::from_millis(1));
        let shared = Arc::downgrade(&self.shared);
        io.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                if shared.is_closed() {
                    break;
                }
                shared.reap_idle();
            }
            debug!("idle reaper stopped");
        })
    }

    /// Shut the pool down.
    ///
    /// Queued acquirers fail with `PoolClosed`, idle connections are closed,
    /// connections still in use are closed when released, and later acquires
    /// fail with `PoolClosed`.
    pub fn close(&self) {
        let mut state = self.shared.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        let waiters = state.queue.close();
        let idle: Vec<_> = state.idle.drain(..).collect();
        let idle_closed = idle.len();
        for entry in idle {
            state.discard(entry.conn);
            state.live = state.live.saturating_sub(1);
        }
        info!(
            idle_closed,
            waiters_failed = waiters,
            live = state.live,
            "connection pool closed"
        );
    }

    /// Log pool statistics at `tracing::info` level.
    pub fn log_stats(&self) {
        let stats = self.stats();
        info!(
            capacity = stats.capacity,
            live = stats.live,
            idle = stats.idle,
            in_use = stats.in_use,
            waiting = stats.waiting,
            created = stats.created,
            reused = stats.reused,
            discarded = stats.discarded,
            overflows = stats.overflows,
            queue_timeouts = stats.queue_timeouts,
            "pool statistics"
        );
    }
}

impl<S: ConnectionSource> fmt::Debug for ConnectionPool<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.shared.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
