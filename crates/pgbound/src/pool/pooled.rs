//! The handle an acquirer holds while it uses a pooled connection.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use super::Shared;
use crate::connection::Connection;

/// A connection checked out of a [`ConnectionPool`](super::ConnectionPool).
///
/// Dropping the handle returns the connection to the pool: a healthy one goes
/// to the oldest waiter or the idle store, a bad one is closed and its slot
/// freed.
pub struct PooledConnection<C: Connection> {
    shared: Arc<Shared<C>>,
    conn: Option<C>,
}

impl<C: Connection> PooledConnection<C> {
    pub(super) fn new(shared: Arc<Shared<C>>, conn: C) -> Self {
        Self {
            shared,
            conn: Some(conn),
        }
    }

    /// Return the connection to the pool now.
    pub fn release(self) {
        drop(self);
    }

    /// Take the connection out of the pool for good.
    ///
    /// The pool frees the connection's slot; the caller owns the session.
    pub fn detach(mut self) -> C {
        let conn = self.conn.take().expect("connection exists");
        self.shared.state.lock().release_slot();
        conn
    }
}

impl<C: Connection> Deref for PooledConnection<C> {
    type Target = C;

    fn deref(&self) -> &C {
        // Only `detach` and `drop` take the connection, and both consume the handle.
        self.conn.as_ref().expect("connection exists")
    }
}

impl<C: Connection> DerefMut for PooledConnection<C> {
    fn deref_mut(&mut self) -> &mut C {
        self.conn.as_mut().expect("connection exists")
    }
}

impl<C: Connection> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.shared.state.lock().recycle(conn);
        }
    }
}

impl<C: Connection + fmt::Debug> fmt::Debug for PooledConnection<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("conn", &self.conn)
            .finish()
    }
}
