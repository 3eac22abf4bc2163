//! Connection sources: where the pool gets new connections from.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::runtime::Handle;

use crate::connection::{Connect, Connection};
use crate::connector::BoundedConnector;
use crate::error::ConnectError;
use crate::time::TimeConstraint;

/// Boxed future alias for connection source results.
pub type ConnectFuture<'a, C> = Pin<Box<dyn Future<Output = Result<C, ConnectError<C>>> + Send + 'a>>;

/// Manufactures established connections bound to a given runtime.
pub trait ConnectionSource: Send + Sync + 'static {
    type Connection: Connection;

    /// Establish a new connection whose readiness waits run on `io`.
    fn connect<'a>(
        &'a self,
        io: &'a Handle,
        constraint: TimeConstraint,
    ) -> ConnectFuture<'a, Self::Connection>;
}

/// Creates empty, unconnected connection objects.
///
/// Injected into [`ConnectionInfo`] so tests can substitute scripted
/// connections for libpq ones.
pub trait ConnectionFactory: Send + Sync + 'static {
    type Connection: Connect;

    fn create(&self, io: &Handle) -> Self::Connection;
}

impl<F: ConnectionFactory> ConnectionFactory for Arc<F> {
    type Connection = F::Connection;

    fn create(&self, io: &Handle) -> Self::Connection {
        (**self).create(io)
    }
}

/// A conninfo string paired with a connection factory.
///
/// Each `connect` creates a fresh connection and runs it through a
/// [`BoundedConnector`].
pub struct ConnectionInfo<F> {
    conninfo: String,
    factory: F,
}

impl<F: ConnectionFactory> ConnectionInfo<F> {
    pub fn new(conninfo: impl Into<String>, factory: F) -> Self {
        Self {
            conninfo: conninfo.into(),
            factory,
        }
    }

    pub fn conninfo(&self) -> &str {
        &self.conninfo
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }
}

#[cfg(unix)]
impl ConnectionInfo<crate::pg::PgFactory> {
    /// A source producing libpq connections.
    pub fn pg(conninfo: impl Into<String>) -> Self {
        Self::new(conninfo, crate::pg::PgFactory)
    }
}

impl<F: ConnectionFactory> ConnectionSource for ConnectionInfo<F> {
    type Connection = F::Connection;

    fn connect<'a>(
        &'a self,
        io: &'a Handle,
        constraint: TimeConstraint,
    ) -> ConnectFuture<'a, Self::Connection> {
        let conn = self.factory.create(io);
        let target = self.conninfo.clone();
        Box::pin(async move { BoundedConnector::new(constraint).create(conn, target).await })
    }
}

// Conninfo strings may carry passwords.
impl<F> fmt::Debug for ConnectionInfo<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionInfo").finish_non_exhaustive()
    }
}

/// A [`ConnectionSource`] bound to one execution context.
#[derive(Debug)]
pub struct ConnectionProvider<S> {
    source: S,
    io: Handle,
}

impl<S: ConnectionSource> ConnectionProvider<S> {
    pub fn new(source: S, io: Handle) -> Self {
        Self { source, io }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn executor(&self) -> &Handle {
        &self.io
    }

    /// Establish a connection on this provider's runtime.
    ///
    /// A successful connection starts with an empty error context.
    pub async fn get_connection(
        &self,
        constraint: TimeConstraint,
    ) -> Result<S::Connection, ConnectError<S::Connection>> {
        let mut conn = self.source.connect(&self.io, constraint).await?;
        conn.set_error_context(String::new());
        Ok(conn)
    }
}
