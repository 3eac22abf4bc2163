//! Error domain for connection establishment and pooling.

use std::fmt;
use std::io;

use pgbound_libpq::PgError;

use crate::connection::Connection;

/// Failure kinds reported by the handshake, the connector and the pool.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The native layer refused to begin a handshake.
    #[error("connection handshake could not be started")]
    HandshakeStartFailed,

    /// The native status was bad immediately after the handshake started.
    #[error("connection status is bad after handshake start")]
    HandshakeStatusBad,

    /// Advancing the handshake reported failure.
    #[error("connection handshake failed")]
    HandshakePollFailed,

    /// The handshake did not finish before its deadline.
    #[error("connection was not established before the deadline")]
    ConnectTimeout,

    /// The pool is at capacity and its wait queue is full.
    #[error("connection pool wait queue is full")]
    PoolOverflow,

    /// No connection became available before the queue deadline.
    #[error("timed out waiting for a pooled connection")]
    QueueTimeout,

    /// The pool was closed before or while the caller waited.
    #[error("connection pool is closed")]
    PoolClosed,

    /// The task running the operation was dropped by its runtime.
    #[error("connection operation was aborted")]
    Aborted,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("native driver error: {0}")]
    Native(String),
}

impl Error {
    /// Errors after which the connection must not be reused.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            Error::HandshakeStartFailed
                | Error::HandshakeStatusBad
                | Error::HandshakePollFailed
                | Error::ConnectTimeout
                | Error::Io(_)
                | Error::Native(_)
        )
    }

    /// Errors caused by pool limits or lifecycle rather than by a connection.
    pub fn is_resource(&self) -> bool {
        matches!(
            self,
            Error::PoolOverflow | Error::QueueTimeout | Error::PoolClosed | Error::Aborted
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::ConnectTimeout | Error::QueueTimeout)
    }
}

impl From<PgError> for Error {
    fn from(err: PgError) -> Self {
        Error::Native(err.to_string())
    }
}

/// An [`Error`] delivered together with the connection it happened on.
///
/// Handshake and timeout failures hand the connection back so the caller can
/// read its error context. Resource failures (overflow, queue timeout) carry
/// no connection.
pub struct ConnectError<C> {
    error: Error,
    connection: Option<C>,
}

impl<C> ConnectError<C> {
    pub fn new(error: Error, connection: C) -> Self {
        Self {
            error,
            connection: Some(connection),
        }
    }

    /// An error with no connection attached.
    pub fn resource(error: Error) -> Self {
        Self {
            error,
            connection: None,
        }
    }

    pub fn error(&self) -> &Error {
        &self.error
    }

    pub fn connection(&self) -> Option<&C> {
        self.connection.as_ref()
    }

    pub fn into_connection(self) -> Option<C> {
        self.connection
    }

    pub fn into_parts(self) -> (Error, Option<C>) {
        (self.error, self.connection)
    }
}

impl<C: Connection> ConnectError<C> {
    /// Error context of the attached connection, if any and non-empty.
    pub fn context(&self) -> Option<&str> {
        self.connection
            .as_ref()
            .map(|conn| conn.error_context())
            .filter(|ctx| !ctx.is_empty())
    }
}

impl<C> From<Error> for ConnectError<C> {
    fn from(error: Error) -> Self {
        Self::resource(error)
    }
}

impl<C> fmt::Debug for ConnectError<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectError")
            .field("error", &self.error)
            .field("has_connection", &self.connection.is_some())
            .finish()
    }
}

impl<C> fmt::Display for ConnectError<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.error, f)
    }
}

impl<C> std::error::Error for ConnectError<C> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}
