//! pgbound: connection acquisition for an asynchronous Postgres client.
//!
//! Two layers:
//!
//! - **Establishment.** [`HandshakeOperation`] drives a nonblocking
//!   handshake over a [`Connect`] implementation, waiting for socket
//!   readiness on the connection's bound tokio runtime. [`BoundedConnector`]
//!   races that handshake against a deadline.
//! - **Pooling.** [`ConnectionPool`] keeps at most `capacity` live
//!   connections, an idle store ordered by release time, and a bounded FIFO
//!   queue of acquirers waiting for a connection to come back.
//!
//! ```text
//! acquire(io, timeouts)
//!   → healthy idle connection   → rebind to io → PooledConnection
//!   → free slot                 → source.connect(io, connect timeout)
//!   → pool full, queue has room → wait (queue timeout) for a connection or slot
//!   → pool full, queue full     → PoolOverflow
//! ```
//!
//! An *execution context* is a [`tokio::runtime::Handle`]. Each connection is
//! bound to one; its readiness waits are registered with that runtime's I/O
//! driver, and the pool rebinds a connection only while it owns it.

pub mod config;
pub mod connection;
pub mod connector;
pub mod error;
pub mod handshake;
#[cfg(unix)]
pub mod pg;
pub mod pool;
pub mod source;
#[cfg(any(test, feature = "testkit"))]
pub mod testkit;
pub mod time;

pub use config::Settings;
pub use connection::{Connect, Connection, PollingStatus, WaitFuture};
pub use connector::BoundedConnector;
pub use error::{ConnectError, Error};
pub use handshake::{HandshakeOperation, HandshakeState};
#[cfg(unix)]
pub use pg::{PgConnection, PgFactory};
pub use pool::{ConnectionPool, PoolConfig, PoolStats, PoolTimeouts, PooledConnection};
pub use source::{ConnectFuture, ConnectionFactory, ConnectionInfo, ConnectionProvider, ConnectionSource};
pub use time::TimeConstraint;
