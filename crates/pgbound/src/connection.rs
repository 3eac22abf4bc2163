//! The connection contract consumed by the handshake and the pool.

use std::future::Future;
use std::io;
use std::pin::Pin;

use tokio::runtime::Handle;

use crate::error::Error;

pub use pgbound_libpq::PollingStatus;

/// Boxed readiness wait, registered with the connection's bound runtime.
pub type WaitFuture<'a> = Pin<Box<dyn Future<Output = io::Result<()>> + Send + 'a>>;

/// A database session that the pool can own, rebind and health-check.
///
/// Every connection is bound to one execution context (a tokio runtime
/// [`Handle`]). Readiness waits complete on that runtime's I/O driver.
pub trait Connection: Send + 'static {
    /// The native session handle.
    type Native: Send;
    /// Per-connection type-OID cache. Opaque to this crate.
    type OidMap: Send;

    fn native_handle(&self) -> Option<&Self::Native>;

    /// Install a native handle, replacing (and finishing) any previous one.
    fn assign(&mut self, native: Self::Native) -> Result<(), Error>;

    fn oid_map(&self) -> &Self::OidMap;
    fn oid_map_mut(&mut self) -> &mut Self::OidMap;

    /// Human-readable detail about the last failure on this connection.
    fn error_context(&self) -> &str;
    fn set_error_context(&mut self, context: String);

    fn executor(&self) -> &Handle;

    /// Rebind readiness notifications to another runtime.
    ///
    /// Only called while no wait is pending on the connection.
    fn set_executor(&mut self, io: Handle) -> Result<(), Error>;

    /// Resolve once the socket is writable.
    fn wait_write(&mut self) -> WaitFuture<'_>;

    /// Resolve once the socket is readable.
    fn wait_read(&mut self) -> WaitFuture<'_>;

    /// Shut the session down and release its socket.
    fn close(&mut self) -> Result<(), Error>;

    /// Abandon outstanding readiness registrations on the socket.
    fn cancel(&mut self);

    /// True when the session must not be reused.
    fn is_bad(&self) -> bool;

    fn is_open(&self) -> bool {
        self.native_handle().is_some()
    }
}

/// The nonblocking handshake primitives of a native driver.
pub trait Connect: Connection {
    /// Begin the handshake towards `conninfo` without blocking.
    fn start_connection(&mut self, conninfo: &str) -> Result<(), Error>;

    /// Register the session's socket with the bound runtime.
    fn assign_socket(&mut self) -> Result<(), Error>;

    /// Advance the handshake by one step.
    fn connect_poll(&mut self) -> PollingStatus;

    /// The native driver's last error message, empty if none.
    fn error_message(&self) -> String;
}
