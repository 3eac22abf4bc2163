//! libpq-backed connections.
//!
//! [`PgConnection`] implements [`Connect`] over `pgbound-libpq`. The libpq
//! socket is registered with the bound runtime's reactor through
//! [`AsyncFd`]; libpq itself never blocks because the connection is started
//! with `PQconnectStart` and advanced with `PQconnectPoll`.

use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, RawFd};

use pgbound_libpq::{ConnStatus, PgConn};
use tokio::io::Interest;
use tokio::io::unix::AsyncFd;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::connection::{Connect, Connection, PollingStatus, WaitFuture};
use crate::error::Error;
use crate::source::ConnectionFactory;

/// Type name to OID cache attached to each connection.
pub type OidMap = HashMap<String, u32>;

/// A libpq socket owned by the `PGconn`. Never closed from this side.
#[derive(Debug)]
struct PgSocket(RawFd);

impl AsRawFd for PgSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

/// A Postgres session driven by libpq's nonblocking API.
pub struct PgConnection {
    // Deregistered before `native` finishes and closes the descriptor.
    socket: Option<AsyncFd<PgSocket>>,
    native: Option<PgConn>,
    io: Handle,
    error_context: String,
    oid_map: OidMap,
}

impl PgConnection {
    /// An unconnected session bound to `io`.
    pub fn new(io: Handle) -> Self {
        Self {
            socket: None,
            native: None,
            io,
            error_context: String::new(),
            oid_map: OidMap::new(),
        }
    }

    pub fn database(&self) -> String {
        self.native.as_ref().map(PgConn::database).unwrap_or_default()
    }

    pub fn host(&self) -> String {
        self.native.as_ref().map(PgConn::host).unwrap_or_default()
    }

    pub fn port(&self) -> String {
        self.native.as_ref().map(PgConn::port).unwrap_or_default()
    }

    pub fn user(&self) -> String {
        self.native.as_ref().map(PgConn::user).unwrap_or_default()
    }

    pub fn server_version(&self) -> i32 {
        self.native.as_ref().map_or(0, PgConn::server_version)
    }

    pub fn backend_pid(&self) -> i32 {
        self.native.as_ref().map_or(0, PgConn::backend_pid)
    }

    /// Register libpq's current socket with the bound runtime.
    fn register(&mut self) -> Result<(), Error> {
        let fd = self
            .native
            .as_ref()
            .and_then(PgConn::socket)
            .ok_or_else(|| Error::Native("connection has no socket".into()))?;
        self.register_fd(fd)
    }

    /// Drop any previous registration and register `fd` afresh.
    fn register_fd(&mut self, fd: RawFd) -> Result<(), Error> {
        self.socket = None;
        let _guard = self.io.enter();
        let socket = AsyncFd::with_interest(PgSocket(fd), Interest::READABLE | Interest::WRITABLE)?;
        self.socket = Some(socket);
        Ok(())
    }

    fn registered_fd(&self) -> Option<RawFd> {
        self.socket.as_ref().map(|s| s.get_ref().0)
    }
}

fn not_registered() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "socket is not registered with a runtime")
}

impl Connection for PgConnection {
    type Native = PgConn;
    type OidMap = OidMap;

    fn native_handle(&self) -> Option<&PgConn> {
        self.native.as_ref()
    }

    fn assign(&mut self, native: PgConn) -> Result<(), Error> {
        self.socket = None;
        let has_socket = native.socket().is_some();
        self.native = Some(native);
        if has_socket {
            self.register()?;
        }
        Ok(())
    }

    fn oid_map(&self) -> &OidMap {
        &self.oid_map
    }

    fn oid_map_mut(&mut self) -> &mut OidMap {
        &mut self.oid_map
    }

    fn error_context(&self) -> &str {
        &self.error_context
    }

    fn set_error_context(&mut self, context: String) {
        self.error_context = context;
    }

    fn executor(&self) -> &Handle {
        &self.io
    }

    fn set_executor(&mut self, io: Handle) -> Result<(), Error> {
        self.io = io;
        if self.socket.is_some() {
            self.register()?;
        }
        Ok(())
    }

    fn wait_write(&mut self) -> WaitFuture<'_> {
        Box::pin(async move {
            let socket = self.socket.as_ref().ok_or_else(not_registered)?;
            let mut ready = socket.writable().await?;
            ready.clear_ready();
            Ok(())
        })
    }

    fn wait_read(&mut self) -> WaitFuture<'_> {
        Box::pin(async move {
            let socket = self.socket.as_ref().ok_or_else(not_registered)?;
            let mut ready = socket.readable().await?;
            ready.clear_ready();
            Ok(())
        })
    }

    fn close(&mut self) -> Result<(), Error> {
        self.socket = None;
        if let Some(native) = self.native.take() {
            debug!(backend_pid = native.backend_pid(), "closing connection");
        }
        Ok(())
    }

    fn cancel(&mut self) {
        if self.socket.is_some() {
            if let Err(err) = self.register() {
                warn!(error = %err, "cannot re-register socket after cancel");
            }
        }
    }

    fn is_bad(&self) -> bool {
        self.native
            .as_ref()
            .is_none_or(|native| native.status() == ConnStatus::Bad)
    }
}

impl Connect for PgConnection {
    fn start_connection(&mut self, conninfo: &str) -> Result<(), Error> {
        self.socket = None;
        self.native = Some(PgConn::start(conninfo)?);
        Ok(())
    }

    fn assign_socket(&mut self) -> Result<(), Error> {
        self.register()
    }

    fn connect_poll(&mut self) -> PollingStatus {
        let Some(native) = self.native.as_mut() else {
            return PollingStatus::Failed;
        };
        let status = native.poll();
        if status == PollingStatus::Failed {
            return status;
        }

        // libpq can close its socket and open the next one (another host, or
        // a retry without SSL) within one poll, usually under the same
        // descriptor number. The old epoll registration dies with the closed
        // socket, so the registration is renewed after every poll.
        if let Some(fd) = native.socket() {
            if self.registered_fd() != Some(fd) {
                debug!(fd, "libpq switched sockets");
            }
            if let Err(err) = self.register_fd(fd) {
                self.error_context = err.to_string();
                return PollingStatus::Failed;
            }
        }

        if status == PollingStatus::Ok {
            if let Some(native) = self.native.as_mut() {
                if let Err(err) = native.set_nonblocking(true) {
                    self.error_context = err.to_string();
                    return PollingStatus::Failed;
                }
            }
        }
        status
    }

    fn error_message(&self) -> String {
        self.native
            .as_ref()
            .map(|native| native.error_message().trim_end().to_string())
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for PgConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgConnection")
            .field("native", &self.native)
            .field("registered_fd", &self.registered_fd())
            .field("error_context", &self.error_context)
            .finish_non_exhaustive()
    }
}

/// Creates [`PgConnection`]s.
#[derive(Clone, Copy, Debug, Default)]
pub struct PgFactory;

impl ConnectionFactory for PgFactory {
    type Connection = PgConnection;

    fn create(&self, io: &Handle) -> PgConnection {
        PgConnection::new(io.clone())
    }
}
