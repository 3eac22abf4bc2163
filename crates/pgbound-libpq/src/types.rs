//! Safe wrapper types for libpq connection states.

use crate::ffi;

/// Errors from the native libpq layer.
#[derive(Debug, thiserror::Error)]
pub enum PgError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("invalid conninfo string")]
    InvalidConninfo,

    #[error("cannot switch connection to nonblocking mode: {0}")]
    Nonblocking(String),

    #[error("libpq is not linked into this build")]
    NotAvailable,
}

/// Connection status as reported by `PQstatus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnStatus {
    /// The connection is established.
    Ok,
    /// The connection failed or was never started.
    Bad,
    /// A nonblocking connect is still running.
    InProgress,
}

impl ConnStatus {
    #[cfg_attr(not(feature = "libpq"), allow(dead_code))]
    pub(crate) fn from_raw(raw: i32) -> Self {
        match raw {
            ffi::CONNECTION_OK => Self::Ok,
            ffi::CONNECTION_BAD => Self::Bad,
            _ => Self::InProgress,
        }
    }
}

/// Result of advancing a nonblocking connect with `PQconnectPoll`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollingStatus {
    Failed,
    /// Wait until the socket is readable, then poll again.
    Reading,
    /// Wait until the socket is writable, then poll again.
    Writing,
    Ok,
    /// Obsolete libpq state; never returned by a well-behaved `PQconnectPoll`.
    Active,
}

impl PollingStatus {
    #[cfg_attr(not(feature = "libpq"), allow(dead_code))]
    pub(crate) fn from_raw(raw: i32) -> Self {
        match raw {
            ffi::PGRES_POLLING_READING => Self::Reading,
            ffi::PGRES_POLLING_WRITING => Self::Writing,
            ffi::PGRES_POLLING_OK => Self::Ok,
            ffi::PGRES_POLLING_ACTIVE => Self::Active,
            _ => Self::Failed,
        }
    }
}
