//! Raw FFI bindings to the libpq connection-establishment API.
//!
//! Only the nonblocking connect and status functions are declared here.
//! Without the `libpq` feature the module carries the type definitions only.

#![allow(non_camel_case_types)]
#![allow(dead_code)]

#[cfg(feature = "libpq")]
use std::os::raw::{c_char, c_int};

/// Opaque connection handle.
#[repr(C)]
pub struct PGconn {
    _private: [u8; 0],
}

// ConnStatusType (libpq-fe.h). `PQstatus` returns many in-progress values
// while a nonblocking connect runs, so it is declared as a plain int.
pub const CONNECTION_OK: i32 = 0;
pub const CONNECTION_BAD: i32 = 1;

// PostgresPollingStatusType (libpq-fe.h).
pub const PGRES_POLLING_FAILED: i32 = 0;
pub const PGRES_POLLING_READING: i32 = 1;
pub const PGRES_POLLING_WRITING: i32 = 2;
pub const PGRES_POLLING_OK: i32 = 3;
pub const PGRES_POLLING_ACTIVE: i32 = 4;

#[cfg(feature = "libpq")]
unsafe extern "C" {
    // ── Nonblocking connect ─────────────────────────────────────
    pub fn PQconnectStart(conninfo: *const c_char) -> *mut PGconn;
    pub fn PQconnectPoll(conn: *mut PGconn) -> c_int;
    pub fn PQfinish(conn: *mut PGconn);

    // ── Status ──────────────────────────────────────────────────
    pub fn PQstatus(conn: *const PGconn) -> c_int;
    pub fn PQsocket(conn: *const PGconn) -> c_int;
    pub fn PQerrorMessage(conn: *const PGconn) -> *const c_char;
    pub fn PQsetnonblocking(conn: *mut PGconn, arg: c_int) -> c_int;
    pub fn PQdb(conn: *const PGconn) -> *const c_char;
    pub fn PQuser(conn: *const PGconn) -> *const c_char;
    pub fn PQhost(conn: *const PGconn) -> *const c_char;
    pub fn PQport(conn: *const PGconn) -> *const c_char;
    pub fn PQserverVersion(conn: *const PGconn) -> c_int;
    pub fn PQbackendPID(conn: *const PGconn) -> c_int;
}
