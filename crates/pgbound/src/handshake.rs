//! Nonblocking connection handshake.
//!
//! ```text
//! Init → Starting → AssigningSocket → WaitWrite → Polling
//!                                        ↑           │ Writing
//!                                        └───────────┤
//!                                     WaitRead ←─────┤ Reading
//!                                        └──→ Polling│
//!                                                    ├ Ok            → Done
//!                                                    └ Failed/Active → Failed
//! ```

use tracing::trace;

use crate::connection::{Connect, PollingStatus};
use crate::error::Error;

/// Position of a [`HandshakeOperation`] in the handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeState {
    Init,
    Starting,
    AssigningSocket,
    WaitWrite,
    Polling,
    WaitRead,
    Done,
    Failed,
}

/// Drives one connection through the handshake.
///
/// The operation borrows the connection for its whole run, so no other task
/// can touch the socket while a readiness wait is pending. Dropping the
/// future returned by [`perform`](Self::perform) abandons the pending wait.
pub struct HandshakeOperation<'a, C> {
    conn: &'a mut C,
    state: HandshakeState,
}

impl<'a, C: Connect> HandshakeOperation<'a, C> {
    pub fn new(conn: &'a mut C) -> Self {
        Self {
            conn,
            state: HandshakeState::Init,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Run the handshake towards `conninfo` until it completes or fails.
    ///
    /// On failure the native error message, when there is one, becomes the
    /// connection's error context.
    pub async fn perform(&mut self, conninfo: &str) -> Result<(), Error> {
        let result = self.run(conninfo).await;
        if let Err(err) = &result {
            self.transition(HandshakeState::Failed);
            let message = self.conn.error_message();
            if !message.is_empty() {
                self.conn.set_error_context(message);
            }
            trace!(error = %err, context = %self.conn.error_context(), "handshake failed");
        }
        result
    }

    async fn run(&mut self, conninfo: &str) -> Result<(), Error> {
        self.transition(HandshakeState::Starting);
        if let Err(err) = self.conn.start_connection(conninfo) {
            self.conn.set_error_context(err.to_string());
            return Err(Error::HandshakeStartFailed);
        }
        if self.conn.is_bad() {
            return Err(Error::HandshakeStatusBad);
        }

        self.transition(HandshakeState::AssigningSocket);
        self.conn.assign_socket()?;

        self.transition(HandshakeState::WaitWrite);
        self.conn.wait_write().await?;

        loop {
            self.transition(HandshakeState::Polling);
            match self.conn.connect_poll() {
                PollingStatus::Writing => {
                    self.transition(HandshakeState::WaitWrite);
                    self.conn.wait_write().await?;
                }
                PollingStatus::Reading => {
                    self.transition(HandshakeState::WaitRead);
                    self.conn.wait_read().await?;
                }
                PollingStatus::Ok => {
                    self.transition(HandshakeState::Done);
                    return Ok(());
                }
                PollingStatus::Failed | PollingStatus::Active => {
                    return Err(Error::HandshakePollFailed);
                }
            }
        }
    }

    fn transition(&mut self, next: HandshakeState) {
        trace!(from = ?self.state, to = ?next, "handshake transition");
        self.state = next;
    }
}
