//! Handshake bounded by a deadline.

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::connection::Connect;
use crate::error::{ConnectError, Error};
use crate::handshake::HandshakeOperation;
use crate::time::TimeConstraint;

/// Runs a [`HandshakeOperation`] against a deadline timer.
///
/// The handshake and the timer run inside one task spawned on the
/// connection's bound runtime. Whichever finishes first decides the result;
/// the other is dropped, so exactly one result is delivered.
#[derive(Clone, Copy, Debug, Default)]
pub struct BoundedConnector {
    constraint: TimeConstraint,
}

impl BoundedConnector {
    pub fn new(constraint: TimeConstraint) -> Self {
        Self { constraint }
    }

    pub fn constraint(&self) -> TimeConstraint {
        self.constraint
    }

    /// Establish `conn` towards `target`.
    ///
    /// On failure the connection is handed back inside the error with its
    /// error context set. A timed-out connection is closed first. Dropping
    /// the returned future aborts the handshake task and drops the connection.
    pub async fn create<C: Connect>(self, conn: C, target: String) -> Result<C, ConnectError<C>> {
        let deadline = self.constraint.deadline();
        let io = conn.executor().clone();
        let mut task = AbortOnDrop(io.spawn(establish(conn, target, deadline)));

        match (&mut task.0).await {
            Ok(result) => result,
            Err(err) => {
                warn!(error = %err, "connection task did not complete");
                Err(ConnectError::resource(Error::Aborted))
            }
        }
    }
}

struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn establish<C: Connect>(
    mut conn: C,
    target: String,
    deadline: Option<Instant>,
) -> Result<C, ConnectError<C>> {
    let outcome = {
        let mut op = HandshakeOperation::new(&mut conn);
        match deadline {
            None => Some(op.perform(&target).await),
            Some(deadline) => tokio::select! {
                biased;
                result = op.perform(&target) => Some(result),
                _ = tokio::time::sleep_until(deadline) => None,
            },
        }
    };

    match outcome {
        Some(Ok(())) => {
            debug!("connection established");
            Ok(conn)
        }
        Some(Err(err)) => Err(ConnectError::new(err, conn)),
        None => {
            if let Err(err) = conn.close() {
                debug!(error = %err, "closing timed-out connection failed");
            }
            conn.set_error_context("connection was not established before the deadline".into());
            warn!("connect timeout");
            Err(ConnectError::new(Error::ConnectTimeout, conn))
        }
    }
}
