//! Time constraints for connection operations.

use std::time::Duration;

use tokio::time::Instant;

/// How long an operation may run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum TimeConstraint {
    /// No time limit.
    #[default]
    None,
    /// Relative to when the operation starts.
    Duration(Duration),
    /// An absolute point on the tokio clock.
    Deadline(Instant),
}

impl TimeConstraint {
    /// Resolve to an absolute deadline, measured from now for durations.
    ///
    /// A duration too large to represent is treated as no limit.
    pub fn deadline(&self) -> Option<Instant> {
        match *self {
            TimeConstraint::None => None,
            TimeConstraint::Duration(d) => Instant::now().checked_add(d),
            TimeConstraint::Deadline(at) => Some(at),
        }
    }
}

impl From<Duration> for TimeConstraint {
    fn from(d: Duration) -> Self {
        TimeConstraint::Duration(d)
    }
}

impl From<Instant> for TimeConstraint {
    fn from(at: Instant) -> Self {
        TimeConstraint::Deadline(at)
    }
}
