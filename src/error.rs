use std::io;
use thiserror::Error;

/// Errors encountered by the wakeup primitive
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WakeupError {
    /// The wakeup thread is no longer accepting messages
    #[error("the wakeup thread has shut down")]
    Disconnected,
    /// The handle was never registered or has already been released
    #[error("unknown wakeup handle")]
    UnknownHandle,
}

/// Errors encountered by a repeating timer
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TimerError {
    /// A lifecycle operation was attempted on a cancelled timer
    ///
    /// This is a programming error. The public lifecycle methods panic with this
    /// message instead of returning it.
    #[error("cannot {operation} a timer that has been cancelled")]
    InvalidOperation {
        /// The name of the rejected operation
        operation: &'static str,
    },
    /// The wakeup primitive backing the timer could not be allocated
    #[error("could not allocate a wakeup handle")]
    Wakeup(#[from] WakeupError),
    /// A thread backing the default execution context or wakeup source could not be spawned
    #[error("could not spawn a timer thread: {0}")]
    Spawn(io::ErrorKind),
    /// The leeway fraction must be finite and not negative
    #[error("invalid leeway fraction {0}")]
    InvalidLeeway(f64),
}

impl TimerError {
    pub(crate) fn invalid(operation: &'static str) -> Self {
        TimerError::InvalidOperation { operation }
    }
}

impl From<io::Error> for TimerError {
    fn from(e: io::Error) -> Self {
        TimerError::Spawn(e.kind())
    }
}
