//! Error types for the weft runtime

use core::fmt;

/// Result type for runtime operations
pub type WeftResult<T> = Result<T, WeftError>;

/// Errors surfaced by runtime operations
///
/// Programming errors (resuming a terminated fiber, resetting a live one,
/// yielding without a current fiber) are asserted, not returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WeftError {
    /// Operation timed out
    Timeout,

    /// Task queue is stopped
    QueueStopped,

    /// No fiber is current on this thread
    NoCurrentFiber,

    /// No scheduler is registered on this thread
    NoScheduler,

    /// Invalid file descriptor
    BadFd(i32),

    /// Event already registered on the descriptor
    EventExists,

    /// Event not registered on the descriptor
    EventMissing,

    /// Component already started
    AlreadyStarted,

    /// Component not started
    NotStarted,

    /// OS call failed with the given errno
    Os(i32),
}

impl WeftError {
    /// Wrap the current `errno` value
    pub fn last_os_error() -> WeftError {
        WeftError::Os(std::io::Error::last_os_error().raw_os_error().unwrap_or(0))
    }
}

impl fmt::Display for WeftError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WeftError::Timeout => write!(f, "operation timed out"),
            WeftError::QueueStopped => write!(f, "task queue stopped"),
            WeftError::NoCurrentFiber => write!(f, "no current fiber on this thread"),
            WeftError::NoScheduler => write!(f, "no scheduler on this thread"),
            WeftError::BadFd(fd) => write!(f, "invalid file descriptor {}", fd),
            WeftError::EventExists => write!(f, "event already registered"),
            WeftError::EventMissing => write!(f, "event not registered"),
            WeftError::AlreadyStarted => write!(f, "already started"),
            WeftError::NotStarted => write!(f, "not started"),
            WeftError::Os(errno) => write!(f, "os error: errno {}", errno),
        }
    }
}

impl std::error::Error for WeftError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", WeftError::Timeout), "operation timed out");
        assert_eq!(format!("{}", WeftError::Os(11)), "os error: errno 11");
        assert_eq!(
            format!("{}", WeftError::BadFd(-1)),
            "invalid file descriptor -1"
        );
    }
}
