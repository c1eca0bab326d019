//! Consumer error taxonomy and status-code mapping.

use std::fmt;

use crate::buffer::BufferError;
use crate::queue::QueueError;

/// Negative errno-style status codes used on the queue and buffer boundaries.
pub mod status {
    pub const OK: i32 = 0;
    pub const NO_MEMORY: i32 = -12;
    pub const BUSY: i32 = -16;
    pub const NO_INIT: i32 = -19;
    pub const BAD_VALUE: i32 = -22;
    pub const INVALID_OPERATION: i32 = -38;
    pub const NOT_ENOUGH_DATA: i32 = -61;
    pub const UNKNOWN_ERROR: i32 = i32::MIN;
}

/// Category of a [`ConsumerError`], for callers deciding how to react.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Unlock something before locking again
    ResourceExhausted,
    /// Transient; retry later
    InvalidState,
    /// Caller bug, e.g. double unlock
    InvalidArgument,
    /// Buffer mapping or GPU readback failed; state unchanged, may retry
    Io,
    /// The buffer queue itself failed
    Queue,
}

/// Errors returned by [`CpuConsumer`](crate::CpuConsumer).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumerError {
    /// The locked-buffer bound is reached
    ResourceExhausted {
        /// Configured maximum
        max: usize,
    },
    /// No buffer is available from the producer
    InvalidState(String),
    /// Unlock of a buffer this consumer does not hold, or bad configuration
    InvalidArgument(String),
    /// Hardware buffer lock or unlock failed
    Io(BufferError),
    /// GPU readback failed
    Gpu(String),
    /// Buffer queue error, propagated unchanged
    Queue(QueueError),
}

impl ConsumerError {
    /// Returns the taxonomy category.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConsumerError::ResourceExhausted { .. } => ErrorKind::ResourceExhausted,
            ConsumerError::InvalidState(_) => ErrorKind::InvalidState,
            ConsumerError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            ConsumerError::Io(_) | ConsumerError::Gpu(_) => ErrorKind::Io,
            ConsumerError::Queue(_) => ErrorKind::Queue,
        }
    }

    /// Returns true if retrying the same call later may succeed without
    /// the caller changing anything.
    pub fn is_transient(&self) -> bool {
        matches!(self.kind(), ErrorKind::InvalidState | ErrorKind::Io)
    }

    /// Maps to a negative status code for C callers.
    pub fn as_status(&self) -> i32 {
        match self {
            ConsumerError::ResourceExhausted { .. } => status::NOT_ENOUGH_DATA,
            ConsumerError::InvalidState(_) | ConsumerError::InvalidArgument(_) => {
                status::BAD_VALUE
            }
            ConsumerError::Io(e) => e.status(),
            ConsumerError::Gpu(_) => status::INVALID_OPERATION,
            ConsumerError::Queue(e) => e.status(),
        }
    }
}

impl fmt::Display for ConsumerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsumerError::ResourceExhausted { max } => {
                write!(f, "max buffers have been locked ({max}), cannot lock anymore")
            }
            ConsumerError::InvalidState(msg) => write!(f, "invalid state: {msg}"),
            ConsumerError::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            ConsumerError::Io(e) => write!(f, "buffer I/O failed: {e}"),
            ConsumerError::Gpu(msg) => write!(f, "GPU readback failed: {msg}"),
            ConsumerError::Queue(e) => write!(f, "buffer queue error: {e}"),
        }
    }
}

impl std::error::Error for ConsumerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConsumerError::Io(e) => Some(e),
            ConsumerError::Queue(e) => Some(e),
            _ => None,
        }
    }
}

impl From<BufferError> for ConsumerError {
    fn from(e: BufferError) -> Self {
        ConsumerError::Io(e)
    }
}

impl From<QueueError> for ConsumerError {
    fn from(e: QueueError) -> Self {
        ConsumerError::Queue(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_and_status_mapping() {
        let exhausted = ConsumerError::ResourceExhausted { max: 2 };
        assert_eq!(exhausted.kind(), ErrorKind::ResourceExhausted);
        assert_eq!(exhausted.as_status(), status::NOT_ENOUGH_DATA);
        assert!(!exhausted.is_transient());

        let empty = ConsumerError::InvalidState("no buffer available".into());
        assert_eq!(empty.as_status(), status::BAD_VALUE);
        assert!(empty.is_transient());

        let io = ConsumerError::from(BufferError::busy("locked"));
        assert_eq!(io.kind(), ErrorKind::Io);
        assert_eq!(io.as_status(), status::BUSY);

        let gpu = ConsumerError::Gpu("device lost".into());
        assert_eq!(gpu.kind(), ErrorKind::Io);

        let queue = ConsumerError::from(QueueError::abandoned());
        assert_eq!(queue.kind(), ErrorKind::Queue);
        assert_eq!(queue.as_status(), status::NO_INIT);
    }
}
