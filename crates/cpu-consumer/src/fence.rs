//! Sync fences passed between producer and consumer.
//!
//! A fence wraps a sync file descriptor that signals when a prior GPU or
//! hardware operation completes. The consumer never waits on fences itself:
//! acquire fences are handed to the buffer lock, release fences go back to the
//! producer, and each side observes completion on its own.

use std::fmt;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

/// An owned sync fence, or the already-signaled placeholder.
///
/// `Fence::no_fence()` stands in wherever an operation produced no fence;
/// its raw descriptor reads as `-1`.
pub struct Fence {
    fd: Option<OwnedFd>,
}

impl Fence {
    /// Wraps a sync file descriptor. The fence owns and closes it on drop.
    pub fn new(fd: OwnedFd) -> Self {
        Self { fd: Some(fd) }
    }

    /// The already-signaled fence.
    pub fn no_fence() -> Self {
        Self { fd: None }
    }

    /// Builds a fence from an optional descriptor, as returned by an async unlock.
    pub fn from_option(fd: Option<OwnedFd>) -> Self {
        Self { fd }
    }

    /// Returns true if this fence refers to a real sync object.
    pub fn is_valid(&self) -> bool {
        self.fd.is_some()
    }

    /// Raw descriptor, or `-1` for the signaled placeholder.
    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_ref().map(|fd| fd.as_raw_fd()).unwrap_or(-1)
    }

    /// Duplicates the descriptor for a callee that takes ownership of it.
    ///
    /// Returns `Ok(None)` for the signaled placeholder.
    pub fn dup(&self) -> std::io::Result<Option<OwnedFd>> {
        self.fd.as_ref().map(|fd| fd.try_clone()).transpose()
    }

    /// Gives up the descriptor.
    pub fn into_fd(self) -> Option<OwnedFd> {
        self.fd
    }
}

impl Default for Fence {
    fn default() -> Self {
        Self::no_fence()
    }
}

impl fmt::Debug for Fence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.fd {
            Some(fd) => write!(f, "Fence(fd={})", fd.as_raw_fd()),
            None => write!(f, "Fence(NO_FENCE)"),
        }
    }
}

impl From<OwnedFd> for Fence {
    fn from(fd: OwnedFd) -> Self {
        Self::new(fd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dev_null_fd() -> OwnedFd {
        let Ok(file) = std::fs::File::open("/dev/null") else {
            panic!("/dev/null should be openable");
        };
        OwnedFd::from(file)
    }

    #[test]
    fn test_no_fence_is_signaled_placeholder() {
        let fence = Fence::no_fence();
        assert!(!fence.is_valid());
        assert_eq!(fence.raw_fd(), -1);
        assert!(matches!(fence.dup(), Ok(None)));
    }

    #[test]
    fn test_dup_yields_distinct_descriptor() {
        let fence = Fence::new(dev_null_fd());
        assert!(fence.is_valid());

        let Ok(Some(dup)) = fence.dup() else {
            panic!("dup of a valid fence should yield a descriptor");
        };
        assert_ne!(dup.as_raw_fd(), fence.raw_fd());
    }
}
