//! Hardware buffer interface consumed by the CPU consumer.
//!
//! Buffer memory is owned by an external allocator. The consumer only needs to
//! map it for CPU reads (either as flexible YUV planes or as a single plane),
//! unmap it, and optionally hand it to the GPU readback path.

use std::fmt;
use std::ops::BitOr;
use std::os::fd::OwnedFd;
use std::ptr::NonNull;

use crate::error::status;
use crate::format::{PixelFormat, Rect};

/// Gralloc usage bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BufferUsage(pub u64);

impl BufferUsage {
    pub const SW_READ_RARELY: BufferUsage = BufferUsage(0x2);
    pub const SW_READ_OFTEN: BufferUsage = BufferUsage(0x3);
    pub const SW_WRITE_OFTEN: BufferUsage = BufferUsage(0x30);
    pub const GPU_SAMPLED_IMAGE: BufferUsage = BufferUsage(0x100);

    pub fn contains(self, other: BufferUsage) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for BufferUsage {
    type Output = BufferUsage;

    fn bitor(self, rhs: Self) -> Self::Output {
        BufferUsage(self.0 | rhs.0)
    }
}

/// Plane layout of a buffer locked as flexible YUV 4:2:0.
///
/// Pointers stay valid until the buffer is unlocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct YCbCrLayout {
    /// Luma plane base
    pub y: NonNull<u8>,
    /// Chroma-blue plane base
    pub cb: NonNull<u8>,
    /// Chroma-red plane base
    pub cr: NonNull<u8>,
    /// Luma row stride in bytes
    pub y_stride: u32,
    /// Chroma row stride in bytes
    pub c_stride: u32,
    /// Distance in bytes between consecutive chroma samples (1 = planar, 2 = interleaved)
    pub chroma_step: u32,
}

// SAFETY: The layout only describes memory owned by the locked buffer; the
// consumer serializes all access to it behind its state mutex.
unsafe impl Send for YCbCrLayout {}

/// Error reported by a hardware buffer lock or unlock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferError {
    status: i32,
    message: String,
}

impl BufferError {
    /// Creates an error from a negative status code and a description.
    pub fn new(status: i32, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    /// The buffer is already locked by someone else.
    pub fn busy(message: impl Into<String>) -> Self {
        Self::new(status::BUSY, message)
    }

    /// The buffer cannot be mapped the way it was asked to be.
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(status::BAD_VALUE, message)
    }

    /// The negative status code.
    pub fn status(&self) -> i32 {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for BufferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.status)
    }
}

impl std::error::Error for BufferError {}

/// A hardware buffer handed out by the buffer queue.
///
/// Implementations wrap a platform handle (gralloc buffer, AHardwareBuffer,
/// DMABuf) and are shared between the queue's slot table and the consumer's
/// locked entries via `Arc`.
///
/// Lock calls take ownership of a duplicated acquire fence; the implementation
/// must wait on it (or let the allocator wait on it) before exposing memory.
pub trait GraphicBuffer: Send + Sync + fmt::Debug {
    /// Width in pixels.
    fn width(&self) -> u32;

    /// Height in pixels.
    fn height(&self) -> u32;

    /// Row stride in pixels.
    fn stride(&self) -> u32;

    /// Native pixel format.
    fn format(&self) -> PixelFormat;

    /// Maps the buffer as a single plane for CPU access.
    fn lock(
        &self,
        usage: BufferUsage,
        crop: Rect,
        acquire_fence: Option<OwnedFd>,
    ) -> Result<NonNull<u8>, BufferError>;

    /// Maps the buffer as flexible YUV 4:2:0 planes.
    fn lock_ycbcr(
        &self,
        usage: BufferUsage,
        crop: Rect,
        acquire_fence: Option<OwnedFd>,
    ) -> Result<YCbCrLayout, BufferError>;

    /// Unmaps the buffer, returning a release fence if CPU access is still in flight.
    fn unlock(&self) -> Result<Option<OwnedFd>, BufferError>;

    /// Imports the buffer as a sampled texture on the readback device.
    ///
    /// Platform code overrides this to wrap the buffer memory without copying.
    /// Returning `None` makes the buffer ineligible for GPU readback.
    #[cfg(feature = "gpu")]
    fn import_texture(&self, device: &wgpu::Device, queue: &wgpu::Queue) -> Option<wgpu::Texture> {
        let _ = (device, queue);
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_bits() {
        let usage = BufferUsage::SW_READ_OFTEN | BufferUsage::GPU_SAMPLED_IMAGE;
        assert!(usage.contains(BufferUsage::SW_READ_OFTEN));
        assert!(usage.contains(BufferUsage::SW_READ_RARELY));
        assert!(!usage.contains(BufferUsage::SW_WRITE_OFTEN));
    }

    #[test]
    fn test_buffer_error_display() {
        let err = BufferError::busy("buffer already locked");
        assert_eq!(err.status(), status::BUSY);
        assert_eq!(err.to_string(), "buffer already locked (-16)");
    }
}
