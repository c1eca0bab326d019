//! Buffer queue adapter interface.
//!
//! The consumer does not own the queue protocol. It acquires [`BufferItem`]s
//! from whatever implements [`BufferQueue`] and hands buffers back with a
//! release fence once the CPU is done with them.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::buffer::{BufferUsage, GraphicBuffer};
use crate::error::status;
use crate::fence::Fence;
use crate::format::{DataSpace, Rect, ScalingMode, Transform};

/// Number of slots in a producer's slot table.
pub const NUM_BUFFER_SLOTS: usize = 64;

/// A buffer acquired from the queue, with the producer's per-frame metadata.
#[derive(Clone)]
pub struct BufferItem {
    /// Producer slot index the buffer lives in
    pub slot: usize,
    /// Buffer handle; `None` when the queue expects the consumer's slot cache to resolve it
    pub graphic_buffer: Option<Arc<dyn GraphicBuffer>>,
    /// Signals when the producer finished writing
    pub fence: Arc<Fence>,
    pub crop: Rect,
    pub transform: Transform,
    pub scaling_mode: ScalingMode,
    /// Presentation timestamp in nanoseconds
    pub timestamp: i64,
    pub data_space: DataSpace,
    /// Monotonically increasing per-queue frame counter
    pub frame_number: u64,
}

impl BufferItem {
    /// Creates an item carrying `buffer` in `slot` with default metadata.
    ///
    /// The crop defaults to the full buffer.
    pub fn new(slot: usize, buffer: Arc<dyn GraphicBuffer>) -> Self {
        let crop = Rect::from_size(buffer.width(), buffer.height());
        Self {
            slot,
            graphic_buffer: Some(buffer),
            fence: Arc::new(Fence::no_fence()),
            crop,
            transform: Transform::IDENTITY,
            scaling_mode: ScalingMode::default(),
            timestamp: 0,
            data_space: DataSpace::UNKNOWN,
            frame_number: 0,
        }
    }

    /// Creates an item for a slot whose buffer the consumer already knows.
    pub fn cached(slot: usize) -> Self {
        Self {
            slot,
            graphic_buffer: None,
            fence: Arc::new(Fence::no_fence()),
            crop: Rect::EMPTY,
            transform: Transform::IDENTITY,
            scaling_mode: ScalingMode::default(),
            timestamp: 0,
            data_space: DataSpace::UNKNOWN,
            frame_number: 0,
        }
    }

    pub fn with_frame_number(mut self, frame_number: u64) -> Self {
        self.frame_number = frame_number;
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_crop(mut self, crop: Rect) -> Self {
        self.crop = crop;
        self
    }

    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.transform = transform;
        self
    }

    pub fn with_scaling_mode(mut self, scaling_mode: ScalingMode) -> Self {
        self.scaling_mode = scaling_mode;
        self
    }

    pub fn with_data_space(mut self, data_space: DataSpace) -> Self {
        self.data_space = data_space;
        self
    }

    pub fn with_fence(mut self, fence: Fence) -> Self {
        self.fence = Arc::new(fence);
        self
    }
}

impl fmt::Debug for BufferItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferItem")
            .field("slot", &self.slot)
            .field("has_buffer", &self.graphic_buffer.is_some())
            .field("fence", &self.fence)
            .field("crop", &self.crop)
            .field("timestamp", &self.timestamp)
            .field("frame_number", &self.frame_number)
            .finish()
    }
}

/// Error reported by the buffer queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueError {
    status: i32,
    message: String,
}

impl QueueError {
    pub fn new(status: i32, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    /// The queue has been abandoned by its producer.
    pub fn abandoned() -> Self {
        Self::new(status::NO_INIT, "buffer queue has been abandoned")
    }

    pub fn status(&self) -> i32 {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.status)
    }
}

impl std::error::Error for QueueError {}

/// Result of a failed acquire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireError {
    /// Nothing is queued right now; try again later
    NoBufferAvailable,
    /// The queue failed
    Queue(QueueError),
}

impl fmt::Display for AcquireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcquireError::NoBufferAvailable => write!(f, "no buffer available"),
            AcquireError::Queue(e) => write!(f, "acquire failed: {e}"),
        }
    }
}

impl std::error::Error for AcquireError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AcquireError::NoBufferAvailable => None,
            AcquireError::Queue(e) => Some(e),
        }
    }
}

impl From<QueueError> for AcquireError {
    fn from(e: QueueError) -> Self {
        AcquireError::Queue(e)
    }
}

/// Consumer end of a buffer queue.
///
/// All calls are made with the consumer's state mutex held, so implementations
/// see a single caller at a time.
pub trait BufferQueue: Send {
    /// Connects the consumer. `controlled_by_app` marks a consumer that shares
    /// access control with other consumers of the same queue.
    fn connect(&mut self, controlled_by_app: bool) -> Result<(), QueueError>;

    /// Declares how the consumer will access buffers.
    fn set_consumer_usage(&mut self, usage: BufferUsage) -> Result<(), QueueError>;

    /// Caps how many buffers the consumer may hold at once.
    fn set_max_acquired_buffer_count(&mut self, count: usize) -> Result<(), QueueError>;

    /// Acquires the next queued buffer.
    ///
    /// `present_when_ns` is a presentation-time hint; `0` takes the next
    /// buffer regardless of its timestamp.
    fn acquire_buffer(&mut self, present_when_ns: i64) -> Result<BufferItem, AcquireError>;

    /// Returns a buffer to the producer. The producer must wait on
    /// `release_fence` before reusing the memory.
    fn release_buffer(
        &mut self,
        slot: usize,
        buffer: &Arc<dyn GraphicBuffer>,
        release_fence: Fence,
    ) -> Result<(), QueueError>;

    /// Hands an acquired slot back without naming its buffer. Used when the
    /// acquired item could not be resolved to a buffer at all.
    fn release_slot(&mut self, slot: usize, release_fence: Fence) -> Result<(), QueueError>;

    /// Looks up the buffer the queue currently has in `slot`.
    fn cached_buffer(&self, slot: usize) -> Option<Arc<dyn GraphicBuffer>> {
        let _ = slot;
        None
    }
}

/// Consumer-side record of which buffer each producer slot holds.
///
/// Producers send a buffer handle only the first time a slot is used (or after
/// reallocating it); later items for the same slot arrive without one.
#[derive(Default)]
pub(crate) struct SlotCache {
    buffers: HashMap<usize, Arc<dyn GraphicBuffer>>,
}

impl SlotCache {
    pub(crate) fn record(&mut self, slot: usize, buffer: &Arc<dyn GraphicBuffer>) {
        self.buffers.insert(slot, Arc::clone(buffer));
    }

    pub(crate) fn get(&self, slot: usize) -> Option<Arc<dyn GraphicBuffer>> {
        self.buffers.get(&slot).cloned()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.buffers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryGraphicBuffer;
    use crate::PixelFormat;

    #[test]
    fn test_item_defaults_to_full_crop() {
        let buffer: Arc<dyn GraphicBuffer> =
            Arc::new(MemoryGraphicBuffer::new(64, 32, PixelFormat::Rgba8888));
        let item = BufferItem::new(3, buffer).with_frame_number(7);
        assert_eq!(item.crop, Rect::from_size(64, 32));
        assert_eq!(item.frame_number, 7);
        assert!(!item.fence.is_valid());
    }

    #[test]
    fn test_slot_cache_replaces_on_realloc() {
        let first: Arc<dyn GraphicBuffer> =
            Arc::new(MemoryGraphicBuffer::new(16, 16, PixelFormat::Rgba8888));
        let second: Arc<dyn GraphicBuffer> =
            Arc::new(MemoryGraphicBuffer::new(32, 32, PixelFormat::Rgba8888));

        let mut cache = SlotCache::default();
        assert!(cache.get(1).is_none());

        cache.record(1, &first);
        cache.record(1, &second);
        assert_eq!(cache.len(), 1);

        let Some(cached) = cache.get(1) else {
            panic!("slot 1 should be cached");
        };
        assert!(Arc::ptr_eq(&cached, &second));
    }
}
