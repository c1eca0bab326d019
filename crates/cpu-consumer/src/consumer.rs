//! CPU consumer: acquire, map for reading, release.
//!
//! A [`CpuConsumer`] sits on the consumer end of a [`BufferQueue`]. Each
//! [`lock_next_buffer`](CpuConsumer::lock_next_buffer) acquires the next queued
//! buffer and exposes its pixels to the CPU, either by mapping the hardware
//! buffer directly or, for opaque YUV layouts on supported GPUs, by reading it
//! back through the [`ConversionPipeline`]. Each
//! [`unlock_buffer`](CpuConsumer::unlock_buffer) undoes one lock and returns the
//! buffer to the producer with a release fence.
//!
//! ```text
//! lock_next_buffer:
//!   bound reached? ──yes──▶ ResourceExhausted (queue untouched)
//!   acquire ──empty──▶ InvalidState
//!   possibly YUV? ──▶ flex lock ──ok──▶ view over mapped planes
//!   gate open + even size + importable ──▶ GPU readback ──▶ view over scratch
//!   otherwise ──▶ plain lock ──▶ single-plane view
//! ```
//!
//! All state sits behind one mutex held for the whole call. A failed lock
//! releases the acquired buffer straight back and changes nothing else.

use std::fmt;
use std::os::fd::OwnedFd;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use crate::buffer::{BufferError, BufferUsage, GraphicBuffer};
use crate::config::ConsumerConfig;
use crate::error::{status, ConsumerError};
use crate::fence::Fence;
use crate::format::{DataSpace, PixelFormat, Rect, ScalingMode, Transform};
use crate::pipeline::{ConversionPipeline, GpuReadback, PipelineState, VendorGate};
use crate::queue::{AcquireError, BufferItem, BufferQueue, SlotCache};
use crate::slots::{LockToken, LockedMemory, SlotTable};
use crate::stats::{ConsumerStats, ConsumerStatsSnapshot, LockPath};

/// Usage declared to the queue and passed to every buffer lock.
const CPU_READ_USAGE: BufferUsage = BufferUsage::SW_READ_OFTEN;

/// CPU-visible contents of a locked buffer.
///
/// For YUV views `data` is the luma plane and `data_cb`/`data_cr` the chroma
/// planes; for single-plane views both chroma pointers are null and the
/// chroma fields are zero. Pointers stay valid until the view is passed to
/// [`CpuConsumer::unlock_buffer`].
#[derive(Debug, Clone)]
pub struct LockedBufferView {
    pub data: *const u8,
    /// Luma row stride in bytes for YUV views, row stride in pixels otherwise
    pub stride: u32,
    pub data_cb: *const u8,
    pub data_cr: *const u8,
    pub chroma_stride: u32,
    /// Bytes between consecutive chroma samples
    pub chroma_step: u32,
    pub width: u32,
    pub height: u32,
    /// Native format of the buffer
    pub format: PixelFormat,
    /// `YCbCr420888` when the view exposes YUV planes, else `format`
    pub flex_format: PixelFormat,
    pub crop: Rect,
    pub transform: Transform,
    pub scaling_mode: ScalingMode,
    pub timestamp: i64,
    pub data_space: DataSpace,
    pub frame_number: u64,
    token: LockToken,
}

// SAFETY: the pointers refer to memory pinned by the consumer's slot entry
// until unlock; the view itself carries no thread affinity.
unsafe impl Send for LockedBufferView {}

impl LockedBufferView {
    fn from_item(item: &BufferItem, buffer: &dyn GraphicBuffer) -> Self {
        let format = buffer.format();
        Self {
            data: std::ptr::null(),
            stride: 0,
            data_cb: std::ptr::null(),
            data_cr: std::ptr::null(),
            chroma_stride: 0,
            chroma_step: 0,
            width: buffer.width(),
            height: buffer.height(),
            format,
            flex_format: format,
            crop: item.crop,
            transform: item.transform,
            scaling_mode: item.scaling_mode,
            timestamp: item.timestamp,
            data_space: item.data_space,
            frame_number: item.frame_number,
            token: LockToken::UNUSED,
        }
    }

    /// Identity of the lock that produced this view.
    pub fn token(&self) -> LockToken {
        self.token
    }

    /// Returns true if the view exposes separate chroma planes.
    pub fn is_ycbcr(&self) -> bool {
        !self.data_cb.is_null()
    }

    /// Luma row `y`, `width` bytes long.
    ///
    /// # Safety
    ///
    /// The view must come from a successful lock that has not been unlocked,
    /// and must be a YUV view.
    pub unsafe fn luma_row(&self, y: u32) -> &[u8] {
        debug_assert!(self.is_ycbcr() && y < self.height);
        std::slice::from_raw_parts(
            self.data.add(y as usize * self.stride as usize),
            self.width as usize,
        )
    }

    /// Cb and Cr samples covering pixel (`x`, `y`).
    ///
    /// # Safety
    ///
    /// Same as [`luma_row`](Self::luma_row), and the pixel must be inside the buffer.
    pub unsafe fn chroma_at(&self, x: u32, y: u32) -> (u8, u8) {
        debug_assert!(self.is_ycbcr() && x < self.width && y < self.height);
        let offset = (y / 2) as usize * self.chroma_stride as usize
            + (x / 2) as usize * self.chroma_step as usize;
        (*self.data_cb.add(offset), *self.data_cr.add(offset))
    }
}

impl Default for LockedBufferView {
    /// A view matching no lock. Unlocking it fails with `InvalidArgument`.
    fn default() -> Self {
        Self {
            data: std::ptr::null(),
            stride: 0,
            data_cb: std::ptr::null(),
            data_cr: std::ptr::null(),
            chroma_stride: 0,
            chroma_step: 0,
            width: 0,
            height: 0,
            format: PixelFormat::Other(0),
            flex_format: PixelFormat::Other(0),
            crop: Rect::EMPTY,
            transform: Transform::IDENTITY,
            scaling_mode: ScalingMode::default(),
            timestamp: 0,
            data_space: DataSpace::UNKNOWN,
            frame_number: 0,
            token: LockToken::UNUSED,
        }
    }
}

struct ConsumerState {
    queue: Box<dyn BufferQueue>,
    slot_cache: SlotCache,
    table: SlotTable,
    pipeline: ConversionPipeline,
}

/// Lock/convert/unlock engine over a buffer queue.
///
/// Safe to share between threads; every call serializes on one internal mutex.
pub struct CpuConsumer {
    name: String,
    max_locked: usize,
    inner: Mutex<ConsumerState>,
    stats: ConsumerStats,
}

impl CpuConsumer {
    /// Connects to `queue` with the default readback backend for this build
    /// (wgpu when the `gpu` feature is on, none otherwise).
    pub fn new(
        queue: impl BufferQueue + 'static,
        config: ConsumerConfig,
    ) -> Result<Self, ConsumerError> {
        #[cfg(feature = "gpu")]
        let readback: Option<Box<dyn GpuReadback>> =
            Some(Box::new(crate::gpu::WgpuReadback::new()));
        #[cfg(not(feature = "gpu"))]
        let readback: Option<Box<dyn GpuReadback>> = None;

        Self::with_readback(queue, config, readback)
    }

    /// Connects to `queue` using `readback` for GPU-mediated conversion.
    ///
    /// Fails with `InvalidArgument` for a zero lock bound, or with the queue's
    /// error if the connection handshake is refused.
    pub fn with_readback(
        mut queue: impl BufferQueue + 'static,
        config: ConsumerConfig,
        readback: Option<Box<dyn GpuReadback>>,
    ) -> Result<Self, ConsumerError> {
        config.validate()?;
        let max_locked = config.max_locked_buffers;

        queue.connect(config.controlled_by_app)?;
        queue.set_consumer_usage(CPU_READ_USAGE)?;
        queue.set_max_acquired_buffer_count(max_locked)?;

        let gate = VendorGate::from_config(&config.conversion);
        info!(
            "[{}] CpuConsumer created: max_locked={max_locked}, controlled_by_app={}, gpu_vendor='{}'",
            config.name,
            config.controlled_by_app,
            gate.detected()
        );

        Ok(Self {
            name: config.name,
            max_locked,
            inner: Mutex::new(ConsumerState {
                queue: Box::new(queue),
                slot_cache: SlotCache::default(),
                table: SlotTable::new(max_locked),
                pipeline: ConversionPipeline::new(gate, readback),
            }),
            stats: ConsumerStats::default(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_locked_buffers(&self) -> usize {
        self.max_locked
    }

    pub fn locked_buffer_count(&self) -> usize {
        self.inner.lock().table.locked_count()
    }

    /// Returns true once the GPU conversion context has been created.
    pub fn is_conversion_active(&self) -> bool {
        self.inner.lock().pipeline.is_active()
    }

    pub fn pipeline_state(&self) -> PipelineState {
        self.inner.lock().pipeline.state()
    }

    pub fn stats(&self) -> ConsumerStatsSnapshot {
        self.stats.snapshot()
    }

    /// Acquires the next queued buffer and maps it for CPU reading.
    ///
    /// Errors:
    /// - `ResourceExhausted` when `max_locked_buffers` views are outstanding;
    ///   the queue is not touched
    /// - `InvalidState` when nothing is queued, or the buffer handle is unknown
    /// - `Io`/`Gpu` when mapping or readback fails; the buffer goes back to the
    ///   producer
    /// - `Queue` for any other acquire failure
    pub fn lock_next_buffer(&self) -> Result<LockedBufferView, ConsumerError> {
        let mut guard = self.inner.lock();
        let state = &mut *guard;

        if state.table.is_full() {
            self.stats.record_exhausted();
            warn!(
                "[{}] Max buffers have been locked ({}), cannot lock anymore",
                self.name, self.max_locked
            );
            return Err(ConsumerError::ResourceExhausted {
                max: self.max_locked,
            });
        }

        let item = match state.queue.acquire_buffer(0) {
            Ok(item) => item,
            Err(AcquireError::NoBufferAvailable) => {
                self.stats.record_empty();
                trace!("[{}] No buffer available", self.name);
                return Err(ConsumerError::InvalidState("no buffer available".into()));
            }
            Err(AcquireError::Queue(e)) => {
                error!("[{}] Error acquiring buffer: {e}", self.name);
                return Err(e.into());
            }
        };

        let Some(buffer) = self.resolve_buffer(state, &item) else {
            self.stats.record_failed_lock();
            error!(
                "[{}] Acquired slot {} (frame {}) has no known buffer",
                self.name, item.slot, item.frame_number
            );
            if let Err(e) = state.queue.release_slot(item.slot, Fence::no_fence()) {
                error!(
                    "[{}] Failed to return unresolved slot {}: {e}",
                    self.name, item.slot
                );
            }
            return Err(ConsumerError::InvalidState(format!(
                "no buffer cached for slot {}",
                item.slot
            )));
        };

        let locked = state
            .table
            .first_free()
            .ok_or_else(|| {
                ConsumerError::InvalidState(format!(
                    "no free entry with {} of {} locked",
                    state.table.locked_count(),
                    state.table.capacity()
                ))
            })
            .and_then(|index| {
                self.lock_item(&mut state.pipeline, &item, &buffer)
                    .map(|locked| (index, locked))
            });

        let (index, (mut view, memory, path)) = match locked {
            Ok(locked) => locked,
            Err(e) => {
                self.stats.record_failed_lock();
                if let Err(release_err) =
                    state
                        .queue
                        .release_buffer(item.slot, &buffer, Fence::no_fence())
                {
                    error!(
                        "[{}] Failed to return unlockable buffer in slot {}: {release_err}",
                        self.name, item.slot
                    );
                }
                return Err(e);
            }
        };

        view.token = state.table.occupy(index, item.slot, buffer, memory);
        let locked_now = state.table.locked_count();
        self.stats.record_lock(path, locked_now);
        trace!(
            "[{}] Locked frame {} from slot {} via {path:?} ({locked_now}/{} locked)",
            self.name,
            item.frame_number,
            item.slot,
            self.max_locked
        );
        Ok(view)
    }

    /// Unmaps a buffer returned by [`lock_next_buffer`](Self::lock_next_buffer)
    /// and releases it to the producer.
    ///
    /// Fails with `InvalidArgument` if `view` matches no current lock. If the
    /// hardware unlock fails the error is returned and the lock stays in
    /// place, so the call can be retried.
    pub fn unlock_buffer(&self, view: &LockedBufferView) -> Result<(), ConsumerError> {
        let mut guard = self.inner.lock();
        let state = &mut *guard;

        let Some(index) = state.table.find(view.token) else {
            error!(
                "[{}] Can't find buffer to free (frame {}, {:?})",
                self.name, view.frame_number, view.token
            );
            return Err(ConsumerError::InvalidArgument(
                "buffer is not locked by this consumer".into(),
            ));
        };

        let entry = state.table.entry(index);
        let release_fence = match entry.scratch() {
            Some(scratch) => {
                if scratch.as_ptr() != view.data {
                    error!(
                        "[{}] Scratch buffer {:p} does not back view data {:p} for slot {}",
                        self.name,
                        scratch.as_ptr(),
                        view.data,
                        entry.slot
                    );
                }
                // Converted locks never mapped the hardware buffer.
                Fence::no_fence()
            }
            None => {
                let Some(buffer) = entry.buffer.as_ref() else {
                    return Err(ConsumerError::InvalidState(format!(
                        "locked entry {index} holds no buffer"
                    )));
                };
                match buffer.unlock() {
                    Ok(fd) => Fence::from_option(fd),
                    Err(e) => {
                        error!(
                            "[{}] Unable to unlock graphic buffer in slot {}: {e}",
                            self.name, entry.slot
                        );
                        return Err(e.into());
                    }
                }
            }
        };

        let Some(vacated) = state.table.vacate(index) else {
            return Err(ConsumerError::InvalidState(format!(
                "entry {index} vanished during unlock"
            )));
        };
        if let Err(e) = state
            .queue
            .release_buffer(vacated.slot, &vacated.buffer, release_fence)
        {
            warn!(
                "[{}] Failed to release buffer in slot {}: {e}",
                self.name, vacated.slot
            );
        }
        self.stats.record_unlock();
        trace!(
            "[{}] Unlocked slot {} ({}/{} locked)",
            self.name,
            vacated.slot,
            state.table.locked_count(),
            self.max_locked
        );
        Ok(())
    }

    /// Buffer handle for an acquired item: its own, then our slot cache, then
    /// the queue's.
    fn resolve_buffer(
        &self,
        state: &mut ConsumerState,
        item: &BufferItem,
    ) -> Option<Arc<dyn GraphicBuffer>> {
        if let Some(buffer) = &item.graphic_buffer {
            state.slot_cache.record(item.slot, buffer);
            return Some(Arc::clone(buffer));
        }
        if let Some(buffer) = state.slot_cache.get(item.slot) {
            return Some(buffer);
        }
        let buffer = state.queue.cached_buffer(item.slot)?;
        debug!(
            "[{}] Slot {} resolved through queue cache",
            self.name, item.slot
        );
        state.slot_cache.record(item.slot, &buffer);
        Some(buffer)
    }

    /// Produces the CPU view for one acquired buffer. Leaves the buffer
    /// unlocked on error.
    fn lock_item(
        &self,
        pipeline: &mut ConversionPipeline,
        item: &BufferItem,
        buffer: &Arc<dyn GraphicBuffer>,
    ) -> Result<(LockedBufferView, LockedMemory, LockPath), ConsumerError> {
        let format = buffer.format();
        let mut view = LockedBufferView::from_item(item, buffer.as_ref());

        if format.is_possibly_yuv() {
            let fence = dup_acquire_fence(&item.fence)?;
            match buffer.lock_ycbcr(CPU_READ_USAGE, item.crop, fence) {
                Ok(layout) => {
                    if !format.is_flexible_yuv() {
                        trace!("[{}] Locking buffer of format {format} as flex YUV", self.name);
                    }
                    view.data = layout.y.as_ptr();
                    view.stride = layout.y_stride;
                    view.data_cb = layout.cb.as_ptr();
                    view.data_cr = layout.cr.as_ptr();
                    view.chroma_stride = layout.c_stride;
                    view.chroma_step = layout.chroma_step;
                    view.flex_format = PixelFormat::YCbCr420888;
                    return Ok((view, LockedMemory::Mapped, LockPath::Flex));
                }
                Err(e) if format.is_flexible_yuv() => {
                    error!("[{}] Unable to lock YCbCr buffer for CPU reading: {e}", self.name);
                    return Err(e.into());
                }
                Err(e) => {
                    trace!("[{}] {format} not lockable as flex YUV: {e}", self.name);
                }
            }

            let (width, height) = (buffer.width(), buffer.height());
            if width % 2 == 0 && height % 2 == 0 && pipeline.ensure_initialized(width, height) {
                match pipeline.convert(buffer.as_ref()) {
                    Ok(Some(scratch)) => {
                        let base = scratch.as_ptr();
                        let luma_len = width as usize * height as usize;
                        view.data = base;
                        view.stride = width;
                        // SAFETY: the scratch holds width * height * 3 / 2 bytes.
                        unsafe {
                            view.data_cb = base.add(luma_len);
                            view.data_cr = base.add(luma_len + 1);
                        }
                        view.chroma_stride = width;
                        view.chroma_step = 2;
                        view.flex_format = PixelFormat::YCbCr420888;
                        return Ok((view, LockedMemory::Converted(scratch), LockPath::Converted));
                    }
                    Ok(None) => {
                        debug!(
                            "[{}] {format} buffer not importable for readback, mapping directly",
                            self.name
                        );
                    }
                    Err(e) => {
                        error!("[{}] GPU readback of {format} buffer failed: {e}", self.name);
                        return Err(e);
                    }
                }
            }
        }

        let fence = dup_acquire_fence(&item.fence)?;
        let data = buffer
            .lock(CPU_READ_USAGE, item.crop, fence)
            .map_err(|e| {
                error!("[{}] Unable to lock buffer for CPU reading: {e}", self.name);
                ConsumerError::from(e)
            })?;
        view.data = data.as_ptr();
        view.stride = buffer.stride();
        Ok((view, LockedMemory::Mapped, LockPath::Plain))
    }
}

fn dup_acquire_fence(fence: &Fence) -> Result<Option<OwnedFd>, ConsumerError> {
    fence.dup().map_err(|e| {
        let status = e.raw_os_error().map_or(status::UNKNOWN_ERROR, |errno| -errno);
        ConsumerError::Io(BufferError::new(status, format!("failed to dup acquire fence: {e}")))
    })
}

impl fmt::Debug for CpuConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CpuConsumer")
            .field("name", &self.name)
            .field("max_locked", &self.max_locked)
            .finish_non_exhaustive()
    }
}

impl Drop for CpuConsumer {
    fn drop(&mut self) {
        let state = self.inner.get_mut();
        for vacated in state.table.drain() {
            warn!(
                "[{}] Releasing buffer in slot {} still locked at teardown",
                self.name, vacated.slot
            );
            let fence = match vacated.memory {
                LockedMemory::Converted(_) => Fence::no_fence(),
                _ => match vacated.buffer.unlock() {
                    Ok(fd) => Fence::from_option(fd),
                    Err(e) => {
                        error!(
                            "[{}] Unable to unlock graphic buffer in slot {}: {e}",
                            self.name, vacated.slot
                        );
                        Fence::no_fence()
                    }
                },
            };
            if let Err(e) = state
                .queue
                .release_buffer(vacated.slot, &vacated.buffer, fence)
            {
                warn!(
                    "[{}] Failed to release buffer in slot {}: {e}",
                    self.name, vacated.slot
                );
            }
        }
        state.pipeline.destroy();
        debug!("[{}] CpuConsumer destroyed", self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConversionConfig;
    use crate::memory::{MemoryBufferQueue, MemoryGraphicBuffer};

    fn consumer(max: usize) -> (CpuConsumer, MemoryBufferQueue) {
        let queue = MemoryBufferQueue::new();
        let config = ConsumerConfig::new(max)
            .with_name("test")
            .with_conversion(ConversionConfig::disabled());
        let Ok(consumer) = CpuConsumer::with_readback(queue.clone(), config, None) else {
            panic!("consumer should connect");
        };
        (consumer, queue)
    }

    fn queue_new(queue: &MemoryBufferQueue, slot: usize, buffer: MemoryGraphicBuffer) -> Arc<MemoryGraphicBuffer> {
        let buffer = Arc::new(buffer);
        let Ok(_) = queue.queue_buffer(slot, buffer.clone()) else {
            panic!("slot {slot} should be free");
        };
        buffer
    }

    #[test]
    fn test_handshake() {
        let (consumer, queue) = consumer(3);
        assert!(queue.is_connected());
        assert_eq!(queue.consumer_usage(), BufferUsage::SW_READ_OFTEN);
        assert_eq!(queue.max_acquired_buffer_count(), Some(3));
        assert_eq!(consumer.max_locked_buffers(), 3);
        assert_eq!(consumer.name(), "test");
    }

    #[test]
    fn test_zero_bound_is_rejected() {
        let queue = MemoryBufferQueue::new();
        let result = CpuConsumer::with_readback(queue.clone(), ConsumerConfig::new(0), None);
        assert!(matches!(result, Err(ConsumerError::InvalidArgument(_))));
        assert!(!queue.is_connected());
    }

    #[test]
    fn test_flex_lock_exposes_planes() {
        let (consumer, queue) = consumer(1);
        let buffer = queue_new(
            &queue,
            0,
            MemoryGraphicBuffer::new(4, 2, PixelFormat::YCbCr420888).with_stride(8),
        );

        let Ok(view) = consumer.lock_next_buffer() else {
            panic!("lock should succeed");
        };
        assert!(view.is_ycbcr());
        assert_eq!(view.flex_format, PixelFormat::YCbCr420888);
        assert_eq!(view.stride, 8);
        assert_eq!(view.chroma_step, 2);
        assert_eq!(view.data_cr as usize - view.data_cb as usize, 1);
        assert!(buffer.is_locked());
        assert_eq!(consumer.stats().flex_locks, 1);

        assert!(consumer.unlock_buffer(&view).is_ok());
        assert!(!buffer.is_locked());
    }

    #[test]
    fn test_rgb_takes_plain_path() {
        let (consumer, queue) = consumer(1);
        let buffer = queue_new(&queue, 0, MemoryGraphicBuffer::new(4, 4, PixelFormat::Rgba8888));

        let Ok(view) = consumer.lock_next_buffer() else {
            panic!("lock should succeed");
        };
        assert!(!view.is_ycbcr());
        assert!(view.data_cr.is_null());
        assert_eq!(view.chroma_stride, 0);
        assert_eq!(view.flex_format, PixelFormat::Rgba8888);
        assert_eq!(view.stride, 4);
        // RGB formats never try the flex path
        assert_eq!(buffer.lock_calls(), 1);
        assert!(consumer.unlock_buffer(&view).is_ok());
    }

    #[test]
    fn test_flexible_format_lock_failure_is_fatal() {
        let (consumer, queue) = consumer(1);
        let buffer = queue_new(&queue, 0, MemoryGraphicBuffer::new(4, 4, PixelFormat::YCbCr420888));
        buffer.fail_next_lock(BufferError::busy("held by encoder"));

        let Err(err) = consumer.lock_next_buffer() else {
            panic!("lock should fail");
        };
        assert_eq!(err.as_status(), status::BUSY);
        assert_eq!(buffer.lock_calls(), 1);
        assert_eq!(consumer.locked_buffer_count(), 0);
        assert_eq!(queue.release_count(), 1);
        assert_eq!(consumer.stats().failed_locks, 1);
    }

    #[test]
    fn test_other_yuv_lock_failure_falls_through() {
        let (consumer, queue) = consumer(1);
        let buffer = queue_new(&queue, 0, MemoryGraphicBuffer::new(4, 4, PixelFormat::YCbCr422I));

        let Ok(view) = consumer.lock_next_buffer() else {
            panic!("plain lock should succeed");
        };
        assert_eq!(buffer.lock_calls(), 2);
        assert_eq!(view.flex_format, PixelFormat::YCbCr422I);
        assert_eq!(consumer.stats().plain_locks, 1);
        assert!(consumer.unlock_buffer(&view).is_ok());
    }

    #[test]
    fn test_unresolvable_handle_is_invalid_state() {
        let (consumer, queue) = consumer(1);
        queue.queue_item(BufferItem::cached(9));

        let err = consumer.lock_next_buffer().err();
        assert!(matches!(err, Some(ConsumerError::InvalidState(_))));
        assert_eq!(consumer.locked_buffer_count(), 0);
        assert_eq!(queue.acquired_count(), 0);
        let released = queue.take_released();
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].slot, 9);
        assert!(!released[0].fence.is_valid());

        // The queue's acquired budget is intact
        let buffer = queue_new(&queue, 0, MemoryGraphicBuffer::new(2, 2, PixelFormat::Rgba8888));
        let Ok(view) = consumer.lock_next_buffer() else {
            panic!("lock after an unresolved slot should succeed");
        };
        assert!(buffer.is_locked());
        assert!(consumer.unlock_buffer(&view).is_ok());
    }

    #[test]
    fn test_cached_handle_resolves() {
        let (consumer, queue) = consumer(1);
        let buffer = queue_new(&queue, 2, MemoryGraphicBuffer::new(2, 2, PixelFormat::Rgba8888));
        let Ok(view) = consumer.lock_next_buffer() else {
            panic!("first lock should succeed");
        };
        assert!(consumer.unlock_buffer(&view).is_ok());

        // Same buffer again: the item arrives without a handle
        assert!(queue.queue_buffer(2, buffer.clone()).is_ok());
        let Ok(view) = consumer.lock_next_buffer() else {
            panic!("second lock should resolve via the slot cache");
        };
        assert_eq!(view.frame_number, 2);
        assert!(buffer.is_locked());
        assert!(consumer.unlock_buffer(&view).is_ok());
    }

    #[test]
    fn test_default_view_is_rejected() {
        let (consumer, _queue) = consumer(1);
        let err = consumer.unlock_buffer(&LockedBufferView::default());
        assert!(matches!(err, Err(ConsumerError::InvalidArgument(_))));
    }

    #[test]
    fn test_drop_releases_held_buffers() {
        let (consumer, queue) = consumer(2);
        let a = queue_new(&queue, 0, MemoryGraphicBuffer::new(2, 2, PixelFormat::Rgba8888));
        let b = queue_new(&queue, 1, MemoryGraphicBuffer::new(2, 2, PixelFormat::YCbCr420888));
        assert!(consumer.lock_next_buffer().is_ok());
        assert!(consumer.lock_next_buffer().is_ok());

        drop(consumer);
        assert!(!a.is_locked());
        assert!(!b.is_locked());
        assert_eq!(queue.release_count(), 2);
        assert_eq!(queue.acquired_count(), 0);
    }
}
