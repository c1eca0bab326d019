//! In-process buffers and queue.
//!
//! [`MemoryGraphicBuffer`] backs a "hardware" buffer with a heap allocation and
//! [`MemoryBufferQueue`] is a minimal producer/consumer queue over such buffers.
//! Both record what the consumer did to them and can inject failures, which is
//! what the tests and the demo use them for.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::os::fd::OwnedFd;
use std::ptr::NonNull;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::buffer::{BufferError, BufferUsage, GraphicBuffer, YCbCrLayout};
use crate::error::status;
use crate::fence::Fence;
use crate::format::{PixelFormat, Rect};
use crate::queue::{AcquireError, BufferItem, BufferQueue, QueueError, NUM_BUFFER_SLOTS};

#[derive(Default)]
struct BufferState {
    locked: bool,
    lock_calls: usize,
    unlock_calls: usize,
    acquire_fences_seen: usize,
    fail_next_lock: Option<BufferError>,
    fail_next_unlock: Option<BufferError>,
    unlock_fence: Option<OwnedFd>,
}

/// Heap-backed graphic buffer.
///
/// Memory holds `stride * height * 4` bytes, enough for any supported format.
/// A flexible-YUV lock exposes it as NV12: a luma plane of `stride`-byte rows
/// followed by interleaved Cb/Cr rows.
pub struct MemoryGraphicBuffer {
    width: u32,
    height: u32,
    stride: u32,
    format: PixelFormat,
    flex_supported: bool,
    cpu_mappable: bool,
    gpu_importable: bool,
    pixels: Mutex<Vec<u8>>,
    state: Mutex<BufferState>,
}

impl MemoryGraphicBuffer {
    /// Creates a zero-filled buffer. Planar and semi-planar YUV formats support
    /// flexible locks; everything is CPU-mappable and GPU-importable.
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        let flex_supported = matches!(
            format,
            PixelFormat::YCbCr420888
                | PixelFormat::Yv12
                | PixelFormat::YCrCb420Sp
                | PixelFormat::YCbCr422Sp
        );
        Self {
            width,
            height,
            stride: width,
            format,
            flex_supported,
            cpu_mappable: true,
            gpu_importable: true,
            pixels: Mutex::new(vec![0; width as usize * height as usize * 4]),
            state: Mutex::new(BufferState::default()),
        }
    }

    /// Pads rows to `stride` pixels.
    pub fn with_stride(mut self, stride: u32) -> Self {
        let stride = stride.max(self.width);
        self.stride = stride;
        self.pixels = Mutex::new(vec![0; stride as usize * self.height as usize * 4]);
        self
    }

    pub fn with_flex_support(mut self, supported: bool) -> Self {
        self.flex_supported = supported;
        self
    }

    pub fn with_cpu_mappable(mut self, mappable: bool) -> Self {
        self.cpu_mappable = mappable;
        self
    }

    pub fn with_gpu_importable(mut self, importable: bool) -> Self {
        self.gpu_importable = importable;
        self
    }

    /// Overwrites the buffer memory, as a producer would. Fails while the
    /// buffer is locked.
    pub fn write_pixels(&self, write: impl FnOnce(&mut [u8])) -> Result<(), BufferError> {
        if self.state.lock().locked {
            return Err(BufferError::busy("buffer is locked for reading"));
        }
        write(&mut self.pixels.lock());
        Ok(())
    }

    /// Fills every byte with `value`.
    pub fn fill(&self, value: u8) -> Result<(), BufferError> {
        self.write_pixels(|px| px.fill(value))
    }

    /// Makes the next lock (either kind) fail with `err`.
    pub fn fail_next_lock(&self, err: BufferError) {
        self.state.lock().fail_next_lock = Some(err);
    }

    /// Makes the next unlock fail with `err`. The buffer stays locked.
    pub fn fail_next_unlock(&self, err: BufferError) {
        self.state.lock().fail_next_unlock = Some(err);
    }

    /// Hands `fence` back from the next successful unlock.
    pub fn set_unlock_fence(&self, fence: OwnedFd) {
        self.state.lock().unlock_fence = Some(fence);
    }

    pub fn is_locked(&self) -> bool {
        self.state.lock().locked
    }

    /// Successful and failed lock attempts.
    pub fn lock_calls(&self) -> usize {
        self.state.lock().lock_calls
    }

    pub fn unlock_calls(&self) -> usize {
        self.state.lock().unlock_calls
    }

    /// Lock calls that were handed an acquire fence.
    pub fn acquire_fences_seen(&self) -> usize {
        self.state.lock().acquire_fences_seen
    }

    fn begin_lock(&self, acquire_fence: Option<OwnedFd>) -> Result<(), BufferError> {
        let mut state = self.state.lock();
        state.lock_calls += 1;
        if acquire_fence.is_some() {
            state.acquire_fences_seen += 1;
        }
        // The fence is dropped here; in-memory writes are already complete.
        if let Some(err) = state.fail_next_lock.take() {
            return Err(err);
        }
        if state.locked {
            return Err(BufferError::busy("buffer is already locked"));
        }
        Ok(())
    }

    fn base_ptr(&self) -> Result<NonNull<u8>, BufferError> {
        NonNull::new(self.pixels.lock().as_mut_ptr())
            .ok_or_else(|| BufferError::new(status::NO_MEMORY, "buffer has no memory"))
    }
}

impl fmt::Debug for MemoryGraphicBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryGraphicBuffer")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("stride", &self.stride)
            .field("format", &self.format)
            .finish()
    }
}

impl GraphicBuffer for MemoryGraphicBuffer {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn stride(&self) -> u32 {
        self.stride
    }

    fn format(&self) -> PixelFormat {
        self.format
    }

    fn lock(
        &self,
        usage: BufferUsage,
        _crop: Rect,
        acquire_fence: Option<OwnedFd>,
    ) -> Result<NonNull<u8>, BufferError> {
        self.begin_lock(acquire_fence)?;
        if !usage.contains(BufferUsage::SW_READ_RARELY) {
            return Err(BufferError::unsupported("usage does not include CPU reads"));
        }
        if !self.cpu_mappable {
            return Err(BufferError::unsupported("buffer is not CPU-mappable"));
        }
        let base = self.base_ptr()?;
        self.state.lock().locked = true;
        Ok(base)
    }

    fn lock_ycbcr(
        &self,
        _usage: BufferUsage,
        _crop: Rect,
        acquire_fence: Option<OwnedFd>,
    ) -> Result<YCbCrLayout, BufferError> {
        self.begin_lock(acquire_fence)?;
        if !self.flex_supported || !self.cpu_mappable {
            return Err(BufferError::unsupported(format!(
                "{} cannot be locked as flexible YUV",
                self.format
            )));
        }
        let y = self.base_ptr()?;
        let luma_len = self.stride as usize * self.height as usize;
        // SAFETY: the allocation holds stride * height * 4 bytes, so both chroma
        // offsets stay in bounds.
        let (cb, cr) = unsafe { (y.add(luma_len), y.add(luma_len + 1)) };
        self.state.lock().locked = true;
        Ok(YCbCrLayout {
            y,
            cb,
            cr,
            y_stride: self.stride,
            c_stride: self.stride,
            chroma_step: 2,
        })
    }

    fn unlock(&self) -> Result<Option<OwnedFd>, BufferError> {
        let mut state = self.state.lock();
        state.unlock_calls += 1;
        if let Some(err) = state.fail_next_unlock.take() {
            return Err(err);
        }
        if !state.locked {
            return Err(BufferError::new(
                status::INVALID_OPERATION,
                "buffer is not locked",
            ));
        }
        state.locked = false;
        Ok(state.unlock_fence.take())
    }

    /// Uploads the first `width * height * 4` bytes as an RGBA8 texture.
    #[cfg(feature = "gpu")]
    fn import_texture(&self, device: &wgpu::Device, queue: &wgpu::Queue) -> Option<wgpu::Texture> {
        if !self.gpu_importable {
            return None;
        }
        let size = wgpu::Extent3d {
            width: self.width,
            height: self.height,
            depth_or_array_layers: 1,
        };
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("memory_graphic_buffer"),
            size,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            &self.pixels.lock(),
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(self.stride * 4),
                rows_per_image: Some(self.height),
            },
            size,
        );
        Some(texture)
    }
}

/// A buffer handed back by the consumer.
#[derive(Debug)]
pub struct ReleaseRecord {
    pub slot: usize,
    pub frame_number: Option<u64>,
    pub fence: Fence,
}

#[derive(Default)]
struct QueueState {
    connected: bool,
    abandoned: bool,
    controlled_by_app: bool,
    usage: BufferUsage,
    max_acquired: Option<usize>,
    pending: VecDeque<BufferItem>,
    slots: HashMap<usize, Arc<dyn GraphicBuffer>>,
    /// Slot -> frame number of the acquired item
    acquired: HashMap<usize, u64>,
    acquire_calls: usize,
    next_frame_number: u64,
    released: Vec<ReleaseRecord>,
    fail_next_release: Option<QueueError>,
}

/// Cloneable handle to an in-memory buffer queue.
///
/// One clone goes to the consumer (as its [`BufferQueue`]), the others act as
/// the producer and as a probe for tests.
#[derive(Clone, Default)]
pub struct MemoryBufferQueue {
    inner: Arc<Mutex<QueueState>>,
}

impl MemoryBufferQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `buffer` in `slot` with a fresh frame number.
    ///
    /// The buffer handle is sent only when the slot is new or reallocated;
    /// otherwise the item relies on the consumer's slot cache. Fails if the
    /// slot is pending or held by the consumer.
    pub fn queue_buffer(&self, slot: usize, buffer: Arc<dyn GraphicBuffer>) -> Result<u64, QueueError> {
        let mut state = self.inner.lock();
        if slot >= NUM_BUFFER_SLOTS {
            return Err(QueueError::new(status::BAD_VALUE, format!("slot {slot} out of range")));
        }
        if state.abandoned {
            return Err(QueueError::abandoned());
        }
        if state.acquired.contains_key(&slot) || state.pending.iter().any(|i| i.slot == slot) {
            return Err(QueueError::new(status::BAD_VALUE, format!("slot {slot} is busy")));
        }

        state.next_frame_number += 1;
        let frame_number = state.next_frame_number;
        let reused = state
            .slots
            .get(&slot)
            .is_some_and(|cached| Arc::ptr_eq(cached, &buffer));

        let crop = Rect::from_size(buffer.width(), buffer.height());
        let item = if reused {
            BufferItem::cached(slot).with_crop(crop)
        } else {
            state.slots.insert(slot, Arc::clone(&buffer));
            BufferItem::new(slot, buffer)
        };
        state.pending.push_back(
            item.with_frame_number(frame_number)
                .with_timestamp(frame_number as i64 * 16_666_667),
        );
        Ok(frame_number)
    }

    /// Queues a prebuilt item unchanged. Its buffer, if any, is recorded for the slot.
    pub fn queue_item(&self, item: BufferItem) {
        let mut state = self.inner.lock();
        if let Some(buffer) = &item.graphic_buffer {
            state.slots.insert(item.slot, Arc::clone(buffer));
        }
        state.next_frame_number = state.next_frame_number.max(item.frame_number);
        state.pending.push_back(item);
    }

    /// Slots neither pending nor held by the consumer, among `0..count`.
    pub fn free_slots(&self, count: usize) -> Vec<usize> {
        let state = self.inner.lock();
        (0..count.min(NUM_BUFFER_SLOTS))
            .filter(|slot| {
                !state.acquired.contains_key(slot) && !state.pending.iter().any(|i| i.slot == *slot)
            })
            .collect()
    }

    /// Makes every later acquire fail.
    pub fn abandon(&self) {
        self.inner.lock().abandoned = true;
    }

    pub fn fail_next_release(&self, err: QueueError) {
        self.inner.lock().fail_next_release = Some(err);
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn acquired_count(&self) -> usize {
        self.inner.lock().acquired.len()
    }

    /// Calls to `acquire_buffer`, including ones that found nothing.
    pub fn acquire_calls(&self) -> usize {
        self.inner.lock().acquire_calls
    }

    pub fn release_count(&self) -> usize {
        self.inner.lock().released.len()
    }

    pub fn take_released(&self) -> Vec<ReleaseRecord> {
        std::mem::take(&mut self.inner.lock().released)
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock().connected
    }

    pub fn controlled_by_app(&self) -> bool {
        self.inner.lock().controlled_by_app
    }

    pub fn consumer_usage(&self) -> BufferUsage {
        self.inner.lock().usage
    }

    pub fn max_acquired_buffer_count(&self) -> Option<usize> {
        self.inner.lock().max_acquired
    }
}

impl BufferQueue for MemoryBufferQueue {
    fn connect(&mut self, controlled_by_app: bool) -> Result<(), QueueError> {
        let mut state = self.inner.lock();
        if state.connected {
            return Err(QueueError::new(
                status::INVALID_OPERATION,
                "consumer already connected",
            ));
        }
        state.connected = true;
        state.controlled_by_app = controlled_by_app;
        Ok(())
    }

    fn set_consumer_usage(&mut self, usage: BufferUsage) -> Result<(), QueueError> {
        self.inner.lock().usage = usage;
        Ok(())
    }

    fn set_max_acquired_buffer_count(&mut self, count: usize) -> Result<(), QueueError> {
        if count == 0 || count > NUM_BUFFER_SLOTS {
            return Err(QueueError::new(
                status::BAD_VALUE,
                format!("max acquired count {count} out of range"),
            ));
        }
        self.inner.lock().max_acquired = Some(count);
        Ok(())
    }

    fn acquire_buffer(&mut self, _present_when_ns: i64) -> Result<BufferItem, AcquireError> {
        let mut state = self.inner.lock();
        state.acquire_calls += 1;
        if state.abandoned {
            return Err(QueueError::abandoned().into());
        }
        if let Some(max) = state.max_acquired {
            if state.acquired.len() >= max {
                return Err(QueueError::new(
                    status::INVALID_OPERATION,
                    format!("max acquired buffer count ({max}) exceeded"),
                )
                .into());
            }
        }
        let item = state
            .pending
            .pop_front()
            .ok_or(AcquireError::NoBufferAvailable)?;
        state.acquired.insert(item.slot, item.frame_number);
        Ok(item)
    }

    fn release_buffer(
        &mut self,
        slot: usize,
        buffer: &Arc<dyn GraphicBuffer>,
        release_fence: Fence,
    ) -> Result<(), QueueError> {
        let mut state = self.inner.lock();
        if let Some(err) = state.fail_next_release.take() {
            return Err(err);
        }
        let matches = state
            .slots
            .get(&slot)
            .is_some_and(|cached| Arc::ptr_eq(cached, buffer));
        if !matches {
            return Err(QueueError::new(
                status::BAD_VALUE,
                format!("slot {slot} does not hold the released buffer"),
            ));
        }
        let Some(frame_number) = state.acquired.remove(&slot) else {
            return Err(QueueError::new(
                status::BAD_VALUE,
                format!("slot {slot} is not acquired"),
            ));
        };
        state.released.push(ReleaseRecord {
            slot,
            frame_number: Some(frame_number),
            fence: release_fence,
        });
        Ok(())
    }

    fn release_slot(&mut self, slot: usize, release_fence: Fence) -> Result<(), QueueError> {
        let mut state = self.inner.lock();
        if let Some(err) = state.fail_next_release.take() {
            return Err(err);
        }
        let Some(frame_number) = state.acquired.remove(&slot) else {
            return Err(QueueError::new(
                status::BAD_VALUE,
                format!("slot {slot} is not acquired"),
            ));
        };
        state.released.push(ReleaseRecord {
            slot,
            frame_number: Some(frame_number),
            fence: release_fence,
        });
        Ok(())
    }

    fn cached_buffer(&self, slot: usize) -> Option<Arc<dyn GraphicBuffer>> {
        self.inner.lock().slots.get(&slot).cloned()
    }
}
