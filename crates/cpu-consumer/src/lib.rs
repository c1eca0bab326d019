//! cpu-consumer: CPU read access to buffers from a graphics buffer queue.
//!
//! A [`CpuConsumer`] acquires buffers from a producer through a [`BufferQueue`],
//! maps them for software reading and hands them back with a release fence.
//! It contains:
//!
//! - Lock/unlock engine with a bounded number of outstanding views: [`consumer`], [`slots`]
//! - Pixel formats and frame metadata: [`format`]
//! - External collaborator seams: [`buffer`], [`queue`], [`fence`]
//! - GPU-mediated readback for opaque YUV layouts: [`pipeline`], `gpu` (feature `gpu`)
//! - BT.601 RGB to 4:2:0 conversion: [`convert`]
//! - In-process queue and buffers for tests and demos: [`memory`]
//!
//! Unix only: fences are sync file descriptors.

pub mod buffer;
pub mod config;
pub mod consumer;
pub mod convert;
pub mod error;
pub mod fence;
pub mod format;
pub mod memory;
pub mod pipeline;
pub mod queue;
pub mod slots;
pub mod stats;

#[cfg(feature = "gpu")]
pub mod gpu;

pub use buffer::{BufferError, BufferUsage, GraphicBuffer, YCbCrLayout};
pub use config::{ConsumerConfig, ConversionConfig};
pub use consumer::{CpuConsumer, LockedBufferView};
pub use error::{ConsumerError, ErrorKind};
pub use fence::Fence;
pub use format::{DataSpace, PixelFormat, Rect, ScalingMode, Transform};
pub use pipeline::{ConversionPipeline, GpuReadback, PipelineState, ReadbackError, VendorGate};
pub use queue::{AcquireError, BufferItem, BufferQueue, QueueError};
pub use slots::LockToken;
pub use stats::ConsumerStatsSnapshot;

#[cfg(feature = "gpu")]
pub use gpu::WgpuReadback;
