//! wgpu-backed GPU readback.
//!
//! Enabled with the `gpu` cargo feature. Buffers reach the GPU through
//! [`GraphicBuffer::import_texture`](crate::GraphicBuffer::import_texture);
//! buffers that cannot be imported fall back to direct mapping.

mod wgpu_readback;

pub use wgpu_readback::WgpuReadback;
