//! Offscreen render-and-copy readback on wgpu.
//!
//! Per frame: import the buffer as a texture, draw it as a full-target quad
//! into an `Rgba8Unorm` render target, copy the target into a staging buffer
//! with 256-byte aligned rows, map it, and strip the row padding.

use std::sync::mpsc;

use tracing::{debug, info, warn};

use crate::buffer::GraphicBuffer;
use crate::pipeline::{GpuReadback, ReadbackError};

/// Full-target quad sampling the imported buffer.
///
/// Texture row 0 lands on target row 0, so the readback is top row first.
const READBACK_SHADER: &str = r#"
struct VertexOutput {
    @builtin(position) position: vec4<f32>,
    @location(0) tex_coord: vec2<f32>,
};

@vertex
fn vs_main(@builtin(vertex_index) vertex_index: u32) -> VertexOutput {
    var positions = array<vec2<f32>, 6>(
        vec2<f32>(-1.0, -1.0),
        vec2<f32>( 1.0, -1.0),
        vec2<f32>(-1.0,  1.0),
        vec2<f32>(-1.0,  1.0),
        vec2<f32>( 1.0, -1.0),
        vec2<f32>( 1.0,  1.0),
    );
    var tex_coords = array<vec2<f32>, 6>(
        vec2<f32>(0.0, 1.0),
        vec2<f32>(1.0, 1.0),
        vec2<f32>(0.0, 0.0),
        vec2<f32>(0.0, 0.0),
        vec2<f32>(1.0, 1.0),
        vec2<f32>(1.0, 0.0),
    );

    var output: VertexOutput;
    output.position = vec4<f32>(positions[vertex_index], 0.0, 1.0);
    output.tex_coord = tex_coords[vertex_index];
    return output;
}

@group(0) @binding(0) var buffer_texture: texture_2d<f32>;
@group(0) @binding(1) var buffer_sampler: sampler;

@fragment
fn fs_main(input: VertexOutput) -> @location(0) vec4<f32> {
    return textureSample(buffer_texture, buffer_sampler, input.tex_coord);
}
"#;

const TARGET_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

/// Row pitch of the staging buffer for a `width`-pixel RGBA8 row.
fn padded_bytes_per_row(width: u32) -> u32 {
    let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
    (width * 4).div_ceil(align) * align
}

/// Copies `height` rows of `width * 4` bytes out of a padded staging image.
fn strip_row_padding(padded: &[u8], padded_row: usize, width: usize, height: usize, out: &mut [u8]) {
    let row = width * 4;
    if padded_row == row {
        out[..row * height].copy_from_slice(&padded[..row * height]);
        return;
    }
    for (dst, src) in out
        .chunks_exact_mut(row)
        .zip(padded.chunks(padded_row))
        .take(height)
    {
        dst.copy_from_slice(&src[..row]);
    }
}

struct ReadbackContext {
    device: wgpu::Device,
    queue: wgpu::Queue,
    pipeline: wgpu::RenderPipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    sampler: wgpu::Sampler,
    target: wgpu::Texture,
    target_view: wgpu::TextureView,
    staging: wgpu::Buffer,
    width: u32,
    height: u32,
    padded_row: u32,
}

impl ReadbackContext {
    fn new(width: u32, height: u32) -> Result<Self, String> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::LowPower,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .ok_or_else(|| "no GPU adapter available".to_string())?;

        let adapter_info = adapter.get_info();
        info!(
            "GPU readback using {} ({:?})",
            adapter_info.name, adapter_info.backend
        );

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("cpu_consumer_readback"),
                ..Default::default()
            },
            None,
        ))
        .map_err(|e| format!("failed to create device: {e}"))?;

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("readback_shader"),
            source: wgpu::ShaderSource::Wgsl(READBACK_SHADER.into()),
        });

        // Target and source are the same size; nearest sampling keeps texels exact.
        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("readback_sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Nearest,
            min_filter: wgpu::FilterMode::Nearest,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("readback_bind_group_layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("readback_pipeline_layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("readback_pipeline"),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &shader,
                entry_point: Some("vs_main"),
                buffers: &[],
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: &shader,
                entry_point: Some("fs_main"),
                targets: &[Some(wgpu::ColorTargetState {
                    format: TARGET_FORMAT,
                    blend: Some(wgpu::BlendState::REPLACE),
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            }),
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                cull_mode: None,
                ..Default::default()
            },
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
            cache: None,
        });

        let target = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("readback_target"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: TARGET_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let target_view = target.create_view(&wgpu::TextureViewDescriptor::default());

        let padded_row = padded_bytes_per_row(width);
        let staging = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback_staging"),
            size: u64::from(padded_row) * u64::from(height),
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        Ok(Self {
            device,
            queue,
            pipeline,
            bind_group_layout,
            sampler,
            target,
            target_view,
            staging,
            width,
            height,
            padded_row,
        })
    }

    fn read(&self, buffer: &dyn GraphicBuffer, out: &mut [u8]) -> Result<(), ReadbackError> {
        let needed = self.width as usize * self.height as usize * 4;
        if out.len() < needed {
            return Err(ReadbackError::Failed(format!(
                "output holds {} bytes, need {needed}",
                out.len()
            )));
        }

        let texture = buffer
            .import_texture(&self.device, &self.queue)
            .ok_or(ReadbackError::NotImportable)?;
        let texture_view = texture.create_view(&wgpu::TextureViewDescriptor::default());

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("readback_bind_group"),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(&texture_view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Sampler(&self.sampler),
                },
            ],
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("readback_encoder"),
            });

        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("readback_pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &self.target_view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.draw(0..6, 0..1);
        }

        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &self.target,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &self.staging,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(self.padded_row),
                    rows_per_image: Some(self.height),
                },
            },
            wgpu::Extent3d {
                width: self.width,
                height: self.height,
                depth_or_array_layers: 1,
            },
        );

        self.queue.submit(std::iter::once(encoder.finish()));

        let slice = self.staging.slice(..);
        let (sender, receiver) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        let _ = self.device.poll(wgpu::Maintain::Wait);

        receiver
            .recv()
            .map_err(|_| ReadbackError::Failed("staging map callback dropped".into()))?
            .map_err(|e| ReadbackError::Failed(format!("failed to map staging buffer: {e:?}")))?;

        {
            let data = slice.get_mapped_range();
            strip_row_padding(
                &data,
                self.padded_row as usize,
                self.width as usize,
                self.height as usize,
                out,
            );
        }
        self.staging.unmap();
        texture.destroy();
        Ok(())
    }

    fn destroy(self) {
        self.target.destroy();
        self.staging.destroy();
        self.device.destroy();
    }
}

/// [`GpuReadback`] on a private wgpu device.
///
/// The device is created on [`init`](GpuReadback::init), not on construction,
/// so building one is free when the vendor gate keeps conversion off.
#[derive(Default)]
pub struct WgpuReadback {
    context: Option<ReadbackContext>,
}

impl WgpuReadback {
    pub fn new() -> Self {
        Self::default()
    }
}

impl GpuReadback for WgpuReadback {
    fn init(&mut self, width: u32, height: u32) -> Result<(), String> {
        if self.context.is_some() {
            warn!("GPU readback already initialized");
            return Ok(());
        }
        let context = ReadbackContext::new(width, height)?;
        debug!(
            "GPU readback target {width}x{height}, staging row pitch {}",
            context.padded_row
        );
        self.context = Some(context);
        Ok(())
    }

    fn read_rgba(&mut self, buffer: &dyn GraphicBuffer, out: &mut [u8]) -> Result<(), ReadbackError> {
        let Some(context) = self.context.as_ref() else {
            return Err(ReadbackError::Failed("readback not initialized".into()));
        };
        context.read(buffer, out)
    }

    fn destroy(&mut self) {
        if let Some(context) = self.context.take() {
            context.destroy();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_padding_alignment() {
        assert_eq!(padded_bytes_per_row(64), 256);
        assert_eq!(padded_bytes_per_row(65), 512);
        assert_eq!(padded_bytes_per_row(2), 256);
    }

    #[test]
    fn test_strip_row_padding() {
        // 2x2 image, rows padded to 12 bytes
        let mut padded = vec![0xEEu8; 24];
        padded[..8].copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        padded[12..20].copy_from_slice(&[9, 10, 11, 12, 13, 14, 15, 16]);
        let mut out = vec![0u8; 16];

        strip_row_padding(&padded, 12, 2, 2, &mut out);

        assert_eq!(out, (1..=16).collect::<Vec<u8>>());
    }

    #[test]
    fn test_read_before_init_fails() {
        let mut readback = WgpuReadback::new();
        let buffer =
            crate::memory::MemoryGraphicBuffer::new(2, 2, crate::PixelFormat::Rgba8888);
        let mut out = vec![0u8; 16];
        assert!(matches!(
            readback.read_rgba(&buffer, &mut out),
            Err(ReadbackError::Failed(_))
        ));
        readback.destroy();
    }
}
