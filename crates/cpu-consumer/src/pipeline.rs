//! GPU-mediated readback for buffers the CPU cannot map directly.
//!
//! Some producers hand out buffers in vendor layouts that gralloc refuses to
//! expose as flexible YUV. On hardware where the GPU driver can sample those
//! buffers, the consumer renders them into an offscreen RGBA target, reads the
//! pixels back, and converts them to 4:2:0 on the CPU.
//!
//! The pipeline is a one-way state machine:
//!
//! ```text
//! Uninitialized ──first eligible buffer──▶ Initialized ──destroy──▶ Destroyed
//!       │                                                              ▲
//!       └───────────────────────────destroy────────────────────────────┘
//! ```
//!
//! Initialization only happens when the vendor gate passes. A closed gate, a
//! missing backend or a failed context creation leaves the pipeline inert and
//! every lock takes the direct-mapping path.

use tracing::{debug, error, info, warn};

use crate::buffer::GraphicBuffer;
use crate::config::{detect_gpu_vendor, ConversionConfig};
use crate::convert::{convert_rgb32_to_planar, planar_420_size, rgba_size};
use crate::error::ConsumerError;

/// Renders a hardware buffer and reads it back as RGBA8.
///
/// Implementations own a rendering context (device, offscreen surface,
/// program). The pipeline calls `init` at most once and `destroy` at most once.
pub trait GpuReadback: Send {
    /// Creates the rendering context with an offscreen target of `width`×`height`.
    fn init(&mut self, width: u32, height: u32) -> Result<(), String>;

    /// Draws `buffer` as a full-target textured quad and copies the result into
    /// `out` as tightly packed RGBA8 rows, top row first.
    fn read_rgba(&mut self, buffer: &dyn GraphicBuffer, out: &mut [u8]) -> Result<(), ReadbackError>;

    /// Releases the rendering context.
    fn destroy(&mut self);
}

/// Why a readback produced no pixels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadbackError {
    /// The buffer cannot be bound as a texture; nothing was rendered
    NotImportable,
    /// Rendering or the copy back to the CPU failed
    Failed(String),
}

impl std::fmt::Display for ReadbackError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReadbackError::NotImportable => write!(f, "buffer cannot be imported as a texture"),
            ReadbackError::Failed(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for ReadbackError {}

/// Lifecycle state of the conversion pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Uninitialized,
    Initialized { width: u32, height: u32 },
    Destroyed,
}

/// Vendor capability check guarding GPU readback.
///
/// GPU readback of opaque buffers is only known to work on some drivers, so
/// the pipeline stays off unless the detected vendor string matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VendorGate {
    required: String,
    detected: String,
}

impl VendorGate {
    pub fn new(required: impl Into<String>, detected: impl Into<String>) -> Self {
        Self {
            required: required.into(),
            detected: detected.into(),
        }
    }

    /// Probes the vendor string as configured.
    pub fn from_config(config: &ConversionConfig) -> Self {
        if !config.is_enabled() {
            return Self::closed();
        }
        Self::new(config.required_vendor.clone(), detect_gpu_vendor(config))
    }

    /// A gate that never passes.
    pub fn closed() -> Self {
        Self::new("", "")
    }

    pub fn passes(&self) -> bool {
        !self.required.is_empty() && self.required == self.detected
    }

    pub fn detected(&self) -> &str {
        &self.detected
    }
}

/// Lazily constructed GPU readback plus the fixed RGBA scratch it fills.
pub struct ConversionPipeline {
    state: PipelineState,
    gate: VendorGate,
    /// Gate verdict, evaluated on first use and never again
    gate_open: Option<bool>,
    backend: Option<Box<dyn GpuReadback>>,
    rgba: Vec<u8>,
}

impl ConversionPipeline {
    pub fn new(gate: VendorGate, backend: Option<Box<dyn GpuReadback>>) -> Self {
        Self {
            state: PipelineState::Uninitialized,
            gate,
            gate_open: None,
            backend,
            rgba: Vec::new(),
        }
    }

    /// A pipeline that never engages.
    pub fn inert() -> Self {
        Self::new(VendorGate::closed(), None)
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, PipelineState::Initialized { .. })
    }

    fn gate_open(&mut self) -> bool {
        if let Some(open) = self.gate_open {
            return open;
        }
        let open = self.backend.is_some() && self.gate.passes();
        if open {
            info!(
                "GPU conversion enabled for vendor '{}'",
                self.gate.detected()
            );
        } else {
            debug!(
                "GPU conversion inert (vendor '{}', backend present: {})",
                self.gate.detected(),
                self.backend.is_some()
            );
        }
        self.gate_open = Some(open);
        open
    }

    /// Makes the pipeline ready for a `width`×`height` buffer.
    ///
    /// Returns false when conversion is unavailable for this buffer, in which
    /// case the caller falls back to direct mapping. The context is sized by
    /// the first buffer that engages it; later buffers of another size are
    /// not converted.
    pub fn ensure_initialized(&mut self, width: u32, height: u32) -> bool {
        match self.state {
            PipelineState::Destroyed => false,
            PipelineState::Initialized {
                width: w,
                height: h,
            } => {
                if (w, h) != (width, height) {
                    warn!("GPU conversion context is {w}x{h}, cannot convert {width}x{height} buffer");
                    return false;
                }
                true
            }
            PipelineState::Uninitialized => {
                if !self.gate_open() {
                    return false;
                }
                let Some(backend) = self.backend.as_mut() else {
                    return false;
                };
                match backend.init(width, height) {
                    Ok(()) => {
                        self.rgba = vec![0; rgba_size(width as usize, height as usize)];
                        self.state = PipelineState::Initialized { width, height };
                        debug!(
                            "GPU conversion context initialized: {width}x{height}, rgba scratch {} bytes",
                            self.rgba.len()
                        );
                        true
                    }
                    Err(e) => {
                        error!("GPU conversion context init failed, disabling conversion: {e}");
                        self.gate_open = Some(false);
                        false
                    }
                }
            }
        }
    }

    /// Reads `buffer` back through the GPU and converts it to 4:2:0.
    ///
    /// Returns the scratch buffer holding the luma plane followed by the
    /// interleaved chroma plane, both with a stride of the buffer width, or
    /// `None` if the backend cannot import this buffer.
    pub fn convert(&mut self, buffer: &dyn GraphicBuffer) -> Result<Option<Vec<u8>>, ConsumerError> {
        let PipelineState::Initialized { width, height } = self.state else {
            return Err(ConsumerError::Gpu(format!(
                "conversion requested in state {:?}",
                self.state
            )));
        };
        let Some(backend) = self.backend.as_mut() else {
            return Err(ConsumerError::Gpu("no readback backend".into()));
        };

        match backend.read_rgba(buffer, &mut self.rgba) {
            Ok(()) => {}
            Err(ReadbackError::NotImportable) => return Ok(None),
            Err(ReadbackError::Failed(msg)) => return Err(ConsumerError::Gpu(msg)),
        }

        let (w, h) = (width as usize, height as usize);
        let mut scratch = vec![0u8; planar_420_size(w, h)];
        convert_rgb32_to_planar(&mut scratch, w, &self.rgba, w, h, w * 4, false);
        Ok(Some(scratch))
    }

    /// Tears the context down. Safe to call repeatedly; only the first call
    /// after initialization touches the backend.
    pub fn destroy(&mut self) {
        if let PipelineState::Initialized { .. } = self.state {
            if let Some(backend) = self.backend.as_mut() {
                backend.destroy();
            }
            self.rgba = Vec::new();
            debug!("GPU conversion context destroyed");
        }
        self.state = PipelineState::Destroyed;
    }
}

impl Drop for ConversionPipeline {
    fn drop(&mut self) {
        self.destroy();
    }
}
