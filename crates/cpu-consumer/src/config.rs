//! Consumer configuration.
//!
//! Environment variables (read when a consumer is created):
//! - `CPU_CONSUMER_DISABLE_CONVERSION=1|true` keeps GPU readback off
//! - `CPU_CONSUMER_EGL_VENDOR=<name>` overrides the detected GPU vendor

use tracing::debug;

use crate::error::ConsumerError;

/// GPU vendor whose driver is known to sample opaque YUV buffers correctly.
pub const DEFAULT_REQUIRED_VENDOR: &str = "powervr";

/// Vendor reported when nothing else is known.
pub const UNKNOWN_VENDOR: &str = "default";

const DISABLE_CONVERSION_ENV: &str = "CPU_CONSUMER_DISABLE_CONVERSION";
const VENDOR_ENV: &str = "CPU_CONSUMER_EGL_VENDOR";

/// Settings for a [`CpuConsumer`](crate::CpuConsumer).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    /// Prefix for log lines
    pub name: String,
    /// How many buffers the CPU may hold locked at once. Must be at least 1.
    pub max_locked_buffers: usize,
    /// Whether the consumer shares queue access control with the app
    pub controlled_by_app: bool,
    pub conversion: ConversionConfig,
}

impl ConsumerConfig {
    pub fn new(max_locked_buffers: usize) -> Self {
        Self {
            name: "CpuConsumer".to_string(),
            max_locked_buffers,
            controlled_by_app: false,
            conversion: ConversionConfig::default(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_controlled_by_app(mut self, controlled_by_app: bool) -> Self {
        self.controlled_by_app = controlled_by_app;
        self
    }

    pub fn with_conversion(mut self, conversion: ConversionConfig) -> Self {
        self.conversion = conversion;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), ConsumerError> {
        if self.max_locked_buffers == 0 {
            return Err(ConsumerError::InvalidArgument(
                "max_locked_buffers must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self::new(1)
    }
}

/// GPU readback settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionConfig {
    /// Master switch. Also forced off by `CPU_CONSUMER_DISABLE_CONVERSION`.
    pub enabled: bool,
    /// Vendor string the detected GPU must match exactly
    pub required_vendor: String,
    /// Skips detection and uses this vendor string instead
    pub vendor_override: Option<String>,
}

impl ConversionConfig {
    /// Conversion switched off.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn with_required_vendor(mut self, vendor: impl Into<String>) -> Self {
        self.required_vendor = vendor.into();
        self
    }

    pub fn with_vendor_override(mut self, vendor: impl Into<String>) -> Self {
        self.vendor_override = Some(vendor.into());
        self
    }

    /// Whether conversion may run, after applying the environment kill switch.
    pub fn is_enabled(&self) -> bool {
        self.enabled && !env_flag(DISABLE_CONVERSION_ENV)
    }
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            required_vendor: DEFAULT_REQUIRED_VENDOR.to_string(),
            vendor_override: None,
        }
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(false)
}

/// Resolves the GPU vendor string.
///
/// Order: configured override, `CPU_CONSUMER_EGL_VENDOR`, the
/// `ro.hardware.egl` system property on Android, then [`UNKNOWN_VENDOR`].
pub fn detect_gpu_vendor(config: &ConversionConfig) -> String {
    if let Some(vendor) = &config.vendor_override {
        return vendor.clone();
    }
    if let Ok(vendor) = std::env::var(VENDOR_ENV) {
        if !vendor.is_empty() {
            debug!("GPU vendor '{vendor}' from {VENDOR_ENV}");
            return vendor;
        }
    }
    if let Some(vendor) = system_egl_vendor() {
        debug!("GPU vendor '{vendor}' from ro.hardware.egl");
        return vendor;
    }
    UNKNOWN_VENDOR.to_string()
}

#[cfg(target_os = "android")]
fn system_egl_vendor() -> Option<String> {
    use std::ffi::CStr;

    // Bionic's PROP_VALUE_MAX
    const PROP_VALUE_MAX: usize = 92;

    let mut value = [0 as libc::c_char; PROP_VALUE_MAX];
    // SAFETY: the name is NUL-terminated and `value` holds PROP_VALUE_MAX bytes,
    // the most bionic will write including the terminator.
    let len = unsafe { libc::__system_property_get(c"ro.hardware.egl".as_ptr(), value.as_mut_ptr()) };
    if len <= 0 {
        return None;
    }
    // SAFETY: bionic NUL-terminates the value on success.
    let vendor = unsafe { CStr::from_ptr(value.as_ptr()) };
    Some(vendor.to_string_lossy().into_owned())
}

#[cfg(not(target_os = "android"))]
fn system_egl_vendor() -> Option<String> {
    None
}
