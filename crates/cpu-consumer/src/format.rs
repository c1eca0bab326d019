//! Pixel formats and per-frame metadata carried through a lock.
//!
//! Formats use the HAL numeric codes producers put on the wire. Codes this crate
//! has no name for are kept as [`PixelFormat::Other`] rather than rejected, since
//! vendor formats are common on real devices and are usually YUV.

/// Buffer pixel format, keyed by HAL format code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// RGBA 8:8:8:8
    Rgba8888,
    /// RGBX 8:8:8:8 (alpha ignored)
    Rgbx8888,
    /// Packed RGB 8:8:8
    Rgb888,
    /// RGB 5:6:5
    Rgb565,
    /// BGRA 8:8:8:8
    Bgra8888,
    /// RGBA half-float
    RgbaFp16,
    /// RGBA 10:10:10:2
    Rgba1010102,
    /// Single 8-bit luma channel
    Y8,
    /// Single 16-bit luma channel
    Y16,
    /// Bayer raw, 16 bits per pixel
    Raw16,
    /// Bayer raw, 10 bits packed
    Raw10,
    /// Device-specific raw sensor layout
    RawOpaque,
    /// Opaque byte blob (JPEG, depth point clouds)
    Blob,
    /// Gralloc chooses the layout; not CPU-describable
    ImplementationDefined,
    /// Planar 4:2:0, Y then V then U
    Yv12,
    /// Flexible 4:2:0 with explicit per-plane layout
    YCbCr420888,
    /// Semi-planar 4:2:2 (NV16)
    YCbCr422Sp,
    /// Semi-planar 4:2:0 with CrCb order (NV21)
    YCrCb420Sp,
    /// Interleaved 4:2:2 (YUY2)
    YCbCr422I,
    /// Any code not listed above
    Other(u32),
}

impl PixelFormat {
    pub const HAL_RGBA_8888: u32 = 0x1;
    pub const HAL_RGBX_8888: u32 = 0x2;
    pub const HAL_RGB_888: u32 = 0x3;
    pub const HAL_RGB_565: u32 = 0x4;
    pub const HAL_BGRA_8888: u32 = 0x5;
    pub const HAL_YCBCR_422_SP: u32 = 0x10;
    pub const HAL_YCRCB_420_SP: u32 = 0x11;
    pub const HAL_YCBCR_422_I: u32 = 0x14;
    pub const HAL_RGBA_FP16: u32 = 0x16;
    pub const HAL_RAW16: u32 = 0x20;
    pub const HAL_BLOB: u32 = 0x21;
    pub const HAL_IMPLEMENTATION_DEFINED: u32 = 0x22;
    pub const HAL_YCBCR_420_888: u32 = 0x23;
    pub const HAL_RAW_OPAQUE: u32 = 0x24;
    pub const HAL_RAW10: u32 = 0x25;
    pub const HAL_RGBA_1010102: u32 = 0x2B;
    pub const HAL_Y8: u32 = 0x2020_3859;
    pub const HAL_Y16: u32 = 0x2036_3159;
    pub const HAL_YV12: u32 = 0x3231_5659;

    /// Maps a HAL format code to a format, keeping unknown codes verbatim.
    pub fn from_hal(code: u32) -> Self {
        match code {
            Self::HAL_RGBA_8888 => PixelFormat::Rgba8888,
            Self::HAL_RGBX_8888 => PixelFormat::Rgbx8888,
            Self::HAL_RGB_888 => PixelFormat::Rgb888,
            Self::HAL_RGB_565 => PixelFormat::Rgb565,
            Self::HAL_BGRA_8888 => PixelFormat::Bgra8888,
            Self::HAL_RGBA_FP16 => PixelFormat::RgbaFp16,
            Self::HAL_RGBA_1010102 => PixelFormat::Rgba1010102,
            Self::HAL_Y8 => PixelFormat::Y8,
            Self::HAL_Y16 => PixelFormat::Y16,
            Self::HAL_RAW16 => PixelFormat::Raw16,
            Self::HAL_RAW10 => PixelFormat::Raw10,
            Self::HAL_RAW_OPAQUE => PixelFormat::RawOpaque,
            Self::HAL_BLOB => PixelFormat::Blob,
            Self::HAL_IMPLEMENTATION_DEFINED => PixelFormat::ImplementationDefined,
            Self::HAL_YV12 => PixelFormat::Yv12,
            Self::HAL_YCBCR_420_888 => PixelFormat::YCbCr420888,
            Self::HAL_YCBCR_422_SP => PixelFormat::YCbCr422Sp,
            Self::HAL_YCRCB_420_SP => PixelFormat::YCrCb420Sp,
            Self::HAL_YCBCR_422_I => PixelFormat::YCbCr422I,
            other => PixelFormat::Other(other),
        }
    }

    /// Returns the HAL format code.
    pub fn to_hal(self) -> u32 {
        match self {
            PixelFormat::Rgba8888 => Self::HAL_RGBA_8888,
            PixelFormat::Rgbx8888 => Self::HAL_RGBX_8888,
            PixelFormat::Rgb888 => Self::HAL_RGB_888,
            PixelFormat::Rgb565 => Self::HAL_RGB_565,
            PixelFormat::Bgra8888 => Self::HAL_BGRA_8888,
            PixelFormat::RgbaFp16 => Self::HAL_RGBA_FP16,
            PixelFormat::Rgba1010102 => Self::HAL_RGBA_1010102,
            PixelFormat::Y8 => Self::HAL_Y8,
            PixelFormat::Y16 => Self::HAL_Y16,
            PixelFormat::Raw16 => Self::HAL_RAW16,
            PixelFormat::Raw10 => Self::HAL_RAW10,
            PixelFormat::RawOpaque => Self::HAL_RAW_OPAQUE,
            PixelFormat::Blob => Self::HAL_BLOB,
            PixelFormat::ImplementationDefined => Self::HAL_IMPLEMENTATION_DEFINED,
            PixelFormat::Yv12 => Self::HAL_YV12,
            PixelFormat::YCbCr420888 => Self::HAL_YCBCR_420_888,
            PixelFormat::YCbCr422Sp => Self::HAL_YCBCR_422_SP,
            PixelFormat::YCrCb420Sp => Self::HAL_YCRCB_420_SP,
            PixelFormat::YCbCr422I => Self::HAL_YCBCR_422_I,
            PixelFormat::Other(code) => code,
        }
    }

    /// Returns true if a buffer of this format may be lockable as flexible YUV.
    ///
    /// RGB, alpha, raw sensor and blob formats are excluded. Everything else,
    /// including unknown vendor codes, is worth a flexible-YUV attempt.
    pub fn is_possibly_yuv(self) -> bool {
        !matches!(
            self,
            PixelFormat::Rgba8888
                | PixelFormat::Rgbx8888
                | PixelFormat::RgbaFp16
                | PixelFormat::Rgba1010102
                | PixelFormat::Rgb888
                | PixelFormat::Rgb565
                | PixelFormat::Bgra8888
                | PixelFormat::Y8
                | PixelFormat::Y16
                | PixelFormat::Raw16
                | PixelFormat::Raw10
                | PixelFormat::RawOpaque
                | PixelFormat::Blob
                | PixelFormat::ImplementationDefined
        )
    }

    /// Returns true for the normalized flexible YUV format.
    pub fn is_flexible_yuv(self) -> bool {
        self == PixelFormat::YCbCr420888
    }
}

impl std::fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}({:#x})", self, self.to_hal())
    }
}

/// Integer rectangle in buffer pixel coordinates (right/bottom exclusive).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Rect {
    pub const EMPTY: Rect = Rect {
        left: 0,
        top: 0,
        right: 0,
        bottom: 0,
    };

    pub fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    /// Rectangle covering a whole `width`×`height` buffer.
    pub fn from_size(width: u32, height: u32) -> Self {
        Self::new(0, 0, width as i32, height as i32)
    }

    pub fn width(&self) -> i32 {
        self.right - self.left
    }

    pub fn height(&self) -> i32 {
        self.bottom - self.top
    }

    pub fn is_empty(&self) -> bool {
        self.width() <= 0 || self.height() <= 0
    }
}

/// Producer-requested display transform, as HAL transform bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Transform(pub u32);

impl Transform {
    pub const IDENTITY: Transform = Transform(0);
    pub const FLIP_H: Transform = Transform(0x01);
    pub const FLIP_V: Transform = Transform(0x02);
    pub const ROT_90: Transform = Transform(0x04);
    pub const ROT_180: Transform = Transform(0x03);
    pub const ROT_270: Transform = Transform(0x07);
}

/// How the producer wants the buffer scaled onto its destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub enum ScalingMode {
    #[default]
    Freeze,
    ScaleToWindow,
    ScaleCrop,
    NoScaleCrop,
}

/// Color space tag for buffer contents. Opaque to this crate; carried unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct DataSpace(pub i32);

impl DataSpace {
    pub const UNKNOWN: DataSpace = DataSpace(0);
    /// BT.601 625-line, SMPTE 170M transfer, limited range
    pub const BT601_625: DataSpace = DataSpace((2 << 16) | (3 << 22) | (2 << 27));
    /// BT.709, SMPTE 170M transfer, limited range
    pub const BT709: DataSpace = DataSpace((1 << 16) | (3 << 22) | (2 << 27));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hal_code_roundtrip_for_named_formats() {
        for format in [
            PixelFormat::Rgba8888,
            PixelFormat::Yv12,
            PixelFormat::YCbCr420888,
            PixelFormat::Y16,
            PixelFormat::Blob,
        ] {
            assert_eq!(PixelFormat::from_hal(format.to_hal()), format);
        }
        assert_eq!(PixelFormat::from_hal(0x7fa3_0c04), PixelFormat::Other(0x7fa3_0c04));
    }

    #[test]
    fn test_possibly_yuv_classification() {
        assert!(PixelFormat::YCbCr420888.is_possibly_yuv());
        assert!(PixelFormat::Yv12.is_possibly_yuv());
        assert!(PixelFormat::YCrCb420Sp.is_possibly_yuv());
        assert!(PixelFormat::YCbCr422I.is_possibly_yuv());
        // Vendor formats get a flexible-YUV attempt
        assert!(PixelFormat::Other(0x7fa3_0c04).is_possibly_yuv());

        assert!(!PixelFormat::Rgba8888.is_possibly_yuv());
        assert!(!PixelFormat::Bgra8888.is_possibly_yuv());
        assert!(!PixelFormat::Y8.is_possibly_yuv());
        assert!(!PixelFormat::Raw10.is_possibly_yuv());
        assert!(!PixelFormat::Blob.is_possibly_yuv());
        assert!(!PixelFormat::ImplementationDefined.is_possibly_yuv());
    }

    #[test]
    fn test_rect_size() {
        let r = Rect::from_size(640, 480);
        assert_eq!(r.width(), 640);
        assert_eq!(r.height(), 480);
        assert!(!r.is_empty());
        assert!(Rect::EMPTY.is_empty());
    }
}
