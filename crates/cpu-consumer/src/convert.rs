//! RGB32 to planar 4:2:0 conversion.
//!
//! Uses the ITU-R BT.601-7 limited-range integer approximation:
//!
//! ```text
//! Y = ((R*65 + G*129 + B*25 + 128) >> 8) + 16
//! U = ((-R*38 - G*74 + B*112 + 128) >> 8) + 128
//! V = ((R*112 - G*94 - B*18 + 128) >> 8) + 128
//! ```
//!
//! The shifts truncate toward negative infinity. Output must stay bit-exact
//! with other implementations of the same table, so do not round.

/// Bytes needed for a `width`×`height` 4:2:0 image with `stride`-byte rows.
pub fn planar_420_size(stride: usize, height: usize) -> usize {
    stride * height * 3 / 2
}

/// Bytes in a tightly packed RGBA8 image.
pub fn rgba_size(width: usize, height: usize) -> usize {
    width * height * 4
}

/// Luma for one RGB sample.
#[inline]
pub fn bt601_luma(r: u8, g: u8, b: u8) -> u8 {
    let (r, g, b) = (r as i32, g as i32, b as i32);
    (((r * 65 + g * 129 + b * 25 + 128) >> 8) + 16) as u8
}

/// Chroma (U, V) for one RGB sample.
#[inline]
pub fn bt601_chroma(r: u8, g: u8, b: u8) -> (u8, u8) {
    let (r, g, b) = (r as i32, g as i32, b as i32);
    let u = ((-r * 38 - g * 74 + b * 112 + 128) >> 8) + 128;
    let v = ((r * 112 - g * 94 - b * 18 + 128) >> 8) + 128;
    (u as u8, v as u8)
}

/// Converts 4-byte-per-pixel RGB into 4:2:0 with interleaved chroma.
///
/// `dst` receives a full luma plane (`height` rows of `dst_stride` bytes)
/// followed by a chroma plane of `height / 2` rows, also `dst_stride` bytes
/// each, holding U then V for every 2×2 block. Chroma is sampled from the
/// top-left pixel of each block. Set `bgr` for sources stored B, G, R, X.
///
/// # Panics
///
/// Panics if `width` or `height` is odd, or if either slice is too short.
/// These are caller contract violations; no pixel is written in that case.
pub fn convert_rgb32_to_planar(
    dst: &mut [u8],
    dst_stride: usize,
    src: &[u8],
    width: usize,
    height: usize,
    src_stride: usize,
    bgr: bool,
) {
    assert!(width & 1 == 0, "width must be even, got {width}");
    assert!(height & 1 == 0, "height must be even, got {height}");
    assert!(dst_stride >= width, "dst stride {dst_stride} < width {width}");
    assert!(src_stride >= width * 4, "src stride {src_stride} < {}", width * 4);
    assert!(
        dst.len() >= planar_420_size(dst_stride, height),
        "dst holds {} bytes, need {}",
        dst.len(),
        planar_420_size(dst_stride, height)
    );
    if height > 0 {
        let needed = src_stride * (height - 1) + width * 4;
        assert!(src.len() >= needed, "src holds {} bytes, need {needed}", src.len());
    }

    let (red_offset, blue_offset) = if bgr { (2, 0) } else { (0, 2) };
    let (luma_plane, chroma_plane) = dst.split_at_mut(dst_stride * height);

    for y in 0..height {
        let src_row = &src[y * src_stride..y * src_stride + width * 4];
        let luma_row = &mut luma_plane[y * dst_stride..y * dst_stride + width];

        for (x, px) in src_row.chunks_exact(4).enumerate() {
            luma_row[x] = bt601_luma(px[red_offset], px[1], px[blue_offset]);
        }

        if y & 1 == 0 {
            let chroma_row = &mut chroma_plane[(y / 2) * dst_stride..(y / 2) * dst_stride + width];
            for x in (0..width).step_by(2) {
                let px = &src_row[x * 4..x * 4 + 4];
                let (u, v) = bt601_chroma(px[red_offset], px[1], px[blue_offset]);
                chroma_row[x] = u;
                chroma_row[x + 1] = v;
            }
        }
    }
}
