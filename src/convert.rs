//! Pixel format conversion.
//!
//! Integer YUYV 4:2:2 to RGB conversion. Each macropixel `Y0 U Y1 V` yields two
//! pixels sharing one chroma pair; luma is pre-scaled by 256 and every channel
//! is shifted back down and clamped:
//!
//! ```text
//! R = (y + 359 v) >> 8
//! G = (y + 88 v - 183 u) >> 8
//! B = (y + 454 u) >> 8
//! ```
//!
//! The arithmetic is fixed: identical input gives bit-identical output.

use thiserror::Error;

use crate::traits::PixelFormat;

/// Bytes per YUYV macropixel (two pixels).
const MACROPIXEL: usize = 4;

/// Conversion precondition failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConvertError {
    /// YUYV rows are made of two-pixel macropixels.
    #[error("width {0} is odd, YUYV macropixels cover two pixels")]
    OddWidth(u32),
    /// The source does not hold a full frame.
    #[error("buffer holds {actual} bytes, {expected} required for {width}x{height}")]
    ShortBuffer {
        /// Bytes required.
        expected: usize,
        /// Bytes supplied.
        actual: usize,
        /// Frame width.
        width: u32,
        /// Frame height.
        height: u32,
    },
    /// The stride cannot hold one row.
    #[error("stride {stride} is smaller than a {width} pixel row")]
    StrideTooSmall {
        /// Bytes per line supplied.
        stride: usize,
        /// Frame width.
        width: u32,
    },
    /// No converter exists for the source encoding.
    #[error("no RGB conversion from {0:?}")]
    UnsupportedPixelFormat(PixelFormat),
}

#[inline]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
const fn clamp(value: i32) -> u8 {
    if value < 0 {
        0
    } else if value > 255 {
        255
    } else {
        value as u8
    }
}

/// Convert one pixel. `y` is luma shifted left by 8, `u`/`v` are centred on 0.
#[inline]
#[allow(clippy::many_single_char_names)]
const fn yuv_to_rgb(y: i32, u: i32, v: i32) -> [u8; 3] {
    [
        clamp((y + 359 * v) >> 8),
        clamp((y + 88 * v - 183 * u) >> 8),
        clamp((y + 454 * u) >> 8),
    ]
}

/// Split a macropixel into scaled luma pair and centred chroma.
#[inline]
const fn unpack(y0: u8, u: u8, y1: u8, v: u8) -> (i32, i32, i32, i32) {
    (
        (y0 as i32) << 8,
        u as i32 - 128,
        (y1 as i32) << 8,
        v as i32 - 128,
    )
}

fn put(dst: &mut [u8], rgb: [u8; 3]) {
    for (out, value) in dst.iter_mut().zip(rgb) {
        *out = value;
    }
}

fn check_layout(
    src: &[u8],
    width: u32,
    height: u32,
    stride: usize,
    bytes_per_pixel: usize,
) -> Result<usize, ConvertError> {
    let row_bytes = width as usize * bytes_per_pixel;
    if stride < row_bytes {
        return Err(ConvertError::StrideTooSmall { stride, width });
    }
    let expected = if height == 0 {
        0
    } else {
        stride * (height as usize - 1) + row_bytes
    };
    if src.len() < expected {
        return Err(ConvertError::ShortBuffer {
            expected,
            actual: src.len(),
            width,
            height,
        });
    }
    Ok(row_bytes)
}

/// Shared YUYV walker; `N` is the output bytes per pixel (3 or 4).
fn yuyv_to_packed<const N: usize>(
    src: &[u8],
    width: u32,
    height: u32,
    stride: usize,
) -> Result<Vec<u8>, ConvertError> {
    if width % 2 != 0 {
        return Err(ConvertError::OddWidth(width));
    }
    let row_in = check_layout(src, width, height, stride, 2)?;
    let row_out = width as usize * N;
    let mut out = vec![u8::MAX; row_out * height as usize];
    if row_out == 0 {
        return Ok(out);
    }

    let rows = src.chunks(stride.max(1)).take(height as usize);
    for (line, dst) in rows.zip(out.chunks_exact_mut(row_out)) {
        let line = line.get(..row_in).unwrap_or(line);
        for (mp, px) in line
            .chunks_exact(MACROPIXEL)
            .zip(dst.chunks_exact_mut(2 * N))
        {
            let &[y0, u, y1, v] = mp else { continue };
            let (y0, u, y1, v) = unpack(y0, u, y1, v);
            let (first, second) = px.split_at_mut(N);
            put(first, yuv_to_rgb(y0, u, v));
            put(second, yuv_to_rgb(y1, u, v));
        }
    }
    Ok(out)
}

/// Convert a packed YUYV 4:2:2 frame to RGB24 (`3 * width * height` bytes).
pub fn yuyv422_to_rgb24(src: &[u8], width: u32, height: u32) -> Result<Vec<u8>, ConvertError> {
    yuyv_to_packed::<3>(src, width, height, width as usize * 2)
}

/// Convert a packed YUYV 4:2:2 frame to RGBA32 (`4 * width * height` bytes,
/// alpha 255).
pub fn yuyv422_to_rgba32(src: &[u8], width: u32, height: u32) -> Result<Vec<u8>, ConvertError> {
    yuyv_to_packed::<4>(src, width, height, width as usize * 2)
}

/// [`yuyv422_to_rgb24`] for rows padded to `stride` bytes.
pub fn yuyv422_to_rgb24_with_stride(
    src: &[u8],
    width: u32,
    height: u32,
    stride: usize,
) -> Result<Vec<u8>, ConvertError> {
    yuyv_to_packed::<3>(src, width, height, stride)
}

/// [`yuyv422_to_rgba32`] for rows padded to `stride` bytes.
pub fn yuyv422_to_rgba32_with_stride(
    src: &[u8],
    width: u32,
    height: u32,
    stride: usize,
) -> Result<Vec<u8>, ConvertError> {
    yuyv_to_packed::<4>(src, width, height, stride)
}

/// Repack RGB24 rows, dropping stride padding and optionally adding alpha.
fn rgb24_repack<const N: usize>(
    src: &[u8],
    width: u32,
    height: u32,
    stride: usize,
) -> Result<Vec<u8>, ConvertError> {
    let row_in = check_layout(src, width, height, stride, 3)?;
    let mut out = vec![u8::MAX; width as usize * N * height as usize];
    if row_in == 0 {
        return Ok(out);
    }
    let rows = src.chunks(stride).take(height as usize);
    for (line, dst) in rows.zip(out.chunks_exact_mut(width as usize * N)) {
        for (px_in, px_out) in line.chunks_exact(3).zip(dst.chunks_exact_mut(N)) {
            for (out, value) in px_out.iter_mut().zip(px_in) {
                *out = *value;
            }
        }
    }
    Ok(out)
}

/// Convert a frame in `format` to RGB24, dispatching on the encoding.
pub fn to_rgb24(
    format: PixelFormat,
    src: &[u8],
    width: u32,
    height: u32,
    stride: usize,
) -> Result<Vec<u8>, ConvertError> {
    match format {
        PixelFormat::Yuyv422 => yuyv422_to_rgb24_with_stride(src, width, height, stride),
        PixelFormat::Rgb24 => rgb24_repack::<3>(src, width, height, stride),
        PixelFormat::Mjpeg | PixelFormat::Other(_) => {
            Err(ConvertError::UnsupportedPixelFormat(format))
        }
    }
}

/// Convert a frame in `format` to RGBA32, dispatching on the encoding.
pub fn to_rgba32(
    format: PixelFormat,
    src: &[u8],
    width: u32,
    height: u32,
    stride: usize,
) -> Result<Vec<u8>, ConvertError> {
    match format {
        PixelFormat::Yuyv422 => yuyv422_to_rgba32_with_stride(src, width, height, stride),
        PixelFormat::Rgb24 => rgb24_repack::<4>(src, width, height, stride),
        PixelFormat::Mjpeg | PixelFormat::Other(_) => {
            Err(ConvertError::UnsupportedPixelFormat(format))
        }
    }
}

/// RGB of a single pixel in a packed YUYV frame, `None` when out of bounds.
///
/// For odd `x` the second luma of the macropixel is used.
pub fn yuyv_pixel_at(data: &[u8], x: u32, y: u32, width: u32) -> Option<(u8, u8, u8)> {
    if x >= width {
        return None;
    }
    let pair_x = (x & !1) as usize;
    let offset = (y as usize)
        .checked_mul(width as usize)?
        .checked_add(pair_x)?
        .checked_mul(2)?;
    let &[y0, u, y1, v] = data.get(offset..offset.checked_add(MACROPIXEL)?)? else {
        return None;
    };
    let (y0, u, y1, v) = unpack(y0, u, y1, v);
    let [r, g, b] = yuv_to_rgb(if x % 2 == 0 { y0 } else { y1 }, u, v);
    Some((r, g, b))
}
