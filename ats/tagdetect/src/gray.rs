//! RGB(A) to luminance conversion
//!
//! Uses the ITU-R BT.601 weights: `round(0.299 R + 0.587 G + 0.114 B)`.
//! The weights are applied in fixed point (per mille) so the rounding is exact
//! and the result never depends on float representation of `x.5` cases.

use crate::error::{DetectError, Result};
use crate::types::{Frame, FrameFormat};

/// Luminance of one pixel, rounded half up and clamped to `[0, 255]`.
#[inline]
pub fn luminance(r: u8, g: u8, b: u8) -> u8 {
    let weighted = 299 * r as u32 + 587 * g as u32 + 114 * b as u32;
    ((weighted + 500) / 1000).min(255) as u8
}

/// Convert an RGBA buffer of `width * height * 4` bytes into a newly
/// allocated `width * height` luminance buffer. Alpha is ignored.
pub fn to_grayscale(rgba: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    to_grayscale_format(rgba, width, height, FrameFormat::RGBA8)
}

/// Convert a frame in any supported format to luminance.
///
/// Allocates exactly one output buffer. Input bytes past
/// `format.expected_frame_size(width, height)` are ignored.
pub fn to_grayscale_format(
    data: &[u8],
    width: u32,
    height: u32,
    format: FrameFormat,
) -> Result<Vec<u8>> {
    if width == 0 || height == 0 {
        return Err(DetectError::InvalidFrame(format!(
            "missing dimensions ({}x{})",
            width, height
        )));
    }
    let expected = format.expected_frame_size(width, height);
    if data.len() < expected {
        return Err(DetectError::InvalidFrame(format!(
            "{:?} buffer too small: {} < {}",
            format,
            data.len(),
            expected
        )));
    }

    let data = &data[..expected];
    let gray = match format {
        FrameFormat::RGBA8 => data
            .chunks_exact(4)
            .map(|p| luminance(p[0], p[1], p[2]))
            .collect(),
        FrameFormat::RGB8 => data
            .chunks_exact(3)
            .map(|p| luminance(p[0], p[1], p[2]))
            .collect(),
        FrameFormat::BGR8 => data
            .chunks_exact(3)
            .map(|p| luminance(p[2], p[1], p[0]))
            .collect(),
        FrameFormat::Gray8 => data.to_vec(),
    };
    Ok(gray)
}

/// Convert and wrap into a [`Frame`] ready to be sent to the detector.
pub fn to_frame(data: &[u8], width: u32, height: u32, format: FrameFormat) -> Result<Frame> {
    let pixels = to_grayscale_format(data, width, height, format)?;
    Ok(Frame::new(width, height, pixels))
}
