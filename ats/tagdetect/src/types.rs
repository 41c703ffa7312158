//! Core types for the detection pipeline
//!
//! These types cross the boundary between the capture context and the
//! detection context, so the ones that travel on the wire derive serde.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{DetectError, Result};

/// Supported frame formats for grayscale conversion input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FrameFormat {
    /// RGBA with 8 bits per channel (32 bits per pixel)
    #[default]
    RGBA8,
    /// RGB with 8 bits per channel (24 bits per pixel)
    RGB8,
    /// BGR with 8 bits per channel (OpenCV default)
    BGR8,
    /// Grayscale 8-bit
    Gray8,
}

impl FrameFormat {
    /// Bytes per pixel for this format
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            FrameFormat::RGBA8 => 4,
            FrameFormat::RGB8 | FrameFormat::BGR8 => 3,
            FrameFormat::Gray8 => 1,
        }
    }

    /// Get the expected frame data size for the given dimensions
    pub fn expected_frame_size(self, width: u32, height: u32) -> usize {
        width as usize * height as usize * self.bytes_per_pixel()
    }
}

/// A grayscale frame on its way to the detector.
///
/// Produced once per capture tick. Sending it moves the pixel buffer into the
/// channel; the next tick allocates a fresh one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    /// Luminance bytes, row-major, `width * height` meaningful bytes
    #[serde(rename = "data")]
    pub pixels: Vec<u8>,
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
}

impl Frame {
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Self {
        Self {
            pixels,
            width,
            height,
        }
    }

    /// Number of meaningful bytes (`width * height`)
    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Reject frames the detector cannot consume.
    ///
    /// Buffers longer than `width * height` are accepted; only the leading
    /// `width * height` bytes are used.
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(DetectError::InvalidFrame(format!(
                "missing dimensions ({}x{})",
                self.width, self.height
            )));
        }
        let needed = self.pixel_count();
        if self.pixels.len() < needed {
            return Err(DetectError::InvalidFrame(format!(
                "gray buffer too small: {} < {}",
                self.pixels.len(),
                needed
            )));
        }
        Ok(())
    }

    /// The bytes the detector actually reads
    pub fn luminance(&self) -> &[u8] {
        let needed = self.pixel_count().min(self.pixels.len());
        &self.pixels[..needed]
    }

    /// Cheap sample checksum used in image diagnostics (sum of first 4 bytes)
    pub fn checksum(&self) -> u32 {
        self.pixels.iter().take(4).map(|&b| b as u32).sum()
    }
}

/// A 2D point in frame pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// One located marker: identifier, quadrilateral corners and their centroid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// Tag identifier within its family
    pub id: i32,
    /// Corner points in library-defined order
    pub corners: [Point; 4],
    /// Arithmetic mean of the four corners
    pub center: Point,
}

impl Detection {
    /// Build a detection, deriving the center from the corners.
    pub fn from_corners(id: i32, corners: [Point; 4]) -> Self {
        let cx = corners.iter().map(|p| p.x).sum::<f64>() / 4.0;
        let cy = corners.iter().map(|p| p.y).sum::<f64>() / 4.0;
        Self {
            id,
            corners,
            center: Point::new(cx, cy),
        }
    }
}

/// Opaque token for an address inside the native library.
///
/// Only ever passed back into resolved native functions or the module's own
/// memory accessors. Zero is the null handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct NativeHandle(pub usize);

impl NativeHandle {
    pub const NULL: NativeHandle = NativeHandle(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for NativeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Lifecycle of the detection context.
///
/// `Faulted` is terminal until the session is torn down and `init` runs again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PipelineState {
    #[default]
    Uninitialized,
    Resolving,
    Ready,
    Detecting,
    Faulted,
}

impl PipelineState {
    pub fn as_str(self) -> &'static str {
        match self {
            PipelineState::Uninitialized => "uninitialized",
            PipelineState::Resolving => "resolving",
            PipelineState::Ready => "ready",
            PipelineState::Detecting => "detecting",
            PipelineState::Faulted => "faulted",
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-frame timing and counts for performance monitoring
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionStats {
    /// Copying the frame into native memory (microseconds)
    pub upload_us: u64,
    /// Native detect call (microseconds)
    pub detect_us: u64,
    /// Walking and releasing the detection list (microseconds)
    pub marshal_us: u64,
    /// Total processing time (microseconds)
    pub total_us: u64,
    /// Frame width processed
    pub frame_width: u32,
    /// Frame height processed
    pub frame_height: u32,
    /// Number of detections returned
    pub detections: u32,
}
