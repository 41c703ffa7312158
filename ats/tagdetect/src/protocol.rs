//! Messages between the capture context and the detection context.
//!
//! Both directions are tagged by a `type` field:
//!
//! ```text
//! capture -> detection   {"type":"init"}
//!                        {"type":"detect","image":{"data":[..],"width":W,"height":H}}
//! detection -> capture   {"type":"ready"}
//!                        {"type":"result","detections":[..]}
//!                        {"type":"error","message":".."}
//!                        {"type":"debug", ..}
//! ```

use serde::{Deserialize, Serialize};

use crate::types::{Detection, DetectionStats, Frame};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Request {
    Init,
    Detect { image: Frame },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Reply {
    Ready,
    Result { detections: Vec<Detection> },
    Error { message: String },
    Debug(DebugInfo),
}

impl Reply {
    pub fn empty_result() -> Self {
        Reply::Result {
            detections: Vec::new(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Reply::Error {
            message: message.into(),
        }
    }
}

/// Image summary sent ahead of a detection when image diagnostics are on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub width: u32,
    pub height: u32,
    pub len: usize,
    /// Sum of the first four bytes
    pub checksum: u32,
}

impl ImageInfo {
    pub fn of(frame: &Frame) -> Self {
        Self {
            width: frame.width,
            height: frame.height,
            len: frame.pixels.len(),
            checksum: frame.checksum(),
        }
    }
}

/// Diagnostic payload. Exactly one field is normally set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DebugInfo {
    #[serde(rename = "imgInfo", default, skip_serializing_if = "Option::is_none")]
    pub img_info: Option<ImageInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<DetectionStats>,
    /// A binding-resolution note (fallback chosen, family skipped)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
}

impl DebugInfo {
    pub fn image(frame: &Frame) -> Self {
        Self {
            img_info: Some(ImageInfo::of(frame)),
            ..Self::default()
        }
    }

    pub fn stats(stats: DetectionStats) -> Self {
        Self {
            stats: Some(stats),
            ..Self::default()
        }
    }

    pub fn resolution(note: impl Into<String>) -> Self {
        Self {
            resolution: Some(note.into()),
            ..Self::default()
        }
    }
}
