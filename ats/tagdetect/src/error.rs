//! Error types for the detection pipeline

use std::time::Duration;

use thiserror::Error;

use crate::binding::LogicalOp;
use crate::types::PipelineState;

/// A native call that failed inside the foreign library (the equivalent of a
/// thrown exception on the far side of the binding).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("native call `{export}` failed: {message}")]
pub struct CallError {
    /// Export the call was bound to
    pub export: String,
    pub message: String,
}

impl CallError {
    pub fn new(export: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            export: export.into(),
            message: message.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum DetectError {
    /// The native library or module failed to load
    #[error("failed to load native module: {0}")]
    Load(String),

    /// A required export never resolved under any naming variant
    #[error(
        "binding error: no export resolves `{}` (loosely matching exports: {})",
        .op.as_str(),
        format_candidates(.candidates)
    )]
    Binding {
        op: LogicalOp,
        candidates: Vec<String>,
    },

    /// Every configured tag family failed to resolve or construct
    #[error("no tag family could be created (tried: {})", .tried.join(", "))]
    FamilyUnavailable { tried: Vec<String> },

    /// Detector construction returned null or refused to initialize
    #[error("detector setup failed: {0}")]
    Setup(String),

    #[error(transparent)]
    Native(#[from] CallError),

    /// Per-frame input rejected (missing dimensions, undersized buffer)
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// Foreign memory could not be allocated, read or written
    #[error("foreign memory error: {0}")]
    Memory(String),

    #[error("pipeline not ready (state: {0})")]
    NotReady(PipelineState),

    #[error("no ready reply within {0:?}")]
    InitTimeout(Duration),

    /// The detection context reported an initialization error
    #[error("detector initialization failed: {0}")]
    InitFailed(String),

    #[error("detection context disconnected")]
    Disconnected,
}

impl DetectError {
    /// Initialization-class errors surface as pipeline-level failures; all
    /// others degrade to an empty result for a single frame.
    pub fn is_init_failure(&self) -> bool {
        matches!(
            self,
            DetectError::Load(_)
                | DetectError::Binding { .. }
                | DetectError::FamilyUnavailable { .. }
                | DetectError::Setup(_)
                | DetectError::InitTimeout(_)
                | DetectError::InitFailed(_)
        )
    }
}

fn format_candidates(candidates: &[String]) -> String {
    if candidates.is_empty() {
        "none".to_string()
    } else {
        candidates.join(", ")
    }
}

pub type Result<T> = std::result::Result<T, DetectError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binding_error_names_op_and_candidates() {
        let err = DetectError::Binding {
            op: LogicalOp::Detect,
            candidates: vec!["apriltag_detector_create".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("`detect`"));
        assert!(msg.contains("apriltag_detector_create"));
        assert!(err.is_init_failure());
    }

    #[test]
    fn test_binding_error_without_candidates() {
        let err = DetectError::Binding {
            op: LogicalOp::ResultCount,
            candidates: vec![],
        };
        assert!(err.to_string().ends_with("none)"));
    }

    #[test]
    fn test_frame_errors_are_not_init_failures() {
        assert!(!DetectError::InvalidFrame("x".into()).is_init_failure());
        assert!(!DetectError::Native(CallError::new("f", "boom")).is_init_failure());
    }
}
