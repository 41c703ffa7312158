//! Binding of logical detector operations to concrete native exports.
//!
//! The pipeline speaks in [`LogicalOp`]s. A [`BindingSet`] maps every op the
//! chosen [`Dialect`] needs to a [`BoundFn`]: a callable plus a record of
//! which export it came from and how it was found. A set is built once by the
//! [`resolver`] and never mutated afterwards.

pub mod dialect;
pub mod resolver;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CallError;
use crate::native::{NativeFn, NativeValue, Signature, ValueKind};
use crate::types::NativeHandle;

pub use dialect::{SymbolPattern, SymbolSpec};
pub use resolver::{DetectorInstance, Diagnostic, NativeBindingResolver, Resolved};

/// Export naming convention family of a native build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// `apriltag_detector_*` / `apriltag_detection_*` plus caller-owned
    /// image memory through `malloc`/`free`
    Canonical,
    /// `atagjs_*`: one implicit detector, library-owned image buffer and a
    /// JSON-encoded result record
    Adapter,
}

impl Dialect {
    pub fn as_str(self) -> &'static str {
        match self {
            Dialect::Canonical => "canonical",
            Dialect::Adapter => "adapter",
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A logical operation the pipeline needs from the native library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogicalOp {
    CreateDetector,
    CreateFamily,
    AddFamily,
    Detect,
    ResultCount,
    ResultAt,
    CornerX,
    CornerY,
    DetectionId,
    DestroyResults,
    Alloc,
    Free,
    DestroyDetector,
    DestroyFamily,
    SetImageBuffer,
}

impl LogicalOp {
    pub fn as_str(self) -> &'static str {
        match self {
            LogicalOp::CreateDetector => "createDetector",
            LogicalOp::CreateFamily => "createFamily",
            LogicalOp::AddFamily => "addFamily",
            LogicalOp::Detect => "detect",
            LogicalOp::ResultCount => "resultCount",
            LogicalOp::ResultAt => "resultAt",
            LogicalOp::CornerX => "cornerX",
            LogicalOp::CornerY => "cornerY",
            LogicalOp::DetectionId => "detectionId",
            LogicalOp::DestroyResults => "destroyResults",
            LogicalOp::Alloc => "alloc",
            LogicalOp::Free => "free",
            LogicalOp::DestroyDetector => "destroyDetector",
            LogicalOp::DestroyFamily => "destroyFamily",
            LogicalOp::SetImageBuffer => "setImageBuffer",
        }
    }
}

impl fmt::Display for LogicalOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which lookup step produced a binding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// The module's call-convention adapter, by plain name
    CallAdapter,
    /// A low-level export, `_name` or `name`
    RawExport,
    /// First sorted export matching the op's name pattern
    PatternScan,
}

/// A resolved native function.
#[derive(Clone)]
pub struct BoundFn {
    op: LogicalOp,
    export: String,
    resolution: Resolution,
    signature: Signature,
    func: NativeFn,
}

impl BoundFn {
    pub fn new(
        op: LogicalOp,
        export: impl Into<String>,
        resolution: Resolution,
        signature: Signature,
        func: NativeFn,
    ) -> Self {
        Self {
            op,
            export: export.into(),
            resolution,
            signature,
            func,
        }
    }

    pub fn op(&self) -> LogicalOp {
        self.op
    }

    /// Export name the function was bound to
    pub fn export(&self) -> &str {
        &self.export
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn signature(&self) -> Signature {
        self.signature
    }

    /// Invoke with argument kinds checked against the declared signature.
    pub fn call(&self, args: &[NativeValue]) -> Result<NativeValue, CallError> {
        if !self.signature.accepts(args) {
            return Err(CallError::new(
                &self.export,
                format!("arguments {:?} do not match {}", args, self.signature),
            ));
        }
        (self.func)(args)
    }

    pub fn call_handle(&self, args: &[NativeValue]) -> Result<NativeHandle, CallError> {
        match self.call(args)? {
            NativeValue::Handle(h) => Ok(h),
            other => Err(self.unexpected(ValueKind::Handle, other)),
        }
    }

    pub fn call_int(&self, args: &[NativeValue]) -> Result<i32, CallError> {
        match self.call(args)? {
            NativeValue::Int(v) => Ok(v),
            other => Err(self.unexpected(ValueKind::Int, other)),
        }
    }

    pub fn call_float(&self, args: &[NativeValue]) -> Result<f64, CallError> {
        match self.call(args)? {
            NativeValue::Float(v) => Ok(v),
            NativeValue::Int(v) => Ok(v as f64),
            other => Err(self.unexpected(ValueKind::Float, other)),
        }
    }

    /// Invoke for side effects; any return value is discarded.
    pub fn call_void(&self, args: &[NativeValue]) -> Result<(), CallError> {
        self.call(args).map(|_| ())
    }

    fn unexpected(&self, expected: ValueKind, got: NativeValue) -> CallError {
        CallError::new(
            &self.export,
            format!("expected {} return, got {:?}", expected.as_str(), got),
        )
    }
}

impl fmt::Debug for BoundFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundFn")
            .field("op", &self.op)
            .field("export", &self.export)
            .field("resolution", &self.resolution)
            .field("signature", &self.signature.to_string())
            .finish()
    }
}

/// Canonical-dialect bindings.
#[derive(Debug, Clone)]
pub struct CanonicalBindings {
    pub create_detector: BoundFn,
    /// Constructor of the family that was actually created
    pub create_family: BoundFn,
    pub add_family: BoundFn,
    pub detect: BoundFn,
    pub result_count: BoundFn,
    pub result_at: BoundFn,
    pub corner_x: BoundFn,
    pub corner_y: BoundFn,
    pub detection_id: BoundFn,
    pub destroy_results: BoundFn,
    pub alloc: BoundFn,
    pub free: BoundFn,
    pub destroy_detector: Option<BoundFn>,
    pub destroy_family: Option<BoundFn>,
}

/// Adapter-dialect bindings. Per-detection accessors have no counterpart;
/// results arrive as one JSON record.
#[derive(Debug, Clone)]
pub struct AdapterBindings {
    /// `init`, stands in for detector and family construction
    pub init: BoundFn,
    pub set_image_buffer: BoundFn,
    pub detect: BoundFn,
    pub destroy: Option<BoundFn>,
}

/// The immutable result of binding resolution.
#[derive(Debug, Clone)]
pub enum BindingSet {
    Canonical(CanonicalBindings),
    Adapter(AdapterBindings),
}

impl BindingSet {
    pub fn dialect(&self) -> Dialect {
        match self {
            BindingSet::Canonical(_) => Dialect::Canonical,
            BindingSet::Adapter(_) => Dialect::Adapter,
        }
    }

    /// Look up the binding serving a logical op, if this dialect has one.
    pub fn get(&self, op: LogicalOp) -> Option<&BoundFn> {
        match self {
            BindingSet::Canonical(b) => match op {
                LogicalOp::CreateDetector => Some(&b.create_detector),
                LogicalOp::CreateFamily => Some(&b.create_family),
                LogicalOp::AddFamily => Some(&b.add_family),
                LogicalOp::Detect => Some(&b.detect),
                LogicalOp::ResultCount => Some(&b.result_count),
                LogicalOp::ResultAt => Some(&b.result_at),
                LogicalOp::CornerX => Some(&b.corner_x),
                LogicalOp::CornerY => Some(&b.corner_y),
                LogicalOp::DetectionId => Some(&b.detection_id),
                LogicalOp::DestroyResults => Some(&b.destroy_results),
                LogicalOp::Alloc => Some(&b.alloc),
                LogicalOp::Free => Some(&b.free),
                LogicalOp::DestroyDetector => b.destroy_detector.as_ref(),
                LogicalOp::DestroyFamily => b.destroy_family.as_ref(),
                LogicalOp::SetImageBuffer => None,
            },
            BindingSet::Adapter(b) => match op {
                LogicalOp::CreateDetector => Some(&b.init),
                LogicalOp::SetImageBuffer => Some(&b.set_image_buffer),
                LogicalOp::Detect => Some(&b.detect),
                LogicalOp::DestroyDetector => b.destroy.as_ref(),
                _ => None,
            },
        }
    }

    /// Every bound function, in a stable order, for diagnostics.
    pub fn iter(&self) -> Vec<&BoundFn> {
        let mut out = Vec::new();
        match self {
            BindingSet::Canonical(b) => {
                out.extend([
                    &b.create_detector,
                    &b.create_family,
                    &b.add_family,
                    &b.detect,
                    &b.result_count,
                    &b.result_at,
                    &b.corner_x,
                    &b.corner_y,
                    &b.detection_id,
                    &b.destroy_results,
                    &b.alloc,
                    &b.free,
                ]);
                out.extend(b.destroy_detector.iter());
                out.extend(b.destroy_family.iter());
            }
            BindingSet::Adapter(b) => {
                out.extend([&b.init, &b.set_image_buffer, &b.detect]);
                out.extend(b.destroy.iter());
            }
        }
        out
    }
}
