//! The seam between the pipeline and a loaded native detector module.
//!
//! A module is "shape-unknown": which exports exist, under which names, and
//! whether it offers a call-convention adapter all vary by build. Everything
//! the resolver needs to probe that surface goes through [`NativeModule`];
//! every lookup returns an `Option` so absence is data, never a failure path.
//!
//! Calls use a closed set of shapes described by [`Signature`], which lets a
//! shared-library backend bind real `extern "C"` function pointers and an
//! in-process backend bind closures behind the same [`NativeFn`] type.

pub mod dylib;
pub mod sim;

use std::fmt;
use std::sync::Arc;

use crate::error::{CallError, Result};
use crate::types::NativeHandle;

/// Kind of a native argument or return value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    /// Pointer-sized address inside the native library
    Handle,
    /// C `int`
    Int,
    /// C `size_t`
    Size,
    /// C `double`
    Float,
    /// No value (return position only)
    Void,
}

impl ValueKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ValueKind::Handle => "handle",
            ValueKind::Int => "int",
            ValueKind::Size => "size",
            ValueKind::Float => "float",
            ValueKind::Void => "void",
        }
    }
}

/// A value crossing the native boundary
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NativeValue {
    Handle(NativeHandle),
    Int(i32),
    Size(usize),
    Float(f64),
    Void,
}

impl NativeValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            NativeValue::Handle(_) => ValueKind::Handle,
            NativeValue::Int(_) => ValueKind::Int,
            NativeValue::Size(_) => ValueKind::Size,
            NativeValue::Float(_) => ValueKind::Float,
            NativeValue::Void => ValueKind::Void,
        }
    }
}

/// Declared argument and return shape of a native function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Signature {
    pub args: &'static [ValueKind],
    pub ret: ValueKind,
}

impl Signature {
    pub const fn new(args: &'static [ValueKind], ret: ValueKind) -> Self {
        Self { args, ret }
    }

    /// Check that `args` has the declared arity and kinds
    pub fn accepts(&self, args: &[NativeValue]) -> bool {
        args.len() == self.args.len()
            && args
                .iter()
                .zip(self.args.iter())
                .all(|(value, kind)| value.kind() == *kind)
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let args: Vec<&str> = self.args.iter().map(|k| k.as_str()).collect();
        write!(f, "({}) -> {}", args.join(", "), self.ret.as_str())
    }
}

/// A callable bound to one native export.
pub type NativeFn =
    Arc<dyn Fn(&[NativeValue]) -> std::result::Result<NativeValue, CallError> + Send + Sync>;

pub(crate) fn arg_handle(args: &[NativeValue], i: usize) -> std::result::Result<usize, String> {
    match args.get(i) {
        Some(NativeValue::Handle(h)) => Ok(h.0),
        other => Err(format!("argument {i}: expected handle, got {other:?}")),
    }
}

pub(crate) fn arg_int(args: &[NativeValue], i: usize) -> std::result::Result<i32, String> {
    match args.get(i) {
        Some(NativeValue::Int(v)) => Ok(*v),
        other => Err(format!("argument {i}: expected int, got {other:?}")),
    }
}

pub(crate) fn arg_size(args: &[NativeValue], i: usize) -> std::result::Result<usize, String> {
    match args.get(i) {
        Some(NativeValue::Size(v)) => Ok(*v),
        other => Err(format!("argument {i}: expected size, got {other:?}")),
    }
}

/// A loaded native detector module of unknown export shape.
pub trait NativeModule: Send {
    /// Human-readable identity for diagnostics (path, build name)
    fn name(&self) -> &str;

    /// Whether the module ships a call-convention adapter (a "wrap by name"
    /// facility that marshals arguments for its exports).
    fn has_call_adapter(&self) -> bool;

    /// Obtain a callable through the module's call-convention adapter using
    /// the export's plain name and declared shape.
    fn wrap(&self, name: &str, signature: Signature) -> Option<NativeFn>;

    /// Look up an export under its exact low-level name.
    fn raw_export(&self, name: &str, signature: Signature) -> Option<NativeFn>;

    /// All export names the module can report.
    fn export_names(&self) -> Vec<String>;

    /// Copy `len` bytes out of foreign memory starting at `handle`.
    fn read_memory(&self, handle: NativeHandle, len: usize) -> Result<Vec<u8>>;

    /// Copy `bytes` into foreign memory starting at `handle`.
    fn write_memory(&self, handle: NativeHandle, bytes: &[u8]) -> Result<()>;

    /// Pointer width of the module's address space in bytes (4 or 8)
    fn pointer_width(&self) -> usize;
}

/// Produces a freshly loaded module. Called on the detection context during
/// `init`, once per (re)initialization.
pub trait ModuleLoader: Send {
    fn load(&self) -> Result<Box<dyn NativeModule>>;

    /// What is being loaded, for log lines
    fn describe(&self) -> String;
}
