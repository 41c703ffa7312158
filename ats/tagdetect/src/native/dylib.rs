//! Shared-library backend.
//!
//! Loads a native detector build with `libloading` and binds exports to
//! concrete `extern "C"` function pointers. Only the shapes listed in
//! [`ALL_SIGNATURES`](crate::binding::dialect::ALL_SIGNATURES) can be bound;
//! any other request resolves to `None`.
//!
//! A shared library has no call-convention adapter and cannot portably list
//! its symbols, so [`export_names`](NativeModule::export_names) reports the
//! probe list (every known dialect symbol, configured family and extra name,
//! plain and `_`-prefixed) filtered to what `dlsym` actually finds.

use std::ffi::c_void;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use libloading::Library;
use tagstream::tracing::prefix;
use tracing::{debug, info};

use crate::binding::dialect;
use crate::config::DetectorConfig;
use crate::error::{CallError, DetectError, Result};
use crate::native::{
    arg_handle, arg_int, arg_size, ModuleLoader, NativeFn, NativeModule, NativeValue, Signature,
    ValueKind::{Float, Handle, Int, Size, Void},
};
use crate::types::NativeHandle;

/// A native detector library opened with `dlopen`.
pub struct DylibModule {
    name: String,
    library: Arc<Library>,
    probe_names: Vec<String>,
}

impl DylibModule {
    /// Open the library at `path`. `probe_names` feeds `export_names`.
    pub fn open(path: &Path, probe_names: Vec<String>) -> Result<Self> {
        // SAFETY: loading runs the library's initializers; the path is
        // operator-supplied and expected to be a detector build.
        let library = unsafe { Library::new(path) }
            .map_err(|e| DetectError::Load(format!("{}: {}", path.display(), e)))?;
        info!("{} Loaded {}", prefix::OPEN, path.display());
        Ok(Self {
            name: path.display().to_string(),
            library: Arc::new(library),
            probe_names,
        })
    }

    fn address(&self, name: &str) -> Option<*mut c_void> {
        // SAFETY: the symbol is only read as an address here.
        let symbol = unsafe { self.library.get::<*mut c_void>(name.as_bytes()) }.ok()?;
        let addr = *symbol;
        if addr.is_null() {
            None
        } else {
            Some(addr)
        }
    }
}

macro_rules! bind {
    ($lib:expr, $export:expr, $addr:expr, fn($($arg:ty),*) -> $ret:ty, |$f:ident, $args:ident| $body:expr) => {{
        // SAFETY: the caller matched the declared signature to this
        // function-pointer type before transmuting.
        let $f: unsafe extern "C" fn($($arg),*) -> $ret = unsafe { std::mem::transmute($addr) };
        let library = Arc::clone(&$lib);
        let export = $export.to_string();
        let func: NativeFn = Arc::new(move |$args: &[NativeValue]| {
            let _loaded = &library;
            let run = || -> std::result::Result<NativeValue, String> { $body };
            run().map_err(|m| CallError::new(&export, m))
        });
        Some(func)
    }};
}

/// Map a declared signature onto a concrete function-pointer type.
fn bind_shape(
    library: &Arc<Library>,
    export: &str,
    addr: *mut c_void,
    signature: Signature,
) -> Option<NativeFn> {
    match (signature.args, signature.ret) {
        ([], Handle) => bind!(library, export, addr, fn() -> usize, |f, _a| {
            Ok(NativeValue::Handle(NativeHandle(unsafe { f() })))
        }),
        ([], Int) => bind!(library, export, addr, fn() -> i32, |f, _a| {
            Ok(NativeValue::Int(unsafe { f() }))
        }),
        ([], Void) => bind!(library, export, addr, fn() -> (), |f, _a| {
            unsafe { f() };
            Ok(NativeValue::Void)
        }),
        ([Handle], Void) => bind!(library, export, addr, fn(usize) -> (), |f, a| {
            let h = arg_handle(a, 0)?;
            unsafe { f(h) };
            Ok(NativeValue::Void)
        }),
        ([Handle], Int) => bind!(library, export, addr, fn(usize) -> i32, |f, a| {
            let h = arg_handle(a, 0)?;
            Ok(NativeValue::Int(unsafe { f(h) }))
        }),
        ([Handle, Handle], Void) => bind!(library, export, addr, fn(usize, usize) -> (), |f, a| {
            let (x, y) = (arg_handle(a, 0)?, arg_handle(a, 1)?);
            unsafe { f(x, y) };
            Ok(NativeValue::Void)
        }),
        ([Handle, Handle, Int, Int], Handle) => {
            bind!(library, export, addr, fn(usize, usize, i32, i32) -> usize, |f, a| {
                let (det, img) = (arg_handle(a, 0)?, arg_handle(a, 1)?);
                let (w, h) = (arg_int(a, 2)?, arg_int(a, 3)?);
                Ok(NativeValue::Handle(NativeHandle(unsafe { f(det, img, w, h) })))
            })
        }
        ([Handle, Int], Handle) => bind!(library, export, addr, fn(usize, i32) -> usize, |f, a| {
            let (h, i) = (arg_handle(a, 0)?, arg_int(a, 1)?);
            Ok(NativeValue::Handle(NativeHandle(unsafe { f(h, i) })))
        }),
        ([Handle, Int], Float) => bind!(library, export, addr, fn(usize, i32) -> f64, |f, a| {
            let (h, i) = (arg_handle(a, 0)?, arg_int(a, 1)?);
            Ok(NativeValue::Float(unsafe { f(h, i) }))
        }),
        ([Size], Handle) => bind!(library, export, addr, fn(usize) -> usize, |f, a| {
            let n = arg_size(a, 0)?;
            Ok(NativeValue::Handle(NativeHandle(unsafe { f(n) })))
        }),
        ([Int, Int, Int], Handle) => bind!(library, export, addr, fn(i32, i32, i32) -> usize, |f, a| {
            let (w, h, s) = (arg_int(a, 0)?, arg_int(a, 1)?, arg_int(a, 2)?);
            Ok(NativeValue::Handle(NativeHandle(unsafe { f(w, h, s) })))
        }),
        _ => {
            debug!("{} no binding for `{}` with shape {}", prefix::BIND, export, signature);
            None
        }
    }
}

impl NativeModule for DylibModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn has_call_adapter(&self) -> bool {
        false
    }

    fn wrap(&self, _name: &str, _signature: Signature) -> Option<NativeFn> {
        None
    }

    fn raw_export(&self, name: &str, signature: Signature) -> Option<NativeFn> {
        let addr = self.address(name)?;
        bind_shape(&self.library, name, addr, signature)
    }

    fn export_names(&self) -> Vec<String> {
        self.probe_names
            .iter()
            .filter(|n| self.address(n).is_some())
            .cloned()
            .collect()
    }

    fn read_memory(&self, handle: NativeHandle, len: usize) -> Result<Vec<u8>> {
        if handle.is_null() {
            return Err(DetectError::Memory(format!("read of {len} bytes at null")));
        }
        // SAFETY: handles come from this library's allocator or result
        // records, which own at least `len` readable bytes.
        let bytes = unsafe { std::slice::from_raw_parts(handle.0 as *const u8, len) };
        Ok(bytes.to_vec())
    }

    fn write_memory(&self, handle: NativeHandle, bytes: &[u8]) -> Result<()> {
        if handle.is_null() {
            return Err(DetectError::Memory(format!(
                "write of {} bytes at null",
                bytes.len()
            )));
        }
        // SAFETY: the arena only writes into regions it allocated with at
        // least `bytes.len()` capacity.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), handle.0 as *mut u8, bytes.len());
        }
        Ok(())
    }

    fn pointer_width(&self) -> usize {
        std::mem::size_of::<usize>()
    }
}

/// Loads a [`DylibModule`] from a fixed path.
pub struct DylibLoader {
    path: PathBuf,
    probe_names: Vec<String>,
}

impl DylibLoader {
    pub fn new(path: impl Into<PathBuf>, config: &DetectorConfig) -> Self {
        Self {
            path: path.into(),
            probe_names: dialect::known_export_names(config),
        }
    }
}

impl ModuleLoader for DylibLoader {
    fn load(&self) -> Result<Box<dyn NativeModule>> {
        let module = DylibModule::open(&self.path, self.probe_names.clone())?;
        Ok(Box::new(module))
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}
