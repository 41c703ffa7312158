//! Binding resolution
//!
//! For every symbol a dialect needs, lookup proceeds:
//!
//! 1. the module's call-convention adapter, by plain name
//! 2. low-level exports, `_name` then `name`
//! 3. the first export (sorted) matching the symbol's token pattern
//!
//! All symbols are bound before any native state is created. Only then is a
//! tag family constructed (first configured family that both resolves and
//! returns a non-null handle), the detector created and the family attached.
//! A failure at any of those steps releases whatever was already created.

use std::collections::HashMap;
use std::fmt;

use tagstream::tracing::prefix;
use tracing::{debug, info, warn};

use crate::binding::dialect::{self, SymbolPattern, SymbolSpec, FAMILY_CONSTRUCTOR, SIG_CREATE};
use crate::binding::{
    AdapterBindings, BindingSet, BoundFn, CanonicalBindings, Dialect, LogicalOp, Resolution,
};
use crate::config::DetectorConfig;
use crate::error::{DetectError, Result};
use crate::native::{NativeFn, NativeModule, NativeValue, Signature};
use crate::types::NativeHandle;

/// Cap on loosely matching exports listed in a binding error
const MAX_CANDIDATES: usize = 16;

/// A non-fatal note produced while resolving (fallback binding, skipped
/// family, missing optional destructor).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub op: LogicalOp,
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.op, self.message)
    }
}

/// The detector the session drives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetectorInstance {
    /// A caller-created detector with one attached family
    Explicit {
        detector: NativeHandle,
        family: NativeHandle,
        family_name: String,
    },
    /// The adapter's single library-managed detector
    Implicit,
}

#[derive(Debug)]
pub struct Resolved {
    pub bindings: BindingSet,
    pub detector: DetectorInstance,
    pub diagnostics: Vec<Diagnostic>,
}

struct FamilyInstance {
    name: String,
    constructor: BoundFn,
    destructor: Option<BoundFn>,
    handle: NativeHandle,
}

/// Resolves a [`BindingSet`] against one loaded module. Consumed by
/// [`resolve`](Self::resolve), so resolution happens once per module.
pub struct NativeBindingResolver<'a> {
    module: &'a dyn NativeModule,
    config: &'a DetectorConfig,
    exports: Vec<String>,
    diagnostics: Vec<Diagnostic>,
}

impl<'a> NativeBindingResolver<'a> {
    pub fn new(module: &'a dyn NativeModule, config: &'a DetectorConfig) -> Self {
        let mut exports = module.export_names();
        exports.sort();
        exports.dedup();
        Self {
            module,
            config,
            exports,
            diagnostics: Vec::new(),
        }
    }

    /// Try each configured dialect in order. If all fail, the first
    /// dialect's error is returned and the rest are logged.
    pub fn resolve(mut self) -> Result<Resolved> {
        let config = self.config;
        let mut first_error = None;

        for &dialect in &config.dialects {
            let attempt = match dialect {
                Dialect::Canonical => self.resolve_canonical(),
                Dialect::Adapter => self.resolve_adapter(),
            };
            match attempt {
                Ok((bindings, detector)) => {
                    info!(
                        "{} Bound {} exports from {} ({} dialect)",
                        prefix::BIND,
                        bindings.iter().len(),
                        self.module.name(),
                        dialect
                    );
                    return Ok(Resolved {
                        bindings,
                        detector,
                        diagnostics: self.diagnostics,
                    });
                }
                Err(e) => {
                    warn!("{} {} dialect unavailable: {}", prefix::BIND, dialect, e);
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        Err(first_error
            .unwrap_or_else(|| DetectError::Setup("no dialects configured".to_string())))
    }

    fn resolve_canonical(&mut self) -> Result<(BindingSet, DetectorInstance)> {
        let mut table = self.bind_table(Dialect::Canonical)?;
        let create_detector = take(&mut table, LogicalOp::CreateDetector)?;
        let add_family = take(&mut table, LogicalOp::AddFamily)?;
        let detect = take(&mut table, LogicalOp::Detect)?;
        let result_count = take(&mut table, LogicalOp::ResultCount)?;
        let result_at = take(&mut table, LogicalOp::ResultAt)?;
        let detection_id = take(&mut table, LogicalOp::DetectionId)?;
        let corner_x = take(&mut table, LogicalOp::CornerX)?;
        let corner_y = take(&mut table, LogicalOp::CornerY)?;
        let destroy_results = take(&mut table, LogicalOp::DestroyResults)?;
        let alloc = take(&mut table, LogicalOp::Alloc)?;
        let free = take(&mut table, LogicalOp::Free)?;
        let destroy_detector = table.remove(&LogicalOp::DestroyDetector);

        let family = self.create_family()?;

        let detector = match create_detector.call_handle(&[]) {
            Ok(h) if !h.is_null() => h,
            Ok(_) => {
                release(family.destructor.as_ref(), family.handle);
                return Err(DetectError::Setup(format!(
                    "`{}` returned null",
                    create_detector.export()
                )));
            }
            Err(e) => {
                release(family.destructor.as_ref(), family.handle);
                return Err(e.into());
            }
        };

        let attach = add_family.call_void(&[
            NativeValue::Handle(detector),
            NativeValue::Handle(family.handle),
        ]);
        if let Err(e) = attach {
            release(destroy_detector.as_ref(), detector);
            release(family.destructor.as_ref(), family.handle);
            return Err(e.into());
        }

        info!(
            "{} Detector {} ready with family {}",
            prefix::BIND,
            detector,
            family.name
        );

        let bindings = BindingSet::Canonical(CanonicalBindings {
            create_detector,
            create_family: family.constructor,
            add_family,
            detect,
            result_count,
            result_at,
            corner_x,
            corner_y,
            detection_id,
            destroy_results,
            alloc,
            free,
            destroy_detector,
            destroy_family: family.destructor,
        });
        let instance = DetectorInstance::Explicit {
            detector,
            family: family.handle,
            family_name: family.name,
        };
        Ok((bindings, instance))
    }

    fn resolve_adapter(&mut self) -> Result<(BindingSet, DetectorInstance)> {
        let mut table = self.bind_table(Dialect::Adapter)?;
        let init = take(&mut table, LogicalOp::CreateDetector)?;
        let set_image_buffer = take(&mut table, LogicalOp::SetImageBuffer)?;
        let detect = take(&mut table, LogicalOp::Detect)?;
        let destroy = table.remove(&LogicalOp::DestroyDetector);

        let code = init.call_int(&[])?;
        if code != 0 {
            return Err(DetectError::Setup(format!(
                "`{}` returned {}",
                init.export(),
                code
            )));
        }

        let bindings = BindingSet::Adapter(AdapterBindings {
            init,
            set_image_buffer,
            detect,
            destroy,
        });
        Ok((bindings, DetectorInstance::Implicit))
    }

    /// Bind every symbol of a dialect; fails on the first required miss.
    fn bind_table(&mut self, dialect: Dialect) -> Result<HashMap<LogicalOp, BoundFn>> {
        let mut table = HashMap::new();
        for spec in dialect::symbols(dialect) {
            match self.lookup(&spec) {
                Some(bound) => {
                    debug!(
                        "{} {} -> {} ({:?})",
                        prefix::BIND,
                        spec.op,
                        bound.export(),
                        bound.resolution()
                    );
                    table.insert(spec.op, bound);
                }
                None if spec.required => {
                    return Err(DetectError::Binding {
                        op: spec.op,
                        candidates: self.candidates(spec.pattern.as_ref()),
                    });
                }
                None => {
                    self.note(spec.op, format!("optional `{}` not exported", spec.name));
                }
            }
        }
        Ok(table)
    }

    fn create_family(&mut self) -> Result<FamilyInstance> {
        let config = self.config;
        let mut tried = Vec::new();
        let mut any_resolved = false;

        for family in &config.families {
            let Some(constructor) = self.lookup(&dialect::family_constructor(family)) else {
                self.note(
                    LogicalOp::CreateFamily,
                    format!("family `{family}` not exported"),
                );
                tried.push(family.clone());
                continue;
            };
            any_resolved = true;
            if let Some(handle) = self.construct(&constructor) {
                let destructor = self.lookup(&dialect::family_destructor(family));
                return Ok(FamilyInstance {
                    name: family.clone(),
                    constructor,
                    destructor,
                    handle,
                });
            }
            tried.push(family.clone());
        }

        let scanned: Vec<String> = self
            .exports
            .iter()
            .filter(|e| FAMILY_CONSTRUCTOR.matches(e))
            .cloned()
            .collect();
        for export in scanned {
            let name = dialect::family_from_export(&export);
            if config.families.contains(&name) {
                continue;
            }
            let Some(func) = self.bind_scanned(&export, SIG_CREATE) else {
                continue;
            };
            any_resolved = true;
            self.note(
                LogicalOp::CreateFamily,
                format!("no configured family usable; bound `{export}` by pattern scan"),
            );
            let constructor = BoundFn::new(
                LogicalOp::CreateFamily,
                &export,
                Resolution::PatternScan,
                SIG_CREATE,
                func,
            );
            if let Some(handle) = self.construct(&constructor) {
                let destructor = self.lookup(&dialect::family_destructor(&name));
                return Ok(FamilyInstance {
                    name,
                    constructor,
                    destructor,
                    handle,
                });
            }
            tried.push(name);
        }

        if any_resolved {
            Err(DetectError::FamilyUnavailable { tried })
        } else {
            Err(DetectError::Binding {
                op: LogicalOp::CreateFamily,
                candidates: self.candidates(Some(&FAMILY_CONSTRUCTOR)),
            })
        }
    }

    fn construct(&mut self, constructor: &BoundFn) -> Option<NativeHandle> {
        match constructor.call_handle(&[]) {
            Ok(h) if !h.is_null() => Some(h),
            Ok(_) => {
                self.note(
                    constructor.op(),
                    format!("`{}` returned null", constructor.export()),
                );
                None
            }
            Err(e) => {
                self.note(constructor.op(), e.to_string());
                None
            }
        }
    }

    fn lookup(&mut self, spec: &SymbolSpec) -> Option<BoundFn> {
        if self.module.has_call_adapter() {
            if let Some(func) = self.module.wrap(&spec.name, spec.signature) {
                return Some(BoundFn::new(
                    spec.op,
                    &spec.name,
                    Resolution::CallAdapter,
                    spec.signature,
                    func,
                ));
            }
        }

        for candidate in [format!("_{}", spec.name), spec.name.clone()] {
            if let Some(func) = self.module.raw_export(&candidate, spec.signature) {
                return Some(BoundFn::new(
                    spec.op,
                    candidate,
                    Resolution::RawExport,
                    spec.signature,
                    func,
                ));
            }
        }

        let pattern = spec.pattern?;
        let (export, func) = self
            .exports
            .iter()
            .filter(|e| pattern.matches(e))
            .find_map(|e| self.bind_scanned(e, spec.signature).map(|f| (e.clone(), f)))?;

        warn!(
            "{} `{}` not exported, using `{}` for {}",
            prefix::BIND,
            spec.name,
            export,
            spec.op
        );
        self.note(
            spec.op,
            format!("`{}` not exported; bound `{}` by pattern scan", spec.name, export),
        );
        Some(BoundFn::new(
            spec.op,
            export,
            Resolution::PatternScan,
            spec.signature,
            func,
        ))
    }

    fn bind_scanned(&self, export: &str, signature: Signature) -> Option<NativeFn> {
        self.module.raw_export(export, signature).or_else(|| {
            if self.module.has_call_adapter() {
                self.module.wrap(export.trim_start_matches('_'), signature)
            } else {
                None
            }
        })
    }

    fn candidates(&self, pattern: Option<&SymbolPattern>) -> Vec<String> {
        let Some(pattern) = pattern else {
            return Vec::new();
        };
        self.exports
            .iter()
            .filter(|e| pattern.loosely_matches(e))
            .take(MAX_CANDIDATES)
            .cloned()
            .collect()
    }

    fn note(&mut self, op: LogicalOp, message: String) {
        debug!("{} {}: {}", prefix::BIND, op, message);
        self.diagnostics.push(Diagnostic { op, message });
    }
}

fn take(table: &mut HashMap<LogicalOp, BoundFn>, op: LogicalOp) -> Result<BoundFn> {
    table.remove(&op).ok_or(DetectError::Binding {
        op,
        candidates: Vec::new(),
    })
}

/// Best-effort release through an optional destructor binding.
pub(crate) fn release(destructor: Option<&BoundFn>, handle: NativeHandle) {
    match destructor {
        Some(f) => {
            if let Err(e) = f.call_void(&[NativeValue::Handle(handle)]) {
                warn!("{} release of {} failed: {}", prefix::CLOSE, handle, e);
            }
        }
        None => debug!("{} no destructor bound, leaving {}", prefix::CLOSE, handle),
    }
}
