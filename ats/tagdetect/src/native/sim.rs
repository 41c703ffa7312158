//! In-process simulated detector module.
//!
//! Behaves like a native build from the pipeline's point of view: a linear
//! heap addressed by handles (offset 0 is null), caller-visible `malloc` /
//! `free`, opaque detector, family and result-list objects, and either the
//! canonical or the adapter export set. Export naming is configurable so
//! every resolution path can be exercised, and a [`SimProbe`] exposes call
//! counters and live-object accounting.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;

use crate::binding::dialect::{
    SIG_ADD_FAMILY, SIG_ALLOC, SIG_CORNER, SIG_CREATE, SIG_DETECT, SIG_INIT, SIG_QUERY,
    SIG_RELEASE, SIG_RESULT_AT, SIG_SET_IMAGE, SIG_TEARDOWN,
};
use crate::error::{CallError, DetectError, Result};
use crate::native::{
    arg_handle, arg_int, arg_size, ModuleLoader, NativeFn, NativeModule, NativeValue, Signature,
};
use crate::types::{Detection, NativeHandle, Point};

/// Lowest heap address handed out; everything below reads as null.
const HEAP_BASE: usize = 16;
/// Object handles live far above the heap so the two never alias.
const OBJECT_BASE: usize = 0x4000_0000;
/// Simulated address space is 32-bit
const POINTER_WIDTH: usize = 4;

type Shared = Arc<Mutex<SimState>>;

#[derive(Debug, Clone)]
enum SimObject {
    Family(String),
    Detector { families: Vec<usize> },
    List(Vec<Detection>),
    Detection { list: usize, index: usize },
}

#[derive(Debug, Default)]
struct SimState {
    heap: Vec<u8>,
    blocks: BTreeMap<usize, usize>,
    objects: HashMap<usize, SimObject>,
    next_object: usize,
    calls: HashMap<String, usize>,
    allocations: usize,
    frees: usize,
    lists_destroyed: usize,
    script: Vec<Detection>,
    detect_error: Option<String>,
    null_results: bool,
    panic_on_detect: bool,
    last_image: Option<(u32, u32, Vec<u8>)>,
    adapter_image: Option<(usize, u32, u32)>,
    adapter_record: Option<usize>,
    adapter_text: Option<usize>,
}

impl SimState {
    fn alloc(&mut self, len: usize) -> usize {
        let start = self.heap.len().max(HEAP_BASE).next_multiple_of(8);
        self.heap.resize(start + len.max(1), 0);
        self.blocks.insert(start, len);
        start
    }

    fn release(&mut self, addr: usize) -> bool {
        self.blocks.remove(&addr).is_some()
    }

    fn span(&self, addr: usize, len: usize) -> std::result::Result<std::ops::Range<usize>, String> {
        let (start, size) = self
            .blocks
            .range(..=addr)
            .next_back()
            .ok_or_else(|| format!("{addr:#x} is not inside any allocation"))?;
        if addr + len > start + size {
            return Err(format!(
                "{len} bytes at {addr:#x} overrun the {size}-byte block at {start:#x}"
            ));
        }
        Ok(addr..addr + len)
    }

    fn object(&mut self, object: SimObject) -> usize {
        self.next_object += 16;
        let handle = OBJECT_BASE + self.next_object;
        self.objects.insert(handle, object);
        handle
    }

    fn list(&self, handle: usize) -> std::result::Result<&Vec<Detection>, String> {
        match self.objects.get(&handle) {
            Some(SimObject::List(items)) => Ok(items),
            _ => Err(format!("{handle:#x} is not a live detection list")),
        }
    }

    fn detection(&self, handle: usize) -> std::result::Result<&Detection, String> {
        match self.objects.get(&handle) {
            Some(SimObject::Detection { list, index }) => self
                .list(*list)?
                .get(*index)
                .ok_or_else(|| format!("detection {index} out of range")),
            _ => Err(format!("{handle:#x} is not a live detection")),
        }
    }

    fn read_image(&mut self, addr: usize, width: u32, height: u32) -> std::result::Result<(), String> {
        if width == 0 || height == 0 {
            return Err("image has zero dimensions".to_string());
        }
        let span = self.span(addr, width as usize * height as usize)?;
        self.last_image = Some((width, height, self.heap[span].to_vec()));
        Ok(())
    }
}

#[derive(Clone)]
struct Export {
    signature: Signature,
    func: NativeFn,
}

#[derive(Default)]
struct Tables {
    wrapped: BTreeMap<String, Export>,
    raw: BTreeMap<String, Export>,
}

impl Tables {
    /// Register `name` behind the call adapter and `_name` as a raw export.
    fn export<F>(&mut self, state: &Shared, name: &str, signature: Signature, body: F)
    where
        F: Fn(&mut SimState, &[NativeValue]) -> std::result::Result<NativeValue, String>
            + Send
            + Sync
            + 'static,
    {
        let state = Arc::clone(state);
        let export_name = name.to_string();
        let func: NativeFn = Arc::new(move |args: &[NativeValue]| {
            let mut s = state.lock();
            *s.calls.entry(export_name.clone()).or_default() += 1;
            body(&mut s, args).map_err(|m| CallError::new(&export_name, m))
        });
        self.wrapped.insert(
            name.to_string(),
            Export {
                signature,
                func: func.clone(),
            },
        );
        self.raw
            .insert(format!("_{name}"), Export { signature, func });
    }

    fn remove(&mut self, name: &str) -> Option<Export> {
        let wrapped = self.wrapped.remove(name);
        let raw = self.raw.remove(&format!("_{name}"));
        wrapped.or(raw)
    }
}

/// Configures a [`SimulatedModule`].
#[derive(Debug, Default)]
pub struct SimulatedModuleBuilder {
    canonical: bool,
    adapter: bool,
    families: Vec<String>,
    failing_families: Vec<String>,
    without_call_adapter: bool,
    removed: Vec<String>,
    renamed: Vec<(String, String)>,
    raw_only: Vec<String>,
    script: Vec<Detection>,
    null_detector: bool,
    init_code: i32,
}

impl SimulatedModuleBuilder {
    /// Export the canonical `apriltag_*` surface plus `malloc`/`free`
    pub fn canonical(mut self) -> Self {
        self.canonical = true;
        self
    }

    /// Export the `atagjs_*` surface
    pub fn adapter(mut self) -> Self {
        self.adapter = true;
        self
    }

    /// Export `{family}_create` / `{family}_destroy`
    pub fn family(mut self, family: &str) -> Self {
        self.families.push(family.to_string());
        self
    }

    /// The family's constructor returns null
    pub fn failing_family(mut self, family: &str) -> Self {
        self.failing_families.push(family.to_string());
        self
    }

    /// No call-convention adapter; only raw `_name` exports resolve
    pub fn without_call_adapter(mut self) -> Self {
        self.without_call_adapter = true;
        self
    }

    /// Drop an export under every naming variant
    pub fn remove(mut self, name: &str) -> Self {
        self.removed.push(name.to_string());
        self
    }

    /// Move an export to a different name (both variants)
    pub fn rename(mut self, from: &str, to: &str) -> Self {
        self.renamed.push((from.to_string(), to.to_string()));
        self
    }

    /// Keep only the raw `_name` variant of an export
    pub fn raw_only(mut self, name: &str) -> Self {
        self.raw_only.push(name.to_string());
        self
    }

    /// Detections returned by every detect call
    pub fn detections(mut self, script: Vec<Detection>) -> Self {
        self.script = script;
        self
    }

    /// Detector construction returns null
    pub fn null_detector(mut self) -> Self {
        self.null_detector = true;
        self
    }

    /// Return code of the adapter's `init`
    pub fn init_code(mut self, code: i32) -> Self {
        self.init_code = code;
        self
    }

    pub fn build(self) -> SimulatedModule {
        let state: Shared = Arc::new(Mutex::new(SimState {
            script: self.script.clone(),
            ..SimState::default()
        }));
        let mut tables = Tables::default();

        if self.canonical || self.adapter {
            register_memory(&mut tables, &state);
        }
        if self.canonical {
            register_canonical(&mut tables, &state, self.null_detector);
        }
        for family in &self.families {
            register_family(&mut tables, &state, family, self.failing_families.contains(family));
        }
        if self.adapter {
            register_adapter(&mut tables, &state, self.init_code);
        }

        for name in &self.removed {
            tables.remove(name);
        }
        for (from, to) in &self.renamed {
            let wrapped = tables.wrapped.remove(from);
            let raw = tables.raw.remove(&format!("_{from}"));
            if let Some(export) = wrapped {
                tables.wrapped.insert(to.clone(), export);
            }
            if let Some(export) = raw {
                tables.raw.insert(format!("_{to}"), export);
            }
        }
        for name in &self.raw_only {
            tables.wrapped.remove(name);
        }

        let call_adapter = !self.without_call_adapter;
        if !call_adapter {
            tables.wrapped.clear();
        }

        SimulatedModule {
            name: "simulated".to_string(),
            call_adapter,
            tables: Arc::new(tables),
            state,
        }
    }
}

fn register_memory(tables: &mut Tables, state: &Shared) {
    tables.export(state, "malloc", SIG_ALLOC, |s, args| {
        let len = arg_size(args, 0)?;
        s.allocations += 1;
        Ok(NativeValue::Handle(NativeHandle(s.alloc(len))))
    });
    tables.export(state, "free", SIG_RELEASE, |s, args| {
        let addr = arg_handle(args, 0)?;
        if addr == 0 {
            return Ok(NativeValue::Void);
        }
        if !s.release(addr) {
            return Err(format!("free of unknown block {addr:#x}"));
        }
        s.frees += 1;
        Ok(NativeValue::Void)
    });
}

fn register_canonical(tables: &mut Tables, state: &Shared, null_detector: bool) {
    tables.export(state, "apriltag_detector_create", SIG_CREATE, move |s, _| {
        if null_detector {
            return Ok(NativeValue::Handle(NativeHandle::NULL));
        }
        let handle = s.object(SimObject::Detector { families: vec![] });
        Ok(NativeValue::Handle(NativeHandle(handle)))
    });
    tables.export(state, "apriltag_detector_destroy", SIG_RELEASE, |s, args| {
        let det = arg_handle(args, 0)?;
        match s.objects.remove(&det) {
            Some(SimObject::Detector { .. }) => Ok(NativeValue::Void),
            _ => Err(format!("{det:#x} is not a live detector")),
        }
    });
    tables.export(
        state,
        "apriltag_detector_add_family_bits",
        SIG_ADD_FAMILY,
        |s, args| {
            let det = arg_handle(args, 0)?;
            let family = arg_handle(args, 1)?;
            if !matches!(s.objects.get(&family), Some(SimObject::Family(_))) {
                return Err(format!("{family:#x} is not a live family"));
            }
            match s.objects.get_mut(&det) {
                Some(SimObject::Detector { families }) => {
                    families.push(family);
                    Ok(NativeValue::Void)
                }
                _ => Err(format!("{det:#x} is not a live detector")),
            }
        },
    );
    tables.export(state, "apriltag_detector_detect", SIG_DETECT, |s, args| {
        let det = arg_handle(args, 0)?;
        let image = arg_handle(args, 1)?;
        let width = arg_int(args, 2)?;
        let height = arg_int(args, 3)?;
        match s.objects.get(&det) {
            Some(SimObject::Detector { families }) if !families.is_empty() => {}
            Some(SimObject::Detector { .. }) => return Err("detector has no family".to_string()),
            _ => return Err(format!("{det:#x} is not a live detector")),
        }
        if s.panic_on_detect {
            panic!("simulated fault inside detect");
        }
        if let Some(message) = &s.detect_error {
            return Err(message.clone());
        }
        s.read_image(image, width.max(0) as u32, height.max(0) as u32)?;
        if s.null_results {
            return Ok(NativeValue::Handle(NativeHandle::NULL));
        }
        let items = s.script.clone();
        Ok(NativeValue::Handle(NativeHandle(s.object(SimObject::List(items)))))
    });
    tables.export(state, "apriltag_detections_size", SIG_QUERY, |s, args| {
        let list = arg_handle(args, 0)?;
        Ok(NativeValue::Int(s.list(list)?.len() as i32))
    });
    tables.export(state, "apriltag_detections_get", SIG_RESULT_AT, |s, args| {
        let list = arg_handle(args, 0)?;
        let index = arg_int(args, 1)?;
        let len = s.list(list)?.len();
        if index < 0 || index as usize >= len {
            return Err(format!("index {index} out of range for {len} detections"));
        }
        let handle = s.object(SimObject::Detection {
            list,
            index: index as usize,
        });
        Ok(NativeValue::Handle(NativeHandle(handle)))
    });
    tables.export(state, "apriltag_detection_id", SIG_QUERY, |s, args| {
        let det = arg_handle(args, 0)?;
        Ok(NativeValue::Int(s.detection(det)?.id))
    });
    tables.export(state, "apriltag_detection_px", SIG_CORNER, |s, args| {
        let corner = corner(s, args)?;
        Ok(NativeValue::Float(corner.x))
    });
    tables.export(state, "apriltag_detection_py", SIG_CORNER, |s, args| {
        let corner = corner(s, args)?;
        Ok(NativeValue::Float(corner.y))
    });
    tables.export(state, "apriltag_detection_list_destroy", SIG_RELEASE, |s, args| {
        let list = arg_handle(args, 0)?;
        match s.objects.remove(&list) {
            Some(SimObject::List(_)) => {}
            _ => return Err(format!("{list:#x} is not a live detection list")),
        }
        s.objects.retain(|_, o| !matches!(o, SimObject::Detection { list: l, .. } if *l == list));
        s.lists_destroyed += 1;
        Ok(NativeValue::Void)
    });
}

fn corner(s: &SimState, args: &[NativeValue]) -> std::result::Result<Point, String> {
    let det = arg_handle(args, 0)?;
    let index = arg_int(args, 1)?;
    let detection = s.detection(det)?;
    usize::try_from(index)
        .ok()
        .and_then(|i| detection.corners.get(i).copied())
        .ok_or_else(|| format!("corner {index} out of range"))
}

fn register_family(tables: &mut Tables, state: &Shared, family: &str, failing: bool) {
    let name = family.to_string();
    tables.export(state, &format!("{family}_create"), SIG_CREATE, move |s, _| {
        if failing {
            return Ok(NativeValue::Handle(NativeHandle::NULL));
        }
        let handle = s.object(SimObject::Family(name.clone()));
        Ok(NativeValue::Handle(NativeHandle(handle)))
    });
    tables.export(state, &format!("{family}_destroy"), SIG_RELEASE, |s, args| {
        let family = arg_handle(args, 0)?;
        match s.objects.remove(&family) {
            Some(SimObject::Family(_)) => Ok(NativeValue::Void),
            _ => Err(format!("{family:#x} is not a live family")),
        }
    });
}

fn register_adapter(tables: &mut Tables, state: &Shared, init_code: i32) {
    tables.export(state, "atagjs_init", SIG_INIT, move |_, _| {
        Ok(NativeValue::Int(init_code))
    });
    tables.export(state, "atagjs_set_img_buffer", SIG_SET_IMAGE, |s, args| {
        let width = arg_int(args, 0)?;
        let height = arg_int(args, 1)?;
        let stride = arg_int(args, 2)?;
        if width <= 0 || height <= 0 || stride < width {
            return Err(format!("bad image geometry {width}x{height} stride {stride}"));
        }
        if let Some((old, _, _)) = s.adapter_image.take() {
            s.release(old);
        }
        let addr = s.alloc(stride as usize * height as usize);
        s.adapter_image = Some((addr, width as u32, height as u32));
        Ok(NativeValue::Handle(NativeHandle(addr)))
    });
    tables.export(state, "atagjs_detect", SIG_CREATE, |s, _| {
        if s.panic_on_detect {
            panic!("simulated fault inside detect");
        }
        if let Some(message) = &s.detect_error {
            return Err(message.clone());
        }
        let (addr, width, height) = s
            .adapter_image
            .ok_or_else(|| "no image buffer registered".to_string())?;
        s.read_image(addr, width, height)?;
        if s.null_results {
            return Ok(NativeValue::Handle(NativeHandle::NULL));
        }

        let items: Vec<serde_json::Value> = s
            .script
            .iter()
            .map(|d| {
                json!({
                    "id": d.id,
                    "hamming": 0,
                    "corners": d.corners.iter().map(|p| json!({"x": p.x, "y": p.y})).collect::<Vec<_>>(),
                    "center": {"x": d.center.x, "y": d.center.y},
                })
            })
            .collect();
        let text = serde_json::to_vec(&items).map_err(|e| e.to_string())?;

        if let Some(old) = s.adapter_text.take() {
            s.release(old);
        }
        let text_addr = s.alloc(text.len());
        s.heap[text_addr..text_addr + text.len()].copy_from_slice(&text);
        s.adapter_text = Some(text_addr);

        let record = match s.adapter_record {
            Some(addr) => addr,
            None => {
                let addr = s.alloc(8 + POINTER_WIDTH);
                s.adapter_record = Some(addr);
                addr
            }
        };
        let len = text.len() as i32;
        s.heap[record..record + 4].copy_from_slice(&len.to_ne_bytes());
        s.heap[record + 4..record + 8].copy_from_slice(&len.to_ne_bytes());
        s.heap[record + 8..record + 12].copy_from_slice(&(text_addr as u32).to_ne_bytes());
        Ok(NativeValue::Handle(NativeHandle(record)))
    });
    tables.export(state, "atagjs_destroy", SIG_TEARDOWN, |s, _| {
        for addr in [s.adapter_image.take().map(|(a, _, _)| a), s.adapter_text.take(), s.adapter_record.take()]
            .into_iter()
            .flatten()
        {
            s.release(addr);
        }
        Ok(NativeValue::Void)
    });
}

/// An in-process stand-in for a native detector build.
///
/// Clones share the same heap and counters.
#[derive(Clone)]
pub struct SimulatedModule {
    name: String,
    call_adapter: bool,
    tables: Arc<Tables>,
    state: Shared,
}

impl SimulatedModule {
    pub fn builder() -> SimulatedModuleBuilder {
        SimulatedModuleBuilder::default()
    }

    /// Canonical build with the default family and one tag in view.
    pub fn demo() -> Self {
        Self::builder()
            .canonical()
            .family("tag36h11")
            .detections(vec![Self::demo_detection()])
            .build()
    }

    /// The tag [`demo`](Self::demo) reports on every frame
    pub fn demo_detection() -> Detection {
        let corners = [
            Point::new(100.0, 100.0),
            Point::new(180.0, 100.0),
            Point::new(180.0, 180.0),
            Point::new(100.0, 180.0),
        ];
        Detection::from_corners(0, corners)
    }

    pub fn probe(&self) -> SimProbe {
        SimProbe {
            state: Arc::clone(&self.state),
        }
    }

    /// A loader that hands out clones of this module.
    pub fn loader(&self) -> SimulatedLoader {
        SimulatedLoader {
            module: Some(self.clone()),
            error: String::new(),
        }
    }
}

impl NativeModule for SimulatedModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn has_call_adapter(&self) -> bool {
        self.call_adapter
    }

    fn wrap(&self, name: &str, signature: Signature) -> Option<NativeFn> {
        if !self.call_adapter {
            return None;
        }
        self.tables
            .wrapped
            .get(name)
            .filter(|e| e.signature == signature)
            .map(|e| e.func.clone())
    }

    fn raw_export(&self, name: &str, signature: Signature) -> Option<NativeFn> {
        self.tables
            .raw
            .get(name)
            .filter(|e| e.signature == signature)
            .map(|e| e.func.clone())
    }

    fn export_names(&self) -> Vec<String> {
        self.tables
            .raw
            .keys()
            .chain(self.tables.wrapped.keys())
            .cloned()
            .collect()
    }

    fn read_memory(&self, handle: NativeHandle, len: usize) -> Result<Vec<u8>> {
        let s = self.state.lock();
        let span = s.span(handle.0, len).map_err(DetectError::Memory)?;
        Ok(s.heap[span].to_vec())
    }

    fn write_memory(&self, handle: NativeHandle, bytes: &[u8]) -> Result<()> {
        let mut s = self.state.lock();
        let span = s.span(handle.0, bytes.len()).map_err(DetectError::Memory)?;
        s.heap[span].copy_from_slice(bytes);
        Ok(())
    }

    fn pointer_width(&self) -> usize {
        POINTER_WIDTH
    }
}

/// Read access to a simulated module's accounting, plus fault injection.
#[derive(Clone)]
pub struct SimProbe {
    state: Shared,
}

impl SimProbe {
    /// Calls made to an export, by plain name
    pub fn calls(&self, export: &str) -> usize {
        self.state.lock().calls.get(export).copied().unwrap_or(0)
    }

    /// Caller-side `malloc` calls
    pub fn allocations(&self) -> usize {
        self.state.lock().allocations
    }

    /// Caller-side `free` calls
    pub fn frees(&self) -> usize {
        self.state.lock().frees
    }

    pub fn lists_destroyed(&self) -> usize {
        self.state.lock().lists_destroyed
    }

    /// Live detectors, families and result lists
    pub fn live_objects(&self) -> usize {
        self.state
            .lock()
            .objects
            .values()
            .filter(|o| !matches!(o, SimObject::Detection { .. }))
            .count()
    }

    pub fn live_lists(&self) -> usize {
        self.state
            .lock()
            .objects
            .values()
            .filter(|o| matches!(o, SimObject::List(_)))
            .count()
    }

    /// Live heap blocks, caller- and library-owned
    pub fn live_blocks(&self) -> usize {
        self.state.lock().blocks.len()
    }

    /// The most recent image the detector read
    pub fn last_image(&self) -> Option<(u32, u32, Vec<u8>)> {
        self.state.lock().last_image.clone()
    }

    pub fn set_detections(&self, script: Vec<Detection>) {
        self.state.lock().script = script;
    }

    /// Make every detect call fail with `message` (or succeed again on `None`)
    pub fn set_detect_error(&self, message: Option<&str>) {
        self.state.lock().detect_error = message.map(str::to_string);
    }

    pub fn set_null_results(&self, null: bool) {
        self.state.lock().null_results = null;
    }

    pub fn set_panic_on_detect(&self, panic: bool) {
        self.state.lock().panic_on_detect = panic;
    }
}

/// Hands out clones of a [`SimulatedModule`], or fails like a missing library.
pub struct SimulatedLoader {
    module: Option<SimulatedModule>,
    error: String,
}

impl SimulatedLoader {
    pub fn failing(message: &str) -> Self {
        Self {
            module: None,
            error: message.to_string(),
        }
    }
}

impl ModuleLoader for SimulatedLoader {
    fn load(&self) -> Result<Box<dyn NativeModule>> {
        match &self.module {
            Some(module) => Ok(Box::new(module.clone())),
            None => Err(DetectError::Load(self.error.clone())),
        }
    }

    fn describe(&self) -> String {
        match &self.module {
            Some(module) => module.name.clone(),
            None => "simulated (unavailable)".to_string(),
        }
    }
}
