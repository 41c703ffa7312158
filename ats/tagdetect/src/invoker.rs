//! Per-frame detection against a resolved native module.
//!
//! A [`DetectorSession`] owns everything resolution produced: the module,
//! its bindings, the detector instance and the image arena. Dropping the
//! session releases all of it.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Instant;

use tagstream::tracing::prefix;
use tracing::{debug, info, warn};

use crate::arena::{ImageBufferArena, ModuleAllocator};
use crate::binding::resolver::release;
use crate::binding::{BindingSet, DetectorInstance, Diagnostic, NativeBindingResolver};
use crate::config::DetectorConfig;
use crate::error::{CallError, DetectError, Result};
use crate::marshal::{marshal_adapter, marshal_canonical};
use crate::native::{NativeModule, NativeValue};
use crate::types::{Detection, DetectionStats, Frame, NativeHandle, PipelineState};

/// Library-owned image region of the adapter dialect
#[derive(Debug, Clone, Copy)]
struct AdapterImage {
    handle: NativeHandle,
    width: u32,
    height: u32,
}

pub struct DetectorSession {
    module: Box<dyn NativeModule>,
    bindings: BindingSet,
    detector: DetectorInstance,
    arena: ImageBufferArena,
    adapter_image: Option<AdapterImage>,
    state: PipelineState,
    frames: u64,
}

impl DetectorSession {
    /// Resolve bindings and construct the detector on a freshly loaded module.
    pub fn open(module: Box<dyn NativeModule>, config: &DetectorConfig) -> Result<(Self, Vec<Diagnostic>)> {
        let resolved = NativeBindingResolver::new(module.as_ref(), config).resolve()?;
        let session = Self {
            module,
            bindings: resolved.bindings,
            detector: resolved.detector,
            arena: ImageBufferArena::new(),
            adapter_image: None,
            state: PipelineState::Ready,
            frames: 0,
        };
        Ok((session, resolved.diagnostics))
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn bindings(&self) -> &BindingSet {
        &self.bindings
    }

    pub fn detector(&self) -> &DetectorInstance {
        &self.detector
    }

    pub fn arena(&self) -> &ImageBufferArena {
        &self.arena
    }

    /// Run the detector on one frame.
    ///
    /// Invalid frames are rejected with [`DetectError::InvalidFrame`]. A
    /// failure inside the native library (an error, a panic, a null list,
    /// an unreadable result) is logged and yields zero detections; the
    /// session stays `Ready`.
    pub fn detect(&mut self, frame: &Frame) -> Result<(Vec<Detection>, DetectionStats)> {
        if self.state != PipelineState::Ready {
            return Err(DetectError::NotReady(self.state));
        }
        frame.validate()?;

        self.state = PipelineState::Detecting;
        self.frames += 1;
        let started = Instant::now();
        let mut stats = DetectionStats {
            frame_width: frame.width,
            frame_height: frame.height,
            ..DetectionStats::default()
        };

        let outcome = if matches!(self.bindings, BindingSet::Canonical(_)) {
            self.run_canonical(frame, &mut stats)
        } else {
            self.run_adapter(frame, &mut stats)
        };
        self.state = PipelineState::Ready;

        let detections = match outcome {
            Ok(detections) => detections,
            Err(e) => {
                warn!("{} frame {} yielded no detections: {}", prefix::DETECT, self.frames, e);
                Vec::new()
            }
        };
        stats.total_us = started.elapsed().as_micros() as u64;
        stats.detections = detections.len() as u32;
        debug!(
            "{} frame {} {}x{}: {} detections in {}us",
            prefix::DETECT,
            self.frames,
            frame.width,
            frame.height,
            detections.len(),
            stats.total_us
        );
        Ok((detections, stats))
    }

    fn run_canonical(&mut self, frame: &Frame, stats: &mut DetectionStats) -> Result<Vec<Detection>> {
        let Self {
            module,
            bindings,
            detector,
            arena,
            ..
        } = self;
        let (BindingSet::Canonical(b), DetectorInstance::Explicit { detector, .. }) = (&*bindings, &*detector)
        else {
            return Err(DetectError::Setup("canonical bindings without a detector".to_string()));
        };

        let t = Instant::now();
        let allocator = ModuleAllocator {
            module: module.as_ref(),
            alloc: &b.alloc,
            free: &b.free,
        };
        let image = arena.write(&allocator, frame)?;
        stats.upload_us = t.elapsed().as_micros() as u64;

        let t = Instant::now();
        let args = [
            NativeValue::Handle(*detector),
            NativeValue::Handle(image),
            NativeValue::Int(frame.width as i32),
            NativeValue::Int(frame.height as i32),
        ];
        let list = guarded(b.detect.export(), || b.detect.call_handle(&args))?;
        stats.detect_us = t.elapsed().as_micros() as u64;
        if list.is_null() {
            return Err(CallError::new(b.detect.export(), "returned a null list").into());
        }

        let t = Instant::now();
        let detections = marshal_canonical(b, list);
        stats.marshal_us = t.elapsed().as_micros() as u64;
        detections
    }

    fn run_adapter(&mut self, frame: &Frame, stats: &mut DetectionStats) -> Result<Vec<Detection>> {
        let BindingSet::Adapter(b) = &self.bindings else {
            return Err(DetectError::Setup("adapter dispatch on canonical bindings".to_string()));
        };

        let t = Instant::now();
        let current = match self.adapter_image {
            Some(img) if img.width == frame.width && img.height == frame.height => img.handle,
            _ => {
                self.adapter_image = None;
                let handle = b.set_image_buffer.call_handle(&[
                    NativeValue::Int(frame.width as i32),
                    NativeValue::Int(frame.height as i32),
                    NativeValue::Int(frame.width as i32),
                ])?;
                if handle.is_null() {
                    return Err(DetectError::Memory(format!(
                        "`{}` returned null for {}x{}",
                        b.set_image_buffer.export(),
                        frame.width,
                        frame.height
                    )));
                }
                self.adapter_image = Some(AdapterImage {
                    handle,
                    width: frame.width,
                    height: frame.height,
                });
                handle
            }
        };
        self.module.write_memory(current, frame.luminance())?;
        stats.upload_us = t.elapsed().as_micros() as u64;

        let t = Instant::now();
        let record = guarded(b.detect.export(), || b.detect.call_handle(&[]))?;
        stats.detect_us = t.elapsed().as_micros() as u64;
        if record.is_null() {
            return Err(CallError::new(b.detect.export(), "returned a null record").into());
        }

        let t = Instant::now();
        let detections = marshal_adapter(self.module.as_ref(), record);
        stats.marshal_us = t.elapsed().as_micros() as u64;
        detections
    }
}

/// Run a native call, turning a panic on the far side into a [`CallError`].
fn guarded<T>(
    export: &str,
    call: impl FnOnce() -> std::result::Result<T, CallError>,
) -> std::result::Result<T, CallError> {
    match catch_unwind(AssertUnwindSafe(call)) {
        Ok(result) => result,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(CallError::new(export, format!("panicked: {message}")))
        }
    }
}

impl Drop for DetectorSession {
    fn drop(&mut self) {
        match &self.bindings {
            BindingSet::Canonical(b) => {
                let allocator = ModuleAllocator {
                    module: self.module.as_ref(),
                    alloc: &b.alloc,
                    free: &b.free,
                };
                self.arena.release(&allocator);
                if let DetectorInstance::Explicit {
                    detector, family, ..
                } = &self.detector
                {
                    release(b.destroy_detector.as_ref(), *detector);
                    release(b.destroy_family.as_ref(), *family);
                }
            }
            BindingSet::Adapter(b) => {
                if let Some(destroy) = &b.destroy {
                    if let Err(e) = destroy.call_void(&[]) {
                        warn!("{} adapter teardown failed: {}", prefix::CLOSE, e);
                    }
                }
            }
        }
        info!(
            "{} Detector session closed after {} frames",
            prefix::CLOSE,
            self.frames
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::sim::SimulatedModule;
    use crate::types::Point;

    fn tag(id: i32) -> Detection {
        Detection::from_corners(
            id,
            [
                Point::new(1.0, 1.0),
                Point::new(5.0, 1.0),
                Point::new(5.0, 5.0),
                Point::new(1.0, 5.0),
            ],
        )
    }

    fn session(module: &SimulatedModule) -> DetectorSession {
        DetectorSession::open(Box::new(module.clone()), &DetectorConfig::default())
            .unwrap()
            .0
    }

    #[test]
    fn test_detect_passes_image_and_returns_detections() {
        let module = SimulatedModule::builder()
            .canonical()
            .family("tag36h11")
            .detections(vec![tag(4)])
            .build();
        let mut session = session(&module);

        let frame = Frame::new(3, 2, vec![1, 2, 3, 4, 5, 6]);
        let (detections, stats) = session.detect(&frame).unwrap();
        assert_eq!(detections, vec![tag(4)]);
        assert_eq!(stats.detections, 1);
        assert_eq!(stats.frame_width, 3);
        assert_eq!(module.probe().last_image(), Some((3, 2, vec![1, 2, 3, 4, 5, 6])));
        assert_eq!(session.state(), PipelineState::Ready);
    }

    #[test]
    fn test_native_failure_is_empty_result() {
        let module = SimulatedModule::builder().canonical().family("tag36h11").build();
        let mut session = session(&module);
        module.probe().set_detect_error(Some("internal failure"));

        let (detections, _) = session.detect(&Frame::new(2, 2, vec![0; 4])).unwrap();
        assert!(detections.is_empty());
        assert_eq!(session.state(), PipelineState::Ready);
    }

    #[test]
    fn test_panic_inside_detect_is_contained() {
        let module = SimulatedModule::builder().canonical().family("tag36h11").build();
        let mut session = session(&module);
        module.probe().set_panic_on_detect(true);

        let (detections, _) = session.detect(&Frame::new(2, 2, vec![0; 4])).unwrap();
        assert!(detections.is_empty());

        module.probe().set_panic_on_detect(false);
        assert!(session.detect(&Frame::new(2, 2, vec![0; 4])).is_ok());
    }

    #[test]
    fn test_null_list_skips_destroy() {
        let module = SimulatedModule::builder().canonical().family("tag36h11").build();
        let mut session = session(&module);
        module.probe().set_null_results(true);

        let (detections, _) = session.detect(&Frame::new(2, 2, vec![0; 4])).unwrap();
        assert!(detections.is_empty());
        assert_eq!(module.probe().calls("apriltag_detection_list_destroy"), 0);
    }

    #[test]
    fn test_invalid_frame_rejected() {
        let module = SimulatedModule::builder().canonical().family("tag36h11").build();
        let mut session = session(&module);
        let err = session.detect(&Frame::new(4, 4, vec![0; 3])).unwrap_err();
        assert!(matches!(err, DetectError::InvalidFrame(_)));
        assert_eq!(module.probe().calls("apriltag_detector_detect"), 0);
    }

    #[test]
    fn test_drop_releases_everything() {
        let module = SimulatedModule::builder().canonical().family("tag36h11").build();
        {
            let mut session = session(&module);
            session.detect(&Frame::new(2, 2, vec![0; 4])).unwrap();
            assert_eq!(module.probe().live_objects(), 2);
        }
        let probe = module.probe();
        assert_eq!(probe.live_objects(), 0);
        assert_eq!(probe.allocations(), probe.frees());
    }

    #[test]
    fn test_adapter_reregisters_on_dimension_change() {
        let module = SimulatedModule::builder()
            .adapter()
            .detections(vec![tag(11)])
            .build();
        let mut session = session(&module);

        for _ in 0..3 {
            let (detections, _) = session.detect(&Frame::new(4, 4, vec![7; 16])).unwrap();
            assert_eq!(detections, vec![tag(11)]);
        }
        session.detect(&Frame::new(8, 2, vec![7; 16])).unwrap();

        assert_eq!(module.probe().calls("atagjs_set_img_buffer"), 2);
        assert_eq!(module.probe().last_image(), Some((8, 2, vec![7; 16])));
    }
}
