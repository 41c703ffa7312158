//! Copying native results into owned [`Detection`]s.
//!
//! A canonical result list is library-owned and must be destroyed exactly
//! once. [`ListGuard`] ties that to scope, so every exit from
//! [`marshal_canonical`] (success, a failing accessor, a bad count) releases
//! the list.

use serde::Deserialize;
use tagstream::tracing::prefix;
use tracing::warn;

use crate::binding::{BoundFn, CanonicalBindings};
use crate::error::{CallError, DetectError, Result};
use crate::native::{NativeModule, NativeValue};
use crate::types::{Detection, NativeHandle, Point};

/// Upper bound on a believable detection count for one frame
pub const MAX_DETECTIONS: i32 = 4096;

/// Destroys a native detection list when dropped.
pub struct ListGuard<'a> {
    destroy: &'a BoundFn,
    list: NativeHandle,
}

impl<'a> ListGuard<'a> {
    pub fn new(destroy: &'a BoundFn, list: NativeHandle) -> Self {
        Self { destroy, list }
    }

    pub fn list(&self) -> NativeHandle {
        self.list
    }
}

impl Drop for ListGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.destroy.call_void(&[NativeValue::Handle(self.list)]) {
            warn!("{} destroying result list {} failed: {}", prefix::CLOSE, self.list, e);
        }
    }
}

/// Walk a canonical result list. `list` must be non-null; it is destroyed
/// before this returns.
pub fn marshal_canonical(bindings: &CanonicalBindings, list: NativeHandle) -> Result<Vec<Detection>> {
    let guard = ListGuard::new(&bindings.destroy_results, list);

    let count = bindings.result_count.call_int(&[NativeValue::Handle(guard.list())])?;
    if !(0..=MAX_DETECTIONS).contains(&count) {
        return Err(CallError::new(
            bindings.result_count.export(),
            format!("implausible detection count {count}"),
        )
        .into());
    }

    let mut detections = Vec::with_capacity(count as usize);
    for index in 0..count {
        let det = bindings
            .result_at
            .call_handle(&[NativeValue::Handle(list), NativeValue::Int(index)])?;
        if det.is_null() {
            return Err(CallError::new(
                bindings.result_at.export(),
                format!("null detection at index {index}"),
            )
            .into());
        }

        let id = bindings.detection_id.call_int(&[NativeValue::Handle(det)])?;
        let mut corners = [Point::default(); 4];
        for (j, corner) in corners.iter_mut().enumerate() {
            let args = [NativeValue::Handle(det), NativeValue::Int(j as i32)];
            corner.x = bindings.corner_x.call_float(&args)?;
            corner.y = bindings.corner_y.call_float(&args)?;
        }
        detections.push(Detection::from_corners(id, corners));
    }

    drop(guard);
    Ok(detections)
}

#[derive(Debug, Deserialize)]
struct RecordDetection {
    id: i32,
    corners: Vec<Point>,
}

/// Decode an adapter result record: `{ int len; int alloc; char *json; }`.
///
/// The record and its text are library-owned; nothing is released here.
pub fn marshal_adapter(module: &dyn NativeModule, record: NativeHandle) -> Result<Vec<Detection>> {
    let width = module.pointer_width();
    let header = module.read_memory(record, 8 + width)?;

    let len = i32::from_ne_bytes([header[0], header[1], header[2], header[3]]);
    if len <= 0 {
        return Ok(Vec::new());
    }
    let text = match width {
        4 => u32::from_ne_bytes([header[8], header[9], header[10], header[11]]) as usize,
        8 => {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&header[8..16]);
            u64::from_ne_bytes(raw) as usize
        }
        other => {
            return Err(DetectError::Memory(format!("unsupported pointer width {other}")));
        }
    };

    let json = module.read_memory(NativeHandle(text), len as usize)?;
    let items: Vec<RecordDetection> = serde_json::from_slice(&json)
        .map_err(|e| CallError::new("atagjs_detect", format!("malformed result record: {e}")))?;

    items
        .into_iter()
        .map(|item| -> Result<Detection> {
            let corners: [Point; 4] = item.corners.try_into().map_err(|c: Vec<Point>| {
                CallError::new(
                    "atagjs_detect",
                    format!("detection {} has {} corners", item.id, c.len()),
                )
            })?;
            Ok(Detection::from_corners(item.id, corners))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::binding::{BindingSet, LogicalOp, NativeBindingResolver, Resolution};
    use crate::config::DetectorConfig;
    use crate::native::sim::SimulatedModule;

    fn square(id: i32, x: f64) -> Detection {
        Detection::from_corners(
            id,
            [
                Point::new(x, 0.0),
                Point::new(x + 2.0, 0.0),
                Point::new(x + 2.0, 2.0),
                Point::new(x, 2.0),
            ],
        )
    }

    fn canonical(module: &SimulatedModule) -> CanonicalBindings {
        let config = DetectorConfig::default();
        match NativeBindingResolver::new(module, &config).resolve().unwrap().bindings {
            BindingSet::Canonical(b) => b,
            other => panic!("unexpected {:?}", other.dialect()),
        }
    }

    fn detect_list(module: &SimulatedModule, bindings: &CanonicalBindings) -> NativeHandle {
        let detector = bindings.create_detector.call_handle(&[]).unwrap();
        let family = bindings.create_family.call_handle(&[]).unwrap();
        bindings
            .add_family
            .call_void(&[NativeValue::Handle(detector), NativeValue::Handle(family)])
            .unwrap();
        let image = bindings.alloc.call_handle(&[NativeValue::Size(4)]).unwrap();
        module.write_memory(image, &[0; 4]).unwrap();
        bindings
            .detect
            .call_handle(&[
                NativeValue::Handle(detector),
                NativeValue::Handle(image),
                NativeValue::Int(2),
                NativeValue::Int(2),
            ])
            .unwrap()
    }

    #[test]
    fn test_canonical_copies_and_destroys_once() {
        let module = SimulatedModule::builder()
            .canonical()
            .family("tag36h11")
            .detections(vec![square(3, 0.0), square(9, 10.0)])
            .build();
        let bindings = canonical(&module);
        let list = detect_list(&module, &bindings);

        let detections = marshal_canonical(&bindings, list).unwrap();
        assert_eq!(detections, vec![square(3, 0.0), square(9, 10.0)]);
        assert_eq!(detections[1].center, Point::new(11.0, 1.0));
        assert_eq!(module.probe().calls("apriltag_detection_list_destroy"), 1);
        assert_eq!(module.probe().live_lists(), 0);
    }

    #[test]
    fn test_empty_list_is_still_destroyed() {
        let module = SimulatedModule::builder().canonical().family("tag36h11").build();
        let bindings = canonical(&module);
        let list = detect_list(&module, &bindings);

        assert!(marshal_canonical(&bindings, list).unwrap().is_empty());
        assert_eq!(module.probe().calls("apriltag_detection_list_destroy"), 1);
    }

    #[test]
    fn test_failing_accessor_still_destroys() {
        let module = SimulatedModule::builder()
            .canonical()
            .family("tag36h11")
            .detections(vec![square(1, 0.0)])
            .build();
        let bindings = canonical(&module);
        let list = detect_list(&module, &bindings);

        // a handle that names no list fails at the count, and is still released
        let stale = NativeHandle(list.0 + 1);
        assert!(marshal_canonical(&bindings, stale).is_err());
        assert!(marshal_canonical(&bindings, list).is_ok());
        assert_eq!(module.probe().lists_destroyed(), 1);
        assert_eq!(module.probe().calls("apriltag_detection_list_destroy"), 2);
    }

    #[test]
    fn test_garbage_count_is_rejected_and_list_destroyed() {
        let module = SimulatedModule::builder()
            .canonical()
            .family("tag36h11")
            .detections(vec![square(1, 0.0)])
            .build();
        let mut bindings = canonical(&module);
        let list = detect_list(&module, &bindings);

        for bogus in [i32::MAX, MAX_DETECTIONS + 1, -1] {
            bindings.result_count = BoundFn::new(
                LogicalOp::ResultCount,
                "apriltag_detections_size",
                Resolution::RawExport,
                bindings.result_count.signature(),
                Arc::new(move |_: &[NativeValue]| Ok::<_, CallError>(NativeValue::Int(bogus))),
            );
            let err = marshal_canonical(&bindings, list).unwrap_err();
            assert!(err.to_string().contains("implausible"), "{err}");
        }
        assert_eq!(module.probe().calls("apriltag_detection_list_destroy"), 3);
    }
}
