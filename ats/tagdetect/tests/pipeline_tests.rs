//! End-to-end pipeline tests against the simulated detector module

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tagstream_detect::transport::DropReason;
use tagstream_detect::{
    spawn_detection_worker, Admission, CapturePipeline, DetectError, Detection,
    DetectionService, DetectorConfig, Frame, FrameSource, ModuleLoader, NativeModule,
    OverlayConsumer, Reply, Request, SimulatedModule, TransportEvent,
};

const WAIT: Duration = Duration::from_secs(5);

/// A fixed-size source producing a flat gray RGBA frame
struct StillSource {
    width: u32,
    height: u32,
    captures: usize,
    released: bool,
}

impl StillSource {
    fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            captures: 0,
            released: false,
        }
    }
}

impl FrameSource for StillSource {
    fn dimensions(&self) -> Option<(u32, u32)> {
        Some((self.width, self.height))
    }

    fn capture_rgba(&mut self, rgba: &mut Vec<u8>) -> bool {
        if self.released {
            return false;
        }
        rgba.clear();
        rgba.resize((self.width * self.height * 4) as usize, 128);
        self.captures += 1;
        true
    }

    fn release(&mut self) {
        self.released = true;
    }
}

#[derive(Default)]
struct RecordingOverlay {
    batches: Vec<(Vec<Detection>, u32, u32)>,
    clears: usize,
}

impl OverlayConsumer for RecordingOverlay {
    fn render(&mut self, detections: &[Detection], width: u32, height: u32) {
        self.batches.push((detections.to_vec(), width, height));
    }

    fn clear(&mut self) {
        self.clears += 1;
    }
}

fn ready_service(module: &SimulatedModule) -> DetectionService {
    let mut service = DetectionService::new(Box::new(module.loader()), DetectorConfig::default());
    assert_eq!(service.handle(Request::Init), vec![Reply::Ready]);
    service
}

fn gray(width: u32, height: u32) -> Frame {
    Frame::new(width, height, vec![0; (width * height) as usize])
}

#[test]
fn test_blank_frame_has_no_detections() {
    let module = SimulatedModule::builder()
        .canonical()
        .family("tag36h11")
        .build();
    let mut service = ready_service(&module);

    let replies = service.handle(Request::Detect { image: gray(4, 4) });
    assert_eq!(replies, vec![Reply::Result { detections: vec![] }]);
}

#[test]
fn test_arena_allocates_once_for_shrinking_frames() {
    let module = SimulatedModule::builder()
        .canonical()
        .family("tag36h11")
        .build();
    let probe = module.probe();
    let mut service = ready_service(&module);

    service.handle(Request::Detect { image: gray(10, 10) });
    assert_eq!(probe.allocations(), 1);
    service.handle(Request::Detect { image: gray(10, 5) });
    assert_eq!(probe.allocations(), 1);

    let arena = service.session().unwrap().arena();
    assert_eq!(arena.allocations(), 1);
    assert_eq!(arena.capacity(), 100);
}

#[test]
fn test_result_list_destroyed_once_per_detect() {
    let module = SimulatedModule::builder()
        .canonical()
        .family("tag36h11")
        .build();
    let probe = module.probe();
    let mut service = ready_service(&module);

    service.handle(Request::Detect { image: gray(4, 4) });
    assert_eq!(probe.lists_destroyed(), 1);
    assert_eq!(probe.live_lists(), 0);

    probe.set_detect_error(Some("detector fault"));
    let replies = service.handle(Request::Detect { image: gray(4, 4) });
    assert_eq!(replies, vec![Reply::empty_result()]);
    assert_eq!(probe.live_lists(), 0);
}

#[test]
fn test_session_release_on_drop() {
    let module = SimulatedModule::demo();
    let probe = module.probe();
    let mut service = ready_service(&module);
    service.handle(Request::Detect { image: gray(8, 8) });
    assert!(probe.live_objects() > 0);

    drop(service);
    assert_eq!(probe.live_objects(), 0);
    assert_eq!(probe.live_blocks(), 0);
}

#[test]
fn test_adapter_dialect_end_to_end() {
    let module = SimulatedModule::builder().adapter().build();
    let probe = module.probe();
    probe.set_detections(vec![SimulatedModule::demo_detection()]);
    let mut service = ready_service(&module);

    let replies = service.handle(Request::Detect { image: gray(16, 16) });
    assert_eq!(
        replies,
        vec![Reply::Result {
            detections: vec![SimulatedModule::demo_detection()]
        }]
    );
    assert_eq!(probe.last_image().map(|(w, h, _)| (w, h)), Some((16, 16)));
}

#[test]
fn test_at_most_one_frame_sent_while_detect_outstanding() {
    let module = SimulatedModule::demo();
    let probe = module.probe();
    let (mut transport, worker) =
        spawn_detection_worker(Box::new(module.loader()), DetectorConfig::default()).unwrap();
    transport.await_ready().unwrap();

    let mut sent = 0;
    for _ in 0..20 {
        match transport.submit(gray(8, 8)) {
            Admission::Sent => sent += 1,
            Admission::Dropped(reason) => assert_eq!(reason, DropReason::InFlight),
        }
    }
    assert_eq!(sent, 1);

    let deadline = Instant::now() + WAIT;
    let mut results = 0;
    while results == 0 && Instant::now() < deadline {
        for event in transport.poll() {
            if let TransportEvent::Detections(detections) = event {
                assert_eq!(detections.len(), 1);
                results += 1;
            }
        }
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(results, 1);
    assert_eq!(probe.calls("apriltag_detector_detect"), 1);
    assert_eq!(transport.stats().dropped_in_flight, 19);

    drop(transport);
    worker.join();
}

#[test]
fn test_capture_pipeline_renders_and_stops() {
    let module = SimulatedModule::demo();
    let (transport, worker) =
        spawn_detection_worker(Box::new(module.loader()), DetectorConfig::default()).unwrap();
    let mut pipeline = CapturePipeline::new(
        StillSource::new(32, 24),
        RecordingOverlay::default(),
        transport,
        Duration::from_millis(5),
    );
    pipeline.start().unwrap();

    let deadline = Instant::now() + WAIT;
    while pipeline.overlay().batches.is_empty() && Instant::now() < deadline {
        pipeline.tick().unwrap();
        thread::sleep(Duration::from_millis(1));
    }

    let (detections, width, height) = &pipeline.overlay().batches[0];
    assert_eq!(detections.len(), 1);
    assert_eq!((*width, *height), (32, 24));
    let stats = pipeline.stats();
    assert!(stats.frames_sent >= 1);
    assert!(stats.frames_sent <= pipeline.transport().stats().frames_sent);

    pipeline.stop();
    assert!(!pipeline.is_running());
    assert!(pipeline.source().released);
    assert_eq!(pipeline.overlay().clears, 1);

    // ticking after stop does nothing
    let before = pipeline.stats();
    pipeline.tick().unwrap();
    assert_eq!(pipeline.stats(), before);

    drop(pipeline);
    worker.join();
}

#[test]
fn test_capture_pipeline_surfaces_init_failure() {
    let module = SimulatedModule::builder()
        .canonical()
        .family("tag36h11")
        .remove("apriltag_detector_detect")
        .build();
    let (transport, worker) =
        spawn_detection_worker(Box::new(module.loader()), DetectorConfig::default()).unwrap();
    let mut pipeline = CapturePipeline::new(
        StillSource::new(8, 8),
        RecordingOverlay::default(),
        transport,
        Duration::from_millis(5),
    );
    pipeline.start().unwrap();

    let deadline = Instant::now() + WAIT;
    let err = loop {
        if let Err(e) = pipeline.tick() {
            break e;
        }
        assert!(Instant::now() < deadline, "init failure never surfaced");
        thread::sleep(Duration::from_millis(1));
    };
    assert!(err.is_init_failure());
    assert!(err.to_string().contains("`detect`"));
    assert_eq!(pipeline.source().captures, 0);

    drop(pipeline);
    worker.join();
}

/// A loader stuck in module load for `delay`, then failing
struct StalledLoader {
    delay: Duration,
    loads: Arc<AtomicUsize>,
}

impl ModuleLoader for StalledLoader {
    fn load(&self) -> tagstream_detect::Result<Box<dyn NativeModule>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        thread::sleep(self.delay);
        Err(DetectError::Load("stalled build".to_string()))
    }

    fn describe(&self) -> String {
        "stalled".to_string()
    }
}

#[test]
fn test_init_retries_never_block_on_stalled_load() {
    let loads = Arc::new(AtomicUsize::new(0));
    let loader = StalledLoader {
        delay: Duration::from_millis(500),
        loads: Arc::clone(&loads),
    };
    let config = DetectorConfig {
        init_timeout_ms: 5,
        ..DetectorConfig::default()
    };
    let (mut transport, worker) = spawn_detection_worker(Box::new(loader), config).unwrap();

    for _ in 0..5 {
        let started = Instant::now();
        transport.init().unwrap();
        assert!(started.elapsed() < Duration::from_millis(100));

        thread::sleep(Duration::from_millis(20));
        assert!(transport.poll().contains(&TransportEvent::InitTimedOut));
    }

    drop(transport);
    worker.join();
    assert_eq!(loads.load(Ordering::SeqCst), 1);
}
