//! The detection context.
//!
//! [`DetectionService`] is the request handler: a state machine over
//! `Uninitialized -> Resolving -> Ready <-> Detecting`, with `Faulted` on a
//! failed init. It is synchronous and returns the replies for each request,
//! which keeps it testable without threads. [`spawn_detection_worker`] runs
//! it on a dedicated thread behind a pair of bounded channels.

use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use tagstream::tracing::prefix;
use tracing::{debug, error, info, warn};

use crate::config::DetectorConfig;
use crate::error::{DetectError, Result};
use crate::invoker::DetectorSession;
use crate::native::ModuleLoader;
use crate::protocol::{DebugInfo, Reply, Request};
use crate::transport::ChannelTransport;
use crate::types::{Frame, PipelineState};

/// Requests in flight at once: one init plus one detect
const REQUEST_CAPACITY: usize = 2;
/// Replies buffered toward the capture context
const REPLY_CAPACITY: usize = 16;

pub struct DetectionService {
    loader: Box<dyn ModuleLoader>,
    config: DetectorConfig,
    state: PipelineState,
    session: Option<DetectorSession>,
}

impl DetectionService {
    pub fn new(loader: Box<dyn ModuleLoader>, config: DetectorConfig) -> Self {
        Self {
            loader,
            config,
            state: PipelineState::Uninitialized,
            session: None,
        }
    }

    pub fn state(&self) -> PipelineState {
        match &self.session {
            Some(session) => session.state(),
            None => self.state,
        }
    }

    pub fn session(&self) -> Option<&DetectorSession> {
        self.session.as_ref()
    }

    pub fn handle(&mut self, request: Request) -> Vec<Reply> {
        match request {
            Request::Init => self.init(),
            Request::Detect { image } => self.detect(image),
        }
    }

    fn init(&mut self) -> Vec<Reply> {
        if self.session.is_some() {
            debug!("{} init while ready, keeping current bindings", prefix::BIND);
            return vec![Reply::Ready];
        }

        self.state = PipelineState::Resolving;
        info!("{} Loading detector from {}", prefix::OPEN, self.loader.describe());

        let opened = self
            .loader
            .load()
            .and_then(|module| DetectorSession::open(module, &self.config));
        match opened {
            Ok((session, diagnostics)) => {
                self.session = Some(session);
                let mut replies: Vec<Reply> = diagnostics
                    .iter()
                    .map(|d| Reply::Debug(DebugInfo::resolution(d.to_string())))
                    .collect();
                replies.push(Reply::Ready);
                info!("{} Detector ready", prefix::BIND);
                replies
            }
            Err(e) => {
                self.state = PipelineState::Faulted;
                error!("{} Detector initialization failed: {}", prefix::BIND, e);
                vec![Reply::error(e.to_string())]
            }
        }
    }

    fn detect(&mut self, image: Frame) -> Vec<Reply> {
        let Some(session) = self.session.as_mut() else {
            debug!(
                "{} detect while {}, replying empty",
                prefix::DETECT,
                self.state
            );
            return vec![Reply::empty_result()];
        };

        let mut replies = Vec::new();
        if self.config.debug_images {
            replies.push(Reply::Debug(DebugInfo::image(&image)));
        }

        match session.detect(&image) {
            Ok((detections, stats)) => {
                if self.config.debug_images {
                    replies.push(Reply::Debug(DebugInfo::stats(stats)));
                }
                replies.push(Reply::Result { detections });
            }
            Err(e @ DetectError::InvalidFrame(_)) => {
                warn!("{} {}", prefix::DETECT, e);
                replies.push(Reply::error(e.to_string()));
                replies.push(Reply::empty_result());
            }
            Err(e) => {
                warn!("{} {}", prefix::DETECT, e);
                replies.push(Reply::empty_result());
            }
        }
        replies
    }
}

/// Join handle of the detection thread
pub struct WorkerHandle {
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Wait for the thread to exit. It exits once every request sender is
    /// dropped.
    pub fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("{} detection thread panicked", prefix::CLOSE);
            }
        }
    }
}

/// Start the detection context on its own thread.
pub fn spawn_detection_worker(
    loader: Box<dyn ModuleLoader>,
    config: DetectorConfig,
) -> Result<(ChannelTransport, WorkerHandle)> {
    let (request_tx, request_rx) = bounded::<Request>(REQUEST_CAPACITY);
    let (reply_tx, reply_rx) = bounded::<Reply>(REPLY_CAPACITY);
    let init_timeout = config.init_timeout();
    let service = DetectionService::new(loader, config);

    let thread = thread::Builder::new()
        .name("tagstream-detect".to_string())
        .spawn(move || run(service, request_rx, reply_tx))
        .map_err(|e| DetectError::Setup(format!("failed to spawn detection thread: {e}")))?;

    let transport = ChannelTransport::new(request_tx, reply_rx, init_timeout);
    Ok((
        transport,
        WorkerHandle {
            thread: Some(thread),
        },
    ))
}

fn run(mut service: DetectionService, requests: Receiver<Request>, replies: Sender<Reply>) {
    debug!("{} detection context started", prefix::OPEN);
    while let Ok(request) = requests.recv() {
        for reply in service.handle(request) {
            if matches!(reply, Reply::Debug(_)) {
                if let Err(TrySendError::Disconnected(_)) = replies.try_send(reply) {
                    return;
                }
            } else if replies.send(reply).is_err() {
                return;
            }
        }
    }
    info!("{} detection context stopped", prefix::CLOSE);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::sim::{SimulatedLoader, SimulatedModule};
    use crate::types::{Detection, Point};

    fn service(module: &SimulatedModule, debug_images: bool) -> DetectionService {
        let config = DetectorConfig {
            debug_images,
            ..DetectorConfig::default()
        };
        DetectionService::new(Box::new(module.loader()), config)
    }

    fn tag() -> Detection {
        Detection::from_corners(
            7,
            [
                Point::new(0.0, 0.0),
                Point::new(4.0, 0.0),
                Point::new(4.0, 4.0),
                Point::new(0.0, 4.0),
            ],
        )
    }

    #[test]
    fn test_detect_before_init_is_empty() {
        let module = SimulatedModule::demo();
        let mut svc = service(&module, false);
        let replies = svc.handle(Request::Detect {
            image: Frame::new(2, 2, vec![0; 4]),
        });
        assert_eq!(replies, vec![Reply::empty_result()]);
        assert_eq!(svc.state(), PipelineState::Uninitialized);
    }

    #[test]
    fn test_init_then_detect() {
        let module = SimulatedModule::builder()
            .canonical()
            .family("tag36h11")
            .detections(vec![tag()])
            .build();
        let mut svc = service(&module, false);

        assert_eq!(svc.handle(Request::Init), vec![Reply::Ready]);
        assert_eq!(svc.state(), PipelineState::Ready);

        let replies = svc.handle(Request::Detect {
            image: Frame::new(2, 2, vec![0; 4]),
        });
        assert_eq!(replies, vec![Reply::Result { detections: vec![tag()] }]);
    }

    #[test]
    fn test_second_init_does_not_resolve_again() {
        let module = SimulatedModule::demo();
        let mut svc = service(&module, false);
        svc.handle(Request::Init);
        assert_eq!(svc.handle(Request::Init), vec![Reply::Ready]);
        assert_eq!(module.probe().calls("apriltag_detector_create"), 1);
    }

    #[test]
    fn test_load_failure_faults_and_reports() {
        let mut svc = DetectionService::new(
            Box::new(SimulatedLoader::failing("libapriltag.so: not found")),
            DetectorConfig::default(),
        );
        let replies = svc.handle(Request::Init);
        assert!(matches!(&replies[..], [Reply::Error { message }] if message.contains("not found")));
        assert_eq!(svc.state(), PipelineState::Faulted);

        let replies = svc.handle(Request::Detect {
            image: Frame::new(2, 2, vec![0; 4]),
        });
        assert_eq!(replies, vec![Reply::empty_result()]);
    }

    #[test]
    fn test_undersized_frame_reports_error_then_empty() {
        let module = SimulatedModule::demo();
        let mut svc = service(&module, false);
        svc.handle(Request::Init);

        let replies = svc.handle(Request::Detect {
            image: Frame::new(4, 4, vec![0; 10]),
        });
        assert_eq!(replies.len(), 2);
        assert!(matches!(replies[0], Reply::Error { .. }));
        assert_eq!(replies[1], Reply::empty_result());
        assert_eq!(svc.state(), PipelineState::Ready);
    }

    #[test]
    fn test_debug_images_precede_result() {
        let module = SimulatedModule::demo();
        let mut svc = service(&module, true);
        svc.handle(Request::Init);

        let replies = svc.handle(Request::Detect {
            image: Frame::new(2, 2, vec![1, 2, 3, 4]),
        });
        assert_eq!(replies.len(), 3);
        match &replies[0] {
            Reply::Debug(info) => assert_eq!(info.img_info.map(|i| i.checksum), Some(10)),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(&replies[1], Reply::Debug(info) if info.stats.is_some()));
        assert!(matches!(replies[2], Reply::Result { .. }));
    }

    #[test]
    fn test_resolution_notes_are_sent_before_ready() {
        let module = SimulatedModule::builder()
            .canonical()
            .family("tag16h5")
            .build();
        let mut svc = service(&module, false);
        let replies = svc.handle(Request::Init);
        assert_eq!(replies.last(), Some(&Reply::Ready));
        assert!(replies
            .iter()
            .any(|r| matches!(r, Reply::Debug(info) if info.resolution.as_deref().is_some_and(|n| n.contains("tag36h11")))));
    }

    #[test]
    fn test_reinit_after_fault_reloads() {
        let module = SimulatedModule::builder()
            .canonical()
            .family("tag36h11")
            .failing_family("tag36h11")
            .build();
        let mut svc = service(&module, false);
        assert!(matches!(&svc.handle(Request::Init)[..], [Reply::Error { .. }]));
        assert_eq!(svc.state(), PipelineState::Faulted);

        // a second attempt runs resolution from scratch
        assert!(matches!(&svc.handle(Request::Init)[..], [Reply::Error { .. }]));
        assert_eq!(module.probe().calls("tag36h11_create"), 2);
    }
}
