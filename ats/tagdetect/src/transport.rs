//! Capture-side end of the request/reply link.
//!
//! Enforces the single-outstanding-detect rule: a frame is only sent when no
//! detect is awaiting its result and the detector has reported `ready`.
//! Everything else is dropped at the door and counted, never queued.

use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use serde::Serialize;
use tagstream::tracing::prefix;
use tracing::{debug, warn};

use crate::error::{DetectError, Result};
use crate::protocol::{DebugInfo, Reply, Request};
use crate::types::{Detection, Frame};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Initializing { deadline: Instant },
    Ready,
    Failed,
}

/// Why a frame was not sent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// A detect is still awaiting its result
    InFlight,
    /// No `ready` received yet (or init failed)
    NotReady,
    /// The detection context is gone
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Sent,
    Dropped(DropReason),
}

/// What the capture context learns from one poll
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Ready,
    Detections(Vec<Detection>),
    /// Per-frame error reported by the detection context
    Error(String),
    Debug(DebugInfo),
    InitFailed(String),
    InitTimedOut,
    Disconnected,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransportStats {
    pub frames_sent: u64,
    pub dropped_in_flight: u64,
    pub dropped_not_ready: u64,
    pub results_received: u64,
    /// Results that arrived after a stop and were discarded
    pub results_discarded: u64,
}

pub struct ChannelTransport {
    requests: Sender<Request>,
    replies: Receiver<Reply>,
    phase: Phase,
    in_flight: bool,
    /// An `init` was sent and neither `ready` nor `error` has come back
    init_pending: bool,
    discard_in_flight: bool,
    init_timeout: Duration,
    stats: TransportStats,
}

impl ChannelTransport {
    pub fn new(requests: Sender<Request>, replies: Receiver<Reply>, init_timeout: Duration) -> Self {
        Self {
            requests,
            replies,
            phase: Phase::Idle,
            in_flight: false,
            init_pending: false,
            discard_in_flight: false,
            init_timeout,
            stats: TransportStats::default(),
        }
    }

    /// Send `init` and start the ready deadline. Never blocks.
    ///
    /// Calling again after a failure or timeout starts a fresh deadline. If
    /// the earlier `init` is still unanswered it is not sent again; its
    /// eventual reply settles the new attempt.
    pub fn init(&mut self) -> Result<()> {
        if self.phase == Phase::Ready {
            return Ok(());
        }
        if self.init_pending {
            debug!("{} init still unanswered, not sending another", prefix::BIND);
        } else {
            match self.requests.try_send(Request::Init) {
                Ok(()) => self.init_pending = true,
                Err(TrySendError::Full(_)) => {
                    self.phase = Phase::Failed;
                    return Err(DetectError::InitFailed(
                        "detection context is not accepting requests".to_string(),
                    ));
                }
                Err(TrySendError::Disconnected(_)) => {
                    self.phase = Phase::Failed;
                    return Err(DetectError::Disconnected);
                }
            }
        }
        self.phase = Phase::Initializing {
            deadline: Instant::now() + self.init_timeout,
        };
        debug!("{} init sent, waiting up to {:?}", prefix::BIND, self.init_timeout);
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.phase == Phase::Ready
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    /// Whether a frame submitted now would be sent
    pub fn can_admit(&self) -> bool {
        self.is_ready() && !self.in_flight
    }

    pub fn stats(&self) -> TransportStats {
        self.stats
    }

    pub fn init_timeout(&self) -> Duration {
        self.init_timeout
    }

    /// Offer a frame. Ownership of the pixel buffer moves into the channel
    /// when sent; a dropped frame is simply discarded.
    pub fn submit(&mut self, frame: Frame) -> Admission {
        if self.phase != Phase::Ready {
            self.stats.dropped_not_ready += 1;
            return Admission::Dropped(DropReason::NotReady);
        }
        if self.in_flight {
            self.stats.dropped_in_flight += 1;
            return Admission::Dropped(DropReason::InFlight);
        }
        match self.requests.try_send(Request::Detect { image: frame }) {
            Ok(()) => {
                self.in_flight = true;
                self.stats.frames_sent += 1;
                Admission::Sent
            }
            Err(TrySendError::Full(_)) => {
                self.stats.dropped_in_flight += 1;
                Admission::Dropped(DropReason::InFlight)
            }
            Err(TrySendError::Disconnected(_)) => {
                self.phase = Phase::Failed;
                Admission::Dropped(DropReason::Disconnected)
            }
        }
    }

    /// Drain every pending reply without blocking.
    pub fn poll(&mut self) -> Vec<TransportEvent> {
        let mut events = Vec::new();
        loop {
            match self.replies.try_recv() {
                Ok(reply) => {
                    if let Some(event) = self.accept(reply) {
                        events.push(event);
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    if self.phase != Phase::Failed {
                        self.phase = Phase::Failed;
                        events.push(TransportEvent::Disconnected);
                    }
                    break;
                }
            }
        }

        if let Phase::Initializing { deadline } = self.phase {
            if Instant::now() >= deadline {
                warn!(
                    "{} no ready reply within {:?}",
                    prefix::BIND,
                    self.init_timeout
                );
                self.phase = Phase::Failed;
                events.push(TransportEvent::InitTimedOut);
            }
        }
        events
    }

    /// Block until the detector is ready, init fails, or the deadline passes.
    pub fn await_ready(&mut self) -> Result<()> {
        if self.phase == Phase::Idle || self.phase == Phase::Failed {
            self.init()?;
        }
        loop {
            let deadline = match self.phase {
                Phase::Ready => return Ok(()),
                Phase::Initializing { deadline } => deadline,
                Phase::Idle | Phase::Failed => {
                    return Err(DetectError::InitFailed("init not pending".to_string()))
                }
            };
            let wait = deadline.saturating_duration_since(Instant::now());
            match self.replies.recv_timeout(wait) {
                Ok(reply) => match self.accept(reply) {
                    Some(TransportEvent::InitFailed(message)) => {
                        return Err(DetectError::InitFailed(message))
                    }
                    _ => continue,
                },
                Err(RecvTimeoutError::Timeout) => {
                    self.phase = Phase::Failed;
                    return Err(DetectError::InitTimeout(self.init_timeout));
                }
                Err(RecvTimeoutError::Disconnected) => {
                    self.phase = Phase::Failed;
                    return Err(DetectError::Disconnected);
                }
            }
        }
    }

    /// Forget the outstanding detect: its result, when it arrives, is
    /// discarded instead of delivered.
    pub fn discard_in_flight(&mut self) {
        if self.in_flight {
            self.discard_in_flight = true;
        }
    }

    fn accept(&mut self, reply: Reply) -> Option<TransportEvent> {
        match reply {
            Reply::Ready => {
                self.in_flight = false;
                self.init_pending = false;
                match self.phase {
                    Phase::Ready => None,
                    Phase::Failed => {
                        debug!("{} ignoring ready after failed init", prefix::BIND);
                        None
                    }
                    Phase::Idle | Phase::Initializing { .. } => {
                        self.phase = Phase::Ready;
                        Some(TransportEvent::Ready)
                    }
                }
            }
            Reply::Result { detections } => {
                self.in_flight = false;
                self.stats.results_received += 1;
                if self.discard_in_flight {
                    self.discard_in_flight = false;
                    self.stats.results_discarded += 1;
                    return None;
                }
                Some(TransportEvent::Detections(detections))
            }
            Reply::Error { message } => {
                if self.init_pending {
                    self.init_pending = false;
                    match self.phase {
                        Phase::Initializing { .. } => {
                            self.phase = Phase::Failed;
                            Some(TransportEvent::InitFailed(message))
                        }
                        _ => {
                            debug!("{} late init error: {}", prefix::BIND, message);
                            None
                        }
                    }
                } else {
                    Some(TransportEvent::Error(message))
                }
            }
            Reply::Debug(info) => Some(TransportEvent::Debug(info)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    struct Link {
        transport: ChannelTransport,
        requests: Receiver<Request>,
        replies: Sender<Reply>,
    }

    fn link(timeout: Duration) -> Link {
        let (req_tx, req_rx) = bounded(2);
        let (rep_tx, rep_rx) = bounded(16);
        Link {
            transport: ChannelTransport::new(req_tx, rep_rx, timeout),
            requests: req_rx,
            replies: rep_tx,
        }
    }

    fn ready_link() -> Link {
        let mut l = link(Duration::from_secs(5));
        l.transport.init().unwrap();
        assert_eq!(l.requests.try_recv().unwrap(), Request::Init);
        l.replies.send(Reply::Ready).unwrap();
        assert_eq!(l.transport.poll(), vec![TransportEvent::Ready]);
        l
    }

    fn frame() -> Frame {
        Frame::new(2, 2, vec![0; 4])
    }

    #[test]
    fn test_frames_before_ready_are_dropped() {
        let mut l = link(Duration::from_secs(5));
        assert_eq!(
            l.transport.submit(frame()),
            Admission::Dropped(DropReason::NotReady)
        );
        l.transport.init().unwrap();
        assert_eq!(
            l.transport.submit(frame()),
            Admission::Dropped(DropReason::NotReady)
        );
        assert_eq!(l.transport.stats().dropped_not_ready, 2);
    }

    #[test]
    fn test_at_most_one_outstanding_detect() {
        let mut l = ready_link();
        assert_eq!(l.transport.submit(frame()), Admission::Sent);
        for _ in 0..10 {
            assert_eq!(
                l.transport.submit(frame()),
                Admission::Dropped(DropReason::InFlight)
            );
        }
        assert_eq!(l.requests.len(), 1);
        assert_eq!(l.transport.stats().frames_sent, 1);
        assert_eq!(l.transport.stats().dropped_in_flight, 10);

        l.replies.send(Reply::empty_result()).unwrap();
        assert_eq!(l.transport.poll(), vec![TransportEvent::Detections(vec![])]);
        assert_eq!(l.transport.submit(frame()), Admission::Sent);
    }

    #[test]
    fn test_error_reply_keeps_detect_outstanding() {
        let mut l = ready_link();
        l.transport.submit(frame());
        l.replies.send(Reply::error("invalid frame")).unwrap();
        assert_eq!(
            l.transport.poll(),
            vec![TransportEvent::Error("invalid frame".to_string())]
        );
        assert!(l.transport.in_flight());

        l.replies.send(Reply::empty_result()).unwrap();
        l.transport.poll();
        assert!(!l.transport.in_flight());
    }

    #[test]
    fn test_init_timeout() {
        let mut l = link(Duration::from_millis(1));
        l.transport.init().unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(l.transport.poll(), vec![TransportEvent::InitTimedOut]);
        assert!(!l.transport.is_ready());

        // a retry starts a fresh attempt
        l.transport.init().unwrap();
        l.replies.send(Reply::Ready).unwrap();
        assert_eq!(l.transport.poll(), vec![TransportEvent::Ready]);
    }

    #[test]
    fn test_init_error_is_init_failure() {
        let mut l = link(Duration::from_secs(5));
        l.transport.init().unwrap();
        l.replies.send(Reply::error("binding error")).unwrap();
        assert_eq!(
            l.transport.poll(),
            vec![TransportEvent::InitFailed("binding error".to_string())]
        );
    }

    #[test]
    fn test_retried_init_is_not_resent_while_unanswered() {
        let mut l = link(Duration::from_millis(1));
        for _ in 0..5 {
            l.transport.init().unwrap();
            std::thread::sleep(Duration::from_millis(3));
            assert_eq!(l.transport.poll(), vec![TransportEvent::InitTimedOut]);
        }
        assert_eq!(l.requests.len(), 1);

        // the one init finally answers, settling the latest attempt
        l.transport.init().unwrap();
        l.replies.send(Reply::Ready).unwrap();
        assert_eq!(l.transport.poll(), vec![TransportEvent::Ready]);
        assert!(l.transport.is_ready());
    }

    #[test]
    fn test_init_on_full_queue_fails_without_blocking() {
        let mut l = link(Duration::from_secs(5));
        let (req_tx, _req_rx) = bounded(1);
        req_tx.try_send(Request::Init).unwrap();
        let (_rep_tx, rep_rx) = bounded(1);
        l.transport = ChannelTransport::new(req_tx, rep_rx, Duration::from_secs(5));

        let err = l.transport.init().unwrap_err();
        assert!(matches!(err, DetectError::InitFailed(_)));
        assert!(!l.transport.is_ready());
    }

    #[test]
    fn test_late_init_error_after_timeout_is_not_a_frame_error() {
        let mut l = link(Duration::from_millis(1));
        l.transport.init().unwrap();
        std::thread::sleep(Duration::from_millis(3));
        assert_eq!(l.transport.poll(), vec![TransportEvent::InitTimedOut]);

        l.replies.send(Reply::error("load failed")).unwrap();
        assert!(l.transport.poll().is_empty());

        // nothing pending any more, so a retry sends a fresh init
        l.transport.init().unwrap();
        assert_eq!(l.requests.len(), 2);
    }

    #[test]
    fn test_discarded_result_after_stop() {
        let mut l = ready_link();
        l.transport.submit(frame());
        l.transport.discard_in_flight();
        l.replies.send(Reply::empty_result()).unwrap();
        assert!(l.transport.poll().is_empty());
        assert_eq!(l.transport.stats().results_discarded, 1);
    }

    #[test]
    fn test_disconnect_is_reported_once() {
        let mut l = ready_link();
        drop(l.replies);
        assert_eq!(l.transport.poll(), vec![TransportEvent::Disconnected]);
        assert!(l.transport.poll().is_empty());
    }
}
