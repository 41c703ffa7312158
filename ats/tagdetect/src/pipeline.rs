//! The capture context.
//!
//! Each refresh tick: drain replies (rendering any result batch), then, if
//! the transport would admit a frame, copy the current visual frame out of
//! the [`FrameSource`], convert it to luminance into a fresh buffer and send
//! it. The visual source is never blocked on detection; frames produced
//! while a detect is outstanding are skipped.

use std::time::{Duration, Instant};

use crossbeam_channel::{tick, Receiver};
use serde::Serialize;
use tagstream::tracing::prefix;
use tracing::{debug, error, info, warn};

use crate::error::{DetectError, Result};
use crate::gray;
use crate::transport::{Admission, ChannelTransport, TransportEvent};
use crate::types::{Detection, FrameFormat};

/// A producer of RGBA frames (camera, video file, image sequence).
pub trait FrameSource {
    /// Current frame dimensions, `None` until the source has a frame
    fn dimensions(&self) -> Option<(u32, u32)>;

    /// Copy the current frame into `rgba` (resized as needed).
    /// Returns `false` when no frame is available.
    fn capture_rgba(&mut self, rgba: &mut Vec<u8>) -> bool;

    /// Stop producing and release the underlying device
    fn release(&mut self);
}

/// Renders detection batches over the visual output.
pub trait OverlayConsumer {
    /// Draw a batch in the coordinate space of a `width` x `height` frame,
    /// replacing whatever was drawn before.
    fn render(&mut self, detections: &[Detection], width: u32, height: u32);

    fn clear(&mut self);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CaptureStats {
    pub ticks: u64,
    pub frames_sent: u64,
    /// Ticks where the transport would not admit a frame
    pub frames_skipped: u64,
    pub batches_rendered: u64,
    pub conversion_errors: u64,
}

pub struct CapturePipeline<S, O> {
    source: S,
    overlay: O,
    transport: ChannelTransport,
    refresh: Duration,
    running: bool,
    ticker: Option<Receiver<Instant>>,
    rgba: Vec<u8>,
    /// Dimensions of the frame awaiting its result
    pending_dims: Option<(u32, u32)>,
    stats: CaptureStats,
}

impl<S: FrameSource, O: OverlayConsumer> CapturePipeline<S, O> {
    pub fn new(source: S, overlay: O, transport: ChannelTransport, refresh: Duration) -> Self {
        Self {
            source,
            overlay,
            transport,
            refresh,
            running: false,
            ticker: None,
            rgba: Vec::new(),
            pending_dims: None,
            stats: CaptureStats::default(),
        }
    }

    /// Send `init` (if needed) and arm the refresh ticker.
    pub fn start(&mut self) -> Result<()> {
        if !self.transport.is_ready() {
            self.transport.init()?;
        }
        self.ticker = Some(tick(self.refresh));
        self.running = true;
        info!(
            "{} Capture started, refresh every {:?}",
            prefix::CAPTURE,
            self.refresh
        );
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// One refresh step. Returns an error only when the link to the
    /// detection context is unusable (init failed, timed out, disconnected).
    pub fn tick(&mut self) -> Result<()> {
        if !self.running {
            return Ok(());
        }
        self.stats.ticks += 1;

        for event in self.transport.poll() {
            match event {
                TransportEvent::Ready => info!("{} Detector ready", prefix::CAPTURE),
                TransportEvent::Detections(detections) => {
                    let (width, height) = self.pending_dims.take().unwrap_or((0, 0));
                    self.overlay.render(&detections, width, height);
                    self.stats.batches_rendered += 1;
                }
                TransportEvent::Error(message) => {
                    warn!("{} detector reported: {}", prefix::CAPTURE, message)
                }
                TransportEvent::Debug(info) => debug!("{} {:?}", prefix::CAPTURE, info),
                TransportEvent::InitFailed(message) => {
                    error!("{} detector init failed: {}", prefix::CAPTURE, message);
                    return Err(DetectError::InitFailed(message));
                }
                TransportEvent::InitTimedOut => {
                    return Err(DetectError::InitTimeout(self.init_timeout()));
                }
                TransportEvent::Disconnected => return Err(DetectError::Disconnected),
            }
        }

        if !self.transport.can_admit() {
            self.stats.frames_skipped += 1;
            return Ok(());
        }
        let Some((width, height)) = self.source.dimensions() else {
            return Ok(());
        };
        if !self.source.capture_rgba(&mut self.rgba) {
            return Ok(());
        }

        let frame = match gray::to_frame(&self.rgba, width, height, FrameFormat::RGBA8) {
            Ok(frame) => frame,
            Err(e) => {
                self.stats.conversion_errors += 1;
                warn!("{} skipping frame: {}", prefix::CAPTURE, e);
                return Ok(());
            }
        };
        if self.transport.submit(frame) == Admission::Sent {
            self.pending_dims = Some((width, height));
            self.stats.frames_sent += 1;
        }
        Ok(())
    }

    /// Tick at the refresh cadence until stopped, `max_ticks` is reached,
    /// or the link fails.
    pub fn run(&mut self, max_ticks: Option<u64>) -> Result<()> {
        let mut ticks = 0u64;
        while self.running {
            let Some(ticker) = self.ticker.clone() else {
                break;
            };
            if ticker.recv().is_err() {
                break;
            }
            self.tick()?;
            ticks += 1;
            if max_ticks.is_some_and(|max| ticks >= max) {
                break;
            }
        }
        Ok(())
    }

    /// Cancel the refresh, release the source, clear the overlay and
    /// discard any outstanding result.
    pub fn stop(&mut self) {
        if !self.running && self.ticker.is_none() {
            return;
        }
        self.running = false;
        self.ticker = None;
        self.source.release();
        self.overlay.clear();
        self.transport.discard_in_flight();
        self.pending_dims = None;
        info!(
            "{} Capture stopped after {} ticks ({} frames sent)",
            prefix::CAPTURE,
            self.stats.ticks,
            self.stats.frames_sent
        );
    }

    pub fn stats(&self) -> CaptureStats {
        self.stats
    }

    pub fn transport(&self) -> &ChannelTransport {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut ChannelTransport {
        &mut self.transport
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn overlay(&self) -> &O {
        &self.overlay
    }

    fn init_timeout(&self) -> Duration {
        self.transport.init_timeout()
    }
}
