//! tagstream detection pipeline
//!
//! Streams camera-style frames to a fiducial-marker (AprilTag) detector
//! whose native build is not known in advance, and returns detections for
//! overlay rendering.
//!
//! ## Architecture
//!
//! ```text
//!   capture context                          detection context (thread)
//! ┌───────────────────┐  Request::Detect  ┌───────────────────────────────┐
//! │ FrameSource       │──────────────────▶│ DetectionService              │
//! │  └ gray::to_frame │   (≤ 1 in flight) │  ├ NativeBindingResolver      │
//! │ ChannelTransport  │◀──────────────────│  └ DetectorSession            │
//! │ OverlayConsumer   │   Reply::Result   │     ├ ImageBufferArena        │
//! └───────────────────┘                   │     └ marshal (ListGuard)     │
//!                                         └──────────────┬────────────────┘
//!                                                        │ NativeModule
//!                                          ┌─────────────▼────────────────┐
//!                                          │ DylibModule | SimulatedModule│
//!                                          └──────────────────────────────┘
//! ```
//!
//! ## Binding
//!
//! Export names differ across builds. Each logical operation is resolved
//! through the module's call adapter, then the raw `_name`/`name` export,
//! then a token-pattern scan, for each configured [`Dialect`] in turn. The
//! resulting [`BindingSet`] is immutable for the session's lifetime.
//!
//! ## Memory ownership
//!
//! - The image region is caller-owned (canonical dialect) and reused across
//!   frames; it is freed when the session drops
//! - Result lists are library-owned and destroyed exactly once per detect
//! - Handles never leave the detection context

pub mod arena;
pub mod binding;
pub mod config;
pub mod error;
pub mod gray;
pub mod invoker;
pub mod marshal;
pub mod native;
pub mod pipeline;
pub mod protocol;
pub mod transport;
pub mod types;
pub mod worker;

// Re-export main types
pub use binding::{BindingSet, Dialect, LogicalOp, NativeBindingResolver, Resolution};
pub use config::DetectorConfig;
pub use error::{CallError, DetectError, Result};
pub use invoker::DetectorSession;
pub use native::dylib::DylibLoader;
pub use native::sim::{SimulatedLoader, SimulatedModule};
pub use native::{ModuleLoader, NativeModule};
pub use pipeline::{CapturePipeline, FrameSource, OverlayConsumer};
pub use protocol::{Reply, Request};
pub use transport::{Admission, ChannelTransport, TransportEvent};
pub use types::{Detection, Frame, FrameFormat, NativeHandle, PipelineState, Point};
pub use worker::{spawn_detection_worker, DetectionService, WorkerHandle};
