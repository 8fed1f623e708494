//! Reefwatch
//!
//! Real-time camera monitor for low-visibility underwater scenes: frames are
//! captured, contrast-enhanced, run through a detector and turned into a
//! live annotated view plus a durable event log.
//!
//! # Architecture
//!
//! Four stages run on their own threads, decoupled so the heavy stage never
//! stalls capture:
//!
//! 1. **Capture**: reads the camera, applies CLAHE, publishes raw and
//!    enhanced frames, feeds the detection queue.
//! 2. **Detection**: pulls the freshest queued frame, letterboxes it, runs
//!    the model, decodes and publishes detections, emits events.
//! 3. **Render**: composes the annotated view at its own cadence.
//! 4. **Stats**: emits a periodic operational snapshot.
//!
//! Staleness between stages is bounded, not eliminated: the queue keeps only
//! the newest frames and drops the oldest under pressure, and the render
//! stage pairs the latest frame with the latest detections even when they
//! are a cycle apart.
//!
//! # Module Structure
//!
//! - `frame`: frame value type and the bounded drop-oldest queue
//! - `ingest`: camera sources (synthetic, V4L2)
//! - `enhance`: CLAHE contrast enhancement on the lightness channel
//! - `detect`: detector backends and raw-output decoding (letterbox, NMS)
//! - `store`: shared latest-state store for frames, detections and metrics
//! - `render`: detection overlay drawing
//! - `events`: durable detection events, thumbnails, sinks
//! - `stream`: MJPEG live views, stats snapshots, still snapshots
//! - `pipeline`: stage threads, runtime settings, shutdown
//! - `config`: file and environment configuration

pub mod config;
pub mod detect;
pub mod enhance;
pub mod events;
pub mod frame;
pub mod ingest;
pub mod pipeline;
pub mod render;
pub mod store;
pub mod stream;

pub use config::ReefwatchConfig;
pub use detect::{decode_output, Detection, DetectorBackend, Letterbox, RawOutput, StubBackend};
#[cfg(feature = "backend-tract")]
pub use detect::TractBackend;
pub use enhance::Clahe;
pub use events::{DetectionEvent, EventSink, FsEventSink, MemoryEventSink};
pub use frame::{Frame, FreshnessQueue};
pub use ingest::{open_source, CameraConfig, CameraSource, SyntheticSource};
#[cfg(feature = "ingest-v4l2")]
pub use ingest::V4l2Source;
pub use pipeline::{Pipeline, PipelineConfig, PipelineSettings, ShutdownToken};
pub use store::{FrameStore, Slot, StoreMetrics, StoreUpdate};
pub use stream::{MjpegStream, StatsSnapshot};
