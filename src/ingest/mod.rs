//! Camera frame sources.
//!
//! The capture stage owns exactly one `CameraSource`; no source is ever
//! shared between threads. A source that cannot be opened is a construction
//! error surfaced to the caller. A single failed read is transient: the
//! source returns `Ok(None)` and the capture stage skips the iteration,
//! backs off briefly and retries.
//!
//! - `SyntheticSource` handles `stub://` URLs for tests, demos and
//!   camera-less bring-up.
//! - `V4l2Source` (feature `ingest-v4l2`) reads local `/dev/video*`
//!   devices.

mod synthetic;
#[cfg(feature = "ingest-v4l2")]
mod v4l2;

pub use synthetic::SyntheticSource;
#[cfg(feature = "ingest-v4l2")]
pub use v4l2::V4l2Source;

use anyhow::{anyhow, Result};

use crate::frame::Frame;

/// Camera configuration shared by every source kind.
#[derive(Clone, Debug)]
pub struct CameraConfig {
    /// Source URL: `stub://name` or a V4L2 device path like `/dev/video0`.
    pub url: String,
    pub width: u32,
    pub height: u32,
    /// Sensor pacing target; 0 disables pacing (tests).
    pub target_fps: u32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            url: "stub://camera".to_string(),
            width: 640,
            height: 480,
            target_fps: 30,
        }
    }
}

#[derive(Clone, Debug)]
pub struct SourceStats {
    pub frames_read: u64,
    pub read_failures: u64,
    pub url: String,
}

/// Camera boundary consumed by the capture stage.
pub trait CameraSource: Send {
    /// Open the device. Failure here is fatal to construction of the
    /// capture stage, not silently retried.
    fn connect(&mut self) -> Result<()>;

    /// Read one frame. `Ok(None)` signals a transient read failure the
    /// caller recovers from by skipping the iteration.
    fn read(&mut self) -> Result<Option<Frame>>;

    fn stats(&self) -> SourceStats;
}

/// Build a source from the config URL.
pub fn open_source(config: CameraConfig) -> Result<Box<dyn CameraSource>> {
    if config.url.starts_with("stub://") {
        return Ok(Box::new(SyntheticSource::new(config)));
    }
    #[cfg(feature = "ingest-v4l2")]
    if config.url.starts_with("/dev/") || config.url.starts_with("v4l2://") {
        return Ok(Box::new(V4l2Source::new(config)?));
    }
    #[cfg(not(feature = "ingest-v4l2"))]
    if config.url.starts_with("/dev/") || config.url.starts_with("v4l2://") {
        return Err(anyhow!(
            "camera url {} requires the ingest-v4l2 feature",
            config.url
        ));
    }
    Err(anyhow!("unsupported camera url: {}", config.url))
}
