//! Live-view outputs: MJPEG frame streams, periodic stats, snapshots.
//!
//! `MjpegStream` is a pull iterator over JPEG-encoded frames from one store
//! slot; the transport that carries the bytes (HTTP multipart, websocket,
//! file dump) is the caller's concern. Streams are independent: any number
//! can run against the same store, each at its own pace, and a stream that
//! is dropped and recreated picks up from whatever the store holds now.
//!
//! The annotated slot streams at full resolution; the raw and enhanced
//! slots are diagnostic views and get downscaled and compressed harder.

use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use serde::Serialize;

use crate::frame::Frame;
use crate::pipeline::ShutdownToken;
use crate::store::{FrameStore, Slot};

/// Default stream pacing.
pub const DEFAULT_STREAM_FPS: u32 = 15;
/// JPEG quality for the full-resolution annotated stream.
pub const ANNOTATED_QUALITY: u8 = 70;
/// JPEG quality for downscaled diagnostic streams.
pub const DIAGNOSTIC_QUALITY: u8 = 60;
/// Diagnostic streams are resized to this before encoding.
pub const DIAGNOSTIC_SIZE: (u32, u32) = (320, 240);

/// How long to wait before re-polling an empty slot.
const EMPTY_SLOT_POLL: Duration = Duration::from_millis(50);

// ----------------------------------------------------------------------------
// MJPEG stream
// ----------------------------------------------------------------------------

/// One JPEG-encoded frame with its capture identity.
#[derive(Clone)]
pub struct EncodedFrame {
    pub jpeg: Vec<u8>,
    pub seq: u64,
    pub timestamp_ms: u64,
}

pub struct MjpegStream {
    store: Arc<FrameStore>,
    shutdown: ShutdownToken,
    slot: Slot,
    interval: Duration,
    last_emit: Option<Instant>,
}

impl MjpegStream {
    pub fn new(store: Arc<FrameStore>, shutdown: ShutdownToken, slot: Slot) -> Self {
        Self::with_fps(store, shutdown, slot, DEFAULT_STREAM_FPS)
    }

    /// `target_fps == 0` disables pacing (tests).
    pub fn with_fps(
        store: Arc<FrameStore>,
        shutdown: ShutdownToken,
        slot: Slot,
        target_fps: u32,
    ) -> Self {
        let interval = if target_fps == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(1.0 / target_fps as f64)
        };
        Self {
            store,
            shutdown,
            slot,
            interval,
            last_emit: None,
        }
    }

    pub fn slot(&self) -> Slot {
        self.slot
    }

    fn encode(&self, frame: &Frame) -> Result<Vec<u8>> {
        match self.slot {
            Slot::Annotated => encode_jpeg(frame, ANNOTATED_QUALITY, None),
            Slot::Raw | Slot::Enhanced => {
                encode_jpeg(frame, DIAGNOSTIC_QUALITY, Some(DIAGNOSTIC_SIZE))
            }
        }
    }
}

impl Iterator for MjpegStream {
    type Item = EncodedFrame;

    fn next(&mut self) -> Option<EncodedFrame> {
        loop {
            if self.shutdown.is_shutdown() {
                return None;
            }
            if let Some(last) = self.last_emit {
                let due = last + self.interval;
                let now = Instant::now();
                if now < due {
                    std::thread::sleep((due - now).min(EMPTY_SLOT_POLL));
                    continue;
                }
            }
            // Skip the cycle when the slot is still empty; emission resumes
            // as soon as the pipeline publishes a frame.
            let Some(frame) = self.store.frame(self.slot) else {
                std::thread::sleep(EMPTY_SLOT_POLL);
                continue;
            };
            self.last_emit = Some(Instant::now());
            match self.encode(&frame) {
                Ok(jpeg) => {
                    return Some(EncodedFrame {
                        jpeg,
                        seq: frame.seq,
                        timestamp_ms: frame.timestamp_ms,
                    })
                }
                Err(err) => {
                    log::warn!("stream: jpeg encode failed: {}", err);
                    continue;
                }
            }
        }
    }
}

/// Encode a frame to JPEG, optionally resizing first.
pub fn encode_jpeg(frame: &Frame, quality: u8, resize: Option<(u32, u32)>) -> Result<Vec<u8>> {
    let img = RgbImage::from_raw(frame.width(), frame.height(), frame.pixels().to_vec())
        .ok_or_else(|| anyhow!("frame buffer does not match its dimensions"))?;
    let img = match resize {
        Some((w, h)) if (w, h) != (frame.width(), frame.height()) => {
            image::imageops::resize(&img, w, h, image::imageops::FilterType::Triangle)
        }
        _ => img,
    };
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(Cursor::new(&mut out), quality)
        .encode_image(&img)
        .context("jpeg encode")?;
    Ok(out)
}

// ----------------------------------------------------------------------------
// Stats
// ----------------------------------------------------------------------------

/// Periodic operational snapshot, serialized as one JSON object.
#[derive(Clone, Debug, Serialize)]
pub struct StatsSnapshot {
    pub fps: f32,
    pub detection_count: usize,
    pub last_confidence: f32,
    pub queue_dropped: u64,
    /// SoC temperature in degrees Celsius, when the platform exposes one.
    pub cpu_temp_c: Option<f32>,
}

impl StatsSnapshot {
    pub fn collect(store: &FrameStore, queue_dropped: u64) -> Self {
        let metrics = store.metrics();
        Self {
            fps: metrics.fps,
            detection_count: metrics.detection_count,
            last_confidence: metrics.last_confidence,
            queue_dropped,
            cpu_temp_c: read_cpu_temp(),
        }
    }
}

/// Receiver for the periodic stats snapshot.
pub trait StatsSink: Send {
    fn emit(&mut self, snapshot: &StatsSnapshot);
}

/// Default sink: one JSON log line per interval.
#[derive(Default)]
pub struct LogStatsSink;

impl StatsSink for LogStatsSink {
    fn emit(&mut self, snapshot: &StatsSnapshot) {
        match serde_json::to_string(snapshot) {
            Ok(json) => log::info!("stats {}", json),
            Err(err) => log::warn!("stats serialization failed: {}", err),
        }
    }
}

fn read_cpu_temp() -> Option<f32> {
    read_cpu_temp_from(Path::new("/sys/class/thermal/thermal_zone0/temp"))
}

/// Thermal zone files hold millidegrees as ASCII.
fn read_cpu_temp_from(path: &Path) -> Option<f32> {
    let raw = fs::read_to_string(path).ok()?;
    let millideg: f32 = raw.trim().parse().ok()?;
    Some(millideg / 1000.0)
}

// ----------------------------------------------------------------------------
// Snapshot
// ----------------------------------------------------------------------------

/// Save the current annotated frame as a timestamped JPEG under `dir`.
/// Fails when no annotated frame has been published yet.
pub fn save_snapshot(store: &FrameStore, dir: &Path) -> Result<PathBuf> {
    let frame = store
        .frame(Slot::Annotated)
        .ok_or_else(|| anyhow!("no annotated frame available yet"))?;
    fs::create_dir_all(dir).with_context(|| format!("create snapshot dir {}", dir.display()))?;
    let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let path = dir.join(format!("snapshot_{}_{}.jpg", stamp, frame.seq));
    let jpeg = encode_jpeg(&frame, ANNOTATED_QUALITY, None)?;
    fs::write(&path, jpeg).with_context(|| format!("write snapshot {}", path.display()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreUpdate;

    fn frame(w: u32, h: u32, seq: u64) -> Frame {
        Frame::from_rgb(vec![90u8; (w * h * 3) as usize], w, h, seq).unwrap()
    }

    fn store_with_annotated(seq: u64) -> Arc<FrameStore> {
        let store = Arc::new(FrameStore::new());
        store.update(StoreUpdate::new().annotated(frame(64, 48, seq)));
        store
    }

    #[test]
    fn encode_produces_jpeg_magic() {
        let jpeg = encode_jpeg(&frame(64, 48, 0), 70, None).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn annotated_stream_keeps_full_resolution() {
        let stream = MjpegStream::with_fps(
            store_with_annotated(7),
            ShutdownToken::new(),
            Slot::Annotated,
            0,
        );
        let emitted: Vec<_> = stream.take(2).collect();
        assert_eq!(emitted.len(), 2);
        assert_eq!(emitted[0].seq, 7);
        let decoded = image::load_from_memory(&emitted[0].jpeg).unwrap();
        assert_eq!(decoded.width(), 64);
        assert_eq!(decoded.height(), 48);
    }

    #[test]
    fn diagnostic_stream_downscales() {
        let store = Arc::new(FrameStore::new());
        store.update(StoreUpdate::new().raw(frame(640, 480, 1)));
        let mut stream = MjpegStream::with_fps(store, ShutdownToken::new(), Slot::Raw, 0);
        let emitted = stream.next().unwrap();
        let decoded = image::load_from_memory(&emitted.jpeg).unwrap();
        assert_eq!(decoded.width(), DIAGNOSTIC_SIZE.0);
        assert_eq!(decoded.height(), DIAGNOSTIC_SIZE.1);
    }

    #[test]
    fn stream_ends_on_shutdown() {
        let shutdown = ShutdownToken::new();
        shutdown.shutdown();
        let mut stream =
            MjpegStream::with_fps(store_with_annotated(1), shutdown, Slot::Annotated, 0);
        assert!(stream.next().is_none());
    }

    #[test]
    fn stats_snapshot_reflects_store_metrics() {
        let store = FrameStore::new();
        store.update(
            StoreUpdate::new()
                .detections(vec![crate::detect::Detection {
                    x1: 0.0,
                    y1: 0.0,
                    x2: 10.0,
                    y2: 10.0,
                    confidence: 0.83,
                    class_id: 0,
                }])
                .fps(29.5),
        );
        let snapshot = StatsSnapshot::collect(&store, 3);
        assert_eq!(snapshot.detection_count, 1);
        assert!((snapshot.last_confidence - 0.83).abs() < 1e-6);
        assert!((snapshot.fps - 29.5).abs() < 1e-6);
        assert_eq!(snapshot.queue_dropped, 3);
    }

    #[test]
    fn cpu_temp_parses_millidegrees() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("temp");
        fs::write(&path, "48750\n").unwrap();
        assert_eq!(read_cpu_temp_from(&path), Some(48.75));
        assert_eq!(read_cpu_temp_from(&dir.path().join("missing")), None);
    }

    #[test]
    fn snapshot_writes_jpeg_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_annotated(4);
        let path = save_snapshot(&store, dir.path()).unwrap();
        let bytes = fs::read(&path).unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn snapshot_without_annotated_frame_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = FrameStore::new();
        assert!(save_snapshot(&store, dir.path()).is_err());
    }
}
