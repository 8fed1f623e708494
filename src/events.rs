//! Durable detection events.
//!
//! A detection whose confidence clears the *event* threshold (higher than
//! the inference threshold that merely keeps a box on screen) becomes a
//! `DetectionEvent`: the detection, the generating frame's timestamp and
//! sequence, and a small cropped thumbnail. Events are appended once to a
//! sink and never mutated; retention and cleanup belong to whoever owns the
//! storage, not to the pipeline.
//!
//! Sink failures are the caller's problem only to the extent of a log line:
//! a filesystem hiccup must never stop detection.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::{Local, TimeZone};
use image::codecs::jpeg::JpegEncoder;
use image::{imageops, ExtendedColorType, RgbImage};
use serde::Serialize;

use crate::detect::Detection;
use crate::frame::Frame;

/// Pixels of context kept around the detection box when cropping.
pub const THUMBNAIL_MARGIN: u32 = 10;
/// Thumbnails are stored at this square size.
pub const THUMBNAIL_SIZE: u32 = 100;
const THUMBNAIL_JPEG_QUALITY: u8 = 85;

/// Small crop of the frame region around a detection.
#[derive(Clone, Debug)]
pub struct Thumbnail {
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// One logged detection occurrence.
#[derive(Clone, Debug)]
pub struct DetectionEvent {
    pub id: u64,
    pub detection: Detection,
    pub frame_seq: u64,
    pub frame_timestamp_ms: u64,
    pub thumbnail: Option<Thumbnail>,
}

/// JSON line written to the event log for each event.
#[derive(Serialize)]
struct EventRecord<'a> {
    id: u64,
    frame_seq: u64,
    timestamp_ms: u64,
    date: String,
    time: String,
    confidence: f32,
    class_id: usize,
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
    thumbnail: Option<&'a str>,
}

/// Crop a thumbnail around a detection box with a small margin, resized to
/// `THUMBNAIL_SIZE` square. Returns `None` when the box lies entirely
/// outside the frame.
pub fn extract_thumbnail(frame: &Frame, detection: &Detection) -> Option<Thumbnail> {
    let (fw, fh) = (frame.width(), frame.height());
    let margin = THUMBNAIL_MARGIN as f32;

    let x0 = (detection.x1 - margin).max(0.0) as u32;
    let y0 = (detection.y1 - margin).max(0.0) as u32;
    let x1 = ((detection.x2 + margin).max(0.0) as u32).min(fw);
    let y1 = ((detection.y2 + margin).max(0.0) as u32).min(fh);
    if x0 >= x1 || y0 >= y1 {
        return None;
    }

    let img = RgbImage::from_raw(fw, fh, frame.pixels().to_vec())?;
    let crop = imageops::crop_imm(&img, x0, y0, x1 - x0, y1 - y0).to_image();
    let resized = imageops::resize(
        &crop,
        THUMBNAIL_SIZE,
        THUMBNAIL_SIZE,
        imageops::FilterType::Triangle,
    );
    Some(Thumbnail {
        pixels: resized.into_raw(),
        width: THUMBNAIL_SIZE,
        height: THUMBNAIL_SIZE,
    })
}

/// Event sink boundary: durable append of detection events.
pub trait EventSink: Send {
    fn append(&mut self, event: &DetectionEvent) -> Result<()>;
}

// ----------------------------------------------------------------------------
// Filesystem sink: JSONL log + JPEG thumbnails
// ----------------------------------------------------------------------------

/// Appends events to `<dir>/events.jsonl` and stores thumbnails under
/// `<dir>/thumbs/`, keyed by a timestamp-derived name.
pub struct FsEventSink {
    thumbs_dir: PathBuf,
    log: BufWriter<File>,
}

impl FsEventSink {
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        let thumbs_dir = dir.join("thumbs");
        std::fs::create_dir_all(&thumbs_dir)
            .with_context(|| format!("failed to create event directory {}", dir.display()))?;
        let log_path = dir.join("events.jsonl");
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .with_context(|| format!("failed to open event log {}", log_path.display()))?;
        Ok(Self {
            thumbs_dir,
            log: BufWriter::new(file),
        })
    }

    fn write_thumbnail(&self, event: &DetectionEvent) -> Result<Option<String>> {
        let Some(thumb) = &event.thumbnail else {
            return Ok(None);
        };
        let stamp = local_datetime(event.frame_timestamp_ms)
            .map(|dt| dt.format("%Y%m%d_%H%M%S_%3f").to_string())
            .unwrap_or_else(|| event.frame_timestamp_ms.to_string());
        let name = format!("evt_{}_{}.jpg", stamp, event.id);
        let path = self.thumbs_dir.join(&name);

        let file = File::create(&path)
            .with_context(|| format!("failed to create thumbnail {}", path.display()))?;
        let mut encoder = JpegEncoder::new_with_quality(BufWriter::new(file), THUMBNAIL_JPEG_QUALITY);
        encoder
            .encode(
                &thumb.pixels,
                thumb.width,
                thumb.height,
                ExtendedColorType::Rgb8,
            )
            .context("failed to encode thumbnail JPEG")?;
        Ok(Some(name))
    }
}

impl EventSink for FsEventSink {
    fn append(&mut self, event: &DetectionEvent) -> Result<()> {
        let thumb_name = self.write_thumbnail(event)?;
        let (date, time) = match local_datetime(event.frame_timestamp_ms) {
            Some(dt) => (
                dt.format("%Y-%m-%d").to_string(),
                dt.format("%H:%M:%S").to_string(),
            ),
            None => (String::new(), String::new()),
        };

        let record = EventRecord {
            id: event.id,
            frame_seq: event.frame_seq,
            timestamp_ms: event.frame_timestamp_ms,
            date,
            time,
            confidence: event.detection.confidence,
            class_id: event.detection.class_id,
            x1: event.detection.x1,
            y1: event.detection.y1,
            x2: event.detection.x2,
            y2: event.detection.y2,
            thumbnail: thumb_name.as_deref(),
        };
        serde_json::to_writer(&mut self.log, &record)?;
        self.log.write_all(b"\n")?;
        self.log.flush()?;
        Ok(())
    }
}

fn local_datetime(timestamp_ms: u64) -> Option<chrono::DateTime<Local>> {
    Local.timestamp_millis_opt(timestamp_ms as i64).single()
}

// ----------------------------------------------------------------------------
// In-memory sink for tests
// ----------------------------------------------------------------------------

/// Records events in memory. Cloning shares the underlying list, so a test
/// can keep a handle while the pipeline owns the sink.
#[derive(Clone, Default)]
pub struct MemoryEventSink {
    events: Arc<Mutex<Vec<DetectionEvent>>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<DetectionEvent> {
        self.events.lock().expect("event sink poisoned").clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().expect("event sink poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventSink for MemoryEventSink {
    fn append(&mut self, event: &DetectionEvent) -> Result<()> {
        self.events
            .lock()
            .expect("event sink poisoned")
            .push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame() -> Frame {
        Frame::from_rgb(vec![50u8; 64 * 48 * 3], 64, 48, 3).unwrap()
    }

    fn detection() -> Detection {
        Detection {
            x1: 10.0,
            y1: 10.0,
            x2: 30.0,
            y2: 25.0,
            confidence: 0.91,
            class_id: 0,
        }
    }

    fn event(id: u64, thumbnail: Option<Thumbnail>) -> DetectionEvent {
        DetectionEvent {
            id,
            detection: detection(),
            frame_seq: 3,
            frame_timestamp_ms: 1_700_000_000_000,
            thumbnail,
        }
    }

    #[test]
    fn thumbnail_crop_is_clamped_and_resized() {
        let frame = frame();
        // Box hangs off the top-left corner; the crop clamps to the frame.
        let det = Detection {
            x1: -5.0,
            y1: -5.0,
            x2: 20.0,
            y2: 20.0,
            confidence: 0.9,
            class_id: 0,
        };
        let thumb = extract_thumbnail(&frame, &det).unwrap();
        assert_eq!(thumb.width, THUMBNAIL_SIZE);
        assert_eq!(thumb.height, THUMBNAIL_SIZE);
        assert_eq!(
            thumb.pixels.len(),
            (THUMBNAIL_SIZE * THUMBNAIL_SIZE * 3) as usize
        );
    }

    #[test]
    fn thumbnail_outside_frame_is_none() {
        let det = Detection {
            x1: 500.0,
            y1: 500.0,
            x2: 600.0,
            y2: 600.0,
            confidence: 0.9,
            class_id: 0,
        };
        assert!(extract_thumbnail(&frame(), &det).is_none());
    }

    #[test]
    fn fs_sink_appends_record_and_thumbnail() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = FsEventSink::open(dir.path()).unwrap();

        let thumb = extract_thumbnail(&frame(), &detection());
        sink.append(&event(1, thumb)).unwrap();
        sink.append(&event(2, None)).unwrap();

        let log = std::fs::read_to_string(dir.path().join("events.jsonl")).unwrap();
        let lines: Vec<&str> = log.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["id"], 1);
        assert_eq!(first["frame_seq"], 3);
        assert!((first["confidence"].as_f64().unwrap() - 0.91).abs() < 1e-6);
        assert!(!first["date"].as_str().unwrap().is_empty());

        // The first event's thumbnail landed on disk, the second has none.
        let thumb_name = first["thumbnail"].as_str().unwrap();
        assert!(dir.path().join("thumbs").join(thumb_name).exists());
        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert!(second["thumbnail"].is_null());
    }

    #[test]
    fn memory_sink_shares_events_across_clones() {
        let sink = MemoryEventSink::new();
        let mut writer = sink.clone();
        writer.append(&event(7, None)).unwrap();
        assert_eq!(sink.len(), 1);
        assert_eq!(sink.events()[0].id, 7);
    }
}
