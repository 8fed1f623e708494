//! Shared frame/detection store.
//!
//! One mutex guards the whole state; every write replaces whole fields and
//! every read hands out a clone, so readers can never observe a half-applied
//! update. Different slots may legitimately hold frames from different
//! capture instants — the render stage pairs the freshest enhanced frame
//! with a detection list computed one or more captures earlier, and that
//! bounded staleness is intended, not a bug.
//!
//! Nothing heavier than a field copy runs inside the lock. Image processing
//! and I/O happen in the stages, outside the critical section.

use std::sync::Mutex;

use crate::detect::Detection;
use crate::frame::Frame;

/// Named frame slots the store tracks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Slot {
    /// Straight off the camera.
    Raw,
    /// After CLAHE enhancement; this is what inference and rendering consume.
    Enhanced,
    /// Enhanced frame with detection overlay.
    Annotated,
}

impl Slot {
    /// Parse a stream selector name as exposed on the live-view boundary.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "raw" => Some(Slot::Raw),
            "enhanced" => Some(Slot::Enhanced),
            "annotated" => Some(Slot::Annotated),
            _ => None,
        }
    }
}

/// Derived scalar metrics, recomputed atomically with the detection list.
#[derive(Clone, Copy, Debug, Default)]
pub struct StoreMetrics {
    /// Instantaneous capture rate, frames per second.
    pub fps: f32,
    /// Highest confidence in the current detection list, 0.0 when empty.
    pub last_confidence: f32,
    /// Length of the current detection list.
    pub detection_count: usize,
}

/// Batched store write. Fields left as `None` keep their previous value;
/// everything supplied lands in the same critical section.
#[derive(Default)]
pub struct StoreUpdate {
    raw: Option<Frame>,
    enhanced: Option<Frame>,
    annotated: Option<Frame>,
    detections: Option<Vec<Detection>>,
    fps: Option<f32>,
}

impl StoreUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raw(mut self, frame: Frame) -> Self {
        self.raw = Some(frame);
        self
    }

    pub fn enhanced(mut self, frame: Frame) -> Self {
        self.enhanced = Some(frame);
        self
    }

    pub fn annotated(mut self, frame: Frame) -> Self {
        self.annotated = Some(frame);
        self
    }

    pub fn detections(mut self, detections: Vec<Detection>) -> Self {
        self.detections = Some(detections);
        self
    }

    pub fn fps(mut self, fps: f32) -> Self {
        self.fps = Some(fps);
        self
    }
}

#[derive(Default)]
struct StoreState {
    raw: Option<Frame>,
    enhanced: Option<Frame>,
    annotated: Option<Frame>,
    detections: Vec<Detection>,
    metrics: StoreMetrics,
}

/// Thread-safe latest-value store shared by every stage.
#[derive(Default)]
pub struct FrameStore {
    state: Mutex<StoreState>,
}

impl FrameStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a batched update atomically. When a detection list is supplied,
    /// `detection_count` and `last_confidence` are recomputed in the same
    /// critical section so readers never see them disagree with the list.
    pub fn update(&self, update: StoreUpdate) {
        let mut state = self.state.lock().expect("frame store poisoned");
        if let Some(frame) = update.raw {
            state.raw = Some(frame);
        }
        if let Some(frame) = update.enhanced {
            state.enhanced = Some(frame);
        }
        if let Some(frame) = update.annotated {
            state.annotated = Some(frame);
        }
        if let Some(detections) = update.detections {
            state.metrics.detection_count = detections.len();
            state.metrics.last_confidence = detections
                .iter()
                .map(|d| d.confidence)
                .fold(0.0f32, f32::max);
            state.detections = detections;
        }
        if let Some(fps) = update.fps {
            state.metrics.fps = fps;
        }
    }

    /// Latest frame in a slot, or `None` if the slot was never written.
    pub fn frame(&self, slot: Slot) -> Option<Frame> {
        let state = self.state.lock().expect("frame store poisoned");
        match slot {
            Slot::Raw => state.raw.clone(),
            Slot::Enhanced => state.enhanced.clone(),
            Slot::Annotated => state.annotated.clone(),
        }
    }

    /// Stable snapshot of the current detection list.
    pub fn detections(&self) -> Vec<Detection> {
        self.state
            .lock()
            .expect("frame store poisoned")
            .detections
            .clone()
    }

    pub fn metrics(&self) -> StoreMetrics {
        self.state.lock().expect("frame store poisoned").metrics
    }

    /// Detection list and its derived metrics, from the same instant.
    pub fn detections_with_metrics(&self) -> (Vec<Detection>, StoreMetrics) {
        let state = self.state.lock().expect("frame store poisoned");
        (state.detections.clone(), state.metrics)
    }
}
