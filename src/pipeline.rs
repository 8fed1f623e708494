//! Pipeline assembly: stage threads, shared state, shutdown.
//!
//! One `Pipeline` value owns everything the stages share — the frame store,
//! the freshness queue, the runtime-adjustable settings and the shutdown
//! token — so multiple independent pipelines can coexist and tests get
//! clean setup and teardown. There is no module-level state anywhere.
//!
//! Threading model: one OS thread per stage (capture, detection, render,
//! stats), all checking the shutdown token at their blocking points. The
//! camera handle lives only on the capture thread and the model handle only
//! on the detection thread; the store is the single multi-writer structure
//! and carries its own lock.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use crate::detect::{decode_output, DetectorBackend, Letterbox};
use crate::enhance::Clahe;
use crate::events::{extract_thumbnail, DetectionEvent, EventSink};
use crate::frame::{Frame, FreshnessQueue};
use crate::ingest::CameraSource;
use crate::render::{annotate, HIGH_CONFIDENCE};
use crate::store::{FrameStore, StoreUpdate};
use crate::stream::{StatsSink, StatsSnapshot};

/// Backoff after a transient camera read failure.
const READ_RETRY_BACKOFF: Duration = Duration::from_millis(100);

// ----------------------------------------------------------------------------
// Shutdown
// ----------------------------------------------------------------------------

/// Cooperative shutdown signal shared by every stage.
#[derive(Clone, Default)]
pub struct ShutdownToken {
    flag: Arc<AtomicBool>,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shutdown(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Sleep in short slices so shutdown is honored promptly.
    pub fn sleep(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while !self.is_shutdown() {
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            std::thread::sleep((deadline - now).min(Duration::from_millis(20)));
        }
    }
}

// ----------------------------------------------------------------------------
// Runtime-adjustable settings
// ----------------------------------------------------------------------------

/// Settings the live-view boundary may change while the pipeline runs.
/// Stored as f32 bit patterns in atomics so stages read them without a lock.
pub struct PipelineSettings {
    inference_threshold: AtomicU32,
    clahe_clip_limit: AtomicU32,
}

impl PipelineSettings {
    pub fn new(inference_threshold: f32, clahe_clip_limit: f32) -> Self {
        Self {
            inference_threshold: AtomicU32::new(inference_threshold.to_bits()),
            clahe_clip_limit: AtomicU32::new(clahe_clip_limit.to_bits()),
        }
    }

    pub fn inference_threshold(&self) -> f32 {
        f32::from_bits(self.inference_threshold.load(Ordering::Relaxed))
    }

    pub fn set_inference_threshold(&self, value: f32) {
        self.inference_threshold
            .store(value.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    pub fn clahe_clip_limit(&self) -> f32 {
        f32::from_bits(self.clahe_clip_limit.load(Ordering::Relaxed))
    }

    pub fn set_clahe_clip_limit(&self, value: f32) {
        self.clahe_clip_limit
            .store(value.max(0.0).to_bits(), Ordering::Relaxed);
    }
}

// ----------------------------------------------------------------------------
// Indicator boundary
// ----------------------------------------------------------------------------

/// Binary indicator driven by "detection present". GPIO wiring is an
/// integrator concern; the pipeline only flips the signal.
pub trait Indicator: Send {
    fn set(&mut self, on: bool);
}

/// Default indicator: a log line on every transition.
#[derive(Default)]
pub struct LogIndicator {
    on: bool,
}

impl Indicator for LogIndicator {
    fn set(&mut self, on: bool) {
        if on != self.on {
            self.on = on;
            log::info!("indicator {}", if on { "on" } else { "off" });
        }
    }
}

/// Shared-state indicator for tests and polling integrations.
#[derive(Clone, Default)]
pub struct SignalIndicator {
    on: Arc<AtomicBool>,
}

impl SignalIndicator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_on(&self) -> bool {
        self.on.load(Ordering::SeqCst)
    }
}

impl Indicator for SignalIndicator {
    fn set(&mut self, on: bool) {
        self.on.store(on, Ordering::SeqCst);
    }
}

// ----------------------------------------------------------------------------
// Pipeline configuration
// ----------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Strict lower bound for keeping a decoded box at all.
    pub inference_threshold: f32,
    /// Higher bar for emitting a durable event.
    pub event_threshold: f32,
    pub iou_threshold: f32,
    pub clahe_clip_limit: f32,
    pub clahe_tile_grid: u32,
    pub queue_capacity: usize,
    /// Render cadence.
    pub render_fps: u32,
    /// Minimum spacing between durable events, so the log does not flood
    /// at detection cadence.
    pub min_event_interval: Duration,
    pub stats_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            inference_threshold: 0.60,
            event_threshold: 0.75,
            iou_threshold: crate::detect::DEFAULT_IOU_THRESHOLD,
            clahe_clip_limit: crate::enhance::DEFAULT_CLIP_LIMIT,
            clahe_tile_grid: crate::enhance::DEFAULT_TILE_GRID,
            queue_capacity: 2,
            render_fps: 15,
            min_event_interval: Duration::from_secs(1),
            stats_interval: Duration::from_secs(1),
        }
    }
}

// ----------------------------------------------------------------------------
// Pipeline
// ----------------------------------------------------------------------------

pub struct Pipeline {
    config: PipelineConfig,
    store: Arc<FrameStore>,
    queue: Arc<FreshnessQueue>,
    settings: Arc<PipelineSettings>,
    shutdown: ShutdownToken,
    events_emitted: Arc<AtomicU64>,
    handles: Vec<JoinHandle<()>>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        let settings = Arc::new(PipelineSettings::new(
            config.inference_threshold,
            config.clahe_clip_limit,
        ));
        Self {
            store: Arc::new(FrameStore::new()),
            queue: Arc::new(FreshnessQueue::new(config.queue_capacity)),
            settings,
            shutdown: ShutdownToken::new(),
            events_emitted: Arc::new(AtomicU64::new(0)),
            config,
            handles: Vec::new(),
        }
    }

    pub fn store(&self) -> Arc<FrameStore> {
        Arc::clone(&self.store)
    }

    pub fn queue(&self) -> Arc<FreshnessQueue> {
        Arc::clone(&self.queue)
    }

    pub fn settings(&self) -> Arc<PipelineSettings> {
        Arc::clone(&self.settings)
    }

    pub fn shutdown_token(&self) -> ShutdownToken {
        self.shutdown.clone()
    }

    pub fn events_emitted(&self) -> u64 {
        self.events_emitted.load(Ordering::SeqCst)
    }

    /// Spawn the capture stage. The source must already be constructible;
    /// a camera that cannot be opened fails here, before any thread starts.
    pub fn spawn_capture(&mut self, mut source: Box<dyn CameraSource>) -> Result<()> {
        source.connect().context("camera connect failed")?;
        let stage = CaptureStage {
            store: Arc::clone(&self.store),
            queue: Arc::clone(&self.queue),
            settings: Arc::clone(&self.settings),
            shutdown: self.shutdown.clone(),
            tile_grid: self.config.clahe_tile_grid,
        };
        self.handles.push(
            std::thread::Builder::new()
                .name("capture".into())
                .spawn(move || stage.run(source))
                .context("spawn capture thread")?,
        );
        Ok(())
    }

    /// Spawn the detection stage with its model handle and event sink.
    pub fn spawn_detection(
        &mut self,
        mut backend: Box<dyn DetectorBackend>,
        sink: Box<dyn EventSink>,
        indicator: Box<dyn Indicator>,
    ) -> Result<()> {
        backend.warm_up().context("detector warm-up failed")?;
        let stage = DetectionStage {
            store: Arc::clone(&self.store),
            queue: Arc::clone(&self.queue),
            settings: Arc::clone(&self.settings),
            shutdown: self.shutdown.clone(),
            event_threshold: self.config.event_threshold,
            iou_threshold: self.config.iou_threshold,
            min_event_interval: self.config.min_event_interval,
            events_emitted: Arc::clone(&self.events_emitted),
        };
        self.handles.push(
            std::thread::Builder::new()
                .name("detection".into())
                .spawn(move || stage.run(backend, sink, indicator))
                .context("spawn detection thread")?,
        );
        Ok(())
    }

    pub fn spawn_render(&mut self) -> Result<()> {
        let stage = RenderStage {
            store: Arc::clone(&self.store),
            shutdown: self.shutdown.clone(),
            interval: cadence(self.config.render_fps),
        };
        self.handles.push(
            std::thread::Builder::new()
                .name("render".into())
                .spawn(move || stage.run())
                .context("spawn render thread")?,
        );
        Ok(())
    }

    pub fn spawn_stats(&mut self, sink: Box<dyn StatsSink>) -> Result<()> {
        let store = Arc::clone(&self.store);
        let queue = Arc::clone(&self.queue);
        let shutdown = self.shutdown.clone();
        let interval = self.config.stats_interval;
        self.handles.push(
            std::thread::Builder::new()
                .name("stats".into())
                .spawn(move || {
                    let mut sink = sink;
                    while !shutdown.is_shutdown() {
                        let snapshot = StatsSnapshot::collect(&store, queue.dropped());
                        sink.emit(&snapshot);
                        shutdown.sleep(interval);
                    }
                })
                .context("spawn stats thread")?,
        );
        Ok(())
    }

    /// Signal shutdown and join every stage.
    pub fn shutdown(&mut self) {
        self.shutdown.shutdown();
        self.queue.close();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                log::error!("a pipeline stage panicked during shutdown");
            }
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if !self.handles.is_empty() {
            self.shutdown();
        }
    }
}

fn cadence(fps: u32) -> Duration {
    if fps == 0 {
        Duration::from_millis(0)
    } else {
        Duration::from_secs_f64(1.0 / fps as f64)
    }
}

// ----------------------------------------------------------------------------
// Capture stage
// ----------------------------------------------------------------------------

struct CaptureStage {
    store: Arc<FrameStore>,
    queue: Arc<FreshnessQueue>,
    settings: Arc<PipelineSettings>,
    shutdown: ShutdownToken,
    tile_grid: u32,
}

impl CaptureStage {
    fn run(self, mut source: Box<dyn CameraSource>) {
        log::info!("capture stage started");
        let mut prev_read: Option<Instant> = None;
        let mut clahe = Clahe::new(self.settings.clahe_clip_limit(), self.tile_grid);

        while !self.shutdown.is_shutdown() {
            let frame = match source.read() {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    // Transient: skip the iteration, back off, retry.
                    self.shutdown.sleep(READ_RETRY_BACKOFF);
                    continue;
                }
                Err(err) => {
                    log::error!("capture stage stopping: {}", err);
                    break;
                }
            };

            // Instantaneous fps from consecutive read timestamps.
            let now = Instant::now();
            let fps = prev_read
                .map(|prev| {
                    let dt = now.duration_since(prev).as_secs_f32();
                    if dt > 0.0 {
                        1.0 / dt
                    } else {
                        0.0
                    }
                })
                .unwrap_or(0.0);
            prev_read = Some(now);

            let clip = self.settings.clahe_clip_limit();
            if (clip - clahe.clip_limit()).abs() > f32::EPSILON {
                clahe = Clahe::new(clip, self.tile_grid);
            }

            let enhanced = match clahe.apply(&frame) {
                Ok(enhanced) => enhanced,
                Err(err) => {
                    log::warn!("enhancement failed, passing frame through: {}", err);
                    frame.clone()
                }
            };

            self.store.update(
                StoreUpdate::new()
                    .raw(frame)
                    .enhanced(enhanced.clone())
                    .fps(fps),
            );
            self.queue.put(enhanced);
        }
        log::info!("capture stage stopped");
    }
}

// ----------------------------------------------------------------------------
// Detection stage
// ----------------------------------------------------------------------------

struct DetectionStage {
    store: Arc<FrameStore>,
    queue: Arc<FreshnessQueue>,
    settings: Arc<PipelineSettings>,
    shutdown: ShutdownToken,
    event_threshold: f32,
    iou_threshold: f32,
    min_event_interval: Duration,
    events_emitted: Arc<AtomicU64>,
}

impl DetectionStage {
    fn run(
        self,
        mut backend: Box<dyn DetectorBackend>,
        mut sink: Box<dyn EventSink>,
        mut indicator: Box<dyn Indicator>,
    ) {
        log::info!("detection stage started ({})", backend.name());
        let mut next_event_id: u64 = 1;
        let mut last_event_at: Option<Instant> = None;

        // Blocks on the queue; `None` means the queue was closed for
        // shutdown and drained.
        while let Some(frame) = self.queue.get() {
            if self.shutdown.is_shutdown() {
                break;
            }

            let detections = match self.detect_one(backend.as_mut(), &frame) {
                Ok(detections) => detections,
                Err(err) => {
                    // Malformed model output decodes to "nothing seen".
                    log::warn!("decode failed, treating as zero detections: {}", err);
                    Vec::new()
                }
            };

            indicator.set(!detections.is_empty());

            // Durable events for high-confidence detections, rate limited.
            let due = last_event_at
                .map(|at| at.elapsed() >= self.min_event_interval)
                .unwrap_or(true);
            if due {
                let mut emitted = false;
                for det in detections
                    .iter()
                    .filter(|d| d.confidence > self.event_threshold)
                {
                    let event = DetectionEvent {
                        id: next_event_id,
                        detection: det.clone(),
                        frame_seq: frame.seq,
                        frame_timestamp_ms: frame.timestamp_ms,
                        thumbnail: extract_thumbnail(&frame, det),
                    };
                    // A sink hiccup must not stop detection.
                    if let Err(err) = sink.append(&event) {
                        log::warn!("event sink append failed: {}", err);
                    }
                    next_event_id += 1;
                    self.events_emitted.fetch_add(1, Ordering::SeqCst);
                    emitted = true;
                }
                if emitted {
                    last_event_at = Some(Instant::now());
                }
            }

            self.store
                .update(StoreUpdate::new().detections(detections));
        }
        log::info!("detection stage stopped");
    }

    fn detect_one(
        &self,
        backend: &mut dyn DetectorBackend,
        frame: &Frame,
    ) -> Result<Vec<crate::detect::Detection>> {
        let letterbox = Letterbox::compute(frame.width(), frame.height(), backend.input_size())?;
        let input = letterbox.apply(frame)?;
        let output = backend.infer(&input)?;
        Ok(decode_output(
            &output,
            &letterbox,
            self.settings.inference_threshold(),
            self.iou_threshold,
        ))
    }
}

// ----------------------------------------------------------------------------
// Render stage
// ----------------------------------------------------------------------------

struct RenderStage {
    store: Arc<FrameStore>,
    shutdown: ShutdownToken,
    interval: Duration,
}

impl RenderStage {
    fn run(self) {
        log::info!("render stage started");
        while !self.shutdown.is_shutdown() {
            // Latest enhanced frame + latest detections; the pairing may be
            // a cycle stale, which is the intended decoupling.
            if let Some(frame) = self.store.frame(crate::store::Slot::Enhanced) {
                let detections = self.store.detections();
                match annotate(&frame, &detections, HIGH_CONFIDENCE) {
                    Ok(annotated) => {
                        self.store.update(StoreUpdate::new().annotated(annotated))
                    }
                    Err(err) => log::warn!("render failed: {}", err),
                }
            }
            self.shutdown.sleep(self.interval.max(Duration::from_millis(1)));
        }
        log::info!("render stage stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_round_trip_and_clamp() {
        let settings = PipelineSettings::new(0.6, 3.0);
        assert!((settings.inference_threshold() - 0.6).abs() < f32::EPSILON);
        settings.set_inference_threshold(1.5);
        assert_eq!(settings.inference_threshold(), 1.0);
        settings.set_clahe_clip_limit(-2.0);
        assert_eq!(settings.clahe_clip_limit(), 0.0);
    }

    #[test]
    fn shutdown_token_sleep_returns_early() {
        let token = ShutdownToken::new();
        token.shutdown();
        let start = Instant::now();
        token.sleep(Duration::from_secs(5));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn signal_indicator_reflects_last_set() {
        let indicator = SignalIndicator::new();
        let mut writer = indicator.clone();
        writer.set(true);
        assert!(indicator.is_on());
        writer.set(false);
        assert!(!indicator.is_on());
    }
}
