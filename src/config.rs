use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::ingest::CameraConfig;
use crate::pipeline::PipelineConfig;

const DEFAULT_CAMERA_URL: &str = "stub://camera";
const DEFAULT_CAMERA_FPS: u32 = 30;
const DEFAULT_CAMERA_WIDTH: u32 = 640;
const DEFAULT_CAMERA_HEIGHT: u32 = 480;
const DEFAULT_MODEL_INPUT_SIZE: u32 = 640;
const DEFAULT_INFERENCE_THRESHOLD: f32 = 0.60;
const DEFAULT_EVENT_THRESHOLD: f32 = 0.75;
const DEFAULT_QUEUE_CAPACITY: usize = 2;
const DEFAULT_MIN_EVENT_INTERVAL_SECS: u64 = 1;
const DEFAULT_EVENTS_DIR: &str = "events";

#[derive(Debug, Deserialize, Default)]
struct ReefwatchConfigFile {
    events_dir: Option<String>,
    camera: Option<CameraConfigFile>,
    detect: Option<DetectConfigFile>,
    enhance: Option<EnhanceConfigFile>,
    stream: Option<StreamConfigFile>,
    queue_capacity: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    url: Option<String>,
    target_fps: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectConfigFile {
    model_path: Option<PathBuf>,
    input_size: Option<u32>,
    inference_threshold: Option<f32>,
    event_threshold: Option<f32>,
    iou_threshold: Option<f32>,
    min_event_interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct EnhanceConfigFile {
    clip_limit: Option<f32>,
    tile_grid: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct StreamConfigFile {
    target_fps: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct ReefwatchConfig {
    pub events_dir: PathBuf,
    pub camera: CameraConfig,
    pub detect: DetectSettings,
    pub enhance: EnhanceSettings,
    pub stream_fps: u32,
    pub queue_capacity: usize,
}

#[derive(Debug, Clone)]
pub struct DetectSettings {
    /// Path to the ONNX model; `None` runs the stub backend.
    pub model_path: Option<PathBuf>,
    pub input_size: u32,
    pub inference_threshold: f32,
    pub event_threshold: f32,
    pub iou_threshold: f32,
    pub min_event_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct EnhanceSettings {
    pub clip_limit: f32,
    pub tile_grid: u32,
}

impl ReefwatchConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("REEFWATCH_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Derive the pipeline stage parameters from the loaded config.
    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            inference_threshold: self.detect.inference_threshold,
            event_threshold: self.detect.event_threshold,
            iou_threshold: self.detect.iou_threshold,
            clahe_clip_limit: self.enhance.clip_limit,
            clahe_tile_grid: self.enhance.tile_grid,
            queue_capacity: self.queue_capacity,
            render_fps: self.stream_fps,
            min_event_interval: self.detect.min_event_interval,
            ..PipelineConfig::default()
        }
    }

    fn from_file(file: ReefwatchConfigFile) -> Self {
        let events_dir = PathBuf::from(
            file.events_dir
                .unwrap_or_else(|| DEFAULT_EVENTS_DIR.to_string()),
        );
        let camera = CameraConfig {
            url: file
                .camera
                .as_ref()
                .and_then(|camera| camera.url.clone())
                .unwrap_or_else(|| DEFAULT_CAMERA_URL.to_string()),
            target_fps: file
                .camera
                .as_ref()
                .and_then(|camera| camera.target_fps)
                .unwrap_or(DEFAULT_CAMERA_FPS),
            width: file
                .camera
                .as_ref()
                .and_then(|camera| camera.width)
                .unwrap_or(DEFAULT_CAMERA_WIDTH),
            height: file
                .camera
                .as_ref()
                .and_then(|camera| camera.height)
                .unwrap_or(DEFAULT_CAMERA_HEIGHT),
        };
        let detect = DetectSettings {
            model_path: file.detect.as_ref().and_then(|d| d.model_path.clone()),
            input_size: file
                .detect
                .as_ref()
                .and_then(|d| d.input_size)
                .unwrap_or(DEFAULT_MODEL_INPUT_SIZE),
            inference_threshold: file
                .detect
                .as_ref()
                .and_then(|d| d.inference_threshold)
                .unwrap_or(DEFAULT_INFERENCE_THRESHOLD),
            event_threshold: file
                .detect
                .as_ref()
                .and_then(|d| d.event_threshold)
                .unwrap_or(DEFAULT_EVENT_THRESHOLD),
            iou_threshold: file
                .detect
                .as_ref()
                .and_then(|d| d.iou_threshold)
                .unwrap_or(crate::detect::DEFAULT_IOU_THRESHOLD),
            min_event_interval: Duration::from_secs(
                file.detect
                    .as_ref()
                    .and_then(|d| d.min_event_interval_secs)
                    .unwrap_or(DEFAULT_MIN_EVENT_INTERVAL_SECS),
            ),
        };
        let enhance = EnhanceSettings {
            clip_limit: file
                .enhance
                .as_ref()
                .and_then(|e| e.clip_limit)
                .unwrap_or(crate::enhance::DEFAULT_CLIP_LIMIT),
            tile_grid: file
                .enhance
                .as_ref()
                .and_then(|e| e.tile_grid)
                .unwrap_or(crate::enhance::DEFAULT_TILE_GRID),
        };
        let stream_fps = file
            .stream
            .and_then(|stream| stream.target_fps)
            .unwrap_or(crate::stream::DEFAULT_STREAM_FPS);
        let queue_capacity = file.queue_capacity.unwrap_or(DEFAULT_QUEUE_CAPACITY);
        Self {
            events_dir,
            camera,
            detect,
            enhance,
            stream_fps,
            queue_capacity,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(url) = std::env::var("REEFWATCH_CAMERA_URL") {
            if !url.trim().is_empty() {
                self.camera.url = url;
            }
        }
        if let Ok(dir) = std::env::var("REEFWATCH_EVENTS_DIR") {
            if !dir.trim().is_empty() {
                self.events_dir = PathBuf::from(dir);
            }
        }
        if let Ok(path) = std::env::var("REEFWATCH_MODEL_PATH") {
            if !path.trim().is_empty() {
                self.detect.model_path = Some(PathBuf::from(path));
            }
        }
        if let Ok(threshold) = std::env::var("REEFWATCH_INFERENCE_THRESHOLD") {
            self.detect.inference_threshold = threshold.parse().map_err(|_| {
                anyhow!("REEFWATCH_INFERENCE_THRESHOLD must be a number between 0 and 1")
            })?;
        }
        if let Ok(threshold) = std::env::var("REEFWATCH_EVENT_THRESHOLD") {
            self.detect.event_threshold = threshold.parse().map_err(|_| {
                anyhow!("REEFWATCH_EVENT_THRESHOLD must be a number between 0 and 1")
            })?;
        }
        if let Ok(capacity) = std::env::var("REEFWATCH_QUEUE_CAPACITY") {
            self.queue_capacity = capacity
                .parse()
                .map_err(|_| anyhow!("REEFWATCH_QUEUE_CAPACITY must be a small integer"))?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("inference threshold", self.detect.inference_threshold),
            ("event threshold", self.detect.event_threshold),
        ] {
            if !(value > 0.0 && value < 1.0) {
                return Err(anyhow!("{} must be strictly between 0 and 1", name));
            }
        }
        if self.detect.event_threshold < self.detect.inference_threshold {
            return Err(anyhow!(
                "event threshold must be at least the inference threshold"
            ));
        }
        if !(self.detect.iou_threshold > 0.0 && self.detect.iou_threshold < 1.0) {
            return Err(anyhow!("iou threshold must be strictly between 0 and 1"));
        }
        if !(1..=5).contains(&self.queue_capacity) {
            return Err(anyhow!("queue capacity must be between 1 and 5"));
        }
        if self.camera.width == 0 || self.camera.height == 0 {
            return Err(anyhow!(
                "camera dimensions {}x{} must be positive",
                self.camera.width,
                self.camera.height
            ));
        }
        if self.detect.input_size == 0 {
            return Err(anyhow!("model input size must be positive"));
        }
        if self.enhance.tile_grid == 0 {
            return Err(anyhow!("enhancement tile grid must be positive"));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<ReefwatchConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}
