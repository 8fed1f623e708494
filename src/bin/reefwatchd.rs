//! reefwatchd - camera monitor daemon
//!
//! This daemon:
//! 1. Captures frames from the configured camera (synthetic or V4L2)
//! 2. Enhances each frame with CLAHE before display and inference
//! 3. Runs the detector on the freshest frame, dropping stale backlog
//! 4. Appends high-confidence detections to the durable event log
//! 5. Composes the annotated live view and emits periodic stats

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use reefwatch::config::DetectSettings;
use reefwatch::events::FsEventSink;
use reefwatch::ingest::open_source;
use reefwatch::pipeline::{LogIndicator, Pipeline};
use reefwatch::stream::LogStatsSink;
use reefwatch::{DetectorBackend, ReefwatchConfig, StubBackend};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Camera URL override (`stub://name` or a V4L2 device path).
    #[arg(long)]
    camera: Option<String>,
    /// Event log directory override.
    #[arg(long)]
    events_dir: Option<PathBuf>,
    /// ONNX model path override.
    #[arg(long)]
    model: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut cfg = ReefwatchConfig::load()?;
    if let Some(camera) = args.camera {
        cfg.camera.url = camera;
    }
    if let Some(dir) = args.events_dir {
        cfg.events_dir = dir;
    }
    if let Some(model) = args.model {
        cfg.detect.model_path = Some(model);
    }

    let source = open_source(cfg.camera.clone())?;
    let backend = build_backend(&cfg.detect)?;
    let sink = FsEventSink::open(&cfg.events_dir)
        .with_context(|| format!("open event log in {}", cfg.events_dir.display()))?;

    let mut pipeline = Pipeline::new(cfg.pipeline());
    pipeline.spawn_capture(source)?;
    pipeline.spawn_detection(backend, Box::new(sink), Box::new(LogIndicator::default()))?;
    pipeline.spawn_render()?;
    pipeline.spawn_stats(Box::new(LogStatsSink))?;

    let shutdown = pipeline.shutdown_token();
    ctrlc::set_handler(move || shutdown.shutdown()).context("install signal handler")?;

    log::info!(
        "reefwatchd running. camera={} events={}",
        cfg.camera.url,
        cfg.events_dir.display()
    );

    let shutdown = pipeline.shutdown_token();
    while !shutdown.is_shutdown() {
        std::thread::sleep(Duration::from_millis(200));
    }

    log::info!("shutting down");
    pipeline.shutdown();
    log::info!("reefwatchd stopped after {} events", pipeline.events_emitted());
    Ok(())
}

fn build_backend(detect: &DetectSettings) -> Result<Box<dyn DetectorBackend>> {
    match &detect.model_path {
        Some(path) => {
            #[cfg(feature = "backend-tract")]
            {
                let backend = reefwatch::TractBackend::new(path, detect.input_size)
                    .with_context(|| format!("load model {}", path.display()))?;
                Ok(Box::new(backend))
            }
            #[cfg(not(feature = "backend-tract"))]
            {
                Err(anyhow::anyhow!(
                    "model {} requires the backend-tract feature",
                    path.display()
                ))
            }
        }
        None => {
            log::warn!("no model configured, running the stub detector (no detections)");
            Ok(Box::new(StubBackend::new(detect.input_size)))
        }
    }
}
