//! demo - end-to-end synthetic run of the full pipeline
//!
//! Runs every stage against a synthetic camera and a scripted detector for
//! a bounded time, then prints the events it produced and saves a snapshot
//! of the annotated view. Useful for bring-up on hardware with no camera
//! and no model.

use std::time::Duration;

use anyhow::Result;
use clap::Parser;

use reefwatch::events::MemoryEventSink;
use reefwatch::ingest::{CameraConfig, SyntheticSource};
use reefwatch::pipeline::{Pipeline, PipelineConfig, SignalIndicator};
use reefwatch::stream::{save_snapshot, LogStatsSink};
use reefwatch::StubBackend;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// How long to run, in seconds.
    #[arg(long, default_value_t = 5)]
    seconds: u64,
    /// Synthetic camera rate.
    #[arg(long, default_value_t = 30)]
    fps: u32,
    /// Output directory for the final snapshot.
    #[arg(long, default_value = "demo_out")]
    out: String,
}

const INPUT_SIZE: u32 = 320;

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let source = SyntheticSource::new(CameraConfig {
        url: "stub://demo".into(),
        width: 640,
        height: 480,
        target_fps: args.fps,
    });

    // Scripted detector: a confident box roughly every second of camera
    // time, a weaker one in between, nothing otherwise.
    let mut backend = StubBackend::new(INPUT_SIZE);
    let expected_inferences = (args.seconds * args.fps.max(1) as u64) as usize;
    for i in 0..expected_inferences {
        match i % args.fps.max(1) as usize {
            0 => backend.push_box(160.0, 140.0, 80.0, 60.0, 0.92),
            15 => backend.push_box(220.0, 180.0, 50.0, 40.0, 0.68),
            _ => backend.push_empty(),
        }
    }

    let sink = MemoryEventSink::new();
    let events = sink.clone();
    let indicator = SignalIndicator::new();

    let mut pipeline = Pipeline::new(PipelineConfig::default());
    let store = pipeline.store();
    pipeline.spawn_capture(Box::new(source))?;
    pipeline.spawn_detection(
        Box::new(backend),
        Box::new(sink),
        Box::new(indicator.clone()),
    )?;
    pipeline.spawn_render()?;
    pipeline.spawn_stats(Box::new(LogStatsSink))?;

    std::thread::sleep(Duration::from_secs(args.seconds));
    pipeline.shutdown();

    let snapshot = save_snapshot(&store, args.out.as_ref());
    match &snapshot {
        Ok(path) => println!("snapshot written to {}", path.display()),
        Err(err) => println!("no snapshot: {}", err),
    }

    let metrics = store.metrics();
    println!(
        "final metrics: fps={:.1} detections={} last_confidence={:.2}",
        metrics.fps, metrics.detection_count, metrics.last_confidence
    );
    println!("events ({}):", events.len());
    for event in events.events() {
        println!(
            "  #{} frame={} conf={:.2} box=({:.0},{:.0})-({:.0},{:.0})",
            event.id,
            event.frame_seq,
            event.detection.confidence,
            event.detection.x1,
            event.detection.y1,
            event.detection.x2,
            event.detection.y2
        );
    }
    Ok(())
}
