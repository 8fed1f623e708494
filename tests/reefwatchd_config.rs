use std::sync::Mutex;

use tempfile::NamedTempFile;

use reefwatch::config::ReefwatchConfig;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "REEFWATCH_CONFIG",
        "REEFWATCH_CAMERA_URL",
        "REEFWATCH_EVENTS_DIR",
        "REEFWATCH_MODEL_PATH",
        "REEFWATCH_INFERENCE_THRESHOLD",
        "REEFWATCH_EVENT_THRESHOLD",
        "REEFWATCH_QUEUE_CAPACITY",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "events_dir": "/var/lib/reefwatch/events",
        "camera": {
            "url": "/dev/video1",
            "target_fps": 25,
            "width": 1280,
            "height": 720
        },
        "detect": {
            "model_path": "models/reef.onnx",
            "input_size": 416,
            "inference_threshold": 0.5,
            "event_threshold": 0.8,
            "iou_threshold": 0.4,
            "min_event_interval_secs": 2
        },
        "enhance": {
            "clip_limit": 2.5,
            "tile_grid": 4
        },
        "stream": {
            "target_fps": 10
        },
        "queue_capacity": 3
    }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");

    std::env::set_var("REEFWATCH_CONFIG", file.path());
    std::env::set_var("REEFWATCH_CAMERA_URL", "stub://bench");
    std::env::set_var("REEFWATCH_EVENT_THRESHOLD", "0.9");

    let cfg = ReefwatchConfig::load().expect("load config");

    assert_eq!(cfg.events_dir.to_str().unwrap(), "/var/lib/reefwatch/events");
    assert_eq!(cfg.camera.url, "stub://bench");
    assert_eq!(cfg.camera.target_fps, 25);
    assert_eq!(cfg.camera.width, 1280);
    assert_eq!(cfg.camera.height, 720);
    assert_eq!(cfg.detect.model_path.as_ref().unwrap().to_str().unwrap(), "models/reef.onnx");
    assert_eq!(cfg.detect.input_size, 416);
    assert!((cfg.detect.inference_threshold - 0.5).abs() < f32::EPSILON);
    assert!((cfg.detect.event_threshold - 0.9).abs() < f32::EPSILON);
    assert!((cfg.detect.iou_threshold - 0.4).abs() < f32::EPSILON);
    assert_eq!(cfg.detect.min_event_interval.as_secs(), 2);
    assert!((cfg.enhance.clip_limit - 2.5).abs() < f32::EPSILON);
    assert_eq!(cfg.enhance.tile_grid, 4);
    assert_eq!(cfg.stream_fps, 10);
    assert_eq!(cfg.queue_capacity, 3);

    clear_env();
}

#[test]
fn defaults_apply_without_file_or_env() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = ReefwatchConfig::load().expect("load defaults");

    assert_eq!(cfg.camera.url, "stub://camera");
    assert_eq!(cfg.camera.width, 640);
    assert_eq!(cfg.camera.height, 480);
    assert_eq!(cfg.camera.target_fps, 30);
    assert!(cfg.detect.model_path.is_none());
    assert_eq!(cfg.detect.input_size, 640);
    assert!((cfg.detect.inference_threshold - 0.60).abs() < f32::EPSILON);
    assert!((cfg.detect.event_threshold - 0.75).abs() < f32::EPSILON);
    assert_eq!(cfg.queue_capacity, 2);
    assert_eq!(cfg.stream_fps, 15);

    clear_env();
}

#[test]
fn rejects_event_threshold_below_inference_threshold() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("REEFWATCH_INFERENCE_THRESHOLD", "0.8");
    std::env::set_var("REEFWATCH_EVENT_THRESHOLD", "0.5");

    assert!(ReefwatchConfig::load().is_err());

    clear_env();
}

#[test]
fn rejects_zero_camera_dimensions() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{ "camera": { "width": 0, "height": 480 } }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");
    std::env::set_var("REEFWATCH_CONFIG", file.path());

    assert!(ReefwatchConfig::load().is_err());

    clear_env();
}

#[test]
fn rejects_out_of_range_queue_capacity() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("REEFWATCH_QUEUE_CAPACITY", "9");
    assert!(ReefwatchConfig::load().is_err());

    std::env::set_var("REEFWATCH_QUEUE_CAPACITY", "0");
    assert!(ReefwatchConfig::load().is_err());

    clear_env();
}
