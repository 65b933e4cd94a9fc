//! Configuration layering: file base, environment overrides, CLI wins.

use std::sync::Mutex;

use tempfile::NamedTempFile;

use meteor_watch::config::{Cli, DaemonConfig};
use meteor_watch::ingest::CaptureBackend;
use meteor_watch::params::{DetectionParams, Sensitivity};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "METEOR_CONFIG",
        "CAMERA_URL",
        "CAMERA_NAME",
        "SENSITIVITY",
        "OUTPUT_DIR",
        "WEB_PORT",
        "EXTRACT_CLIPS",
        "ENABLE_TIME_WINDOW",
        "LATITUDE",
        "LONGITUDE",
        "TIMEZONE",
        "METEOR_DIFF_THRESHOLD",
        "METEOR_MIN_BRIGHTNESS",
        "METEOR_MIN_SPEED",
        "METEOR_MAX_DURATION",
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
        "output_dir": "/data/detections",
        "camera": {
            "url": "rtsp://camera-1/stream",
            "name": "north",
            "backend": "ffmpeg"
        },
        "detection": {
            "sensitivity": "high",
            "scale": 0.25,
            "buffer_seconds": 12.0,
            "extract_clips": true
        },
        "mask": { "dilate": 30 },
        "web": { "port": 8081 },
        "astro": { "latitude": 34.0, "longitude": 135.0, "timezone": "Asia/Osaka" }
    }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");

    std::env::set_var("METEOR_CONFIG", file.path());
    std::env::set_var("EXTRACT_CLIPS", "false");
    std::env::set_var("LATITUDE", "36.5");

    let cfg = DaemonConfig::load(&Cli::default()).expect("load config");

    assert_eq!(cfg.camera_url, "rtsp://camera-1/stream");
    assert_eq!(cfg.camera_name, "north");
    assert_eq!(cfg.backend, CaptureBackend::Ffmpeg);
    assert_eq!(cfg.output_dir, std::path::Path::new("/data/detections"));
    assert_eq!(cfg.sensitivity, Sensitivity::High);
    assert!((cfg.process_scale - 0.25).abs() < 1e-9);
    assert!((cfg.buffer_seconds - 12.0).abs() < 1e-9);
    assert_eq!(cfg.web_port, 8081);
    assert_eq!(cfg.mask_dilate, 30);
    // Env wins over the file.
    assert!(!cfg.extract_clips);
    assert!((cfg.latitude - 36.5).abs() < 1e-9);
    assert_eq!(cfg.timezone, "Asia/Osaka");

    clear_env();
}

#[test]
fn cli_overrides_win_over_everything() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("CAMERA_URL", "rtsp://from-env/stream");

    let cli = Cli {
        url: Some("rtsp://from-cli/stream".to_string()),
        camera_name: Some("cli-cam".to_string()),
        sensitivity: Some("fireball".to_string()),
        no_clips: true,
        exclude_bottom: Some(0.2),
        ..Cli::default()
    };
    let cfg = DaemonConfig::load(&cli).expect("load config");

    assert_eq!(cfg.camera_url, "rtsp://from-cli/stream");
    assert_eq!(cfg.camera_name, "cli-cam");
    assert_eq!(cfg.sensitivity, Sensitivity::Fireball);
    assert!(!cfg.extract_clips);

    // The exclude-bottom flag lands in the parameter overrides.
    let mut params = DetectionParams::default();
    cfg.sensitivity.apply_to(&mut params);
    cfg.param_overrides.apply(&mut params).expect("apply overrides");
    assert!((params.exclude_bottom_ratio - 0.2).abs() < 1e-9);

    clear_env();
}

#[test]
fn per_parameter_env_overrides_are_clamped() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("CAMERA_URL", "rtsp://cam/stream");
    std::env::set_var("METEOR_DIFF_THRESHOLD", "9999");
    std::env::set_var("METEOR_MIN_SPEED", "25.5");
    std::env::set_var("METEOR_MAX_DURATION", "18.0");

    let cfg = DaemonConfig::load(&Cli::default()).expect("load config");
    let mut params = DetectionParams::default();
    cfg.sensitivity.apply_to(&mut params);
    cfg.param_overrides.apply(&mut params).expect("apply overrides");

    assert_eq!(params.diff_threshold, 255);
    assert!((params.min_speed - 25.5).abs() < 1e-9);
    assert!((params.max_duration - 18.0).abs() < 1e-9);

    clear_env();
}

#[test]
fn garbage_numeric_env_is_an_error() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("CAMERA_URL", "rtsp://cam/stream");
    std::env::set_var("METEOR_MIN_BRIGHTNESS", "bright");

    let err = DaemonConfig::load(&Cli::default()).expect_err("must fail");
    assert!(err.to_string().contains("METEOR_MIN_BRIGHTNESS"));

    clear_env();
}

#[test]
fn missing_url_is_fatal() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let err = DaemonConfig::load(&Cli::default()).expect_err("must fail");
    assert!(err.to_string().contains("camera url"));

    clear_env();
}
