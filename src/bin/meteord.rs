//! meteord - per-camera meteor detection daemon
//!
//! This daemon:
//! 1. Opens the configured RTSP stream and keeps it alive across outages
//! 2. Buffers recent frames in a ring for retrospective clip extraction
//! 3. Runs motion extraction, tracking, candidate acceptance and merging
//! 4. Persists evidence (clip, composites, JSONL record) per event
//! 5. Serves the per-camera control surface when a web port is configured
//!
//! Exit code is non-zero only for unrecoverable initialization failures;
//! runtime stream loss is handled by reconnecting.

use anyhow::{anyhow, Result};
use clap::Parser;
use log::info;

use meteor_watch::api::{ApiConfig, ApiServer};
use meteor_watch::config::{Cli, DaemonConfig};
use meteor_watch::engine::{DetectionWindow, Engine, EngineConfig};
use meteor_watch::ingest::ReaderOptions;
use meteor_watch::params::DetectionParams;

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let cfg = DaemonConfig::load(&cli)?;

    info!(
        "meteord {} starting for camera '{}'",
        env!("CARGO_PKG_VERSION"),
        cfg.camera_name
    );
    info!("stream: {}", cfg.camera_url);
    info!("output: {}", cfg.output_dir.display());

    let mut params = DetectionParams::default();
    cfg.sensitivity.apply_to(&mut params);
    cfg.param_overrides.apply(&mut params)?;

    let engine_cfg = EngineConfig {
        camera_name: cfg.camera_name.clone(),
        url: cfg.camera_url.clone(),
        backend: cfg.backend,
        output_dir: cfg.output_dir.clone(),
        process_scale: cfg.process_scale,
        buffer_seconds: cfg.buffer_seconds,
        extract_clips: cfg.extract_clips,
        mask_image: cfg.mask_image.clone(),
        mask_from_day: cfg.mask_from_day.clone(),
        mask_dilate: cfg.mask_dilate,
        params,
        sensitivity: cfg.sensitivity,
        reader: ReaderOptions::default(),
    };

    // Twilight gating is computed by the deployment scheduler, which feeds
    // the engine through this predicate; standalone runs detect all night.
    let window: DetectionWindow = Box::new(|| true);
    if cfg.enable_time_window {
        info!(
            "detection window configured for ({:.4}, {:.4}) {}; gating is driven by the scheduler",
            cfg.latitude, cfg.longitude, cfg.timezone
        );
    }

    let engine = Engine::start(engine_cfg, window)?;
    let handle = engine.handle();

    {
        let handle = handle.clone();
        ctrlc::set_handler(move || {
            info!("shutdown requested");
            handle.request_shutdown();
        })?;
    }

    let api = if cfg.web_port > 0 {
        let server = ApiServer::new(
            ApiConfig {
                addr: format!("0.0.0.0:{}", cfg.web_port),
            },
            handle.clone(),
        );
        let api = server.spawn()?;
        info!("control surface: http://{}/", api.addr);
        Some(api)
    } else {
        None
    };

    let worker = std::thread::Builder::new()
        .name("detector".to_string())
        .spawn(move || engine.run())?;
    let run_result = worker
        .join()
        .map_err(|_| anyhow!("detector thread panicked"))?;

    if let Some(api) = api {
        api.stop()?;
    }
    run_result?;

    info!("meteord stopped; detections: {}", handle.detection_count());
    Ok(())
}
