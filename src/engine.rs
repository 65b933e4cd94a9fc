//! Per-camera detection engine.
//!
//! Wires the pipeline together: stream reader → ring buffer → motion
//! extractor → tracker → merger → evidence writer, with a handle exposing
//! the shared state the control surface needs (current frame, stats,
//! parameters, masks, shutdown flag).
//!
//! Threading: the reader runs on its own thread (see `ingest`); `run()`
//! drives the detector stages in strict FIFO frame order on the caller's
//! thread and blocks at most one second per queue read, so a shutdown
//! request is honored promptly. Evidence I/O happens inline; events are
//! sparse, and a long write merely skips a few frames of detection.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use log::{info, warn};
use serde::Serialize;

use crate::detect::{EventMerger, MotionExtractor, Observation, Tracker};
use crate::event::MeteorEvent;
use crate::frame::{FrameSlot, RingBuffer};
use crate::imops::{self, BgrImage, GrayImage};
use crate::ingest::{CaptureBackend, ReadError, ReaderOptions, StreamReader};
use crate::mask::{self, MaskStore};
use crate::params::{DetectionParams, ParamsPatch, Sensitivity};
use crate::writer::EvidenceWriter;

/// Stream is considered dead after this long without a frame.
const STREAM_TIMEOUT_SECS: f64 = 10.0;
/// Sliding window length for the runtime FPS estimate.
const FPS_WINDOW: usize = 30;

const OBSERVATION_COLOR: (u8, u8, u8) = (0, 255, 0);
const TRACK_COLOR: (u8, u8, u8) = (0, 255, 255);

/// Gate evaluated per frame; detection stages are skipped while it is
/// false (e.g. outside astronomical twilight, which an external service
/// computes). Frames still feed the ring buffer and the preview.
pub type DetectionWindow = Box<dyn Fn() -> bool + Send>;

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub camera_name: String,
    pub url: String,
    pub backend: CaptureBackend,
    pub output_dir: PathBuf,
    pub process_scale: f64,
    pub buffer_seconds: f64,
    pub extract_clips: bool,
    pub mask_image: Option<PathBuf>,
    pub mask_from_day: Option<PathBuf>,
    pub mask_dilate: u32,
    pub params: DetectionParams,
    pub sensitivity: Sensitivity,
    pub reader: ReaderOptions,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            camera_name: "camera".to_string(),
            url: String::new(),
            backend: CaptureBackend::Auto,
            output_dir: PathBuf::from("meteor_detections"),
            process_scale: 0.5,
            buffer_seconds: 15.0,
            extract_clips: true,
            mask_image: None,
            mask_from_day: None,
            mask_dilate: 20,
            params: DetectionParams::default(),
            sensitivity: Sensitivity::Medium,
            reader: ReaderOptions::default(),
        }
    }
}

/// Stats as served by `GET /stats`.
#[derive(Clone, Debug, Serialize)]
pub struct StatsSnapshot {
    pub detections: u64,
    pub elapsed: f64,
    pub camera: String,
    pub runtime_fps: f64,
    pub stream_alive: bool,
    pub time_since_last_frame: f64,
    pub is_detecting: bool,
    pub mask_active: bool,
    pub settings: SettingsSnapshot,
}

#[derive(Clone, Debug, Serialize)]
pub struct SettingsSnapshot {
    pub sensitivity: &'static str,
    pub scale: f64,
    pub buffer: f64,
    pub extract_clips: bool,
    pub source_fps: f64,
    pub codec: Option<&'static str>,
    pub mask_dilate: u32,
    #[serde(flatten)]
    pub params: DetectionParams,
}

/// Shared per-engine state for the control surface. One handle per
/// camera; nothing here touches another camera's engine.
pub struct EngineHandle {
    camera_name: String,
    output_dir: PathBuf,
    proc_size: (u32, u32),
    buffer_seconds: f64,
    process_scale: f64,
    source_fps: f64,
    extract_clips: bool,
    chosen_codec: Option<&'static str>,
    mask_dilate: u32,
    params: Mutex<DetectionParams>,
    sensitivity: Mutex<Sensitivity>,
    pub masks: MaskStore,
    display: FrameSlot,
    latest_raw: FrameSlot,
    detection_count: AtomicU64,
    runtime_fps_bits: AtomicU64,
    last_frame_wall: Mutex<Option<Instant>>,
    detecting: AtomicBool,
    shutdown: AtomicBool,
    started_at: Instant,
}

impl EngineHandle {
    pub fn camera_name(&self) -> &str {
        &self.camera_name
    }

    pub fn params(&self) -> DetectionParams {
        *self.params.lock().expect("params lock")
    }

    /// Apply a clamped partial update; visible to the detector by the next
    /// frame. Returns the effective parameters.
    pub fn apply_patch(&self, patch: &ParamsPatch) -> Result<DetectionParams> {
        let mut params = self.params.lock().expect("params lock");
        let applied = patch.apply(&mut params)?;
        if let Some(sensitivity) = applied {
            *self.sensitivity.lock().expect("sensitivity lock") = sensitivity;
        }
        Ok(*params)
    }

    pub fn display_snapshot(&self) -> Option<BgrImage> {
        self.display.snapshot()
    }

    pub fn detection_count(&self) -> u64 {
        self.detection_count.load(Ordering::Relaxed)
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Synthesize an exclusion mask from the latest raw frame, persist it
    /// under `masks/`, and install it. Returns the persisted path.
    pub fn update_mask_from_current_frame(&self) -> Result<PathBuf> {
        let frame = self
            .latest_raw
            .snapshot()
            .ok_or_else(|| anyhow!("current frame not available"))?;
        let new_mask = mask::build_exclusion_mask(&frame, self.proc_size, self.mask_dilate);
        let path = mask::persistent_mask_path(&self.output_dir, &self.camera_name);
        if let Err(err) = mask::save_mask_png(&path, &new_mask) {
            warn!("failed to persist mask: {:#}", err);
        }
        self.masks.set_exclusion(Some(new_mask));
        Ok(path)
    }

    /// Clear the exclusion mask and delete the persisted file, if any.
    pub fn reset_mask(&self) -> Result<Option<PathBuf>> {
        self.masks.set_exclusion(None);
        let path = mask::persistent_mask_path(&self.output_dir, &self.camera_name);
        if path.exists() {
            std::fs::remove_file(&path)
                .with_context(|| format!("failed to delete {}", path.display()))?;
            return Ok(Some(path));
        }
        Ok(None)
    }

    pub fn stats(&self) -> StatsSnapshot {
        // Before the first frame arrives, fall back to engine uptime so
        // the value stays finite in JSON and the stream gets a startup
        // grace period before being reported dead.
        let time_since_last_frame = self
            .last_frame_wall
            .lock()
            .expect("frame time lock")
            .map(|at| at.elapsed().as_secs_f64())
            .unwrap_or_else(|| self.started_at.elapsed().as_secs_f64());
        let params = self.params();
        let sensitivity = *self.sensitivity.lock().expect("sensitivity lock");
        StatsSnapshot {
            detections: self.detection_count.load(Ordering::Relaxed),
            elapsed: self.started_at.elapsed().as_secs_f64(),
            camera: self.camera_name.clone(),
            runtime_fps: f64::from_bits(self.runtime_fps_bits.load(Ordering::Relaxed)),
            stream_alive: time_since_last_frame < STREAM_TIMEOUT_SECS,
            time_since_last_frame,
            is_detecting: self.detecting.load(Ordering::Relaxed),
            mask_active: self.masks.exclusion_active(),
            settings: SettingsSnapshot {
                sensitivity: sensitivity.as_str(),
                scale: self.process_scale,
                buffer: self.buffer_seconds,
                extract_clips: self.extract_clips,
                source_fps: self.source_fps,
                codec: self.chosen_codec,
                mask_dilate: self.mask_dilate,
                params,
            },
        }
    }

    fn note_frame(&self, runtime_fps: f64) {
        *self.last_frame_wall.lock().expect("frame time lock") = Some(Instant::now());
        self.runtime_fps_bits
            .store(runtime_fps.to_bits(), Ordering::Relaxed);
    }
}

pub struct Engine {
    config: EngineConfig,
    reader: StreamReader,
    ring: RingBuffer,
    writer: EvidenceWriter,
    handle: Arc<EngineHandle>,
    window: DetectionWindow,
    proc_size: (u32, u32),
}

impl Engine {
    /// Connect to the camera and assemble the pipeline. A connection that
    /// does not come up within the configured limit is an error: startup
    /// failures are fatal, runtime disconnects are not.
    pub fn start(config: EngineConfig, window: DetectionWindow) -> Result<Self> {
        let reader = StreamReader::connect(&config.url, config.backend, config.reader.clone())
            .with_context(|| format!("failed to open stream {}", config.url))?;
        Self::with_reader(config, reader, window)
    }

    /// Assemble the pipeline over an already-connected reader.
    pub fn with_reader(
        config: EngineConfig,
        reader: StreamReader,
        window: DetectionWindow,
    ) -> Result<Self> {
        let (width, height) = reader.frame_size();
        if width == 0 || height == 0 {
            return Err(anyhow!("stream reported a zero frame size"));
        }
        let fps = reader.fps();
        let proc_w = ((width as f64 * config.process_scale) as u32).max(1);
        let proc_h = ((height as f64 * config.process_scale) as u32).max(1);
        let proc_size = (proc_w, proc_h);

        // The ring only ever needs the event span plus the clip margins.
        let required_buffer = config.params.max_duration + 2.0;
        let buffer_seconds = config.buffer_seconds.min(required_buffer);
        if buffer_seconds != config.buffer_seconds {
            info!("ring buffer trimmed to {:.1}s", buffer_seconds);
        }
        let ring = RingBuffer::new(buffer_seconds, fps);

        let writer = EvidenceWriter::new(&config.output_dir, fps, config.extract_clips)?;

        let masks = MaskStore::new();
        install_startup_mask(&masks, &config, proc_size);

        let handle = Arc::new(EngineHandle {
            camera_name: config.camera_name.clone(),
            output_dir: config.output_dir.clone(),
            proc_size,
            buffer_seconds,
            process_scale: config.process_scale,
            source_fps: fps,
            extract_clips: config.extract_clips,
            chosen_codec: writer.chosen_codec(),
            mask_dilate: config.mask_dilate,
            params: Mutex::new(config.params),
            sensitivity: Mutex::new(config.sensitivity),
            masks,
            display: FrameSlot::new(),
            latest_raw: FrameSlot::new(),
            detection_count: AtomicU64::new(0),
            runtime_fps_bits: AtomicU64::new(0.0_f64.to_bits()),
            last_frame_wall: Mutex::new(None),
            detecting: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            started_at: Instant::now(),
        });

        info!(
            "engine for '{}': {}x{} @ {:.1} fps, processing at {}x{}",
            config.camera_name, width, height, fps, proc_w, proc_h
        );

        Ok(Self {
            config,
            reader,
            ring,
            writer,
            handle,
            window,
            proc_size,
        })
    }

    pub fn handle(&self) -> Arc<EngineHandle> {
        self.handle.clone()
    }

    /// Drive the detector until shutdown; drains tracks and the merger
    /// before returning.
    pub fn run(mut self) -> Result<()> {
        let extractor = MotionExtractor::new();
        let mut tracker = Tracker::new();
        let mut merger = EventMerger::new();
        let mut prev_gray: Option<GrayImage> = None;
        let mut recent_timestamps: VecDeque<f64> = VecDeque::with_capacity(FPS_WINDOW);
        let mut frame_count: u64 = 0;

        let scale_factor = 1.0 / self.config.process_scale;
        let heartbeat_every = (self.reader.fps() as u64).max(1) * 60;

        while !self.handle.shutdown_requested() {
            let frame = match self.reader.read() {
                Ok(Some(frame)) => frame,
                Ok(None) => continue,
                Err(ReadError::StreamClosed) | Err(ReadError::ConnectTimeout { .. }) => break,
            };
            let timestamp = frame.timestamp;
            let frame = frame.image;

            recent_timestamps.push_back(timestamp);
            if recent_timestamps.len() > FPS_WINDOW {
                recent_timestamps.pop_front();
            }
            let runtime_fps = window_fps(&recent_timestamps);
            self.handle.note_frame(runtime_fps);

            self.ring.add(timestamp, &frame);
            self.handle.latest_raw.set(frame.clone());

            let proc_frame = if self.config.process_scale != 1.0 {
                imops::resize_area(&frame, self.proc_size.0, self.proc_size.1)
            } else {
                frame.clone()
            };
            let gray = imops::to_gray(&proc_frame);

            if let Some(prev) = &prev_gray {
                let params = self.handle.params();
                let exclusion = self.handle.masks.exclusion();
                let nuisance = self.handle.masks.nuisance();

                let window_open = (self.window)();
                let observations = if window_open {
                    let tracking_mode = tracker.active_count() > 0;
                    extractor.extract(
                        &gray,
                        prev,
                        &params,
                        exclusion.as_deref(),
                        nuisance.as_deref(),
                        tracking_mode,
                        scale_factor,
                    )
                } else {
                    Vec::new()
                };
                self.handle.detecting.store(window_open, Ordering::Relaxed);

                let events = tracker.update(
                    &observations,
                    timestamp,
                    &params,
                    nuisance.as_deref(),
                    self.config.process_scale,
                );
                for event in events {
                    for merged in merger.add(event, &params) {
                        self.persist(&merged);
                    }
                }
                for merged in merger.flush_expired(timestamp, &params) {
                    self.persist(&merged);
                }

                let display = annotate_display(&frame, &observations, &tracker);
                self.handle.display.set(display);
            }

            prev_gray = Some(gray);
            frame_count += 1;
            if frame_count % heartbeat_every == 0 {
                info!(
                    "uptime {:.1} min, detections: {}",
                    self.handle.started_at.elapsed().as_secs_f64() / 60.0,
                    self.handle.detection_count(),
                );
            }
        }

        // Drain: finalize remaining tracks, then empty the merger.
        let params = self.handle.params();
        let nuisance = self.handle.masks.nuisance();
        for event in tracker.finalize_all(&params, nuisance.as_deref(), self.config.process_scale)
        {
            for merged in merger.add(event, &params) {
                self.persist(&merged);
            }
        }
        for merged in merger.flush_all() {
            self.persist(&merged);
        }

        self.reader.stop();
        info!(
            "engine for '{}' stopped; detections: {}",
            self.config.camera_name,
            self.handle.detection_count()
        );
        Ok(())
    }

    fn persist(&self, event: &MeteorEvent) {
        let count = self.handle.detection_count.fetch_add(1, Ordering::Relaxed) + 1;
        info!(
            "meteor #{}: length {:.1}px, duration {:.2}s, confidence {:.2}",
            count,
            event.length(),
            event.duration(),
            event.confidence
        );
        if let Err(err) = self.writer.persist(event, &self.ring) {
            warn!("failed to persist event: {:#}", err);
        }
    }
}

fn window_fps(timestamps: &VecDeque<f64>) -> f64 {
    if timestamps.len() < 2 {
        return 0.0;
    }
    let dt = timestamps.back().expect("non-empty") - timestamps.front().expect("non-empty");
    if dt <= 0.0 {
        return 0.0;
    }
    (timestamps.len() - 1) as f64 / dt
}

fn annotate_display(
    frame: &BgrImage,
    observations: &[Observation],
    tracker: &Tracker,
) -> BgrImage {
    let mut display = frame.clone();
    for obs in observations {
        imops::draw_circle(&mut display, (obs.x, obs.y), 5, OBSERVATION_COLOR, 2);
    }
    for polyline in tracker.track_polylines() {
        for segment in polyline.windows(2) {
            imops::draw_line(&mut display, segment[0], segment[1], TRACK_COLOR, 2);
        }
    }
    display
}

fn install_startup_mask(masks: &MaskStore, config: &EngineConfig, proc_size: (u32, u32)) {
    // An operator-updated mask persisted under the output dir wins over
    // any configured source, so it survives restarts.
    let persistent = mask::persistent_mask_path(&config.output_dir, &config.camera_name);
    let mask_image = if persistent.exists() {
        Some(persistent)
    } else {
        config.mask_image.clone()
    };

    if let Some(path) = mask_image {
        match mask::load_mask_image(&path, proc_size) {
            Ok(loaded) => {
                info!("mask applied: {}", path.display());
                masks.set_exclusion(Some(loaded));
            }
            Err(err) => warn!("mask unreadable, continuing without: {:#}", err),
        }
    } else if let Some(day_path) = &config.mask_from_day {
        match mask::load_reference_image(day_path) {
            Ok(reference) => {
                let built =
                    mask::build_exclusion_mask(&reference, proc_size, config.mask_dilate);
                info!("mask built from {}", day_path.display());
                masks.set_exclusion(Some(built));
            }
            Err(err) => warn!("mask source unreadable, continuing without: {:#}", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_fps_over_even_spacing() {
        let ts: VecDeque<f64> = (0..10).map(|i| i as f64 / 30.0).collect();
        assert!((window_fps(&ts) - 30.0).abs() < 1e-6);
        let single: VecDeque<f64> = std::iter::once(0.0).collect();
        assert_eq!(window_fps(&single), 0.0);
    }

    #[test]
    fn default_config_matches_daemon_defaults() {
        let config = EngineConfig::default();
        assert!((config.process_scale - 0.5).abs() < 1e-9);
        assert!((config.buffer_seconds - 15.0).abs() < 1e-9);
        assert!(config.extract_clips);
        assert_eq!(config.mask_dilate, 20);
    }
}
