//! Evidence persistence for finalized events.
//!
//! For each event: slice the ring buffer, write a video clip at the
//! estimated effective FPS, compute a brighten-max composite (annotated
//! and original), and append one line to `detections.jsonl`.
//!
//! Failure policy: a clip that cannot be encoded is logged and skipped;
//! the composites and the JSONL record are still emitted. Nothing here
//! stops the engine.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{info, warn};

use crate::event::MeteorEvent;
use crate::frame::RingBuffer;
use crate::imops::{self, BgrImage};
use crate::ingest::estimate_fps_from_frames;
use crate::media::{self, ClipCodec, ClipWriter};

const CLIP_MARGIN_BEFORE: f64 = 1.0;
const CLIP_MARGIN_AFTER: f64 = 1.0;
const COMPOSITE_AFTER: f64 = 1.0;
const COMPOSITE_QUALITY: u8 = 90;

const TRAJECTORY_COLOR: (u8, u8, u8) = (0, 255, 255);
const START_MARKER_COLOR: (u8, u8, u8) = (0, 255, 0);
const END_MARKER_COLOR: (u8, u8, u8) = (0, 0, 255);

/// Artifacts produced for one event.
#[derive(Debug, Default)]
pub struct SavedArtifacts {
    pub clip: Option<PathBuf>,
    pub composite: Option<PathBuf>,
    pub composite_original: Option<PathBuf>,
}

pub struct EvidenceWriter {
    output_dir: PathBuf,
    source_fps: f64,
    extract_clips: bool,
    codec: Option<ClipCodec>,
}

impl EvidenceWriter {
    /// Probes the clip encoder once. Probe failure is not fatal: clips are
    /// skipped and everything else still flows.
    pub fn new(output_dir: &Path, source_fps: f64, extract_clips: bool) -> Result<Self> {
        std::fs::create_dir_all(output_dir)
            .with_context(|| format!("failed to create output dir {}", output_dir.display()))?;
        let codec = if extract_clips {
            match media::probe_clip_codec() {
                Ok(codec) => {
                    info!("clip encoder: {}", codec.encoder_name());
                    Some(codec)
                }
                Err(err) => {
                    warn!("clip encoder unavailable, clips disabled: {}", err);
                    None
                }
            }
        } else {
            None
        };
        Ok(Self {
            output_dir: output_dir.to_path_buf(),
            source_fps,
            extract_clips,
            codec,
        })
    }

    /// Encoder selected by the probe, for the stats snapshot.
    pub fn chosen_codec(&self) -> Option<&'static str> {
        self.codec.map(|c| c.encoder_name())
    }

    pub fn set_extract_clips(&mut self, extract_clips: bool) {
        self.extract_clips = extract_clips;
    }

    /// Persist one event. Always appends the JSONL record; clip and
    /// composites are dropped individually on failure.
    pub fn persist(&self, event: &MeteorEvent, ring: &RingBuffer) -> Result<SavedArtifacts> {
        let mut artifacts = SavedArtifacts::default();

        let start = (event.start_time - CLIP_MARGIN_BEFORE).max(0.0);
        let end = event.end_time + CLIP_MARGIN_AFTER;
        let frames = ring.get_range(start, end);

        let base_name = format!("meteor_{}", event.timestamp.format("%Y%m%d_%H%M%S"));

        if frames.is_empty() {
            warn!("ring buffer held no frames for event at {:.2}s", event.start_time);
        } else {
            if self.extract_clips {
                match self.write_clip(&base_name, &frames) {
                    Ok(path) => artifacts.clip = path,
                    Err(err) => warn!("clip skipped: {:#}", err),
                }
            }

            let composite_end = (event.end_time + COMPOSITE_AFTER).min(end);
            let event_frames = ring.get_range(event.start_time, composite_end);
            if !event_frames.is_empty() {
                match self.write_composites(&base_name, event, &event_frames) {
                    Ok((annotated, original)) => {
                        artifacts.composite = Some(annotated);
                        artifacts.composite_original = Some(original);
                    }
                    Err(err) => warn!("composite skipped: {:#}", err),
                }
            }
        }

        self.append_record(event)?;

        match &artifacts.clip {
            Some(clip) => info!("saved {}", clip.display()),
            None => info!("saved {}_composite.jpg", base_name),
        }
        Ok(artifacts)
    }

    fn write_clip(
        &self,
        base_name: &str,
        frames: &[(f64, BgrImage)],
    ) -> Result<Option<PathBuf>> {
        let Some(codec) = self.codec else {
            return Ok(None);
        };
        let timestamps: Vec<f64> = frames.iter().map(|(t, _)| *t).collect();
        let clip_fps = estimate_fps_from_frames(&timestamps, self.source_fps);

        let (width, height) = {
            let first = &frames[0].1;
            (first.width, first.height)
        };
        let path = self
            .output_dir
            .join(format!("{}.{}", base_name, codec.extension()));

        let mut writer = ClipWriter::create(&path, codec, clip_fps, (width, height))
            .context("open clip encoder")?;
        for (_, frame) in frames {
            writer.write_frame(frame).context("encode clip frame")?;
        }
        writer.finish().context("finalize clip")?;
        Ok(Some(path))
    }

    fn write_composites(
        &self,
        base_name: &str,
        event: &MeteorEvent,
        frames: &[(f64, BgrImage)],
    ) -> Result<(PathBuf, PathBuf)> {
        let mut composite = frames[0].1.clone();
        for (_, frame) in &frames[1..] {
            imops::per_pixel_max(&mut composite, frame);
        }

        let mut annotated = composite.clone();
        imops::draw_line(
            &mut annotated,
            event.start_point,
            event.end_point,
            TRAJECTORY_COLOR,
            2,
        );
        imops::draw_circle(&mut annotated, event.start_point, 6, START_MARKER_COLOR, 2);
        imops::draw_circle(&mut annotated, event.end_point, 6, END_MARKER_COLOR, 2);

        let annotated_path = self.output_dir.join(format!("{}_composite.jpg", base_name));
        let original_path = self
            .output_dir
            .join(format!("{}_composite_original.jpg", base_name));
        media::save_jpeg(&annotated_path, &annotated, COMPOSITE_QUALITY)?;
        media::save_jpeg(&original_path, &composite, COMPOSITE_QUALITY)?;
        Ok((annotated_path, original_path))
    }

    fn append_record(&self, event: &MeteorEvent) -> Result<()> {
        let record = event.to_record();
        let line = serde_json::to_string(&record)?;
        let log_path = self.output_dir.join("detections.jsonl");
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .with_context(|| format!("failed to open {}", log_path.display()))?;
        writeln!(file, "{}", line)?;
        file.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Local;

    fn event(start: f64, end: f64) -> MeteorEvent {
        MeteorEvent {
            timestamp: Local::now(),
            start_time: start,
            end_time: end,
            start_point: (10, 10),
            end_point: (50, 50),
            peak_brightness: 230.0,
            confidence: 0.8,
        }
    }

    fn filled_ring() -> RingBuffer {
        let ring = RingBuffer::new(20.0, 10.0);
        for i in 0..100 {
            let t = i as f64 * 0.1;
            let mut frame = BgrImage::new(64, 64);
            frame.data.fill(20);
            // One bright flash mid-event.
            if i == 55 {
                frame.put(30, 30, (250, 250, 250));
            }
            ring.add(t, &frame);
        }
        ring
    }

    #[test]
    fn persist_writes_composites_and_jsonl() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let writer = EvidenceWriter::new(dir.path(), 10.0, false)?;
        let ring = filled_ring();

        let artifacts = writer.persist(&event(5.0, 6.0), &ring)?;
        assert!(artifacts.clip.is_none());
        let composite = artifacts.composite.expect("annotated composite");
        let original = artifacts.composite_original.expect("original composite");
        assert!(composite.exists());
        assert!(original.exists());

        let log = std::fs::read_to_string(dir.path().join("detections.jsonl"))?;
        let lines: Vec<&str> = log.lines().collect();
        assert_eq!(lines.len(), 1);
        let parsed: serde_json::Value = serde_json::from_str(lines[0])?;
        assert_eq!(parsed["start_point"], serde_json::json!([10, 10]));
        assert!((parsed["duration"].as_f64().unwrap() - 1.0).abs() < 1e-9);
        Ok(())
    }

    #[test]
    fn composite_is_a_brighten_max() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let writer = EvidenceWriter::new(dir.path(), 10.0, false)?;
        let ring = filled_ring();

        let artifacts = writer.persist(&event(5.0, 6.0), &ring)?;
        let original = artifacts.composite_original.unwrap();
        let img = image::open(&original)?.into_rgb8();
        // The single bright flash must survive into the composite.
        let px = img.get_pixel(30, 30);
        assert!(px.0[0] > 200);
        // Background stays dark.
        let bg = img.get_pixel(5, 60);
        assert!(bg.0[0] < 60);
        Ok(())
    }

    #[test]
    fn empty_slice_still_appends_record() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let writer = EvidenceWriter::new(dir.path(), 10.0, false)?;
        let ring = RingBuffer::new(1.0, 10.0);

        let artifacts = writer.persist(&event(500.0, 501.0), &ring)?;
        assert!(artifacts.clip.is_none());
        assert!(artifacts.composite.is_none());
        let log = std::fs::read_to_string(dir.path().join("detections.jsonl"))?;
        assert_eq!(log.lines().count(), 1);
        Ok(())
    }

    #[test]
    fn records_accumulate_per_event() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let writer = EvidenceWriter::new(dir.path(), 10.0, false)?;
        let ring = filled_ring();
        writer.persist(&event(2.0, 3.0), &ring)?;
        writer.persist(&event(5.0, 6.0), &ring)?;
        let log = std::fs::read_to_string(dir.path().join("detections.jsonl"))?;
        assert_eq!(log.lines().count(), 2);
        Ok(())
    }
}
