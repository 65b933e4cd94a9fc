//! Synthetic frame source for development and tests.
//!
//! `stub://` URLs avoid needing a live camera: the capture produces a
//! night-sky background with a bright diagonal streak every few seconds,
//! paced at the configured frame rate. `stub://1280x720@25` selects the
//! geometry; anything unparseable falls back to 640x480 at 30 fps.

use std::time::{Duration, Instant};

use anyhow::Result;

use crate::imops::BgrImage;

use super::Capture;

const BACKGROUND_LEVEL: u8 = 20;
const STREAK_LEVEL: u8 = 220;
const STREAK_FRAMES: u64 = 6;
const STREAK_PERIOD: u64 = 300;

pub struct StubCapture {
    width: u32,
    height: u32,
    fps: f64,
    frame_index: u64,
    next_frame_at: Option<Instant>,
}

impl StubCapture {
    pub fn new(width: u32, height: u32, fps: f64) -> Self {
        Self {
            width,
            height,
            fps,
            frame_index: 0,
            next_frame_at: None,
        }
    }

    /// Parse a `stub://WxH@fps` URL; unparseable geometry falls back to
    /// the defaults.
    pub fn from_url(url: &str) -> Result<Self> {
        let rest = url.trim_start_matches("stub://");
        if let Some((width, height, fps)) = parse_geometry(rest) {
            return Ok(Self::new(width, height, fps));
        }
        Ok(Self::new(640, 480, 30.0))
    }

    fn render(&self, index: u64) -> BgrImage {
        let mut img = BgrImage::new(self.width, self.height);
        img.data.fill(BACKGROUND_LEVEL);

        // One fixed star, useful for exercising the stationary filter.
        let (sx, sy) = (self.width / 3, self.height / 4);
        img.put(sx, sy, (230, 230, 230));

        // A diagonal streak every STREAK_PERIOD frames.
        let phase = index % STREAK_PERIOD;
        if phase < STREAK_FRAMES {
            let f = phase as f64 / (STREAK_FRAMES - 1) as f64;
            let x0 = (self.width as f64 * 0.1 + self.width as f64 * 0.8 * f) as u32;
            let y0 = (self.height as f64 * 0.1 + self.height as f64 * 0.8 * f) as u32;
            for dy in 0..4u32 {
                for dx in 0..4u32 {
                    let (x, y) = (x0 + dx, y0 + dy);
                    if x < self.width && y < self.height {
                        img.put(x, y, (STREAK_LEVEL, STREAK_LEVEL, STREAK_LEVEL));
                    }
                }
            }
        }
        img
    }
}

impl Capture for StubCapture {
    fn frame_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn fps(&self) -> f64 {
        self.fps
    }

    fn read(&mut self) -> Result<BgrImage> {
        // Pace output at the configured frame rate.
        let interval = Duration::from_secs_f64(1.0 / self.fps.max(1.0));
        let now = Instant::now();
        let due = *self.next_frame_at.get_or_insert(now);
        if due > now {
            std::thread::sleep(due - now);
        }
        self.next_frame_at = Some(due.max(now) + interval);

        let frame = self.render(self.frame_index);
        self.frame_index += 1;
        Ok(frame)
    }
}

fn parse_geometry(raw: &str) -> Option<(u32, u32, f64)> {
    let (size, fps) = match raw.split_once('@') {
        Some((size, fps)) => (size, fps.parse::<f64>().ok()?),
        None => (raw, 30.0),
    };
    let (w, h) = size.split_once('x')?;
    let width = w.parse::<u32>().ok()?;
    let height = h.parse::<u32>().ok()?;
    if width == 0 || height == 0 || !(1.0..=120.0).contains(&fps) {
        return None;
    }
    Some((width, height, fps))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_geometry_parses() {
        let capture = StubCapture::from_url("stub://320x240@15").unwrap();
        assert_eq!(capture.frame_size(), (320, 240));
        assert_eq!(capture.fps(), 15.0);
    }

    #[test]
    fn unparseable_geometry_falls_back_to_defaults() {
        let capture = StubCapture::from_url("stub://front-camera").unwrap();
        assert_eq!(capture.frame_size(), (640, 480));
        assert_eq!(capture.fps(), 30.0);
    }

    #[test]
    fn streak_frames_contain_bright_pixels() {
        let capture = StubCapture::new(100, 100, 30.0);
        let frame = capture.render(2);
        assert!(frame.data.iter().any(|&v| v == STREAK_LEVEL));
        let quiet = capture.render(100);
        assert!(!quiet.data.iter().any(|&v| v == STREAK_LEVEL));
    }
}
