//! Frame types and the retrospective ring buffer.
//!
//! - `Frame`: a timestamped BGR frame as produced by the stream reader.
//! - `RingBuffer`: the most recent N seconds of raw frames, answering
//!   time-range queries for clip extraction after an event fires.
//! - `FrameSlot`: the shared "current display frame" read by the control
//!   surface for MJPEG streaming and snapshots.
//!
//! The ring buffer is written by the detector thread and read by the
//! evidence writer; a single mutex around the deque is sufficient at the
//! frame rates involved. Returned frames are independent copies so callers
//! may hold them past eviction.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::imops::BgrImage;

/// A timestamped frame. `timestamp` is seconds since the first successful
/// connection of the stream reader (monotonic across reconnects).
#[derive(Clone, Debug)]
pub struct Frame {
    /// Monotonically increasing capture index.
    pub index: u64,
    pub timestamp: f64,
    pub image: BgrImage,
}

/// Sliding window of recent frames, indexed by stream time.
pub struct RingBuffer {
    inner: Mutex<VecDeque<(f64, BgrImage)>>,
    max_frames: usize,
}

impl RingBuffer {
    /// Capacity is `ceil(max_seconds * fps)` frames.
    pub fn new(max_seconds: f64, fps: f64) -> Self {
        let max_frames = (max_seconds * fps).ceil().max(1.0) as usize;
        Self {
            inner: Mutex::new(VecDeque::with_capacity(max_frames)),
            max_frames,
        }
    }

    pub fn capacity(&self) -> usize {
        self.max_frames
    }

    /// Store a copy of `frame`, evicting the oldest entry when full.
    pub fn add(&self, timestamp: f64, frame: &BgrImage) {
        let mut buf = self.inner.lock().expect("ring buffer lock");
        while buf.len() >= self.max_frames {
            buf.pop_front();
        }
        buf.push_back((timestamp, frame.clone()));
    }

    /// All stored frames with `start_time <= t <= end_time`, in time order.
    pub fn get_range(&self, start_time: f64, end_time: f64) -> Vec<(f64, BgrImage)> {
        let buf = self.inner.lock().expect("ring buffer lock");
        buf.iter()
            .filter(|(t, _)| *t >= start_time && *t <= end_time)
            .map(|(t, f)| (*t, f.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("ring buffer lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Shared slot holding the latest annotated display frame.
#[derive(Default)]
pub struct FrameSlot {
    inner: Mutex<Option<BgrImage>>,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, frame: BgrImage) {
        *self.inner.lock().expect("frame slot lock") = Some(frame);
    }

    /// Copy of the current frame, if any has been produced yet.
    pub fn snapshot(&self) -> Option<BgrImage> {
        self.inner.lock().expect("frame slot lock").clone()
    }
}
