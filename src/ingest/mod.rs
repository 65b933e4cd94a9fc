//! Stream acquisition.
//!
//! A `Capture` backend owns the actual video connection and decodes one
//! frame at a time. `StreamReader` runs a capture on its own thread,
//! timestamps frames against the first successful connection (so event
//! times stay comparable across brief outages), pushes them into a small
//! bounded queue with a drop-oldest policy, and reconnects with a fixed
//! delay after sustained read failures.
//!
//! Backends:
//! - `stub://` URLs produce synthetic frames (dev/test builds only);
//! - real RTSP URLs decode via ffmpeg (feature `rtsp-ffmpeg`).

#[cfg(feature = "rtsp-ffmpeg")]
pub(crate) mod ffmpeg;
pub mod stub;

pub use stub::StubCapture;

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::Result;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, TrySendError};
use log::{info, warn};

use crate::frame::Frame;
use crate::imops::BgrImage;

/// Frames queued between the reader thread and the detector. When the
/// queue is full the oldest frame is discarded to keep latency low.
const QUEUE_CAPACITY: usize = 30;

/// Consecutive read failures before the connection is considered dead.
const MAX_CONSECUTIVE_FAILURES: u32 = 30;

/// Normalize a reported FPS to the practical range; cameras frequently
/// report 0, NaN or bogus values over RTSP.
pub fn sanitize_fps(value: f64, default: f64) -> f64 {
    if !value.is_finite() || !(1.0..=120.0).contains(&value) {
        return default;
    }
    value
}

/// Estimate effective FPS from the median inter-frame delta of a slice of
/// timestamped frames, falling back to `fallback_fps`.
pub fn estimate_fps_from_frames(timestamps: &[f64], fallback_fps: f64) -> f64 {
    let fallback = sanitize_fps(fallback_fps, 30.0);
    if timestamps.len() < 2 {
        return fallback;
    }
    let mut deltas: Vec<f64> = timestamps
        .windows(2)
        .map(|w| w[1] - w[0])
        .filter(|dt| *dt > 0.0)
        .collect();
    if deltas.is_empty() {
        return fallback;
    }
    deltas.sort_by(|a, b| a.partial_cmp(b).expect("finite deltas"));
    let mid = deltas.len() / 2;
    let median = if deltas.len() % 2 == 0 {
        (deltas[mid - 1] + deltas[mid]) / 2.0
    } else {
        deltas[mid]
    };
    if median <= 0.0 {
        return fallback;
    }
    sanitize_fps(1.0 / median, fallback)
}

/// Errors a reader consumer must distinguish.
#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("initial connection to '{url}' timed out")]
    ConnectTimeout { url: String },
    #[error("stream reader stopped")]
    StreamClosed,
}

/// A video source producing decoded BGR frames.
pub trait Capture: Send {
    fn frame_size(&self) -> (u32, u32);
    /// Raw FPS as reported by the source; not yet sanitized.
    fn fps(&self) -> f64;
    /// Decode the next frame. Blocking; an error is one failed read, not
    /// necessarily a dead stream.
    fn read(&mut self) -> Result<BgrImage>;
}

/// Preferred capture backend, mirroring the config surface.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CaptureBackend {
    #[default]
    Auto,
    Ffmpeg,
}

impl CaptureBackend {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "ffmpeg" => Ok(Self::Ffmpeg),
            other => Err(anyhow::anyhow!(
                "unsupported capture backend '{}'; expected 'auto' or 'ffmpeg'",
                other
            )),
        }
    }
}

/// Open a capture for `url` with the preferred backend.
pub fn open_capture(url: &str, backend: CaptureBackend) -> Result<Box<dyn Capture>> {
    if url.starts_with("stub://") {
        return Ok(Box::new(StubCapture::from_url(url)?));
    }
    match backend {
        CaptureBackend::Auto | CaptureBackend::Ffmpeg => {
            #[cfg(feature = "rtsp-ffmpeg")]
            {
                Ok(Box::new(ffmpeg::FfmpegCapture::open(url)?))
            }
            #[cfg(not(feature = "rtsp-ffmpeg"))]
            {
                anyhow::bail!(
                    "no RTSP backend compiled in; rebuild with the 'rtsp-ffmpeg' feature \
                     (url: {})",
                    url
                )
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct ReaderOptions {
    pub reconnect_delay: Duration,
    pub connect_timeout: Duration,
    pub queue_capacity: usize,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            queue_capacity: QUEUE_CAPACITY,
        }
    }
}

#[derive(Debug)]
struct ReaderShared {
    stopped: AtomicBool,
    connected: AtomicBool,
    width: AtomicU32,
    height: AtomicU32,
    fps_bits: AtomicU64,
    dropped_frames: AtomicU64,
}

impl ReaderShared {
    fn new() -> Self {
        Self {
            stopped: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            width: AtomicU32::new(0),
            height: AtomicU32::new(0),
            fps_bits: AtomicU64::new(30.0_f64.to_bits()),
            dropped_frames: AtomicU64::new(0),
        }
    }
}

/// Owns the capture thread and the frame queue.
#[derive(Debug)]
pub struct StreamReader {
    rx: Receiver<Frame>,
    shared: Arc<ReaderShared>,
    handle: Option<JoinHandle<()>>,
}

impl StreamReader {
    /// Connect to `url` and start the reader thread. Fails with
    /// `ReadError::ConnectTimeout` when the first connection does not come
    /// up within the configured limit.
    pub fn connect(url: &str, backend: CaptureBackend, opts: ReaderOptions) -> Result<Self> {
        let url_owned = url.to_string();
        Self::spawn_with(
            move || open_capture(&url_owned, backend),
            url.to_string(),
            opts,
        )
    }

    /// Start the reader over an arbitrary capture factory. The factory is
    /// invoked for the initial connection and on every reconnect.
    pub fn spawn_with<F>(mut factory: F, url: String, opts: ReaderOptions) -> Result<Self>
    where
        F: FnMut() -> Result<Box<dyn Capture>> + Send + 'static,
    {
        let (tx, rx) = bounded::<Frame>(opts.queue_capacity.max(1));
        let evict_rx = rx.clone();
        let shared = Arc::new(ReaderShared::new());
        let thread_shared = shared.clone();
        let reconnect_delay = opts.reconnect_delay;
        let thread_url = url.clone();

        let handle = std::thread::spawn(move || {
            let shared = thread_shared;
            // The timestamp base and frame index survive reconnects.
            let mut start_time: Option<Instant> = None;
            let mut next_index: u64 = 0;

            while !shared.stopped.load(Ordering::SeqCst) {
                let mut capture = match factory() {
                    Ok(capture) => capture,
                    Err(err) => {
                        warn!("connection to {} failed: {:#}", thread_url, err);
                        sleep_interruptible(&shared, reconnect_delay);
                        continue;
                    }
                };

                let (width, height) = capture.frame_size();
                let fps = sanitize_fps(capture.fps(), 30.0);
                shared.width.store(width, Ordering::SeqCst);
                shared.height.store(height, Ordering::SeqCst);
                shared.fps_bits.store(fps.to_bits(), Ordering::SeqCst);
                let start = *start_time.get_or_insert_with(Instant::now);
                shared.connected.store(true, Ordering::SeqCst);
                info!("connected: {}x{} @ {:.1} fps", width, height, fps);

                let mut consecutive_failures = 0u32;
                while !shared.stopped.load(Ordering::SeqCst) {
                    match capture.read() {
                        Ok(image) => {
                            consecutive_failures = 0;
                            let mut item = Frame {
                                index: next_index,
                                timestamp: start.elapsed().as_secs_f64(),
                                image,
                            };
                            next_index += 1;
                            if let Err(TrySendError::Full(returned)) = tx.try_send(item) {
                                // Drop the oldest queued frame to keep
                                // end-to-end latency bounded.
                                let _ = evict_rx.try_recv();
                                shared.dropped_frames.fetch_add(1, Ordering::Relaxed);
                                item = returned;
                                let _ = tx.try_send(item);
                            }
                        }
                        Err(_) => {
                            consecutive_failures += 1;
                            if consecutive_failures > MAX_CONSECUTIVE_FAILURES {
                                warn!("stream interrupted, dropping connection");
                                break;
                            }
                            std::thread::sleep(Duration::from_millis(10));
                        }
                    }
                }

                drop(capture);
                shared.connected.store(false, Ordering::SeqCst);
                if !shared.stopped.load(Ordering::SeqCst) {
                    info!("reconnecting in {:.0}s", reconnect_delay.as_secs_f64());
                    sleep_interruptible(&shared, reconnect_delay);
                }
            }
        });

        let reader = Self {
            rx,
            shared,
            handle: Some(handle),
        };

        // Wait for the first connection before handing the reader out.
        let deadline = Instant::now() + opts.connect_timeout;
        while !reader.shared.connected.load(Ordering::SeqCst) {
            if Instant::now() >= deadline {
                reader.shared.stopped.store(true, Ordering::SeqCst);
                return Err(ReadError::ConnectTimeout { url }.into());
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        Ok(reader)
    }

    /// Pop the next frame. `Ok(None)` means a quiet second went by (the
    /// caller should loop, keeping shutdown responsive); `ReadError::
    /// StreamClosed` means `stop()` was requested.
    pub fn read(&self) -> Result<Option<Frame>, ReadError> {
        if self.shared.stopped.load(Ordering::SeqCst) {
            return Err(ReadError::StreamClosed);
        }
        match self.rx.recv_timeout(Duration::from_secs(1)) {
            Ok(item) => Ok(Some(item)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(ReadError::StreamClosed),
        }
    }

    pub fn frame_size(&self) -> (u32, u32) {
        (
            self.shared.width.load(Ordering::SeqCst),
            self.shared.height.load(Ordering::SeqCst),
        )
    }

    /// Source FPS, sanitized.
    pub fn fps(&self) -> f64 {
        f64::from_bits(self.shared.fps_bits.load(Ordering::SeqCst))
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    pub fn dropped_frames(&self) -> u64 {
        self.shared.dropped_frames.load(Ordering::Relaxed)
    }

    /// Request shutdown and join the reader thread.
    pub fn stop(&mut self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for StreamReader {
    fn drop(&mut self) {
        self.stop();
    }
}

fn sleep_interruptible(shared: &ReaderShared, total: Duration) {
    let deadline = Instant::now() + total;
    while Instant::now() < deadline && !shared.stopped.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(100));
    }
}
