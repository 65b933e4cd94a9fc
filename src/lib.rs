//! meteor-watch
//!
//! Real-time meteor detection from live RTSP camera streams. One process
//! runs one camera engine; a fleet of them feeds the dashboard.
//!
//! # Pipeline
//!
//! ```text
//! Stream Reader -> Ring Buffer
//!               -> Motion Extractor -> Tracker -> Evaluator -> Merger
//!                                                           -> Evidence Writer
//! ```
//!
//! - `ingest`: RTSP acquisition on its own thread, bounded drop-oldest
//!   frame queue, reconnect with fixed delay.
//! - `frame`: ring buffer for retrospective clip extraction, shared
//!   current-frame slots.
//! - `detect`: frame differencing, gated nearest-neighbor tracking,
//!   candidate acceptance, event merging.
//! - `mask`: live-updatable exclusion/nuisance masks and sky-based
//!   synthesis.
//! - `writer` / `media`: video clips, brighten-max composites, JSONL log.
//! - `engine`: wires the stages together per camera.
//! - `api`: thin per-camera HTTP control surface.

pub mod api;
pub mod config;
pub mod detect;
pub mod engine;
pub mod event;
pub mod frame;
pub mod imops;
pub mod ingest;
pub mod mask;
pub mod media;
pub mod params;
pub mod writer;

pub use engine::{Engine, EngineConfig, EngineHandle, StatsSnapshot};
pub use event::{EventRecord, MeteorEvent};
pub use frame::{Frame, FrameSlot, RingBuffer};
pub use ingest::{sanitize_fps, CaptureBackend, StreamReader};
pub use mask::MaskStore;
pub use params::{DetectionParams, ParamsPatch, Sensitivity};
