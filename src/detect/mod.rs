//! The detection pipeline: motion extraction, tracking, candidate
//! acceptance and event merging.

pub mod evaluate;
pub mod merge;
pub mod motion;
pub mod tracker;

pub use evaluate::{Rejection, TrackPoint};
pub use merge::EventMerger;
pub use motion::{MotionExtractor, Observation};
pub use tracker::Tracker;
