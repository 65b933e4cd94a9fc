//! Detected meteor events and their persisted record shape.

use chrono::{DateTime, Local, SecondsFormat};
use serde::Serialize;

/// A finalized meteor event: one accepted candidate, or the union of
/// several temporally-close collinear candidates after merging.
#[derive(Clone, Debug)]
pub struct MeteorEvent {
    /// Wall-clock time the event was finalized.
    pub timestamp: DateTime<Local>,
    /// Stream-relative bounds in seconds.
    pub start_time: f64,
    pub end_time: f64,
    /// Trajectory endpoints in source-frame pixels.
    pub start_point: (i32, i32),
    pub end_point: (i32, i32),
    pub peak_brightness: f64,
    pub confidence: f64,
}

impl MeteorEvent {
    pub fn duration(&self) -> f64 {
        self.end_time - self.start_time
    }

    pub fn length(&self) -> f64 {
        let dx = (self.end_point.0 - self.start_point.0) as f64;
        let dy = (self.end_point.1 - self.start_point.1) as f64;
        dx.hypot(dy)
    }

    /// Mean speed in px/s; duration is floored at 1 ms to stay finite.
    pub fn speed(&self) -> f64 {
        self.length() / self.duration().max(0.001)
    }

    pub fn to_record(&self) -> EventRecord {
        EventRecord {
            timestamp: self
                .timestamp
                .to_rfc3339_opts(SecondsFormat::Millis, false),
            start_time: round3(self.start_time),
            end_time: round3(self.end_time),
            duration: round3(self.duration()),
            start_point: [self.start_point.0, self.start_point.1],
            end_point: [self.end_point.0, self.end_point.1],
            length_pixels: round1(self.length()),
            peak_brightness: round1(self.peak_brightness),
            confidence: round2(self.confidence),
        }
    }
}

/// One line of `detections.jsonl`. Append-only, never mutated.
#[derive(Clone, Debug, Serialize)]
pub struct EventRecord {
    pub timestamp: String,
    pub start_time: f64,
    pub end_time: f64,
    pub duration: f64,
    pub start_point: [i32; 2],
    pub end_point: [i32; 2],
    pub length_pixels: f64,
    pub peak_brightness: f64,
    pub confidence: f64,
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> MeteorEvent {
        MeteorEvent {
            timestamp: Local::now(),
            start_time: 10.0,
            end_time: 10.5,
            start_point: (10, 10),
            end_point: (40, 50),
            peak_brightness: 231.7,
            confidence: 0.876,
        }
    }

    #[test]
    fn derived_quantities() {
        let event = sample_event();
        assert!((event.duration() - 0.5).abs() < 1e-9);
        assert!((event.length() - 50.0).abs() < 1e-9);
        assert!((event.speed() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn record_rounds_fields() {
        let record = sample_event().to_record();
        assert_eq!(record.length_pixels, 50.0);
        assert_eq!(record.peak_brightness, 231.7);
        assert_eq!(record.confidence, 0.88);
        assert_eq!(record.start_point, [10, 10]);
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"length_pixels\":50.0"));
        assert!(json.contains("\"duration\":0.5"));
    }
}
