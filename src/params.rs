//! Detection parameters, sensitivity presets and runtime updates.
//!
//! `DetectionParams` is a plain value: the engine keeps the live copy
//! behind a short-held mutex and readers clone it per frame pair, so an
//! update from the control surface becomes visible by the next frame.
//!
//! Runtime updates arrive as a `ParamsPatch` (partial, wide-typed) and are
//! clamped to the documented ranges instead of being rejected; the caller
//! gets the effective values back through the stats snapshot.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

/// Thresholds and geometric/kinematic bounds for the detector.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct DetectionParams {
    /// Minimum per-pixel |delta| in the motion map.
    pub diff_threshold: u8,
    /// Per-contour mean brightness gate.
    pub min_brightness: u8,
    /// Lowered brightness gate while at least one track is active, so a
    /// fading tail keeps feeding its track.
    pub min_brightness_tracking: u8,
    /// Accepted trajectory span in source pixels.
    pub min_length: u32,
    pub max_length: u32,
    /// Accepted trajectory duration in seconds.
    pub min_duration: f64,
    pub max_duration: f64,
    /// Minimum mean speed in px/s.
    pub min_speed: f64,
    /// PCA straightness floor, 0..=1.
    pub min_linearity: f64,
    /// Contour area bounds in px^2.
    pub min_area: u32,
    pub max_area: u32,
    /// Tracker association gates.
    pub max_gap_time: f64,
    pub max_distance: f64,
    /// Merger gates.
    pub merge_max_gap_time: f64,
    pub merge_max_distance: f64,
    pub merge_max_speed_ratio: f64,
    /// Spatial exclusion margins (fractions of the frame).
    pub exclude_bottom_ratio: f64,
    pub exclude_edge_ratio: f64,
    /// Nuisance filter gates.
    pub nuisance_overlap_threshold: f64,
    pub nuisance_path_overlap_threshold: f64,
    pub small_area_threshold: u32,
    /// Anti-stationary gates.
    pub min_track_points: usize,
    pub max_stationary_ratio: f64,
}

impl Default for DetectionParams {
    fn default() -> Self {
        Self {
            diff_threshold: 30,
            min_brightness: 200,
            min_brightness_tracking: 200,
            min_length: 20,
            max_length: 5000,
            min_duration: 0.1,
            max_duration: 10.0,
            min_speed: 50.0,
            min_linearity: 0.7,
            min_area: 5,
            max_area: 10_000,
            max_gap_time: 2.0,
            max_distance: 80.0,
            merge_max_gap_time: 1.5,
            merge_max_distance: 80.0,
            merge_max_speed_ratio: 0.5,
            exclude_bottom_ratio: 1.0 / 16.0,
            exclude_edge_ratio: 0.0,
            nuisance_overlap_threshold: 0.60,
            nuisance_path_overlap_threshold: 0.70,
            small_area_threshold: 40,
            min_track_points: 4,
            max_stationary_ratio: 0.40,
        }
    }
}

fn tracking_brightness(min_brightness: u8) -> u8 {
    ((min_brightness as f64 * 0.8) as u8).max(1)
}

/// Detection sensitivity presets. Each adjusts a documented subset of the
/// parameters; `Fireball` widens duration and loosens speed/linearity to
/// keep long, slow, very bright events.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Sensitivity {
    Low,
    Medium,
    High,
    Fireball,
}

impl Sensitivity {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "fireball" => Ok(Self::Fireball),
            other => Err(anyhow!(
                "unsupported sensitivity '{}'; expected 'low', 'medium', 'high', or 'fireball'",
                other
            )),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Fireball => "fireball",
        }
    }

    /// Overwrite the preset-controlled fields of `params`.
    pub fn apply_to(&self, params: &mut DetectionParams) {
        let (diff, brightness, max_duration, min_speed, min_linearity) = match self {
            Self::Low => (40, 220, 12.0, 50.0, 0.7),
            Self::Medium => (30, 200, 12.0, 50.0, 0.7),
            Self::High => (20, 180, 12.0, 50.0, 0.7),
            Self::Fireball => (15, 150, 20.0, 20.0, 0.6),
        };
        params.diff_threshold = diff;
        params.min_brightness = brightness;
        params.max_duration = max_duration;
        params.min_speed = min_speed;
        params.min_linearity = min_linearity;
        params.min_brightness_tracking = tracking_brightness(brightness);
    }
}

impl Default for Sensitivity {
    fn default() -> Self {
        Self::Medium
    }
}

macro_rules! clamp_float {
    ($params:expr, $patch:expr, $( ($field:ident, $lo:expr, $hi:expr) ),+ $(,)?) => {
        $(
            if let Some(value) = $patch.$field {
                $params.$field = value.clamp($lo, $hi);
            }
        )+
    };
}

macro_rules! clamp_int {
    ($params:expr, $patch:expr, $ty:ty, $( ($field:ident, $lo:expr, $hi:expr) ),+ $(,)?) => {
        $(
            if let Some(value) = $patch.$field {
                $params.$field = value.clamp($lo, $hi) as $ty;
            }
        )+
    };
}

/// Partial parameter update. Fields are wide-typed so out-of-range inputs
/// deserialize and clamp rather than fail.
///
/// Clamp ranges: `diff_threshold`/`min_brightness`/`min_brightness_tracking`
/// 1..=255; `min_length` 1..=20000; `max_length` 1..=50000; `min_area`
/// 1..=100000; `max_area`/`small_area_threshold` 1..=1000000;
/// `min_track_points` 1..=1000; durations 0.01..=120 s; gaps 0..=60 s;
/// distances 1..=5000 px; `min_speed` 0..=10000 px/s; ratios 0..=1 (except
/// `merge_max_speed_ratio` 0..=10 and the exclusion margins 0..=0.5).
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ParamsPatch {
    pub sensitivity: Option<String>,
    pub diff_threshold: Option<i64>,
    pub min_brightness: Option<i64>,
    pub min_brightness_tracking: Option<i64>,
    pub min_length: Option<i64>,
    pub max_length: Option<i64>,
    pub min_duration: Option<f64>,
    pub max_duration: Option<f64>,
    pub min_speed: Option<f64>,
    pub min_linearity: Option<f64>,
    pub min_area: Option<i64>,
    pub max_area: Option<i64>,
    pub max_gap_time: Option<f64>,
    pub max_distance: Option<f64>,
    pub merge_max_gap_time: Option<f64>,
    pub merge_max_distance: Option<f64>,
    pub merge_max_speed_ratio: Option<f64>,
    #[serde(alias = "exclude_bottom")]
    pub exclude_bottom_ratio: Option<f64>,
    pub exclude_edge_ratio: Option<f64>,
    pub nuisance_overlap_threshold: Option<f64>,
    pub nuisance_path_overlap_threshold: Option<f64>,
    pub small_area_threshold: Option<i64>,
    pub min_track_points: Option<i64>,
    pub max_stationary_ratio: Option<f64>,
}

impl ParamsPatch {
    /// Apply to `params`: preset first, explicit overrides second (explicit
    /// values win over the preset). Returns the sensitivity that was
    /// applied, if any.
    pub fn apply(&self, params: &mut DetectionParams) -> Result<Option<Sensitivity>> {
        let sensitivity = match &self.sensitivity {
            Some(raw) => {
                let s = Sensitivity::parse(raw)?;
                s.apply_to(params);
                Some(s)
            }
            None => None,
        };

        clamp_float!(
            params, self,
            (min_duration, 0.01, 120.0),
            (max_duration, 0.01, 120.0),
            (min_speed, 0.0, 10_000.0),
            (min_linearity, 0.0, 1.0),
            (max_gap_time, 0.0, 60.0),
            (max_distance, 1.0, 5000.0),
            (merge_max_gap_time, 0.0, 60.0),
            (merge_max_distance, 1.0, 5000.0),
            (merge_max_speed_ratio, 0.0, 10.0),
            (exclude_bottom_ratio, 0.0, 0.5),
            (exclude_edge_ratio, 0.0, 0.5),
            (nuisance_overlap_threshold, 0.0, 1.0),
            (nuisance_path_overlap_threshold, 0.0, 1.0),
            (max_stationary_ratio, 0.0, 1.0),
        );

        clamp_int!(
            params, self, u8,
            (diff_threshold, 1, 255),
            (min_brightness, 1, 255),
            (min_brightness_tracking, 1, 255),
        );
        clamp_int!(
            params, self, u32,
            (min_length, 1, 20_000),
            (max_length, 1, 50_000),
            (min_area, 1, 100_000),
            (max_area, 1, 1_000_000),
            (small_area_threshold, 1, 1_000_000),
        );
        clamp_int!(params, self, usize, (min_track_points, 1, 1000));

        // A brightness change without an explicit tracking gate re-derives
        // the tracking gate at 0.8x.
        if self.min_brightness.is_some() && self.min_brightness_tracking.is_none() {
            params.min_brightness_tracking = tracking_brightness(params.min_brightness);
        }

        Ok(sensitivity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fireball_preset_widens_bounds() {
        let mut params = DetectionParams::default();
        Sensitivity::Fireball.apply_to(&mut params);
        assert_eq!(params.diff_threshold, 15);
        assert_eq!(params.min_brightness, 150);
        assert_eq!(params.min_brightness_tracking, 120);
        assert!((params.max_duration - 20.0).abs() < 1e-9);
        assert!((params.min_speed - 20.0).abs() < 1e-9);
        assert!((params.min_linearity - 0.6).abs() < 1e-9);
    }

    #[test]
    fn patch_clamps_out_of_range_values() {
        let mut params = DetectionParams::default();
        let patch: ParamsPatch =
            serde_json::from_str(r#"{"diff_threshold": 9999, "min_linearity": 3.5}"#).unwrap();
        patch.apply(&mut params).unwrap();
        assert_eq!(params.diff_threshold, 255);
        assert!((params.min_linearity - 1.0).abs() < 1e-9);
    }

    #[test]
    fn patch_is_idempotent() {
        let mut a = DetectionParams::default();
        let patch: ParamsPatch = serde_json::from_str(
            r#"{"sensitivity": "high", "min_speed": 42.0, "min_brightness": 190}"#,
        )
        .unwrap();
        patch.apply(&mut a).unwrap();
        let first = a;
        patch.apply(&mut a).unwrap();
        assert_eq!(a, first);
    }

    #[test]
    fn explicit_override_wins_over_preset() {
        let mut params = DetectionParams::default();
        let patch: ParamsPatch =
            serde_json::from_str(r#"{"sensitivity": "fireball", "min_speed": 77.0}"#).unwrap();
        let applied = patch.apply(&mut params).unwrap();
        assert_eq!(applied, Some(Sensitivity::Fireball));
        assert!((params.min_speed - 77.0).abs() < 1e-9);
        // Untouched preset fields keep the preset values.
        assert_eq!(params.min_brightness, 150);
    }

    #[test]
    fn brightness_update_rederives_tracking_gate() {
        let mut params = DetectionParams::default();
        let patch: ParamsPatch = serde_json::from_str(r#"{"min_brightness": 100}"#).unwrap();
        patch.apply(&mut params).unwrap();
        assert_eq!(params.min_brightness_tracking, 80);

        let patch: ParamsPatch =
            serde_json::from_str(r#"{"min_brightness": 100, "min_brightness_tracking": 90}"#)
                .unwrap();
        patch.apply(&mut params).unwrap();
        assert_eq!(params.min_brightness_tracking, 90);
    }

    #[test]
    fn unknown_sensitivity_is_an_error() {
        let mut params = DetectionParams::default();
        let patch: ParamsPatch =
            serde_json::from_str(r#"{"sensitivity": "ultra"}"#).unwrap();
        assert!(patch.apply(&mut params).is_err());
    }

    #[test]
    fn exclude_bottom_alias_matches_control_payloads() {
        let mut params = DetectionParams::default();
        let patch: ParamsPatch = serde_json::from_str(r#"{"exclude_bottom": 0.25}"#).unwrap();
        patch.apply(&mut params).unwrap();
        assert!((params.exclude_bottom_ratio - 0.25).abs() < 1e-9);
    }
}
