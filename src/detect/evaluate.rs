//! Candidate acceptance at track finalization.
//!
//! A finalized track passes through a fixed, ordered list of predicates;
//! the first failing predicate yields a tagged `Rejection` that the caller
//! logs at DEBUG for post-hoc tuning. Passing tracks become `MeteorEvent`s
//! with a confidence score.

use chrono::Local;

use crate::event::MeteorEvent;
use crate::imops::{self, GrayImage};
use crate::params::DetectionParams;

/// One point of a track: stream time, source-frame position, brightness.
#[derive(Clone, Copy, Debug)]
pub struct TrackPoint {
    pub t: f64,
    pub x: i32,
    pub y: i32,
    pub brightness: f64,
}

/// Why a finalized track was not accepted as a candidate.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Rejection {
    MinTrackPoints { points: usize, required: usize },
    Duration { duration: f64 },
    StationaryRatio { ratio: f64, max: f64 },
    NuisancePathOverlap { ratio: f64, max: f64 },
    Length { length: f64 },
    Speed { speed: f64 },
    Linearity { linearity: f64 },
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MinTrackPoints { points, required } => write!(
                f,
                "rejected_by=min_track_points points={} required={}",
                points, required
            ),
            Self::Duration { duration } => {
                write!(f, "rejected_by=duration duration={:.3}", duration)
            }
            Self::StationaryRatio { ratio, max } => write!(
                f,
                "rejected_by=stationary_ratio ratio={:.2} max={:.2}",
                ratio, max
            ),
            Self::NuisancePathOverlap { ratio, max } => write!(
                f,
                "rejected_by=nuisance_path_overlap ratio={:.2} max={:.2}",
                ratio, max
            ),
            Self::Length { length } => write!(f, "rejected_by=length length={:.1}", length),
            Self::Speed { speed } => write!(f, "rejected_by=speed speed={:.1}", speed),
            Self::Linearity { linearity } => {
                write!(f, "rejected_by=linearity linearity={:.2}", linearity)
            }
        }
    }
}

/// Straightness of the point cloud: ratio of the dominant PCA eigenvalue
/// to the eigenvalue sum. 1.0 = perfectly collinear. Fewer than three
/// points are trivially straight.
pub fn linearity(points: &[TrackPoint]) -> f64 {
    let n = points.len();
    if n < 3 {
        return 1.0;
    }
    let nf = n as f64;
    let (mut mean_x, mut mean_y) = (0.0, 0.0);
    for p in points {
        mean_x += p.x as f64;
        mean_y += p.y as f64;
    }
    mean_x /= nf;
    mean_y /= nf;

    // Sample covariance of the centered cloud.
    let (mut sxx, mut sxy, mut syy) = (0.0, 0.0, 0.0);
    for p in points {
        let dx = p.x as f64 - mean_x;
        let dy = p.y as f64 - mean_y;
        sxx += dx * dx;
        sxy += dx * dy;
        syy += dy * dy;
    }
    let denom = nf - 1.0;
    let (sxx, sxy, syy) = (sxx / denom, sxy / denom, syy / denom);

    // Eigenvalues of the symmetric 2x2 covariance matrix.
    let mean = (sxx + syy) / 2.0;
    let det = ((sxx - syy) / 2.0).hypot(sxy);
    let l1 = mean + det;
    let l2 = (mean - det).max(0.0);
    if l1 == 0.0 {
        return 0.0;
    }
    l1 / (l1 + l2 + 1e-10)
}

/// Fraction of consecutive steps shorter than 2 px. A single point is
/// fully stationary by definition.
pub fn stationary_ratio(points: &[TrackPoint]) -> f64 {
    const PX_THRESHOLD: f64 = 2.0;
    if points.len() < 2 {
        return 1.0;
    }
    let steps = points.len() - 1;
    let stationary = points
        .windows(2)
        .filter(|w| {
            let dx = (w[1].x - w[0].x) as f64;
            let dy = (w[1].y - w[0].y) as f64;
            dx.hypot(dy) <= PX_THRESHOLD
        })
        .count();
    stationary as f64 / steps as f64
}

/// Normalizers for the confidence score.
#[derive(Clone, Copy, Debug)]
pub struct ConfidenceNorms {
    pub length_norm: f64,
    pub speed_norm: f64,
    pub duration_norm: f64,
    pub duration_bonus_scale: f64,
    pub duration_bonus_max: f64,
}

/// The realtime detector's normalizers: meteors at streaming frame rates
/// are fast and short, so speed saturates at 500 px/s and duration adds a
/// small bonus only.
pub const REALTIME_NORMS: ConfidenceNorms = ConfidenceNorms {
    length_norm: 100.0,
    speed_norm: 500.0,
    duration_norm: 1.0,
    duration_bonus_scale: 0.1,
    duration_bonus_max: 0.2,
};

/// Weighted confidence in 0..=1.
pub fn confidence(
    length: f64,
    speed: f64,
    linearity: f64,
    brightness: f64,
    duration: f64,
    norms: &ConfidenceNorms,
) -> f64 {
    let length_score = (length / norms.length_norm).min(1.0);
    let speed_score = (speed / norms.speed_norm).min(1.0);
    let brightness_score = (brightness / 255.0).min(1.0);
    let duration_bonus =
        (duration / norms.duration_norm * norms.duration_bonus_scale).min(norms.duration_bonus_max);

    let confidence = length_score * 0.25
        + speed_score * 0.2
        + linearity * 0.25
        + brightness_score * 0.2
        + duration_bonus;
    confidence.min(1.0)
}

/// Run the acceptance chain over a finalized track.
///
/// `nuisance_mask` is at processing resolution while track points are in
/// source coordinates; `process_scale` converts the trajectory back down
/// before rasterizing it against the mask.
pub fn evaluate_track(
    points: &[TrackPoint],
    params: &DetectionParams,
    nuisance_mask: Option<&GrayImage>,
    process_scale: f64,
) -> Result<MeteorEvent, Rejection> {
    if points.len() < params.min_track_points {
        return Err(Rejection::MinTrackPoints {
            points: points.len(),
            required: params.min_track_points,
        });
    }

    // Points are appended in frame order, so the extrema by time are the
    // first and last entries.
    let first = points[0];
    let last = points[points.len() - 1];
    let duration = last.t - first.t;
    if duration < params.min_duration || duration > params.max_duration {
        return Err(Rejection::Duration { duration });
    }

    let ratio = stationary_ratio(points);
    if ratio > params.max_stationary_ratio {
        return Err(Rejection::StationaryRatio {
            ratio,
            max: params.max_stationary_ratio,
        });
    }

    let start_point = (first.x, first.y);
    let end_point = (last.x, last.y);

    if let Some(mask) = nuisance_mask {
        let scale = process_scale;
        let p0 = (
            (start_point.0 as f64 * scale) as i32,
            (start_point.1 as f64 * scale) as i32,
        );
        let p1 = (
            (end_point.0 as f64 * scale) as i32,
            (end_point.1 as f64 * scale) as i32,
        );
        let line = imops::line_pixels(mask.width, mask.height, p0, p1, 2);
        let ratio = imops::overlap_ratio(&line, mask);
        if ratio > params.nuisance_path_overlap_threshold {
            return Err(Rejection::NuisancePathOverlap {
                ratio,
                max: params.nuisance_path_overlap_threshold,
            });
        }
    }

    let length = {
        let dx = (end_point.0 - start_point.0) as f64;
        let dy = (end_point.1 - start_point.1) as f64;
        dx.hypot(dy)
    };
    if length < params.min_length as f64 || length > params.max_length as f64 {
        return Err(Rejection::Length { length });
    }

    let speed = length / duration.max(0.001);
    if speed < params.min_speed {
        return Err(Rejection::Speed { speed });
    }

    let linearity = linearity(points);
    if linearity < params.min_linearity {
        return Err(Rejection::Linearity { linearity });
    }

    let peak_brightness = points.iter().map(|p| p.brightness).fold(0.0, f64::max);
    let confidence = confidence(
        length,
        speed,
        linearity,
        peak_brightness,
        duration,
        &REALTIME_NORMS,
    );

    Ok(MeteorEvent {
        timestamp: Local::now(),
        start_time: first.t,
        end_time: last.t,
        start_point,
        end_point,
        peak_brightness,
        confidence,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imops::GrayImage;

    fn pt(t: f64, x: i32, y: i32, brightness: f64) -> TrackPoint {
        TrackPoint { t, x, y, brightness }
    }

    fn permissive_params() -> DetectionParams {
        DetectionParams {
            min_track_points: 4,
            min_duration: 0.05,
            max_duration: 5.0,
            max_stationary_ratio: 0.95,
            min_length: 1,
            max_length: 500,
            min_speed: 0.1,
            min_linearity: 0.1,
            ..DetectionParams::default()
        }
    }

    #[test]
    fn collinear_points_have_unit_linearity() {
        let points: Vec<_> = (0..6).map(|i| pt(i as f64 * 0.1, 10 + 3 * i, 10 + 3 * i, 220.0)).collect();
        assert!(linearity(&points) > 0.999);
    }

    #[test]
    fn scattered_points_have_low_linearity() {
        let points = vec![
            pt(0.0, 0, 0, 200.0),
            pt(0.1, 10, 0, 200.0),
            pt(0.2, 0, 10, 200.0),
            pt(0.3, 10, 10, 200.0),
            pt(0.4, 5, 5, 200.0),
        ];
        assert!(linearity(&points) < 0.7);
    }

    #[test]
    fn stationary_ratio_counts_short_steps() {
        let points = vec![
            pt(0.0, 50, 50, 200.0),
            pt(0.1, 50, 50, 200.0),
            pt(0.2, 51, 50, 200.0),
            pt(0.3, 51, 50, 200.0),
        ];
        assert!((stationary_ratio(&points) - 1.0).abs() < 1e-9);
        assert!((stationary_ratio(&points[..1]) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn diagonal_track_is_accepted() {
        let points = vec![
            pt(0.0, 10, 10, 220.0),
            pt(0.1, 13, 13, 225.0),
            pt(0.2, 16, 16, 230.0),
            pt(0.3, 19, 19, 235.0),
        ];
        let event = evaluate_track(&points, &permissive_params(), None, 1.0).unwrap();
        assert!(event.length() > 0.0);
        assert_eq!(event.start_point, (10, 10));
        assert_eq!(event.end_point, (19, 19));
        assert!((event.peak_brightness - 235.0).abs() < 1e-9);
    }

    #[test]
    fn stationary_track_is_rejected() {
        let mut params = permissive_params();
        params.max_stationary_ratio = 0.40;
        let points = vec![
            pt(0.0, 50, 50, 200.0),
            pt(0.1, 50, 50, 200.0),
            pt(0.2, 51, 50, 200.0),
            pt(0.3, 51, 50, 200.0),
        ];
        let rejection = evaluate_track(&points, &params, None, 1.0).unwrap_err();
        assert!(matches!(rejection, Rejection::StationaryRatio { .. }));
    }

    #[test]
    fn path_through_nuisance_band_is_rejected() {
        let mut mask = GrayImage::new(120, 120);
        for y in 58..63 {
            for x in 10..110 {
                mask.put(x, y, 255);
            }
        }
        let points = vec![
            pt(0.0, 20, 60, 220.0),
            pt(0.1, 35, 60, 230.0),
            pt(0.2, 50, 60, 240.0),
            pt(0.3, 65, 60, 245.0),
        ];
        let rejection =
            evaluate_track(&points, &permissive_params(), Some(&mask), 1.0).unwrap_err();
        assert!(matches!(rejection, Rejection::NuisancePathOverlap { .. }));
    }

    #[test]
    fn too_few_points_rejected_first() {
        let points = vec![pt(0.0, 0, 0, 200.0), pt(0.1, 10, 10, 200.0)];
        let rejection = evaluate_track(&points, &permissive_params(), None, 1.0).unwrap_err();
        assert_eq!(
            rejection,
            Rejection::MinTrackPoints {
                points: 2,
                required: 4
            }
        );
    }

    #[test]
    fn confidence_is_clipped_to_one() {
        let c = confidence(10_000.0, 10_000.0, 1.0, 255.0, 100.0, &REALTIME_NORMS);
        assert!((c - 1.0).abs() < 1e-9);
        let c = confidence(113.1, 565.0, 1.0, 220.0, 0.17, &REALTIME_NORMS);
        assert!(c > 0.5 && c <= 1.0);
    }

    #[test]
    fn rejection_display_carries_reason_tag() {
        let r = Rejection::Duration { duration: 0.05 };
        assert_eq!(r.to_string(), "rejected_by=duration duration=0.050");
    }
}
