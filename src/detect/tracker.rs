//! Multi-object tracking over per-frame observations.
//!
//! Tracks are extended by gated nearest-neighbor association: the distance
//! to an observation is the smaller of the raw distance from the last
//! point and the distance from a constant-velocity prediction across the
//! elapsed gap. A track whose gap exceeds `max_gap_time` is finalized
//! through the acceptance chain in `evaluate`.
//!
//! The tracker is private to the detector thread; frames arrive in FIFO
//! order, so track points are appended in strictly increasing time.

use std::collections::BTreeMap;

use log::debug;

use crate::detect::evaluate::{evaluate_track, TrackPoint};
use crate::detect::motion::Observation;
use crate::event::MeteorEvent;
use crate::imops::GrayImage;
use crate::params::DetectionParams;

pub struct Tracker {
    active: BTreeMap<u64, Vec<TrackPoint>>,
    next_track_id: u64,
}

impl Default for Tracker {
    fn default() -> Self {
        Self::new()
    }
}

impl Tracker {
    pub fn new() -> Self {
        Self {
            active: BTreeMap::new(),
            next_track_id: 0,
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Polyline copies of the active tracks, for preview drawing.
    pub fn track_polylines(&self) -> Vec<Vec<(i32, i32)>> {
        self.active
            .values()
            .map(|points| points.iter().map(|p| (p.x, p.y)).collect())
            .collect()
    }

    /// Feed one frame's observations. Returns the events produced by
    /// tracks that finalized on this call.
    pub fn update(
        &mut self,
        observations: &[Observation],
        timestamp: f64,
        params: &DetectionParams,
        nuisance_mask: Option<&GrayImage>,
        process_scale: f64,
    ) -> Vec<MeteorEvent> {
        let mut used = vec![false; observations.len()];
        let mut expired: Vec<u64> = Vec::new();

        for (&track_id, points) in self.active.iter_mut() {
            let last = match points.last() {
                Some(p) => *p,
                None => continue,
            };
            let gap = timestamp - last.t;
            if gap > params.max_gap_time {
                expired.push(track_id);
                continue;
            }

            let mut best: Option<(usize, f64)> = None;
            for (i, obs) in observations.iter().enumerate() {
                if used[i] {
                    continue;
                }
                let raw = dist(obs.x, obs.y, last.x, last.y);
                let mut candidate = raw;
                if points.len() >= 2 {
                    let prev = points[points.len() - 2];
                    let dt = last.t - prev.t;
                    if dt > 0.0 {
                        let vx = (last.x - prev.x) as f64 / dt;
                        let vy = (last.y - prev.y) as f64 / dt;
                        let pred_x = last.x as f64 + vx * gap;
                        let pred_y = last.y as f64 + vy * gap;
                        let predicted =
                            (obs.x as f64 - pred_x).hypot(obs.y as f64 - pred_y);
                        candidate = raw.min(predicted);
                    }
                }
                if candidate < params.max_distance
                    && best.map(|(_, d)| candidate < d).unwrap_or(true)
                {
                    best = Some((i, candidate));
                }
            }

            if let Some((i, _)) = best {
                let obs = &observations[i];
                points.push(TrackPoint {
                    t: timestamp,
                    x: obs.x,
                    y: obs.y,
                    brightness: obs.brightness,
                });
                used[i] = true;
            }
        }

        let mut events = Vec::new();
        for track_id in expired {
            if let Some(event) = self.finalize(track_id, params, nuisance_mask, process_scale) {
                events.push(event);
            }
        }

        for (i, obs) in observations.iter().enumerate() {
            if !used[i] {
                self.active.insert(
                    self.next_track_id,
                    vec![TrackPoint {
                        t: timestamp,
                        x: obs.x,
                        y: obs.y,
                        brightness: obs.brightness,
                    }],
                );
                self.next_track_id += 1;
            }
        }

        events
    }

    /// Finalize every active track, e.g. at shutdown.
    pub fn finalize_all(
        &mut self,
        params: &DetectionParams,
        nuisance_mask: Option<&GrayImage>,
        process_scale: f64,
    ) -> Vec<MeteorEvent> {
        let ids: Vec<u64> = self.active.keys().copied().collect();
        ids.into_iter()
            .filter_map(|id| self.finalize(id, params, nuisance_mask, process_scale))
            .collect()
    }

    fn finalize(
        &mut self,
        track_id: u64,
        params: &DetectionParams,
        nuisance_mask: Option<&GrayImage>,
        process_scale: f64,
    ) -> Option<MeteorEvent> {
        let points = self.active.remove(&track_id)?;
        match evaluate_track(&points, params, nuisance_mask, process_scale) {
            Ok(event) => Some(event),
            Err(rejection) => {
                debug!("track {} {}", track_id, rejection);
                None
            }
        }
    }
}

fn dist(x0: i32, y0: i32, x1: i32, y1: i32) -> f64 {
    ((x0 - x1) as f64).hypot((y0 - y1) as f64)
}
