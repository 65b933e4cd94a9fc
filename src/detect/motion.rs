//! Per-frame-pair motion and brightness extraction.
//!
//! Consumes consecutive grayscale frames at processing resolution and
//! produces `Observation`s in source coordinates. Fixed stars survive this
//! stage (they have no inter-frame delta only when perfectly static); the
//! tracker's stationary filter removes the slow drifters.

use log::debug;

use crate::imops::{self, GrayImage};
use crate::params::DetectionParams;

/// A bright moving region in one frame pair.
#[derive(Clone, Copy, Debug)]
pub struct Observation {
    /// Centroid in source-frame pixels.
    pub x: i32,
    pub y: i32,
    /// Region area in processing-resolution px^2.
    pub area: f64,
    /// Mean gray level over the region interior.
    pub brightness: f64,
    /// Overlap with the nuisance mask, when it was evaluated.
    pub nuisance_overlap: f64,
}

pub struct MotionExtractor {
    kernel: Vec<(i32, i32)>,
}

impl Default for MotionExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl MotionExtractor {
    pub fn new() -> Self {
        Self {
            kernel: imops::ellipse_kernel(3),
        }
    }

    /// Extract observations from a frame pair.
    ///
    /// `scale_factor` is the reciprocal of the processing scale and maps
    /// centroids back to source coordinates. In `tracking_mode` the
    /// brightness gate drops to `min_brightness_tracking` so a dimming
    /// tail keeps feeding its track.
    #[allow(clippy::too_many_arguments)]
    pub fn extract(
        &self,
        gray: &GrayImage,
        prev_gray: &GrayImage,
        params: &DetectionParams,
        exclusion_mask: Option<&GrayImage>,
        nuisance_mask: Option<&GrayImage>,
        tracking_mode: bool,
        scale_factor: f64,
    ) -> Vec<Observation> {
        let (width, height) = (gray.width, gray.height);
        let max_y = (height as f64 * (1.0 - params.exclude_bottom_ratio)) as u32;

        let mut thresh = imops::absdiff_threshold(gray, prev_gray, params.diff_threshold);
        imops::zero_rows_from(&mut thresh, max_y.min(height));

        let edge = (width.min(height) as f64 * params.exclude_edge_ratio) as u32;
        if edge > 0 {
            imops::zero_border(&mut thresh, edge);
        }

        if let Some(mask) = exclusion_mask {
            imops::apply_exclusion(&mut thresh, mask);
        }

        let thresh = imops::open(&thresh, &self.kernel);
        let thresh = imops::close(&thresh, &self.kernel);

        let min_brightness = if tracking_mode {
            params.min_brightness_tracking
        } else {
            params.min_brightness
        } as f64;

        let mut observations = Vec::new();
        for component in imops::connected_components(&thresh) {
            let area = component.area as f64;
            if area < params.min_area as f64 || area > params.max_area as f64 {
                continue;
            }

            let cx = component.cx as i32;
            let cy = component.cy as i32;
            if cy as u32 >= max_y {
                continue;
            }

            let brightness = imops::mean_over(gray, &component.pixels);

            let mut nuisance_overlap = 0.0;
            if let Some(mask) = nuisance_mask {
                if area <= params.small_area_threshold as f64 {
                    nuisance_overlap = imops::overlap_ratio(&component.pixels, mask);
                    if nuisance_overlap >= params.nuisance_overlap_threshold {
                        debug!(
                            "rejected_by=nuisance_overlap area={:.1} ratio={:.2}",
                            area, nuisance_overlap
                        );
                        continue;
                    }
                }
            }

            if brightness >= min_brightness {
                observations.push(Observation {
                    x: (cx as f64 * scale_factor) as i32,
                    y: (cy as f64 * scale_factor) as i32,
                    area,
                    brightness,
                    nuisance_overlap,
                });
            }
        }

        observations
    }
}
