//! Exclusion / nuisance masks and their live store.
//!
//! Two mask roles at processing resolution:
//! - **exclusion**: hard zero in the motion map (horizon, rooftops, poles);
//! - **nuisance**: soft penalty for small candidates overlapping known
//!   clutter (antennas, reflection hot-spots).
//!
//! `MaskStore` shares the current masks with the extractor through
//! `Arc` pointers swapped under a short-held lock, so an operator can
//! replace a mask while the pipeline runs; the new mask is seen on the
//! next frame pair.
//!
//! Synthesis identifies sky pixels by HSV range (blue sky plus bright
//! clouds), keeps only sky regions connected to the top edge, then
//! excludes everything else, including every pixel below the lowest sky
//! pixel of each column, which reliably blankets roofs and masts.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};

use crate::imops::{self, BgrImage, GrayImage};

/// Holds the current masks and permits atomic live replacement.
#[derive(Default)]
pub struct MaskStore {
    exclusion: Mutex<Option<Arc<GrayImage>>>,
    nuisance: Mutex<Option<Arc<GrayImage>>>,
    version: AtomicU64,
}

impl MaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_exclusion(&self, mask: Option<GrayImage>) {
        *self.exclusion.lock().expect("mask lock") = mask.map(Arc::new);
        self.version.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_nuisance(&self, mask: Option<GrayImage>) {
        *self.nuisance.lock().expect("mask lock") = mask.map(Arc::new);
        self.version.fetch_add(1, Ordering::Relaxed);
    }

    pub fn exclusion(&self) -> Option<Arc<GrayImage>> {
        self.exclusion.lock().expect("mask lock").clone()
    }

    pub fn nuisance(&self) -> Option<Arc<GrayImage>> {
        self.nuisance.lock().expect("mask lock").clone()
    }

    pub fn exclusion_active(&self) -> bool {
        self.exclusion.lock().expect("mask lock").is_some()
    }

    /// Bumped on every replacement; lets observers detect staleness cheaply.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Relaxed)
    }
}

const SKY_BLUE_LO: imops::Hsv = (90, 20, 80);
const SKY_BLUE_HI: imops::Hsv = (140, 200, 255);
const SKY_WHITE_LO: imops::Hsv = (0, 0, 160);
const SKY_WHITE_HI: imops::Hsv = (180, 40, 255);

/// Build an exclusion mask from a daylight frame: everything that is not
/// sky (or sits below the sky line) becomes excluded.
pub fn build_exclusion_mask(
    frame: &BgrImage,
    proc_size: (u32, u32),
    dilate_px: u32,
) -> GrayImage {
    let (proc_w, proc_h) = proc_size;
    let resized = imops::resize_area(frame, proc_w, proc_h);

    let sky_blue = imops::hsv_in_range(&resized, SKY_BLUE_LO, SKY_BLUE_HI);
    let sky_white = imops::hsv_in_range(&resized, SKY_WHITE_LO, SKY_WHITE_HI);
    let sky_mask = imops::bitwise_or(&sky_blue, &sky_white);

    // Sky proper is whatever sky-colored region touches the top edge;
    // blue cars and white walls do not.
    let components = imops::connected_components(&sky_mask);
    let touching_top: Vec<&imops::Component> = components
        .iter()
        .filter(|c| c.pixels.iter().any(|&i| i < proc_w))
        .collect();
    let sky_keep = if touching_top.is_empty() {
        sky_mask
    } else {
        let mut keep = GrayImage::new(proc_w, proc_h);
        for component in touching_top {
            for &i in &component.pixels {
                keep.data[i as usize] = 255;
            }
        }
        keep
    };

    let mut exclusion = imops::invert(&sky_keep);

    // Everything strictly below the lowest sky pixel of a column is
    // excluded; a column with no sky at all is fully excluded.
    for x in 0..proc_w {
        let mut lowest_sky: Option<u32> = None;
        for y in 0..proc_h {
            if sky_keep.get(x, y) != 0 {
                lowest_sky = Some(y);
            }
        }
        match lowest_sky {
            None => {
                for y in 0..proc_h {
                    exclusion.put(x, y, 255);
                }
            }
            Some(y_max) => {
                for y in (y_max + 1)..proc_h {
                    exclusion.put(x, y, 255);
                }
            }
        }
    }

    let kernel = imops::ellipse_kernel(5);
    let mut exclusion = imops::close(&exclusion, &kernel);
    if dilate_px > 0 {
        let dilate_kernel = imops::ellipse_kernel(dilate_px);
        exclusion = imops::dilate(&exclusion, &dilate_kernel);
    }
    exclusion
}

/// Load a prebuilt mask image (grayscale, any size): resized with
/// nearest-neighbor to processing resolution and binarized.
pub fn load_mask_image(path: &Path, proc_size: (u32, u32)) -> Result<GrayImage> {
    let img = image::open(path)
        .with_context(|| format!("failed to read mask image {}", path.display()))?
        .into_luma8();
    let gray = GrayImage::from_vec(img.width(), img.height(), img.into_raw())?;
    let resized = imops::resize_nearest(&gray, proc_size.0, proc_size.1);
    Ok(imops::threshold_binary(&resized, 1))
}

/// Load a color reference image (e.g. a daylight shot) as BGR.
pub fn load_reference_image(path: &Path) -> Result<BgrImage> {
    let img = image::open(path)
        .with_context(|| format!("failed to read reference image {}", path.display()))?
        .into_rgb8();
    let (width, height) = (img.width(), img.height());
    let rgb = img.into_raw();
    let mut bgr = Vec::with_capacity(rgb.len());
    for px in rgb.chunks_exact(3) {
        bgr.push(px[2]);
        bgr.push(px[1]);
        bgr.push(px[0]);
    }
    BgrImage::from_vec(width, height, bgr)
}

/// Persist a mask as an 8-bit binary PNG.
pub fn save_mask_png(path: &Path, mask: &GrayImage) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create mask directory {}", parent.display()))?;
    }
    let img = image::GrayImage::from_raw(mask.width, mask.height, mask.data.clone())
        .context("mask buffer does not match its dimensions")?;
    img.save(path)
        .with_context(|| format!("failed to save mask {}", path.display()))?;
    Ok(())
}

/// `<output>/masks/<camera>_mask.png`, the operator-updated mask that
/// survives restarts.
pub fn persistent_mask_path(output_dir: &Path, camera_name: &str) -> PathBuf {
    output_dir.join("masks").join(format!("{}_mask.png", camera_name))
}
