//! Daemon configuration.
//!
//! Layered like most of our deployments: an optional TOML/JSON file
//! (path in `METEOR_CONFIG`) provides the base, environment variables
//! override it, and CLI flags win last. Per-parameter numeric overrides
//! come from `METEOR_<FIELD>` environment variables and are applied with
//! the same clamping as runtime updates.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::ingest::CaptureBackend;
use crate::params::{ParamsPatch, Sensitivity};

const DEFAULT_OUTPUT_DIR: &str = "meteor_detections";
const DEFAULT_CAMERA_NAME: &str = "camera";
const DEFAULT_PROCESS_SCALE: f64 = 0.5;
const DEFAULT_BUFFER_SECONDS: f64 = 15.0;
const DEFAULT_MASK_DILATE: u32 = 20;
const DEFAULT_LATITUDE: f64 = 35.3606;
const DEFAULT_LONGITUDE: f64 = 138.7274;
const DEFAULT_TIMEZONE: &str = "Asia/Tokyo";

/// Command-line interface of `meteord`. The environment variables our
/// compose files set are applied between the config file and these flags.
#[derive(Debug, Default, Parser)]
#[command(
    name = "meteord",
    version,
    about = "Real-time meteor detection from an RTSP camera stream"
)]
pub struct Cli {
    /// RTSP URL of the camera stream.
    pub url: Option<String>,

    /// Output directory for clips, composites and the detection log.
    #[arg(short = 'o', long)]
    pub output: Option<PathBuf>,

    /// Detection sensitivity: low, medium, high or fireball.
    #[arg(long)]
    pub sensitivity: Option<String>,

    /// Processing scale applied before detection (0 < scale <= 1).
    #[arg(long)]
    pub scale: Option<f64>,

    /// Ring buffer length in seconds.
    #[arg(long)]
    pub buffer: Option<f64>,

    /// Control surface port; 0 disables the HTTP server.
    #[arg(long)]
    pub web_port: Option<u16>,

    #[arg(long)]
    pub camera_name: Option<String>,

    /// Save only composites, no video clips.
    #[arg(long)]
    pub no_clips: bool,

    /// Prebuilt exclusion mask image (takes priority over --mask-from-day).
    #[arg(long)]
    pub mask_image: Option<PathBuf>,

    /// Daylight reference image to synthesize an exclusion mask from.
    #[arg(long)]
    pub mask_from_day: Option<PathBuf>,

    /// Dilation radius in pixels applied to synthesized masks.
    #[arg(long)]
    pub mask_dilate: Option<u32>,

    /// Fraction of the frame bottom excluded from detection.
    #[arg(long)]
    pub exclude_bottom: Option<f64>,

    /// Capture backend: auto or ffmpeg.
    #[arg(long)]
    pub backend: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    output_dir: Option<PathBuf>,
    camera: Option<CameraSection>,
    detection: Option<DetectionSection>,
    mask: Option<MaskSection>,
    web: Option<WebSection>,
    astro: Option<AstroSection>,
}

#[derive(Debug, Default, Deserialize)]
struct CameraSection {
    url: Option<String>,
    name: Option<String>,
    backend: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct DetectionSection {
    sensitivity: Option<String>,
    scale: Option<f64>,
    buffer_seconds: Option<f64>,
    extract_clips: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct MaskSection {
    image: Option<PathBuf>,
    from_day: Option<PathBuf>,
    dilate: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct WebSection {
    port: Option<u16>,
}

#[derive(Debug, Default, Deserialize)]
struct AstroSection {
    enable_time_window: Option<bool>,
    latitude: Option<f64>,
    longitude: Option<f64>,
    timezone: Option<String>,
}

/// Fully resolved daemon configuration.
#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub camera_url: String,
    pub camera_name: String,
    pub backend: CaptureBackend,
    pub output_dir: PathBuf,
    pub web_port: u16,
    pub sensitivity: Sensitivity,
    pub process_scale: f64,
    pub buffer_seconds: f64,
    pub extract_clips: bool,
    pub mask_image: Option<PathBuf>,
    pub mask_from_day: Option<PathBuf>,
    pub mask_dilate: u32,
    pub enable_time_window: bool,
    pub latitude: f64,
    pub longitude: f64,
    pub timezone: String,
    pub param_overrides: ParamsPatch,
}

impl DaemonConfig {
    pub fn load(cli: &Cli) -> Result<Self> {
        let file_cfg = match std::env::var("METEOR_CONFIG").ok().as_deref() {
            Some(path) if !path.trim().is_empty() => read_config_file(Path::new(path))?,
            _ => ConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg)?;
        cfg.apply_env()?;
        cfg.apply_cli(cli)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: ConfigFile) -> Result<Self> {
        let camera = file.camera.unwrap_or_default();
        let detection = file.detection.unwrap_or_default();
        let mask = file.mask.unwrap_or_default();
        let astro = file.astro.unwrap_or_default();

        let sensitivity = match detection.sensitivity.as_deref() {
            Some(raw) => Sensitivity::parse(raw)?,
            None => Sensitivity::default(),
        };
        let backend = match camera.backend.as_deref() {
            Some(raw) => CaptureBackend::parse(raw)?,
            None => CaptureBackend::Auto,
        };

        Ok(Self {
            camera_url: camera.url.unwrap_or_default(),
            camera_name: camera
                .name
                .unwrap_or_else(|| DEFAULT_CAMERA_NAME.to_string()),
            backend,
            output_dir: file
                .output_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR)),
            web_port: file.web.and_then(|web| web.port).unwrap_or(0),
            sensitivity,
            process_scale: detection.scale.unwrap_or(DEFAULT_PROCESS_SCALE),
            buffer_seconds: detection.buffer_seconds.unwrap_or(DEFAULT_BUFFER_SECONDS),
            extract_clips: detection.extract_clips.unwrap_or(true),
            mask_image: mask.image,
            mask_from_day: mask.from_day,
            mask_dilate: mask.dilate.unwrap_or(DEFAULT_MASK_DILATE),
            enable_time_window: astro.enable_time_window.unwrap_or(true),
            latitude: astro.latitude.unwrap_or(DEFAULT_LATITUDE),
            longitude: astro.longitude.unwrap_or(DEFAULT_LONGITUDE),
            timezone: astro.timezone.unwrap_or_else(|| DEFAULT_TIMEZONE.to_string()),
            param_overrides: ParamsPatch::default(),
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(url) = std::env::var("CAMERA_URL") {
            if !url.trim().is_empty() {
                self.camera_url = url;
            }
        }
        if let Ok(name) = std::env::var("CAMERA_NAME") {
            if !name.trim().is_empty() {
                self.camera_name = name;
            }
        }
        if let Ok(raw) = std::env::var("SENSITIVITY") {
            if !raw.trim().is_empty() {
                self.sensitivity = Sensitivity::parse(&raw)?;
            }
        }
        if let Ok(output) = std::env::var("OUTPUT_DIR") {
            if !output.trim().is_empty() {
                self.output_dir = PathBuf::from(output);
            }
        }
        if let Ok(port) = std::env::var("WEB_PORT") {
            if !port.trim().is_empty() {
                self.web_port = port
                    .trim()
                    .parse()
                    .map_err(|_| anyhow!("WEB_PORT must be a port number"))?;
            }
        }
        if let Some(scale) = env_f64("PROCESS_SCALE")? {
            self.process_scale = scale;
        }
        if let Some(buffer) = env_f64("BUFFER_SECONDS")? {
            self.buffer_seconds = buffer;
        }
        if let Ok(path) = std::env::var("MASK_IMAGE") {
            if !path.trim().is_empty() {
                self.mask_image = Some(PathBuf::from(path));
            }
        }
        if let Ok(path) = std::env::var("MASK_FROM_DAY") {
            if !path.trim().is_empty() {
                self.mask_from_day = Some(PathBuf::from(path));
            }
        }
        if let Some(dilate) = env_i64("MASK_DILATE")? {
            self.mask_dilate = dilate.clamp(0, 500) as u32;
        }
        if let Ok(raw) = std::env::var("RTSP_BACKEND") {
            if !raw.trim().is_empty() {
                self.backend = CaptureBackend::parse(&raw)?;
            }
        }
        if let Ok(value) = std::env::var("EXTRACT_CLIPS") {
            let value = value.trim().to_lowercase();
            if !value.is_empty() {
                self.extract_clips = !matches!(value.as_str(), "false" | "0" | "no");
            }
        }
        if let Ok(value) = std::env::var("ENABLE_TIME_WINDOW") {
            let value = value.trim().to_lowercase();
            if !value.is_empty() {
                self.enable_time_window = value == "true" || value == "1" || value == "yes";
            }
        }
        if let Some(latitude) = env_f64("LATITUDE")? {
            self.latitude = latitude;
        }
        if let Some(longitude) = env_f64("LONGITUDE")? {
            self.longitude = longitude;
        }
        if let Ok(tz) = std::env::var("TIMEZONE") {
            if !tz.trim().is_empty() {
                self.timezone = tz;
            }
        }
        self.param_overrides = params_patch_from_env()?;
        Ok(())
    }

    fn apply_cli(&mut self, cli: &Cli) -> Result<()> {
        if let Some(url) = &cli.url {
            self.camera_url = url.clone();
        }
        if let Some(output) = &cli.output {
            self.output_dir = output.clone();
        }
        if let Some(raw) = &cli.sensitivity {
            self.sensitivity = Sensitivity::parse(raw)?;
        }
        if let Some(scale) = cli.scale {
            self.process_scale = scale;
        }
        if let Some(buffer) = cli.buffer {
            self.buffer_seconds = buffer;
        }
        if let Some(port) = cli.web_port {
            self.web_port = port;
        }
        if let Some(name) = &cli.camera_name {
            self.camera_name = name.clone();
        }
        if cli.no_clips {
            self.extract_clips = false;
        }
        if let Some(path) = &cli.mask_image {
            self.mask_image = Some(path.clone());
        }
        if let Some(path) = &cli.mask_from_day {
            self.mask_from_day = Some(path.clone());
        }
        if let Some(dilate) = cli.mask_dilate {
            self.mask_dilate = dilate;
        }
        if let Some(ratio) = cli.exclude_bottom {
            self.param_overrides.exclude_bottom_ratio = Some(ratio);
        }
        if let Some(raw) = &cli.backend {
            self.backend = CaptureBackend::parse(raw)?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.camera_url.trim().is_empty() {
            return Err(anyhow!("camera url must not be empty (CAMERA_URL)"));
        }
        if self.camera_url.trim().starts_with("stub://") && !stub_urls_allowed() {
            return Err(anyhow!(
                "stub:// urls are only allowed for local dev/test builds"
            ));
        }
        if !(self.process_scale > 0.0 && self.process_scale <= 1.0) {
            return Err(anyhow!("process scale must be in (0, 1]"));
        }
        if self.buffer_seconds <= 0.0 {
            return Err(anyhow!("buffer seconds must be greater than zero"));
        }
        if self.mask_dilate > 500 {
            return Err(anyhow!("mask dilation must be at most 500 px"));
        }
        if self.camera_name.trim().is_empty() {
            return Err(anyhow!("camera name must not be empty"));
        }
        Ok(())
    }
}

fn stub_urls_allowed() -> bool {
    cfg!(test) || cfg!(debug_assertions)
}

fn env_f64(key: &str) -> Result<Option<f64>> {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => {
            let parsed = value
                .trim()
                .parse::<f64>()
                .map_err(|_| anyhow!("{} must be a number", key))?;
            Ok(Some(parsed))
        }
        _ => Ok(None),
    }
}

fn env_i64(key: &str) -> Result<Option<i64>> {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => {
            let parsed = value
                .trim()
                .parse::<i64>()
                .map_err(|_| anyhow!("{} must be an integer", key))?;
            Ok(Some(parsed))
        }
        _ => Ok(None),
    }
}

/// `METEOR_<FIELD>` numeric overrides for every detection parameter.
fn params_patch_from_env() -> Result<ParamsPatch> {
    let patch = ParamsPatch {
        sensitivity: None,
        diff_threshold: env_i64("METEOR_DIFF_THRESHOLD")?,
        min_brightness: env_i64("METEOR_MIN_BRIGHTNESS")?,
        min_brightness_tracking: env_i64("METEOR_MIN_BRIGHTNESS_TRACKING")?,
        min_length: env_i64("METEOR_MIN_LENGTH")?,
        max_length: env_i64("METEOR_MAX_LENGTH")?,
        min_duration: env_f64("METEOR_MIN_DURATION")?,
        max_duration: env_f64("METEOR_MAX_DURATION")?,
        min_speed: env_f64("METEOR_MIN_SPEED")?,
        min_linearity: env_f64("METEOR_MIN_LINEARITY")?,
        min_area: env_i64("METEOR_MIN_AREA")?,
        max_area: env_i64("METEOR_MAX_AREA")?,
        max_gap_time: env_f64("METEOR_MAX_GAP_TIME")?,
        max_distance: env_f64("METEOR_MAX_DISTANCE")?,
        merge_max_gap_time: env_f64("METEOR_MERGE_MAX_GAP_TIME")?,
        merge_max_distance: env_f64("METEOR_MERGE_MAX_DISTANCE")?,
        merge_max_speed_ratio: env_f64("METEOR_MERGE_MAX_SPEED_RATIO")?,
        exclude_bottom_ratio: env_f64("METEOR_EXCLUDE_BOTTOM_RATIO")?,
        exclude_edge_ratio: env_f64("METEOR_EXCLUDE_EDGE_RATIO")?,
        nuisance_overlap_threshold: env_f64("METEOR_NUISANCE_OVERLAP_THRESHOLD")?,
        nuisance_path_overlap_threshold: env_f64("METEOR_NUISANCE_PATH_OVERLAP_THRESHOLD")?,
        small_area_threshold: env_i64("METEOR_SMALL_AREA_THRESHOLD")?,
        min_track_points: env_i64("METEOR_MIN_TRACK_POINTS")?,
        max_stationary_ratio: env_f64("METEOR_MAX_STATIONARY_RATIO")?,
    };
    Ok(patch)
}

fn read_config_file<T>(path: &Path) -> Result<T>
where
    T: for<'de> Deserialize<'de> + Default,
{
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;

    if path.extension().map(|e| e == "toml").unwrap_or(false) {
        return toml::from_str(&raw)
            .with_context(|| format!("invalid TOML config file {}", path.display()));
    }
    if path.extension().map(|e| e == "json").unwrap_or(false) {
        return serde_json::from_str(&raw)
            .with_context(|| format!("invalid JSON config file {}", path.display()));
    }
    match serde_json::from_str(&raw) {
        Ok(cfg) => Ok(cfg),
        Err(json_err) => match toml::from_str(&raw) {
            Ok(cfg) => Ok(cfg),
            Err(toml_err) => Err(anyhow!(
                "invalid config file {} (tried JSON and TOML): json error: {}; toml error: {}",
                path.display(),
                json_err,
                toml_err
            )),
        },
    }
}
