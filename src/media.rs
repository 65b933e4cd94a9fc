//! Media encoding: event clips via an external `ffmpeg` process, stills
//! and preview frames via the `image` crate.
//!
//! The clip writer feeds raw BGR24 frames to ffmpeg over stdin and lets it
//! mux a web-playable file. Encoders are probed once in preference order
//! (H.264 baseline first, MJPEG as the raw-compressed fallback); the
//! chosen codec is surfaced in the stats snapshot. A missing ffmpeg binary
//! is an `EncoderError::Unavailable`, which the evidence writer downgrades
//! to "skip the clip, keep composite and log record".

use std::io::Write;
use std::path::Path;
use std::process::{Child, ChildStdin, Command, Stdio};

use crate::imops::BgrImage;

#[derive(Debug, thiserror::Error)]
pub enum EncoderError {
    #[error("no usable video encoder: {0}")]
    Unavailable(String),
    #[error("encoder I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("ffmpeg failed ({status}): {stderr}")]
    Ffmpeg { status: String, stderr: String },
}

/// Codecs attempted in preference order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClipCodec {
    H264Baseline,
    Mpeg4,
    Mjpeg,
}

pub const CODEC_PREFERENCE: [ClipCodec; 3] =
    [ClipCodec::H264Baseline, ClipCodec::Mpeg4, ClipCodec::Mjpeg];

impl ClipCodec {
    pub fn encoder_name(&self) -> &'static str {
        match self {
            Self::H264Baseline => "libx264",
            Self::Mpeg4 => "mpeg4",
            Self::Mjpeg => "mjpeg",
        }
    }

    /// Container extension; MJPEG goes into AVI, the rest into MP4.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::H264Baseline | Self::Mpeg4 => "mp4",
            Self::Mjpeg => "avi",
        }
    }

    fn encode_args(&self) -> Vec<&'static str> {
        match self {
            Self::H264Baseline => vec![
                "-profile:v",
                "baseline",
                "-pix_fmt",
                "yuv420p",
                "-movflags",
                "+faststart",
            ],
            Self::Mpeg4 => vec!["-pix_fmt", "yuv420p"],
            Self::Mjpeg => vec!["-q:v", "4"],
        }
    }
}

/// Ask the local ffmpeg which encoders it carries and pick the first one
/// from the preference order.
pub fn probe_clip_codec() -> Result<ClipCodec, EncoderError> {
    let output = Command::new("ffmpeg")
        .args(["-hide_banner", "-nostdin", "-encoders"])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .map_err(|e| EncoderError::Unavailable(format!("ffmpeg not runnable: {}", e)))?;
    let listing = String::from_utf8_lossy(&output.stdout);
    for codec in CODEC_PREFERENCE {
        let needle = format!(" {} ", codec.encoder_name());
        if listing.lines().any(|line| line.contains(&needle)) {
            return Ok(codec);
        }
    }
    Err(EncoderError::Unavailable(
        "ffmpeg reports none of libx264/mpeg4/mjpeg".to_string(),
    ))
}

/// Streams raw BGR frames into an ffmpeg child encoding one clip.
pub struct ClipWriter {
    child: Child,
    stdin: Option<ChildStdin>,
    frame_size: (u32, u32),
}

impl ClipWriter {
    pub fn create(
        path: &Path,
        codec: ClipCodec,
        fps: f64,
        frame_size: (u32, u32),
    ) -> Result<Self, EncoderError> {
        let (width, height) = frame_size;
        let mut cmd = Command::new("ffmpeg");
        cmd.args(["-hide_banner", "-nostdin", "-loglevel", "error", "-y"])
            .args(["-f", "rawvideo", "-pix_fmt", "bgr24"])
            .args(["-s", &format!("{}x{}", width, height)])
            .args(["-r", &format!("{:.3}", fps)])
            .args(["-i", "-", "-an"])
            .args(["-c:v", codec.encoder_name()])
            .args(codec.encode_args())
            .arg(path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| EncoderError::Unavailable(format!("ffmpeg not runnable: {}", e)))?;
        let stdin = child.stdin.take().ok_or_else(|| {
            EncoderError::Unavailable("ffmpeg child has no stdin".to_string())
        })?;
        Ok(Self {
            child,
            stdin: Some(stdin),
            frame_size,
        })
    }

    pub fn write_frame(&mut self, frame: &BgrImage) -> Result<(), EncoderError> {
        debug_assert_eq!((frame.width, frame.height), self.frame_size);
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| EncoderError::Unavailable("clip writer already closed".to_string()))?;
        stdin.write_all(&frame.data)?;
        Ok(())
    }

    /// Close stdin and wait for ffmpeg to finish the file.
    pub fn finish(mut self) -> Result<(), EncoderError> {
        drop(self.stdin.take());
        let output = self.child.wait_with_output()?;
        if output.status.success() {
            Ok(())
        } else {
            Err(EncoderError::Ffmpeg {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

/// JPEG-encode a BGR frame (snapshots, MJPEG parts, composites).
pub fn encode_jpeg(frame: &BgrImage, quality: u8) -> anyhow::Result<Vec<u8>> {
    let rgb = image::RgbImage::from_raw(frame.width, frame.height, frame.to_rgb_bytes())
        .ok_or_else(|| anyhow::anyhow!("frame buffer does not match its dimensions"))?;
    let mut out = Vec::new();
    let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, quality);
    rgb.write_with_encoder(encoder)?;
    Ok(out)
}

/// Write a BGR frame as a JPEG file.
pub fn save_jpeg(path: &Path, frame: &BgrImage, quality: u8) -> anyhow::Result<()> {
    let bytes = encode_jpeg(frame, quality)?;
    std::fs::write(path, bytes)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_preference_starts_with_h264_baseline() {
        assert_eq!(CODEC_PREFERENCE[0], ClipCodec::H264Baseline);
        assert_eq!(CODEC_PREFERENCE[0].encoder_name(), "libx264");
        assert_eq!(CODEC_PREFERENCE[0].extension(), "mp4");
        assert_eq!(ClipCodec::Mjpeg.extension(), "avi");
    }

    #[test]
    fn h264_args_request_baseline_profile() {
        let args = ClipCodec::H264Baseline.encode_args();
        assert!(args.windows(2).any(|w| w == ["-profile:v", "baseline"]));
        assert!(args.contains(&"+faststart"));
    }

    #[test]
    fn jpeg_roundtrip_keeps_dimensions() {
        let mut frame = BgrImage::new(16, 8);
        frame.put(3, 3, (0, 0, 255));
        let bytes = encode_jpeg(&frame, 90).unwrap();
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (16, 8));
    }

    #[test]
    fn clip_writer_produces_a_file_when_ffmpeg_exists() {
        // Environment-dependent: exercised only where ffmpeg is installed.
        let Ok(codec) = probe_clip_codec() else {
            return;
        };
        let dir = tempfile::tempdir().unwrap();
        let path = dir
            .path()
            .join(format!("clip.{}", codec.extension()));
        let mut writer = ClipWriter::create(&path, codec, 30.0, (64, 48)).unwrap();
        for i in 0..10u8 {
            let mut frame = BgrImage::new(64, 48);
            frame.data.fill(i * 20);
            writer.write_frame(&frame).unwrap();
        }
        writer.finish().unwrap();
        let metadata = std::fs::metadata(&path).unwrap();
        assert!(metadata.len() > 0);
    }
}
