//! RTSP capture backed by FFmpeg.
//!
//! Opens the stream, picks the best video track, decodes and converts to
//! packed BGR24 at source resolution. One `read()` call drains packets
//! until a full frame comes out of the decoder.

use anyhow::{anyhow, Context, Result};
use ffmpeg_next as ffmpeg;

use crate::imops::BgrImage;

use super::Capture;

pub(crate) struct FfmpegCapture {
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    decoder: ffmpeg::codec::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    fps: f64,
}

impl FfmpegCapture {
    pub(crate) fn open(url: &str) -> Result<Self> {
        ffmpeg::init().context("initialize ffmpeg")?;
        let input = ffmpeg::format::input(&url)
            .with_context(|| format!("failed to open stream '{}' with ffmpeg", url))?;
        let stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| anyhow!("stream has no video track"))?;
        let stream_index = stream.index();

        let rate = stream.avg_frame_rate();
        let fps = if rate.denominator() != 0 {
            rate.numerator() as f64 / rate.denominator() as f64
        } else {
            0.0
        };

        let context = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
            .context("load video decoder parameters")?;
        let decoder = context
            .decoder()
            .video()
            .context("open ffmpeg video decoder")?;

        let scaler = ffmpeg::software::scaling::context::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::util::format::pixel::Pixel::BGR24,
            decoder.width(),
            decoder.height(),
            ffmpeg::software::scaling::flag::Flags::BILINEAR,
        )
        .context("create ffmpeg scaler")?;

        Ok(Self {
            input,
            stream_index,
            decoder,
            scaler,
            fps,
        })
    }
}

impl Capture for FfmpegCapture {
    fn frame_size(&self) -> (u32, u32) {
        (self.decoder.width(), self.decoder.height())
    }

    fn fps(&self) -> f64 {
        self.fps
    }

    fn read(&mut self) -> Result<BgrImage> {
        let mut decoded = ffmpeg::frame::Video::empty();
        let mut bgr_frame = ffmpeg::frame::Video::empty();

        for (stream, packet) in self.input.packets() {
            if stream.index() != self.stream_index {
                continue;
            }
            self.decoder
                .send_packet(&packet)
                .context("send packet to ffmpeg decoder")?;
            while self.decoder.receive_frame(&mut decoded).is_ok() {
                self.scaler
                    .run(&decoded, &mut bgr_frame)
                    .context("scale frame to BGR")?;
                return frame_to_bgr(&bgr_frame);
            }
        }

        anyhow::bail!("stream ended without frames")
    }
}

fn frame_to_bgr(frame: &ffmpeg::frame::Video) -> Result<BgrImage> {
    let width = frame.width();
    let height = frame.height();
    let row_bytes = width as usize * 3;
    let stride = frame.stride(0);
    let data = frame.data(0);

    if stride == row_bytes {
        return BgrImage::from_vec(width, height, data.to_vec());
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .context("ffmpeg frame row is out of bounds")?,
        );
    }
    BgrImage::from_vec(width, height, pixels)
}
