//! Local file frame source using FFmpeg.
//!
//! Frames are decoded in-memory and scaled to RGB24. Seeking jumps to the
//! nearest preceding keyframe and decodes forward to the requested index.

use anyhow::{anyhow, Context, Result};
use ffmpeg_next as ffmpeg;

use super::file::FileConfig;
use super::{NextFrame, SourceStats};
use crate::frame::CapturedFrame;

const AV_TIME_BASE: f64 = 1_000_000.0;

pub(crate) struct FfmpegFileSource {
    config: FileConfig,
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    time_base: f64,
    decoder: ffmpeg::codec::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    fps: f64,
    total_frames: u64,
    cursor: u64,
    /// After a seek, frames with a presentation time below this are skipped.
    seek_floor: Option<f64>,
    drained: bool,
    frame_count: u64,
    opened: bool,
}

impl FfmpegFileSource {
    pub(crate) fn new(config: FileConfig) -> Result<Self> {
        ffmpeg::init().context("initialize ffmpeg")?;
        let input = ffmpeg::format::input(&config.path)
            .with_context(|| format!("failed to open file input '{}' with ffmpeg", config.path))?;
        let input_stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| anyhow!("file has no video track"))?;
        let stream_index = input_stream.index();
        let time_base = f64::from(input_stream.time_base());

        let mut fps = f64::from(input_stream.avg_frame_rate());
        if !fps.is_finite() || fps <= 0.0 {
            fps = f64::from(input_stream.rate());
        }
        if !fps.is_finite() || fps <= 0.0 {
            // Raw elementary streams (.h264) often carry no rate.
            fps = config.fps;
        }

        let reported = input_stream.frames();
        let total_frames = if reported > 0 {
            reported as u64
        } else if input.duration() > 0 {
            ((input.duration() as f64 / AV_TIME_BASE) * fps).floor() as u64
        } else {
            0
        };

        let context = ffmpeg::codec::context::Context::from_parameters(input_stream.parameters())
            .context("load video decoder parameters")?;
        let decoder = context
            .decoder()
            .video()
            .context("open ffmpeg video decoder")?;

        let scaler = ffmpeg::software::scaling::context::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::util::format::pixel::Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            ffmpeg::software::scaling::flag::Flags::BILINEAR,
        )
        .context("create ffmpeg scaler")?;

        Ok(Self {
            config,
            input,
            stream_index,
            time_base,
            decoder,
            scaler,
            fps,
            total_frames,
            cursor: 0,
            seek_floor: None,
            drained: false,
            frame_count: 0,
            opened: false,
        })
    }

    pub(crate) fn open(&mut self) -> Result<()> {
        self.opened = true;
        log::info!(
            "FileSource: opened {} (ffmpeg, {:.2} fps, {} frames)",
            self.config.path,
            self.fps,
            self.total_frames
        );
        Ok(())
    }

    pub(crate) fn read_next(&mut self) -> Result<NextFrame> {
        if !self.opened {
            return Err(anyhow!("file source {} is not open", self.config.path));
        }

        let mut rgb_frame = ffmpeg::frame::Video::empty();
        loop {
            let Some(decoded) = self.decode_next()? else {
                return Ok(NextFrame::EndOfStream);
            };

            if let Some(floor) = self.seek_floor {
                let pts_secs = decoded
                    .timestamp()
                    .or_else(|| decoded.pts())
                    .map(|pts| pts as f64 * self.time_base);
                if matches!(pts_secs, Some(t) if t < floor) {
                    continue;
                }
                self.seek_floor = None;
            }

            self.scaler
                .run(&decoded, &mut rgb_frame)
                .context("scale frame to RGB")?;
            let (pixels, width, height) = frame_to_pixels(&rgb_frame)?;

            let index = self.cursor;
            self.cursor += 1;
            self.frame_count += 1;

            return Ok(NextFrame::Frame(
                CapturedFrame::from_rgb(pixels, width, height, index)
                    .with_origin(self.config.path.clone()),
            ));
        }
    }

    pub(crate) fn seek_to_index(&mut self, index: u64) -> Result<()> {
        if self.total_frames > 0 && index >= self.total_frames {
            return Err(anyhow!(
                "frame {} out of range (stream has {} frames)",
                index,
                self.total_frames
            ));
        }
        let target_secs = index as f64 / self.fps;
        let target_ts = (target_secs * AV_TIME_BASE) as i64;
        self.input
            .seek(target_ts, ..target_ts)
            .with_context(|| format!("seek to frame {} ({:.3}s)", index, target_secs))?;
        self.decoder.flush();
        self.drained = false;
        // Half a frame of tolerance absorbs pts rounding.
        self.seek_floor = Some(target_secs - 0.5 / self.fps);
        self.cursor = index;
        Ok(())
    }

    pub(crate) fn total_frames(&self) -> u64 {
        self.total_frames
    }

    pub(crate) fn fps(&self) -> f64 {
        self.fps
    }

    pub(crate) fn close(&mut self) {
        if self.opened {
            log::info!("FileSource: closed {}", self.config.path);
        }
        self.opened = false;
    }

    pub(crate) fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            source: self.config.path.clone(),
        }
    }

    fn decode_next(&mut self) -> Result<Option<ffmpeg::frame::Video>> {
        let mut decoded = ffmpeg::frame::Video::empty();
        loop {
            if self.decoder.receive_frame(&mut decoded).is_ok() {
                return Ok(Some(decoded));
            }
            if self.drained {
                return Ok(None);
            }

            let mut fed = false;
            for (stream, packet) in self.input.packets() {
                if stream.index() != self.stream_index {
                    continue;
                }
                self.decoder
                    .send_packet(&packet)
                    .context("send packet to ffmpeg decoder")?;
                fed = true;
                break;
            }
            if !fed {
                self.decoder.send_eof().context("flush ffmpeg decoder")?;
                self.drained = true;
            }
        }
    }
}

fn frame_to_pixels(frame: &ffmpeg::frame::Video) -> Result<(Vec<u8>, u32, u32)> {
    let width = frame.width();
    let height = frame.height();
    let row_bytes = (width as usize) * 3;
    let stride = frame.stride(0);
    let data = frame.data(0);

    if stride == row_bytes {
        let packed = data
            .get(..row_bytes * height as usize)
            .context("ffmpeg frame is shorter than its dimensions")?;
        return Ok((packed.to_vec(), width, height));
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

    Ok((pixels, width, height))
}
