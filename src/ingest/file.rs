//! Local file frame source.
//!
//! This module provides `FileSource` for reading frames from local video files.
//! The file source is responsible for:
//! - Reading frames from a local video file (no network access)
//! - Decoding video frames in-memory to RGB
//! - Seeking to a frame index for time-aligned capture
//! - Stamping each frame with its index and origin
//!
//! `stub://` paths select a synthetic stream instead, used by tests and by
//! deployments without a camera. `stub://live` produces an endless live stream.

use anyhow::{anyhow, Result};

#[cfg(feature = "ingest-file-ffmpeg")]
use super::file_ffmpeg::FfmpegFileSource;
use super::{FrameSource, NextFrame, SourceStats};
use crate::frame::CapturedFrame;

const LIVE_STUB: &str = "stub://live";

/// Configuration for a local file source.
#[derive(Clone, Debug)]
pub struct FileConfig {
    /// Local file path (e.g., "/var/lib/flood/flood_video.h264") or `stub://<name>`.
    pub path: String,
    /// Frame rate of synthetic streams. Video files report their own rate.
    pub fps: f64,
    /// Length of synthetic recorded streams, in frames.
    pub frames: u64,
    /// Synthetic frame width.
    pub width: u32,
    /// Synthetic frame height.
    pub height: u32,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            path: String::new(),
            fps: 10.0,
            frames: 300,
            width: 320,
            height: 240,
        }
    }
}

/// Local file frame source.
pub struct FileSource {
    backend: FileBackend,
}

enum FileBackend {
    Synthetic(SyntheticFileSource),
    #[cfg(feature = "ingest-file-ffmpeg")]
    Ffmpeg(FfmpegFileSource),
}

impl FileSource {
    pub fn new(config: FileConfig) -> Result<Self> {
        if !is_local_file_path(&config.path) {
            return Err(anyhow!(
                "file ingestion only supports local paths (no URL schemes)"
            ));
        }
        if config.path.starts_with("stub://") {
            Ok(Self {
                backend: FileBackend::Synthetic(SyntheticFileSource::new(config)?),
            })
        } else {
            #[cfg(feature = "ingest-file-ffmpeg")]
            {
                Ok(Self {
                    backend: FileBackend::Ffmpeg(FfmpegFileSource::new(config)?),
                })
            }
            #[cfg(not(feature = "ingest-file-ffmpeg"))]
            {
                Err(anyhow!(
                    "video file ingestion requires the ingest-file-ffmpeg feature ({})",
                    config.path
                ))
            }
        }
    }
}

impl FrameSource for FileSource {
    fn open(&mut self) -> Result<()> {
        match &mut self.backend {
            FileBackend::Synthetic(source) => source.open(),
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(source) => source.open(),
        }
    }

    fn read_next(&mut self) -> Result<NextFrame> {
        match &mut self.backend {
            FileBackend::Synthetic(source) => source.read_next(),
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(source) => source.read_next(),
        }
    }

    fn seek_to_index(&mut self, index: u64) -> Result<()> {
        match &mut self.backend {
            FileBackend::Synthetic(source) => source.seek_to_index(index),
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(source) => source.seek_to_index(index),
        }
    }

    fn total_frames(&self) -> Option<u64> {
        match &self.backend {
            FileBackend::Synthetic(source) => source.total_frames(),
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(source) => Some(source.total_frames()),
        }
    }

    fn fps(&self) -> f64 {
        match &self.backend {
            FileBackend::Synthetic(source) => source.config.fps,
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(source) => source.fps(),
        }
    }

    fn close(&mut self) {
        match &mut self.backend {
            FileBackend::Synthetic(source) => source.close(),
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(source) => source.close(),
        }
    }

    fn describe(&self) -> String {
        match &self.backend {
            FileBackend::Synthetic(source) => source.config.path.clone(),
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(source) => source.stats().source,
        }
    }

    fn stats(&self) -> SourceStats {
        match &self.backend {
            FileBackend::Synthetic(source) => source.stats(),
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(source) => source.stats(),
        }
    }
}

// ----------------------------------------------------------------------------
// Synthetic source (stub://) for tests
// ----------------------------------------------------------------------------

struct SyntheticFileSource {
    config: FileConfig,
    live: bool,
    cursor: u64,
    frame_count: u64,
    opened: bool,
}

impl SyntheticFileSource {
    fn new(config: FileConfig) -> Result<Self> {
        if config.width == 0 || config.height == 0 {
            return Err(anyhow!("synthetic frame size must be non-zero"));
        }
        let live = config.path == LIVE_STUB;
        Ok(Self {
            config,
            live,
            cursor: 0,
            frame_count: 0,
            opened: false,
        })
    }

    fn open(&mut self) -> Result<()> {
        self.opened = true;
        log::info!("FileSource: opened {} (synthetic)", self.config.path);
        Ok(())
    }

    fn read_next(&mut self) -> Result<NextFrame> {
        if !self.opened {
            return Err(anyhow!(
                "synthetic source {} is not open",
                self.config.path
            ));
        }
        if !self.live && self.cursor >= self.config.frames {
            return Ok(NextFrame::EndOfStream);
        }
        let index = self.cursor;
        let pixels = self.generate_synthetic_pixels(index);
        self.cursor += 1;
        self.frame_count += 1;

        Ok(NextFrame::Frame(
            CapturedFrame::from_rgb(pixels, self.config.width, self.config.height, index)
                .with_origin(self.config.path.clone()),
        ))
    }

    fn seek_to_index(&mut self, index: u64) -> Result<()> {
        if self.live {
            return Err(anyhow!("live source {} cannot seek", self.config.path));
        }
        if index >= self.config.frames {
            return Err(anyhow!(
                "frame {} out of range (stream has {} frames)",
                index,
                self.config.frames
            ));
        }
        self.cursor = index;
        Ok(())
    }

    fn total_frames(&self) -> Option<u64> {
        if self.live {
            None
        } else {
            Some(self.config.frames)
        }
    }

    fn close(&mut self) {
        if self.opened {
            log::info!("FileSource: closed {}", self.config.path);
        }
        self.opened = false;
    }

    /// Horizontal gradient whose phase shifts with the frame index, so
    /// neighbouring frames differ.
    fn generate_synthetic_pixels(&self, index: u64) -> Vec<u8> {
        let width = self.config.width as usize;
        let height = self.config.height as usize;
        let mut pixels = vec![0u8; width * height * 3];
        for (i, px) in pixels.chunks_exact_mut(3).enumerate() {
            let x = (i % width) as u64;
            px[0] = ((x + index) % 256) as u8;
            px[1] = ((x * 2 + index) % 256) as u8;
            px[2] = (index % 256) as u8;
        }
        pixels
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            source: self.config.path.clone(),
        }
    }
}

fn is_local_file_path(path: &str) -> bool {
    if path.trim().is_empty() {
        return false;
    }
    if path.starts_with("stub://") {
        return true;
    }
    !path.contains("://")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stub(frames: u64) -> FileSource {
        let mut source = FileSource::new(FileConfig {
            path: "stub://test".to_string(),
            fps: 4.0,
            frames,
            width: 8,
            height: 4,
        })
        .expect("stub source");
        source.open().expect("open");
        source
    }

    #[test]
    fn rejects_remote_urls() {
        let result = FileSource::new(FileConfig {
            path: "http://example.com/video.mp4".to_string(),
            ..FileConfig::default()
        });
        assert!(result.is_err());
    }

    #[test]
    fn reads_until_end_of_stream() {
        let mut source = stub(2);
        assert!(matches!(source.read_next().unwrap(), NextFrame::Frame(_)));
        assert!(matches!(source.read_next().unwrap(), NextFrame::Frame(_)));
        assert!(matches!(source.read_next().unwrap(), NextFrame::EndOfStream));
        assert_eq!(source.stats().frames_captured, 2);
    }

    #[test]
    fn seek_moves_cursor() {
        let mut source = stub(10);
        source.seek_to_index(7).expect("seek");
        match source.read_next().unwrap() {
            NextFrame::Frame(frame) => {
                assert_eq!(frame.index, 7);
                assert_eq!(frame.byte_len(), 8 * 4 * 3);
                assert_eq!(frame.origin.as_deref(), Some("stub://test"));
            }
            NextFrame::EndOfStream => panic!("expected a frame"),
        }
    }

    #[test]
    fn seek_past_end_fails() {
        let mut source = stub(10);
        assert!(source.seek_to_index(10).is_err());
    }

    #[test]
    fn read_before_open_fails() {
        let mut source = FileSource::new(FileConfig {
            path: "stub://closed".to_string(),
            ..FileConfig::default()
        })
        .expect("stub source");
        assert!(source.read_next().is_err());
    }

    #[test]
    fn live_stub_never_ends_and_cannot_seek() {
        let mut source = FileSource::new(FileConfig {
            path: "stub://live".to_string(),
            frames: 1,
            width: 2,
            height: 2,
            ..FileConfig::default()
        })
        .expect("stub source");
        source.open().expect("open");
        for _ in 0..5 {
            assert!(matches!(source.read_next().unwrap(), NextFrame::Frame(_)));
        }
        assert!(source.seek_to_index(0).is_err());
    }
}
