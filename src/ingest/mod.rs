//! Frame ingestion sources.
//!
//! This module provides the sources the acquisition loop pulls frames from:
//! - Local video files (feature: ingest-file-ffmpeg)
//! - Image sequences (a directory of JPEG/PNG stills, one per frame)
//! - Synthetic `stub://` streams (testing, simulated cameras)
//!
//! Every source implements `FrameSource`, so the scheduler treats recorded and
//! live backends the same way. A source with a known frame count is seekable and
//! driven by video time; a source without one (`total_frames() == None`) is
//! live and read with `read_next` only.
//!
//! Sources MUST NOT:
//! - Write decoded frames to disk
//! - Retain frames after handing them to the caller

use anyhow::{anyhow, Result};
use std::path::Path;

use crate::config::SourceSettings;
use crate::frame::CapturedFrame;

pub mod file;
#[cfg(feature = "ingest-file-ffmpeg")]
pub(crate) mod file_ffmpeg;
pub mod sequence;

pub use file::{FileConfig, FileSource};
pub use sequence::ImageSequenceSource;

/// Result of advancing a source cursor.
#[derive(Debug)]
pub enum NextFrame {
    Frame(CapturedFrame),
    EndOfStream,
}

/// Uniform contract over camera and recorded-video backends.
pub trait FrameSource: Send {
    /// Open the underlying device or file. Must be called before reading.
    fn open(&mut self) -> Result<()>;

    /// Decode the frame at the cursor and advance it.
    fn read_next(&mut self) -> Result<NextFrame>;

    /// Move the cursor so the next `read_next` returns frame `index`.
    fn seek_to_index(&mut self, index: u64) -> Result<()>;

    /// Frame count of a recorded stream; `None` for live sources.
    fn total_frames(&self) -> Option<u64>;

    /// Nominal frame rate.
    fn fps(&self) -> f64;

    /// Release the device or file handle. Idempotent.
    fn close(&mut self);

    /// Human-readable origin (path or URI), used for `video_file` metadata.
    fn describe(&self) -> String;

    /// Frames handed out so far.
    fn stats(&self) -> SourceStats;
}

/// Statistics for a frame source.
#[derive(Clone, Debug)]
pub struct SourceStats {
    pub frames_captured: u64,
    pub source: String,
}

/// Length of a recorded stream in seconds; zero for live or degenerate sources.
pub fn stream_duration(source: &dyn FrameSource) -> f64 {
    let fps = source.fps();
    match source.total_frames() {
        Some(total) if total > 0 && fps.is_finite() && fps > 0.0 => total as f64 / fps,
        _ => 0.0,
    }
}

/// Build and open the source named by `settings.uri`.
///
/// - `stub://<name>`: synthetic recorded stream; `stub://live` never ends
/// - an existing directory: image sequence
/// - anything else: a local video file
pub fn open_source(settings: &SourceSettings) -> Result<Box<dyn FrameSource>> {
    let uri = settings.uri.trim();
    if uri.is_empty() {
        return Err(anyhow!("frame source is not configured"));
    }

    let mut source: Box<dyn FrameSource> = if !uri.contains("://") && Path::new(uri).is_dir() {
        Box::new(ImageSequenceSource::new(uri, settings.fps)?)
    } else {
        Box::new(FileSource::new(FileConfig {
            path: uri.to_string(),
            fps: settings.fps,
            frames: settings.frames,
            width: settings.width,
            height: settings.height,
        })?)
    };
    source.open()?;
    log::info!(
        "frame source {} opened: fps={:.2} frames={}",
        source.describe(),
        source.fps(),
        source
            .total_frames()
            .map(|n| n.to_string())
            .unwrap_or_else(|| "live".to_string())
    );
    Ok(source)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_of_synthetic_stream() {
        let source = FileSource::new(FileConfig {
            path: "stub://clip".to_string(),
            fps: 10.0,
            frames: 25,
            ..FileConfig::default()
        })
        .expect("stub source");
        assert!((stream_duration(&source) - 2.5).abs() < 1e-9);
    }

    #[test]
    fn live_stream_has_no_duration() {
        let source = FileSource::new(FileConfig {
            path: "stub://live".to_string(),
            ..FileConfig::default()
        })
        .expect("stub source");
        assert_eq!(source.total_frames(), None);
        assert_eq!(stream_duration(&source), 0.0);
    }

    #[test]
    fn empty_uri_is_rejected() {
        let settings = SourceSettings {
            uri: "  ".to_string(),
            ..SourceSettings::default()
        };
        assert!(open_source(&settings).is_err());
    }
}
