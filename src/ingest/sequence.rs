//! Image sequence frame source.
//!
//! Treats a directory of stills (`.jpg`, `.jpeg`, `.png`) as a recorded stream:
//! files sorted by name are frames 0..n at a configured frame rate. Frames are
//! handed out still encoded; decoding happens in the formatter.

use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};

use super::{FrameSource, NextFrame, SourceStats};
use crate::frame::CapturedFrame;

const STILL_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

pub struct ImageSequenceSource {
    dir: PathBuf,
    fps: f64,
    files: Vec<PathBuf>,
    cursor: u64,
    frame_count: u64,
    opened: bool,
}

impl ImageSequenceSource {
    pub fn new(dir: impl AsRef<Path>, fps: f64) -> Result<Self> {
        if !fps.is_finite() || fps <= 0.0 {
            return Err(anyhow!("image sequence fps must be positive, got {}", fps));
        }
        Ok(Self {
            dir: dir.as_ref().to_path_buf(),
            fps,
            files: Vec::new(),
            cursor: 0,
            frame_count: 0,
            opened: false,
        })
    }
}

impl FrameSource for ImageSequenceSource {
    fn open(&mut self) -> Result<()> {
        let entries = std::fs::read_dir(&self.dir)
            .with_context(|| format!("failed to open image directory {}", self.dir.display()))?;
        let mut files = Vec::new();
        for entry in entries {
            let path = entry.context("read image directory entry")?.path();
            let is_still = path
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| STILL_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                .unwrap_or(false);
            if is_still && path.is_file() {
                files.push(path);
            }
        }
        files.sort();
        log::info!(
            "ImageSequenceSource: opened {} ({} stills)",
            self.dir.display(),
            files.len()
        );
        self.files = files;
        self.cursor = 0;
        self.opened = true;
        Ok(())
    }

    fn read_next(&mut self) -> Result<NextFrame> {
        if !self.opened {
            return Err(anyhow!(
                "image sequence {} is not open",
                self.dir.display()
            ));
        }
        let Some(path) = self.files.get(self.cursor as usize) else {
            return Ok(NextFrame::EndOfStream);
        };
        let bytes = std::fs::read(path)
            .with_context(|| format!("failed to read still {}", path.display()))?;
        let frame = CapturedFrame::from_encoded(bytes, self.cursor)
            .with_origin(path.display().to_string());
        self.cursor += 1;
        self.frame_count += 1;
        Ok(NextFrame::Frame(frame))
    }

    fn seek_to_index(&mut self, index: u64) -> Result<()> {
        if index as usize >= self.files.len() {
            return Err(anyhow!(
                "frame {} out of range (sequence has {} stills)",
                index,
                self.files.len()
            ));
        }
        self.cursor = index;
        Ok(())
    }

    fn total_frames(&self) -> Option<u64> {
        Some(self.files.len() as u64)
    }

    fn fps(&self) -> f64 {
        self.fps
    }

    fn close(&mut self) {
        self.opened = false;
        self.files.clear();
    }

    fn describe(&self) -> String {
        self.dir.display().to_string()
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            source: self.describe(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orders_stills_by_name_and_skips_other_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("b.jpg"), b"second").unwrap();
        std::fs::write(dir.path().join("a.PNG"), b"first").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        let mut source = ImageSequenceSource::new(dir.path(), 2.0).expect("source");
        source.open().expect("open");
        assert_eq!(source.total_frames(), Some(2));

        let NextFrame::Frame(first) = source.read_next().unwrap() else {
            panic!("expected first still");
        };
        assert_eq!(first.index, 0);
        assert!(first.origin.unwrap().ends_with("a.PNG"));

        source.seek_to_index(1).expect("seek");
        let NextFrame::Frame(second) = source.read_next().unwrap() else {
            panic!("expected second still");
        };
        assert_eq!(second.index, 1);
        assert!(matches!(source.read_next().unwrap(), NextFrame::EndOfStream));
    }

    #[test]
    fn missing_directory_fails_to_open() {
        let mut source = ImageSequenceSource::new("/nonexistent/flood/stills", 1.0).unwrap();
        assert!(source.open().is_err());
    }

    #[test]
    fn zero_fps_is_rejected() {
        assert!(ImageSequenceSource::new("/tmp", 0.0).is_err());
    }
}
