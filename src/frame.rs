//! Captured frame handles.
//!
//! A `CapturedFrame` is what a frame source hands to the acquisition loop: the
//! image itself, where it sits in the source stream, and when it was grabbed.
//! Ownership moves to the caller, which drops the frame once the formatter has
//! encoded it. Nothing here touches the filesystem.

use crate::unix_now;

/// Image content carried by a frame.
pub enum FrameData {
    /// Packed RGB24 pixels, row-major, no row padding.
    Rgb {
        pixels: Vec<u8>,
        width: u32,
        height: u32,
    },
    /// An encoded still (JPEG, PNG) exactly as produced by the source.
    Encoded(Vec<u8>),
}

impl std::fmt::Debug for FrameData {
    // Pixel buffers are large; only describe their shape.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rgb { width, height, .. } => write!(f, "Rgb({}x{})", width, height),
            Self::Encoded(bytes) => write!(f, "Encoded({} bytes)", bytes.len()),
        }
    }
}

/// A single frame plus its capture descriptor.
#[derive(Debug)]
pub struct CapturedFrame {
    data: FrameData,

    /// Index of this frame within its source stream.
    pub index: u64,

    /// Video-relative position in seconds, when the frame came from a recorded stream.
    pub video_timestamp_sec: Option<f64>,

    /// Wall-clock capture time (unix seconds).
    pub capture_wall_time: f64,

    /// Source the frame was read from (file path or stream URI).
    pub origin: Option<String>,
}

impl CapturedFrame {
    /// Wrap raw RGB24 pixels. Called by the ingestion layer.
    pub fn from_rgb(pixels: Vec<u8>, width: u32, height: u32, index: u64) -> Self {
        Self::new(
            FrameData::Rgb {
                pixels,
                width,
                height,
            },
            index,
        )
    }

    /// Wrap an encoded still image.
    pub fn from_encoded(bytes: Vec<u8>, index: u64) -> Self {
        Self::new(FrameData::Encoded(bytes), index)
    }

    fn new(data: FrameData, index: u64) -> Self {
        Self {
            data,
            index,
            video_timestamp_sec: None,
            capture_wall_time: unix_now(),
            origin: None,
        }
    }

    pub fn with_video_timestamp(mut self, seconds: f64) -> Self {
        self.video_timestamp_sec = Some(seconds);
        self
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn data(&self) -> &FrameData {
        &self.data
    }

    /// Size of the held image in bytes (raw pixels or encoded payload).
    pub fn byte_len(&self) -> usize {
        match &self.data {
            FrameData::Rgb { pixels, .. } => pixels.len(),
            FrameData::Encoded(bytes) => bytes.len(),
        }
    }
}
