//! Wire payload construction.
//!
//! A payload is one frame (RGB JPEG, base64), one observation and the
//! metadata map. Formatting either produces the whole payload or fails; there
//! is no partial output.

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use serde::{Deserialize, Serialize};

use crate::frame::{CapturedFrame, FrameData};
use crate::metadata::Metadata;
use crate::sensor::Observation;

pub const DEFAULT_JPEG_QUALITY: u8 = 75;

/// JSON telemetry sent to the broker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TelemetryPayload {
    pub image_data: String,
    pub sensor_data: Observation,
    pub metadata: Metadata,
}

#[derive(Clone, Debug)]
pub struct PayloadFormatter {
    jpeg_quality: u8,
}

impl Default for PayloadFormatter {
    fn default() -> Self {
        Self {
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

impl PayloadFormatter {
    pub fn new(jpeg_quality: u8) -> Self {
        Self {
            jpeg_quality: jpeg_quality.clamp(1, 100),
        }
    }

    pub fn format(
        &self,
        frame: &CapturedFrame,
        observation: Observation,
        mut metadata: Metadata,
    ) -> Result<TelemetryPayload> {
        let jpeg = self
            .encode_frame(frame)
            .with_context(|| format!("encode frame {}", frame.index))?;
        metadata.normalize_hints();
        Ok(TelemetryPayload {
            image_data: STANDARD.encode(jpeg),
            sensor_data: observation,
            metadata,
        })
    }

    /// Re-encode the frame as an RGB JPEG, whatever the source colorspace.
    pub fn encode_frame(&self, frame: &CapturedFrame) -> Result<Vec<u8>> {
        let rgb = match frame.data() {
            FrameData::Rgb {
                pixels,
                width,
                height,
            } => {
                let expected = (*width as usize) * (*height as usize) * 3;
                if *width == 0 || *height == 0 || pixels.len() != expected {
                    return Err(anyhow!(
                        "RGB frame {}x{} has {} bytes, expected {}",
                        width,
                        height,
                        pixels.len(),
                        expected
                    ));
                }
                RgbImage::from_raw(*width, *height, pixels.clone())
                    .ok_or_else(|| anyhow!("RGB buffer does not match frame dimensions"))?
            }
            FrameData::Encoded(bytes) => image::load_from_memory(bytes)
                .context("decode still image")?
                .into_rgb8(),
        };

        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, self.jpeg_quality)
            .encode_image(&rgb)
            .context("JPEG encode")?;
        Ok(out)
    }
}
