pub mod client;
pub mod scanner;

use std::io::Cursor;
use std::str::FromStr;

use bytes::Bytes;
use image::{DynamicImage, ImageFormat, ImageReader};

use crate::error::{Error, FrameError};

/// One complete JPEG image cut out of the camera stream, start marker
/// through end marker inclusive.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Position in the stream since the extractor started. Gaps mean frames
    /// were rejected by validation.
    pub sequence: u64,
    pub data: Bytes,
    /// Width and height, when validation read the image header.
    pub dimensions: Option<(u32, u32)>,
}

impl Frame {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Fully decode the image. A failure here means the marker-delimited
    /// bytes were not a usable JPEG; consumers should skip the frame.
    pub fn decode(&self) -> Result<DynamicImage, FrameError> {
        image::load_from_memory_with_format(&self.data, ImageFormat::Jpeg).map_err(|e| {
            FrameError::FrameDecode {
                sequence: self.sequence,
                reason: e.to_string(),
            }
        })
    }
}

/// How much checking the extractor does before handing a frame out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameValidation {
    /// Markers only.
    None,
    /// Parse the JPEG header and record dimensions.
    Header,
    /// Decode the whole image. Costly; runs on the blocking pool.
    Decode,
}

impl FromStr for FrameValidation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "header" => Ok(Self::Header),
            "decode" => Ok(Self::Decode),
            other => Err(Error::Config(format!(
                "CAMERA_VALIDATION must be none, header or decode, got {other:?}"
            ))),
        }
    }
}

impl FrameValidation {
    /// Check one candidate frame. Returns the image dimensions when they
    /// were read.
    pub fn check(self, sequence: u64, data: &[u8]) -> Result<Option<(u32, u32)>, FrameError> {
        let failed = |e: image::ImageError| FrameError::FrameDecode {
            sequence,
            reason: e.to_string(),
        };
        match self {
            Self::None => Ok(None),
            Self::Header => ImageReader::with_format(Cursor::new(data), ImageFormat::Jpeg)
                .into_dimensions()
                .map(Some)
                .map_err(failed),
            Self::Decode => image::load_from_memory_with_format(data, ImageFormat::Jpeg)
                .map(|img| Some((img.width(), img.height())))
                .map_err(failed),
        }
    }
}
