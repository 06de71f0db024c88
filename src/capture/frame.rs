use bytes::Bytes;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Raw frame as delivered by a capture device
#[derive(Clone)]
pub struct Frame {
    /// Immutable frame data - can be shared across threads without copying
    pub data: Bytes,

    /// Frame metadata
    pub meta: FrameMetadata,

    /// When the frame left the device; the capture loop measures latency from here
    pub timestamp: Instant,
}

/// Frame metadata
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    /// Bytes per row for packed formats, luma row length for NV12
    pub stride: u32,
    pub format: PixelFormat,
}

/// Pixel formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Rgb24,
    Bgr24,
    Yuyv4,
    Mjpeg,
    Nv12,
}

impl PixelFormat {
    /// Bytes per row for a tightly packed frame of `width` pixels
    pub fn packed_stride(self, width: u32) -> u32 {
        match self {
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => width * 3,
            PixelFormat::Yuyv4 => width * 2,
            PixelFormat::Nv12 => width,
            PixelFormat::Mjpeg => 0,
        }
    }
}

impl Frame {
    /// Wrap a decoded RGB image, e.g. from a synthetic source
    pub fn from_rgb(image: RgbImage, sequence: u64) -> Self {
        let (width, height) = image.dimensions();
        Self {
            data: Bytes::from(image.into_raw()),
            meta: FrameMetadata {
                sequence,
                width,
                height,
                stride: width * 3,
                format: PixelFormat::Rgb24,
            },
            timestamp: Instant::now(),
        }
    }

    /// Wrap a JPEG payload produced by the device's own encoder
    pub fn from_jpeg(data: Bytes, width: u32, height: u32, sequence: u64) -> Self {
        Self {
            data,
            meta: FrameMetadata {
                sequence,
                width,
                height,
                stride: 0,
                format: PixelFormat::Mjpeg,
            },
            timestamp: Instant::now(),
        }
    }

    pub fn is_encoded(&self) -> bool {
        self.meta.format == PixelFormat::Mjpeg
    }
}
