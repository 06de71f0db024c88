//! Error taxonomy for the capture → publish → stream pipeline
//!
//! Each component owns the errors it can raise. `PipelineError` is the
//! vocabulary the capture loop and stream sessions use to decide how far a
//! failure reaches: the loop, one iteration, or one client.

use thiserror::Error;

use crate::capture::PixelFormat;

/// Failures raised by a capture device
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("device I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("device {0} does not support video capture")]
    NotCapture(String),

    #[error("capture source unavailable: {0}")]
    Unavailable(String),

    #[error("device read before open")]
    NotOpen,
}

/// Failures raised by the detection collaborator
#[derive(Debug, Error)]
pub enum DetectError {
    #[error("detector rejected input: {0}")]
    InvalidInput(String),

    #[error("detector backend failed: {0}")]
    Backend(String),
}

/// Failures raised while converting between encoded and raw frames
#[derive(Debug, Error)]
pub enum CodecError {
    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error("frame buffer holds {actual} bytes, expected at least {expected}")]
    ShortBuffer { expected: usize, actual: usize },

    #[error("cannot decode {0:?} frames")]
    Unsupported(PixelFormat),

    #[error("image has zero width or height")]
    EmptyImage,
}

/// Configuration loading and validation failures
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Source(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Pipeline-level failure classes.
///
/// `DeviceOpen` and `FrameAcquisition` stop the capture loop. `Inference` and
/// `Encoding` drop a single iteration. `ClientWrite` ends a single session.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to open capture device: {0}")]
    DeviceOpen(#[source] CaptureError),

    #[error("frame acquisition failed: {0}")]
    FrameAcquisition(#[source] CaptureError),

    #[error("inference failed: {0}")]
    Inference(#[from] DetectError),

    #[error("encoding failed: {0}")]
    Encoding(#[from] CodecError),

    #[error("client connection closed")]
    ClientWrite,
}

impl PipelineError {
    /// Short label used for metrics and log fields
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DeviceOpen(_) => "device_open",
            Self::FrameAcquisition(_) => "frame_acquisition",
            Self::Inference(_) => "inference",
            Self::Encoding(_) => "encoding",
            Self::ClientWrite => "client_write",
        }
    }
}
