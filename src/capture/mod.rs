//! Capture devices: the frame sources the capture loop pulls from

pub mod decoder;
pub mod frame;
pub mod pattern;
#[cfg(feature = "v4l2")]
pub mod v4l2;

pub use decoder::decode_frame;
pub use frame::{Frame, FrameMetadata, PixelFormat};
pub use pattern::TestPattern;
#[cfg(feature = "v4l2")]
pub use v4l2::V4l2Capture;

use crate::error::CaptureError;
use crate::{CaptureConfig, CaptureSource};

/// A frame source owned exclusively by the capture loop.
///
/// `open` is called once before the first `read`. `read` blocks until a frame
/// is available and returns `Ok(None)` when the source has no more frames.
pub trait CaptureDevice: Send {
    fn name(&self) -> &str;

    fn open(&mut self, width: u32, height: u32) -> Result<(), CaptureError>;

    fn read(&mut self) -> Result<Option<Frame>, CaptureError>;

    /// Release the underlying device. Called once when the capture loop exits.
    fn close(&mut self) {}
}

impl<T: CaptureDevice + ?Sized> CaptureDevice for Box<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn open(&mut self, width: u32, height: u32) -> Result<(), CaptureError> {
        (**self).open(width, height)
    }

    fn read(&mut self) -> Result<Option<Frame>, CaptureError> {
        (**self).read()
    }

    fn close(&mut self) {
        (**self).close()
    }
}

/// Build the configured capture source. The device is not opened here.
pub fn from_config(config: &CaptureConfig) -> Result<Box<dyn CaptureDevice>, CaptureError> {
    match config.source {
        CaptureSource::TestPattern => Ok(Box::new(TestPattern::new(config.fps))),
        #[cfg(feature = "v4l2")]
        CaptureSource::V4l2 => Ok(Box::new(V4l2Capture::new(config.clone()))),
        #[cfg(not(feature = "v4l2"))]
        CaptureSource::V4l2 => Err(CaptureError::Unavailable(
            "built without the `v4l2` feature".into(),
        )),
    }
}
