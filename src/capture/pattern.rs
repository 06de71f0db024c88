//! Synthetic capture source for running without camera hardware

use std::thread;
use std::time::{Duration, Instant};

use image::{Rgb, RgbImage};

use super::{CaptureDevice, Frame};
use crate::error::CaptureError;

const BARS: [[u8; 3]; 7] = [
    [192, 192, 192],
    [192, 192, 0],
    [0, 192, 192],
    [0, 192, 0],
    [192, 0, 192],
    [192, 0, 0],
    [0, 0, 192],
];

/// Color bars with a white square sweeping across them, paced to `fps`
pub struct TestPattern {
    fps: u32,
    width: u32,
    height: u32,
    sequence: u64,
    limit: Option<u64>,
    next_due: Option<Instant>,
    opened: bool,
}

impl TestPattern {
    pub fn new(fps: u32) -> Self {
        Self {
            fps: fps.max(1),
            width: 0,
            height: 0,
            sequence: 0,
            limit: None,
            next_due: None,
            opened: false,
        }
    }

    /// End the stream after `frames` frames
    pub fn with_limit(mut self, frames: u64) -> Self {
        self.limit = Some(frames);
        self
    }

    fn render(&self) -> RgbImage {
        let (width, height) = (self.width, self.height);
        let bar_width = (width / BARS.len() as u32).max(1);
        let side = (height / 4).max(1);
        let travel = width.saturating_sub(side).max(1);
        let square_x = ((self.sequence * 4) % u64::from(travel)) as u32;
        let square_y = (height - side) / 2;

        RgbImage::from_fn(width, height, |x, y| {
            let in_square =
                x >= square_x && x < square_x + side && y >= square_y && y < square_y + side;
            if in_square {
                Rgb([255, 255, 255])
            } else {
                let bar = ((x / bar_width) as usize).min(BARS.len() - 1);
                Rgb(BARS[bar])
            }
        })
    }

    fn pace(&mut self) {
        let period = Duration::from_secs(1) / self.fps;
        let now = Instant::now();
        match self.next_due {
            Some(due) if due > now => {
                thread::sleep(due - now);
                self.next_due = Some(due + period);
            }
            _ => self.next_due = Some(now + period),
        }
    }
}

impl CaptureDevice for TestPattern {
    fn name(&self) -> &str {
        "test-pattern"
    }

    fn open(&mut self, width: u32, height: u32) -> Result<(), CaptureError> {
        if width == 0 || height == 0 {
            return Err(CaptureError::Unavailable(format!(
                "cannot render a {width}x{height} pattern"
            )));
        }
        self.width = width;
        self.height = height;
        self.opened = true;
        Ok(())
    }

    fn read(&mut self) -> Result<Option<Frame>, CaptureError> {
        if !self.opened {
            return Err(CaptureError::NotOpen);
        }
        if self.limit.is_some_and(|limit| self.sequence >= limit) {
            return Ok(None);
        }

        self.pace();
        self.sequence += 1;
        Ok(Some(Frame::from_rgb(self.render(), self.sequence)))
    }

    fn close(&mut self) {
        self.opened = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::PixelFormat;

    #[test]
    fn read_before_open_fails() {
        let mut pattern = TestPattern::new(1000);
        assert!(matches!(pattern.read(), Err(CaptureError::NotOpen)));
    }

    #[test]
    fn yields_frames_until_limit() {
        let mut pattern = TestPattern::new(1000).with_limit(2);
        pattern.open(16, 8).unwrap();

        let first = pattern.read().unwrap().unwrap();
        assert_eq!(first.meta.sequence, 1);
        assert_eq!((first.meta.width, first.meta.height), (16, 8));
        assert_eq!(first.meta.format, PixelFormat::Rgb24);
        assert_eq!(first.data.len(), 16 * 8 * 3);

        let second = pattern.read().unwrap().unwrap();
        assert_ne!(first.data, second.data, "square should move between frames");
        assert!(pattern.read().unwrap().is_none());
    }

    #[test]
    fn zero_resolution_fails_to_open() {
        let mut pattern = TestPattern::new(30);
        assert!(pattern.open(0, 480).is_err());
    }
}
