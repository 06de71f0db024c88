use image::{imageops, GrayImage, RgbImage};

use super::{Detection, Detector};
use crate::error::DetectError;

pub const MOTION_CLASS_ID: i64 = 0;
pub const MOTION_CLASS_NAME: &str = "motion";

/// Frame-differencing detector.
///
/// Compares each frame's luma against the previous one and reports a single
/// `motion` box around every pixel whose difference exceeds `threshold`.
/// Confidence is the share of changed pixels inside that box.
pub struct MotionDetector {
    threshold: u8,
    min_area: u32,
    previous: Option<GrayImage>,
}

impl MotionDetector {
    pub fn new(threshold: u8, min_area: u32) -> Self {
        Self {
            threshold,
            min_area,
            previous: None,
        }
    }
}

impl Detector for MotionDetector {
    fn name(&self) -> &'static str {
        "motion"
    }

    fn infer(&mut self, image: &RgbImage) -> Result<Vec<Detection>, DetectError> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(DetectError::InvalidInput(format!(
                "empty {width}x{height} image"
            )));
        }

        let current = imageops::grayscale(image);
        let region = match &self.previous {
            // Resolution changes reset the baseline
            Some(previous) if previous.dimensions() == current.dimensions() => {
                changed_region(previous, &current, self.threshold)
            }
            _ => None,
        };
        self.previous = Some(current);

        let Some(([x1, y1, x2, y2], changed)) = region else {
            return Ok(Vec::new());
        };
        if changed < self.min_area {
            return Ok(Vec::new());
        }

        let area = (x2 - x1 + 1) * (y2 - y1 + 1);
        let confidence = changed as f32 / area as f32;
        Ok(vec![Detection::new(
            [x1 as f32, y1 as f32, (x2 + 1) as f32, (y2 + 1) as f32],
            confidence,
            MOTION_CLASS_ID,
            MOTION_CLASS_NAME,
        )])
    }
}

/// Bounding box (inclusive corners) and count of pixels that changed
fn changed_region(previous: &GrayImage, current: &GrayImage, threshold: u8) -> Option<([u32; 4], u32)> {
    let (mut x1, mut y1, mut x2, mut y2) = (u32::MAX, u32::MAX, 0u32, 0u32);
    let mut changed = 0u32;
    for (x, y, px) in current.enumerate_pixels() {
        if px[0].abs_diff(previous.get_pixel(x, y)[0]) > threshold {
            changed += 1;
            x1 = x1.min(x);
            y1 = y1.min(y);
            x2 = x2.max(x);
            y2 = y2.max(y);
        }
    }
    (changed > 0).then_some(([x1, y1, x2, y2], changed))
}
