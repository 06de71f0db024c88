//! Detection results and the detector seam used by the capture loop

pub mod motion;

pub use motion::MotionDetector;

use image::RgbImage;
use serde::{Deserialize, Serialize};

use crate::error::DetectError;
use crate::DetectionConfig;

/// One recognition result, in frame pixel coordinates.
///
/// Serializes as
/// `{"bbox":[x1,y1,x2,y2],"confidence":c,"class_id":n,"class_name":s,"center_x":x,"center_y":y}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: [f32; 4],
    pub confidence: f32,
    pub class_id: i64,
    pub class_name: String,
    pub center_x: f32,
    pub center_y: f32,
}

impl Detection {
    /// Build a detection from corner coordinates; the center is derived and
    /// the confidence clamped to `[0, 1]`. Non-finite inputs become 0 so the
    /// JSON never carries `null`.
    pub fn new(bbox: [f32; 4], confidence: f32, class_id: i64, class_name: impl Into<String>) -> Self {
        let bbox = bbox.map(finite_or_zero);
        let [x1, y1, x2, y2] = bbox;
        Self {
            bbox,
            confidence: finite_or_zero(confidence).clamp(0.0, 1.0),
            class_id,
            class_name: class_name.into(),
            center_x: (x1 + x2) / 2.0,
            center_y: (y1 + y2) / 2.0,
        }
    }

    pub fn center(&self) -> (f32, f32) {
        (self.center_x, self.center_y)
    }

    pub fn label(&self) -> String {
        format!("{}: {:.2}", self.class_name, self.confidence)
    }
}

fn finite_or_zero(value: f32) -> f32 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

/// Object detector backend.
///
/// Runs on the capture thread, so implementations may block. The image is
/// borrowed for the duration of the call only.
pub trait Detector: Send {
    fn name(&self) -> &'static str;

    /// Detections in detector output order
    fn infer(&mut self, image: &RgbImage) -> Result<Vec<Detection>, DetectError>;
}

/// Built-in detector for the given configuration, if inference is enabled
pub fn from_config(config: &DetectionConfig) -> Option<Box<dyn Detector>> {
    config
        .enabled
        .then(|| Box::new(MotionDetector::new(config.threshold, config.min_area)) as Box<dyn Detector>)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn center_is_midpoint_of_box() {
        let d = Detection::new([10.0, 20.0, 30.0, 60.0], 0.9, 0, "person");
        assert_eq!(d.center(), (20.0, 40.0));
        assert_eq!(d.label(), "person: 0.90");
    }

    #[test]
    fn confidence_is_clamped() {
        assert_eq!(Detection::new([0.0; 4], 1.7, 1, "x").confidence, 1.0);
        assert_eq!(Detection::new([0.0; 4], -0.2, 1, "x").confidence, 0.0);
    }

    #[test]
    fn non_finite_values_become_zero() {
        let d = Detection::new([f32::NAN, 1.0, f32::INFINITY, 3.0], f32::NAN, 1, "x");
        assert_eq!(d.bbox, [0.0, 1.0, 0.0, 3.0]);
        assert_eq!(d.confidence, 0.0);
        assert_eq!(d.center(), (0.0, 2.0));

        let value = serde_json::to_value(&d).unwrap();
        assert_eq!(value["confidence"], 0.0);
        assert!(value["bbox"].as_array().unwrap().iter().all(|v| v.is_number()));
    }

    #[test]
    fn json_round_trip() {
        let detections = vec![
            Detection::new([1.5, 2.25, 100.75, 200.125], 0.87654, 2, "car"),
            Detection::new([0.0, 0.0, 639.0, 479.0], 0.5, 0, "person"),
        ];
        let json = serde_json::to_string(&detections).unwrap();
        let decoded: Vec<Detection> = serde_json::from_str(&json).unwrap();

        assert_eq!(decoded.len(), detections.len());
        for (a, b) in decoded.iter().zip(&detections) {
            for (x, y) in a.bbox.iter().zip(&b.bbox) {
                assert!((x - y).abs() < 1e-4);
            }
            assert!((a.confidence - b.confidence).abs() < 1e-6);
            assert!((a.center_x - b.center_x).abs() < 1e-4);
            assert!((a.center_y - b.center_y).abs() < 1e-4);
            assert_eq!(a.class_id, b.class_id);
            assert_eq!(a.class_name, b.class_name);
        }
    }

    #[test]
    fn wire_field_names() {
        let d = Detection::new([0.0, 0.0, 2.0, 2.0], 1.0, 3, "dog");
        let value = serde_json::to_value(&d).unwrap();
        for key in ["bbox", "confidence", "class_id", "class_name", "center_x", "center_y"] {
            assert!(value.get(key).is_some(), "missing {key}");
        }
        assert_eq!(value["bbox"].as_array().unwrap().len(), 4);
    }

    #[test]
    fn disabled_detection_builds_nothing() {
        let config = DetectionConfig {
            enabled: false,
            ..DetectionConfig::default()
        };
        assert!(from_config(&config).is_none());
        assert!(from_config(&DetectionConfig::default()).is_some());
    }
}
