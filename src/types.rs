// src/types.rs
//
// Value types shared by every stage of the analysis chain.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

// ============================================================================
// FRAMES
// ============================================================================

/// One decoded camera frame. Pixel data is shared so skipped or replayed
/// frames never copy the buffer.
#[derive(Debug, Clone)]
pub struct Frame {
    pub frame_id: u64,
    pub timestamp_ms: f64,
    pub width: u32,
    pub height: u32,
    pub data: Arc<Vec<u8>>,
}

impl Frame {
    pub fn new(frame_id: u64, timestamp_ms: f64, width: u32, height: u32, data: Vec<u8>) -> Self {
        Self {
            frame_id,
            timestamp_ms,
            width,
            height,
            data: Arc::new(data),
        }
    }

    /// Frame without pixel payload (detections supplied out of band).
    pub fn empty(frame_id: u64, timestamp_ms: f64, width: u32, height: u32) -> Self {
        Self::new(frame_id, timestamp_ms, width, height, Vec::new())
    }
}

// ============================================================================
// DETECTIONS
// ============================================================================

/// One detector output for one frame. Consumed immediately, never retained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: [f32; 4], // [x1, y1, x2, y2] pixels
    pub confidence: f32,
    pub class_id: u32,
    pub class_name: String,
}

impl Detection {
    pub fn new(bbox: [f32; 4], confidence: f32, class_name: &str) -> Self {
        Self {
            bbox,
            confidence,
            class_id: VehicleClass::from_name(class_name).coco_id(),
            class_name: class_name.to_string(),
        }
    }

    pub fn center(&self) -> (f32, f32) {
        bbox_center(&self.bbox)
    }

    pub fn area(&self) -> f32 {
        bbox_area(&self.bbox)
    }

    /// Finite, non-inverted box and a confidence in [0, 1].
    pub fn is_well_formed(&self) -> bool {
        bbox_is_valid(&self.bbox) && (0.0..=1.0).contains(&self.confidence)
    }
}

pub fn bbox_center(b: &[f32; 4]) -> (f32, f32) {
    ((b[0] + b[2]) * 0.5, (b[1] + b[3]) * 0.5)
}

pub fn bbox_area(b: &[f32; 4]) -> f32 {
    (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0)
}

pub fn bbox_is_valid(b: &[f32; 4]) -> bool {
    b.iter().all(|v| v.is_finite()) && b[2] > b[0] && b[3] > b[1]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VehicleClass {
    Car,
    Motorcycle,
    Bus,
    Truck,
    Bicycle,
    Other,
}

impl VehicleClass {
    pub fn from_name(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "car" => Self::Car,
            "motorcycle" | "motorbike" => Self::Motorcycle,
            "bus" => Self::Bus,
            "truck" => Self::Truck,
            "bicycle" => Self::Bicycle,
            _ => Self::Other,
        }
    }

    /// COCO class ids used by the stock detector models.
    pub fn coco_id(&self) -> u32 {
        match self {
            Self::Bicycle => 1,
            Self::Car => 2,
            Self::Motorcycle => 3,
            Self::Bus => 5,
            Self::Truck => 7,
            Self::Other => u32::MAX,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Car => "car",
            Self::Motorcycle => "motorcycle",
            Self::Bus => "bus",
            Self::Truck => "truck",
            Self::Bicycle => "bicycle",
            Self::Other => "other",
        }
    }
}

// ============================================================================
// SEVERITY
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Minor,
    Moderate,
    Severe,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Minor => "minor",
            Self::Moderate => "moderate",
            Self::Severe => "severe",
            Self::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "minor" => Some(Self::Minor),
            "moderate" => Some(Self::Moderate),
            "severe" => Some(Self::Severe),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }

    pub fn all() -> [Severity; 4] {
        [Self::Minor, Self::Moderate, Self::Severe, Self::Critical]
    }
}

/// Lower bounds of the moderate/severe/critical buckets. Anything below
/// `moderate` is minor. Bounds are inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeverityThresholds {
    pub moderate: f64,
    pub severe: f64,
    pub critical: f64,
}

impl SeverityThresholds {
    pub fn bucket(&self, amount: f64) -> Severity {
        if amount >= self.critical {
            Severity::Critical
        } else if amount >= self.severe {
            Severity::Severe
        } else if amount >= self.moderate {
            Severity::Moderate
        } else {
            Severity::Minor
        }
    }
}

impl Default for SeverityThresholds {
    fn default() -> Self {
        // km/h over the limit
        Self {
            moderate: 10.0,
            severe: 25.0,
            critical: 50.0,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_bucket_boundaries_are_inclusive() {
        let t = SeverityThresholds::default();
        assert_eq!(t.bucket(9.99), Severity::Minor);
        assert_eq!(t.bucket(10.0), Severity::Moderate, "exactly +10 is moderate");
        assert_eq!(t.bucket(25.0), Severity::Severe);
        assert_eq!(t.bucket(49.9), Severity::Severe);
        assert_eq!(t.bucket(50.0), Severity::Critical);
    }

    #[test]
    fn test_malformed_detection_rejected() {
        let good = Detection::new([10.0, 10.0, 50.0, 40.0], 0.9, "car");
        assert!(good.is_well_formed());
        assert_eq!(good.class_id, 2);

        let inverted = Detection::new([50.0, 10.0, 10.0, 40.0], 0.9, "car");
        assert!(!inverted.is_well_formed());

        let nan = Detection::new([f32::NAN, 10.0, 50.0, 40.0], 0.9, "car");
        assert!(!nan.is_well_formed());

        let overconfident = Detection::new([10.0, 10.0, 50.0, 40.0], 1.5, "car");
        assert!(!overconfident.is_well_formed());
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::Severe);
        assert!(Severity::Moderate > Severity::Minor);
        assert_eq!(Severity::parse("severe"), Some(Severity::Severe));
    }
}
