// src/capabilities.rs
//
// Interfaces to the external detection stack. Models live outside this
// crate; the pipeline only sees these traits and must cope with any of
// them being absent or failing.

use crate::error::DetectionError;
use crate::lanes::{LineSegment, RegionOfInterest};
use crate::types::{Detection, Frame};

/// Object detector (vehicles).
pub trait Detector: Send + Sync {
    fn detect(&self, frame: &Frame, confidence_threshold: f32)
        -> Result<Vec<Detection>, DetectionError>;
}

/// Recognized plate text with the reader's confidence.
#[derive(Debug, Clone, PartialEq)]
pub struct PlateRead {
    pub text: String,
    pub confidence: f32,
}

/// License plate OCR. `Ok(None)` means no plate could be read.
pub trait PlateReader: Send + Sync {
    fn read_plate(&self, frame: &Frame, bbox: [f32; 4])
        -> Result<Option<PlateRead>, DetectionError>;
}

/// Edge/line primitive extraction (e.g. Hough segments) inside the ROI.
pub trait LanePrimitiveSource: Send + Sync {
    fn detect_lane_primitives(
        &self,
        frame: &Frame,
        roi: &RegionOfInterest,
    ) -> Result<Vec<LineSegment>, DetectionError>;
}

/// Normalise plate text for identity comparisons ("abc 123" == "ABC-123").
pub fn normalize_plate(text: &str) -> String {
    text.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_plate() {
        assert_eq!(normalize_plate("abc-123"), "ABC123");
        assert_eq!(normalize_plate(" ABC 123 "), "ABC123");
        assert_eq!(normalize_plate("--"), "");
    }
}
