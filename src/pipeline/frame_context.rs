// src/pipeline/frame_context.rs
//
// What a source hands the pipeline for one frame, and what the pipeline
// produced from it.

use crate::tracking::TrackedVehicle;
use crate::types::{Detection, Frame};
use crate::violations::TrafficViolation;

#[derive(Debug, Clone)]
pub struct FrameInput {
    pub frame: Frame,
    /// Detections recorded alongside the frame. When present the detector
    /// capability is not called.
    pub detections: Option<Vec<Detection>>,
}

impl FrameInput {
    pub fn new(frame: Frame) -> Self {
        Self {
            frame,
            detections: None,
        }
    }

    pub fn with_detections(frame: Frame, detections: Vec<Detection>) -> Self {
        Self {
            frame,
            detections: Some(detections),
        }
    }

    pub fn frame_id(&self) -> u64 {
        self.frame.frame_id
    }
}

#[derive(Debug, Clone)]
pub struct FrameResult {
    pub frame_id: u64,
    pub timestamp_ms: f64,
    /// True when the scheduler skipped analysis; `vehicles` then repeats
    /// the last analysed frame.
    pub skipped: bool,
    pub detections: usize,
    pub vehicles: Vec<TrackedVehicle>,
    pub violations: Vec<TrafficViolation>,
    pub processing_us: u64,
}

impl FrameResult {
    pub fn skipped(frame: &Frame, last_vehicles: &[TrackedVehicle]) -> Self {
        Self {
            frame_id: frame.frame_id,
            timestamp_ms: frame.timestamp_ms,
            skipped: true,
            detections: 0,
            vehicles: last_vehicles.to_vec(),
            violations: Vec::new(),
            processing_us: 0,
        }
    }

    pub fn has_violations(&self) -> bool {
        !self.violations.is_empty()
    }
}
