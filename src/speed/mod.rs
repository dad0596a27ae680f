// src/speed/mod.rs

pub mod calibration;
pub mod speed_analyzer;

pub use calibration::{
    point_in_polygon, CalibrationPoint, CalibrationValidation, CalibrationZone, CameraCalibrator,
    Homography, ZoneDirection,
};
pub use speed_analyzer::{
    SpeedAnalyzer, SpeedConfig, SpeedMeasurement, SpeedStats, SpeedUnit, SpeedViolation,
};
