// src/lanes/mod.rs

pub mod lane_checker;
pub mod lane_detector;

pub use lane_checker::{Departure, LaneCheckConfig, LaneChecker, LanePosition, LaneViolation};
pub use lane_detector::{
    fit_quadratic, LaneConfig, LaneDetector, LaneGeometry, LaneLine, LaneMarking, LaneSide,
    LineSegment, RegionOfInterest,
};
