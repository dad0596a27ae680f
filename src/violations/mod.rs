// src/violations/mod.rs

pub mod cooldown;
pub mod detectors;
pub mod engine;
pub mod rules;
pub mod types;

pub use cooldown::{CooldownTracker, PlateDedup, ViolationState};
pub use detectors::{
    angle_between_deg, default_detectors, DetectionContext, FollowingDistanceDetector,
    LaneRuleDetector, SpeedDetector, ViolationDetector, WrongWayDetector,
};
pub use engine::{EngineStats, PlateUpdate, ViolationEngine, ViolationsConfig};
pub use rules::{RuleSet, ViolationRule};
pub use types::{
    EvidenceRef, TrafficViolation, ViolationCandidate, ViolationDetails, ViolationLocation,
    ViolationType, MAX_RECORDABLE_SPEED_KMH,
};
