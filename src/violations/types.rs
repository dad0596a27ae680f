// src/violations/types.rs
//
// The unified violation record. The type-specific payload lives in
// `ViolationDetails`, so adding a violation kind means adding a variant
// and a detector, not another branch in every consumer.

use crate::error::ValidationError;
use crate::lanes::{Departure, LaneMarking};
use crate::types::{bbox_is_valid, Severity};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Speeds outside this range are refused at validation time (km/h).
pub const MAX_RECORDABLE_SPEED_KMH: f64 = 300.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationType {
    Speeding,
    Lane,
    WrongWay,
    RedLight,
    StopSign,
    IllegalTurn,
    Parking,
    FollowingDistance,
}

impl ViolationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Speeding => "speeding",
            Self::Lane => "lane_violation",
            Self::WrongWay => "wrong_way",
            Self::RedLight => "red_light",
            Self::StopSign => "stop_sign",
            Self::IllegalTurn => "illegal_turn",
            Self::Parking => "parking",
            Self::FollowingDistance => "following_distance",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::all().into_iter().find(|t| t.as_str() == s)
    }

    /// Default suppression window for repeat reports.
    pub fn default_cooldown_secs(&self) -> f64 {
        match self {
            Self::Speeding => 30.0,
            Self::Lane => 15.0,
            Self::WrongWay => 60.0,
            Self::RedLight => 120.0,
            Self::StopSign => 60.0,
            Self::IllegalTurn => 45.0,
            Self::Parking => 300.0,
            Self::FollowingDistance => 20.0,
        }
    }

    pub fn all() -> [ViolationType; 8] {
        [
            Self::Speeding,
            Self::Lane,
            Self::WrongWay,
            Self::RedLight,
            Self::StopSign,
            Self::IllegalTurn,
            Self::Parking,
            Self::FollowingDistance,
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViolationLocation {
    pub zone_id: Option<String>,
    pub zone_name: Option<String>,
    /// Pixel position of the vehicle when detected
    pub coordinates: (f32, f32),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ViolationDetails {
    Speed {
        measured_kmh: f64,
        limit_kmh: f64,
        amount_kmh: f64,
        percentage: f64,
    },
    Lane {
        position: f32,
        departure: Departure,
        marking: LaneMarking,
    },
    WrongWay {
        angle_deg: f32,
        expected_direction: (f32, f32),
    },
    FollowingDistance {
        leader_id: u32,
        gap_m: f64,
        min_gap_m: f64,
    },
    Generic {
        note: String,
    },
}

/// Pointer to stored evidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceRef {
    pub storage_id: String,
    pub data_type: String,
    pub checksum: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficViolation {
    pub violation_id: String,
    pub timestamp: DateTime<Utc>,
    pub frame_id: u64,
    pub frame_timestamp_ms: f64,
    pub violation_type: ViolationType,
    pub severity: Severity,
    pub vehicle_id: u32,
    pub description: String,
    pub confidence: f32,
    pub location: ViolationLocation,
    pub details: ViolationDetails,
    pub bbox: [f32; 4],
    pub vehicle_class: String,
    pub license_plate: Option<String>,
    pub plate_confidence: Option<f32>,
    pub detection_confidence: f32,
    pub tracking_quality: f32,
    pub camera_id: String,
    pub evidence: Vec<EvidenceRef>,
    pub reviewed: bool,
    pub false_positive: bool,
}

impl TrafficViolation {
    pub fn speed_limit(&self) -> Option<f64> {
        match self.details {
            ViolationDetails::Speed { limit_kmh, .. } => Some(limit_kmh),
            _ => None,
        }
    }

    pub fn measured_speed(&self) -> Option<f64> {
        match self.details {
            ViolationDetails::Speed { measured_kmh, .. } => Some(measured_kmh),
            _ => None,
        }
    }

    /// Reject malformed records before they reach storage.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !bbox_is_valid(&self.bbox) {
            return Err(ValidationError::InvalidBbox);
        }
        for c in [self.confidence, self.detection_confidence] {
            if !(0.0..=1.0).contains(&c) || !c.is_finite() {
                return Err(ValidationError::ConfidenceOutOfRange(c));
            }
        }
        if let Some(pc) = self.plate_confidence {
            if !(0.0..=1.0).contains(&pc) {
                return Err(ValidationError::ConfidenceOutOfRange(pc));
            }
        }
        if let Some(speed) = self.measured_speed() {
            if !speed.is_finite() || !(0.0..=MAX_RECORDABLE_SPEED_KMH).contains(&speed) {
                return Err(ValidationError::SpeedOutOfRange(speed));
            }
        }
        if self.camera_id.trim().is_empty() {
            return Err(ValidationError::MissingCamera);
        }
        Ok(())
    }
}

/// Detector output before the engine assigns identity, plate and camera.
#[derive(Debug, Clone, PartialEq)]
pub struct ViolationCandidate {
    pub violation_type: ViolationType,
    pub severity: Severity,
    pub vehicle_id: u32,
    pub description: String,
    pub confidence: f32,
    pub zone_id: Option<String>,
    pub zone_name: Option<String>,
    pub details: ViolationDetails,
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TrafficViolation {
        TrafficViolation {
            violation_id: "v1".into(),
            timestamp: Utc::now(),
            frame_id: 10,
            frame_timestamp_ms: 330.0,
            violation_type: ViolationType::Speeding,
            severity: Severity::Moderate,
            vehicle_id: 3,
            description: "speeding".into(),
            confidence: 0.8,
            location: ViolationLocation {
                zone_id: Some("z1".into()),
                zone_name: None,
                coordinates: (100.0, 200.0),
            },
            details: ViolationDetails::Speed {
                measured_kmh: 75.0,
                limit_kmh: 60.0,
                amount_kmh: 15.0,
                percentage: 25.0,
            },
            bbox: [10.0, 10.0, 50.0, 50.0],
            vehicle_class: "car".into(),
            license_plate: None,
            plate_confidence: None,
            detection_confidence: 0.9,
            tracking_quality: 0.7,
            camera_id: "cam-1".into(),
            evidence: Vec::new(),
            reviewed: false,
            false_positive: false,
        }
    }

    #[test]
    fn test_valid_record_passes() {
        assert!(sample().validate().is_ok());
        assert_eq!(sample().speed_limit(), Some(60.0));
    }

    #[test]
    fn test_validation_rejects_bad_fields() {
        let mut v = sample();
        v.bbox = [50.0, 10.0, 10.0, 50.0];
        assert_eq!(v.validate(), Err(ValidationError::InvalidBbox));

        let mut v = sample();
        v.confidence = 1.2;
        assert!(matches!(v.validate(), Err(ValidationError::ConfidenceOutOfRange(_))));

        let mut v = sample();
        v.details = ViolationDetails::Speed {
            measured_kmh: 900.0,
            limit_kmh: 60.0,
            amount_kmh: 840.0,
            percentage: 1400.0,
        };
        assert!(matches!(v.validate(), Err(ValidationError::SpeedOutOfRange(_))));

        let mut v = sample();
        v.camera_id = " ".into();
        assert_eq!(v.validate(), Err(ValidationError::MissingCamera));
    }

    #[test]
    fn test_type_round_trip_names() {
        for t in ViolationType::all() {
            assert_eq!(ViolationType::parse(t.as_str()), Some(t));
        }
        assert_eq!(ViolationType::WrongWay.default_cooldown_secs(), 60.0);
    }
}
