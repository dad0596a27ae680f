// src/violations/detectors.rs
//
// Independent per-type detectors. Each turns the frame's tracked vehicles
// plus pipeline-owned context into zero or more candidates; the engine
// applies rule scoping, cooldown and dedup afterwards.

use super::rules::ViolationRule;
use super::types::{ViolationCandidate, ViolationDetails, ViolationType};
use crate::lanes::{LaneCheckConfig, LaneChecker, LaneGeometry};
use crate::speed::{CameraCalibrator, SpeedAnalyzer, SpeedConfig, SpeedMeasurement};
use crate::tracking::{TrackedVehicle, TrajectoryStore};
use crate::types::Severity;
use std::collections::HashMap;
use tracing::debug;

/// Everything a detector may read for one frame.
pub struct DetectionContext<'a> {
    pub frame_id: u64,
    pub timestamp_ms: f64,
    pub vehicles: &'a [TrackedVehicle],
    pub trajectories: &'a TrajectoryStore,
    pub calibrator: &'a CameraCalibrator,
    pub lanes: Option<&'a LaneGeometry>,
}

impl<'a> DetectionContext<'a> {
    fn zone_of(&self, v: &TrackedVehicle) -> (Option<String>, Option<String>) {
        match self
            .calibrator
            .zone_for_point(v.center.0 as f64, v.bottom_y() as f64)
        {
            Some(z) => (Some(z.zone_id.clone()), Some(z.name.clone())),
            None => (None, None),
        }
    }
}

pub trait ViolationDetector: Send {
    fn violation_type(&self) -> ViolationType;

    fn detect(&mut self, ctx: &DetectionContext<'_>, rule: &ViolationRule) -> Vec<ViolationCandidate>;
}

// ============================================================================
// SPEED
// ============================================================================

pub struct SpeedDetector {
    analyzer: SpeedAnalyzer,
    last: HashMap<u32, SpeedMeasurement>,
}

impl SpeedDetector {
    pub fn new(config: SpeedConfig) -> Self {
        Self {
            analyzer: SpeedAnalyzer::new(config),
            last: HashMap::new(),
        }
    }

    pub fn analyzer(&self) -> &SpeedAnalyzer {
        &self.analyzer
    }

    /// Smoothed measurements produced on the most recent frame.
    pub fn last_measurements(&self) -> &HashMap<u32, SpeedMeasurement> {
        &self.last
    }
}

impl ViolationDetector for SpeedDetector {
    fn violation_type(&self) -> ViolationType {
        ViolationType::Speeding
    }

    fn detect(&mut self, ctx: &DetectionContext<'_>, _rule: &ViolationRule) -> Vec<ViolationCandidate> {
        self.last.clear();
        let active: Vec<u32> = ctx.vehicles.iter().map(|v| v.track_id).collect();
        self.analyzer.retain_vehicles(&active);

        let mut out = Vec::new();
        for v in ctx.vehicles {
            let Some(trajectory) = ctx.trajectories.get(v.track_id) else {
                continue;
            };
            let Some(m) = self.analyzer.analyze(trajectory, ctx.calibrator) else {
                continue;
            };
            if let Some(sv) = self.analyzer.check_violation(&m) {
                let zone_name = sv
                    .zone_id
                    .as_deref()
                    .and_then(|id| ctx.calibrator.zone(id))
                    .map(|z| z.name.clone());
                out.push(ViolationCandidate {
                    violation_type: ViolationType::Speeding,
                    severity: sv.severity,
                    vehicle_id: v.track_id,
                    description: format!(
                        "Speeding: {:.1} km/h in {:.0} km/h zone (+{:.1})",
                        sv.measured_speed_kmh, sv.speed_limit_kmh, sv.violation_amount_kmh
                    ),
                    confidence: sv.confidence.clamp(0.0, 1.0) as f32,
                    zone_id: sv.zone_id.clone(),
                    zone_name,
                    details: ViolationDetails::Speed {
                        measured_kmh: sv.measured_speed_kmh,
                        limit_kmh: sv.speed_limit_kmh,
                        amount_kmh: sv.violation_amount_kmh,
                        percentage: sv.violation_percentage,
                    },
                });
            }
            self.last.insert(v.track_id, m);
        }
        out
    }
}

// ============================================================================
// LANE
// ============================================================================

pub struct LaneRuleDetector {
    checker: LaneChecker,
}

impl LaneRuleDetector {
    pub fn new(config: LaneCheckConfig) -> Self {
        Self {
            checker: LaneChecker::new(config),
        }
    }
}

impl ViolationDetector for LaneRuleDetector {
    fn violation_type(&self) -> ViolationType {
        ViolationType::Lane
    }

    fn detect(&mut self, ctx: &DetectionContext<'_>, _rule: &ViolationRule) -> Vec<ViolationCandidate> {
        let Some(geometry) = ctx.lanes.filter(|g| g.has_lines()) else {
            return Vec::new();
        };
        ctx.vehicles
            .iter()
            .filter_map(|v| {
                let lv = self.checker.check(v, geometry)?;
                let (zone_id, zone_name) = ctx.zone_of(v);
                Some(ViolationCandidate {
                    violation_type: ViolationType::Lane,
                    severity: lv.severity,
                    vehicle_id: v.track_id,
                    description: format!(
                        "Lane violation: drifted {} across {} marking",
                        lv.departure.as_str(),
                        lv.marking.as_str()
                    ),
                    confidence: lv.confidence,
                    zone_id,
                    zone_name,
                    details: ViolationDetails::Lane {
                        position: lv.position,
                        departure: lv.departure,
                        marking: lv.marking,
                    },
                })
            })
            .collect()
    }
}

// ============================================================================
// WRONG WAY
// ============================================================================

/// Heading vs. the zone's (or rule's) expected travel direction.
#[derive(Default)]
pub struct WrongWayDetector;

impl WrongWayDetector {
    pub fn new() -> Self {
        Self
    }
}

/// Angle between two vectors in degrees; None for zero-length input.
pub fn angle_between_deg(a: (f32, f32), b: (f32, f32)) -> Option<f32> {
    let na = (a.0 * a.0 + a.1 * a.1).sqrt();
    let nb = (b.0 * b.0 + b.1 * b.1).sqrt();
    if na < 1e-6 || nb < 1e-6 {
        return None;
    }
    let cos = ((a.0 * b.0 + a.1 * b.1) / (na * nb)).clamp(-1.0, 1.0);
    Some(cos.acos().to_degrees())
}

impl ViolationDetector for WrongWayDetector {
    fn violation_type(&self) -> ViolationType {
        ViolationType::WrongWay
    }

    fn detect(&mut self, ctx: &DetectionContext<'_>, rule: &ViolationRule) -> Vec<ViolationCandidate> {
        let min_points = rule.param("min_points", 5.0).max(2.0) as usize;
        let threshold = rule.param("angle_threshold_deg", 90.0) as f32;
        let min_disp = rule.param("min_displacement_px", 20.0) as f32;
        let fallback = (
            rule.param("expected_dx", 0.0) as f32,
            rule.param("expected_dy", -1.0) as f32,
        );

        let mut out = Vec::new();
        for v in ctx.vehicles {
            let Some(t) = ctx.trajectories.get(v.track_id) else {
                continue;
            };
            if t.len() < min_points {
                continue;
            }
            let (Some(first), Some(last)) = (t.first(), t.last()) else {
                continue;
            };
            let disp = ((last.x - first.x).powi(2) + (last.y - first.y).powi(2)).sqrt();
            if disp < min_disp {
                continue;
            }
            let Some(heading) = t.direction() else {
                continue;
            };

            let zone = ctx.calibrator.zone_for_point(last.x as f64, last.y as f64);
            let expected = zone.and_then(|z| z.expected_direction).unwrap_or(fallback);
            let Some(angle) = angle_between_deg(heading, expected) else {
                continue;
            };
            if angle <= threshold {
                continue;
            }

            debug!(
                "Vehicle {}: heading {:.0}° off expected direction",
                v.track_id, angle
            );
            let history = (t.len() as f32 / (2 * min_points) as f32).min(1.0);
            out.push(ViolationCandidate {
                violation_type: ViolationType::WrongWay,
                severity: Severity::Critical,
                vehicle_id: v.track_id,
                description: format!("Wrong-way driving: heading {:.0}° from expected", angle),
                confidence: (v.confidence * (0.5 + 0.5 * history)).clamp(0.0, 1.0),
                zone_id: zone.map(|z| z.zone_id.clone()),
                zone_name: zone.map(|z| z.name.clone()),
                details: ViolationDetails::WrongWay {
                    angle_deg: angle,
                    expected_direction: expected,
                },
            });
        }
        out
    }
}

// ============================================================================
// FOLLOWING DISTANCE
// ============================================================================

/// Same-lane headway measured on the ground plane. The follower is the
/// vehicle nearer the camera (larger y).
#[derive(Default)]
pub struct FollowingDistanceDetector;

impl FollowingDistanceDetector {
    pub fn new() -> Self {
        Self
    }
}

impl ViolationDetector for FollowingDistanceDetector {
    fn violation_type(&self) -> ViolationType {
        ViolationType::FollowingDistance
    }

    fn detect(&mut self, ctx: &DetectionContext<'_>, rule: &ViolationRule) -> Vec<ViolationCandidate> {
        if !ctx.calibrator.is_calibrated() || ctx.vehicles.len() < 2 {
            return Vec::new();
        }
        let min_gap = rule.param("min_distance_m", 20.0);
        let same_lane_px = rule.param("same_lane_px", 100.0) as f32;

        let mut sorted: Vec<&TrackedVehicle> = ctx.vehicles.iter().collect();
        sorted.sort_by(|a, b| b.center.1.total_cmp(&a.center.1));

        let mut out = Vec::new();
        for (i, follower) in sorted.iter().enumerate() {
            // Nearest vehicle ahead in the same lane
            let Some(leader) = sorted[i + 1..]
                .iter()
                .find(|l| (l.center.0 - follower.center.0).abs() < same_lane_px)
            else {
                continue;
            };
            let Some(gap) = ctx.calibrator.distance(
                (follower.center.0 as f64, follower.bbox[1] as f64),
                (leader.center.0 as f64, leader.bottom_y() as f64),
            ) else {
                continue;
            };
            if gap >= min_gap {
                continue;
            }
            let severity = if gap < min_gap * 0.5 {
                Severity::Severe
            } else {
                Severity::Moderate
            };
            let (zone_id, zone_name) = ctx.zone_of(follower);
            out.push(ViolationCandidate {
                violation_type: ViolationType::FollowingDistance,
                severity,
                vehicle_id: follower.track_id,
                description: format!(
                    "Following too closely: {:.1} m behind vehicle {} (min {:.0} m)",
                    gap, leader.track_id, min_gap
                ),
                confidence: (follower.confidence.min(leader.confidence)
                    * ctx.calibrator.confidence() as f32)
                    .clamp(0.0, 1.0),
                zone_id,
                zone_name,
                details: ViolationDetails::FollowingDistance {
                    leader_id: leader.track_id,
                    gap_m: gap,
                    min_gap_m: min_gap,
                },
            });
        }
        out
    }
}

/// The detector set the engine runs by default.
pub fn default_detectors(
    speed: SpeedConfig,
    lane: LaneCheckConfig,
) -> Vec<Box<dyn ViolationDetector>> {
    vec![
        Box::new(SpeedDetector::new(speed)),
        Box::new(LaneRuleDetector::new(lane)),
        Box::new(WrongWayDetector::new()),
        Box::new(FollowingDistanceDetector::new()),
    ]
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::speed::{CalibrationPoint, CalibrationZone};
    use crate::tracking::{TrajectoryConfig, TrajectoryPoint};
    use crate::violations::rules::RuleSet;

    /// 1 px = 0.1 m.
    fn calibrator() -> CameraCalibrator {
        let mut c = CameraCalibrator::new();
        for (px, py) in [(0.0, 0.0), (1000.0, 0.0), (1000.0, 1000.0), (0.0, 1000.0)] {
            c.add_calibration_point(CalibrationPoint::new(px, py, px / 10.0, py / 10.0))
                .unwrap();
        }
        c
    }

    fn vehicle(id: u32, cx: f32, cy: f32) -> TrackedVehicle {
        TrackedVehicle {
            track_id: id,
            bbox: [cx - 40.0, cy - 30.0, cx + 40.0, cy + 30.0],
            center: (cx, cy),
            confidence: 0.9,
            class_name: "car".into(),
            consecutive_frames: 10,
            frame_count: 10,
            first_seen_ms: 0.0,
            last_seen_ms: 1000.0,
        }
    }

    fn store_with_path(id: u32, from: (f32, f32), step: (f32, f32), n: usize) -> TrajectoryStore {
        let mut s = TrajectoryStore::new(TrajectoryConfig::default());
        for i in 0..n {
            let p = TrajectoryPoint::new(
                from.0 + step.0 * i as f32,
                from.1 + step.1 * i as f32,
                i as f64 * 100.0,
                i as u64,
            );
            s.append(id, p);
        }
        s
    }

    fn ctx<'a>(
        vehicles: &'a [TrackedVehicle],
        store: &'a TrajectoryStore,
        cal: &'a CameraCalibrator,
    ) -> DetectionContext<'a> {
        DetectionContext {
            frame_id: 10,
            timestamp_ms: 1000.0,
            vehicles,
            trajectories: store,
            calibrator: cal,
            lanes: None,
        }
    }

    #[test]
    fn test_angle_between() {
        assert!((angle_between_deg((0.0, 1.0), (0.0, -1.0)).unwrap() - 180.0).abs() < 1e-3);
        assert!((angle_between_deg((1.0, 0.0), (0.0, -1.0)).unwrap() - 90.0).abs() < 1e-3);
        assert!(angle_between_deg((0.0, 0.0), (1.0, 0.0)).is_none());
    }

    #[test]
    fn test_wrong_way_flags_reverse_heading_as_critical() {
        let rules = RuleSet::defaults();
        let rule = rules.get(ViolationType::WrongWay).unwrap();
        let cal = calibrator();
        // Expected (0, -1): moving up the image. This one moves down.
        let store = store_with_path(1, (500.0, 100.0), (0.0, 10.0), 8);
        let vehicles = [vehicle(1, 500.0, 170.0)];
        let out = WrongWayDetector::new().detect(&ctx(&vehicles, &store, &cal), rule);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].severity, Severity::Critical);

        let store = store_with_path(1, (500.0, 400.0), (0.0, -10.0), 8);
        let out = WrongWayDetector::new().detect(&ctx(&vehicles, &store, &cal), rule);
        assert!(out.is_empty(), "correct direction");
    }

    #[test]
    fn test_wrong_way_needs_history_and_motion() {
        let rules = RuleSet::defaults();
        let rule = rules.get(ViolationType::WrongWay).unwrap();
        let cal = calibrator();
        let vehicles = [vehicle(1, 500.0, 130.0)];
        let short = store_with_path(1, (500.0, 100.0), (0.0, 10.0), 3);
        assert!(WrongWayDetector::new().detect(&ctx(&vehicles, &short, &cal), rule).is_empty());
        let jitter = store_with_path(1, (500.0, 100.0), (0.0, 1.0), 8);
        assert!(WrongWayDetector::new().detect(&ctx(&vehicles, &jitter, &cal), rule).is_empty());
    }

    #[test]
    fn test_wrong_way_uses_zone_direction() {
        let rules = RuleSet::defaults();
        let rule = rules.get(ViolationType::WrongWay).unwrap();
        let mut cal = calibrator();
        let mut zone = CalibrationZone::new(
            "down",
            "Southbound",
            vec![(0.0, 0.0), (1000.0, 0.0), (1000.0, 1000.0), (0.0, 1000.0)],
            80.0,
        );
        zone.expected_direction = Some((0.0, 1.0));
        cal.add_zone(zone).unwrap();
        let store = store_with_path(1, (500.0, 100.0), (0.0, 10.0), 8);
        let vehicles = [vehicle(1, 500.0, 170.0)];
        assert!(WrongWayDetector::new().detect(&ctx(&vehicles, &store, &cal), rule).is_empty());
    }

    #[test]
    fn test_following_distance_buckets() {
        let rules = RuleSet::defaults();
        let rule = rules.get(ViolationType::FollowingDistance).unwrap();
        let cal = calibrator();
        let store = TrajectoryStore::new(TrajectoryConfig::default());

        // Follower front at y=570, leader rear at y=430: 14 m gap → moderate
        let vehicles = [vehicle(1, 500.0, 600.0), vehicle(2, 510.0, 400.0)];
        let out = FollowingDistanceDetector::new().detect(&ctx(&vehicles, &store, &cal), rule);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].vehicle_id, 1);
        assert_eq!(out[0].severity, Severity::Moderate);

        // 4 m gap → severe
        let vehicles = [vehicle(1, 500.0, 500.0), vehicle(2, 500.0, 400.0)];
        let out = FollowingDistanceDetector::new().detect(&ctx(&vehicles, &store, &cal), rule);
        assert_eq!(out[0].severity, Severity::Severe);

        // Different lane
        let vehicles = [vehicle(1, 200.0, 500.0), vehicle(2, 700.0, 400.0)];
        assert!(FollowingDistanceDetector::new()
            .detect(&ctx(&vehicles, &store, &cal), rule)
            .is_empty());
    }

    #[test]
    fn test_following_distance_requires_calibration() {
        let rules = RuleSet::defaults();
        let rule = rules.get(ViolationType::FollowingDistance).unwrap();
        let cal = CameraCalibrator::new();
        let store = TrajectoryStore::new(TrajectoryConfig::default());
        let vehicles = [vehicle(1, 500.0, 500.0), vehicle(2, 500.0, 400.0)];
        assert!(FollowingDistanceDetector::new()
            .detect(&ctx(&vehicles, &store, &cal), rule)
            .is_empty());
    }

    #[test]
    fn test_speed_detector_reports_fast_vehicle() {
        let rules = RuleSet::defaults();
        let rule = rules.get(ViolationType::Speeding).unwrap();
        let mut cal = calibrator();
        cal.add_zone(CalibrationZone::new(
            "z1",
            "Main",
            vec![(0.0, 0.0), (1000.0, 0.0), (1000.0, 1000.0), (0.0, 1000.0)],
            60.0,
        ))
        .unwrap();
        // 25 px per 100 ms = 2.5 m / 0.1 s = 90 km/h
        let store = store_with_path(1, (500.0, 100.0), (0.0, 25.0), 20);
        let vehicles = [vehicle(1, 500.0, 575.0)];
        let mut d = SpeedDetector::new(SpeedConfig::default());
        let out = d.detect(&ctx(&vehicles, &store, &cal), rule);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].severity, Severity::Severe);
        assert_eq!(out[0].zone_id.as_deref(), Some("z1"));
        assert!(d.last_measurements().contains_key(&1));
    }
}
