// src/lanes/lane_checker.rs
//
// Vehicle position relative to the current lane geometry.
//
// Position is normalised to [-1, 1]: 0 is the lane center, ±1 the
// left/right marking. With only one marking visible, the offset is
// measured against that marking using the configured nominal lane width.

use super::lane_detector::{LaneGeometry, LaneLine, LaneMarking, LaneSide};
use crate::tracking::TrackedVehicle;
use crate::types::Severity;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LaneCheckConfig {
    /// |position| above which a departure is considered
    pub violation_threshold: f32,
    /// Severity lower bounds on |position| beyond the threshold:
    /// [moderate, severe, critical]
    pub severity_bounds: [f32; 3],
    /// Lane width assumed when only one marking is visible (pixels at bottom row)
    pub nominal_lane_width_px: f32,
    /// Crossing a dashed marking is a lawful lane change
    pub allow_dashed_crossing: bool,
}

impl Default for LaneCheckConfig {
    fn default() -> Self {
        Self {
            violation_threshold: 0.3,
            severity_bounds: [0.5, 0.8, 1.0],
            nominal_lane_width_px: 400.0,
            allow_dashed_crossing: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Departure {
    Left,
    Right,
}

impl Departure {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Left => "left",
            Self::Right => "right",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanePosition {
    /// -1 = on the left marking, 0 = centered, +1 = on the right marking
    pub normalized: f32,
    /// Signed pixel offset from the lane center
    pub offset_px: f32,
    pub lane_width_px: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaneViolation {
    pub vehicle_id: u32,
    pub position: f32,
    pub offset_px: f32,
    pub departure: Departure,
    pub crossed_line: LaneSide,
    pub marking: LaneMarking,
    pub severity: Severity,
    pub confidence: f32,
}

pub struct LaneChecker {
    pub config: LaneCheckConfig,
}

impl LaneChecker {
    pub fn new(config: LaneCheckConfig) -> Self {
        Self { config }
    }

    /// Normalised lateral position of a point at row `y`.
    pub fn lane_position(&self, x: f32, y: f32, geometry: &LaneGeometry) -> Option<LanePosition> {
        let (left_x, right_x) = match (geometry.left, geometry.right) {
            (Some(l), Some(r)) => (l.x_at(y), r.x_at(y)),
            (Some(l), None) => {
                let lx = l.x_at(y);
                (lx, lx + self.scaled_width(y, geometry))
            }
            (None, Some(r)) => {
                let rx = r.x_at(y);
                (rx - self.scaled_width(y, geometry), rx)
            }
            (None, None) => return None,
        };
        let width = right_x - left_x;
        if width <= 1.0 {
            return None;
        }
        let center = (left_x + right_x) * 0.5;
        let offset_px = x - center;
        Some(LanePosition {
            normalized: (offset_px / (width * 0.5)).clamp(-1.0, 1.0),
            offset_px,
            lane_width_px: width,
        })
    }

    /// Nominal width shrinks toward the horizon in proportion to row height.
    fn scaled_width(&self, y: f32, geometry: &LaneGeometry) -> f32 {
        let h = geometry.frame_height.max(1.0);
        self.config.nominal_lane_width_px * (y / h).clamp(0.1, 1.0)
    }

    /// Lane violation for one vehicle, using its bottom-center contact point.
    pub fn check(&self, vehicle: &TrackedVehicle, geometry: &LaneGeometry) -> Option<LaneViolation> {
        let x = vehicle.center.0;
        let y = vehicle.bottom_y();
        let pos = self.lane_position(x, y, geometry)?;
        let magnitude = pos.normalized.abs();
        if magnitude <= self.config.violation_threshold {
            return None;
        }

        let (departure, line): (Departure, Option<LaneLine>) = if pos.normalized < 0.0 {
            (Departure::Left, geometry.left)
        } else {
            (Departure::Right, geometry.right)
        };
        // A side without a visible marking cannot be adjudicated
        let line = line?;
        if self.config.allow_dashed_crossing && !line.marking.is_restricted() {
            return None;
        }

        // Clamped position saturates at the marking; use the bbox overlap
        // to tell "touching" from "fully across"
        let depth = match departure {
            Departure::Left => {
                let lx = line.x_at(y);
                if vehicle.bbox[2] < lx {
                    1.0 + f32::EPSILON
                } else {
                    magnitude
                }
            }
            Departure::Right => {
                let rx = line.x_at(y);
                if vehicle.bbox[0] > rx {
                    1.0 + f32::EPSILON
                } else {
                    magnitude
                }
            }
        };

        let crossed_line = match departure {
            Departure::Left => LaneSide::Left,
            Departure::Right => LaneSide::Right,
        };
        Some(LaneViolation {
            vehicle_id: vehicle.track_id,
            position: pos.normalized,
            offset_px: pos.offset_px,
            departure,
            crossed_line,
            marking: line.marking,
            severity: self.severity_for(depth),
            confidence: (line.confidence * vehicle.confidence).clamp(0.0, 1.0),
        })
    }

    pub fn severity_for(&self, magnitude: f32) -> Severity {
        let [moderate, severe, critical] = self.config.severity_bounds;
        if magnitude > critical {
            Severity::Critical
        } else if magnitude > severe {
            Severity::Severe
        } else if magnitude > moderate {
            Severity::Moderate
        } else {
            Severity::Minor
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn vertical(x: f32, marking: LaneMarking) -> LaneLine {
        LaneLine {
            coeffs: [0.0, 0.0, x],
            confidence: 1.0,
            marking,
        }
    }

    fn geometry(left: Option<LaneLine>, right: Option<LaneLine>) -> LaneGeometry {
        LaneGeometry {
            left,
            right,
            center: None,
            lane_width_px: None,
            curve_radius_px: None,
            frame_width: 1280.0,
            frame_height: 720.0,
            confidence: 1.0,
        }
    }

    fn vehicle(cx: f32, half_w: f32) -> TrackedVehicle {
        TrackedVehicle {
            track_id: 9,
            bbox: [cx - half_w, 500.0, cx + half_w, 600.0],
            center: (cx, 550.0),
            confidence: 0.9,
            class_name: "car".into(),
            consecutive_frames: 5,
            frame_count: 5,
            first_seen_ms: 0.0,
            last_seen_ms: 100.0,
        }
    }

    #[test]
    fn test_centered_vehicle_has_no_violation() {
        let checker = LaneChecker::new(LaneCheckConfig::default());
        let g = geometry(
            Some(vertical(400.0, LaneMarking::Solid)),
            Some(vertical(800.0, LaneMarking::Solid)),
        );
        let pos = checker.lane_position(600.0, 600.0, &g).unwrap();
        assert!(pos.normalized.abs() < 1e-6);
        assert!(checker.check(&vehicle(600.0, 60.0), &g).is_none());
    }

    #[test]
    fn test_drift_toward_solid_line_severity() {
        let checker = LaneChecker::new(LaneCheckConfig::default());
        let g = geometry(
            Some(vertical(400.0, LaneMarking::Solid)),
            Some(vertical(800.0, LaneMarking::Dashed)),
        );
        // position -0.4 → minor
        let v = checker.check(&vehicle(520.0, 60.0), &g).expect("violation");
        assert_eq!(v.departure, Departure::Left);
        assert_eq!(v.severity, Severity::Minor);
        // position -0.9 → severe
        let v = checker.check(&vehicle(420.0, 60.0), &g).unwrap();
        assert_eq!(v.severity, Severity::Severe);
        // fully across the line → critical
        let v = checker.check(&vehicle(300.0, 60.0), &g).unwrap();
        assert_eq!(v.severity, Severity::Critical);
    }

    #[test]
    fn test_dashed_crossing_allowed() {
        let checker = LaneChecker::new(LaneCheckConfig::default());
        let g = geometry(
            Some(vertical(400.0, LaneMarking::Solid)),
            Some(vertical(800.0, LaneMarking::Dashed)),
        );
        assert!(checker.check(&vehicle(780.0, 60.0), &g).is_none());

        let strict = LaneChecker::new(LaneCheckConfig {
            allow_dashed_crossing: false,
            ..Default::default()
        });
        assert!(strict.check(&vehicle(780.0, 60.0), &g).is_some());
    }

    #[test]
    fn test_no_lines_no_violation() {
        let checker = LaneChecker::new(LaneCheckConfig::default());
        let g = geometry(None, None);
        assert!(checker.check(&vehicle(10.0, 5.0), &g).is_none());
    }

    #[test]
    fn test_single_line_uses_nominal_width() {
        let checker = LaneChecker::new(LaneCheckConfig::default());
        let g = geometry(Some(vertical(400.0, LaneMarking::NoPassing)), None);
        // at y=600 the nominal width is 400 * 600/720 ≈ 333px
        let pos = checker.lane_position(410.0, 600.0, &g).unwrap();
        assert!(pos.normalized < -0.9);
        let v = checker.check(&vehicle(410.0, 30.0), &g).unwrap();
        assert_eq!(v.marking, LaneMarking::NoPassing);
    }
}
