// src/speed/speed_analyzer.rs
//
// Speed from trajectories + calibration. Guard rules are strict: a
// trajectory that is too short in points, time or distance produces no
// measurement at all, and implausible speeds are discarded as noise.

use super::calibration::{CalibrationZone, CameraCalibrator};
use crate::tracking::Trajectory;
use crate::types::{Severity, SeverityThresholds};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tracing::debug;

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeedConfig {
    /// km/h allowed over the limit before a violation is raised
    pub tolerance_kmh: f64,
    pub min_points: usize,
    pub min_elapsed_s: f64,
    pub min_distance_m: f64,
    /// Measurements above this are treated as sensor noise
    pub max_plausible_kmh: f64,
    /// Measurements per vehicle kept for smoothing
    pub smoothing_window: usize,
    /// Limit used when a vehicle is outside every zone
    pub default_speed_limit_kmh: f64,
    pub severity: SeverityThresholds,
    pub unit: SpeedUnit,
}

impl Default for SpeedConfig {
    fn default() -> Self {
        Self {
            tolerance_kmh: 5.0,
            min_points: 3,
            min_elapsed_s: 0.5,
            min_distance_m: 5.0,
            max_plausible_kmh: 200.0,
            smoothing_window: 5,
            default_speed_limit_kmh: 60.0,
            severity: SeverityThresholds::default(),
            unit: SpeedUnit::Kmh,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpeedUnit {
    Kmh,
    Mph,
    Mps,
}

impl SpeedUnit {
    pub fn from_kmh(&self, kmh: f64) -> f64 {
        match self {
            Self::Kmh => kmh,
            Self::Mph => kmh * 0.621_371,
            Self::Mps => kmh / 3.6,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Kmh => "km/h",
            Self::Mph => "mph",
            Self::Mps => "m/s",
        }
    }
}

// ============================================================================
// TYPES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeedMeasurement {
    pub vehicle_id: u32,
    pub speed_kmh: f64,
    pub speed_mps: f64,
    pub distance_m: f64,
    pub elapsed_s: f64,
    pub zone_id: Option<String>,
    pub speed_limit_kmh: f64,
    pub tolerance_kmh: f64,
    pub confidence: f64,
    /// Real-world entry/exit positions (meters)
    pub entry_point: (f64, f64),
    pub exit_point: (f64, f64),
    pub entry_time_ms: f64,
    pub exit_time_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeedViolation {
    pub vehicle_id: u32,
    pub measured_speed_kmh: f64,
    pub speed_limit_kmh: f64,
    pub violation_amount_kmh: f64,
    pub violation_percentage: f64,
    pub severity: Severity,
    pub zone_id: Option<String>,
    pub confidence: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SpeedStats {
    pub measurements: u64,
    pub rejected_short: u64,
    pub rejected_noise: u64,
    pub rejected_uncalibrated: u64,
    pub tracked_vehicles: usize,
}

// ============================================================================
// ANALYZER
// ============================================================================

pub struct SpeedAnalyzer {
    pub config: SpeedConfig,
    history: HashMap<u32, VecDeque<SpeedMeasurement>>,
    stats: SpeedStats,
}

impl SpeedAnalyzer {
    pub fn new(config: SpeedConfig) -> Self {
        Self {
            config,
            history: HashMap::new(),
            stats: SpeedStats::default(),
        }
    }

    /// Single raw measurement, no smoothing. None if any guard fails.
    pub fn measure(&mut self, trajectory: &Trajectory, calibrator: &CameraCalibrator) -> Option<SpeedMeasurement> {
        let cfg = &self.config;
        if trajectory.len() < cfg.min_points.max(2) || trajectory.duration_secs() < cfg.min_elapsed_s {
            self.stats.rejected_short += 1;
            return None;
        }

        // Zone of the trajectory's midpoint decides limit and mapping
        let mid = trajectory.get(trajectory.len() / 2)?;
        let zone: Option<&CalibrationZone> = calibrator.zone_for_point(mid.x as f64, mid.y as f64);
        if let Some(z) = zone {
            if !calibrator.zone_is_measurable(z) {
                self.stats.rejected_uncalibrated += 1;
                return None;
            }
        }

        // Points inside the zone; fall back to the whole trajectory
        let in_zone: Vec<_> = match zone {
            Some(z) => trajectory
                .points()
                .filter(|p| z.contains(p.x as f64, p.y as f64))
                .collect(),
            None => Vec::new(),
        };
        let sampled: Vec<_> = if in_zone.len() >= 2 {
            in_zone
        } else {
            trajectory.points().collect()
        };

        let mut real = Vec::with_capacity(sampled.len());
        for p in &sampled {
            let mapped = match zone {
                Some(z) => calibrator.zone_pixel_to_real(z, p.x as f64, p.y as f64),
                None => calibrator.pixel_to_real(p.x as f64, p.y as f64),
            };
            if let Some(r) = mapped {
                real.push((r, p.timestamp_ms));
            }
        }
        if real.len() < 2 {
            self.stats.rejected_uncalibrated += 1;
            return None;
        }

        let (entry, entry_ms) = real[0];
        let (exit, exit_ms) = real[real.len() - 1];
        let elapsed_s = (exit_ms - entry_ms) / 1000.0;
        let distance_m = ((exit.0 - entry.0).powi(2) + (exit.1 - entry.1).powi(2)).sqrt();

        if elapsed_s < cfg.min_elapsed_s || distance_m < cfg.min_distance_m {
            self.stats.rejected_short += 1;
            return None;
        }

        let speed_mps = distance_m / elapsed_s;
        let speed_kmh = speed_mps * 3.6;
        if !speed_kmh.is_finite() || speed_kmh < 0.0 || speed_kmh > cfg.max_plausible_kmh {
            debug!(
                "Vehicle {}: discarding implausible speed {:.1} km/h",
                trajectory.track_id, speed_kmh
            );
            self.stats.rejected_noise += 1;
            return None;
        }

        let positions: Vec<(f64, f64)> = real.iter().map(|(r, _)| *r).collect();
        let mapping_confidence = match zone {
            Some(z) => calibrator.zone_confidence(z),
            None => calibrator.confidence(),
        };
        let confidence = trajectory_confidence(&positions, distance_m, elapsed_s) * mapping_confidence;

        let (limit, tolerance) = match zone {
            Some(z) => (z.speed_limit_kmh, z.tolerance_kmh.unwrap_or(cfg.tolerance_kmh)),
            None => (cfg.default_speed_limit_kmh, cfg.tolerance_kmh),
        };

        self.stats.measurements += 1;
        Some(SpeedMeasurement {
            vehicle_id: trajectory.track_id,
            speed_kmh,
            speed_mps,
            distance_m,
            elapsed_s,
            zone_id: zone.map(|z| z.zone_id.clone()),
            speed_limit_kmh: limit,
            tolerance_kmh: tolerance,
            confidence,
            entry_point: entry,
            exit_point: exit,
            entry_time_ms: entry_ms,
            exit_time_ms: exit_ms,
        })
    }

    /// Measure, record, and return the confidence-weighted smoothed estimate.
    pub fn analyze(&mut self, trajectory: &Trajectory, calibrator: &CameraCalibrator) -> Option<SpeedMeasurement> {
        let raw = self.measure(trajectory, calibrator)?;
        let window = self.config.smoothing_window.max(1);
        let history = self.history.entry(raw.vehicle_id).or_default();
        history.push_back(raw.clone());
        while history.len() > window {
            history.pop_front();
        }

        let weight_sum: f64 = history.iter().map(|m| m.confidence).sum();
        let smoothed_kmh = if weight_sum > 1e-9 {
            history.iter().map(|m| m.speed_kmh * m.confidence).sum::<f64>() / weight_sum
        } else {
            history.iter().map(|m| m.speed_kmh).sum::<f64>() / history.len() as f64
        };

        let mut out = raw;
        out.speed_kmh = smoothed_kmh;
        out.speed_mps = smoothed_kmh / 3.6;
        Some(out)
    }

    /// `speed > limit + tolerance` → violation with bucketed severity.
    pub fn check_violation(&self, m: &SpeedMeasurement) -> Option<SpeedViolation> {
        if m.speed_kmh <= m.speed_limit_kmh + m.tolerance_kmh {
            return None;
        }
        let amount = m.speed_kmh - m.speed_limit_kmh;
        Some(SpeedViolation {
            vehicle_id: m.vehicle_id,
            measured_speed_kmh: m.speed_kmh,
            speed_limit_kmh: m.speed_limit_kmh,
            violation_amount_kmh: amount,
            violation_percentage: amount / m.speed_limit_kmh * 100.0,
            severity: self.config.severity.bucket(amount),
            zone_id: m.zone_id.clone(),
            confidence: m.confidence,
        })
    }

    pub fn latest(&self, vehicle_id: u32) -> Option<&SpeedMeasurement> {
        self.history.get(&vehicle_id).and_then(|h| h.back())
    }

    /// Drop smoothing history for vehicles no longer tracked.
    pub fn retain_vehicles(&mut self, active: &[u32]) {
        self.history.retain(|id, _| active.contains(id));
    }

    pub fn forget(&mut self, vehicle_id: u32) {
        self.history.remove(&vehicle_id);
    }

    pub fn stats(&self) -> SpeedStats {
        SpeedStats {
            tracked_vehicles: self.history.len(),
            ..self.stats.clone()
        }
    }
}

/// Quality score in [0, 1]: penalises short distances, short spans and
/// erratic headings.
fn trajectory_confidence(positions: &[(f64, f64)], distance_m: f64, elapsed_s: f64) -> f64 {
    let mut confidence = 1.0;
    if distance_m < 10.0 {
        confidence *= distance_m / 10.0;
    }
    if elapsed_s < 2.0 {
        confidence *= elapsed_s / 2.0;
    }

    if positions.len() > 2 {
        let mut changes = 0usize;
        let mut prev_heading: Option<f64> = None;
        for w in positions.windows(2) {
            let (dx, dy) = (w[1].0 - w[0].0, w[1].1 - w[0].1);
            if dx.abs() <= 0.1 && dy.abs() <= 0.1 {
                continue;
            }
            let heading = dy.atan2(dx);
            if let Some(prev) = prev_heading {
                let mut diff = (heading - prev).abs();
                if diff > std::f64::consts::PI {
                    diff = 2.0 * std::f64::consts::PI - diff;
                }
                if diff > std::f64::consts::FRAC_PI_4 {
                    changes += 1;
                }
            }
            prev_heading = Some(heading);
        }
        let ratio = changes as f64 / positions.len() as f64;
        if ratio > 0.2 {
            confidence *= 1.0 - ratio;
        }
    }
    confidence.clamp(0.0, 1.0)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::speed::calibration::CalibrationPoint;
    use crate::tracking::TrajectoryPoint;

    /// 1 px = 0.1 m on both axes.
    fn calibrator_with_zone(limit: f64) -> CameraCalibrator {
        let mut c = CameraCalibrator::new();
        for (px, py) in [(0.0, 0.0), (1000.0, 0.0), (1000.0, 1000.0), (0.0, 1000.0)] {
            c.add_calibration_point(CalibrationPoint::new(px, py, px / 10.0, py / 10.0))
                .unwrap();
        }
        c.add_zone(CalibrationZone::new(
            "z1",
            "Main",
            vec![(0.0, 0.0), (1000.0, 0.0), (1000.0, 1000.0), (0.0, 1000.0)],
            limit,
        ))
        .unwrap();
        c
    }

    /// Straight track moving down the image at `px_per_s`.
    fn straight(id: u32, n: usize, px_per_s: f32, dt_ms: f64) -> Trajectory {
        let mut t = Trajectory::new(id, 100);
        for i in 0..n {
            let ts = i as f64 * dt_ms;
            t.push(TrajectoryPoint::new(500.0, 100.0 + px_per_s * (ts as f32 / 1000.0), ts, i as u64));
        }
        t
    }

    #[test]
    fn test_too_few_points_yields_nothing() {
        let c = calibrator_with_zone(60.0);
        let mut a = SpeedAnalyzer::new(SpeedConfig::default());
        assert!(a.measure(&straight(1, 1, 100.0, 100.0), &c).is_none());
        assert!(a.measure(&straight(1, 2, 100.0, 100.0), &c).is_none());
    }

    #[test]
    fn test_too_short_elapsed_time_yields_nothing() {
        let c = calibrator_with_zone(60.0);
        let mut a = SpeedAnalyzer::new(SpeedConfig::default());
        // 5 points over 0.2s, moving very fast
        let t = straight(1, 5, 5000.0, 50.0);
        assert!(a.measure(&t, &c).is_none());
    }

    #[test]
    fn test_known_distance_over_known_time() {
        let c = calibrator_with_zone(60.0);
        let mut a = SpeedAnalyzer::new(SpeedConfig::default());
        // 200 px/s = 20 m/s = 72 km/h, 3 seconds → 60 m
        let t = straight(1, 31, 200.0, 100.0);
        let m = a.measure(&t, &c).expect("measurement");
        assert!((m.distance_m - 60.0).abs() < 1e-3, "distance {}", m.distance_m);
        assert!((m.elapsed_s - 3.0).abs() < 1e-9);
        assert!((m.speed_kmh - 72.0).abs() < 1e-3, "speed {}", m.speed_kmh);
        assert_eq!(m.zone_id.as_deref(), Some("z1"));
        assert!(m.confidence > 0.9);
    }

    #[test]
    fn test_implausible_speed_discarded() {
        let c = calibrator_with_zone(60.0);
        let mut a = SpeedAnalyzer::new(SpeedConfig::default());
        // 900 px/s = 90 m/s = 324 km/h
        let t = straight(1, 11, 900.0, 100.0);
        assert!(a.measure(&t, &c).is_none());
        assert_eq!(a.stats().rejected_noise, 1);
    }

    #[test]
    fn test_uncalibrated_yields_nothing() {
        let c = CameraCalibrator::new();
        let mut a = SpeedAnalyzer::new(SpeedConfig::default());
        assert!(a.measure(&straight(1, 31, 200.0, 100.0), &c).is_none());
    }

    #[test]
    fn test_zone_only_calibration_carries_zone_confidence() {
        let mut c = CameraCalibrator::new();
        c.add_zone(
            CalibrationZone::new(
                "z1",
                "Main",
                vec![(0.0, 0.0), (1000.0, 0.0), (1000.0, 1000.0), (0.0, 1000.0)],
                60.0,
            )
            .with_real_world_points(vec![(0.0, 0.0), (100.0, 0.0), (100.0, 100.0), (0.0, 100.0)]),
        )
        .unwrap();
        assert!(!c.is_calibrated());

        let mut a = SpeedAnalyzer::new(SpeedConfig::default());
        let m = a.measure(&straight(1, 31, 200.0, 100.0), &c).expect("measurement");
        assert!((m.speed_kmh - 72.0).abs() < 1e-3, "speed {}", m.speed_kmh);
        assert!(m.confidence > 0.9, "confidence {}", m.confidence);

        let v = a.check_violation(&m).expect("speeding");
        assert!(v.confidence > 0.9);
    }

    fn measurement(speed: f64, limit: f64) -> SpeedMeasurement {
        SpeedMeasurement {
            vehicle_id: 7,
            speed_kmh: speed,
            speed_mps: speed / 3.6,
            distance_m: 30.0,
            elapsed_s: 2.0,
            zone_id: Some("z1".into()),
            speed_limit_kmh: limit,
            tolerance_kmh: 5.0,
            confidence: 0.9,
            entry_point: (0.0, 0.0),
            exit_point: (0.0, 30.0),
            entry_time_ms: 0.0,
            exit_time_ms: 2000.0,
        }
    }

    #[test]
    fn test_severity_buckets_at_boundaries() {
        let a = SpeedAnalyzer::new(SpeedConfig::default());
        assert!(a.check_violation(&measurement(65.0, 60.0)).is_none(), "within tolerance");

        let v = a.check_violation(&measurement(65.5, 60.0)).unwrap();
        assert_eq!(v.severity, Severity::Minor);

        let v = a.check_violation(&measurement(70.0, 60.0)).unwrap();
        assert_eq!(v.severity, Severity::Moderate, "exactly +10 is moderate");
        assert!((v.violation_percentage - 16.666).abs() < 0.01);

        assert_eq!(a.check_violation(&measurement(85.0, 60.0)).unwrap().severity, Severity::Severe);
        assert_eq!(a.check_violation(&measurement(110.0, 60.0)).unwrap().severity, Severity::Critical);
    }

    #[test]
    fn test_smoothing_is_confidence_weighted() {
        let c = calibrator_with_zone(60.0);
        let mut a = SpeedAnalyzer::new(SpeedConfig::default());
        let first = a.analyze(&straight(1, 31, 200.0, 100.0), &c).unwrap();
        assert!((first.speed_kmh - 72.0).abs() < 1e-3);
        let second = a.analyze(&straight(1, 31, 300.0, 100.0), &c).unwrap();
        assert!(second.speed_kmh > 72.0 && second.speed_kmh < 108.0);
        assert_eq!(a.stats().tracked_vehicles, 1);

        a.retain_vehicles(&[]);
        assert!(a.latest(1).is_none());
    }

    #[test]
    fn test_unit_conversion() {
        assert!((SpeedUnit::Mps.from_kmh(36.0) - 10.0).abs() < 1e-9);
        assert!((SpeedUnit::Mph.from_kmh(100.0) - 62.1371).abs() < 1e-3);
    }
}
