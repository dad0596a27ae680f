// src/lanes/lane_detector.rs
//
// Lane geometry from externally extracted line segments.
//
// Pipeline per frame:
//   1. keep segments inside the ROI trapezoid
//   2. split into left/right by slope sign and horizontal position
//   3. fit x = a·y² + b·y + c per side (least squares)
//   4. classify solid vs dashed by vertical coverage
//   5. smooth over the last N geometries (coefficient mean, marking mode)
//
// "No lines this frame" is a normal outcome, never an error.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tracing::debug;

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LaneConfig {
    pub enabled: bool,
    /// ROI bottom edge, as fractions of frame width
    pub roi_bottom_left: f32,
    pub roi_bottom_right: f32,
    /// ROI top edge width as a fraction of frame width (centered)
    pub roi_top_width: f32,
    /// ROI top edge height as a fraction of frame height
    pub roi_top_y: f32,
    /// Minimum |slope| for a segment to count as a lane marking
    pub min_abs_slope: f32,
    /// Vertical coverage of the ROI above which a marking is solid
    pub solid_coverage: f32,
    pub history_len: usize,
    /// Marking kind forced on each side, e.g. a no-passing center line
    pub left_marking_override: Option<LaneMarking>,
    pub right_marking_override: Option<LaneMarking>,
}

impl Default for LaneConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            roi_bottom_left: 0.1,
            roi_bottom_right: 0.9,
            roi_top_width: 0.4,
            roi_top_y: 0.6,
            min_abs_slope: 0.5,
            solid_coverage: 0.6,
            history_len: 10,
            left_marking_override: None,
            right_marking_override: None,
        }
    }
}

// ============================================================================
// TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LineSegment {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl LineSegment {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// dy/dx in image coordinates. None for vertical segments.
    pub fn slope(&self) -> Option<f32> {
        let dx = self.x2 - self.x1;
        if dx.abs() < 1e-6 {
            None
        } else {
            Some((self.y2 - self.y1) / dx)
        }
    }

    pub fn midpoint(&self) -> (f32, f32) {
        ((self.x1 + self.x2) * 0.5, (self.y1 + self.y2) * 0.5)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaneMarking {
    Solid,
    Dashed,
    DoubleSolid,
    SolidDashed,
    NoPassing,
}

impl LaneMarking {
    /// Markings that may not be crossed.
    pub fn is_restricted(&self) -> bool {
        matches!(self, Self::Solid | Self::DoubleSolid | Self::NoPassing | Self::SolidDashed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Solid => "solid",
            Self::Dashed => "dashed",
            Self::DoubleSolid => "double_solid",
            Self::SolidDashed => "solid_dashed",
            Self::NoPassing => "no_passing",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaneSide {
    Left,
    Right,
    Center,
}

/// Trapezoidal region of interest in pixel coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct RegionOfInterest {
    /// bottom-left, bottom-right, top-right, top-left
    pub vertices: [(f32, f32); 4],
    pub frame_width: f32,
    pub frame_height: f32,
}

impl RegionOfInterest {
    pub fn from_config(cfg: &LaneConfig, width: f32, height: f32) -> Self {
        let top_half = cfg.roi_top_width * 0.5;
        Self {
            vertices: [
                (width * cfg.roi_bottom_left, height),
                (width * cfg.roi_bottom_right, height),
                (width * (0.5 + top_half), height * cfg.roi_top_y),
                (width * (0.5 - top_half), height * cfg.roi_top_y),
            ],
            frame_width: width,
            frame_height: height,
        }
    }

    pub fn top_y(&self) -> f32 {
        self.vertices[2].1
    }

    pub fn bottom_y(&self) -> f32 {
        self.vertices[0].1
    }

    /// Inclusive containment (segments ending on the frame edge count).
    pub fn contains(&self, x: f32, y: f32) -> bool {
        if y < self.top_y() - 0.5 || y > self.bottom_y() + 0.5 {
            return false;
        }
        let span = (self.bottom_y() - self.top_y()).max(1e-6);
        let t = ((y - self.top_y()) / span).clamp(0.0, 1.0);
        let left = self.vertices[3].0 + (self.vertices[0].0 - self.vertices[3].0) * t;
        let right = self.vertices[2].0 + (self.vertices[1].0 - self.vertices[2].0) * t;
        x >= left - 0.5 && x <= right + 0.5
    }
}

/// Fitted marking: x = a·y² + b·y + c.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LaneLine {
    pub coeffs: [f32; 3],
    pub confidence: f32,
    pub marking: LaneMarking,
}

impl LaneLine {
    pub fn x_at(&self, y: f32) -> f32 {
        let [a, b, c] = self.coeffs;
        a * y * y + b * y + c
    }

    /// Radius of curvature (px) at row y. Straight lines give infinity.
    pub fn curvature_radius(&self, y: f32) -> f32 {
        let [a, b, _] = self.coeffs;
        if a.abs() < 1e-9 {
            return f32::INFINITY;
        }
        let d1 = 2.0 * a * y + b;
        (1.0 + d1 * d1).powf(1.5) / (2.0 * a).abs()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaneGeometry {
    pub left: Option<LaneLine>,
    pub right: Option<LaneLine>,
    pub center: Option<LaneLine>,
    /// Lane width at the bottom row, pixels
    pub lane_width_px: Option<f32>,
    pub curve_radius_px: Option<f32>,
    pub frame_width: f32,
    pub frame_height: f32,
    pub confidence: f32,
}

impl LaneGeometry {
    pub fn empty(frame_width: f32, frame_height: f32) -> Self {
        Self {
            left: None,
            right: None,
            center: None,
            lane_width_px: None,
            curve_radius_px: None,
            frame_width,
            frame_height,
            confidence: 0.0,
        }
    }

    pub fn has_lines(&self) -> bool {
        self.left.is_some() || self.right.is_some()
    }

    fn derive(left: Option<LaneLine>, right: Option<LaneLine>, width: f32, height: f32) -> Self {
        let center = match (left, right) {
            (Some(l), Some(r)) => Some(LaneLine {
                coeffs: [
                    (l.coeffs[0] + r.coeffs[0]) * 0.5,
                    (l.coeffs[1] + r.coeffs[1]) * 0.5,
                    (l.coeffs[2] + r.coeffs[2]) * 0.5,
                ],
                confidence: l.confidence.min(r.confidence),
                marking: LaneMarking::Dashed,
            }),
            _ => None,
        };
        let lane_width_px = match (left, right) {
            (Some(l), Some(r)) => Some((r.x_at(height) - l.x_at(height)).abs()),
            _ => None,
        };
        let curve_radius_px = center
            .or(left)
            .or(right)
            .map(|line| line.curvature_radius(height))
            .filter(|r| r.is_finite());
        let confs: Vec<f32> = [left, right].iter().flatten().map(|l| l.confidence).collect();
        let confidence = if confs.is_empty() {
            0.0
        } else {
            confs.iter().sum::<f32>() / confs.len() as f32
        };
        Self {
            left,
            right,
            center,
            lane_width_px,
            curve_radius_px,
            frame_width: width,
            frame_height: height,
            confidence,
        }
    }
}

// ============================================================================
// DETECTOR
// ============================================================================

pub struct LaneDetector {
    pub config: LaneConfig,
    history: VecDeque<LaneGeometry>,
    frames_without_lines: u64,
}

impl LaneDetector {
    pub fn new(config: LaneConfig) -> Self {
        let cap = config.history_len.max(1);
        Self {
            config,
            history: VecDeque::with_capacity(cap),
            frames_without_lines: 0,
        }
    }

    pub fn roi(&self, width: f32, height: f32) -> RegionOfInterest {
        RegionOfInterest::from_config(&self.config, width, height)
    }

    /// Fit geometry for one frame and return the smoothed result.
    pub fn process(&mut self, segments: &[LineSegment], width: f32, height: f32) -> LaneGeometry {
        let current = self.fit_frame(segments, width, height);
        if !current.has_lines() {
            self.frames_without_lines += 1;
        } else {
            self.history.push_back(current);
            while self.history.len() > self.config.history_len.max(1) {
                self.history.pop_front();
            }
        }
        self.smoothed(width, height)
    }

    /// Geometry from this frame's segments alone.
    pub fn fit_frame(&self, segments: &[LineSegment], width: f32, height: f32) -> LaneGeometry {
        let roi = self.roi(width, height);
        let mut left = Vec::new();
        let mut right = Vec::new();

        for seg in segments {
            if !roi.contains(seg.x1, seg.y1) || !roi.contains(seg.x2, seg.y2) {
                continue;
            }
            let Some(slope) = seg.slope() else { continue };
            let (mx, _) = seg.midpoint();
            if slope < -self.config.min_abs_slope && mx < width * 0.5 {
                left.push(*seg);
            } else if slope > self.config.min_abs_slope && mx > width * 0.5 {
                right.push(*seg);
            }
        }

        let roi_height = roi.bottom_y() - roi.top_y();
        let left_line = self.fit_side(&left, roi_height, self.config.left_marking_override);
        let right_line = self.fit_side(&right, roi_height, self.config.right_marking_override);
        debug!(
            "Lane fit: {} left / {} right segments",
            left.len(),
            right.len()
        );
        LaneGeometry::derive(left_line, right_line, width, height)
    }

    fn fit_side(
        &self,
        segments: &[LineSegment],
        roi_height: f32,
        marking_override: Option<LaneMarking>,
    ) -> Option<LaneLine> {
        if segments.is_empty() {
            return None;
        }
        let points: Vec<(f32, f32)> = segments
            .iter()
            .flat_map(|s| [(s.x1, s.y1), (s.x2, s.y2)])
            .collect();
        let coeffs = fit_quadratic(&points)?;
        let mse = points
            .iter()
            .map(|(x, y)| {
                let fx = coeffs[0] * y * y + coeffs[1] * y + coeffs[2];
                (x - fx).powi(2)
            })
            .sum::<f32>()
            / points.len() as f32;
        let confidence = (1.0 - mse / 10_000.0).max(0.0);

        let covered: f32 = segments.iter().map(|s| (s.y2 - s.y1).abs()).sum();
        let coverage = if roi_height > 0.0 {
            covered / roi_height
        } else {
            0.0
        };
        let marking = marking_override.unwrap_or(if coverage >= self.config.solid_coverage {
            LaneMarking::Solid
        } else {
            LaneMarking::Dashed
        });

        Some(LaneLine {
            coeffs,
            confidence,
            marking,
        })
    }

    /// Mean coefficients over the history window; marking by majority vote.
    pub fn smoothed(&self, width: f32, height: f32) -> LaneGeometry {
        if self.history.is_empty() {
            return LaneGeometry::empty(width, height);
        }
        let left = average_lines(self.history.iter().filter_map(|g| g.left));
        let right = average_lines(self.history.iter().filter_map(|g| g.right));
        LaneGeometry::derive(left, right, width, height)
    }

    pub fn frames_without_lines(&self) -> u64 {
        self.frames_without_lines
    }

    pub fn reset(&mut self) {
        self.history.clear();
    }
}

fn average_lines(lines: impl Iterator<Item = LaneLine>) -> Option<LaneLine> {
    let lines: Vec<LaneLine> = lines.collect();
    if lines.is_empty() {
        return None;
    }
    let n = lines.len() as f32;
    let mut coeffs = [0.0f32; 3];
    for l in &lines {
        for (c, v) in coeffs.iter_mut().zip(l.coeffs.iter()) {
            *c += v / n;
        }
    }
    let confidence = lines.iter().map(|l| l.confidence).sum::<f32>() / n;

    let mut votes: HashMap<LaneMarking, usize> = HashMap::new();
    for l in &lines {
        *votes.entry(l.marking).or_insert(0) += 1;
    }
    let marking = votes
        .into_iter()
        .max_by_key(|(m, count)| (*count, m.is_restricted()))
        .map(|(m, _)| m)
        .unwrap_or(LaneMarking::Dashed);

    Some(LaneLine {
        coeffs,
        confidence,
        marking,
    })
}

/// Least-squares x = a·y² + b·y + c. Falls back to a straight line when
/// fewer than three distinct rows are available.
pub fn fit_quadratic(points: &[(f32, f32)]) -> Option<[f32; 3]> {
    if points.len() < 2 {
        return None;
    }
    let mut rows: Vec<f64> = points.iter().map(|p| p.1 as f64).collect();
    rows.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    rows.dedup_by(|a, b| (*a - *b).abs() < 1e-6);
    if rows.len() < 2 {
        return None;
    }
    let degree = if rows.len() >= 3 { 2 } else { 1 };

    let mut s = [0.0f64; 5]; // Σy^k
    let mut t = [0.0f64; 3]; // Σx·y^k
    for &(x, y) in points {
        let (x, y) = (x as f64, y as f64);
        let mut yk = 1.0;
        for (k, sk) in s.iter_mut().enumerate() {
            *sk += yk;
            if k < 3 {
                t[k] += x * yk;
            }
            yk *= y;
        }
    }

    if degree == 1 {
        let det = s[0] * s[2] - s[1] * s[1];
        if det.abs() < 1e-9 {
            return None;
        }
        let b = (s[0] * t[1] - s[1] * t[0]) / det;
        let c = (t[0] - b * s[1]) / s[0];
        return Some([0.0, b as f32, c as f32]);
    }

    // [s4 s3 s2][a]   [t2]
    // [s3 s2 s1][b] = [t1]
    // [s2 s1 s0][c]   [t0]
    let m = [[s[4], s[3], s[2]], [s[3], s[2], s[1]], [s[2], s[1], s[0]]];
    let rhs = [t[2], t[1], t[0]];
    let det3 = |m: &[[f64; 3]; 3]| {
        m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
            - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
            + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0])
    };
    let d = det3(&m);
    if d.abs() < 1e-9 {
        return None;
    }
    let mut out = [0.0f32; 3];
    for (col, o) in out.iter_mut().enumerate() {
        let mut mc = m;
        for row in 0..3 {
            mc[row][col] = rhs[row];
        }
        *o = (det3(&mc) / d) as f32;
    }
    if out.iter().all(|v| v.is_finite()) {
        Some(out)
    } else {
        None
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const W: f32 = 1280.0;
    const H: f32 = 720.0;

    /// Long left marking from (300,720) to (540,440) and right from (980,720) to (740,440)
    fn straight_lane_segments() -> Vec<LineSegment> {
        vec![
            LineSegment::new(300.0, 720.0, 420.0, 580.0),
            LineSegment::new(420.0, 580.0, 540.0, 440.0),
            LineSegment::new(980.0, 720.0, 860.0, 580.0),
            LineSegment::new(860.0, 580.0, 740.0, 440.0),
        ]
    }

    #[test]
    fn test_segments_classified_and_fitted() {
        let mut d = LaneDetector::new(LaneConfig::default());
        let g = d.process(&straight_lane_segments(), W, H);
        let left = g.left.expect("left line");
        let right = g.right.expect("right line");
        assert!((left.x_at(720.0) - 300.0).abs() < 1.0);
        assert!((right.x_at(720.0) - 980.0).abs() < 1.0);
        assert!((g.lane_width_px.unwrap() - 680.0).abs() < 2.0);
        assert!(left.confidence > 0.99);
        assert_eq!(left.marking, LaneMarking::Solid, "continuous coverage is solid");
        let center = g.center.expect("center line");
        assert!((center.x_at(720.0) - 640.0).abs() < 1.0);
    }

    #[test]
    fn test_short_segments_are_dashed() {
        let mut d = LaneDetector::new(LaneConfig::default());
        let segs = vec![
            LineSegment::new(300.0, 720.0, 330.0, 685.0),
            LineSegment::new(420.0, 580.0, 450.0, 545.0),
        ];
        let g = d.process(&segs, W, H);
        assert_eq!(g.left.unwrap().marking, LaneMarking::Dashed);
        assert!(g.right.is_none());
    }

    #[test]
    fn test_no_segments_is_not_an_error() {
        let mut d = LaneDetector::new(LaneConfig::default());
        let g = d.process(&[], W, H);
        assert!(!g.has_lines());
        assert_eq!(d.frames_without_lines(), 1);
    }

    #[test]
    fn test_out_of_roi_and_flat_segments_ignored() {
        let d = LaneDetector::new(LaneConfig::default());
        let segs = vec![
            LineSegment::new(100.0, 100.0, 200.0, 0.0),   // above ROI
            LineSegment::new(400.0, 700.0, 600.0, 690.0), // nearly horizontal
            LineSegment::new(500.0, 700.0, 500.0, 500.0), // vertical
        ];
        assert!(!d.fit_frame(&segs, W, H).has_lines());
    }

    #[test]
    fn test_history_smooths_jitter() {
        let mut d = LaneDetector::new(LaneConfig::default());
        d.process(&straight_lane_segments(), W, H);
        let shifted: Vec<LineSegment> = straight_lane_segments()
            .into_iter()
            .map(|s| LineSegment::new(s.x1 + 20.0, s.y1, s.x2 + 20.0, s.y2))
            .collect();
        let g = d.process(&shifted, W, H);
        assert!((g.left.unwrap().x_at(720.0) - 310.0).abs() < 1.0, "mean of 300 and 320");
        // a frame without lines keeps the smoothed geometry
        let g = d.process(&[], W, H);
        assert!(g.has_lines());
    }

    #[test]
    fn test_quadratic_fit_recovers_curve() {
        let pts: Vec<(f32, f32)> = (0..10)
            .map(|i| {
                let y = 400.0 + i as f32 * 30.0;
                (0.001 * y * y - 0.5 * y + 300.0, y)
            })
            .collect();
        let c = fit_quadratic(&pts).unwrap();
        assert!((c[0] - 0.001).abs() < 1e-4);
        let line = LaneLine {
            coeffs: c,
            confidence: 1.0,
            marking: LaneMarking::Solid,
        };
        assert!(line.curvature_radius(600.0).is_finite());
    }

    #[test]
    fn test_roi_shape() {
        let roi = RegionOfInterest::from_config(&LaneConfig::default(), W, H);
        assert!(roi.contains(640.0, 700.0));
        assert!(!roi.contains(50.0, 700.0));
        assert!(!roi.contains(640.0, 300.0));
        assert!(!roi.contains(300.0, 440.0), "outside the narrowing top");
    }
}
