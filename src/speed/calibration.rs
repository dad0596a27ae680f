// src/speed/calibration.rs
//
// Pixel ↔ ground-plane mapping for a fixed camera.
//
// A homography is fitted by normalised linear least squares (DLT with
// h33 = 1) over ≥4 point correspondences. Each zone may carry its own
// correspondences; zones without them use the camera-wide mapping. A zone
// whose own geometry is degenerate is kept but yields no real-world
// coordinates, so speed is skipped there and nowhere else.

use crate::error::CalibrationError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info, warn};

/// Mean re-projection error (meters) above which a fit is refused.
pub const MAX_CALIBRATION_ERROR_M: f64 = 0.5;
/// Distance test tolerance used by `validate`.
pub const DISTANCE_TEST_TOLERANCE_M: f64 = 0.2;

// ============================================================================
// HOMOGRAPHY
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Homography(pub [[f64; 3]; 3]);

impl Homography {
    pub fn identity() -> Self {
        Self([[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]])
    }

    /// Fit a mapping src → dst. Needs ≥4 non-degenerate pairs.
    pub fn estimate(src: &[(f64, f64)], dst: &[(f64, f64)]) -> Result<Self, CalibrationError> {
        let n = src.len().min(dst.len());
        if n < 4 {
            return Err(CalibrationError::InsufficientPoints(n));
        }
        let (t_src, src_n) = normalize_points(&src[..n]).ok_or(CalibrationError::Degenerate)?;
        let (t_dst, dst_n) = normalize_points(&dst[..n]).ok_or(CalibrationError::Degenerate)?;

        // Normal equations AᵀA h = Aᵀb for the 8 unknowns
        let mut ata = [[0.0f64; 8]; 8];
        let mut atb = [0.0f64; 8];
        for i in 0..n {
            let (x, y) = src_n[i];
            let (u, v) = dst_n[i];
            let rows = [
                ([x, y, 1.0, 0.0, 0.0, 0.0, -x * u, -y * u], u),
                ([0.0, 0.0, 0.0, x, y, 1.0, -x * v, -y * v], v),
            ];
            for (a, b) in rows.iter() {
                for r in 0..8 {
                    atb[r] += a[r] * b;
                    for c in 0..8 {
                        ata[r][c] += a[r] * a[c];
                    }
                }
            }
        }
        let h = solve_8x8(ata, atb).ok_or(CalibrationError::Degenerate)?;
        let hn = Homography([[h[0], h[1], h[2]], [h[3], h[4], h[5]], [h[6], h[7], 1.0]]);

        // Undo normalisation: H = T_dst⁻¹ · Hn · T_src
        let t_dst_inv = t_dst.inverse().ok_or(CalibrationError::Degenerate)?;
        let full = t_dst_inv.compose(&hn).compose(&t_src);
        full.normalized().ok_or(CalibrationError::Degenerate)
    }

    /// Apply to a point. None when the point maps to infinity.
    pub fn apply(&self, x: f64, y: f64) -> Option<(f64, f64)> {
        let m = &self.0;
        let w = m[2][0] * x + m[2][1] * y + m[2][2];
        if w.abs() < 1e-12 {
            return None;
        }
        let u = (m[0][0] * x + m[0][1] * y + m[0][2]) / w;
        let v = (m[1][0] * x + m[1][1] * y + m[1][2]) / w;
        if u.is_finite() && v.is_finite() {
            Some((u, v))
        } else {
            None
        }
    }

    pub fn inverse(&self) -> Option<Self> {
        let m = &self.0;
        let det = m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
            - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
            + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0]);
        if det.abs() < 1e-15 {
            return None;
        }
        let inv_det = 1.0 / det;
        let mut out = [[0.0; 3]; 3];
        out[0][0] = (m[1][1] * m[2][2] - m[1][2] * m[2][1]) * inv_det;
        out[0][1] = (m[0][2] * m[2][1] - m[0][1] * m[2][2]) * inv_det;
        out[0][2] = (m[0][1] * m[1][2] - m[0][2] * m[1][1]) * inv_det;
        out[1][0] = (m[1][2] * m[2][0] - m[1][0] * m[2][2]) * inv_det;
        out[1][1] = (m[0][0] * m[2][2] - m[0][2] * m[2][0]) * inv_det;
        out[1][2] = (m[0][2] * m[1][0] - m[0][0] * m[1][2]) * inv_det;
        out[2][0] = (m[1][0] * m[2][1] - m[1][1] * m[2][0]) * inv_det;
        out[2][1] = (m[0][1] * m[2][0] - m[0][0] * m[2][1]) * inv_det;
        out[2][2] = (m[0][0] * m[1][1] - m[0][1] * m[1][0]) * inv_det;
        Some(Self(out))
    }

    fn compose(&self, rhs: &Homography) -> Homography {
        let mut out = [[0.0; 3]; 3];
        for (r, row) in out.iter_mut().enumerate() {
            for (c, cell) in row.iter_mut().enumerate() {
                *cell = (0..3).map(|k| self.0[r][k] * rhs.0[k][c]).sum();
            }
        }
        Homography(out)
    }

    fn normalized(&self) -> Option<Homography> {
        let s = self.0[2][2];
        if s.abs() < 1e-15 {
            return None;
        }
        let mut out = self.0;
        for row in out.iter_mut() {
            for v in row.iter_mut() {
                *v /= s;
            }
        }
        Some(Homography(out))
    }
}

/// Hartley normalisation: centroid at origin, mean distance √2.
fn normalize_points(points: &[(f64, f64)]) -> Option<(Homography, Vec<(f64, f64)>)> {
    let n = points.len() as f64;
    let cx = points.iter().map(|p| p.0).sum::<f64>() / n;
    let cy = points.iter().map(|p| p.1).sum::<f64>() / n;
    let mean_dist = points
        .iter()
        .map(|p| ((p.0 - cx).powi(2) + (p.1 - cy).powi(2)).sqrt())
        .sum::<f64>()
        / n;
    if mean_dist < 1e-9 {
        return None;
    }
    let s = std::f64::consts::SQRT_2 / mean_dist;
    let t = Homography([[s, 0.0, -s * cx], [0.0, s, -s * cy], [0.0, 0.0, 1.0]]);
    let normalized = points.iter().map(|p| (s * (p.0 - cx), s * (p.1 - cy))).collect();
    Some((t, normalized))
}

/// Gaussian elimination with partial pivoting.
fn solve_8x8(mut a: [[f64; 8]; 8], mut b: [f64; 8]) -> Option<[f64; 8]> {
    for col in 0..8 {
        let pivot = (col..8).max_by(|&i, &j| {
            a[i][col]
                .abs()
                .partial_cmp(&a[j][col].abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        })?;
        if a[pivot][col].abs() < 1e-10 {
            return None;
        }
        a.swap(col, pivot);
        b.swap(col, pivot);
        for row in (col + 1)..8 {
            let f = a[row][col] / a[col][col];
            for k in col..8 {
                a[row][k] -= f * a[col][k];
            }
            b[row] -= f * b[col];
        }
    }
    let mut x = [0.0f64; 8];
    for row in (0..8).rev() {
        let tail: f64 = ((row + 1)..8).map(|k| a[row][k] * x[k]).sum();
        x[row] = (b[row] - tail) / a[row][row];
    }
    if x.iter().all(|v| v.is_finite()) {
        Some(x)
    } else {
        None
    }
}

// ============================================================================
// TYPES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationPoint {
    pub pixel_x: f64,
    pub pixel_y: f64,
    /// meters
    pub real_x: f64,
    pub real_y: f64,
    #[serde(default)]
    pub description: String,
}

impl CalibrationPoint {
    pub fn new(pixel_x: f64, pixel_y: f64, real_x: f64, real_y: f64) -> Self {
        Self {
            pixel_x,
            pixel_y,
            real_x,
            real_y,
            description: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ZoneDirection {
    Forward,
    Backward,
    #[default]
    Any,
}

pub type PixelLine = ((f64, f64), (f64, f64));

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationZone {
    pub zone_id: String,
    pub name: String,
    /// Zone boundary in pixels
    pub pixel_points: Vec<(f64, f64)>,
    /// Matching boundary in meters; ≥4 entries gives the zone its own mapping
    #[serde(default)]
    pub real_world_points: Vec<(f64, f64)>,
    pub speed_limit_kmh: f64,
    #[serde(default)]
    pub tolerance_kmh: Option<f64>,
    #[serde(default)]
    pub measurement_distance_m: f64,
    #[serde(default)]
    pub entry_line: Option<PixelLine>,
    #[serde(default)]
    pub exit_line: Option<PixelLine>,
    #[serde(default)]
    pub direction: ZoneDirection,
    /// Legal direction of travel in image space, used by wrong-way checks
    #[serde(default)]
    pub expected_direction: Option<(f32, f32)>,
    #[serde(skip)]
    homography: Option<Homography>,
    #[serde(skip)]
    degenerate: bool,
    /// Fit confidence of the zone's own mapping
    #[serde(skip)]
    confidence: f64,
}

impl CalibrationZone {
    pub fn new(zone_id: &str, name: &str, pixel_points: Vec<(f64, f64)>, speed_limit_kmh: f64) -> Self {
        Self {
            zone_id: zone_id.to_string(),
            name: name.to_string(),
            pixel_points,
            real_world_points: Vec::new(),
            speed_limit_kmh,
            tolerance_kmh: None,
            measurement_distance_m: 0.0,
            entry_line: None,
            exit_line: None,
            direction: ZoneDirection::Any,
            expected_direction: None,
            homography: None,
            degenerate: false,
            confidence: 0.0,
        }
    }

    pub fn with_real_world_points(mut self, points: Vec<(f64, f64)>) -> Self {
        self.real_world_points = points;
        self
    }

    pub fn has_own_mapping(&self) -> bool {
        self.real_world_points.len() >= 4 && self.real_world_points.len() == self.pixel_points.len()
    }

    /// True when the zone's own geometry could not be fitted.
    pub fn is_degenerate(&self) -> bool {
        self.degenerate
    }

    pub fn contains(&self, x: f64, y: f64) -> bool {
        point_in_polygon((x, y), &self.pixel_points)
    }
}

/// Ray casting. Points on a horizontal top edge count as outside.
pub fn point_in_polygon(point: (f64, f64), polygon: &[(f64, f64)]) -> bool {
    let n = polygon.len();
    if n < 3 {
        return false;
    }
    let (x, y) = point;
    let mut inside = false;
    let mut j = n - 1;
    for i in 0..n {
        let (xi, yi) = polygon[i];
        let (xj, yj) = polygon[j];
        if (yi > y) != (yj > y) {
            let x_cross = (xj - xi) * (y - yi) / (yj - yi) + xi;
            if x < x_cross {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}

#[derive(Debug, Clone, Serialize)]
pub struct CalibrationValidation {
    pub is_valid: bool,
    pub error: Option<String>,
    pub calibration_error_m: Option<f64>,
    pub confidence: f64,
    pub num_points: usize,
    pub num_zones: usize,
    pub distance_test_error_m: Option<f64>,
    pub distance_test_passed: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CalibrationFile {
    points: Vec<CalibrationPoint>,
    zones: Vec<CalibrationZone>,
}

// ============================================================================
// CALIBRATOR
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct CameraCalibrator {
    points: Vec<CalibrationPoint>,
    zones: Vec<CalibrationZone>,
    homography: Option<Homography>,
    inverse: Option<Homography>,
    calibration_error: Option<f64>,
    confidence: f64,
}

impl CameraCalibrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a correspondence; refits once at least four are present.
    pub fn add_calibration_point(&mut self, point: CalibrationPoint) -> Result<(), CalibrationError> {
        debug!(
            "Calibration point ({:.0}, {:.0}) -> ({:.2}m, {:.2}m)",
            point.pixel_x, point.pixel_y, point.real_x, point.real_y
        );
        self.points.push(point);
        if self.points.len() >= 4 {
            self.calibrate()?;
        }
        Ok(())
    }

    /// Fit the camera-wide homography. Returns the mean re-projection error.
    pub fn calibrate(&mut self) -> Result<f64, CalibrationError> {
        let src: Vec<(f64, f64)> = self.points.iter().map(|p| (p.pixel_x, p.pixel_y)).collect();
        let dst: Vec<(f64, f64)> = self.points.iter().map(|p| (p.real_x, p.real_y)).collect();

        self.homography = None;
        self.inverse = None;
        self.confidence = 0.0;

        let h = Homography::estimate(&src, &dst)?;
        let inverse = h.inverse().ok_or(CalibrationError::Degenerate)?;
        let error = reprojection_error(&h, &src, &dst);
        self.calibration_error = Some(error);

        if error >= MAX_CALIBRATION_ERROR_M {
            warn!("Calibration error too high: {:.3}m", error);
            return Err(CalibrationError::ErrorTooHigh(error));
        }

        self.homography = Some(h);
        self.inverse = Some(inverse);
        self.confidence = (1.0 - error).max(0.0);
        info!(
            "Camera calibrated from {} points, error {:.3}m, confidence {:.2}",
            self.points.len(),
            error,
            self.confidence
        );
        Ok(error)
    }

    pub fn is_calibrated(&self) -> bool {
        self.homography.is_some()
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn calibration_error(&self) -> Option<f64> {
        self.calibration_error
    }

    pub fn points(&self) -> &[CalibrationPoint] {
        &self.points
    }

    pub fn pixel_to_real(&self, px: f64, py: f64) -> Option<(f64, f64)> {
        self.homography.as_ref()?.apply(px, py)
    }

    pub fn real_to_pixel(&self, rx: f64, ry: f64) -> Option<(f64, f64)> {
        self.inverse.as_ref()?.apply(rx, ry)
    }

    /// Ground distance in meters between two pixels.
    pub fn distance(&self, p1: (f64, f64), p2: (f64, f64)) -> Option<f64> {
        let a = self.pixel_to_real(p1.0, p1.1)?;
        let b = self.pixel_to_real(p2.0, p2.1)?;
        Some(((b.0 - a.0).powi(2) + (b.1 - a.1).powi(2)).sqrt())
    }

    /// Register a zone. Malformed polygons are refused; degenerate zone
    /// mappings are accepted but disable real-world conversion in that zone.
    pub fn add_zone(&mut self, mut zone: CalibrationZone) -> Result<(), CalibrationError> {
        if zone.pixel_points.len() < 3 {
            return Err(CalibrationError::InvalidZone(
                zone.zone_id.clone(),
                "polygon needs at least 3 vertices".into(),
            ));
        }
        if !(zone.speed_limit_kmh.is_finite() && zone.speed_limit_kmh > 0.0) {
            return Err(CalibrationError::InvalidZone(
                zone.zone_id.clone(),
                format!("speed limit {} is not positive", zone.speed_limit_kmh),
            ));
        }

        zone.homography = None;
        zone.degenerate = false;
        zone.confidence = 0.0;
        if zone.has_own_mapping() {
            match Homography::estimate(&zone.pixel_points, &zone.real_world_points) {
                Ok(h) => {
                    let error = reprojection_error(&h, &zone.pixel_points, &zone.real_world_points);
                    zone.confidence = (1.0 - error).max(0.0);
                    debug!(
                        "Zone '{}' mapping error {:.3}m, confidence {:.2}",
                        zone.zone_id, error, zone.confidence
                    );
                    zone.homography = Some(h);
                }
                Err(e) => {
                    warn!("Zone '{}' geometry unusable ({}); speed disabled there", zone.zone_id, e);
                    zone.degenerate = true;
                }
            }
        }

        info!(
            "Zone '{}' ({}) registered, limit {:.0} km/h",
            zone.zone_id, zone.name, zone.speed_limit_kmh
        );
        self.zones.retain(|z| z.zone_id != zone.zone_id);
        self.zones.push(zone);
        Ok(())
    }

    pub fn zones(&self) -> &[CalibrationZone] {
        &self.zones
    }

    pub fn zone(&self, zone_id: &str) -> Option<&CalibrationZone> {
        self.zones.iter().find(|z| z.zone_id == zone_id)
    }

    pub fn zone_for_point(&self, px: f64, py: f64) -> Option<&CalibrationZone> {
        self.zones.iter().find(|z| z.contains(px, py))
    }

    /// Real-world coordinates using the zone's own mapping when it has one.
    pub fn zone_pixel_to_real(&self, zone: &CalibrationZone, px: f64, py: f64) -> Option<(f64, f64)> {
        if zone.degenerate {
            return None;
        }
        match &zone.homography {
            Some(h) => h.apply(px, py),
            None => self.pixel_to_real(px, py),
        }
    }

    /// Confidence of the mapping `zone_pixel_to_real` uses for this zone.
    pub fn zone_confidence(&self, zone: &CalibrationZone) -> f64 {
        if zone.degenerate {
            return 0.0;
        }
        match zone.homography {
            Some(_) => zone.confidence,
            None => self.confidence,
        }
    }

    /// True if real-world coordinates are available for this zone.
    pub fn zone_is_measurable(&self, zone: &CalibrationZone) -> bool {
        !zone.degenerate && (zone.homography.is_some() || self.is_calibrated())
    }

    pub fn validate(&self) -> CalibrationValidation {
        if !self.is_calibrated() {
            return CalibrationValidation {
                is_valid: false,
                error: Some("Not calibrated".into()),
                calibration_error_m: self.calibration_error,
                confidence: 0.0,
                num_points: self.points.len(),
                num_zones: self.zones.len(),
                distance_test_error_m: None,
                distance_test_passed: None,
            };
        }

        let error = self.calibration_error.unwrap_or(f64::INFINITY);
        let mut result = CalibrationValidation {
            is_valid: error < MAX_CALIBRATION_ERROR_M,
            error: None,
            calibration_error_m: Some(error),
            confidence: self.confidence,
            num_points: self.points.len(),
            num_zones: self.zones.len(),
            distance_test_error_m: None,
            distance_test_passed: None,
        };

        if let [p1, p2, ..] = self.points.as_slice() {
            let actual = ((p2.real_x - p1.real_x).powi(2) + (p2.real_y - p1.real_y).powi(2)).sqrt();
            if let Some(measured) = self.distance((p1.pixel_x, p1.pixel_y), (p2.pixel_x, p2.pixel_y)) {
                let diff = (measured - actual).abs();
                result.distance_test_error_m = Some(diff);
                result.distance_test_passed = Some(diff < DISTANCE_TEST_TOLERANCE_M);
            }
        }
        let degenerate: Vec<&str> = self
            .zones
            .iter()
            .filter(|z| z.degenerate)
            .map(|z| z.zone_id.as_str())
            .collect();
        if !degenerate.is_empty() {
            result.error = Some(format!("degenerate zones: {}", degenerate.join(", ")));
        }
        result
    }

    pub fn save(&self, path: &Path) -> Result<(), CalibrationError> {
        let file = CalibrationFile {
            points: self.points.clone(),
            zones: self.zones.clone(),
        };
        std::fs::write(path, serde_json::to_string_pretty(&file)?)?;
        info!("Calibration saved to {}", path.display());
        Ok(())
    }

    /// Load points and zones, refitting every mapping.
    pub fn load(path: &Path) -> Result<Self, CalibrationError> {
        let contents = std::fs::read_to_string(path)?;
        let file: CalibrationFile = serde_json::from_str(&contents)?;
        let mut calibrator = Self::new();
        calibrator.points = file.points;
        if calibrator.points.len() >= 4 {
            if let Err(e) = calibrator.calibrate() {
                warn!("Loaded calibration did not fit: {}", e);
            }
        }
        for zone in file.zones {
            calibrator.add_zone(zone)?;
        }
        Ok(calibrator)
    }

    /// Preset for a two-lane highway section: the lower 40% of the frame is
    /// assumed to cover 7m × 40m of road.
    pub fn default_highway(frame_width: f64, frame_height: f64) -> Result<Self, CalibrationError> {
        let mut c = Self::new();
        let (w, h) = (frame_width, frame_height);
        let corners = [
            (w * 0.25, h * 0.95, 0.0, 0.0),
            (w * 0.75, h * 0.95, 7.0, 0.0),
            (w * 0.60, h * 0.60, 7.0, 40.0),
            (w * 0.40, h * 0.60, 0.0, 40.0),
        ];
        for (px, py, rx, ry) in corners {
            c.points.push(CalibrationPoint {
                pixel_x: px,
                pixel_y: py,
                real_x: rx,
                real_y: ry,
                description: "highway preset".into(),
            });
        }
        c.calibrate()?;
        let mut zone = CalibrationZone::new(
            "highway_main",
            "Highway main section",
            corners.iter().map(|(px, py, _, _)| (*px, *py)).collect(),
            100.0,
        );
        zone.measurement_distance_m = 40.0;
        zone.expected_direction = Some((0.0, -1.0));
        c.add_zone(zone)?;
        Ok(c)
    }
}

fn reprojection_error(h: &Homography, src: &[(f64, f64)], dst: &[(f64, f64)]) -> f64 {
    let mut total = 0.0;
    let mut n = 0usize;
    for (s, d) in src.iter().zip(dst) {
        match h.apply(s.0, s.1) {
            Some((u, v)) => total += ((u - d.0).powi(2) + (v - d.1).powi(2)).sqrt(),
            None => return f64::INFINITY,
        }
        n += 1;
    }
    if n == 0 {
        f64::INFINITY
    } else {
        total / n as f64
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Trapezoid in the image mapped onto a 10m × 50m rectangle.
    fn calibrated() -> CameraCalibrator {
        let mut c = CameraCalibrator::new();
        for (px, py, rx, ry) in [
            (200.0, 700.0, 0.0, 0.0),
            (1000.0, 700.0, 10.0, 0.0),
            (760.0, 300.0, 10.0, 50.0),
            (440.0, 300.0, 0.0, 50.0),
        ] {
            c.add_calibration_point(CalibrationPoint::new(px, py, rx, ry))
                .expect("point accepted");
        }
        c
    }

    #[test]
    fn test_exact_fit_from_four_points() {
        let c = calibrated();
        assert!(c.is_calibrated());
        assert!(c.calibration_error().unwrap() < 1e-6);
        assert!((c.confidence() - 1.0).abs() < 1e-6);

        let (rx, ry) = c.pixel_to_real(1000.0, 700.0).unwrap();
        assert!((rx - 10.0).abs() < 1e-6 && ry.abs() < 1e-6);
    }

    #[test]
    fn test_real_to_pixel_inverts_mapping() {
        let c = calibrated();
        let (px, py) = c.real_to_pixel(5.0, 25.0).unwrap();
        let (rx, ry) = c.pixel_to_real(px, py).unwrap();
        assert!((rx - 5.0).abs() < 1e-6);
        assert!((ry - 25.0).abs() < 1e-6);
    }

    #[test]
    fn test_distance_between_known_points() {
        let c = calibrated();
        let d = c.distance((200.0, 700.0), (440.0, 300.0)).unwrap();
        assert!((d - 50.0).abs() < 1e-6, "got {d}");
    }

    #[test]
    fn test_uncalibrated_returns_none() {
        let c = CameraCalibrator::new();
        assert!(c.pixel_to_real(10.0, 10.0).is_none());
        assert!(c.distance((0.0, 0.0), (5.0, 5.0)).is_none());
        let v = c.validate();
        assert!(!v.is_valid);
        assert_eq!(v.confidence, 0.0);
    }

    #[test]
    fn test_collinear_points_are_degenerate() {
        let src = [(0.0, 0.0), (1.0, 1.0), (2.0, 2.0), (3.0, 3.0)];
        let dst = [(0.0, 0.0), (1.0, 1.0), (2.0, 2.0), (3.0, 3.0)];
        assert!(matches!(
            Homography::estimate(&src, &dst),
            Err(CalibrationError::Degenerate)
        ));
    }

    #[test]
    fn test_insufficient_points() {
        let src = [(0.0, 0.0), (1.0, 0.0), (1.0, 1.0)];
        assert!(matches!(
            Homography::estimate(&src, &src),
            Err(CalibrationError::InsufficientPoints(3))
        ));
    }

    #[test]
    fn test_validate_reports_distance_test() {
        let v = calibrated().validate();
        assert!(v.is_valid);
        assert_eq!(v.distance_test_passed, Some(true));
        assert_eq!(v.num_points, 4);
    }

    #[test]
    fn test_zone_lookup_and_degenerate_zone_isolated() {
        let mut c = calibrated();
        c.add_zone(CalibrationZone::new(
            "z1",
            "Main",
            vec![(200.0, 700.0), (1000.0, 700.0), (760.0, 300.0), (440.0, 300.0)],
            60.0,
        ))
        .unwrap();
        let broken = CalibrationZone::new(
            "z2",
            "Broken",
            vec![(0.0, 0.0), (100.0, 0.0), (100.0, 100.0), (0.0, 100.0)],
            50.0,
        )
        .with_real_world_points(vec![(0.0, 0.0), (0.0, 0.0), (0.0, 0.0), (0.0, 0.0)]);
        c.add_zone(broken).unwrap();

        let z1 = c.zone_for_point(600.0, 500.0).expect("inside z1");
        assert_eq!(z1.zone_id, "z1");
        assert!(c.zone_pixel_to_real(z1, 600.0, 500.0).is_some());
        assert_eq!(c.zone_confidence(z1), c.confidence());

        let z2 = c.zone_for_point(50.0, 50.0).expect("inside z2");
        assert!(z2.is_degenerate());
        assert!(c.zone_pixel_to_real(z2, 50.0, 50.0).is_none());
        assert_eq!(c.zone_confidence(z2), 0.0);
        assert!(c.validate().error.unwrap().contains("z2"));
    }

    #[test]
    fn test_zone_rejects_bad_polygon() {
        let mut c = CameraCalibrator::new();
        let zone = CalibrationZone::new("z", "bad", vec![(0.0, 0.0), (1.0, 1.0)], 50.0);
        assert!(c.add_zone(zone).is_err());
    }

    #[test]
    fn test_point_in_polygon() {
        let square = [(0.0, 0.0), (10.0, 0.0), (10.0, 10.0), (0.0, 10.0)];
        assert!(point_in_polygon((5.0, 5.0), &square));
        assert!(!point_in_polygon((15.0, 5.0), &square));
        assert!(!point_in_polygon((5.0, -1.0), &square));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calibration.json");
        let mut c = calibrated();
        c.add_zone(CalibrationZone::new(
            "z1",
            "Main",
            vec![(200.0, 700.0), (1000.0, 700.0), (760.0, 300.0)],
            80.0,
        ))
        .unwrap();
        c.save(&path).unwrap();

        let loaded = CameraCalibrator::load(&path).unwrap();
        assert!(loaded.is_calibrated());
        assert_eq!(loaded.zones().len(), 1);
        assert_eq!(loaded.zone("z1").unwrap().speed_limit_kmh, 80.0);
    }

    #[test]
    fn test_default_highway_preset() {
        let c = CameraCalibrator::default_highway(1280.0, 720.0).unwrap();
        assert!(c.validate().is_valid);
        assert!(c.zone("highway_main").is_some());
    }
}
