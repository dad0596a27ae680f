// src/tracking/trajectory.rs
//
// Per-track position history. The store is owned by one pipeline and keyed
// by track id, so expiring a track is a plain key removal.
//
// Invariants:
//   - points are strictly timestamp-monotonic (out-of-order points rejected)
//   - history is a bounded ring; total_distance survives eviction

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tracing::debug;

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrajectoryConfig {
    /// Ring capacity per trajectory
    pub max_points: usize,
    /// Upper bound on simultaneously stored trajectories
    pub max_trajectories: usize,
    /// Idle time after which a trajectory is pruned
    pub stale_after_ms: f64,
    /// Points used for the direction vector
    pub direction_window: usize,
}

impl Default for TrajectoryConfig {
    fn default() -> Self {
        Self {
            max_points: 60,
            max_trajectories: 1000,
            stale_after_ms: 5_000.0,
            direction_window: 5,
        }
    }
}

// ============================================================================
// TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryPoint {
    pub x: f32,
    pub y: f32,
    pub timestamp_ms: f64,
    pub frame_id: u64,
}

impl TrajectoryPoint {
    pub fn new(x: f32, y: f32, timestamp_ms: f64, frame_id: u64) -> Self {
        Self {
            x,
            y,
            timestamp_ms,
            frame_id,
        }
    }

    fn distance_to(&self, other: &TrajectoryPoint) -> f32 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

#[derive(Debug, Clone)]
pub struct Trajectory {
    pub track_id: u32,
    points: VecDeque<TrajectoryPoint>,
    max_points: usize,
    /// Cumulative path length in pixels, including evicted segments
    total_distance: f32,
    /// Path length covered by the points still in the ring
    window_distance: f32,
    direction_window: usize,
}

impl Trajectory {
    pub fn new(track_id: u32, max_points: usize) -> Self {
        Self {
            track_id,
            points: VecDeque::with_capacity(max_points.max(2)),
            max_points: max_points.max(2),
            total_distance: 0.0,
            window_distance: 0.0,
            direction_window: 5,
        }
    }

    fn with_direction_window(mut self, window: usize) -> Self {
        self.direction_window = window.max(2);
        self
    }

    /// Append a point. Returns false (and drops it) if its timestamp is not
    /// strictly after the last one.
    pub fn push(&mut self, point: TrajectoryPoint) -> bool {
        if let Some(last) = self.points.back() {
            if point.timestamp_ms <= last.timestamp_ms {
                debug!(
                    "Trajectory {}: rejected non-monotonic point ({:.1} <= {:.1})",
                    self.track_id, point.timestamp_ms, last.timestamp_ms
                );
                return false;
            }
            let step = last.distance_to(&point);
            self.total_distance += step;
            self.window_distance += step;
        }
        self.points.push_back(point);

        if self.points.len() > self.max_points {
            if let Some(evicted) = self.points.pop_front() {
                if let Some(next) = self.points.front() {
                    self.window_distance -= evicted.distance_to(next);
                }
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn points(&self) -> impl Iterator<Item = &TrajectoryPoint> {
        self.points.iter()
    }

    pub fn first(&self) -> Option<&TrajectoryPoint> {
        self.points.front()
    }

    pub fn last(&self) -> Option<&TrajectoryPoint> {
        self.points.back()
    }

    pub fn get(&self, index: usize) -> Option<&TrajectoryPoint> {
        self.points.get(index)
    }

    pub fn last_update_ms(&self) -> Option<f64> {
        self.last().map(|p| p.timestamp_ms)
    }

    /// Time span covered by the stored points.
    pub fn duration_secs(&self) -> f64 {
        match (self.first(), self.last()) {
            (Some(a), Some(b)) => (b.timestamp_ms - a.timestamp_ms) / 1000.0,
            _ => 0.0,
        }
    }

    /// Cumulative pixel path length since the track started.
    pub fn total_distance(&self) -> f32 {
        self.total_distance
    }

    /// Mean pixel speed over the stored window (px/s).
    pub fn avg_speed(&self) -> f32 {
        let secs = self.duration_secs();
        if secs > 0.0 {
            (self.window_distance.max(0.0) as f64 / secs) as f32
        } else {
            0.0
        }
    }

    /// Unit heading from the point `direction_window` back to the latest.
    pub fn direction(&self) -> Option<(f32, f32)> {
        if self.points.len() < 2 {
            return None;
        }
        let n = self.points.len();
        let start = n.saturating_sub(self.direction_window);
        let a = self.points.get(start)?;
        let b = self.points.back()?;
        let (dx, dy) = (b.x - a.x, b.y - a.y);
        let norm = (dx * dx + dy * dy).sqrt();
        if norm < 1e-3 {
            return None;
        }
        Some((dx / norm, dy / norm))
    }

    /// Moving-average smoothed positions.
    pub fn smoothed(&self, window: usize) -> Vec<(f32, f32)> {
        let window = window.max(1);
        let pts: Vec<&TrajectoryPoint> = self.points.iter().collect();
        (0..pts.len())
            .map(|i| {
                let lo = i.saturating_sub(window / 2);
                let hi = (i + window / 2 + 1).min(pts.len());
                let slice = &pts[lo..hi];
                let n = slice.len() as f32;
                (
                    slice.iter().map(|p| p.x).sum::<f32>() / n,
                    slice.iter().map(|p| p.y).sum::<f32>() / n,
                )
            })
            .collect()
    }

    /// Constant-velocity extrapolation from the last two points.
    pub fn predict_next(&self, dt_ms: f64) -> Option<(f32, f32)> {
        let n = self.points.len();
        if n < 2 {
            return None;
        }
        let a = self.points.get(n - 2)?;
        let b = self.points.get(n - 1)?;
        let span = b.timestamp_ms - a.timestamp_ms;
        if span <= 0.0 {
            return None;
        }
        let k = (dt_ms / span) as f32;
        Some((b.x + (b.x - a.x) * k, b.y + (b.y - a.y) * k))
    }

    /// [x1, y1, x2, y2] covering all stored points.
    pub fn bounding_box(&self) -> Option<[f32; 4]> {
        let first = self.first()?;
        let mut bb = [first.x, first.y, first.x, first.y];
        for p in &self.points {
            bb[0] = bb[0].min(p.x);
            bb[1] = bb[1].min(p.y);
            bb[2] = bb[2].max(p.x);
            bb[3] = bb[3].max(p.y);
        }
        Some(bb)
    }
}

// ============================================================================
// STORE
// ============================================================================

pub struct TrajectoryStore {
    config: TrajectoryConfig,
    trajectories: HashMap<u32, Trajectory>,
}

impl TrajectoryStore {
    pub fn new(config: TrajectoryConfig) -> Self {
        Self {
            config,
            trajectories: HashMap::new(),
        }
    }

    /// Append a position for `track_id`, creating the trajectory on first use.
    pub fn append(&mut self, track_id: u32, point: TrajectoryPoint) -> bool {
        if !self.trajectories.contains_key(&track_id)
            && self.trajectories.len() >= self.config.max_trajectories
        {
            self.evict_oldest();
        }
        let max_points = self.config.max_points;
        let window = self.config.direction_window;
        self.trajectories
            .entry(track_id)
            .or_insert_with(|| Trajectory::new(track_id, max_points).with_direction_window(window))
            .push(point)
    }

    pub fn get(&self, track_id: u32) -> Option<&Trajectory> {
        self.trajectories.get(&track_id)
    }

    pub fn remove(&mut self, track_id: u32) -> Option<Trajectory> {
        self.trajectories.remove(&track_id)
    }

    pub fn len(&self) -> usize {
        self.trajectories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trajectories.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Trajectory> {
        self.trajectories.values()
    }

    /// Drop trajectories with no point newer than `stale_after_ms`.
    /// Returns the removed track ids.
    pub fn prune_stale(&mut self, now_ms: f64) -> Vec<u32> {
        let limit = self.config.stale_after_ms;
        let stale: Vec<u32> = self
            .trajectories
            .iter()
            .filter(|(_, t)| t.last_update_ms().map_or(true, |ts| now_ms - ts > limit))
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            self.trajectories.remove(id);
        }
        if !stale.is_empty() {
            debug!("Pruned {} stale trajectories", stale.len());
        }
        stale
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .trajectories
            .iter()
            .min_by(|a, b| {
                let ta = a.1.last_update_ms().unwrap_or(f64::MIN);
                let tb = b.1.last_update_ms().unwrap_or(f64::MIN);
                ta.partial_cmp(&tb).unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(id, _)| *id);
        if let Some(id) = oldest {
            self.trajectories.remove(&id);
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn pt(x: f32, y: f32, t: f64) -> TrajectoryPoint {
        TrajectoryPoint::new(x, y, t, (t / 33.0) as u64)
    }

    #[test]
    fn test_rejects_non_monotonic_points() {
        let mut t = Trajectory::new(1, 10);
        assert!(t.push(pt(0.0, 0.0, 100.0)));
        assert!(!t.push(pt(5.0, 0.0, 100.0)), "equal timestamp must be rejected");
        assert!(!t.push(pt(5.0, 0.0, 50.0)), "earlier timestamp must be rejected");
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn test_ring_is_bounded_and_distance_accumulates() {
        let mut t = Trajectory::new(1, 5);
        for i in 0..20 {
            t.push(pt(i as f32 * 10.0, 0.0, i as f64 * 100.0));
        }
        assert_eq!(t.len(), 5);
        assert!((t.total_distance() - 190.0).abs() < 1e-3);
        // window holds 5 points spanning 400ms and 40px
        assert!((t.avg_speed() - 100.0).abs() < 1e-2, "got {}", t.avg_speed());
    }

    #[test]
    fn test_direction_and_prediction() {
        let mut t = Trajectory::new(1, 30);
        for i in 0..6 {
            t.push(pt(100.0, 500.0 - i as f32 * 20.0, i as f64 * 100.0));
        }
        let (dx, dy) = t.direction().expect("direction");
        assert!(dx.abs() < 1e-4);
        assert!((dy + 1.0).abs() < 1e-4, "moving up the image");

        let (px, py) = t.predict_next(100.0).expect("prediction");
        assert!((px - 100.0).abs() < 1e-3);
        assert!((py - 380.0).abs() < 1e-3);
    }

    #[test]
    fn test_stationary_track_has_no_direction() {
        let mut t = Trajectory::new(1, 30);
        for i in 0..6 {
            t.push(pt(50.0, 50.0, i as f64 * 100.0));
        }
        assert!(t.direction().is_none());
    }

    #[test]
    fn test_store_prunes_stale_and_caps_count() {
        let mut store = TrajectoryStore::new(TrajectoryConfig {
            max_trajectories: 2,
            stale_after_ms: 1000.0,
            ..Default::default()
        });
        store.append(1, pt(0.0, 0.0, 0.0));
        store.append(2, pt(0.0, 0.0, 500.0));
        store.append(3, pt(0.0, 0.0, 900.0));
        assert_eq!(store.len(), 2);
        assert!(store.get(1).is_none(), "oldest trajectory evicted");

        let removed = store.prune_stale(1800.0);
        assert_eq!(removed, vec![2]);
        assert!(store.get(3).is_some());
    }

    #[test]
    fn test_smoothed_and_bbox() {
        let mut t = Trajectory::new(1, 30);
        t.push(pt(0.0, 0.0, 0.0));
        t.push(pt(10.0, 10.0, 100.0));
        t.push(pt(20.0, 0.0, 200.0));
        let s = t.smoothed(3);
        assert_eq!(s.len(), 3);
        assert!((s[1].0 - 10.0).abs() < 1e-4);
        assert_eq!(t.bounding_box(), Some([0.0, 0.0, 20.0, 10.0]));
    }
}
