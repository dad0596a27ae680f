// src/violations/cooldown.rs
//
// Duplicate suppression.
//
// CooldownTracker is per pipeline and keyed by (track id, type): the state
// machine idle → detected → reported | suppressed lives here.
// PlateDedup is shared by every pipeline and keyed by (plate, type); it
// catches repeats after a track id fragments.

use super::types::ViolationType;
use crate::capabilities::normalize_plate;
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationState {
    Idle,
    Detected,
    Reported,
    Suppressed,
}

#[derive(Debug, Clone, Copy)]
struct CooldownEntry {
    state: ViolationState,
    reported_at_ms: f64,
    cooldown_ms: f64,
    suppressed: u32,
}

#[derive(Debug, Default)]
pub struct CooldownTracker {
    entries: HashMap<(u32, ViolationType), CooldownEntry>,
}

impl CooldownTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A candidate was observed. Moves the pair to `Detected` and decides:
    /// `Reported` if no cooldown is active, else `Suppressed`.
    pub fn observe(
        &mut self,
        vehicle_id: u32,
        violation_type: ViolationType,
        now_ms: f64,
        cooldown_ms: f64,
    ) -> ViolationState {
        let key = (vehicle_id, violation_type);
        let entry = self.entries.entry(key).or_insert(CooldownEntry {
            state: ViolationState::Idle,
            reported_at_ms: f64::NEG_INFINITY,
            cooldown_ms,
            suppressed: 0,
        });
        entry.state = ViolationState::Detected;

        if now_ms - entry.reported_at_ms < entry.cooldown_ms {
            entry.state = ViolationState::Suppressed;
            entry.suppressed += 1;
            debug!(
                "Vehicle {} {}: suppressed by cooldown ({} so far)",
                vehicle_id,
                violation_type.as_str(),
                entry.suppressed
            );
        } else {
            entry.state = ViolationState::Reported;
            entry.reported_at_ms = now_ms;
            entry.cooldown_ms = cooldown_ms;
            entry.suppressed = 0;
        }
        entry.state
    }

    /// Undo a report that was vetoed downstream (e.g. plate dedup), so the
    /// pair is still treated as cooling down but not as "reported".
    pub fn mark_suppressed(&mut self, vehicle_id: u32, violation_type: ViolationType) {
        if let Some(e) = self.entries.get_mut(&(vehicle_id, violation_type)) {
            e.state = ViolationState::Suppressed;
        }
    }

    pub fn state(&self, vehicle_id: u32, violation_type: ViolationType, now_ms: f64) -> ViolationState {
        match self.entries.get(&(vehicle_id, violation_type)) {
            Some(e) if now_ms - e.reported_at_ms < e.cooldown_ms => e.state,
            _ => ViolationState::Idle,
        }
    }

    /// Reported time of the active window, if any.
    pub fn active_since(&self, vehicle_id: u32, violation_type: ViolationType, now_ms: f64) -> Option<f64> {
        self.entries
            .get(&(vehicle_id, violation_type))
            .filter(|e| now_ms - e.reported_at_ms < e.cooldown_ms)
            .map(|e| e.reported_at_ms)
    }

    /// Drop expired windows. Returns how many were removed.
    pub fn cleanup(&mut self, now_ms: f64) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, e| now_ms - e.reported_at_ms < e.cooldown_ms);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone)]
struct PlateEntry {
    camera_id: String,
    frame_id: u64,
}

/// Cross-pipeline plate-keyed dedup. Windows are counted in frames of the
/// camera that recorded the entry.
#[derive(Debug)]
pub struct PlateDedup {
    window_frames: u64,
    entries: Mutex<HashMap<(String, ViolationType), PlateEntry>>,
}

impl PlateDedup {
    pub fn new(window_frames: u64) -> Self {
        Self {
            window_frames,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// True if a violation for this plate may be reported now; records it if so.
    pub fn check_and_record(
        &self,
        plate: &str,
        violation_type: ViolationType,
        camera_id: &str,
        frame_id: u64,
    ) -> bool {
        let key = (normalize_plate(plate), violation_type);
        if key.0.is_empty() {
            return true;
        }
        let mut entries = self.entries.lock();
        if let Some(prev) = entries.get(&key) {
            if prev.camera_id == camera_id
                && frame_id >= prev.frame_id
                && frame_id - prev.frame_id <= self.window_frames
            {
                debug!(
                    "Plate {} {}: duplicate within {} frames",
                    key.0,
                    violation_type.as_str(),
                    self.window_frames
                );
                return false;
            }
        }
        entries.insert(
            key,
            PlateEntry {
                camera_id: camera_id.to_string(),
                frame_id,
            },
        );
        true
    }

    /// Whether a report for this plate is currently inside its window.
    pub fn is_active(&self, plate: &str, violation_type: ViolationType, camera_id: &str, frame_id: u64) -> bool {
        let key = (normalize_plate(plate), violation_type);
        self.entries.lock().get(&key).map_or(false, |prev| {
            prev.camera_id == camera_id
                && frame_id >= prev.frame_id
                && frame_id - prev.frame_id <= self.window_frames
        })
    }

    /// Drop a camera's entries older than the window.
    pub fn cleanup(&self, camera_id: &str, frame_id: u64) {
        let window = self.window_frames;
        self.entries.lock().retain(|_, e| {
            e.camera_id != camera_id || frame_id.saturating_sub(e.frame_id) <= window
        });
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cooldown_suppresses_then_expires() {
        let mut c = CooldownTracker::new();
        let t = ViolationType::Speeding;
        assert_eq!(c.observe(1, t, 0.0, 30_000.0), ViolationState::Reported);
        assert_eq!(c.observe(1, t, 10_000.0, 30_000.0), ViolationState::Suppressed);
        assert_eq!(c.state(1, t, 10_000.0), ViolationState::Suppressed);
        assert_eq!(c.observe(1, t, 30_001.0, 30_000.0), ViolationState::Reported);
    }

    #[test]
    fn test_cooldown_is_per_vehicle_and_type() {
        let mut c = CooldownTracker::new();
        assert_eq!(c.observe(1, ViolationType::Speeding, 0.0, 30_000.0), ViolationState::Reported);
        assert_eq!(c.observe(2, ViolationType::Speeding, 0.0, 30_000.0), ViolationState::Reported);
        assert_eq!(c.observe(1, ViolationType::Lane, 0.0, 15_000.0), ViolationState::Reported);
        assert_eq!(c.state(3, ViolationType::Lane, 0.0), ViolationState::Idle);
    }

    #[test]
    fn test_cleanup_removes_expired() {
        let mut c = CooldownTracker::new();
        c.observe(1, ViolationType::Lane, 0.0, 15_000.0);
        c.observe(2, ViolationType::WrongWay, 0.0, 60_000.0);
        assert_eq!(c.cleanup(20_000.0), 1);
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn test_plate_dedup_window() {
        let d = PlateDedup::new(90);
        assert!(d.check_and_record("ABC-123", ViolationType::Speeding, "cam1", 100));
        assert!(!d.check_and_record("abc 123", ViolationType::Speeding, "cam1", 150));
        assert!(d.check_and_record("ABC-123", ViolationType::Lane, "cam1", 150), "other type");
        assert!(d.check_and_record("ABC-123", ViolationType::Speeding, "cam1", 300), "window over");
        assert!(d.check_and_record("", ViolationType::Speeding, "cam1", 300), "no plate, no dedup");
    }

    #[test]
    fn test_plate_dedup_cleanup() {
        let d = PlateDedup::new(10);
        d.check_and_record("XYZ9", ViolationType::Speeding, "cam1", 0);
        d.check_and_record("XYZ9", ViolationType::Speeding, "cam2", 0);
        d.cleanup("cam1", 50);
        assert_eq!(d.len(), 1);
    }
}
