// src/violations/engine.rs
//
// Violation Detection Engine: runs every enabled detector on a frame and
// turns surviving candidates into TrafficViolation records.
//
// Order per candidate: rule scoping → confidence floor → validation →
// per-track cooldown → plate dedup. Validation runs before the cooldown so
// a rejected record never opens a suppression window.

use super::cooldown::{CooldownTracker, PlateDedup, ViolationState};
use super::detectors::{default_detectors, DetectionContext, ViolationDetector};
use super::rules::{RuleSet, ViolationRule};
use super::types::{TrafficViolation, ViolationCandidate, ViolationLocation, ViolationType};
use crate::lanes::LaneCheckConfig;
use crate::speed::SpeedConfig;
use crate::tracking::TrackedVehicle;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ViolationsConfig {
    /// Overrides layered on top of the built-in rule defaults
    pub rules: Vec<ViolationRule>,
    /// Frames during which the same plate+type is reported once per camera
    pub plate_window_frames: u64,
    /// Candidates below this confidence are dropped (rules may override
    /// with a `min_confidence` parameter)
    pub min_confidence: f32,
    /// Consecutive frames at which tracking quality saturates
    pub tracking_quality_frames: u32,
}

impl Default for ViolationsConfig {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            plate_window_frames: 90,
            min_confidence: 0.0,
            tracking_quality_frames: 10,
        }
    }
}

// ============================================================================
// TYPES
// ============================================================================

/// A plate that arrived after its violation was emitted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlateUpdate {
    pub violation_id: String,
    pub plate: String,
    pub confidence: f32,
}

#[derive(Debug, Clone)]
struct PendingPlate {
    violation_id: String,
    violation_type: ViolationType,
    reported_at_ms: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineStats {
    pub total_violations: u64,
    pub by_type: BTreeMap<String, u64>,
    pub by_severity: BTreeMap<String, u64>,
    pub suppressed_cooldown: u64,
    pub suppressed_plate: u64,
    pub rejected_validation: u64,
    pub rejected_low_confidence: u64,
    pub false_positives: u64,
    pub late_plates_attached: u64,
    /// Late plates that matched an already reported violation
    pub late_plate_duplicates: u64,
}

// ============================================================================
// ENGINE
// ============================================================================

pub struct ViolationEngine {
    camera_id: String,
    config: ViolationsConfig,
    rules: RuleSet,
    detectors: Vec<Box<dyn ViolationDetector>>,
    cooldowns: CooldownTracker,
    plates: Arc<PlateDedup>,
    vehicle_plates: HashMap<u32, (String, f32)>,
    pending_plates: HashMap<u32, Vec<PendingPlate>>,
    stats: EngineStats,
}

impl ViolationEngine {
    /// Engine with the built-in detectors. `plates` is shared across every
    /// pipeline; everything else is owned by this camera.
    pub fn new(
        camera_id: &str,
        config: ViolationsConfig,
        speed: SpeedConfig,
        lane: LaneCheckConfig,
        plates: Arc<PlateDedup>,
    ) -> Self {
        let rules = RuleSet::from_rules(&config.rules);
        let enabled: Vec<&str> = ViolationType::all()
            .into_iter()
            .filter(|t| rules.is_enabled(*t))
            .map(|t| t.as_str())
            .collect();
        info!("[{}] Violation engine rules enabled: {:?}", camera_id, enabled);

        Self {
            camera_id: camera_id.to_string(),
            config,
            rules,
            detectors: default_detectors(speed, lane),
            cooldowns: CooldownTracker::new(),
            plates,
            vehicle_plates: HashMap::new(),
            pending_plates: HashMap::new(),
            stats: EngineStats::default(),
        }
    }

    /// Add a detector, replacing any existing one for the same type.
    pub fn register_detector(&mut self, detector: Box<dyn ViolationDetector>) {
        let t = detector.violation_type();
        self.detectors.retain(|d| d.violation_type() != t);
        self.detectors.push(detector);
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    /// Run every enabled detector and emit what survives dedup.
    pub fn process_frame(&mut self, ctx: &DetectionContext<'_>) -> Vec<TrafficViolation> {
        let mut candidates: Vec<(ViolationCandidate, ViolationRule)> = Vec::new();
        for detector in self.detectors.iter_mut() {
            let t = detector.violation_type();
            let Some(rule) = self.rules.get(t).filter(|r| r.enabled) else {
                continue;
            };
            for c in detector.detect(ctx, rule) {
                candidates.push((c, rule.clone()));
            }
        }

        let mut out = Vec::new();
        for (candidate, rule) in candidates {
            if let Some(v) = self.adjudicate(candidate, &rule, ctx) {
                out.push(v);
            }
        }
        out
    }

    fn adjudicate(
        &mut self,
        c: ViolationCandidate,
        rule: &ViolationRule,
        ctx: &DetectionContext<'_>,
    ) -> Option<TrafficViolation> {
        let vehicle = ctx.vehicles.iter().find(|v| v.track_id == c.vehicle_id)?;
        if !rule.applies_to_zone(c.zone_id.as_deref()) || !rule.applies_to_class(&vehicle.class_name) {
            return None;
        }
        let floor = rule.param("min_confidence", self.config.min_confidence as f64) as f32;
        if c.confidence < floor {
            self.stats.rejected_low_confidence += 1;
            return None;
        }

        let violation = self.build(c, vehicle, ctx);
        if let Err(e) = violation.validate() {
            warn!(
                "[{}] Rejected {} for vehicle {}: {}",
                self.camera_id,
                violation.violation_type.as_str(),
                violation.vehicle_id,
                e
            );
            self.stats.rejected_validation += 1;
            return None;
        }

        let t = violation.violation_type;
        let vid = violation.vehicle_id;
        if self.cooldowns.observe(vid, t, ctx.timestamp_ms, rule.cooldown_ms()) == ViolationState::Suppressed {
            self.stats.suppressed_cooldown += 1;
            return None;
        }

        if let Some(plate) = &violation.license_plate {
            if !self
                .plates
                .check_and_record(plate, t, &self.camera_id, ctx.frame_id)
            {
                self.cooldowns.mark_suppressed(vid, t);
                self.stats.suppressed_plate += 1;
                return None;
            }
        } else {
            self.pending_plates.entry(vid).or_default().push(PendingPlate {
                violation_id: violation.violation_id.clone(),
                violation_type: t,
                reported_at_ms: ctx.timestamp_ms,
            });
        }

        self.stats.total_violations += 1;
        *self.stats.by_type.entry(t.as_str().to_string()).or_insert(0) += 1;
        *self
            .stats
            .by_severity
            .entry(violation.severity.as_str().to_string())
            .or_insert(0) += 1;

        info!(
            "[{}] {} violation: vehicle {} ({}) severity={} conf={:.2}",
            self.camera_id,
            t.as_str(),
            vid,
            violation.license_plate.as_deref().unwrap_or("no plate"),
            violation.severity.as_str(),
            violation.confidence
        );
        Some(violation)
    }

    fn build(&self, c: ViolationCandidate, v: &TrackedVehicle, ctx: &DetectionContext<'_>) -> TrafficViolation {
        let plate = self.vehicle_plates.get(&v.track_id);
        let quality_frames = self.config.tracking_quality_frames.max(1) as f32;
        TrafficViolation {
            violation_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            frame_id: ctx.frame_id,
            frame_timestamp_ms: ctx.timestamp_ms,
            violation_type: c.violation_type,
            severity: c.severity,
            vehicle_id: c.vehicle_id,
            description: c.description,
            confidence: c.confidence,
            location: ViolationLocation {
                zone_id: c.zone_id,
                zone_name: c.zone_name,
                coordinates: v.center,
            },
            details: c.details,
            bbox: v.bbox,
            vehicle_class: v.class_name.clone(),
            license_plate: plate.map(|(p, _)| p.clone()),
            plate_confidence: plate.map(|(_, c)| *c),
            detection_confidence: v.confidence,
            tracking_quality: (v.consecutive_frames as f32 / quality_frames).min(1.0),
            camera_id: self.camera_id.clone(),
            evidence: Vec::new(),
            reviewed: false,
            false_positive: false,
        }
    }

    /// Plate text for a track, typically from the OCR pool. Returns updates
    /// for this track's plate-less violations still inside their cooldown
    /// window; older ones keep an empty plate.
    pub fn attach_plate(
        &mut self,
        vehicle_id: u32,
        plate: &str,
        confidence: f32,
        now_ms: f64,
        frame_id: u64,
    ) -> Vec<PlateUpdate> {
        let plate = plate.trim();
        if plate.is_empty() {
            return Vec::new();
        }
        self.vehicle_plates
            .insert(vehicle_id, (plate.to_string(), confidence));

        let Some(pending) = self.pending_plates.remove(&vehicle_id) else {
            return Vec::new();
        };
        let mut updates = Vec::new();
        for p in pending {
            let active = self
                .cooldowns
                .active_since(vehicle_id, p.violation_type, now_ms)
                .map_or(false, |since| since == p.reported_at_ms);
            if !active {
                debug!(
                    "[{}] Plate for vehicle {} arrived after the {} window closed",
                    self.camera_id,
                    vehicle_id,
                    p.violation_type.as_str()
                );
                continue;
            }
            if !self
                .plates
                .check_and_record(plate, p.violation_type, &self.camera_id, frame_id)
            {
                debug!(
                    "[{}] Violation {} duplicates an earlier {} report for plate {}",
                    self.camera_id,
                    p.violation_id,
                    p.violation_type.as_str(),
                    plate
                );
                self.stats.late_plate_duplicates += 1;
            }
            updates.push(PlateUpdate {
                violation_id: p.violation_id,
                plate: plate.to_string(),
                confidence,
            });
        }
        self.stats.late_plates_attached += updates.len() as u64;
        updates
    }

    pub fn plate_for(&self, vehicle_id: u32) -> Option<&str> {
        self.vehicle_plates.get(&vehicle_id).map(|(p, _)| p.as_str())
    }

    pub fn record_false_positive(&mut self) {
        self.stats.false_positives += 1;
    }

    /// Expire cooldown windows and forget state for tracks no longer active.
    pub fn cleanup(&mut self, now_ms: f64, frame_id: u64, active: &[u32]) {
        let expired = self.cooldowns.cleanup(now_ms);
        self.vehicle_plates.retain(|id, _| active.contains(id));
        let cooldowns = &self.cooldowns;
        self.pending_plates.retain(|id, list| {
            list.retain(|p| cooldowns.active_since(*id, p.violation_type, now_ms).is_some());
            !list.is_empty()
        });
        self.plates.cleanup(&self.camera_id, frame_id);
        if expired > 0 {
            debug!("[{}] Expired {} cooldown windows", self.camera_id, expired);
        }
    }

    pub fn stats(&self) -> EngineStats {
        self.stats.clone()
    }
}

// ============================================================================
// TESTS
// ============================================================================
