// src/tracking/vehicle_tracker.rs
//
// Multi-object vehicle tracker for fixed traffic cameras.
//
// Design:
//   - Association is pluggable (`Associator`); the default is greedy IoU
//     matching with a class-constrained centroid fallback
//   - Tracks coast through brief detection gaps (occlusion, glare)
//   - Only confirmed tracks are reported; each reported track feeds its
//     center into the Trajectory Store
//   - An association failure degrades to "no tracks this frame"

use super::trajectory::{TrajectoryConfig, TrajectoryPoint, TrajectoryStore};
use crate::error::DetectionError;
use crate::types::{bbox_area, bbox_center, Detection, Frame};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, info, warn};

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Minimum IoU to match a detection to an existing track
    pub min_iou: f32,
    /// Frames a track survives without a detection before deletion
    pub max_disappeared: u32,
    /// Consecutive hits required to promote Tentative → Confirmed
    pub min_hits_to_confirm: u32,
    /// Minimum detection confidence to accept
    pub min_confidence: f32,
    /// Class labels treated as vehicles
    pub vehicle_classes: Vec<String>,
    /// Maximum centroid distance (fraction of frame width) for fallback matching
    pub max_centroid_distance_ratio: f32,
    /// Frames since last hit beyond which centroid fallback no longer applies
    pub centroid_fallback_max_coast: u32,
    pub trajectory: TrajectoryConfig,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            min_iou: 0.3,
            max_disappeared: 30,
            min_hits_to_confirm: 3,
            min_confidence: 0.5,
            vehicle_classes: ["car", "truck", "bus", "motorcycle"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            max_centroid_distance_ratio: 0.08,
            centroid_fallback_max_coast: 10,
            trajectory: TrajectoryConfig::default(),
        }
    }
}

// ============================================================================
// TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackState {
    Tentative,
    Confirmed,
    Lost,
}

/// Internal track record. Associators read these; only the tracker mutates them.
#[derive(Debug, Clone)]
pub struct Track {
    pub id: u32,
    pub bbox: [f32; 4],
    pub state: TrackState,
    pub class_name: String,
    pub confidence: f32,
    pub consecutive_hits: u32,
    pub frames_since_hit: u32,
    pub total_hits: u32,
    pub first_seen_ms: f64,
    pub last_seen_ms: f64,
    /// Class locked at confirmation; later detections cannot relabel the track
    confirmed_class: Option<String>,
}

impl Track {
    fn new(id: u32, det: &Detection, timestamp_ms: f64) -> Self {
        Self {
            id,
            bbox: det.bbox,
            state: TrackState::Tentative,
            class_name: det.class_name.clone(),
            confidence: det.confidence,
            consecutive_hits: 1,
            frames_since_hit: 0,
            total_hits: 1,
            first_seen_ms: timestamp_ms,
            last_seen_ms: timestamp_ms,
            confirmed_class: None,
        }
    }

    pub fn center(&self) -> (f32, f32) {
        bbox_center(&self.bbox)
    }

    pub fn is_confirmed(&self) -> bool {
        self.state == TrackState::Confirmed
    }

    /// Class the track is pinned to for matching purposes.
    pub fn match_class(&self) -> &str {
        self.confirmed_class.as_deref().unwrap_or(&self.class_name)
    }

    fn update_with_detection(&mut self, det: &Detection, timestamp_ms: f64, min_hits: u32) {
        self.bbox = det.bbox;
        self.confidence = det.confidence;
        self.consecutive_hits += 1;
        self.total_hits += 1;
        self.frames_since_hit = 0;
        self.last_seen_ms = timestamp_ms;

        if self.confirmed_class.is_none() {
            self.class_name = det.class_name.clone();
        }

        match self.state {
            TrackState::Tentative if self.consecutive_hits >= min_hits => {
                self.state = TrackState::Confirmed;
                self.confirmed_class = Some(self.class_name.clone());
                debug!("Track {} confirmed as {}", self.id, self.class_name);
            }
            TrackState::Lost => {
                self.state = TrackState::Confirmed;
                self.consecutive_hits = 1;
            }
            _ => {}
        }
    }

    fn mark_missed(&mut self) {
        self.frames_since_hit += 1;
        self.consecutive_hits = 0;
        if self.state == TrackState::Confirmed && self.frames_since_hit > 5 {
            self.state = TrackState::Lost;
        }
    }
}

/// Public view of a confirmed track for one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedVehicle {
    pub track_id: u32,
    pub bbox: [f32; 4],
    pub center: (f32, f32),
    pub confidence: f32,
    pub class_name: String,
    pub consecutive_frames: u32,
    pub frame_count: u32,
    pub first_seen_ms: f64,
    pub last_seen_ms: f64,
}

impl TrackedVehicle {
    fn from_track(t: &Track) -> Self {
        Self {
            track_id: t.id,
            bbox: t.bbox,
            center: t.center(),
            confidence: t.confidence,
            class_name: t.class_name.clone(),
            consecutive_frames: t.consecutive_hits,
            frame_count: t.total_hits,
            first_seen_ms: t.first_seen_ms,
            last_seen_ms: t.last_seen_ms,
        }
    }

    pub fn bottom_y(&self) -> f32 {
        self.bbox[3]
    }

    pub fn width(&self) -> f32 {
        self.bbox[2] - self.bbox[0]
    }
}

// ============================================================================
// ASSOCIATION
// ============================================================================

/// Matches detections to existing tracks. Returns (track_index, detection_index)
/// pairs; every index may appear at most once.
pub trait Associator: Send {
    fn associate(
        &mut self,
        tracks: &[Track],
        detections: &[&Detection],
        frame_width: f32,
    ) -> Result<Vec<(usize, usize)>, DetectionError>;
}

/// Greedy IoU matching with a centroid-distance rescue for boxes that moved
/// too far between processed frames to overlap.
pub struct GreedyIouAssociator {
    pub min_iou: f32,
    pub max_centroid_distance_ratio: f32,
    pub centroid_fallback_max_coast: u32,
}

impl GreedyIouAssociator {
    pub fn from_config(cfg: &TrackerConfig) -> Self {
        Self {
            min_iou: cfg.min_iou,
            max_centroid_distance_ratio: cfg.max_centroid_distance_ratio,
            centroid_fallback_max_coast: cfg.centroid_fallback_max_coast,
        }
    }
}

impl Associator for GreedyIouAssociator {
    fn associate(
        &mut self,
        tracks: &[Track],
        detections: &[&Detection],
        frame_width: f32,
    ) -> Result<Vec<(usize, usize)>, DetectionError> {
        let mut track_used = vec![false; tracks.len()];
        let mut det_used = vec![false; detections.len()];
        let mut matches = Vec::new();

        // Phase 1: IoU
        let mut iou_pairs: Vec<(usize, usize, f32)> = Vec::new();
        for (ti, track) in tracks.iter().enumerate() {
            for (di, det) in detections.iter().enumerate() {
                let score = iou(&track.bbox, &det.bbox);
                if score >= self.min_iou {
                    iou_pairs.push((ti, di, score));
                }
            }
        }
        iou_pairs.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));
        for (ti, di, _) in iou_pairs {
            if track_used[ti] || det_used[di] {
                continue;
            }
            track_used[ti] = true;
            det_used[di] = true;
            matches.push((ti, di));
        }

        // Phase 2: centroid fallback, same class only
        let max_dist = frame_width * self.max_centroid_distance_ratio;
        let max_dist_sq = max_dist * max_dist;
        let mut centroid_pairs: Vec<(usize, usize, f32)> = Vec::new();
        for (ti, track) in tracks.iter().enumerate() {
            if track_used[ti] || track.frames_since_hit > self.centroid_fallback_max_coast {
                continue;
            }
            let (tcx, tcy) = track.center();
            for (di, det) in detections.iter().enumerate() {
                if det_used[di] || det.class_name != track.match_class() {
                    continue;
                }
                let (dcx, dcy) = det.center();
                let dist_sq = (tcx - dcx).powi(2) + (tcy - dcy).powi(2);
                if dist_sq < max_dist_sq {
                    centroid_pairs.push((ti, di, dist_sq));
                }
            }
        }
        centroid_pairs.sort_by(|a, b| a.2.partial_cmp(&b.2).unwrap_or(std::cmp::Ordering::Equal));
        for (ti, di, dist_sq) in centroid_pairs {
            if track_used[ti] || det_used[di] {
                continue;
            }
            track_used[ti] = true;
            det_used[di] = true;
            debug!(
                "Centroid rescue: track {} <-> det {} ({:.0}px)",
                tracks[ti].id,
                di,
                dist_sq.sqrt()
            );
            matches.push((ti, di));
        }

        Ok(matches)
    }
}

pub fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let x1 = a[0].max(b[0]);
    let y1 = a[1].max(b[1]);
    let x2 = a[2].min(b[2]);
    let y2 = a[3].min(b[3]);

    let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = bbox_area(a) + bbox_area(b) - inter;

    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}

// ============================================================================
// MAIN TRACKER
// ============================================================================

#[derive(Debug, Clone, Default, Serialize)]
pub struct TrackerStats {
    pub frames_processed: u64,
    pub active_tracks: usize,
    pub confirmed_tracks: usize,
    pub total_tracks_created: u64,
    pub association_failures: u64,
    pub avg_update_us: f64,
}

pub struct VehicleTracker {
    pub config: TrackerConfig,
    associator: Box<dyn Associator>,
    tracks: Vec<Track>,
    trajectories: TrajectoryStore,
    next_id: u32,
    stats: TrackerStats,
    total_update_us: u64,
}

impl VehicleTracker {
    pub fn new(config: TrackerConfig) -> Self {
        let associator = Box::new(GreedyIouAssociator::from_config(&config));
        Self::with_associator(config, associator)
    }

    pub fn with_associator(config: TrackerConfig, associator: Box<dyn Associator>) -> Self {
        let trajectories = TrajectoryStore::new(config.trajectory.clone());
        Self {
            config,
            associator,
            tracks: Vec::with_capacity(32),
            trajectories,
            next_id: 1,
            stats: TrackerStats::default(),
            total_update_us: 0,
        }
    }

    /// Process one frame of detections. Returns the confirmed tracks that were
    /// matched on this frame.
    pub fn update(&mut self, detections: &[Detection], frame: &Frame) -> Vec<TrackedVehicle> {
        let started = Instant::now();
        let timestamp_ms = frame.timestamp_ms;

        let valid: Vec<&Detection> = detections
            .iter()
            .filter(|d| {
                d.is_well_formed()
                    && d.confidence >= self.config.min_confidence
                    && self.config.vehicle_classes.iter().any(|c| c == &d.class_name)
            })
            .collect();

        let matches = match self
            .associator
            .associate(&self.tracks, &valid, frame.width as f32)
        {
            Ok(m) => m,
            Err(e) => {
                warn!("Association failed on frame {}: {}", frame.frame_id, e);
                self.stats.association_failures += 1;
                return Vec::new();
            }
        };

        let mut matched_tracks = vec![false; self.tracks.len()];
        let mut matched_dets = vec![false; valid.len()];
        let min_hits = self.config.min_hits_to_confirm;
        for (ti, di) in matches {
            // Associators are external code; ignore out-of-range or repeated indices
            if ti >= self.tracks.len() || di >= valid.len() || matched_tracks[ti] || matched_dets[di]
            {
                continue;
            }
            matched_tracks[ti] = true;
            matched_dets[di] = true;
            self.tracks[ti].update_with_detection(valid[di], timestamp_ms, min_hits);
        }

        for (ti, matched) in matched_tracks.iter().enumerate() {
            if !matched {
                self.tracks[ti].mark_missed();
            }
        }

        for (di, matched) in matched_dets.iter().enumerate() {
            if !matched {
                let mut track = Track::new(self.next_id, valid[di], timestamp_ms);
                if min_hits <= 1 {
                    track.state = TrackState::Confirmed;
                    track.confirmed_class = Some(track.class_name.clone());
                }
                debug!(
                    "New track T{} ({}) bbox=[{:.0},{:.0},{:.0},{:.0}]",
                    self.next_id,
                    track.class_name,
                    track.bbox[0],
                    track.bbox[1],
                    track.bbox[2],
                    track.bbox[3]
                );
                self.next_id += 1;
                self.stats.total_tracks_created += 1;
                self.tracks.push(track);
            }
        }

        // Prune dead tracks
        let max_disappeared = self.config.max_disappeared;
        let trajectories = &mut self.trajectories;
        self.tracks.retain(|t| {
            if t.frames_since_hit > max_disappeared {
                debug!("Track {} pruned (missed {} frames)", t.id, t.frames_since_hit);
                trajectories.remove(t.id);
                return false;
            }
            true
        });
        self.trajectories.prune_stale(timestamp_ms);

        // Report confirmed, currently-visible tracks
        let mut reported = Vec::new();
        for track in &self.tracks {
            if track.is_confirmed() && track.frames_since_hit == 0 {
                let (cx, cy) = track.center();
                self.trajectories.append(
                    track.id,
                    TrajectoryPoint::new(cx, cy, timestamp_ms, frame.frame_id),
                );
                reported.push(TrackedVehicle::from_track(track));
            }
        }

        let elapsed_us = started.elapsed().as_micros() as u64;
        self.total_update_us += elapsed_us;
        self.stats.frames_processed += 1;
        if self.stats.frames_processed % 100 == 0 {
            info!(
                "Tracking: {} frames, {} active tracks, {:.0}us avg update",
                self.stats.frames_processed,
                self.tracks.len(),
                self.total_update_us as f64 / self.stats.frames_processed as f64
            );
        }

        reported
    }

    pub fn trajectories(&self) -> &TrajectoryStore {
        &self.trajectories
    }

    pub fn all_tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn is_active(&self, track_id: u32) -> bool {
        self.tracks.iter().any(|t| t.id == track_id)
    }

    pub fn active_track_ids(&self) -> Vec<u32> {
        self.tracks.iter().map(|t| t.id).collect()
    }

    pub fn stats(&self) -> TrackerStats {
        let mut stats = self.stats.clone();
        stats.active_tracks = self.tracks.len();
        stats.confirmed_tracks = self.tracks.iter().filter(|t| t.is_confirmed()).count();
        stats.avg_update_us = if stats.frames_processed > 0 {
            self.total_update_us as f64 / stats.frames_processed as f64
        } else {
            0.0
        };
        stats
    }

    pub fn reset(&mut self) {
        self.tracks.clear();
        self.trajectories = TrajectoryStore::new(self.config.trajectory.clone());
        self.next_id = 1;
    }
}

// ============================================================================
// TESTS
// ============================================================================
