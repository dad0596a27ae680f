// src/config.rs
//
// YAML application config. Every section defaults, so a partial (or empty)
// file is valid.

use crate::error::CalibrationError;
use crate::lanes::{LaneCheckConfig, LaneConfig};
use crate::notification::NotificationConfig;
use crate::pipeline::{AnalysisSettings, ManagerSettings, PipelineConfig, StreamConfig};
use crate::speed::{CalibrationPoint, CalibrationZone, CameraCalibrator, SpeedConfig};
use crate::storage::StorageConfig;
use crate::tracking::TrackerConfig;
use crate::violations::ViolationsConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive, overridden by RUST_LOG
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "traffic_violation=info".into(),
        }
    }
}

/// Camera calibration as configured: a saved calibrator file, inline
/// points and zones, or the highway preset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// JSON written by `CameraCalibrator::save`; takes precedence
    pub file: Option<PathBuf>,
    pub points: Vec<CalibrationPoint>,
    pub zones: Vec<CalibrationZone>,
    /// `[width, height]`: use the highway preset when nothing else is set
    pub highway_preset: Option<[u32; 2]>,
}

impl CalibrationConfig {
    pub fn build(&self) -> Result<CameraCalibrator, CalibrationError> {
        if let Some(file) = &self.file {
            return CameraCalibrator::load(file);
        }
        if self.points.is_empty() && self.zones.is_empty() {
            if let Some([w, h]) = self.highway_preset {
                return CameraCalibrator::default_highway(w as f64, h as f64);
            }
        }
        let mut calibrator = CameraCalibrator::new();
        for point in &self.points {
            calibrator.add_calibration_point(point.clone())?;
        }
        for zone in &self.zones {
            calibrator.add_zone(zone.clone())?;
        }
        Ok(calibrator)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub tracker: TrackerConfig,
    pub speed: SpeedConfig,
    pub calibration: CalibrationConfig,
    pub lanes: LaneConfig,
    pub lane_check: LaneCheckConfig,
    pub violations: ViolationsConfig,
    pub notifications: NotificationConfig,
    pub storage: StorageConfig,
    pub pipeline: PipelineConfig,
    pub streams: Vec<StreamConfig>,
    pub max_concurrent_streams: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            logging: LoggingConfig::default(),
            tracker: TrackerConfig::default(),
            speed: SpeedConfig::default(),
            calibration: CalibrationConfig::default(),
            lanes: LaneConfig::default(),
            lane_check: LaneCheckConfig::default(),
            violations: ViolationsConfig::default(),
            notifications: NotificationConfig::default(),
            storage: StorageConfig::default(),
            pipeline: PipelineConfig::default(),
            streams: Vec::new(),
            max_concurrent_streams: 16,
        }
    }
}

impl AppConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_yaml(&contents).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: AppConfig = serde_yaml::from_str(contents)?;
        Ok(config)
    }

    pub fn analysis(&self) -> AnalysisSettings {
        AnalysisSettings {
            tracker: self.tracker.clone(),
            speed: self.speed.clone(),
            lanes: self.lanes.clone(),
            lane_check: self.lane_check.clone(),
            violations: self.violations.clone(),
        }
    }

    pub fn manager_settings(&self) -> ManagerSettings {
        ManagerSettings {
            max_concurrent: self.max_concurrent_streams.max(1),
            pipeline: self.pipeline.clone(),
            analysis: self.analysis(),
            calibration: self.calibration.clone(),
            ..Default::default()
        }
    }
}
