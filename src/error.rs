// src/error.rs
//
// Domain error types. Orchestration and binary code wraps these in anyhow.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CalibrationError {
    #[error("need at least 4 point correspondences, got {0}")]
    InsufficientPoints(usize),
    #[error("point correspondences are degenerate (collinear or duplicated)")]
    Degenerate,
    #[error("re-projection error {0:.3}m exceeds the acceptance threshold")]
    ErrorTooHigh(f64),
    #[error("camera is not calibrated")]
    NotCalibrated,
    #[error("zone '{0}' is malformed: {1}")]
    InvalidZone(String, String),
    #[error("calibration file error: {0}")]
    Io(#[from] std::io::Error),
    #[error("calibration file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Reasons a violation record is refused before it reaches storage.
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("bounding box is malformed")]
    InvalidBbox,
    #[error("confidence {0} outside [0, 1]")]
    ConfidenceOutOfRange(f32),
    #[error("speed {0:.1} km/h outside the accepted range")]
    SpeedOutOfRange(f64),
    #[error("violation carries no camera id")]
    MissingCamera,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("database error: {0}")]
    Database(String),
    #[error("checksum mismatch for {id}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        id: String,
        expected: String,
        actual: String,
    },
    #[error("object '{0}' not found")]
    NotFound(String),
    #[error("all storage tiers failed for {0}")]
    AllTiersFailed(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("storage operation timed out")]
    Timeout,
    #[error("invalid record: {0}")]
    Invalid(#[from] ValidationError),
}

impl From<anyhow::Error> for StorageError {
    fn from(err: anyhow::Error) -> Self {
        StorageError::Database(format!("{err:#}"))
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("channel '{0}' rate limit exceeded")]
    RateLimited(String),
    #[error("delivery failed: {0}")]
    Delivery(String),
    #[error("delivery timed out after {0} ms")]
    Timeout(u64),
}

impl From<reqwest::Error> for NotifyError {
    fn from(err: reqwest::Error) -> Self {
        NotifyError::Delivery(err.to_string())
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum StreamError {
    #[error("failed to open source '{0}': {1}")]
    Open(String, String),
    #[error("frame read failed: {0}")]
    Read(String),
    #[error("stream '{0}' not found")]
    NotFound(String),
    #[error("stream '{0}' already exists")]
    AlreadyExists(String),
    #[error("concurrent stream limit ({0}) reached")]
    CapacityReached(usize),
    #[error("reconnect attempts exhausted after {0} tries")]
    ReconnectExhausted(u32),
}

/// Failure inside an external detection capability.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DetectionError {
    #[error("model unavailable: {0}")]
    Unavailable(String),
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("association failed: {0}")]
    Association(String),
}
