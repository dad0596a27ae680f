// src/lib.rs
//
// Real-time traffic violation analysis: per-camera tracking, speed and lane
// checks, a rule engine with deduplication, alert fan-out and evidence
// storage, orchestrated one pipeline per stream.

pub mod capabilities;
pub mod config;
pub mod error;
pub mod lanes;
pub mod notification;
pub mod pipeline;
pub mod speed;
pub mod storage;
pub mod tracking;
pub mod types;
pub mod violations;

pub use config::AppConfig;
pub use error::{
    CalibrationError, DetectionError, NotifyError, StorageError, StreamError, ValidationError,
};
