// src/pipeline/replay.rs
//
// Recorded detections as a frame source. A recording is JSON lines, one
// frame per line:
//
//   {"frame_id":0,"timestamp_ms":0.0,"width":1920,"height":1080,
//    "detections":[{"bbox":[x1,y1,x2,y2],"confidence":0.9,"class_name":"car"}],
//    "plates":[{"bbox":[x1,y1,x2,y2],"text":"ABC123","confidence":0.8}]}
//
// Replayed frames carry no pixels; their payload is the recorded plate
// reads, which `ReplayPlateReader` answers OCR requests from.

use super::frame_context::FrameInput;
use super::frame_source::FrameSource;
use super::stream_pipeline::StreamConfig;
use crate::capabilities::{PlateRead, PlateReader};
use crate::error::{DetectionError, StreamError};
use crate::tracking::iou;
use crate::types::{Detection, Frame};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, info};

pub const REPLAY_SCHEME: &str = "replay://";

/// Minimum overlap between a vehicle box and a recorded plate box.
const PLATE_MIN_IOU: f32 = 0.3;

#[derive(Debug, Clone, Deserialize)]
struct RecordedDetection {
    bbox: [f32; 4],
    confidence: f32,
    #[serde(default = "default_class")]
    class_name: String,
}

fn default_class() -> String {
    "car".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordedPlate {
    pub bbox: [f32; 4],
    pub text: String,
    pub confidence: f32,
}

#[derive(Debug, Clone, Deserialize)]
struct RecordedFrame {
    frame_id: u64,
    timestamp_ms: f64,
    #[serde(default = "default_width")]
    width: u32,
    #[serde(default = "default_height")]
    height: u32,
    #[serde(default)]
    detections: Vec<RecordedDetection>,
    #[serde(default)]
    plates: Vec<RecordedPlate>,
}

fn default_width() -> u32 {
    1920
}

fn default_height() -> u32 {
    1080
}

pub struct ReplaySource {
    path: PathBuf,
    reader: Option<BufReader<File>>,
    /// Lines consumed so far; a reopen resumes after them
    lines_read: u64,
    /// Sleep between frames to follow the recorded timestamps
    realtime: bool,
    last_ts: Option<(f64, Instant)>,
}

impl ReplaySource {
    pub fn new(path: impl Into<PathBuf>, realtime: bool) -> Self {
        Self {
            path: path.into(),
            reader: None,
            lines_read: 0,
            realtime,
            last_ts: None,
        }
    }

    /// Parse `replay://path[?realtime]`.
    pub fn from_locator(locator: &str) -> Option<Self> {
        let rest = locator.strip_prefix(REPLAY_SCHEME)?;
        let (path, realtime) = match rest.strip_suffix("?realtime") {
            Some(p) => (p, true),
            None => (rest, false),
        };
        if path.is_empty() {
            return None;
        }
        Some(Self::new(path, realtime))
    }

    fn pace(&mut self, timestamp_ms: f64) {
        if !self.realtime {
            return;
        }
        if let Some((prev_ms, at)) = self.last_ts {
            let gap = Duration::from_secs_f64(((timestamp_ms - prev_ms) / 1000.0).clamp(0.0, 1.0));
            if let Some(wait) = gap.checked_sub(at.elapsed()) {
                std::thread::sleep(wait);
            }
        }
        self.last_ts = Some((timestamp_ms, Instant::now()));
    }
}

impl FrameSource for ReplaySource {
    fn describe(&self) -> String {
        format!("replay {}", self.path.display())
    }

    fn open(&mut self, _timeout: Duration) -> Result<(), StreamError> {
        let file = File::open(&self.path)
            .map_err(|e| StreamError::Open(self.path.display().to_string(), e.to_string()))?;
        let mut reader = BufReader::new(file);
        let mut skipped = 0;
        let mut line = String::new();
        while skipped < self.lines_read {
            line.clear();
            let n = reader
                .read_line(&mut line)
                .map_err(|e| StreamError::Open(self.path.display().to_string(), e.to_string()))?;
            if n == 0 {
                break;
            }
            skipped += 1;
        }
        if skipped > 0 {
            debug!("{}: resumed after {} lines", self.describe(), skipped);
        } else {
            info!("Replaying {}", self.path.display());
        }
        self.reader = Some(reader);
        Ok(())
    }

    fn read(&mut self) -> Result<Option<FrameInput>, StreamError> {
        let Some(reader) = self.reader.as_mut() else {
            return Err(StreamError::Read("replay source not open".into()));
        };
        let mut line = String::new();
        loop {
            line.clear();
            let n = reader
                .read_line(&mut line)
                .map_err(|e| StreamError::Read(e.to_string()))?;
            if n == 0 {
                return Ok(None);
            }
            self.lines_read += 1;
            if !line.trim().is_empty() {
                break;
            }
        }

        let record: RecordedFrame = serde_json::from_str(line.trim())
            .map_err(|e| StreamError::Read(format!("line {}: {}", self.lines_read, e)))?;
        self.pace(record.timestamp_ms);

        let payload = if record.plates.is_empty() {
            Vec::new()
        } else {
            serde_json::to_vec(&record.plates).map_err(|e| StreamError::Read(e.to_string()))?
        };
        let detections = record
            .detections
            .into_iter()
            .map(|d| Detection::new(d.bbox, d.confidence, &d.class_name))
            .collect();
        Ok(Some(FrameInput::with_detections(
            Frame::new(
                record.frame_id,
                record.timestamp_ms,
                record.width,
                record.height,
                payload,
            ),
            detections,
        )))
    }

    fn close(&mut self) {
        self.reader = None;
    }
}

/// Answers plate reads from the plates recorded with each replayed frame.
#[derive(Debug, Default)]
pub struct ReplayPlateReader;

impl PlateReader for ReplayPlateReader {
    fn read_plate(&self, frame: &Frame, bbox: [f32; 4]) -> Result<Option<PlateRead>, DetectionError> {
        if frame.data.is_empty() {
            return Ok(None);
        }
        let plates: Vec<RecordedPlate> = serde_json::from_slice(&frame.data)
            .map_err(|e| DetectionError::Inference(format!("frame {}: {}", frame.frame_id, e)))?;
        let best = plates
            .into_iter()
            .map(|p| (iou(&p.bbox, &bbox), p))
            .filter(|(score, _)| *score >= PLATE_MIN_IOU)
            .max_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        Ok(best.map(|(_, p)| PlateRead {
            text: p.text,
            confidence: p.confidence,
        }))
    }
}

/// Source for a stream locator. Only recordings are supported here; live
/// capture is provided by the embedding application.
pub fn open_source(config: &StreamConfig) -> Result<Box<dyn FrameSource>, StreamError> {
    match ReplaySource::from_locator(&config.source) {
        Some(source) => Ok(Box::new(source)),
        None => Err(StreamError::Open(
            config.source.clone(),
            "unsupported source locator".into(),
        )),
    }
}
