// src/pipeline/stream_pipeline.rs
//
// One camera, one pipeline.
//
// Design:
//   - Capture runs on its own thread (`frame_source`) behind a small
//     bounded channel; the analysis chain runs on the pipeline task
//   - Tracker, lane geometry, calibrator and violation engine are owned
//     here; only storage, notification, the OCR pool and the plate dedup
//     map are shared
//   - Plates arrive out-of-band from the OCR pool and are merged through
//     the engine, which decides whether the cooldown window is still open
//   - Storage and alerts go through a per-stream output worker so a slow
//     database or webhook never stalls the frame loop; the worker keeps
//     record/plate-update order

use super::event_bus::{PipelineEvent, SharedEventBus};
use super::frame_context::{FrameInput, FrameResult};
use super::frame_scheduler::{FrameScheduler, SchedulerStats};
use super::frame_source::{spawn_capture, CaptureEvent, CaptureSettings, FrameSource};
use super::metrics::StreamMetrics;
use super::ocr_pool::{OcrJob, OcrPool, OcrPoolConfig, OcrResult};
use crate::capabilities::{Detector, LanePrimitiveSource};
use crate::config::CalibrationConfig;
use crate::lanes::{LaneCheckConfig, LaneConfig, LaneDetector, LaneGeometry};
use crate::notification::NotificationSystem;
use crate::speed::{CameraCalibrator, SpeedConfig};
use crate::storage::{DataType, ViolationManager};
use crate::tracking::{TrackedVehicle, TrackerConfig, TrackerStats, VehicleTracker};
use crate::types::{Detection, Frame};
use crate::violations::{
    DetectionContext, EngineStats, PlateDedup, PlateUpdate, TrafficViolation, ViolationEngine,
    ViolationsConfig,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub stream_id: String,
    /// Source locator, e.g. `replay://recordings/cam1.jsonl`
    pub source: String,
    /// Defaults to the stream id
    pub camera_id: Option<String>,
    /// Started by `start_all`
    pub enabled: bool,
    pub reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
    pub connection_timeout_ms: u64,
    /// Capture buffer between acquisition and analysis
    pub buffer_size: usize,
    pub drop_frames_on_delay: bool,
    pub target_fps: f64,
    /// Per-camera calibration; the application-wide one is used when absent
    pub calibration: Option<CalibrationConfig>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            stream_id: String::new(),
            source: String::new(),
            camera_id: None,
            enabled: true,
            reconnect_attempts: 5,
            reconnect_delay_ms: 2000,
            connection_timeout_ms: 10_000,
            buffer_size: 10,
            drop_frames_on_delay: true,
            target_fps: 30.0,
            calibration: None,
        }
    }
}

impl StreamConfig {
    pub fn new(stream_id: &str, source: &str) -> Self {
        Self {
            stream_id: stream_id.to_string(),
            source: source.to_string(),
            ..Default::default()
        }
    }

    pub fn camera_id(&self) -> &str {
        self.camera_id.as_deref().unwrap_or(&self.stream_id)
    }

    pub fn capture_settings(&self) -> CaptureSettings {
        CaptureSettings {
            reconnect_attempts: self.reconnect_attempts,
            reconnect_delay: Duration::from_millis(self.reconnect_delay_ms),
            connection_timeout: Duration::from_millis(self.connection_timeout_ms),
            drop_frames_on_delay: self.drop_frames_on_delay,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Passed to the detector capability
    pub detection_confidence: f32,
    pub frame_skipping: bool,
    pub ocr: OcrPoolConfig,
    /// Log a metrics line every N processed frames (0 disables)
    pub log_metrics_interval: u64,
    /// How long a stop waits for capture and in-flight output
    pub grace_period_ms: u64,
    /// Pending storage/alert operations per stream
    pub output_queue: usize,
    /// Engine cleanup cadence in analysed frames
    pub cleanup_interval_frames: u64,
    /// Store each violation's JSON as evidence
    pub store_violation_json: bool,
    /// Frames before the same vehicle may be sent to OCR again
    pub ocr_retry_frames: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            detection_confidence: 0.5,
            frame_skipping: true,
            ocr: OcrPoolConfig::default(),
            log_metrics_interval: 100,
            grace_period_ms: 2000,
            output_queue: 256,
            cleanup_interval_frames: 30,
            store_violation_json: true,
            ocr_retry_frames: 30,
        }
    }
}

/// Per-camera analysis settings, shared by every stream unless overridden.
#[derive(Debug, Clone, Default)]
pub struct AnalysisSettings {
    pub tracker: TrackerConfig,
    pub speed: SpeedConfig,
    pub lanes: LaneConfig,
    pub lane_check: LaneCheckConfig,
    pub violations: ViolationsConfig,
}

/// External detection capabilities. Any of them may be absent.
#[derive(Clone, Default)]
pub struct Capabilities {
    pub detector: Option<Arc<dyn Detector>>,
    pub lane_source: Option<Arc<dyn LanePrimitiveSource>>,
}

/// Cross-pipeline resources, each with its own synchronization.
#[derive(Clone, Default)]
pub struct PipelineServices {
    pub storage: Option<Arc<ViolationManager>>,
    pub notifier: Option<Arc<NotificationSystem>>,
    pub ocr: Option<Arc<OcrPool>>,
}

// ============================================================================
// STATE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", content = "message", rename_all = "snake_case")]
pub enum StreamState {
    Idle,
    Starting,
    Running,
    Stopped,
    Error(String),
}

impl StreamState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Error(_) => "error",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }
}

pub type SharedState = Arc<Mutex<StreamState>>;

// ============================================================================
// FRAME PROCESSOR
// ============================================================================

/// The synchronous analysis chain: detect → track → lanes → violations.
pub struct FrameProcessor {
    camera_id: String,
    detection_confidence: f32,
    cleanup_interval: u64,
    capabilities: Capabilities,
    tracker: VehicleTracker,
    lanes: LaneDetector,
    lanes_enabled: bool,
    calibrator: CameraCalibrator,
    engine: ViolationEngine,
    scheduler: FrameScheduler,
    last_vehicles: Vec<TrackedVehicle>,
    last_geometry: Option<LaneGeometry>,
    last_frame: (u64, f64),
    frames_analyzed: u64,
    detector_failures: u64,
}

impl FrameProcessor {
    pub fn new(
        camera_id: &str,
        settings: &AnalysisSettings,
        pipeline: &PipelineConfig,
        target_fps: f64,
        calibrator: CameraCalibrator,
        capabilities: Capabilities,
        plates: Arc<PlateDedup>,
    ) -> Self {
        if !calibrator.is_calibrated() && calibrator.zones().is_empty() {
            warn!("[{}] Camera is not calibrated; speed checks are disabled", camera_id);
        }
        Self {
            camera_id: camera_id.to_string(),
            detection_confidence: pipeline.detection_confidence,
            cleanup_interval: pipeline.cleanup_interval_frames.max(1),
            capabilities,
            tracker: VehicleTracker::new(settings.tracker.clone()),
            lanes: LaneDetector::new(settings.lanes.clone()),
            lanes_enabled: settings.lanes.enabled,
            calibrator,
            engine: ViolationEngine::new(
                camera_id,
                settings.violations.clone(),
                settings.speed.clone(),
                settings.lane_check.clone(),
                plates,
            ),
            scheduler: FrameScheduler::new(pipeline.frame_skipping, target_fps),
            last_vehicles: Vec::new(),
            last_geometry: None,
            last_frame: (0, 0.0),
            frames_analyzed: 0,
            detector_failures: 0,
        }
    }

    /// Run the chain on one frame, or skip it when the scheduler says so.
    pub fn process(
        &mut self,
        input: FrameInput,
        backlog: usize,
        capacity: usize,
        last_processing_ms: f64,
    ) -> FrameResult {
        let FrameInput { frame, detections } = input;
        if !self
            .scheduler
            .should_process(backlog, capacity, last_processing_ms)
        {
            return FrameResult::skipped(&frame, &self.last_vehicles);
        }

        let started = Instant::now();
        let detections = match detections {
            Some(d) => d,
            None => self.detect(&frame),
        };
        let vehicles = self.tracker.update(&detections, &frame);
        let geometry = self.update_lanes(&frame);

        let ctx = DetectionContext {
            frame_id: frame.frame_id,
            timestamp_ms: frame.timestamp_ms,
            vehicles: &vehicles,
            trajectories: self.tracker.trajectories(),
            calibrator: &self.calibrator,
            lanes: geometry.as_ref(),
        };
        let violations = self.engine.process_frame(&ctx);

        self.frames_analyzed += 1;
        self.last_frame = (frame.frame_id, frame.timestamp_ms);
        if self.frames_analyzed % self.cleanup_interval == 0 {
            let active = self.tracker.active_track_ids();
            self.engine
                .cleanup(frame.timestamp_ms, frame.frame_id, &active);
        }
        self.last_vehicles = vehicles.clone();

        FrameResult {
            frame_id: frame.frame_id,
            timestamp_ms: frame.timestamp_ms,
            skipped: false,
            detections: detections.len(),
            vehicles,
            violations,
            processing_us: started.elapsed().as_micros() as u64,
        }
    }

    /// A detector failure counts as zero detections.
    fn detect(&mut self, frame: &Frame) -> Vec<Detection> {
        let Some(detector) = &self.capabilities.detector else {
            return Vec::new();
        };
        match detector.detect(frame, self.detection_confidence) {
            Ok(d) => d,
            Err(e) => {
                self.detector_failures += 1;
                if self.detector_failures % 100 == 1 {
                    warn!(
                        "[{}] Detection failed on frame {} ({} failures so far): {}",
                        self.camera_id, frame.frame_id, self.detector_failures, e
                    );
                }
                Vec::new()
            }
        }
    }

    fn update_lanes(&mut self, frame: &Frame) -> Option<LaneGeometry> {
        if !self.lanes_enabled {
            return None;
        }
        let source = self.capabilities.lane_source.as_ref()?;
        let (w, h) = (frame.width as f32, frame.height as f32);
        let roi = self.lanes.roi(w, h);
        match source.detect_lane_primitives(frame, &roi) {
            Ok(segments) => {
                self.last_geometry = Some(self.lanes.process(&segments, w, h));
            }
            Err(e) => {
                debug!(
                    "[{}] Lane primitives unavailable on frame {}: {}",
                    self.camera_id, frame.frame_id, e
                );
            }
        }
        self.last_geometry.clone()
    }

    /// Merge an OCR result; returns updates for already-emitted violations.
    pub fn attach_plate(&mut self, result: &OcrResult) -> Vec<PlateUpdate> {
        let (frame_id, now_ms) = self.last_frame;
        self.engine.attach_plate(
            result.vehicle_id,
            &result.plate,
            result.confidence,
            now_ms.max(result.timestamp_ms),
            frame_id.max(result.frame_id),
        )
    }

    pub fn plate_for(&self, vehicle_id: u32) -> Option<&str> {
        self.engine.plate_for(vehicle_id)
    }

    pub fn engine_stats(&self) -> EngineStats {
        self.engine.stats()
    }

    pub fn tracker_stats(&self) -> TrackerStats {
        self.tracker.stats()
    }

    pub fn scheduler_stats(&self) -> SchedulerStats {
        self.scheduler.stats()
    }
}

// ============================================================================
// OUTPUT WORKER
// ============================================================================

enum OutputOp {
    Record(Box<TrafficViolation>),
    Plate(PlateUpdate),
}

/// Persists and alerts in arrival order. Alerts run concurrently with
/// later storage writes; storage calls are individually time-bounded.
async fn output_worker(
    stream_id: String,
    services: PipelineServices,
    store_json: bool,
    mut rx: mpsc::Receiver<OutputOp>,
) {
    let mut alerts: JoinSet<()> = JoinSet::new();
    loop {
        let op = tokio::select! {
            op = rx.recv() => match op {
                Some(op) => op,
                None => break,
            },
            Some(_) = alerts.join_next(), if !alerts.is_empty() => continue,
        };
        match op {
            OutputOp::Record(violation) => {
                if let Some(storage) = &services.storage {
                    persist(&stream_id, storage, &violation, store_json).await;
                }
                if let Some(notifier) = &services.notifier {
                    let notifier = notifier.clone();
                    alerts.spawn(async move {
                        let report = notifier.notify(&violation).await;
                        if !report.failed().is_empty() {
                            debug!(
                                "Alert {} failed on {:?}",
                                report.alert_id,
                                report.failed()
                            );
                        }
                    });
                }
            }
            OutputOp::Plate(update) => {
                let Some(storage) = &services.storage else {
                    continue;
                };
                match storage
                    .update_plate(&update.violation_id, &update.plate, update.confidence)
                    .await
                {
                    Ok(true) => debug!(
                        "[{}] Plate {} attached to {}",
                        stream_id, update.plate, update.violation_id
                    ),
                    Ok(false) => debug!(
                        "[{}] Violation {} not stored; plate {} dropped",
                        stream_id, update.violation_id, update.plate
                    ),
                    Err(e) => warn!(
                        "[{}] Plate update for {} failed: {}",
                        stream_id, update.violation_id, e
                    ),
                }
            }
        }
    }
    while alerts.join_next().await.is_some() {}
    debug!("[{}] Output worker drained", stream_id);
}

async fn persist(stream_id: &str, storage: &ViolationManager, violation: &TrafficViolation, store_json: bool) {
    let id = match storage.record(violation).await {
        Ok(id) => id,
        Err(e) => {
            error!(
                "[{}] Violation {} not stored: {}",
                stream_id, violation.violation_id, e
            );
            return;
        }
    };
    if !store_json {
        return;
    }
    let payload = match serde_json::to_vec(violation) {
        Ok(p) => p,
        Err(e) => {
            warn!("[{}] Violation {} not serializable: {}", stream_id, id, e);
            return;
        }
    };
    let tags = vec![
        violation.violation_type.as_str().to_string(),
        violation.camera_id.clone(),
    ];
    if let Err(e) = storage
        .attach_evidence(&id, DataType::Json, payload, tags)
        .await
    {
        // Metadata is stored; only the evidence copy is lost.
        warn!("[{}] Evidence for violation {} lost: {}", stream_id, id, e);
    }
}

// ============================================================================
// PIPELINE
// ============================================================================

pub struct StreamPipeline {
    config: StreamConfig,
    pipeline: PipelineConfig,
    processor: FrameProcessor,
    services: PipelineServices,
    metrics: StreamMetrics,
    state: SharedState,
    events: SharedEventBus,
}

impl StreamPipeline {
    pub fn new(
        config: StreamConfig,
        pipeline: PipelineConfig,
        processor: FrameProcessor,
        services: PipelineServices,
        metrics: StreamMetrics,
        state: SharedState,
        events: SharedEventBus,
    ) -> Self {
        Self {
            config,
            pipeline,
            processor,
            services,
            metrics,
            state,
            events,
        }
    }

    fn set_state(&self, state: StreamState) {
        {
            let mut current = self.state.lock();
            if *current == state {
                return;
            }
            *current = state.clone();
        }
        match &state {
            StreamState::Error(msg) => {
                error!("[{}] Stream error: {}", self.config.stream_id, msg)
            }
            s => info!("[{}] Stream {}", self.config.stream_id, s.as_str()),
        }
        self.events.lock().publish(PipelineEvent::StateChanged {
            stream_id: self.config.stream_id.clone(),
            state,
        });
    }

    /// Drive the stream until the source ends, fails for good, or `cancel`
    /// fires. Returns the final state.
    pub async fn run(mut self, source: Box<dyn FrameSource>, cancel: CancellationToken) -> StreamState {
        let stream_id = self.config.stream_id.clone();
        self.set_state(StreamState::Starting);
        info!("[{}] Opening {}", stream_id, source.describe());

        let capacity = self.config.buffer_size.max(1);
        let (frame_tx, mut frames) = mpsc::channel(capacity);
        let capture_cancel = cancel.child_token();
        let capture = match spawn_capture(
            stream_id.clone(),
            source,
            self.config.capture_settings(),
            frame_tx,
            self.metrics.clone(),
            capture_cancel.clone(),
        ) {
            Ok(handle) => handle,
            Err(e) => {
                let msg = format!("capture thread: {e}");
                self.metrics.record_error(msg.clone());
                self.set_state(StreamState::Error(msg.clone()));
                return StreamState::Error(msg);
            }
        };

        let (ocr_tx, mut ocr_results) = mpsc::channel::<OcrResult>(64);
        let (out_tx, out_rx) = mpsc::channel::<OutputOp>(self.pipeline.output_queue.max(1));
        let output = tokio::spawn(output_worker(
            stream_id.clone(),
            self.services.clone(),
            self.pipeline.store_violation_json,
            out_rx,
        ));

        // vehicle id -> frame id of the last OCR submission
        let mut ocr_pending: HashMap<u32, u64> = HashMap::new();
        let mut last_processing_ms = 0.0;
        let mut final_state = StreamState::Stopped;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("[{}] Stop requested", stream_id);
                    break;
                }
                Some(result) = ocr_results.recv() => {
                    ocr_pending.remove(&result.vehicle_id);
                    for update in self.processor.attach_plate(&result) {
                        self.events.lock().publish(PipelineEvent::PlateAttached {
                            stream_id: stream_id.clone(),
                            update: update.clone(),
                        });
                        if out_tx.try_send(OutputOp::Plate(update)).is_err() {
                            self.metrics.record_error("output queue full; plate update dropped");
                        }
                    }
                }
                event = frames.recv() => match event {
                    Some(CaptureEvent::Frame(input)) => {
                        if *self.state.lock() != StreamState::Running {
                            self.set_state(StreamState::Running);
                        }
                        let frame = input.frame.clone();
                        let result = self.processor.process(input, frames.len(), capacity, last_processing_ms);
                        if result.skipped {
                            self.metrics.inc(&self.metrics.frames_skipped);
                        } else {
                            self.metrics.inc(&self.metrics.frames_processed);
                            self.metrics.add(&self.metrics.detections, result.detections as u64);
                            self.metrics.set_timing(&self.metrics.processing_time_us, result.processing_us);
                            last_processing_ms = result.processing_us as f64 / 1000.0;
                            self.log_metrics();
                        }
                        for violation in result.violations {
                            self.request_plate(&violation, &frame, &ocr_tx, &mut ocr_pending);
                            self.emit(violation, &out_tx);
                        }
                    }
                    Some(CaptureEvent::Ended) => {
                        info!("[{}] Source ended", stream_id);
                        break;
                    }
                    Some(CaptureEvent::Failed(e)) => {
                        self.metrics.record_error(e.to_string());
                        final_state = StreamState::Error(e.to_string());
                        break;
                    }
                    None => break,
                },
            }
        }

        let grace = Duration::from_millis(self.pipeline.grace_period_ms);
        shutdown(&stream_id, grace, capture, capture_cancel, frames, out_tx, output).await;
        self.set_state(final_state.clone());

        let summary = self.metrics.summary();
        let engine = self.processor.engine_stats();
        info!(
            "[{}] Finished: {} frames read, {} processed, {} skipped, {} dropped, {} violations ({} suppressed by cooldown, {} by plate)",
            stream_id,
            summary.frames_read,
            summary.frames_processed,
            summary.frames_skipped,
            summary.frames_dropped,
            summary.violations,
            engine.suppressed_cooldown,
            engine.suppressed_plate
        );
        final_state
    }

    fn request_plate(
        &self,
        violation: &TrafficViolation,
        frame: &Frame,
        reply: &mpsc::Sender<OcrResult>,
        pending: &mut HashMap<u32, u64>,
    ) {
        if violation.license_plate.is_some() {
            return;
        }
        let Some(ocr) = &self.services.ocr else {
            return;
        };
        let retry_after = self.pipeline.ocr_retry_frames;
        if let Some(&submitted) = pending.get(&violation.vehicle_id) {
            if frame.frame_id.saturating_sub(submitted) < retry_after {
                return;
            }
        }
        let job = OcrJob {
            vehicle_id: violation.vehicle_id,
            frame: frame.clone(),
            bbox: violation.bbox,
        };
        if ocr.submit(job, reply.clone()) {
            pending.insert(violation.vehicle_id, frame.frame_id);
        }
    }

    fn emit(&self, violation: TrafficViolation, out: &mpsc::Sender<OutputOp>) {
        self.metrics.inc(&self.metrics.violations);
        self.events.lock().publish(PipelineEvent::ViolationDetected {
            stream_id: self.config.stream_id.clone(),
            violation: violation.clone(),
        });
        let id = violation.violation_id.clone();
        if out.try_send(OutputOp::Record(Box::new(violation))).is_err() {
            warn!(
                "[{}] Output queue full; violation {} not persisted",
                self.config.stream_id, id
            );
            self.metrics
                .record_error(format!("output queue full; violation {id} dropped"));
        }
    }

    fn log_metrics(&self) {
        let every = self.pipeline.log_metrics_interval;
        if every == 0 {
            return;
        }
        let s = self.metrics.summary();
        if s.frames_processed % every != 0 {
            return;
        }
        info!(
            "[{}] {} frames processed ({:.1} fps), {} skipped, {} dropped, {} violations, {:.1} ms/frame, strategy {:?}",
            self.config.stream_id,
            s.frames_processed,
            s.fps,
            s.frames_skipped,
            s.frames_dropped,
            s.violations,
            s.last_processing_us as f64 / 1000.0,
            self.processor.scheduler_stats().current_strategy
        );
    }
}

/// Stop capture, then give the output worker the grace period to drain.
async fn shutdown(
    stream_id: &str,
    grace: Duration,
    capture: std::thread::JoinHandle<()>,
    capture_cancel: CancellationToken,
    frames: mpsc::Receiver<CaptureEvent>,
    out_tx: mpsc::Sender<OutputOp>,
    output: tokio::task::JoinHandle<()>,
) {
    capture_cancel.cancel();
    // Unblocks a capture thread waiting on a full buffer.
    drop(frames);
    let joined = tokio::task::spawn_blocking(move || capture.join());
    match tokio::time::timeout(grace, joined).await {
        Ok(Ok(Ok(()))) => {}
        Ok(_) => warn!("[{}] Capture thread panicked", stream_id),
        Err(_) => warn!(
            "[{}] Capture thread still busy after {:?}; detaching",
            stream_id, grace
        ),
    }

    drop(out_tx);
    let abort = output.abort_handle();
    if tokio::time::timeout(grace, output).await.is_err() {
        warn!(
            "[{}] Storage/alerts not drained within {:?}; abandoning in-flight work",
            stream_id, grace
        );
        abort.abort();
    }
}

// ============================================================================
// TESTS
// ============================================================================
