// src/pipeline/manager.rs
//
// Supervises one pipeline task per camera. The stream table sits behind a
// single short-lived lock that is never held across an await; each
// pipeline owns its analysis state and reports through its shared state,
// metrics and the event bus.

use super::event_bus::{EventBus, PipelineEvent, SharedEventBus};
use super::frame_source::FrameSource;
use super::metrics::{AggregateMetrics, MetricsSummary, StreamMetrics};
use super::stream_pipeline::{
    AnalysisSettings, Capabilities, FrameProcessor, PipelineConfig, PipelineServices, SharedState,
    StreamConfig, StreamPipeline, StreamState,
};
use crate::config::CalibrationConfig;
use crate::error::StreamError;
use crate::speed::CameraCalibrator;
use crate::violations::PlateDedup;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// A stream is healthy while running and fed within this window.
pub const HEALTHY_FRAME_WINDOW: Duration = Duration::from_secs(5);

/// Builds the frame source for a stream's locator.
pub type SourceFactory =
    Arc<dyn Fn(&StreamConfig) -> Result<Box<dyn FrameSource>, StreamError> + Send + Sync>;

#[derive(Clone)]
pub struct ManagerSettings {
    pub max_concurrent: usize,
    pub pipeline: PipelineConfig,
    pub analysis: AnalysisSettings,
    /// Used by streams without their own calibration
    pub calibration: CalibrationConfig,
    pub capabilities: Capabilities,
    pub max_pending_events: usize,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            max_concurrent: 16,
            pipeline: PipelineConfig::default(),
            analysis: AnalysisSettings::default(),
            calibration: CalibrationConfig::default(),
            capabilities: Capabilities::default(),
            max_pending_events: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamStatus {
    pub stream_id: String,
    pub camera_id: String,
    pub source: String,
    pub state: StreamState,
    pub healthy: bool,
    pub metrics: MetricsSummary,
}

struct ManagedStream {
    config: StreamConfig,
    state: SharedState,
    metrics: StreamMetrics,
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<StreamState>>,
}

impl ManagedStream {
    fn is_active(&self) -> bool {
        self.task.as_ref().map_or(false, |t| !t.is_finished())
    }

    fn is_healthy(&self) -> bool {
        *self.state.lock() == StreamState::Running
            && self
                .metrics
                .since_last_frame()
                .map_or(false, |d| d <= HEALTHY_FRAME_WINDOW)
    }

    fn status(&self) -> StreamStatus {
        StreamStatus {
            stream_id: self.config.stream_id.clone(),
            camera_id: self.config.camera_id().to_string(),
            source: self.config.source.clone(),
            state: self.state.lock().clone(),
            healthy: self.is_healthy(),
            metrics: self.metrics.summary(),
        }
    }
}

pub struct MultiStreamManager {
    settings: ManagerSettings,
    services: PipelineServices,
    factory: SourceFactory,
    plates: Arc<PlateDedup>,
    events: SharedEventBus,
    streams: Mutex<HashMap<String, ManagedStream>>,
}

impl MultiStreamManager {
    pub fn new(settings: ManagerSettings, services: PipelineServices, factory: SourceFactory) -> Self {
        let plates = Arc::new(PlateDedup::new(
            settings.analysis.violations.plate_window_frames,
        ));
        let events = EventBus::shared(settings.max_pending_events);
        info!(
            "Stream manager ready (max {} concurrent streams)",
            settings.max_concurrent
        );
        Self {
            settings,
            services,
            factory,
            plates,
            events,
            streams: Mutex::new(HashMap::new()),
        }
    }

    pub fn add_stream(&self, config: StreamConfig) -> Result<(), StreamError> {
        if config.stream_id.trim().is_empty() {
            return Err(StreamError::Open(config.source, "empty stream id".into()));
        }
        let mut streams = self.streams.lock();
        if streams.contains_key(&config.stream_id) {
            return Err(StreamError::AlreadyExists(config.stream_id));
        }
        info!("[{}] Added stream {}", config.stream_id, config.source);
        streams.insert(
            config.stream_id.clone(),
            ManagedStream {
                config,
                state: Arc::new(Mutex::new(StreamState::Idle)),
                metrics: StreamMetrics::new(),
                cancel: None,
                task: None,
            },
        );
        Ok(())
    }

    /// Stop (if running) and forget a stream.
    pub async fn remove_stream(&self, stream_id: &str) -> Result<(), StreamError> {
        self.stop_stream(stream_id).await?;
        self.streams.lock().remove(stream_id);
        info!("[{}] Removed stream", stream_id);
        Ok(())
    }

    /// Start a stream's pipeline. Starting a running stream is a no-op.
    pub fn start_stream(&self, stream_id: &str) -> Result<(), StreamError> {
        let mut streams = self.streams.lock();
        let active = streams.values().filter(|s| s.is_active()).count();
        let stream = streams
            .get_mut(stream_id)
            .ok_or_else(|| StreamError::NotFound(stream_id.to_string()))?;
        if stream.is_active() {
            return Ok(());
        }
        if active >= self.settings.max_concurrent {
            warn!(
                "[{}] Not started: {} streams already running",
                stream_id, active
            );
            return Err(StreamError::CapacityReached(self.settings.max_concurrent));
        }

        let source = match (self.factory)(&stream.config) {
            Ok(source) => source,
            Err(e) => {
                stream.metrics.record_error(e.to_string());
                *stream.state.lock() = StreamState::Error(e.to_string());
                self.events.lock().publish(PipelineEvent::StateChanged {
                    stream_id: stream_id.to_string(),
                    state: StreamState::Error(e.to_string()),
                });
                return Err(e);
            }
        };

        let pipeline = StreamPipeline::new(
            stream.config.clone(),
            self.settings.pipeline.clone(),
            self.processor_for(&stream.config),
            self.services.clone(),
            stream.metrics.clone(),
            stream.state.clone(),
            self.events.clone(),
        );
        let cancel = CancellationToken::new();
        stream.task = Some(tokio::spawn(pipeline.run(source, cancel.clone())));
        stream.cancel = Some(cancel);
        Ok(())
    }

    fn processor_for(&self, config: &StreamConfig) -> FrameProcessor {
        let camera_id = config.camera_id();
        let calibration = config
            .calibration
            .as_ref()
            .unwrap_or(&self.settings.calibration);
        let calibrator = calibration.build().unwrap_or_else(|e| {
            warn!(
                "[{}] Calibration rejected ({}); speed checks disabled",
                camera_id, e
            );
            CameraCalibrator::new()
        });
        FrameProcessor::new(
            camera_id,
            &self.settings.analysis,
            &self.settings.pipeline,
            config.target_fps,
            calibrator,
            self.settings.capabilities.clone(),
            self.plates.clone(),
        )
    }

    /// Cancel a stream and wait (bounded) for its pipeline to wind down.
    /// Ok(false) when it was not running.
    pub async fn stop_stream(&self, stream_id: &str) -> Result<bool, StreamError> {
        let (cancel, task, state) = {
            let mut streams = self.streams.lock();
            let stream = streams
                .get_mut(stream_id)
                .ok_or_else(|| StreamError::NotFound(stream_id.to_string()))?;
            (stream.cancel.take(), stream.task.take(), stream.state.clone())
        };
        let Some(task) = task else {
            return Ok(false);
        };
        let was_running = !task.is_finished();
        if let Some(cancel) = cancel {
            cancel.cancel();
        }

        // Capture join and output drain each get the grace period.
        let grace = Duration::from_millis(self.settings.pipeline.grace_period_ms) * 3;
        let abort = task.abort_handle();
        match tokio::time::timeout(grace, task).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                warn!("[{}] Pipeline task failed: {}", stream_id, e);
                *state.lock() = StreamState::Error(format!("pipeline task failed: {e}"));
            }
            Err(_) => {
                warn!("[{}] Pipeline did not stop within {:?}; aborting", stream_id, grace);
                abort.abort();
                *state.lock() = StreamState::Stopped;
            }
        }
        if was_running {
            info!("[{}] Stopped", stream_id);
        }
        Ok(was_running)
    }

    /// Start every enabled stream; returns how many were started.
    pub fn start_all(&self) -> usize {
        let mut ids: Vec<String> = self
            .streams
            .lock()
            .values()
            .filter(|s| s.config.enabled)
            .map(|s| s.config.stream_id.clone())
            .collect();
        ids.sort();
        let mut started = 0;
        for id in ids {
            match self.start_stream(&id) {
                Ok(()) => started += 1,
                Err(e) => warn!("[{}] Could not start: {}", id, e),
            }
        }
        started
    }

    /// Cancel everything first so the pipelines wind down together, then
    /// collect them one by one.
    pub async fn stop_all(&self) {
        let ids: Vec<String> = {
            let streams = self.streams.lock();
            for s in streams.values() {
                if let Some(cancel) = &s.cancel {
                    cancel.cancel();
                }
            }
            streams.keys().cloned().collect()
        };
        for id in ids {
            if let Err(e) = self.stop_stream(&id).await {
                warn!("[{}] Stop failed: {}", id, e);
            }
        }
    }

    /// Wait until no pipeline task is running.
    pub async fn wait_until_idle(&self, poll: Duration) {
        let mut ticker = tokio::time::interval(poll);
        loop {
            ticker.tick().await;
            if self.active_count() == 0 {
                return;
            }
        }
    }

    pub fn status(&self, stream_id: &str) -> Option<StreamStatus> {
        self.streams.lock().get(stream_id).map(|s| s.status())
    }

    pub fn statuses(&self) -> Vec<StreamStatus> {
        let mut all: Vec<StreamStatus> = self.streams.lock().values().map(|s| s.status()).collect();
        all.sort_by(|a, b| a.stream_id.cmp(&b.stream_id));
        all
    }

    pub fn aggregate(&self) -> AggregateMetrics {
        let statuses = self.statuses();
        AggregateMetrics::from_summaries(
            statuses
                .iter()
                .map(|s| (&s.metrics, s.state == StreamState::Running, s.healthy)),
        )
    }

    pub fn stream_count(&self) -> usize {
        self.streams.lock().len()
    }

    pub fn active_count(&self) -> usize {
        self.streams.lock().values().filter(|s| s.is_active()).count()
    }

    pub fn drain_events(&self) -> Vec<PipelineEvent> {
        self.events.lock().drain()
    }

    pub fn plate_dedup(&self) -> &Arc<PlateDedup> {
        &self.plates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::frame_context::FrameInput;
    use crate::types::Frame;

    /// Produces empty frames every few milliseconds until closed.
    struct EndlessSource {
        next: u64,
    }

    impl FrameSource for EndlessSource {
        fn describe(&self) -> String {
            "endless".into()
        }
        fn open(&mut self, _timeout: Duration) -> Result<(), StreamError> {
            Ok(())
        }
        fn read(&mut self) -> Result<Option<FrameInput>, StreamError> {
            std::thread::sleep(Duration::from_millis(5));
            self.next += 1;
            Ok(Some(FrameInput::with_detections(
                Frame::empty(self.next, self.next as f64 * 5.0, 640, 480),
                Vec::new(),
            )))
        }
        fn close(&mut self) {}
    }

    fn factory() -> SourceFactory {
        Arc::new(|config: &StreamConfig| {
            if config.source == "broken://" {
                return Err(StreamError::Open(config.source.clone(), "unsupported".into()));
            }
            Ok(Box::new(EndlessSource { next: 0 }) as Box<dyn FrameSource>)
        })
    }

    fn manager(max_concurrent: usize) -> MultiStreamManager {
        let settings = ManagerSettings {
            max_concurrent,
            pipeline: PipelineConfig {
                grace_period_ms: 500,
                ..Default::default()
            },
            ..Default::default()
        };
        MultiStreamManager::new(settings, PipelineServices::default(), factory())
    }

    async fn wait_running(m: &MultiStreamManager, ids: &[&str]) {
        for _ in 0..200 {
            if ids
                .iter()
                .all(|id| m.status(id).map_or(false, |s| s.state == StreamState::Running))
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("streams never reached running");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stopping_one_stream_leaves_others_running() {
        let m = manager(16);
        let ids = ["cam1", "cam2", "cam3", "cam4"];
        for id in ids {
            m.add_stream(StreamConfig::new(id, "test://")).unwrap();
        }
        assert_eq!(m.start_all(), 4);
        wait_running(&m, &ids).await;

        assert_eq!(m.stop_stream("cam2").await, Ok(true));
        assert_eq!(m.status("cam2").unwrap().state, StreamState::Stopped);

        let before: Vec<u64> = ["cam1", "cam3", "cam4"]
            .iter()
            .map(|id| m.status(id).unwrap().metrics.frames_read)
            .collect();
        tokio::time::sleep(Duration::from_millis(100)).await;
        for (id, prev) in ["cam1", "cam3", "cam4"].iter().zip(before) {
            let s = m.status(id).unwrap();
            assert_eq!(s.state, StreamState::Running, "{id}");
            assert!(s.metrics.frames_read > prev, "{id} keeps reading");
            assert!(s.healthy);
        }
        let agg = m.aggregate();
        assert_eq!(agg.total_streams, 4);
        assert_eq!(agg.running_streams, 3);

        m.stop_all().await;
        assert_eq!(m.active_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_is_idempotent() {
        let m = manager(16);
        m.add_stream(StreamConfig::new("cam1", "test://")).unwrap();
        assert_eq!(m.stop_stream("cam1").await, Ok(false), "never started");
        m.start_stream("cam1").unwrap();
        wait_running(&m, &["cam1"]).await;
        assert_eq!(m.stop_stream("cam1").await, Ok(true));
        assert_eq!(m.stop_stream("cam1").await, Ok(false));
        assert_eq!(
            m.stop_stream("nope").await,
            Err(StreamError::NotFound("nope".into()))
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_capacity_limit_refuses_extra_streams() {
        let m = manager(2);
        for id in ["a", "b", "c"] {
            m.add_stream(StreamConfig::new(id, "test://")).unwrap();
        }
        m.start_stream("a").unwrap();
        m.start_stream("b").unwrap();
        assert_eq!(m.start_stream("c"), Err(StreamError::CapacityReached(2)));
        m.stop_stream("a").await.unwrap();
        assert_eq!(m.start_stream("c"), Ok(()));
        m.stop_all().await;
    }

    #[tokio::test]
    async fn test_add_remove_and_bad_source() {
        let m = manager(4);
        m.add_stream(StreamConfig::new("cam1", "broken://")).unwrap();
        assert_eq!(
            m.add_stream(StreamConfig::new("cam1", "test://")),
            Err(StreamError::AlreadyExists("cam1".into()))
        );
        assert!(m.start_stream("cam1").is_err());
        assert!(matches!(
            m.status("cam1").unwrap().state,
            StreamState::Error(_)
        ));
        m.remove_stream("cam1").await.unwrap();
        assert_eq!(m.stream_count(), 0);
        assert!(m.status("cam1").is_none());
        assert!(m
            .drain_events()
            .iter()
            .any(|e| matches!(e, PipelineEvent::StateChanged { state: StreamState::Error(_), .. })));
    }
}
