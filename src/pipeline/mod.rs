// src/pipeline/mod.rs

pub mod event_bus;
pub mod frame_context;
pub mod frame_scheduler;
pub mod frame_source;
pub mod manager;
pub mod metrics;
pub mod ocr_pool;
pub mod replay;
pub mod stream_pipeline;

pub use event_bus::{EventBus, PipelineEvent, SharedEventBus};
pub use frame_context::{FrameInput, FrameResult};
pub use frame_scheduler::{FrameScheduler, SchedulerStats, SchedulingStrategy};
pub use frame_source::{CaptureEvent, CaptureSettings, FrameSource};
pub use manager::{ManagerSettings, MultiStreamManager, SourceFactory, StreamStatus};
pub use metrics::{AggregateMetrics, MetricsSummary, StreamMetrics};
pub use ocr_pool::{OcrJob, OcrPool, OcrPoolConfig, OcrPoolStats, OcrResult};
pub use replay::{open_source, ReplayPlateReader, ReplaySource};
pub use stream_pipeline::{
    AnalysisSettings, Capabilities, FrameProcessor, PipelineConfig, PipelineServices,
    StreamConfig, StreamPipeline, StreamState,
};
