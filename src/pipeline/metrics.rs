// src/pipeline/metrics.rs
//
// Per-stream counters. Cheap to clone; the capture thread, the frame loop
// and the manager all hold the same handles.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct StreamMetrics {
    pub frames_read: Arc<AtomicU64>,
    pub frames_processed: Arc<AtomicU64>,
    pub frames_skipped: Arc<AtomicU64>,
    pub frames_dropped: Arc<AtomicU64>,
    pub detections: Arc<AtomicU64>,
    pub violations: Arc<AtomicU64>,
    pub reconnections: Arc<AtomicU64>,
    pub errors: Arc<AtomicU64>,
    pub processing_time_us: Arc<AtomicU64>,
    last_frame_at: Arc<Mutex<Option<Instant>>>,
    last_error: Arc<Mutex<Option<String>>>,
    pub started_at: Instant,
}

impl Default for StreamMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamMetrics {
    pub fn new() -> Self {
        Self {
            frames_read: Arc::new(AtomicU64::new(0)),
            frames_processed: Arc::new(AtomicU64::new(0)),
            frames_skipped: Arc::new(AtomicU64::new(0)),
            frames_dropped: Arc::new(AtomicU64::new(0)),
            detections: Arc::new(AtomicU64::new(0)),
            violations: Arc::new(AtomicU64::new(0)),
            reconnections: Arc::new(AtomicU64::new(0)),
            errors: Arc::new(AtomicU64::new(0)),
            processing_time_us: Arc::new(AtomicU64::new(0)),
            last_frame_at: Arc::new(Mutex::new(None)),
            last_error: Arc::new(Mutex::new(None)),
            started_at: Instant::now(),
        }
    }

    pub fn inc(&self, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn set_timing(&self, counter: &AtomicU64, duration_us: u64) {
        counter.store(duration_us, Ordering::Relaxed);
    }

    pub fn mark_frame(&self) {
        *self.last_frame_at.lock() = Some(Instant::now());
    }

    pub fn since_last_frame(&self) -> Option<Duration> {
        self.last_frame_at.lock().map(|t| t.elapsed())
    }

    pub fn record_error(&self, message: impl Into<String>) {
        self.inc(&self.errors);
        *self.last_error.lock() = Some(message.into());
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    /// Processed frames per second since the stream started.
    pub fn fps(&self) -> f64 {
        let frames = self.frames_processed.load(Ordering::Relaxed);
        let elapsed = self.started_at.elapsed().as_secs_f64();
        if elapsed > 0.01 {
            frames as f64 / elapsed
        } else {
            0.0
        }
    }

    pub fn summary(&self) -> MetricsSummary {
        let read = self.frames_read.load(Ordering::Relaxed);
        let dropped = self.frames_dropped.load(Ordering::Relaxed);
        MetricsSummary {
            frames_read: read,
            frames_processed: self.frames_processed.load(Ordering::Relaxed),
            frames_skipped: self.frames_skipped.load(Ordering::Relaxed),
            frames_dropped: dropped,
            detections: self.detections.load(Ordering::Relaxed),
            violations: self.violations.load(Ordering::Relaxed),
            reconnections: self.reconnections.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            fps: self.fps(),
            drop_rate: dropped as f64 / read.max(1) as f64,
            last_processing_us: self.processing_time_us.load(Ordering::Relaxed),
            last_error: self.last_error(),
            secs_since_last_frame: self.since_last_frame().map(|d| d.as_secs_f64()),
            elapsed_secs: self.started_at.elapsed().as_secs_f64(),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSummary {
    pub frames_read: u64,
    pub frames_processed: u64,
    pub frames_skipped: u64,
    pub frames_dropped: u64,
    pub detections: u64,
    pub violations: u64,
    pub reconnections: u64,
    pub errors: u64,
    pub fps: f64,
    pub drop_rate: f64,
    pub last_processing_us: u64,
    pub last_error: Option<String>,
    pub secs_since_last_frame: Option<f64>,
    pub elapsed_secs: f64,
}

/// Totals across every managed stream.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AggregateMetrics {
    pub total_streams: usize,
    pub running_streams: usize,
    pub healthy_streams: usize,
    pub total_frames: u64,
    pub total_processed: u64,
    pub total_dropped: u64,
    pub total_violations: u64,
    pub average_fps: f64,
    pub drop_rate: f64,
}

impl AggregateMetrics {
    /// Each item is a stream summary plus whether the stream is running and
    /// whether it is healthy.
    pub fn from_summaries<'a>(items: impl IntoIterator<Item = (&'a MetricsSummary, bool, bool)>) -> Self {
        let mut agg = AggregateMetrics::default();
        let mut fps_sum = 0.0;
        for (m, running, healthy) in items {
            agg.total_streams += 1;
            if running {
                agg.running_streams += 1;
                fps_sum += m.fps;
            }
            if healthy {
                agg.healthy_streams += 1;
            }
            agg.total_frames += m.frames_read;
            agg.total_processed += m.frames_processed;
            agg.total_dropped += m.frames_dropped;
            agg.total_violations += m.violations;
        }
        agg.average_fps = fps_sum / agg.running_streams.max(1) as f64;
        agg.drop_rate = agg.total_dropped as f64 / agg.total_frames.max(1) as f64;
        agg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_shared_between_clones() {
        let m = StreamMetrics::new();
        let c = m.clone();
        c.inc(&c.frames_read);
        c.inc(&c.frames_read);
        m.inc(&m.frames_dropped);
        m.record_error("read timeout");
        let s = m.summary();
        assert_eq!(s.frames_read, 2);
        assert_eq!(s.errors, 1);
        assert!((s.drop_rate - 0.5).abs() < 1e-9);
        assert_eq!(s.last_error.as_deref(), Some("read timeout"));
        assert!(s.secs_since_last_frame.is_none());
        c.mark_frame();
        assert!(m.since_last_frame().is_some());
    }

    #[test]
    fn test_aggregate() {
        let a = StreamMetrics::new();
        a.add(&a.frames_read, 100);
        a.add(&a.frames_dropped, 10);
        let b = StreamMetrics::new();
        b.add(&b.frames_read, 100);
        let (sa, sb) = (a.summary(), b.summary());
        let agg = AggregateMetrics::from_summaries([(&sa, true, true), (&sb, false, false)]);
        assert_eq!(agg.total_streams, 2);
        assert_eq!(agg.running_streams, 1);
        assert_eq!(agg.healthy_streams, 1);
        assert_eq!(agg.total_frames, 200);
        assert!((agg.drop_rate - 0.05).abs() < 1e-9);
    }
}
