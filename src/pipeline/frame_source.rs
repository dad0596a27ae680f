// src/pipeline/frame_source.rs
//
// Frame acquisition. A source is driven from its own OS thread so a
// blocking read never stalls the async runtime. Frames go to the pipeline
// through a small bounded channel; when the pipeline falls behind, frames
// are dropped at the capture side instead of queueing.

use super::frame_context::FrameInput;
use super::metrics::StreamMetrics;
use crate::error::StreamError;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub trait FrameSource: Send {
    fn describe(&self) -> String;

    /// Open or re-open the underlying capture. Must give up after `timeout`.
    fn open(&mut self, timeout: Duration) -> Result<(), StreamError>;

    /// Next frame; `Ok(None)` is end of stream.
    fn read(&mut self) -> Result<Option<FrameInput>, StreamError>;

    /// Release the capture handle. Safe to call more than once.
    fn close(&mut self);
}

#[derive(Debug)]
pub enum CaptureEvent {
    Frame(FrameInput),
    /// Source reached its end
    Ended,
    /// Reconnect attempts exhausted
    Failed(StreamError),
}

#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,
    pub connection_timeout: Duration,
    pub drop_frames_on_delay: bool,
}

/// Delay before reconnect attempt `attempt` (1-based): linear, capped at 5x.
pub fn reconnect_backoff(base: Duration, attempt: u32) -> Duration {
    base * attempt.clamp(1, 5)
}

/// Sleep in short slices; false when cancelled first.
fn sleep_unless_cancelled(total: Duration, cancel: &CancellationToken) -> bool {
    let slice = Duration::from_millis(50);
    let mut remaining = total;
    while !remaining.is_zero() {
        if cancel.is_cancelled() {
            return false;
        }
        let step = remaining.min(slice);
        std::thread::sleep(step);
        remaining -= step;
    }
    !cancel.is_cancelled()
}

/// Open with bounded retries. `initial` marks the first connection, whose
/// retries are not counted as reconnections.
fn connect(
    stream_id: &str,
    source: &mut dyn FrameSource,
    settings: &CaptureSettings,
    metrics: &StreamMetrics,
    cancel: &CancellationToken,
    initial: bool,
) -> Result<bool, StreamError> {
    let mut attempt = 0u32;
    loop {
        if cancel.is_cancelled() {
            return Ok(false);
        }
        match source.open(settings.connection_timeout) {
            Ok(()) => {
                if attempt > 0 || !initial {
                    info!("[{}] Reconnected to {}", stream_id, source.describe());
                }
                return Ok(true);
            }
            Err(e) => {
                attempt += 1;
                metrics.record_error(e.to_string());
                if !initial || attempt > 1 {
                    metrics.inc(&metrics.reconnections);
                }
                if attempt > settings.reconnect_attempts {
                    error!(
                        "[{}] Giving up on {} after {} attempts: {}",
                        stream_id,
                        source.describe(),
                        attempt,
                        e
                    );
                    return Err(StreamError::ReconnectExhausted(attempt));
                }
                let delay = reconnect_backoff(settings.reconnect_delay, attempt);
                warn!(
                    "[{}] Open failed ({}); retry {}/{} in {:?}",
                    stream_id, e, attempt, settings.reconnect_attempts, delay
                );
                if !sleep_unless_cancelled(delay, cancel) {
                    return Ok(false);
                }
            }
        }
    }
}

/// Run the capture loop on a dedicated thread until the source ends, the
/// pipeline goes away, or `cancel` fires. The source is closed on exit.
pub fn spawn_capture(
    stream_id: String,
    mut source: Box<dyn FrameSource>,
    settings: CaptureSettings,
    tx: mpsc::Sender<CaptureEvent>,
    metrics: StreamMetrics,
    cancel: CancellationToken,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name(format!("capture-{stream_id}"))
        .spawn(move || {
            let mut initial = true;
            'outer: loop {
                match connect(&stream_id, source.as_mut(), &settings, &metrics, &cancel, initial) {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => {
                        let _ = tx.blocking_send(CaptureEvent::Failed(e));
                        break;
                    }
                }
                initial = false;

                while !cancel.is_cancelled() {
                    match source.read() {
                        Ok(Some(input)) => {
                            metrics.inc(&metrics.frames_read);
                            metrics.mark_frame();
                            match tx.try_send(CaptureEvent::Frame(input)) {
                                Ok(()) => {}
                                Err(TrySendError::Full(CaptureEvent::Frame(input))) => {
                                    if settings.drop_frames_on_delay {
                                        metrics.inc(&metrics.frames_dropped);
                                    } else if tx.blocking_send(CaptureEvent::Frame(input)).is_err() {
                                        break 'outer;
                                    }
                                }
                                Err(TrySendError::Full(_)) => {}
                                Err(TrySendError::Closed(_)) => break 'outer,
                            }
                        }
                        Ok(None) => {
                            debug!("[{}] Source ended", stream_id);
                            let _ = tx.blocking_send(CaptureEvent::Ended);
                            break 'outer;
                        }
                        Err(e) => {
                            warn!("[{}] Read failed: {}", stream_id, e);
                            metrics.record_error(e.to_string());
                            source.close();
                            continue 'outer;
                        }
                    }
                }
                break;
            }
            source.close();
            debug!("[{}] Capture thread exiting", stream_id);
        })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::types::Frame;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// Yields `frames` frames, failing the first `fail_opens` opens and
    /// failing one read after `fail_read_at` frames.
    pub(crate) struct ScriptedSource {
        pub frames: u64,
        pub next: u64,
        pub fail_opens: u32,
        pub fail_read_at: Option<u64>,
        pub opens: Arc<AtomicU32>,
        pub closes: Arc<AtomicU32>,
    }

    impl ScriptedSource {
        pub(crate) fn new(frames: u64) -> Self {
            Self {
                frames,
                next: 0,
                fail_opens: 0,
                fail_read_at: None,
                opens: Arc::new(AtomicU32::new(0)),
                closes: Arc::new(AtomicU32::new(0)),
            }
        }
    }

    impl FrameSource for ScriptedSource {
        fn describe(&self) -> String {
            "scripted".into()
        }

        fn open(&mut self, _timeout: Duration) -> Result<(), StreamError> {
            let n = self.opens.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_opens {
                return Err(StreamError::Open("scripted".into(), "refused".into()));
            }
            Ok(())
        }

        fn read(&mut self) -> Result<Option<FrameInput>, StreamError> {
            if self.fail_read_at == Some(self.next) {
                self.fail_read_at = None;
                return Err(StreamError::Read("glitch".into()));
            }
            if self.next >= self.frames {
                return Ok(None);
            }
            let id = self.next;
            self.next += 1;
            Ok(Some(FrameInput::with_detections(
                Frame::empty(id, id as f64 * 33.0, 1280, 720),
                Vec::new(),
            )))
        }

        fn close(&mut self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn settings(attempts: u32, drop: bool) -> CaptureSettings {
        CaptureSettings {
            reconnect_attempts: attempts,
            reconnect_delay: Duration::from_millis(1),
            connection_timeout: Duration::from_millis(10),
            drop_frames_on_delay: drop,
        }
    }

    #[test]
    fn test_backoff_is_linear_and_capped() {
        let base = Duration::from_secs(2);
        assert_eq!(reconnect_backoff(base, 1), Duration::from_secs(2));
        assert_eq!(reconnect_backoff(base, 3), Duration::from_secs(6));
        assert_eq!(reconnect_backoff(base, 9), Duration::from_secs(10));
    }

    #[test]
    fn test_delivers_all_frames_then_end() {
        let (tx, mut rx) = mpsc::channel(4);
        let metrics = StreamMetrics::new();
        let handle = spawn_capture(
            "s".into(),
            Box::new(ScriptedSource::new(10)),
            settings(2, false),
            tx,
            metrics.clone(),
            CancellationToken::new(),
        )
        .unwrap();
        let mut frames = 0;
        while let Some(ev) = rx.blocking_recv() {
            match ev {
                CaptureEvent::Frame(_) => frames += 1,
                CaptureEvent::Ended => break,
                CaptureEvent::Failed(e) => panic!("unexpected failure {e}"),
            }
        }
        handle.join().unwrap();
        assert_eq!(frames, 10);
        assert_eq!(metrics.summary().frames_dropped, 0);
    }

    #[test]
    fn test_full_buffer_drops_frames() {
        let (tx, mut rx) = mpsc::channel(2);
        let metrics = StreamMetrics::new();
        let handle = spawn_capture(
            "s".into(),
            Box::new(ScriptedSource::new(20)),
            settings(2, true),
            tx,
            metrics.clone(),
            CancellationToken::new(),
        )
        .unwrap();
        // let the capture thread outrun us, then drain
        std::thread::sleep(Duration::from_millis(200));
        let mut received = 0;
        while let Some(ev) = rx.blocking_recv() {
            match ev {
                CaptureEvent::Frame(_) => received += 1,
                _ => break,
            }
        }
        handle.join().unwrap();
        let s = metrics.summary();
        assert_eq!(s.frames_read, 20);
        assert_eq!(received as u64 + s.frames_dropped, 20);
        assert!(s.frames_dropped >= 17, "buffer of 2 with nobody reading");
    }

    #[test]
    fn test_reconnect_exhaustion_reports_failure() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut source = ScriptedSource::new(5);
        source.fail_opens = u32::MAX;
        let closes = source.closes.clone();
        let metrics = StreamMetrics::new();
        let handle = spawn_capture(
            "s".into(),
            Box::new(source),
            settings(3, true),
            tx,
            metrics.clone(),
            CancellationToken::new(),
        )
        .unwrap();
        handle.join().unwrap();
        match rx.blocking_recv() {
            Some(CaptureEvent::Failed(StreamError::ReconnectExhausted(n))) => assert_eq!(n, 4),
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(metrics.summary().reconnections, 3);
        assert_eq!(closes.load(Ordering::SeqCst), 1, "capture handle released");
    }

    #[test]
    fn test_read_error_reconnects_and_resumes() {
        let (tx, mut rx) = mpsc::channel(16);
        let mut source = ScriptedSource::new(6);
        source.fail_read_at = Some(3);
        let opens = source.opens.clone();
        let metrics = StreamMetrics::new();
        let handle = spawn_capture(
            "s".into(),
            Box::new(source),
            settings(2, false),
            tx,
            metrics.clone(),
            CancellationToken::new(),
        )
        .unwrap();
        handle.join().unwrap();
        let mut frames = 0;
        while let Ok(ev) = rx.try_recv() {
            if matches!(ev, CaptureEvent::Frame(_)) {
                frames += 1;
            }
        }
        assert_eq!(frames, 6);
        assert_eq!(opens.load(Ordering::SeqCst), 2);
        assert_eq!(metrics.summary().errors, 1);
    }
}
