// src/pipeline/ocr_pool.rs
//
// Plate recognition off the frame loop. A bounded job queue feeds a fixed
// set of worker threads; a full queue rejects the job and the violation
// keeps an empty plate. Results go back to the submitting pipeline over
// its own channel.

use crate::capabilities::{normalize_plate, PlateReader};
use crate::types::Frame;
use crossbeam_channel::{bounded, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OcrPoolConfig {
    pub enabled: bool,
    pub workers: usize,
    pub queue_size: usize,
    /// Reads below this confidence are discarded
    pub min_confidence: f32,
}

impl Default for OcrPoolConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            workers: 2,
            queue_size: 32,
            min_confidence: 0.5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OcrJob {
    pub vehicle_id: u32,
    pub frame: Frame,
    pub bbox: [f32; 4],
}

#[derive(Debug, Clone, PartialEq)]
pub struct OcrResult {
    pub vehicle_id: u32,
    pub frame_id: u64,
    pub timestamp_ms: f64,
    pub plate: String,
    pub confidence: f32,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct OcrPoolStats {
    pub submitted: u64,
    pub rejected: u64,
    pub completed: u64,
    pub unreadable: u64,
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    rejected: AtomicU64,
    completed: AtomicU64,
    unreadable: AtomicU64,
    failed: AtomicU64,
}

type Envelope = (OcrJob, mpsc::Sender<OcrResult>);

pub struct OcrPool {
    jobs: Option<Sender<Envelope>>,
    workers: Vec<JoinHandle<()>>,
    counters: Arc<Counters>,
}

impl OcrPool {
    pub fn new(config: &OcrPoolConfig, reader: Arc<dyn PlateReader>) -> std::io::Result<Self> {
        let (tx, rx) = bounded::<Envelope>(config.queue_size.max(1));
        let counters = Arc::new(Counters::default());
        let mut workers = Vec::with_capacity(config.workers.max(1));
        for i in 0..config.workers.max(1) {
            let rx = rx.clone();
            let reader = reader.clone();
            let counters = counters.clone();
            let min_confidence = config.min_confidence;
            let handle = std::thread::Builder::new()
                .name(format!("ocr-{i}"))
                .spawn(move || {
                    while let Ok((job, reply)) = rx.recv() {
                        let read = match reader.read_plate(&job.frame, job.bbox) {
                            Ok(read) => read,
                            Err(e) => {
                                counters.failed.fetch_add(1, Ordering::Relaxed);
                                warn!("OCR failed for vehicle {}: {}", job.vehicle_id, e);
                                continue;
                            }
                        };
                        let Some(read) = read.filter(|r| {
                            r.confidence >= min_confidence && !normalize_plate(&r.text).is_empty()
                        }) else {
                            counters.unreadable.fetch_add(1, Ordering::Relaxed);
                            continue;
                        };
                        counters.completed.fetch_add(1, Ordering::Relaxed);
                        let result = OcrResult {
                            vehicle_id: job.vehicle_id,
                            frame_id: job.frame.frame_id,
                            timestamp_ms: job.frame.timestamp_ms,
                            plate: read.text.trim().to_string(),
                            confidence: read.confidence,
                        };
                        // The pipeline may have stopped; its result is moot then.
                        if reply.try_send(result).is_err() {
                            debug!("OCR result for vehicle {} discarded", job.vehicle_id);
                        }
                    }
                })?;
            workers.push(handle);
        }
        info!(
            "OCR pool: {} worker(s), queue {}",
            workers.len(),
            config.queue_size.max(1)
        );
        Ok(Self {
            jobs: Some(tx),
            workers,
            counters,
        })
    }

    /// Queue a job. False when the queue is full or the pool is shut down.
    pub fn submit(&self, job: OcrJob, reply: mpsc::Sender<OcrResult>) -> bool {
        let Some(jobs) = &self.jobs else {
            return false;
        };
        let vehicle_id = job.vehicle_id;
        match jobs.try_send((job, reply)) {
            Ok(()) => {
                self.counters.submitted.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                debug!("OCR queue full, vehicle {} keeps an empty plate", vehicle_id);
                false
            }
        }
    }

    pub fn stats(&self) -> OcrPoolStats {
        OcrPoolStats {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            unreadable: self.counters.unreadable.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }
}

impl Drop for OcrPool {
    fn drop(&mut self) {
        // Closing the queue lets workers finish what they hold and exit.
        self.jobs.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::PlateRead;
    use crate::error::DetectionError;
    use std::time::Duration;

    struct FixedReader {
        text: &'static str,
        confidence: f32,
        delay: Duration,
    }

    impl PlateReader for FixedReader {
        fn read_plate(&self, _frame: &Frame, _bbox: [f32; 4]) -> Result<Option<PlateRead>, DetectionError> {
            std::thread::sleep(self.delay);
            if self.text == "ERR" {
                return Err(DetectionError::Inference("model crashed".into()));
            }
            Ok(Some(PlateRead {
                text: self.text.to_string(),
                confidence: self.confidence,
            }))
        }
    }

    fn job(vehicle_id: u32) -> OcrJob {
        OcrJob {
            vehicle_id,
            frame: Frame::empty(7, 231.0, 640, 480),
            bbox: [10.0, 10.0, 100.0, 60.0],
        }
    }

    fn pool(reader: FixedReader, workers: usize, queue_size: usize) -> OcrPool {
        let config = OcrPoolConfig {
            workers,
            queue_size,
            ..Default::default()
        };
        OcrPool::new(&config, Arc::new(reader)).unwrap()
    }

    #[tokio::test]
    async fn test_result_delivered_to_submitter() {
        let p = pool(
            FixedReader {
                text: " ABC123 ",
                confidence: 0.9,
                delay: Duration::ZERO,
            },
            2,
            4,
        );
        let (tx, mut rx) = mpsc::channel(4);
        assert!(p.submit(job(3), tx));
        let r = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(r.vehicle_id, 3);
        assert_eq!(r.plate, "ABC123");
        assert_eq!(r.frame_id, 7);
    }

    #[test]
    fn test_full_queue_rejects() {
        let p = pool(
            FixedReader {
                text: "ABC",
                confidence: 0.9,
                delay: Duration::from_millis(300),
            },
            1,
            1,
        );
        let (tx, _rx) = mpsc::channel(8);
        let accepted = (0..5).filter(|i| p.submit(job(*i), tx.clone())).count();
        // one in the worker, one queued
        assert!(accepted <= 2);
        assert!(p.stats().rejected >= 3);
    }

    #[tokio::test]
    async fn test_low_confidence_and_errors_yield_nothing() {
        let low = pool(
            FixedReader {
                text: "ABC",
                confidence: 0.1,
                delay: Duration::ZERO,
            },
            1,
            4,
        );
        let (tx, mut rx) = mpsc::channel(4);
        low.submit(job(1), tx);
        assert!(tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .map_or(true, |r| r.is_none()));
        drop(low);

        let broken = pool(
            FixedReader {
                text: "ERR",
                confidence: 0.9,
                delay: Duration::ZERO,
            },
            1,
            4,
        );
        let (tx, _rx) = mpsc::channel(4);
        broken.submit(job(1), tx);
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(broken.stats().failed, 1);
    }
}
