// src/pipeline/frame_scheduler.rs
//
// Adaptive frame skipping. Picks how often to run the analysis chain from
// the capture backlog and the last processing time; skipped frames reuse
// the previous result instead of queueing.

use serde::Serialize;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingStrategy {
    /// Keeping up
    EveryFrame,

    /// Backlog building
    EveryOther,

    EveryThird,

    /// Falling well behind
    EveryFifth,
}

impl SchedulingStrategy {
    pub fn interval(&self) -> u32 {
        match self {
            Self::EveryFrame => 1,
            Self::EveryOther => 2,
            Self::EveryThird => 3,
            Self::EveryFifth => 5,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStats {
    pub total_frames: u64,
    pub processed_frames: u64,
    pub skipped_frames: u64,
    pub current_strategy: SchedulingStrategy,
}

pub struct FrameScheduler {
    enabled: bool,
    /// Frame budget at the target rate
    frame_budget_ms: f64,
    frames_since_last: u32,
    current_strategy: SchedulingStrategy,
    total_frames: u64,
    processed_frames: u64,
}

impl FrameScheduler {
    pub fn new(enabled: bool, target_fps: f64) -> Self {
        let fps = if target_fps.is_finite() && target_fps > 0.0 {
            target_fps
        } else {
            30.0
        };
        Self {
            enabled,
            frame_budget_ms: 1000.0 / fps,
            frames_since_last: 0,
            current_strategy: SchedulingStrategy::EveryFrame,
            total_frames: 0,
            processed_frames: 0,
        }
    }

    /// Strategy for a load factor: the larger of buffer fill ratio and
    /// processing time over frame budget.
    pub fn strategy_for(load: f64) -> SchedulingStrategy {
        if load < 0.5 {
            SchedulingStrategy::EveryFrame
        } else if load < 0.8 {
            SchedulingStrategy::EveryOther
        } else if load < 1.5 {
            SchedulingStrategy::EveryThird
        } else {
            SchedulingStrategy::EveryFifth
        }
    }

    /// Decide whether to analyse this frame.
    ///
    /// * `backlog` - frames waiting in the capture buffer
    /// * `capacity` - capture buffer size
    /// * `last_processing_ms` - duration of the previous analysed frame
    pub fn should_process(&mut self, backlog: usize, capacity: usize, last_processing_ms: f64) -> bool {
        self.total_frames += 1;
        self.frames_since_last += 1;

        if !self.enabled {
            self.processed_frames += 1;
            self.frames_since_last = 0;
            return true;
        }

        let fill = backlog as f64 / capacity.max(1) as f64;
        let latency = last_processing_ms / self.frame_budget_ms;
        let strategy = Self::strategy_for(fill.max(latency));
        if strategy != self.current_strategy {
            debug!(
                "Frame scheduling {:?} -> {:?} (fill={:.2}, latency={:.2})",
                self.current_strategy, strategy, fill, latency
            );
            self.current_strategy = strategy;
        }

        let run = self.frames_since_last >= strategy.interval();
        if run {
            self.frames_since_last = 0;
            self.processed_frames += 1;
        }
        run
    }

    pub fn strategy(&self) -> SchedulingStrategy {
        self.current_strategy
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            total_frames: self.total_frames,
            processed_frames: self.processed_frames,
            skipped_frames: self.total_frames - self.processed_frames,
            current_strategy: self.current_strategy,
        }
    }

    pub fn reset(&mut self) {
        self.frames_since_last = 0;
        self.current_strategy = SchedulingStrategy::EveryFrame;
        self.total_frames = 0;
        self.processed_frames = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_processes_every_frame() {
        let mut s = FrameScheduler::new(true, 30.0);
        for _ in 0..10 {
            assert!(s.should_process(0, 10, 5.0));
        }
        assert_eq!(s.stats().skipped_frames, 0);
    }

    #[test]
    fn test_full_buffer_skips_to_every_fifth() {
        let mut s = FrameScheduler::new(true, 30.0);
        let runs = (0..20).filter(|_| s.should_process(10, 10, 5.0)).count();
        assert_eq!(s.strategy(), SchedulingStrategy::EveryFifth);
        assert_eq!(runs, 4);
    }

    #[test]
    fn test_slow_processing_alone_triggers_skipping() {
        let mut s = FrameScheduler::new(true, 30.0);
        // 20ms per frame against a 33ms budget -> 0.6 load
        let runs = (0..10).filter(|_| s.should_process(0, 10, 20.0)).count();
        assert_eq!(s.strategy(), SchedulingStrategy::EveryOther);
        assert_eq!(runs, 5);
    }

    #[test]
    fn test_disabled_never_skips() {
        let mut s = FrameScheduler::new(false, 30.0);
        assert!((0..10).all(|_| s.should_process(10, 10, 500.0)));
    }

    #[test]
    fn test_boundaries() {
        assert_eq!(FrameScheduler::strategy_for(0.49), SchedulingStrategy::EveryFrame);
        assert_eq!(FrameScheduler::strategy_for(0.5), SchedulingStrategy::EveryOther);
        assert_eq!(FrameScheduler::strategy_for(0.8), SchedulingStrategy::EveryThird);
        assert_eq!(FrameScheduler::strategy_for(1.5), SchedulingStrategy::EveryFifth);
    }
}
