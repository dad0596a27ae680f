// src/pipeline/event_bus.rs
//
// Decoupled event feed. Pipelines publish; the manager (or the binary)
// drains. Bounded: when full the oldest event is dropped.

use super::stream_pipeline::StreamState;
use crate::violations::{PlateUpdate, TrafficViolation};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone)]
pub enum PipelineEvent {
    ViolationDetected {
        stream_id: String,
        violation: TrafficViolation,
    },

    PlateAttached {
        stream_id: String,
        update: PlateUpdate,
    },

    StateChanged {
        stream_id: String,
        state: StreamState,
    },
}

impl PipelineEvent {
    pub fn stream_id(&self) -> &str {
        match self {
            Self::ViolationDetected { stream_id, .. }
            | Self::PlateAttached { stream_id, .. }
            | Self::StateChanged { stream_id, .. } => stream_id,
        }
    }
}

pub struct EventBus {
    events: VecDeque<PipelineEvent>,
    max_pending: usize,
    dropped: u64,
}

impl EventBus {
    pub fn new(max_pending: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(max_pending),
            max_pending: max_pending.max(1),
            dropped: 0,
        }
    }

    /// Shared handle for publishing from several pipelines.
    pub fn shared(max_pending: usize) -> SharedEventBus {
        Arc::new(Mutex::new(Self::new(max_pending)))
    }

    pub fn publish(&mut self, event: PipelineEvent) {
        if self.events.len() >= self.max_pending {
            if self.dropped % 100 == 0 {
                warn!(
                    "Event bus full ({} events), dropping oldest",
                    self.max_pending
                );
            }
            self.dropped += 1;
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    pub fn drain(&mut self) -> Vec<PipelineEvent> {
        self.events.drain(..).collect()
    }

    pub fn pending_count(&self) -> usize {
        self.events.len()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

pub type SharedEventBus = Arc<Mutex<EventBus>>;
