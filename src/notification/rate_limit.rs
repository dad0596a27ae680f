// src/notification/rate_limit.rs
//
// Sliding-window limiter, one per channel. A slot is reserved before a
// delivery attempt and handed back if the delivery ultimately fails, so
// only successful sends count against the hourly budget.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

pub struct RateLimiter {
    limit: Option<u32>,
    window: Duration,
    sent: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    /// `limit` sends per rolling hour; None is unlimited.
    pub fn per_hour(limit: Option<u32>) -> Self {
        Self::with_window(limit, Duration::from_secs(3600))
    }

    pub fn with_window(limit: Option<u32>, window: Duration) -> Self {
        Self {
            limit,
            window,
            sent: Mutex::new(VecDeque::new()),
        }
    }

    pub fn limit(&self) -> Option<u32> {
        self.limit
    }

    /// Reserve a slot. Returns the reservation time, or None when the
    /// window is full.
    pub fn try_acquire(&self) -> Option<Instant> {
        self.try_acquire_at(Instant::now())
    }

    pub fn try_acquire_at(&self, now: Instant) -> Option<Instant> {
        let Some(limit) = self.limit else {
            return Some(now);
        };
        let mut sent = self.sent.lock();
        while let Some(&oldest) = sent.front() {
            if now.saturating_duration_since(oldest) >= self.window {
                sent.pop_front();
            } else {
                break;
            }
        }
        if sent.len() as u32 >= limit {
            return None;
        }
        sent.push_back(now);
        Some(now)
    }

    /// Return a reservation made by `try_acquire`.
    pub fn release(&self, reservation: Instant) {
        if self.limit.is_none() {
            return;
        }
        let mut sent = self.sent.lock();
        if let Some(pos) = sent.iter().rposition(|t| *t == reservation) {
            sent.remove(pos);
        }
    }

    /// Sends counted in the current window.
    pub fn in_window(&self) -> usize {
        self.sent.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_and_window_expiry() {
        let rl = RateLimiter::with_window(Some(2), Duration::from_secs(10));
        let t0 = Instant::now();
        assert!(rl.try_acquire_at(t0).is_some());
        assert!(rl.try_acquire_at(t0 + Duration::from_secs(1)).is_some());
        assert!(rl.try_acquire_at(t0 + Duration::from_secs(2)).is_none());
        // first send ages out
        assert!(rl.try_acquire_at(t0 + Duration::from_secs(10)).is_some());
        assert_eq!(rl.in_window(), 2);
    }

    #[test]
    fn test_release_returns_slot() {
        let rl = RateLimiter::per_hour(Some(1));
        let r = rl.try_acquire().unwrap();
        assert!(rl.try_acquire().is_none());
        rl.release(r);
        assert!(rl.try_acquire().is_some());
    }

    #[test]
    fn test_unlimited_never_blocks() {
        let rl = RateLimiter::per_hour(None);
        for _ in 0..1000 {
            assert!(rl.try_acquire().is_some());
        }
        assert_eq!(rl.in_window(), 0);
    }
}
