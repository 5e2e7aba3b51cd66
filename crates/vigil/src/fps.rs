//! Sliding-window frame rate measurement
//!
//! Tracks frame arrivals over a time window to compute the capture frame
//! rate written into the live-view header.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Measures frames per second over a sliding time window.
pub struct FpsTracker {
    samples: VecDeque<Instant>,
    window: Duration,
}

impl FpsTracker {
    /// Create a new tracker with the given measurement window.
    pub fn new(window: Duration) -> Self {
        Self {
            samples: VecDeque::new(),
            window,
        }
    }

    /// Record a frame arriving now.
    pub fn record(&mut self) {
        self.record_at(Instant::now());
    }

    /// Record a frame arriving at `now`.
    pub fn record_at(&mut self, now: Instant) {
        self.samples.push_back(now);
        self.prune(now);
    }

    /// Frames per second over the window.
    ///
    /// Returns 0.0 with fewer than 2 samples or a span under 100ms.
    pub fn fps(&self) -> f32 {
        let (Some(oldest), Some(newest)) = (self.samples.front(), self.samples.back()) else {
            return 0.0;
        };
        let elapsed = newest.duration_since(*oldest);
        if self.samples.len() < 2 || elapsed.as_millis() < 100 {
            return 0.0;
        }
        ((self.samples.len() - 1) as f64 / elapsed.as_secs_f64()) as f32
    }

    /// Forget every sample
    pub fn reset(&mut self) {
        self.samples.clear();
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&t) = self.samples.front() {
            if now.duration_since(t) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }
}
