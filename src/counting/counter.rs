//! Fixed window counter implementation.

use parking_lot::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct WindowState {
    count: u64,
    started: Instant,
}

/// A counter that tracks hits within a fixed time window.
///
/// The count drops back to zero on the first increment after the window has
/// elapsed. Reset and increment happen under one lock so no hits are lost
/// across a window boundary.
#[derive(Debug)]
pub struct FixedWindowCounter {
    window: Duration,
    state: Mutex<WindowState>,
}

impl FixedWindowCounter {
    /// Create a new counter whose window starts now.
    pub fn new(window: Duration) -> Self {
        Self::starting_at(window, Instant::now())
    }

    pub fn starting_at(window: Duration, now: Instant) -> Self {
        Self {
            window,
            state: Mutex::new(WindowState {
                count: 0,
                started: now,
            }),
        }
    }

    /// Add `hits` and return the new count and the time until the window resets.
    pub fn increment(&self, hits: u64) -> (u64, Duration) {
        self.increment_at(hits, Instant::now())
    }

    pub fn increment_at(&self, hits: u64, now: Instant) -> (u64, Duration) {
        let mut state = self.state.lock();
        self.maybe_reset(&mut state, now);

        state.count = state.count.saturating_add(hits);
        (state.count, self.remaining_in_window(&state, now))
    }

    /// Get the current count.
    pub fn current_count(&self) -> u64 {
        let mut state = self.state.lock();
        self.maybe_reset(&mut state, Instant::now());
        state.count
    }

    /// Get the time window for this counter.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Whether the current window is over, so the counter holds no live hits.
    pub fn is_expired_at(&self, now: Instant) -> bool {
        let state = self.state.lock();
        now.saturating_duration_since(state.started) >= self.window
    }

    fn maybe_reset(&self, state: &mut WindowState, now: Instant) {
        if self.window.is_zero() {
            state.count = 0;
            state.started = now;
            return;
        }
        let elapsed = now.saturating_duration_since(state.started);
        if elapsed >= self.window {
            // Align to the window grid so bursts at a boundary stay bounded
            let windows = elapsed.as_nanos() / self.window.as_nanos();
            let advance = self.window.as_nanos() * windows;
            state.started += Duration::from_nanos(advance as u64);
            state.count = 0;
        }
    }

    fn remaining_in_window(&self, state: &WindowState, now: Instant) -> Duration {
        let elapsed = now.saturating_duration_since(state.started);
        self.window.saturating_sub(elapsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_increments() {
        let counter = FixedWindowCounter::new(Duration::from_secs(60));

        assert_eq!(counter.increment(1).0, 1);
        assert_eq!(counter.increment(4).0, 5);
        assert_eq!(counter.current_count(), 5);
    }

    #[test]
    fn test_counter_resets_after_window() {
        let start = Instant::now();
        let counter = FixedWindowCounter::starting_at(Duration::from_secs(10), start);

        counter.increment_at(7, start);
        let (count, reset) = counter.increment_at(1, start + Duration::from_secs(4));
        assert_eq!(count, 8);
        assert_eq!(reset, Duration::from_secs(6));

        let (count, reset) = counter.increment_at(1, start + Duration::from_secs(12));
        assert_eq!(count, 1);
        assert_eq!(reset, Duration::from_secs(8));
    }

    #[test]
    fn test_expiry() {
        let start = Instant::now();
        let counter = FixedWindowCounter::starting_at(Duration::from_secs(1), start);
        counter.increment_at(1, start);

        assert!(!counter.is_expired_at(start + Duration::from_millis(500)));
        assert!(counter.is_expired_at(start + Duration::from_secs(1)));
    }
}
