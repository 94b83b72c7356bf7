//! Token bucket implementation.

use std::time::{Duration, Instant};

use crate::policy::Limit;

/// Tolerance applied when comparing token counts, absorbing the rounding
/// introduced by nanosecond time deltas.
const TOKEN_EPSILON: f64 = 1e-6;

/// A token bucket with fractional tokens.
///
/// The bucket starts full. Every acquisition first credits
/// `elapsed * refill_rate` tokens (capped at capacity), then takes one token
/// if at least one is available.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a full bucket for `limit`.
    pub fn new(limit: &Limit, now: Instant) -> Self {
        let capacity = limit.capacity();
        Self {
            capacity,
            tokens: capacity,
            refill_rate: limit.refill_rate(),
            last_refill: now,
        }
    }

    /// Adopt a changed limit, keeping the tokens already earned.
    pub fn reconfigure(&mut self, limit: &Limit) {
        let capacity = limit.capacity();
        let refill_rate = limit.refill_rate();
        if capacity != self.capacity || refill_rate != self.refill_rate {
            self.capacity = capacity;
            self.refill_rate = refill_rate;
            self.tokens = self.tokens.min(capacity);
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        if elapsed.is_zero() {
            return;
        }
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }

    /// Take one token.
    ///
    /// Returns the whole tokens left on success, or how long until a token
    /// becomes available.
    pub fn try_acquire(&mut self, now: Instant) -> Result<u64, Duration> {
        self.refill(now);

        if self.tokens + TOKEN_EPSILON >= 1.0 {
            self.tokens = (self.tokens - 1.0).max(0.0);
            Ok(self.whole_tokens())
        } else {
            let missing = 1.0 - self.tokens;
            Err(saturating_secs(missing / self.refill_rate))
        }
    }

    /// Tokens currently held, as of the last refill.
    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    fn whole_tokens(&self) -> u64 {
        (self.tokens + TOKEN_EPSILON).floor() as u64
    }

    /// Time until the bucket is full again, as of the last refill.
    pub fn time_to_full(&self) -> Duration {
        let missing = (self.capacity - self.tokens).max(0.0);
        saturating_secs(missing / self.refill_rate)
    }
}

/// Seconds to a `Duration`, clamping overflow to `Duration::MAX`.
fn saturating_secs(secs: f64) -> Duration {
    if secs.is_nan() || secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limit(requests: u64, window_secs: u64) -> Limit {
        Limit::new(requests, Duration::from_secs(window_secs))
    }

    #[test]
    fn test_fresh_bucket_admits_exactly_capacity() {
        for capacity in [1u64, 5, 17, 100] {
            let now = Instant::now();
            let mut bucket = TokenBucket::new(&limit(capacity, 60), now);

            let admitted = (0..capacity * 2)
                .filter(|_| bucket.try_acquire(now).is_ok())
                .count();
            assert_eq!(admitted as u64, capacity);
        }
    }

    #[test]
    fn test_extreme_limit_saturates_instead_of_panicking() {
        let now = Instant::now();
        // One request per ~500 billion years with a burst above it
        let huge = Limit::new(1, Duration::from_secs(u64::MAX / 2)).with_burst(3);
        let mut bucket = TokenBucket::new(&huge, now);

        for _ in 0..3 {
            assert!(bucket.try_acquire(now).is_ok());
            bucket.time_to_full();
        }
        let retry_after = bucket.try_acquire(now).unwrap_err();
        assert!(retry_after > Duration::from_secs(u64::MAX / 4));
        assert_eq!(bucket.time_to_full(), Duration::MAX);
    }

    #[test]
    fn test_raising_burst_saturates_time_to_full() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(&limit(1, 60), now);
        bucket.try_acquire(now).unwrap();

        bucket.reconfigure(&Limit::new(1, Duration::from_secs(u64::MAX / 2)).with_burst(u64::MAX));
        assert_eq!(bucket.time_to_full(), Duration::MAX);
        assert!(bucket.try_acquire(now).is_err());
    }

    #[test]
    fn test_burst_sets_capacity() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(&limit(2, 1).with_burst(6), now);

        let admitted = (0..10).filter(|_| bucket.try_acquire(now).is_ok()).count();
        assert_eq!(admitted, 6);
    }

    #[test]
    fn test_remaining_counts_down() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(&limit(3, 1), now);

        assert_eq!(bucket.try_acquire(now), Ok(2));
        assert_eq!(bucket.try_acquire(now), Ok(1));
        assert_eq!(bucket.try_acquire(now), Ok(0));
        assert!(bucket.try_acquire(now).is_err());
    }

    #[test]
    fn test_retry_after_matches_refill_rate() {
        let now = Instant::now();
        // 5 per 10s refills one token every 2s
        let mut bucket = TokenBucket::new(&limit(5, 10), now);
        for _ in 0..5 {
            bucket.try_acquire(now).unwrap();
        }

        let retry_after = bucket.try_acquire(now).unwrap_err();
        assert_eq!(retry_after, Duration::from_secs(2));
    }

    #[test]
    fn test_waiting_one_interval_restores_one_token() {
        let start = Instant::now();
        // 10 per second, one token every 100ms
        let mut bucket = TokenBucket::new(&limit(10, 1), start);
        for _ in 0..10 {
            bucket.try_acquire(start).unwrap();
        }

        let mut now = start;
        for _ in 0..20 {
            now += Duration::from_millis(100);
            assert!(bucket.try_acquire(now).is_ok(), "one token after one interval");
            assert!(bucket.try_acquire(now).is_err(), "but only one");
        }
    }

    #[test]
    fn test_non_integral_interval_restores_one_token() {
        let start = Instant::now();
        // 3 per second, one token every 333.33ms
        let mut bucket = TokenBucket::new(&limit(3, 1), start);
        for _ in 0..3 {
            bucket.try_acquire(start).unwrap();
        }

        let interval = Duration::from_secs_f64(1.0 / 3.0);
        let mut now = start;
        for _ in 0..30 {
            now += interval;
            assert!(bucket.try_acquire(now).is_ok());
            assert!(bucket.try_acquire(now).is_err());
        }
    }

    #[test]
    fn test_refill_is_capped_at_capacity() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(&limit(4, 1), start);
        for _ in 0..4 {
            bucket.try_acquire(start).unwrap();
        }

        let later = start + Duration::from_secs(3600);
        let admitted = (0..10).filter(|_| bucket.try_acquire(later).is_ok()).count();
        assert_eq!(admitted, 4);
    }

    #[test]
    fn test_fractional_tokens_accumulate() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(&limit(1, 1), start);
        bucket.try_acquire(start).unwrap();

        // Four quarter-second steps add up to one token
        let mut now = start;
        for _ in 0..3 {
            now += Duration::from_millis(250);
            assert!(bucket.try_acquire(now).is_err());
        }
        now += Duration::from_millis(250);
        assert!(bucket.try_acquire(now).is_ok());
    }

    #[test]
    fn test_reconfigure_clamps_tokens() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(&limit(10, 1), now);
        assert_eq!(bucket.tokens(), 10.0);

        bucket.reconfigure(&limit(3, 1));
        assert_eq!(bucket.capacity(), 3.0);
        assert_eq!(bucket.tokens(), 3.0);

        bucket.reconfigure(&limit(50, 1));
        assert_eq!(bucket.capacity(), 50.0);
        assert_eq!(bucket.tokens(), 3.0);
    }

    #[test]
    fn test_time_to_full() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(&limit(5, 10), now);
        assert_eq!(bucket.time_to_full(), Duration::ZERO);

        bucket.try_acquire(now).unwrap();
        bucket.try_acquire(now).unwrap();
        assert_eq!(bucket.time_to_full(), Duration::from_secs(4));
    }
}
