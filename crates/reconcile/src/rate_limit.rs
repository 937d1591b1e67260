//! Token bucket limiting how fast provider calls are started.

use std::thread;
use std::time::{Duration, Instant};

/// Token bucket refilled continuously at `rate` tokens per second.
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// A full bucket holding `capacity` tokens.
    pub fn new(capacity: u32, rate: f64) -> Self {
        let capacity = f64::from(capacity.max(1));
        Self {
            capacity,
            tokens: capacity,
            rate: rate.max(f64::MIN_POSITIVE),
            last_refill: Instant::now(),
        }
    }

    /// Allow `rate` operations per second with bursts of one second's worth.
    pub fn per_second(rate: f64) -> Self {
        let burst = rate.ceil().clamp(1.0, f64::from(u32::MAX));
        // burst is a positive whole number within u32 range
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        Self::new(burst as u32, rate)
    }

    /// Take a token if one is available.
    pub fn try_acquire(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Time until a token will be available. Saturates at [`Duration::MAX`]
    /// for rates too small to represent the wait.
    pub fn wait_time(&mut self) -> Duration {
        self.refill();
        if self.tokens >= 1.0 {
            Duration::ZERO
        } else {
            Duration::try_from_secs_f64((1.0 - self.tokens) / self.rate).unwrap_or(Duration::MAX)
        }
    }

    /// Take a token, sleeping until one is available.
    pub fn acquire(&mut self) {
        while !self.try_acquire() {
            thread::sleep(self.wait_time());
        }
    }

    pub fn available(&mut self) -> f64 {
        self.refill();
        self.tokens
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = elapsed.mul_add(self.rate, self.tokens).min(self.capacity);
        self.last_refill = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_then_limited() {
        let mut bucket = TokenBucket::new(3, 0.001);
        for _ in 0..3 {
            assert!(bucket.try_acquire());
        }
        assert!(!bucket.try_acquire());
        assert!(bucket.wait_time() > Duration::ZERO);
    }

    #[test]
    fn test_refill_over_time() {
        let mut bucket = TokenBucket::new(1, 200.0);
        assert!(bucket.try_acquire());
        thread::sleep(Duration::from_millis(20));
        assert!(bucket.try_acquire());
    }

    #[test]
    fn test_acquire_waits() {
        let mut bucket = TokenBucket::per_second(100.0);
        let start = Instant::now();
        for _ in 0..101 {
            bucket.acquire();
        }
        assert!(start.elapsed() >= Duration::from_millis(5));
    }

    #[test]
    fn test_zero_rate_wait_saturates() {
        let mut bucket = TokenBucket::per_second(0.0);
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
        assert_eq!(bucket.wait_time(), Duration::MAX);

        let mut bucket = TokenBucket::per_second(f64::NAN);
        assert!(bucket.try_acquire());
        assert_eq!(bucket.wait_time(), Duration::MAX);
    }

    #[test]
    fn test_per_second_burst_at_least_one() {
        let mut bucket = TokenBucket::per_second(0.5);
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
        assert!(bucket.available() < 1.0);
    }
}
