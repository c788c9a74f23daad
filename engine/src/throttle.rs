//! Shared bandwidth throttle.
//!
//! A token bucket filled at the configured byte rate. Callers reserve the
//! bytes they are about to move; the bucket may go into debt, and each
//! caller sleeps off its own share of the debt outside the lock. Admission
//! is therefore FIFO by reservation and the aggregate rate over any window
//! is bounded by `rate * window + burst`.

use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

/// Fraction of one second's worth of tokens the bucket may hold.
const BURST_SECONDS: f64 = 0.1;

#[derive(Debug)]
struct Bucket {
    /// Bytes per second; 0 disables throttling
    rate: u64,
    /// Tokens currently available; negative while in debt
    available: f64,
    last_refill: Instant,
}

impl Bucket {
    fn burst(&self) -> f64 {
        self.rate as f64 * BURST_SECONDS
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.available = (self.available + elapsed * self.rate as f64).min(self.burst());
        self.last_refill = now;
    }
}

#[derive(Debug)]
pub struct Throttle {
    bucket: Mutex<Bucket>,
}

impl Throttle {
    /// Create a throttle admitting `bytes_per_sec`; 0 means unlimited.
    pub fn new(bytes_per_sec: u64) -> Self {
        let bucket = Bucket {
            rate: bytes_per_sec,
            available: 0.0,
            last_refill: Instant::now(),
        };
        let available = bucket.burst();
        Throttle {
            bucket: Mutex::new(Bucket { available, ..bucket }),
        }
    }

    pub fn unlimited() -> Self {
        Throttle::new(0)
    }

    pub fn rate(&self) -> u64 {
        self.bucket.lock().unwrap_or_else(PoisonError::into_inner).rate
    }

    pub fn is_limited(&self) -> bool {
        self.rate() > 0
    }

    /// Change the rate. Outstanding debt is kept so a lowered limit takes
    /// effect immediately.
    pub fn set_rate(&self, bytes_per_sec: u64) {
        let mut bucket = self.bucket.lock().unwrap_or_else(PoisonError::into_inner);
        bucket.refill(Instant::now());
        bucket.rate = bytes_per_sec;
        let burst = bucket.burst();
        bucket.available = bucket.available.min(burst);
    }

    /// Reserve `bytes` and return how long the caller must wait before
    /// moving them.
    pub fn reserve(&self, bytes: u64) -> Duration {
        let mut bucket = self.bucket.lock().unwrap_or_else(PoisonError::into_inner);
        if bucket.rate == 0 {
            return Duration::ZERO;
        }
        bucket.refill(Instant::now());
        bucket.available -= bytes as f64;
        if bucket.available >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-bucket.available / bucket.rate as f64)
        }
    }

    /// Reserve `bytes` and block until they may be moved.
    pub fn acquire(&self, bytes: u64) {
        let wait = self.reserve(bytes);
        if !wait.is_zero() {
            thread::sleep(wait);
        }
    }
}

impl Default for Throttle {
    fn default() -> Self {
        Throttle::unlimited()
    }
}
