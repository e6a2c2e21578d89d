//! Token bucket that caps a producer's send rate.
//!
//! Tokens are messages; they refill at `max_rate` per second up to one
//! second of burst. [`SendRateLimiter::limit`] blocks the sending thread
//! until a token is available.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

struct Bucket {
    /// Available tokens scaled by 1000 for sub-token precision.
    tokens_milli: u64,
    last_refill: Instant,
}

pub struct SendRateLimiter {
    rate_per_sec: u64,
    burst: u64,
    bucket: Mutex<Bucket>,
    total_acquired: AtomicU64,
    total_wait_us: AtomicU64,
}

impl SendRateLimiter {
    /// `None` for a non-positive rate (`-1` means unlimited).
    pub fn for_max_rate(max_rate: i32) -> Option<Self> {
        if max_rate <= 0 {
            return None;
        }
        Some(Self::new(max_rate as u64))
    }

    pub fn new(rate_per_sec: u64) -> Self {
        let burst = rate_per_sec.max(1);
        Self {
            rate_per_sec,
            burst,
            bucket: Mutex::new(Bucket {
                tokens_milli: burst * 1000,
                last_refill: Instant::now(),
            }),
            total_acquired: AtomicU64::new(0),
            total_wait_us: AtomicU64::new(0),
        }
    }

    pub fn rate_per_sec(&self) -> u64 {
        self.rate_per_sec
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed_us = now.duration_since(bucket.last_refill).as_micros() as u64;
        if elapsed_us == 0 {
            return;
        }
        let new_tokens_milli = (self.rate_per_sec * elapsed_us) / 1000;
        bucket.tokens_milli = (bucket.tokens_milli + new_tokens_milli).min(self.burst * 1000);
        bucket.last_refill = now;
    }

    /// Take one token if available.
    pub fn try_acquire(&self) -> bool {
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket);
        if bucket.tokens_milli >= 1000 {
            bucket.tokens_milli -= 1000;
            self.total_acquired.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Block until one token is available. Returns the time spent waiting.
    pub fn limit(&self) -> Duration {
        let start = Instant::now();
        // One token takes 1000/rate ms to refill.
        let pause_ms = (1000 / self.rate_per_sec.max(1)).clamp(1, 100);
        while !self.try_acquire() {
            std::thread::sleep(Duration::from_millis(pause_ms));
        }
        let waited = start.elapsed();
        self.total_wait_us
            .fetch_add(waited.as_micros() as u64, Ordering::Relaxed);
        waited
    }

    pub fn available_tokens(&self) -> u64 {
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket);
        bucket.tokens_milli / 1000
    }

    pub fn total_acquired(&self) -> u64 {
        self.total_acquired.load(Ordering::Relaxed)
    }

    pub fn total_wait_us(&self) -> u64 {
        self.total_wait_us.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for SendRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendRateLimiter")
            .field("rate_per_sec", &self.rate_per_sec)
            .field("burst", &self.burst)
            .finish()
    }
}
