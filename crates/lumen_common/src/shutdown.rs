//! Interruptible stop signal for periodic background tasks.
//!
//! A task sleeps between ticks with [`ShutdownSignal::wait_timeout`]; calling
//! [`ShutdownSignal::shutdown`] wakes it immediately so owners can join the
//! thread without waiting out a full period.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

#[derive(Clone)]
pub struct ShutdownSignal {
    inner: Arc<ShutdownInner>,
}

struct ShutdownInner {
    flag: AtomicBool,
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ShutdownInner {
                flag: AtomicBool::new(false),
                mutex: Mutex::new(()),
                condvar: Condvar::new(),
            }),
        }
    }

    /// Signal shutdown and wake every waiter.
    pub fn shutdown(&self) {
        // Taking the mutex orders the store before any waiter's re-check.
        let _guard = self.inner.mutex.lock();
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.condvar.notify_all();
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Sleep for at most `duration`. Returns `true` if shutdown was requested.
    pub fn wait_timeout(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut guard = self.inner.mutex.lock();
        while !self.is_shutdown() {
            if self.inner.condvar.wait_until(&mut guard, deadline).timed_out() {
                break;
            }
        }
        self.is_shutdown()
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownSignal")
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_starts_clear() {
        assert!(!ShutdownSignal::new().is_shutdown());
    }

    #[test]
    fn test_wait_returns_immediately_after_shutdown() {
        let sig = ShutdownSignal::new();
        sig.shutdown();
        let start = Instant::now();
        assert!(sig.wait_timeout(Duration::from_secs(10)));
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn test_shutdown_wakes_waiter() {
        let sig = ShutdownSignal::new();
        let sig2 = sig.clone();
        let handle = std::thread::spawn(move || {
            let start = Instant::now();
            (sig2.wait_timeout(Duration::from_secs(10)), start.elapsed())
        });
        std::thread::sleep(Duration::from_millis(20));
        sig.shutdown();
        let (stopped, elapsed) = handle.join().unwrap();
        assert!(stopped);
        assert!(elapsed < Duration::from_secs(1), "took {:?}", elapsed);
    }

    #[test]
    fn test_wait_expires_normally() {
        let sig = ShutdownSignal::new();
        let start = Instant::now();
        assert!(!sig.wait_timeout(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(15));
    }
}
