//! Ordered delivery executor.
//!
//! One named thread per session drains a `std::sync::mpsc` channel of jobs,
//! so message handlers for every consumer of a session run one at a time
//! and in submission order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{JoinHandle, ThreadId};
use std::time::Duration;

use parking_lot::Mutex;

use lumen_common::error::{LumenError, LumenResult};

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct DeliveryExecutor {
    name: String,
    tx: Mutex<Option<mpsc::Sender<Job>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
    executed: Arc<AtomicU64>,
}

impl DeliveryExecutor {
    pub fn spawn(name: impl Into<String>) -> LumenResult<Self> {
        let name = name.into();
        let (tx, rx) = mpsc::channel::<Job>();
        let executed = Arc::new(AtomicU64::new(0));
        let executed_clone = executed.clone();
        let thread_name = name.clone();

        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                for job in rx {
                    if std::panic::catch_unwind(std::panic::AssertUnwindSafe(job)).is_err() {
                        tracing::error!(executor = %thread_name, "delivery job panicked");
                    }
                    executed_clone.fetch_add(1, Ordering::Release);
                }
                tracing::debug!(executor = %thread_name, "delivery executor stopped");
            })
            .map_err(|e| {
                LumenError::internal(format!("failed to spawn delivery thread {}: {}", name, e))
            })?;

        Ok(Self {
            thread_id: handle.thread().id(),
            name,
            tx: Mutex::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
            executed,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue a job. Returns `false` once the executor has been shut down.
    pub fn execute<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        match self.tx.lock().as_ref() {
            Some(tx) => tx.send(Box::new(job)).is_ok(),
            None => false,
        }
    }

    pub fn is_current_thread(&self) -> bool {
        std::thread::current().id() == self.thread_id
    }

    /// Wait until every job queued before this call has run.
    ///
    /// Returns `false` on timeout. Called from a job it returns immediately,
    /// since waiting on itself could never finish.
    pub fn flush(&self, timeout: Duration) -> bool {
        if self.is_current_thread() {
            return true;
        }
        let (done_tx, done_rx) = mpsc::channel::<()>();
        if !self.execute(move || {
            let _ = done_tx.send(());
        }) {
            return true;
        }
        match done_rx.recv_timeout(timeout) {
            Ok(()) => true,
            Err(mpsc::RecvTimeoutError::Disconnected) => true,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                tracing::warn!(executor = %self.name, ?timeout, "timed out waiting for delivery to complete");
                false
            }
        }
    }

    /// Stop accepting jobs, let queued ones finish and join the thread.
    pub fn shutdown(&self) {
        drop(self.tx.lock().take());
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if self.is_current_thread() {
                // The thread exits on its own once this job returns.
                return;
            }
            if handle.join().is_err() {
                tracing::error!(executor = %self.name, "delivery thread panicked");
            }
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.tx.lock().is_none()
    }

    pub fn executed_count(&self) -> u64 {
        self.executed.load(Ordering::Acquire)
    }
}

impl Drop for DeliveryExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
