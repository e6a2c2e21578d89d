//! Background thread that sweeps timed-out transactions at a fixed period.

use std::sync::Weak;
use std::thread::JoinHandle;
use std::time::Duration;

use lumen_common::shutdown::ShutdownSignal;
use lumen_common::types::now_millis;

use crate::resource_manager::ResourceManager;

pub struct TimeoutReaper {
    signal: ShutdownSignal,
    handle: Option<JoinHandle<()>>,
}

impl TimeoutReaper {
    /// Spawn the reaper thread. It holds only a weak reference and exits on
    /// its own once the resource manager is gone.
    pub fn start(manager: Weak<ResourceManager>, period: Duration) -> Result<Self, std::io::Error> {
        let signal = ShutdownSignal::new();
        let signal_clone = signal.clone();

        let handle = std::thread::Builder::new()
            .name("lumen-tx-reaper".into())
            .spawn(move || {
                tracing::info!(period_ms = period.as_millis() as u64, "transaction reaper started");
                while !signal_clone.is_shutdown() {
                    if signal_clone.wait_timeout(period) {
                        break;
                    }
                    let Some(manager) = manager.upgrade() else {
                        break;
                    };
                    manager.reap_timed_out(now_millis());
                }
                tracing::info!("transaction reaper stopped");
            })
            .map_err(|e| {
                tracing::error!(
                    component = "tx-reaper",
                    error = %e,
                    "failed to spawn transaction reaper thread"
                );
                e
            })?;

        Ok(Self {
            signal,
            handle: Some(handle),
        })
    }

    /// Signal the reaper to stop and wait for an in-flight sweep.
    pub fn stop(&mut self) {
        self.signal.shutdown();
        if let Some(h) = self.handle.take() {
            // The last manager reference may be dropped on the reaper itself.
            if h.thread().id() == std::thread::current().id() {
                return;
            }
            let _ = h.join();
        }
    }
}

impl Drop for TimeoutReaper {
    fn drop(&mut self) {
        self.stop();
    }
}
