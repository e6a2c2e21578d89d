//! State a session shares with its consumers, producers and XA bridge.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};

use parking_lot::RwLock;

use lumen_common::config::SessionConfig;
use lumen_common::error::{LumenError, LumenResult};

use crate::credits::grown_packet_size;
use crate::message::ClientMessage;

pub(crate) struct SessionShared {
    pub name: String,
    pub config: SessionConfig,
    pub closed: AtomicBool,
    pub in_close: AtomicBool,
    pub started: AtomicBool,
    pub rollback_only: AtomicBool,
    pub work_done: AtomicBool,
    concurrent_calls: AtomicI32,
    initial_packet_size: AtomicUsize,
    default_address: RwLock<Option<String>>,
}

impl SessionShared {
    pub fn new(name: String, config: SessionConfig) -> Self {
        let packet = config.initial_message_packet_size;
        Self {
            name,
            config,
            closed: AtomicBool::new(false),
            in_close: AtomicBool::new(false),
            started: AtomicBool::new(false),
            rollback_only: AtomicBool::new(false),
            work_done: AtomicBool::new(false),
            concurrent_calls: AtomicI32::new(0),
            initial_packet_size: AtomicUsize::new(packet),
            default_address: RwLock::new(None),
        }
    }

    /// Fails once close has begun.
    pub fn check_closed(&self) -> LumenResult<()> {
        if self.closed.load(Ordering::Acquire) || self.in_close.load(Ordering::Acquire) {
            return Err(LumenError::closed());
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn is_rollback_only(&self) -> bool {
        self.rollback_only.load(Ordering::Acquire)
    }

    pub fn set_rollback_only(&self, value: bool) {
        self.rollback_only.store(value, Ordering::Release);
    }

    pub fn mark_work_done(&self) {
        self.work_done.store(true, Ordering::Release);
    }

    pub fn clear_work_done(&self) {
        self.work_done.store(false, Ordering::Release);
    }

    pub fn is_work_done(&self) -> bool {
        self.work_done.load(Ordering::Acquire)
    }

    /// Register an in-flight wire call. A session is single-threaded by
    /// contract; a second concurrent caller is logged, not rejected.
    pub fn start_call(&self) -> CallGuard<'_> {
        let calls = self.concurrent_calls.fetch_add(1, Ordering::AcqRel) + 1;
        if calls > 1 {
            tracing::warn!(
                session = %self.name,
                concurrent_calls = calls,
                "session used by more than one thread at a time"
            );
        }
        CallGuard { shared: self }
    }

    pub fn concurrent_calls(&self) -> i32 {
        self.concurrent_calls.load(Ordering::Acquire)
    }

    pub fn initial_packet_size(&self) -> usize {
        self.initial_packet_size.load(Ordering::Acquire)
    }

    /// Grow the initial packet size to 1.2x `requested` if it is larger.
    pub fn set_packet_size(&self, requested: usize) {
        let _ = self
            .initial_packet_size
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                let grown = grown_packet_size(current, requested);
                (grown != current).then_some(grown)
            });
    }

    pub fn default_address(&self) -> Option<String> {
        self.default_address.read().clone()
    }

    /// Stamp `address` on the message unless it is the session default, in
    /// which case it is left off the wire. The first address seen becomes
    /// the default.
    pub fn set_address(&self, message: &mut ClientMessage, address: &str) {
        {
            let current = self.default_address.read();
            if let Some(default) = current.as_deref() {
                message.address = (default != address).then(|| address.to_string());
                return;
            }
        }
        let mut current = self.default_address.write();
        match current.as_deref() {
            Some(default) => {
                message.address = (default != address).then(|| address.to_string());
            }
            None => {
                *current = Some(address.to_string());
                message.address = Some(address.to_string());
            }
        }
    }
}

pub(crate) struct CallGuard<'a> {
    shared: &'a SessionShared,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.shared.concurrent_calls.fetch_sub(1, Ordering::AcqRel);
    }
}
