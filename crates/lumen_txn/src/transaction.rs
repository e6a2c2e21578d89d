//! Broker-side transaction abstraction.
//!
//! The broker's transaction engine supplies [`Transaction`] implementations;
//! the resource manager only needs state, creation time, a timeout check and
//! rollback. [`LocalTransaction`] is the in-process implementation.
//!
//! State machine:
//! ```text
//!   Active ──prepare──► Prepared ──commit──► Committed
//!     │                    │
//!     ├──rollback──────────┴──rollback──► RolledBack
//!     ├──commit (one phase)─────────────► Committed
//!     └──heuristic─────────┬────────────► Heuristic
//!                  Prepared┘
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

use lumen_common::error::{LumenResult, TxnError};
use lumen_common::types::Xid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxState {
    Active,
    Prepared,
    Committed,
    RolledBack,
    /// Outcome forced without normal two-phase completion.
    Heuristic,
}

impl TxState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TxState::Committed | TxState::RolledBack | TxState::Heuristic)
    }
}

impl fmt::Display for TxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TxState::Active => "ACTIVE",
            TxState::Prepared => "PREPARED",
            TxState::Committed => "COMMITTED",
            TxState::RolledBack => "ROLLED_BACK",
            TxState::Heuristic => "HEURISTIC",
        };
        f.write_str(s)
    }
}

/// What the resource manager needs from a broker transaction.
pub trait Transaction: Send + Sync {
    fn xid(&self) -> &Xid;
    fn state(&self) -> TxState;
    /// Wall-clock creation time in milliseconds since the Unix epoch.
    fn create_time_ms(&self) -> u64;
    /// Whether the transaction has outlived its own timeout, or
    /// `default_timeout_secs` when it has none.
    fn has_timed_out(&self, now_ms: u64, default_timeout_secs: u64) -> bool;
    fn rollback(&self) -> LumenResult<()>;
}

/// `true` once more than `timeout_secs` have passed since `created_ms`.
pub fn elapsed_beyond(created_ms: u64, now_ms: u64, timeout_secs: u64) -> bool {
    now_ms.saturating_sub(created_ms) > timeout_secs.saturating_mul(1000)
}

pub struct LocalTransaction {
    xid: Xid,
    create_time_ms: u64,
    timeout_secs: Option<u64>,
    state: Mutex<TxState>,
    rollbacks: AtomicU32,
}

impl LocalTransaction {
    pub fn new(xid: Xid, create_time_ms: u64) -> Self {
        Self {
            xid,
            create_time_ms,
            timeout_secs: None,
            state: Mutex::new(TxState::Active),
            rollbacks: AtomicU32::new(0),
        }
    }

    /// Use `timeout_secs` instead of the resource manager default.
    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = Some(timeout_secs);
        self
    }

    pub fn timeout_secs(&self) -> Option<u64> {
        self.timeout_secs
    }

    /// Times `rollback` has succeeded.
    pub fn rollback_count(&self) -> u32 {
        self.rollbacks.load(Ordering::Acquire)
    }

    fn transition(&self, allowed: &[TxState], to: TxState) -> LumenResult<()> {
        let mut state = self.state.lock();
        if !allowed.contains(&state) {
            return Err(TxnError::InvalidTransition {
                xid: self.xid.clone(),
                from: state.to_string(),
                to: to.to_string(),
            }
            .into());
        }
        tracing::trace!(xid = %self.xid, from = %*state, to = %to, "transaction state change");
        *state = to;
        Ok(())
    }

    pub fn prepare(&self) -> LumenResult<()> {
        self.transition(&[TxState::Active], TxState::Prepared)
    }

    /// Commit a prepared transaction, or an active one in one phase.
    pub fn commit(&self, one_phase: bool) -> LumenResult<()> {
        if one_phase {
            self.transition(&[TxState::Active], TxState::Committed)
        } else {
            self.transition(&[TxState::Prepared], TxState::Committed)
        }
    }

    pub fn mark_heuristic(&self) -> LumenResult<()> {
        self.transition(&[TxState::Active, TxState::Prepared], TxState::Heuristic)
    }
}

impl Transaction for LocalTransaction {
    fn xid(&self) -> &Xid {
        &self.xid
    }

    fn state(&self) -> TxState {
        *self.state.lock()
    }

    fn create_time_ms(&self) -> u64 {
        self.create_time_ms
    }

    fn has_timed_out(&self, now_ms: u64, default_timeout_secs: u64) -> bool {
        if self.state().is_terminal() {
            return false;
        }
        let timeout = self.timeout_secs.unwrap_or(default_timeout_secs);
        elapsed_beyond(self.create_time_ms, now_ms, timeout)
    }

    fn rollback(&self) -> LumenResult<()> {
        self.transition(&[TxState::Active, TxState::Prepared], TxState::RolledBack)?;
        self.rollbacks.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

impl fmt::Debug for LocalTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTransaction")
            .field("xid", &self.xid)
            .field("state", &self.state())
            .field("create_time_ms", &self.create_time_ms)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}
