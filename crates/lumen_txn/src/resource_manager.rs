//! Broker-side XA resource manager: the registry of live transactions keyed
//! by Xid, heuristic completion records, and the timeout sweep.
//!
//! # Invariants
//! - At most one transaction per Xid; registration is put-if-absent.
//! - A timed-out transaction is removed before it is rolled back, and only
//!   the sweep that removed it rolls it back.
//! - One failing rollback never stops the sweep.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;

use lumen_common::config::ResourceManagerConfig;
use lumen_common::error::{LumenError, LumenResult};
use lumen_common::types::Xid;

use crate::reaper::TimeoutReaper;
use crate::transaction::{TxState, Transaction};

/// A transaction whose outcome was forced without normal completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeuristicCompletion {
    /// Id of the persistent record holding the decision.
    pub record_id: u64,
    pub xid: Xid,
    pub is_commit: bool,
}

/// Result of one timeout sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    /// Live transactions looked at.
    pub scanned: usize,
    /// Removed and rolled back (or attempted).
    pub timed_out: Vec<Xid>,
    /// Timed-out transactions whose rollback failed, with the error.
    pub failed_rollbacks: Vec<(Xid, String)>,
}

pub struct ResourceManager {
    transactions: DashMap<Xid, Arc<dyn Transaction>>,
    heuristics: Mutex<Vec<HeuristicCompletion>>,
    default_timeout_secs: u64,
    scan_period: Duration,
    started: AtomicBool,
    reaper: Mutex<Option<TimeoutReaper>>,
}

impl ResourceManager {
    pub fn new(config: &ResourceManagerConfig) -> Arc<Self> {
        Arc::new(Self {
            transactions: DashMap::new(),
            heuristics: Mutex::new(Vec::new()),
            default_timeout_secs: config.default_timeout_secs,
            scan_period: Duration::from_millis(config.scan_period_ms),
            started: AtomicBool::new(false),
            reaper: Mutex::new(None),
        })
    }

    // ── Lifecycle ──

    /// Start the timeout reaper. Idempotent.
    pub fn start(self: &Arc<Self>) -> LumenResult<()> {
        let mut reaper = self.reaper.lock();
        if reaper.is_some() {
            return Ok(());
        }
        let handle = TimeoutReaper::start(Arc::downgrade(self), self.scan_period)
            .map_err(|e| LumenError::internal(format!("failed to spawn timeout reaper: {}", e)))?;
        *reaper = Some(handle);
        self.started.store(true, Ordering::Release);
        tracing::info!(
            default_timeout_secs = self.default_timeout_secs,
            scan_period_ms = self.scan_period.as_millis() as u64,
            "resource manager started"
        );
        Ok(())
    }

    /// Cancel the reaper and wait for an in-flight sweep. Idempotent.
    pub fn stop(&self) {
        let reaper = self.reaper.lock().take();
        if let Some(mut reaper) = reaper {
            reaper.stop();
            self.started.store(false, Ordering::Release);
            tracing::info!("resource manager stopped");
        }
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn default_timeout_secs(&self) -> u64 {
        self.default_timeout_secs
    }

    // ── Registry ──

    pub fn get_transaction(&self, xid: &Xid) -> Option<Arc<dyn Transaction>> {
        self.transactions.get(xid).map(|e| e.value().clone())
    }

    /// Register `tx` under `xid`. Returns `false`, keeping the existing
    /// entry, if the Xid is already registered.
    pub fn put_transaction(&self, xid: Xid, tx: Arc<dyn Transaction>) -> bool {
        match self.transactions.entry(xid) {
            Entry::Occupied(e) => {
                tracing::debug!(xid = %e.key(), "duplicate transaction registration rejected");
                false
            }
            Entry::Vacant(e) => {
                e.insert(tx);
                true
            }
        }
    }

    pub fn remove_transaction(&self, xid: &Xid) -> Option<Arc<dyn Transaction>> {
        self.transactions.remove(xid).map(|(_, tx)| tx)
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    pub fn prepared_transactions(&self) -> Vec<Xid> {
        self.transactions
            .iter()
            .filter(|e| e.value().state() == TxState::Prepared)
            .map(|e| e.key().clone())
            .collect()
    }

    /// Every live Xid with its creation time (ms since the Unix epoch).
    pub fn transactions_with_creation_time(&self) -> HashMap<Xid, u64> {
        self.transactions
            .iter()
            .map(|e| (e.key().clone(), e.value().create_time_ms()))
            .collect()
    }

    // ── Heuristic completions ──

    pub fn put_heuristic_completion(&self, record_id: u64, xid: Xid, is_commit: bool) {
        tracing::info!(xid = %xid, record_id, is_commit, "heuristic completion recorded");
        self.heuristics.lock().push(HeuristicCompletion {
            record_id,
            xid,
            is_commit,
        });
        lumen_observability::record_heuristic_completion(is_commit);
    }

    pub fn heuristic_committed_transactions(&self) -> Vec<Xid> {
        self.heuristic_completed(true)
    }

    pub fn heuristic_rolled_back_transactions(&self) -> Vec<Xid> {
        self.heuristic_completed(false)
    }

    fn heuristic_completed(&self, is_commit: bool) -> Vec<Xid> {
        self.heuristics
            .lock()
            .iter()
            .filter(|h| h.is_commit == is_commit)
            .map(|h| h.xid.clone())
            .collect()
    }

    /// Remove the first record for `xid` and return its record id.
    pub fn remove_heuristic_completion(&self, xid: &Xid) -> Option<u64> {
        let mut heuristics = self.heuristics.lock();
        let pos = heuristics.iter().position(|h| &h.xid == xid)?;
        Some(heuristics.remove(pos).record_id)
    }

    // ── Timeout sweep ──

    /// Remove and roll back every live transaction that has timed out at
    /// `now_ms`.
    pub fn reap_timed_out(&self, now_ms: u64) -> ReapReport {
        // Snapshot first; shard locks must not be held while removing.
        let live: Vec<Arc<dyn Transaction>> =
            self.transactions.iter().map(|e| e.value().clone()).collect();

        let mut report = ReapReport {
            scanned: live.len(),
            ..ReapReport::default()
        };
        let mut evicted = Vec::new();
        for tx in live {
            if !tx.has_timed_out(now_ms, self.default_timeout_secs) {
                continue;
            }
            // Skip if it was completed or replaced since the snapshot.
            let removed = self
                .transactions
                .remove_if(tx.xid(), |_, current| same_transaction(current, &tx));
            if removed.is_some() {
                tracing::warn!(xid = %tx.xid(), "transaction timed out, rolling back");
                evicted.push(tx);
            }
        }

        for tx in evicted {
            let xid = tx.xid().clone();
            if let Err(e) = tx.rollback() {
                tracing::error!(xid = %xid, error = %e, "error rolling back timed out transaction");
                report.failed_rollbacks.push((xid.clone(), e.to_string()));
            }
            report.timed_out.push(xid);
        }

        lumen_observability::record_reaper_sweep(
            report.scanned,
            report.timed_out.len(),
            report.failed_rollbacks.len(),
        );
        if !report.timed_out.is_empty() {
            tracing::debug!(
                scanned = report.scanned,
                timed_out = report.timed_out.len(),
                failed = report.failed_rollbacks.len(),
                "timeout sweep finished"
            );
        }
        report
    }
}

fn same_transaction(a: &Arc<dyn Transaction>, b: &Arc<dyn Transaction>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

impl Drop for ResourceManager {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for ResourceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceManager")
            .field("transactions", &self.transactions.len())
            .field("default_timeout_secs", &self.default_timeout_secs)
            .field("started", &self.is_started())
            .finish()
    }
}
