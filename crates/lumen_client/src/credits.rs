//! Producer credit flow control.
//!
//! Each destination address has one [`ProducerCredits`] holder per session,
//! shared by every producer sending there. A send must acquire credits equal
//! to the encoded message size before it is handed to the wire; the broker
//! grants credits asynchronously through
//! [`ProducerCreditManager::receive_credits`].
//!
//! Window semantics:
//! - `-1`: unbounded, credits are never requested and acquisition never blocks.
//! - `0`: disabled. One initial "start" credit is requested when the holder
//!   is created; acquisition never blocks.
//! - `> 0`: the holder keeps `available + arriving` topped up to the window
//!   and blocks senders (bounded by `max_wait`) while `available` is short.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use lumen_common::config::CreditConfig;
use lumen_common::error::FlowControlError;

/// Outbound half of the credit protocol: ask the broker for more.
pub trait CreditRequester: Send + Sync {
    fn request_credits(&self, address: &str, credits: u32);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreditMode {
    Unbounded,
    Disabled,
    Windowed(u32),
}

impl CreditMode {
    pub fn from_window(window_size: i32) -> Self {
        match window_size {
            w if w < 0 => CreditMode::Unbounded,
            0 => CreditMode::Disabled,
            w => CreditMode::Windowed(w as u32),
        }
    }
}

#[derive(Debug, Default)]
struct CreditState {
    /// Permits granted by the broker and not yet consumed.
    available: u64,
    /// Permits requested from the broker and not yet granted.
    arriving: u64,
    ref_count: u32,
    /// The broker answered with fail credits (address full, FAIL policy).
    fail_pending: bool,
    closed: bool,
    /// Bumped by every reset so blocked senders re-plan their request.
    epoch: u64,
    blocked: usize,
    total_acquired: u64,
    total_requested: u64,
    total_timeouts: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreditSnapshot {
    pub address: String,
    pub mode: CreditMode,
    pub available: u64,
    pub arriving: u64,
    pub ref_count: u32,
    pub blocked: usize,
    pub closed: bool,
    pub total_acquired: u64,
    pub total_requested: u64,
    pub total_timeouts: u64,
}

/// Send permits for one destination address.
pub struct ProducerCredits {
    address: String,
    mode: CreditMode,
    max_wait: Duration,
    requester: Option<Arc<dyn CreditRequester>>,
    state: Mutex<CreditState>,
    changed: Condvar,
}

impl ProducerCredits {
    pub fn new(
        address: impl Into<String>,
        window_size: i32,
        max_wait: Duration,
        requester: Arc<dyn CreditRequester>,
    ) -> Self {
        Self {
            address: address.into(),
            mode: CreditMode::from_window(window_size),
            max_wait,
            requester: Some(requester),
            state: Mutex::new(CreditState::default()),
            changed: Condvar::new(),
        }
    }

    /// Holder that never blocks and never talks to the broker.
    pub fn unbounded() -> Self {
        Self {
            address: String::new(),
            mode: CreditMode::Unbounded,
            max_wait: Duration::ZERO,
            requester: None,
            state: Mutex::new(CreditState::default()),
            changed: Condvar::new(),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn mode(&self) -> CreditMode {
        self.mode
    }

    /// Issue the initial request for a freshly created holder.
    pub fn init(&self) {
        let request = {
            let mut st = self.state.lock();
            match self.mode {
                CreditMode::Unbounded => None,
                CreditMode::Disabled => {
                    st.arriving += 1;
                    st.total_requested += 1;
                    Some(1)
                }
                CreditMode::Windowed(_) => self.plan_request(&mut st, 0),
            }
        };
        if let Some(credits) = request {
            self.send_request(credits);
        }
    }

    /// Top `available + arriving` up to `max(needed, window)`.
    fn plan_request(&self, st: &mut CreditState, needed: u64) -> Option<u32> {
        let CreditMode::Windowed(window) = self.mode else {
            return None;
        };
        let target = needed.max(window as u64);
        let have = st.available + st.arriving;
        if have >= target {
            return None;
        }
        let to_request = (target - have).min(u32::MAX as u64);
        st.arriving += to_request;
        st.total_requested += to_request;
        Some(to_request as u32)
    }

    fn send_request(&self, credits: u32) {
        if let Some(requester) = &self.requester {
            tracing::trace!(address = %self.address, credits, "requesting producer credits");
            requester.request_credits(&self.address, credits);
        }
    }

    /// Acquire `credits` permits, blocking up to the configured wait budget.
    ///
    /// Returns the time spent waiting. A reset while blocked re-issues the
    /// request against the new baseline; close wakes the waiter with
    /// [`FlowControlError::Closed`].
    pub fn acquire(&self, credits: u64) -> Result<Duration, FlowControlError> {
        if !matches!(self.mode, CreditMode::Windowed(_)) {
            if self.state.lock().closed {
                return Err(FlowControlError::Closed(self.address.clone()));
            }
            return Ok(Duration::ZERO);
        }

        let start = Instant::now();
        let deadline = start + self.max_wait;
        let mut waited_for_grant = false;
        let (mut seen_epoch, mut request) = {
            let mut st = self.state.lock();
            if st.closed {
                return Err(FlowControlError::Closed(self.address.clone()));
            }
            (st.epoch, self.plan_request(&mut st, credits))
        };

        loop {
            // Requests go out without the state lock held; the broker's
            // grant arrives on another thread and needs it.
            if let Some(c) = request.take() {
                self.send_request(c);
            }

            let mut st = self.state.lock();
            loop {
                if st.closed {
                    return Err(FlowControlError::Closed(self.address.clone()));
                }
                if st.available >= credits {
                    st.available -= credits;
                    st.total_acquired += credits;
                    if st.fail_pending {
                        st.fail_pending = false;
                        st.available = 0;
                        st.arriving = 0;
                        return Err(FlowControlError::AddressFull {
                            address: self.address.clone(),
                            credits,
                        });
                    }
                    let waited = start.elapsed();
                    if waited_for_grant {
                        lumen_observability::record_credit_wait(waited.as_micros() as u64, false);
                    }
                    return Ok(waited);
                }
                if st.epoch != seen_epoch {
                    seen_epoch = st.epoch;
                    request = self.plan_request(&mut st, credits);
                    break;
                }
                if Instant::now() >= deadline {
                    st.total_timeouts += 1;
                    let waited = start.elapsed();
                    tracing::warn!(
                        address = %self.address,
                        credits,
                        available = st.available,
                        waited_ms = waited.as_millis() as u64,
                        "out of credits on flow control"
                    );
                    lumen_observability::record_credit_wait(waited.as_micros() as u64, true);
                    return Err(FlowControlError::Timeout {
                        address: self.address.clone(),
                        waited_ms: waited.as_millis() as u64,
                        credits_needed: credits,
                    });
                }
                waited_for_grant = true;
                st.blocked += 1;
                let _ = self.changed.wait_until(&mut st, deadline);
                st.blocked -= 1;
            }
        }
    }

    /// Broker granted `credits` permits.
    pub fn receive_credits(&self, credits: u32) {
        let mut st = self.state.lock();
        st.arriving = st.arriving.saturating_sub(credits as u64);
        st.available = st.available.saturating_add(credits as u64);
        self.changed.notify_all();
    }

    /// Broker granted permits but reported the address as full. The next
    /// acquisition fails and drains what is left.
    pub fn receive_fail_credits(&self, credits: u32) {
        let mut st = self.state.lock();
        st.fail_pending = true;
        st.arriving = st.arriving.saturating_sub(credits as u64);
        st.available = st.available.saturating_add(credits as u64);
        self.changed.notify_all();
    }

    /// Forget every counter and request the configured window again.
    pub fn reset(&self) {
        let request = {
            let mut st = self.state.lock();
            if st.closed {
                return;
            }
            st.available = 0;
            st.arriving = 0;
            st.fail_pending = false;
            st.epoch += 1;
            let request = match self.mode {
                CreditMode::Windowed(_) => self.plan_request(&mut st, 0),
                _ => None,
            };
            self.changed.notify_all();
            request
        };
        if let Some(c) = request {
            self.send_request(c);
        }
    }

    /// Wake every blocked sender with an error. Idempotent.
    pub fn close(&self) {
        let mut st = self.state.lock();
        st.closed = true;
        self.changed.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn increment_ref_count(&self) -> u32 {
        let mut st = self.state.lock();
        st.ref_count += 1;
        st.ref_count
    }

    fn decrement_ref_count(&self) -> u32 {
        let mut st = self.state.lock();
        st.ref_count = st.ref_count.saturating_sub(1);
        st.ref_count
    }

    pub fn snapshot(&self) -> CreditSnapshot {
        let st = self.state.lock();
        CreditSnapshot {
            address: self.address.clone(),
            mode: self.mode,
            available: st.available,
            arriving: st.arriving,
            ref_count: st.ref_count,
            blocked: st.blocked,
            closed: st.closed,
            total_acquired: st.total_acquired,
            total_requested: st.total_requested,
            total_timeouts: st.total_timeouts,
        }
    }
}

impl std::fmt::Debug for ProducerCredits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProducerCredits")
            .field("address", &self.address)
            .field("mode", &self.mode)
            .finish()
    }
}

struct ManagerState {
    credits: HashMap<String, Arc<ProducerCredits>>,
    /// Addresses with no producer holding a reference, oldest first.
    unreferenced: VecDeque<String>,
    closed: bool,
}

/// Session-wide registry of per-address credit holders.
pub struct ProducerCreditManager {
    window_size: i32,
    max_wait: Duration,
    max_unreferenced: usize,
    requester: Arc<dyn CreditRequester>,
    unbounded: Arc<ProducerCredits>,
    inner: Mutex<ManagerState>,
}

impl ProducerCreditManager {
    pub fn new(window_size: i32, config: &CreditConfig, requester: Arc<dyn CreditRequester>) -> Self {
        Self {
            window_size,
            max_wait: Duration::from_millis(config.max_wait_ms),
            max_unreferenced: config.max_unreferenced_credits,
            requester,
            unbounded: Arc::new(ProducerCredits::unbounded()),
            inner: Mutex::new(ManagerState {
                credits: HashMap::new(),
                unreferenced: VecDeque::new(),
                closed: false,
            }),
        }
    }

    pub fn window_size(&self) -> i32 {
        self.window_size
    }

    /// Holder for `address`, created on first use.
    ///
    /// Named producers take a reference that must be returned with
    /// [`return_credits`](Self::return_credits). Anonymous producers look up
    /// a holder per message and do not hold a reference.
    pub fn get_credits(&self, address: &str, anonymous: bool) -> Arc<ProducerCredits> {
        if self.window_size == -1 {
            return self.unbounded.clone();
        }
        let (credits, created) = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return self.unbounded.clone();
            }
            let (credits, created) = match inner.credits.get(address) {
                Some(c) => (c.clone(), false),
                None => {
                    let c = Arc::new(ProducerCredits::new(
                        address,
                        self.window_size,
                        self.max_wait,
                        self.requester.clone(),
                    ));
                    inner.credits.insert(address.to_string(), c.clone());
                    (c, true)
                }
            };
            if anonymous {
                if created {
                    self.add_to_unreferenced(&mut inner, address);
                }
            } else if credits.increment_ref_count() == 1 {
                inner.unreferenced.retain(|a| a != address);
            }
            (credits, created)
        };
        if created {
            credits.init();
        }
        credits
    }

    /// A named producer released its reference to `address`.
    pub fn return_credits(&self, address: &str) {
        let mut inner = self.inner.lock();
        let Some(credits) = inner.credits.get(address).cloned() else {
            return;
        };
        if credits.decrement_ref_count() == 0 {
            self.add_to_unreferenced(&mut inner, address);
        }
    }

    fn add_to_unreferenced(&self, inner: &mut ManagerState, address: &str) {
        if !inner.unreferenced.iter().any(|a| a == address) {
            inner.unreferenced.push_back(address.to_string());
        }
        while inner.unreferenced.len() > self.max_unreferenced {
            let Some(oldest) = inner.unreferenced.pop_front() else {
                break;
            };
            if let Some(evicted) = inner.credits.remove(&oldest) {
                tracing::debug!(address = %oldest, "evicting unreferenced producer credits");
                evicted.close();
            }
        }
    }

    pub fn receive_credits(&self, address: &str, credits: u32) {
        let holder = self.inner.lock().credits.get(address).cloned();
        match holder {
            Some(h) => h.receive_credits(credits),
            None => tracing::trace!(address, credits, "credits for unknown address dropped"),
        }
    }

    pub fn receive_fail_credits(&self, address: &str, credits: u32) {
        let holder = self.inner.lock().credits.get(address).cloned();
        if let Some(h) = holder {
            h.receive_fail_credits(credits);
        }
    }

    /// Reset every holder after failover: the new broker knows nothing of the
    /// old counters.
    pub fn reset(&self) {
        let holders: Vec<Arc<ProducerCredits>> =
            self.inner.lock().credits.values().cloned().collect();
        for h in holders {
            h.reset();
        }
    }

    pub fn close(&self) {
        let holders: Vec<Arc<ProducerCredits>> = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            inner.unreferenced.clear();
            inner.credits.drain().map(|(_, c)| c).collect()
        };
        for h in holders {
            h.close();
        }
    }

    pub fn credits_for(&self, address: &str) -> Option<Arc<ProducerCredits>> {
        self.inner.lock().credits.get(address).cloned()
    }

    pub fn credits_count(&self) -> usize {
        self.inner.lock().credits.len()
    }

    pub fn unreferenced_count(&self) -> usize {
        self.inner.lock().unreferenced.len()
    }
}

/// Initial packet size growth: requests above the current size grow it to
/// 1.2x the request so later, slightly larger messages do not grow it again.
pub fn grown_packet_size(current: usize, requested: usize) -> usize {
    if requested > current {
        (requested as f64 * 1.2) as usize
    } else {
        current
    }
}
