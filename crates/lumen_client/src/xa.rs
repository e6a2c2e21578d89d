//! XA transaction bridge.
//!
//! [`XaSession`] exposes an XA session through the two-phase-commit contract
//! of [`XaResource`]. Transport failures are reinterpreted per operation:
//! `start` and `prepare` retry once after an "unblocked" failure, `prepare`
//! then rolls back and reports XA_RBOTHER, `commit` always asks the
//! transaction manager to retry, and everything else becomes XAER_RMERR.
//! Codes the broker reports itself are passed through unchanged.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use lumen_common::error::{LumenError, LumenResult, SessionError, TransportError, XaError};
use lumen_common::types::{xa_flag_name, Xid, TMSTARTRSCAN};

use crate::remote::PrepareVote;
use crate::session::ClientSession;

/// Who a resource talks to, for [`XaResource::is_same_rm`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceIdentity {
    pub live_node_id: Option<String>,
    pub factory_id: Option<u64>,
}

/// The two-phase-commit contract offered to a transaction manager.
pub trait XaResource: Send + Sync {
    fn start(&self, xid: &Xid, flags: i32) -> LumenResult<()>;
    fn end(&self, xid: &Xid, flags: i32) -> LumenResult<()>;
    fn prepare(&self, xid: &Xid) -> LumenResult<PrepareVote>;
    fn commit(&self, xid: &Xid, one_phase: bool) -> LumenResult<()>;
    fn rollback(&self, xid: &Xid) -> LumenResult<()>;
    fn forget(&self, xid: &Xid) -> LumenResult<()>;
    fn recover(&self, flags: i32) -> LumenResult<Vec<Xid>>;
    fn transaction_timeout(&self) -> LumenResult<u32>;
    fn set_transaction_timeout(&self, seconds: u32) -> LumenResult<bool>;
    fn is_same_rm(&self, other: &dyn XaResource) -> LumenResult<bool>;

    /// The broker this resource is bound to. Session-backed resources
    /// report it; wrappers should delegate to the resource they wrap.
    fn resource_identity(&self) -> Option<ResourceIdentity> {
        None
    }
}

/// Broker-reported XA codes pass through; anything else is a resource error.
fn from_transport(e: TransportError, context: &str) -> XaError {
    match e.xa_code() {
        Some(code) => XaError::new(code, e.message.clone()).with_cause(e),
        None => XaError::resource_error(context.to_string()).with_cause(e),
    }
}

fn from_lumen(e: LumenError, context: &str) -> XaError {
    match e {
        LumenError::Xa(x) => x,
        LumenError::Transport(t) => from_transport(t, context),
        other => XaError::resource_error(format!("{}: {}", context, other)),
    }
}

fn observe<T>(op: &str, result: Result<T, XaError>) -> LumenResult<T> {
    match &result {
        Ok(_) => lumen_observability::record_xa_call(op, "ok"),
        Err(e) => {
            tracing::debug!(op, code = %e.code, message = %e.message, "xa call failed");
            lumen_observability::record_xa_call(op, &e.code.to_string());
        }
    }
    result.map_err(LumenError::from)
}

pub struct XaSession {
    session: Arc<ClientSession>,
    force_not_same_rm: AtomicBool,
}

impl XaSession {
    pub fn new(session: Arc<ClientSession>) -> Self {
        Self {
            session,
            force_not_same_rm: AtomicBool::new(false),
        }
    }

    pub fn session(&self) -> &Arc<ClientSession> {
        &self.session
    }

    /// Make `is_same_rm` always answer `false`.
    pub fn set_force_not_same_rm(&self, force: bool) {
        self.force_not_same_rm.store(force, Ordering::Release);
    }

    fn check_xa(&self) -> LumenResult<()> {
        if !self.session.is_xa() {
            tracing::warn!(session = %self.session.name(), "XA operation on a non-XA session");
            return Err(SessionError::NotXa(self.session.name().to_string()).into());
        }
        Ok(())
    }

    fn start_inner(&self, xid: &Xid, flags: i32) -> Result<(), XaError> {
        let remote = self.session.remote();
        match remote.xa_start(xid, flags) {
            Ok(()) => Ok(()),
            Err(e) if e.xa_code().is_some() => Err(from_transport(e, "xa start")),
            Err(e) if e.is_unblocked() => {
                // No work can have happened under the branch yet.
                tracing::debug!(xid = %xid, "xa start unblocked by failover, retrying");
                remote
                    .xa_start(xid, flags)
                    .map_err(|e| from_transport(e, "xa start failed after failover"))
            }
            Err(e) => Err(from_transport(e, "xa start")),
        }
    }

    fn end_inner(&self, xid: &Xid, flags: i32) -> Result<(), XaError> {
        let shared = self.session.shared();
        if shared.is_rollback_only() {
            if let Err(e) = self.session.rollback_with(false) {
                tracing::debug!(xid = %xid, error = %e, "error on rollback during end");
            }
            return Err(XaError::rollback_other(
                "session was rolled back after failover",
            ));
        }
        self.session
            .flush_acks()
            .map_err(|e| from_lumen(e, "flushing acks before xa end"))?;
        let _call = shared.start_call();
        self.session
            .remote()
            .xa_end(xid, flags)
            .map_err(|e| {
                tracing::warn!(xid = %xid, error = %e, "error calling xa end");
                from_transport(e, "xa end")
            })
    }

    fn prepare_inner(&self, xid: &Xid) -> Result<PrepareVote, XaError> {
        let shared = self.session.shared();
        if shared.is_rollback_only() {
            return Err(XaError::rollback_other(
                "session was rolled back after failover",
            ));
        }
        let remote = self.session.remote();
        let first = {
            let _call = shared.start_call();
            remote.xa_prepare(xid)
        };
        let cause = match first {
            Ok(vote) => return Ok(vote),
            Err(e) if e.xa_code().is_some() => return Err(from_transport(e, "xa prepare")),
            Err(e) if e.is_unblocked() => e,
            Err(e) => {
                tracing::error!(xid = %xid, error = %e, "error during prepare");
                return Err(from_transport(e, "xa prepare"));
            }
        };

        let retry = {
            let _call = shared.start_call();
            remote.xa_prepare(xid)
        };
        if let Ok(vote) = retry {
            return Ok(vote);
        }
        tracing::warn!(xid = %xid, "failover during prepare, rolling back");
        self.session
            .rollback_with(false)
            .map_err(|e| from_lumen(e, "rollback after failed prepare"))?;
        Err(XaError::rollback_other("prepare interrupted by failover").with_cause(cause))
    }

    fn commit_inner(&self, xid: &Xid, one_phase: bool) -> Result<(), XaError> {
        let shared = self.session.shared();
        if shared.is_rollback_only() {
            // A prepared branch can never be rolled back unilaterally.
            tracing::warn!(xid = %xid, "committing a branch after failover");
        }
        let _call = shared.start_call();
        match self.session.remote().xa_commit(xid, one_phase) {
            Ok(()) => {
                shared.clear_work_done();
                Ok(())
            }
            Err(e) if e.xa_code().is_some() => Err(from_transport(e, "xa commit")),
            Err(e) => {
                tracing::warn!(xid = %xid, error = %e, "failover during commit");
                Err(XaError::retry("commit interrupted, retry").with_cause(e))
            }
        }
    }

    fn rollback_inner(&self, xid: &Xid) -> Result<(), XaError> {
        let map = |e: LumenError| match e {
            LumenError::Transport(t) if t.is_unblocked() => {
                XaError::retry("rollback unblocked by failover").with_cause(t)
            }
            other => from_lumen(other, "xa rollback"),
        };
        let session = &self.session;
        let was_started = session.is_started();
        if was_started {
            session.stop_with(false).map_err(map)?;
        }
        session.clear_consumers(false);
        session.flush_acks().map_err(map)?;

        let rolled_back = session.remote().xa_rollback(xid, was_started);
        let restarted = if was_started {
            session.start()
        } else {
            Ok(())
        };
        rolled_back.map_err(|e| map(e.into()))?;
        restarted.map_err(map)?;
        session.shared().clear_work_done();
        Ok(())
    }

    /// XA mode and an open session, in that order. `SessionClosed` is
    /// returned as is.
    fn check_usable(&self) -> LumenResult<()> {
        self.check_xa()?;
        self.session.shared().check_closed()
    }

    fn identity(&self) -> ResourceIdentity {
        ResourceIdentity {
            live_node_id: self.session.node_id(),
            factory_id: self.session.factory_id(),
        }
    }
}

impl XaResource for XaSession {
    fn start(&self, xid: &Xid, flags: i32) -> LumenResult<()> {
        self.check_usable()?;
        tracing::trace!(xid = %xid, flags = %xa_flag_name(flags), "xa start");
        let result = self.start_inner(xid, flags);
        if result.is_ok() {
            self.session.set_current_xid(Some(xid.clone()));
        }
        observe("start", result)
    }

    fn end(&self, xid: &Xid, flags: i32) -> LumenResult<()> {
        self.check_usable()?;
        tracing::trace!(xid = %xid, flags = %xa_flag_name(flags), "xa end");
        let result = self.end_inner(xid, flags);
        self.session.set_current_xid(None);
        observe("end", result)
    }

    fn prepare(&self, xid: &Xid) -> LumenResult<PrepareVote> {
        self.check_usable()?;
        tracing::trace!(xid = %xid, "xa prepare");
        observe("prepare", self.prepare_inner(xid))
    }

    fn commit(&self, xid: &Xid, one_phase: bool) -> LumenResult<()> {
        self.check_usable()?;
        tracing::trace!(xid = %xid, one_phase, "xa commit");
        observe("commit", self.commit_inner(xid, one_phase))
    }

    fn rollback(&self, xid: &Xid) -> LumenResult<()> {
        self.check_usable()?;
        tracing::trace!(xid = %xid, "xa rollback");
        observe("rollback", self.rollback_inner(xid))
    }

    fn forget(&self, xid: &Xid) -> LumenResult<()> {
        self.check_usable()?;
        let _call = self.session.shared().start_call();
        let result = self
            .session
            .remote()
            .xa_forget(xid)
            .map_err(|e| from_transport(e, "xa forget"));
        observe("forget", result)
    }

    fn recover(&self, flags: i32) -> LumenResult<Vec<Xid>> {
        self.check_usable()?;
        if flags & TMSTARTRSCAN != TMSTARTRSCAN {
            return Ok(Vec::new());
        }
        let result = self
            .session
            .remote()
            .xa_scan()
            .map_err(|e| from_transport(e, "xa recover"));
        observe("recover", result)
    }

    fn transaction_timeout(&self) -> LumenResult<u32> {
        self.check_usable()?;
        self.session
            .remote()
            .xa_get_timeout()
            .map_err(|e| from_transport(e, "reading transaction timeout").into())
    }

    fn set_transaction_timeout(&self, seconds: u32) -> LumenResult<bool> {
        self.check_usable()?;
        self.session
            .remote()
            .xa_set_timeout(seconds)
            .map_err(|e| from_transport(e, "setting transaction timeout").into())
    }

    fn is_same_rm(&self, other: &dyn XaResource) -> LumenResult<bool> {
        self.check_usable()?;
        if self.force_not_same_rm.load(Ordering::Acquire) {
            return Ok(false);
        }
        let Some(theirs) = other.resource_identity() else {
            return Ok(false);
        };
        let mine = self.identity();
        let same = match (&mine.live_node_id, &theirs.live_node_id) {
            (Some(a), Some(b)) => a == b,
            _ => mine.factory_id.is_some() && mine.factory_id == theirs.factory_id,
        };
        Ok(same)
    }

    fn resource_identity(&self) -> Option<ResourceIdentity> {
        Some(self.identity())
    }
}

impl ClientSession {
    /// XA view of this session.
    pub fn xa_resource(self: &Arc<Self>) -> XaSession {
        XaSession::new(self.clone())
    }
}
