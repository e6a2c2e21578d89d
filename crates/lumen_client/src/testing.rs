//! In-memory [`RemoteContext`] that records every wire call and can be told
//! to fail the next calls of an operation.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use lumen_common::error::{TransportError, TransportErrorKind};
use lumen_common::types::{ConsumerId, MessageId, Xid};

use crate::message::ClientMessage;
use crate::remote::{
    ConnectionInfo, ConsumerSpec, PrepareVote, RemoteContext, RemoteResult, SessionConnector,
    SessionParams,
};

pub(crate) struct MockRemote {
    calls: Mutex<Vec<String>>,
    failures: Mutex<HashMap<String, VecDeque<TransportErrorKind>>>,
    reattach: AtomicBool,
    next_consumer_id: AtomicU64,
    scan: Mutex<Vec<Xid>>,
    vote: Mutex<PrepareVote>,
    timeout_secs: Mutex<u32>,
    connection: Mutex<ConnectionInfo>,
    sent: Mutex<Vec<ClientMessage>>,
}

impl MockRemote {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
            reattach: AtomicBool::new(false),
            next_consumer_id: AtomicU64::new(1),
            scan: Mutex::new(Vec::new()),
            vote: Mutex::new(PrepareVote::Ok),
            timeout_secs: Mutex::new(0),
            connection: Mutex::new(ConnectionInfo::new(1, "mock://broker-1")),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Fail the next `times` calls of `op` with `kind`.
    pub fn fail_next(&self, op: &str, kind: TransportErrorKind, times: usize) {
        let mut failures = self.failures.lock();
        let queue = failures.entry(op.to_string()).or_default();
        queue.extend(std::iter::repeat(kind).take(times));
    }

    pub fn set_reattach(&self, reattach: bool) {
        self.reattach.store(reattach, Ordering::Release);
    }

    pub fn set_scan(&self, xids: Vec<Xid>) {
        *self.scan.lock() = xids;
    }

    pub fn set_vote(&self, vote: PrepareVote) {
        *self.vote.lock() = vote;
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Calls whose name is `op`, with their arguments.
    pub fn calls_of(&self, op: &str) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.split(':').next() == Some(op))
            .cloned()
            .collect()
    }

    pub fn count(&self, op: &str) -> usize {
        self.calls_of(op).len()
    }

    pub fn sent(&self) -> Vec<ClientMessage> {
        self.sent.lock().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    fn record(&self, op: &str, args: String) -> RemoteResult<()> {
        let call = if args.is_empty() {
            op.to_string()
        } else {
            format!("{}:{}", op, args)
        };
        self.calls.lock().push(call);
        let failure = self
            .failures
            .lock()
            .get_mut(op)
            .and_then(|queue| queue.pop_front());
        match failure {
            Some(kind) => Err(TransportError::new(kind, format!("injected failure on {}", op))),
            None => Ok(()),
        }
    }
}

impl RemoteContext for MockRemote {
    fn create_consumer(&self, spec: &ConsumerSpec) -> RemoteResult<ConsumerId> {
        self.record("create_consumer", spec.queue.clone())?;
        Ok(ConsumerId(self.next_consumer_id.fetch_add(1, Ordering::Relaxed)))
    }

    fn recreate_consumer_on_server(&self, id: ConsumerId, _spec: &ConsumerSpec) -> RemoteResult<()> {
        self.record("recreate_consumer", id.0.to_string())
    }

    fn close_consumer(&self, id: ConsumerId) -> RemoteResult<()> {
        self.record("close_consumer", id.0.to_string())
    }

    fn send_consumer_credits(&self, id: ConsumerId, credits: i32) -> RemoteResult<()> {
        self.record("consumer_credits", format!("{}:{}", id.0, credits))
    }

    fn create_queue(
        &self,
        _address: &str,
        queue: &str,
        _filter: Option<&str>,
        durable: bool,
        temporary: bool,
    ) -> RemoteResult<()> {
        self.record("create_queue", format!("{}:{}:{}", queue, durable, temporary))
    }

    fn create_shared_queue(
        &self,
        _address: &str,
        queue: &str,
        _filter: Option<&str>,
        _durable: bool,
    ) -> RemoteResult<()> {
        self.record("create_shared_queue", queue.to_string())
    }

    fn delete_queue(&self, queue: &str) -> RemoteResult<()> {
        self.record("delete_queue", queue.to_string())
    }

    fn send_message(&self, message: &ClientMessage, block: bool) -> RemoteResult<()> {
        // An elided address means the session default.
        let address = message.address.as_deref().unwrap_or("-");
        self.record("send", format!("{}:{}", address, block))?;
        self.sent.lock().push(message.clone());
        Ok(())
    }

    fn send_ack(
        &self,
        individual: bool,
        _block: bool,
        consumer: ConsumerId,
        message: MessageId,
    ) -> RemoteResult<()> {
        self.record("ack", format!("{}:{}:{}", individual, consumer.0, message.0))
    }

    fn expire_message(&self, consumer: ConsumerId, message: MessageId) -> RemoteResult<()> {
        self.record("expire", format!("{}:{}", consumer.0, message.0))
    }

    fn send_producer_credits_message(&self, credits: u32, address: &str) -> RemoteResult<()> {
        self.record("producer_credits", format!("{}:{}", address, credits))
    }

    fn simple_commit(&self) -> RemoteResult<()> {
        self.record("commit", String::new())
    }

    fn simple_rollback(&self, last_message_as_delivered: bool) -> RemoteResult<()> {
        self.record("rollback", last_message_as_delivered.to_string())
    }

    fn xa_start(&self, _xid: &Xid, _flags: i32) -> RemoteResult<()> {
        self.record("xa_start", String::new())
    }

    fn xa_end(&self, _xid: &Xid, _flags: i32) -> RemoteResult<()> {
        self.record("xa_end", String::new())
    }

    fn xa_prepare(&self, _xid: &Xid) -> RemoteResult<PrepareVote> {
        self.record("xa_prepare", String::new())?;
        Ok(*self.vote.lock())
    }

    fn xa_commit(&self, _xid: &Xid, one_phase: bool) -> RemoteResult<()> {
        self.record("xa_commit", one_phase.to_string())
    }

    fn xa_rollback(&self, _xid: &Xid, was_started: bool) -> RemoteResult<()> {
        self.record("xa_rollback", was_started.to_string())
    }

    fn xa_forget(&self, _xid: &Xid) -> RemoteResult<()> {
        self.record("xa_forget", String::new())
    }

    fn xa_scan(&self) -> RemoteResult<Vec<Xid>> {
        self.record("xa_scan", String::new())?;
        Ok(self.scan.lock().clone())
    }

    fn xa_failed(&self, _xid: &Xid) -> RemoteResult<()> {
        self.record("xa_failed", String::new())
    }

    fn xa_get_timeout(&self) -> RemoteResult<u32> {
        self.record("xa_get_timeout", String::new())?;
        Ok(*self.timeout_secs.lock())
    }

    fn xa_set_timeout(&self, seconds: u32) -> RemoteResult<bool> {
        self.record("xa_set_timeout", seconds.to_string())?;
        *self.timeout_secs.lock() = seconds;
        Ok(true)
    }

    fn session_start(&self) -> RemoteResult<()> {
        self.record("session_start", String::new())
    }

    fn session_stop(&self) -> RemoteResult<()> {
        self.record("session_stop", String::new())
    }

    fn session_close(&self) -> RemoteResult<()> {
        self.record("session_close", String::new())
    }

    fn restart_session(&self) -> RemoteResult<()> {
        self.record("restart_session", String::new())
    }

    fn cleanup(&self) {
        let _ = self.record("cleanup", String::new());
    }

    fn lock_communications(&self) {
        let _ = self.record("lock_communications", String::new());
    }

    fn release_communications(&self) {
        let _ = self.record("release_communications", String::new());
    }

    fn return_blocking(&self, cause: &TransportError) {
        let _ = self.record("return_blocking", cause.kind.to_string());
    }

    fn reattach_on_new_connection(&self, connection: &ConnectionInfo) -> RemoteResult<bool> {
        self.record("reattach", connection.id.to_string())?;
        *self.connection.lock() = connection.clone();
        Ok(self.reattach.load(Ordering::Acquire))
    }

    fn recreate_session(&self, params: &SessionParams) -> RemoteResult<()> {
        self.record("recreate_session", params.name.clone())
    }

    fn add_session_metadata(&self, key: &str, _value: &str) -> RemoteResult<()> {
        self.record("add_metadata", key.to_string())
    }

    fn reset_metadata(&self, metadata: &HashMap<String, String>) -> RemoteResult<()> {
        self.record("reset_metadata", metadata.len().to_string())
    }

    fn server_version(&self) -> i32 {
        130
    }

    fn remoting_connection(&self) -> ConnectionInfo {
        self.connection.lock().clone()
    }
}

/// Connector that hands out a fresh [`MockRemote`] per session.
pub(crate) struct MockConnector {
    remotes: Mutex<Vec<Arc<MockRemote>>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self {
            remotes: Mutex::new(Vec::new()),
        }
    }

    pub fn remotes(&self) -> Vec<Arc<MockRemote>> {
        self.remotes.lock().clone()
    }
}

impl SessionConnector for MockConnector {
    fn connect_session(&self, _params: &SessionParams) -> RemoteResult<Arc<dyn RemoteContext>> {
        let remote = Arc::new(MockRemote::new());
        self.remotes.lock().push(remote.clone());
        Ok(remote)
    }
}
