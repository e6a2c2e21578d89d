//! Wire boundary of the client session.
//!
//! Packet encoding and the network transport live behind [`RemoteContext`];
//! the session, consumers, producers and the XA bridge only ever talk to the
//! broker through it. Every call may fail with a [`TransportError`], whose
//! `Unblocked` kind means a blocking call was released by failover before a
//! response was seen.

use std::collections::HashMap;
use std::sync::Arc;

use lumen_common::error::TransportError;
use lumen_common::types::{ConsumerId, MessageId, Xid};

use crate::message::ClientMessage;

pub type RemoteResult<T> = Result<T, TransportError>;

/// Descriptor of the physical connection a session context is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: u64,
    pub remote_address: String,
}

impl ConnectionInfo {
    pub fn new(id: u64, remote_address: impl Into<String>) -> Self {
        Self {
            id,
            remote_address: remote_address.into(),
        }
    }
}

/// Everything the broker needs to (re)create a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionParams {
    pub name: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub xa: bool,
    pub auto_commit_sends: bool,
    pub auto_commit_acks: bool,
    pub pre_acknowledge: bool,
    pub min_large_message_size: usize,
    pub default_address: Option<String>,
}

/// Server-side shape of a consumer, replayed verbatim on session re-creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSpec {
    pub queue: String,
    pub filter: Option<String>,
    pub window_size: i32,
    pub max_rate: i32,
    pub ack_batch_size: usize,
    pub browse_only: bool,
}

/// Vote returned by a successful XA prepare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepareVote {
    /// XA_OK: the branch is prepared and must be completed.
    Ok,
    /// XA_RDONLY: the branch did no work and is already complete.
    ReadOnly,
}

impl PrepareVote {
    pub fn as_raw(self) -> i32 {
        match self {
            PrepareVote::Ok => 0,
            PrepareVote::ReadOnly => 3,
        }
    }
}

/// Session-scoped wire calls.
pub trait RemoteContext: Send + Sync {
    // ── Consumers ──
    fn create_consumer(&self, spec: &ConsumerSpec) -> RemoteResult<ConsumerId>;
    fn recreate_consumer_on_server(&self, id: ConsumerId, spec: &ConsumerSpec) -> RemoteResult<()>;
    fn close_consumer(&self, id: ConsumerId) -> RemoteResult<()>;
    fn send_consumer_credits(&self, id: ConsumerId, credits: i32) -> RemoteResult<()>;

    // ── Queues ──
    fn create_queue(
        &self,
        address: &str,
        queue: &str,
        filter: Option<&str>,
        durable: bool,
        temporary: bool,
    ) -> RemoteResult<()>;
    fn create_shared_queue(
        &self,
        address: &str,
        queue: &str,
        filter: Option<&str>,
        durable: bool,
    ) -> RemoteResult<()>;
    fn delete_queue(&self, queue: &str) -> RemoteResult<()>;

    // ── Messages ──
    fn send_message(&self, message: &ClientMessage, block: bool) -> RemoteResult<()>;
    fn send_ack(
        &self,
        individual: bool,
        block: bool,
        consumer: ConsumerId,
        message: MessageId,
    ) -> RemoteResult<()>;
    fn expire_message(&self, consumer: ConsumerId, message: MessageId) -> RemoteResult<()>;
    fn send_producer_credits_message(&self, credits: u32, address: &str) -> RemoteResult<()>;

    // ── Local transactions ──
    fn simple_commit(&self) -> RemoteResult<()>;
    fn simple_rollback(&self, last_message_as_delivered: bool) -> RemoteResult<()>;

    // ── XA ──
    fn xa_start(&self, xid: &Xid, flags: i32) -> RemoteResult<()>;
    fn xa_end(&self, xid: &Xid, flags: i32) -> RemoteResult<()>;
    fn xa_prepare(&self, xid: &Xid) -> RemoteResult<PrepareVote>;
    fn xa_commit(&self, xid: &Xid, one_phase: bool) -> RemoteResult<()>;
    fn xa_rollback(&self, xid: &Xid, was_started: bool) -> RemoteResult<()>;
    fn xa_forget(&self, xid: &Xid) -> RemoteResult<()>;
    fn xa_scan(&self) -> RemoteResult<Vec<Xid>>;
    /// Tell the broker the branch was lost in a failover.
    fn xa_failed(&self, xid: &Xid) -> RemoteResult<()>;
    fn xa_get_timeout(&self) -> RemoteResult<u32>;
    fn xa_set_timeout(&self, seconds: u32) -> RemoteResult<bool>;

    // ── Session lifecycle ──
    fn session_start(&self) -> RemoteResult<()>;
    fn session_stop(&self) -> RemoteResult<()>;
    fn session_close(&self) -> RemoteResult<()>;
    fn restart_session(&self) -> RemoteResult<()>;
    /// Release local resources of this context. No wire traffic.
    fn cleanup(&self);

    // ── Failover ──
    /// Block new packets from entering the resend cache.
    fn lock_communications(&self);
    fn release_communications(&self);
    /// Unblock every thread waiting on a response with `cause`.
    fn return_blocking(&self, cause: &TransportError);
    /// `Ok(false)` when the new broker does not know this session.
    fn reattach_on_new_connection(&self, connection: &ConnectionInfo) -> RemoteResult<bool>;
    fn recreate_session(&self, params: &SessionParams) -> RemoteResult<()>;

    // ── Metadata ──
    fn add_session_metadata(&self, key: &str, value: &str) -> RemoteResult<()>;
    fn reset_metadata(&self, metadata: &HashMap<String, String>) -> RemoteResult<()>;

    fn server_version(&self) -> i32;
    fn remoting_connection(&self) -> ConnectionInfo;
}

/// Opens the per-session remote context on the current connection.
pub trait SessionConnector: Send + Sync {
    fn connect_session(&self, params: &SessionParams) -> RemoteResult<Arc<dyn RemoteContext>>;
}
