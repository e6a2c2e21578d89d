use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use lumen_common::error::{LumenResult, SessionError};
use lumen_common::types::ProducerId;

use crate::credits::{ProducerCreditManager, ProducerCredits};
use crate::message::ClientMessage;
use crate::rate_limit::SendRateLimiter;
use crate::registry::ProducerRegistry;
use crate::remote::RemoteContext;
use crate::shared::SessionShared;

/// Message property carrying the message group.
pub const GROUP_ID_PROPERTY: &str = "_LUMEN_GROUP_ID";

pub struct ClientProducer {
    id: ProducerId,
    /// `None` for an anonymous producer that addresses each message.
    address: Option<String>,
    /// Held for the producer's lifetime when `address` is set.
    credits: Option<Arc<ProducerCredits>>,
    credit_manager: Arc<ProducerCreditManager>,
    rate_limiter: Option<SendRateLimiter>,
    group_id: Option<String>,
    shared: Arc<SessionShared>,
    remote: Arc<dyn RemoteContext>,
    registry: Weak<ProducerRegistry>,
    closed: AtomicBool,
    sent: AtomicU64,
}

impl ClientProducer {
    pub(crate) fn new(
        id: ProducerId,
        address: Option<String>,
        max_rate: i32,
        shared: Arc<SessionShared>,
        remote: Arc<dyn RemoteContext>,
        credit_manager: Arc<ProducerCreditManager>,
        registry: Weak<ProducerRegistry>,
    ) -> Arc<Self> {
        let credits = address
            .as_deref()
            .map(|a| credit_manager.get_credits(a, false));
        let group_id = match (&shared.config.group_id, shared.config.auto_group) {
            (Some(group), _) => Some(group.clone()),
            (None, true) => Some(uuid::Uuid::new_v4().to_string()),
            (None, false) => None,
        };
        Arc::new(Self {
            id,
            address,
            credits,
            credit_manager,
            rate_limiter: SendRateLimiter::for_max_rate(max_rate),
            group_id,
            shared,
            remote,
            registry,
            closed: AtomicBool::new(false),
            sent: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> ProducerId {
        self.id
    }

    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn max_rate(&self) -> i32 {
        self.rate_limiter
            .as_ref()
            .map_or(-1, |l| l.rate_per_sec().min(i32::MAX as u64) as i32)
    }

    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    fn check_open(&self) -> LumenResult<()> {
        if self.is_closed() {
            return Err(SessionError::ProducerClosed(self.id.0).into());
        }
        self.shared.check_closed()
    }

    /// Send to the producer's address, or to the message's own address for
    /// an anonymous producer.
    pub fn send(&self, message: ClientMessage) -> LumenResult<()> {
        self.do_send(None, message)
    }

    pub fn send_to(&self, address: &str, message: ClientMessage) -> LumenResult<()> {
        self.do_send(Some(address), message)
    }

    fn do_send(&self, address: Option<&str>, mut message: ClientMessage) -> LumenResult<()> {
        self.check_open()?;
        let _call = self.shared.start_call();

        if let Some(limiter) = &self.rate_limiter {
            limiter.limit();
        }

        let address = address
            .or(self.address.as_deref())
            .or(message.address.as_deref())
            .map(str::to_string)
            .ok_or(SessionError::NoAddress)?;

        if let Some(group) = &self.group_id {
            message.set_property(GROUP_ID_PROPERTY, group.clone());
        }
        self.shared.set_address(&mut message, &address);

        let size = message.encode_size();
        self.shared.set_packet_size(size);

        let credits = match &self.credits {
            Some(c) if c.address() == address => c.clone(),
            _ => self.credit_manager.get_credits(&address, true),
        };
        credits.acquire(size as u64)?;

        self.shared.mark_work_done();

        let config = &self.shared.config;
        let block = config.auto_commit_sends
            && if message.durable {
                config.block_on_durable_send
            } else {
                config.block_on_non_durable_send
            };
        self.remote.send_message(&message, block)?;
        self.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Release credits and leave the session. No wire traffic.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(address) = &self.address {
            self.credit_manager.return_credits(address);
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
        tracing::debug!(producer = %self.id, address = ?self.address, "producer closed");
    }

    pub(crate) fn clean_up(&self) {
        self.close();
    }
}

impl std::fmt::Debug for ClientProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientProducer")
            .field("id", &self.id)
            .field("address", &self.address)
            .finish()
    }
}
