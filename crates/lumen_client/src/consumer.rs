//! Client-side consumer: buffers broker deliveries, dispatches them to a
//! handler on the session's delivery executor or hands them out through
//! `receive`, batches acknowledgements and returns flow-control credits.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use lumen_common::error::{LumenError, LumenResult, SessionError};
use lumen_common::types::{ConsumerId, MessageId};

use crate::executor::DeliveryExecutor;
use crate::message::ClientMessage;
use crate::registry::ConsumerRegistry;
use crate::remote::{ConsumerSpec, RemoteContext};
use crate::shared::SessionShared;

/// How long `stop(true)` and `close()` wait for an in-flight handler.
const ON_MESSAGE_TIMEOUT: Duration = Duration::from_secs(10);

pub type MessageHandler = Arc<dyn Fn(ClientMessage) + Send + Sync>;

#[derive(Default)]
struct ConsumerState {
    buffer: VecDeque<ClientMessage>,
    handler: Option<MessageHandler>,
    stopped: bool,
    closed: bool,
    delivery_scheduled: bool,
    /// Highest delivered message not yet acknowledged on the wire.
    pending_ack: Option<MessageId>,
    pending_ack_bytes: usize,
    /// Bytes consumed since credits were last returned to the broker.
    consumed_bytes: usize,
    delivered: u64,
}

pub struct ClientConsumer {
    id: ConsumerId,
    spec: ConsumerSpec,
    shared: Arc<SessionShared>,
    remote: Arc<dyn RemoteContext>,
    executor: Arc<DeliveryExecutor>,
    registry: Weak<ConsumerRegistry>,
    state: Mutex<ConsumerState>,
    arrived: Condvar,
}

impl ClientConsumer {
    pub(crate) fn new(
        id: ConsumerId,
        spec: ConsumerSpec,
        shared: Arc<SessionShared>,
        remote: Arc<dyn RemoteContext>,
        executor: Arc<DeliveryExecutor>,
        registry: Weak<ConsumerRegistry>,
    ) -> Arc<Self> {
        let stopped = !shared.is_started();
        Arc::new(Self {
            id,
            spec,
            shared,
            remote,
            executor,
            registry,
            state: Mutex::new(ConsumerState {
                stopped,
                ..ConsumerState::default()
            }),
            arrived: Condvar::new(),
        })
    }

    pub fn id(&self) -> ConsumerId {
        self.id
    }

    pub fn spec(&self) -> &ConsumerSpec {
        &self.spec
    }

    pub fn queue(&self) -> &str {
        &self.spec.queue
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn buffered(&self) -> usize {
        self.state.lock().buffer.len()
    }

    pub fn delivered_count(&self) -> u64 {
        self.state.lock().delivered
    }

    fn check_open(&self) -> LumenResult<()> {
        if self.state.lock().closed {
            return Err(SessionError::ConsumerClosed(self.id.0).into());
        }
        self.shared.check_closed()
    }

    /// Install or remove the asynchronous message handler.
    pub fn set_message_handler(self: &Arc<Self>, handler: Option<MessageHandler>) -> LumenResult<()> {
        self.check_open()?;
        let mut st = self.state.lock();
        let has_handler = handler.is_some();
        st.handler = handler;
        if has_handler && !st.stopped && !st.buffer.is_empty() {
            self.schedule_delivery(&mut st);
        }
        Ok(())
    }

    /// A message arrived from the broker.
    pub fn handle_message(self: &Arc<Self>, message: ClientMessage) {
        let mut st = self.state.lock();
        if st.closed {
            tracing::trace!(consumer = %self.id, "dropping delivery to closed consumer");
            return;
        }
        st.buffer.push_back(message);
        if st.handler.is_some() && !st.stopped {
            self.schedule_delivery(&mut st);
        }
        self.arrived.notify_all();
    }

    fn schedule_delivery(self: &Arc<Self>, st: &mut ConsumerState) {
        if st.delivery_scheduled {
            return;
        }
        st.delivery_scheduled = true;
        let me = self.clone();
        if !self.executor.execute(move || me.deliver_one()) {
            st.delivery_scheduled = false;
        }
    }

    /// Runs on the delivery executor: hand one message to the handler and
    /// reschedule if more are buffered, so consumers of one session interleave.
    fn deliver_one(self: Arc<Self>) {
        let (message, handler) = {
            let mut st = self.state.lock();
            st.delivery_scheduled = false;
            if st.closed || st.stopped {
                return;
            }
            let Some(handler) = st.handler.clone() else {
                return;
            };
            let Some(message) = st.buffer.pop_front() else {
                return;
            };
            st.delivered += 1;
            (message, handler)
        };
        let size = message.encode_size();
        handler(message);
        self.flow_control(size);

        let mut st = self.state.lock();
        if !st.closed && !st.stopped && st.handler.is_some() && !st.buffer.is_empty() {
            self.schedule_delivery(&mut st);
        }
    }

    /// Pull the next message, waiting up to `timeout` while the consumer is
    /// stopped or the buffer is empty. `Ok(None)` on timeout or close.
    pub fn receive(&self, timeout: Duration) -> LumenResult<Option<ClientMessage>> {
        self.check_open()?;
        let deadline = Instant::now() + timeout;
        let message = {
            let mut st = self.state.lock();
            if st.handler.is_some() {
                return Err(LumenError::InvalidArgument(
                    "cannot receive on a consumer with a message handler".into(),
                ));
            }
            if self.spec.window_size == 0 && st.buffer.is_empty() {
                // Slow consumer: pull exactly one message at a time.
                drop(st);
                if let Err(e) = self.remote.send_consumer_credits(self.id, 1) {
                    tracing::warn!(consumer = %self.id, error = %e, "failed to request message");
                }
                st = self.state.lock();
            }
            loop {
                if st.closed {
                    return Ok(None);
                }
                if !st.stopped {
                    if let Some(m) = st.buffer.pop_front() {
                        st.delivered += 1;
                        break m;
                    }
                }
                if self.arrived.wait_until(&mut st, deadline).timed_out() {
                    if !st.stopped && !st.closed {
                        if let Some(m) = st.buffer.pop_front() {
                            st.delivered += 1;
                            break m;
                        }
                    }
                    return Ok(None);
                }
            }
        };
        self.flow_control(message.encode_size());
        Ok(Some(message))
    }

    pub fn receive_immediate(&self) -> LumenResult<Option<ClientMessage>> {
        self.receive(Duration::ZERO)
    }

    /// Return credits once half the window has been consumed.
    fn flow_control(&self, bytes: usize) {
        let window = self.spec.window_size;
        if window <= 0 {
            return;
        }
        let to_send = {
            let mut st = self.state.lock();
            st.consumed_bytes += bytes;
            if st.consumed_bytes >= (window as usize) / 2 {
                std::mem::take(&mut st.consumed_bytes)
            } else {
                0
            }
        };
        if to_send > 0 {
            let credits = to_send.min(i32::MAX as usize) as i32;
            if let Err(e) = self.remote.send_consumer_credits(self.id, credits) {
                tracing::warn!(consumer = %self.id, credits, error = %e, "failed to send consumer credits");
            }
        }
    }

    /// Acknowledge `message` and everything delivered before it. Batched up
    /// to the session's ack batch size.
    pub fn acknowledge(&self, message: &ClientMessage) -> LumenResult<()> {
        if self.shared.config.pre_acknowledge {
            return Ok(());
        }
        self.check_open()?;
        let id = message_id(message)?;
        if !self.shared.config.auto_commit_acks {
            self.shared.mark_work_done();
        }
        let flush = {
            let mut st = self.state.lock();
            st.pending_ack = Some(id);
            st.pending_ack_bytes += message.encode_size();
            st.pending_ack_bytes >= self.shared.config.ack_batch_size
        };
        if flush {
            self.send_pending_ack()?;
        }
        Ok(())
    }

    /// Acknowledge exactly `message`, after flushing any batched ack.
    pub fn individual_acknowledge(&self, message: &ClientMessage) -> LumenResult<()> {
        if self.shared.config.pre_acknowledge {
            return Ok(());
        }
        self.check_open()?;
        let id = message_id(message)?;
        if !self.shared.config.auto_commit_acks {
            self.shared.mark_work_done();
        }
        self.send_pending_ack()?;
        let _call = self.shared.start_call();
        self.remote
            .send_ack(true, self.shared.config.block_on_acknowledge, self.id, id)?;
        Ok(())
    }

    /// Ask the broker to expire `message`. Skipped under pre-acknowledge.
    pub fn expire(&self, message: &ClientMessage) -> LumenResult<()> {
        if self.shared.config.pre_acknowledge {
            return Ok(());
        }
        self.check_open()?;
        let id = message_id(message)?;
        let _call = self.shared.start_call();
        self.remote.expire_message(self.id, id)?;
        Ok(())
    }

    /// Send the batched acknowledgement, if any.
    pub fn flush_acks(&self) -> LumenResult<()> {
        self.send_pending_ack()
    }

    fn send_pending_ack(&self) -> LumenResult<()> {
        let pending = {
            let mut st = self.state.lock();
            st.pending_ack_bytes = 0;
            st.pending_ack.take()
        };
        if let Some(message) = pending {
            let _call = self.shared.start_call();
            self.remote
                .send_ack(false, self.shared.config.block_on_acknowledge, self.id, message)?;
        }
        Ok(())
    }

    pub fn has_pending_ack(&self) -> bool {
        self.state.lock().pending_ack.is_some()
    }

    pub(crate) fn start(self: &Arc<Self>) {
        let mut st = self.state.lock();
        st.stopped = false;
        if st.handler.is_some() && !st.buffer.is_empty() {
            self.schedule_delivery(&mut st);
        }
        self.arrived.notify_all();
    }

    /// Pause delivery. With `wait_for_on_message`, also wait for a handler
    /// that is already running.
    pub(crate) fn stop(&self, wait_for_on_message: bool) {
        self.state.lock().stopped = true;
        if wait_for_on_message {
            self.executor.flush(ON_MESSAGE_TIMEOUT);
        }
    }

    /// Discard buffered messages and hand their credits back so the broker
    /// can redeliver into the window.
    pub(crate) fn clear(&self, wait_for_on_message: bool) {
        let discarded: usize = {
            let mut st = self.state.lock();
            st.buffer.drain(..).map(|m| m.encode_size()).sum()
        };
        if wait_for_on_message {
            self.executor.flush(ON_MESSAGE_TIMEOUT);
        }
        if discarded > 0 {
            self.flow_control(discarded);
        }
    }

    /// The connection changed: forget everything tied to the old one without
    /// touching the wire.
    pub(crate) fn clear_at_failover(&self) {
        let mut st = self.state.lock();
        st.buffer.clear();
        st.pending_ack = None;
        st.pending_ack_bytes = 0;
        st.consumed_bytes = 0;
        self.arrived.notify_all();
    }

    /// Returns `true` if this call closed the consumer.
    fn mark_closed(&self) -> bool {
        let mut st = self.state.lock();
        if st.closed {
            return false;
        }
        st.closed = true;
        st.handler = None;
        st.buffer.clear();
        self.arrived.notify_all();
        true
    }

    fn unregister(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
    }

    /// Flush acknowledgements, close the server-side consumer and leave the
    /// session.
    pub fn close(&self) -> LumenResult<()> {
        if !self.mark_closed() {
            return Ok(());
        }
        self.executor.flush(ON_MESSAGE_TIMEOUT);
        let result = self.send_pending_ack().and_then(|()| {
            self.remote.close_consumer(self.id)?;
            Ok(())
        });
        self.unregister();
        tracing::debug!(consumer = %self.id, queue = %self.spec.queue, "consumer closed");
        result
    }

    /// Close locally after a connection failure. No wire traffic.
    pub(crate) fn clean_up(&self) {
        if self.mark_closed() {
            self.unregister();
        }
    }
}

impl std::fmt::Debug for ClientConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConsumer")
            .field("id", &self.id)
            .field("queue", &self.spec.queue)
            .finish()
    }
}

fn message_id(message: &ClientMessage) -> LumenResult<MessageId> {
    message.id.ok_or_else(|| {
        LumenError::InvalidArgument("message was not delivered by the broker".into())
    })
}
