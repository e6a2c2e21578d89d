//! Client session state machine.
//!
//! A session owns its consumers, producers, producer credits and delivery
//! executor, forwards every operation to its [`RemoteContext`], and survives
//! broker failover by re-attaching to the new connection or, failing that,
//! re-creating itself and its consumers on the new broker. When the outcome
//! of in-flight work becomes unknowable the session is marked rollback-only
//! and the next commit reports it.
//!
//! Lifecycle: `Open(stopped) <-> Open(started)`, then `Closing -> Closed`.
//! Failover runs under the session lock and is a no-op once closed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use lumen_common::config::{CreditConfig, SessionConfig};
use lumen_common::error::{LumenResult, SessionError, TransportError};
use lumen_common::types::{ConsumerId, ProducerId, Xid};

use crate::consumer::ClientConsumer;
use crate::credits::{CreditRequester, ProducerCreditManager};
use crate::executor::DeliveryExecutor;
use crate::factory::SessionFactory;
use crate::message::ClientMessage;
use crate::producer::ClientProducer;
use crate::registry::{ConsumerRegistry, ProducerRegistry};
use crate::remote::{ConnectionInfo, ConsumerSpec, RemoteContext, SessionParams};
use crate::shared::SessionShared;

/// What a call to [`ClientSession::handle_failover`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverOutcome {
    /// The session was already closed.
    Skipped,
    /// The new broker still knew the session.
    Reattached,
    /// The session and its consumers were re-created on the new broker.
    Recreated,
    /// Re-creation was not allowed (closing or stop signal); blocked callers
    /// were released.
    UnblockedOnly,
    /// A wire call failed during failover.
    Failed,
}

impl FailoverOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            FailoverOutcome::Skipped => "skipped",
            FailoverOutcome::Reattached => "reattached",
            FailoverOutcome::Recreated => "recreated",
            FailoverOutcome::UnblockedOnly => "unblocked_only",
            FailoverOutcome::Failed => "failed",
        }
    }
}

/// Per-consumer overrides of the session defaults.
#[derive(Debug, Clone, Default)]
pub struct ConsumerOptions {
    pub filter: Option<String>,
    pub window_size: Option<i32>,
    pub max_rate: Option<i32>,
    pub browse_only: bool,
}

struct RemoteCreditRequester {
    remote: Arc<dyn RemoteContext>,
}

impl CreditRequester for RemoteCreditRequester {
    fn request_credits(&self, address: &str, credits: u32) {
        if let Err(e) = self.remote.send_producer_credits_message(credits, address) {
            tracing::warn!(address, credits, error = %e, "failed to request producer credits");
        }
    }
}

pub struct ClientSession {
    shared: Arc<SessionShared>,
    username: Option<String>,
    password: Option<String>,
    remote: Arc<dyn RemoteContext>,
    factory: Weak<dyn SessionFactory>,
    consumers: Arc<ConsumerRegistry>,
    producers: Arc<ProducerRegistry>,
    credit_manager: Arc<ProducerCreditManager>,
    executor: Arc<DeliveryExecutor>,
    current_xid: Mutex<Option<Xid>>,
    metadata: Mutex<HashMap<String, String>>,
    may_attempt_to_failover: AtomicBool,
    next_producer_id: AtomicU64,
    /// Serialises failover against close and cleanup.
    lifecycle: Mutex<()>,
}

impl ClientSession {
    pub fn new(
        name: impl Into<String>,
        username: Option<String>,
        password: Option<String>,
        config: SessionConfig,
        credit_config: &CreditConfig,
        remote: Arc<dyn RemoteContext>,
        factory: Weak<dyn SessionFactory>,
    ) -> LumenResult<Arc<Self>> {
        let name = name.into();
        let executor = Arc::new(DeliveryExecutor::spawn(format!("lumen-delivery-{}", name))?);
        let requester = Arc::new(RemoteCreditRequester {
            remote: remote.clone(),
        });
        let credit_manager = Arc::new(ProducerCreditManager::new(
            config.producer_window_size,
            credit_config,
            requester,
        ));
        tracing::debug!(session = %name, xa = config.xa, "session created");
        Ok(Arc::new(Self {
            shared: Arc::new(SessionShared::new(name, config)),
            username,
            password,
            remote,
            factory,
            consumers: Arc::new(ConsumerRegistry::new()),
            producers: Arc::new(ProducerRegistry::new()),
            credit_manager,
            executor,
            current_xid: Mutex::new(None),
            metadata: Mutex::new(HashMap::new()),
            may_attempt_to_failover: AtomicBool::new(true),
            next_producer_id: AtomicU64::new(1),
            lifecycle: Mutex::new(()),
        }))
    }

    // ── Accessors ──

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    pub fn is_closing(&self) -> bool {
        self.shared.in_close.load(Ordering::Acquire)
    }

    pub fn is_started(&self) -> bool {
        self.shared.is_started()
    }

    pub fn is_rollback_only(&self) -> bool {
        self.shared.is_rollback_only()
    }

    pub fn is_xa(&self) -> bool {
        self.shared.config.xa
    }

    pub fn is_auto_commit_sends(&self) -> bool {
        self.shared.config.auto_commit_sends
    }

    pub fn is_auto_commit_acks(&self) -> bool {
        self.shared.config.auto_commit_acks
    }

    pub fn is_block_on_acknowledge(&self) -> bool {
        self.shared.config.block_on_acknowledge
    }

    pub fn is_work_done(&self) -> bool {
        self.shared.is_work_done()
    }

    pub fn server_version(&self) -> i32 {
        self.remote.server_version()
    }

    pub fn connection(&self) -> ConnectionInfo {
        self.remote.remoting_connection()
    }

    /// Live node id reported by the owning factory.
    pub fn node_id(&self) -> Option<String> {
        self.factory.upgrade().and_then(|f| f.live_node_id())
    }

    pub fn factory_id(&self) -> Option<u64> {
        self.factory.upgrade().map(|f| f.factory_id())
    }

    pub fn current_xid(&self) -> Option<Xid> {
        self.current_xid.lock().clone()
    }

    pub fn consumer_ids(&self) -> Vec<ConsumerId> {
        self.consumers.ids()
    }

    pub fn consumer(&self, id: ConsumerId) -> Option<Arc<ClientConsumer>> {
        self.consumers.get(id)
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    pub fn producer_count(&self) -> usize {
        self.producers.len()
    }

    pub fn credit_manager(&self) -> &Arc<ProducerCreditManager> {
        &self.credit_manager
    }

    pub fn metadata(&self) -> HashMap<String, String> {
        self.metadata.lock().clone()
    }

    pub(crate) fn shared(&self) -> &SessionShared {
        &self.shared
    }

    pub(crate) fn remote(&self) -> &Arc<dyn RemoteContext> {
        &self.remote
    }

    pub(crate) fn set_current_xid(&self, xid: Option<Xid>) {
        *self.current_xid.lock() = xid;
    }

    fn params(&self) -> SessionParams {
        let config = &self.shared.config;
        SessionParams {
            name: self.shared.name.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            xa: config.xa,
            auto_commit_sends: config.auto_commit_sends,
            auto_commit_acks: config.auto_commit_acks,
            pre_acknowledge: config.pre_acknowledge,
            min_large_message_size: config.min_large_message_size,
            default_address: self.shared.default_address(),
        }
    }

    // ── Queues ──

    pub fn create_queue(&self, address: &str, queue: &str, durable: bool) -> LumenResult<()> {
        self.internal_create_queue(address, queue, None, durable, false)
    }

    pub fn create_queue_with_filter(
        &self,
        address: &str,
        queue: &str,
        filter: Option<&str>,
        durable: bool,
    ) -> LumenResult<()> {
        self.internal_create_queue(address, queue, filter, durable, false)
    }

    pub fn create_temporary_queue(
        &self,
        address: &str,
        queue: &str,
        filter: Option<&str>,
    ) -> LumenResult<()> {
        self.internal_create_queue(address, queue, filter, false, true)
    }

    fn internal_create_queue(
        &self,
        address: &str,
        queue: &str,
        filter: Option<&str>,
        durable: bool,
        temporary: bool,
    ) -> LumenResult<()> {
        if durable && temporary {
            return Err(SessionError::QueueMisconfigured(queue.to_string()).into());
        }
        self.shared.check_closed()?;
        let _call = self.shared.start_call();
        self.remote
            .create_queue(address, queue, filter, durable, temporary)?;
        Ok(())
    }

    pub fn create_shared_queue(
        &self,
        address: &str,
        queue: &str,
        filter: Option<&str>,
        durable: bool,
    ) -> LumenResult<()> {
        self.shared.check_closed()?;
        let _call = self.shared.start_call();
        self.remote
            .create_shared_queue(address, queue, filter, durable)?;
        Ok(())
    }

    pub fn delete_queue(&self, queue: &str) -> LumenResult<()> {
        self.shared.check_closed()?;
        let _call = self.shared.start_call();
        self.remote.delete_queue(queue)?;
        Ok(())
    }

    // ── Consumers & producers ──

    pub fn create_consumer(&self, queue: &str) -> LumenResult<Arc<ClientConsumer>> {
        self.create_consumer_with(queue, ConsumerOptions::default())
    }

    pub fn create_consumer_with(
        &self,
        queue: &str,
        options: ConsumerOptions,
    ) -> LumenResult<Arc<ClientConsumer>> {
        self.shared.check_closed()?;
        let config = &self.shared.config;
        let spec = ConsumerSpec {
            queue: queue.to_string(),
            filter: options.filter,
            window_size: options.window_size.unwrap_or(config.consumer_window_size),
            max_rate: options.max_rate.unwrap_or(config.consumer_max_rate),
            ack_batch_size: config.ack_batch_size,
            browse_only: options.browse_only,
        };
        let id = self.remote.create_consumer(&spec)?;
        let window = spec.window_size;
        let consumer = ClientConsumer::new(
            id,
            spec,
            self.shared.clone(),
            self.remote.clone(),
            self.executor.clone(),
            Arc::downgrade(&self.consumers),
        );
        self.consumers.insert(consumer.clone());
        // The initial window starts delivery. A window of 0 pulls one message
        // per receive instead.
        if window != 0 {
            if let Err(e) = self.remote.send_consumer_credits(id, window) {
                // Failover must not re-create a consumer the caller never got.
                consumer.clean_up();
                return Err(e.into());
            }
        }
        tracing::debug!(session = %self.name(), consumer = %id, queue, "consumer created");
        Ok(consumer)
    }

    pub fn create_producer(&self, address: Option<&str>) -> LumenResult<Arc<ClientProducer>> {
        self.create_producer_with_rate(address, self.shared.config.producer_max_rate)
    }

    /// A producer limited to `max_rate` messages per second (-1 = unlimited).
    pub fn create_producer_with_rate(
        &self,
        address: Option<&str>,
        max_rate: i32,
    ) -> LumenResult<Arc<ClientProducer>> {
        self.shared.check_closed()?;
        let id = ProducerId(self.next_producer_id.fetch_add(1, Ordering::Relaxed));
        let producer = ClientProducer::new(
            id,
            address.map(str::to_string),
            max_rate,
            self.shared.clone(),
            self.remote.clone(),
            self.credit_manager.clone(),
            Arc::downgrade(&self.producers),
        );
        self.producers.insert(producer.clone());
        Ok(producer)
    }

    /// A new message with its body buffer sized to the current initial
    /// packet size.
    pub fn create_message(&self, durable: bool) -> ClientMessage {
        ClientMessage::with_capacity(durable, self.shared.initial_packet_size())
    }

    pub fn initial_message_packet_size(&self) -> usize {
        self.shared.initial_packet_size()
    }

    pub fn set_packet_size(&self, requested: usize) {
        self.shared.set_packet_size(requested);
    }

    // ── Acknowledgements ──

    pub fn acknowledge(&self, consumer: &ClientConsumer, message: &ClientMessage) -> LumenResult<()> {
        consumer.acknowledge(message)
    }

    pub fn individual_acknowledge(
        &self,
        consumer: &ClientConsumer,
        message: &ClientMessage,
    ) -> LumenResult<()> {
        consumer.individual_acknowledge(message)
    }

    pub fn expire(&self, consumer: &ClientConsumer, message: &ClientMessage) -> LumenResult<()> {
        consumer.expire(message)
    }

    pub(crate) fn flush_acks(&self) -> LumenResult<()> {
        for consumer in self.consumers.snapshot() {
            consumer.flush_acks()?;
        }
        Ok(())
    }

    // ── Start / stop ──

    pub fn start(&self) -> LumenResult<()> {
        self.shared.check_closed()?;
        if !self.shared.is_started() {
            for consumer in self.consumers.snapshot() {
                consumer.start();
            }
            self.remote.session_start()?;
            self.shared.started.store(true, Ordering::Release);
        }
        Ok(())
    }

    pub fn stop(&self) -> LumenResult<()> {
        self.stop_with(true)
    }

    /// Stop delivery. With `wait_for_on_message`, running handlers finish
    /// before this returns.
    pub fn stop_with(&self, wait_for_on_message: bool) -> LumenResult<()> {
        self.shared.check_closed()?;
        if self.shared.is_started() {
            for consumer in self.consumers.snapshot() {
                consumer.stop(wait_for_on_message);
            }
            self.remote.session_stop()?;
            self.shared.started.store(false, Ordering::Release);
        }
        Ok(())
    }

    pub(crate) fn clear_consumers(&self, wait_for_on_message: bool) {
        for consumer in self.consumers.snapshot() {
            consumer.clear(wait_for_on_message);
        }
    }

    // ── Local transactions ──

    /// Commit the local transaction.
    ///
    /// Fails with `TransactionRolledBack` if failover forced a rollback before
    /// the commit went out, and with `TransactionOutcomeUnknown` if the
    /// commit itself was interrupted by failover. Both roll back first.
    pub fn commit(&self) -> LumenResult<()> {
        self.shared.check_closed()?;
        tracing::trace!(session = %self.name(), "sending commit");

        if self.shared.is_rollback_only() {
            return self.rollback_on_failover(true);
        }
        self.flush_acks()?;
        // Failover may have happened while flushing.
        if self.shared.is_rollback_only() {
            return self.rollback_on_failover(true);
        }

        match self.remote.simple_commit() {
            Ok(()) => {}
            Err(e) if e.is_unblocked() || self.shared.is_rollback_only() => {
                tracing::debug!(session = %self.name(), error = %e, "commit interrupted by failover");
                return self.rollback_on_failover(false);
            }
            Err(e) => return Err(e.into()),
        }

        if self.shared.is_rollback_only() {
            return self.rollback_on_failover(false);
        }
        self.shared.clear_work_done();
        Ok(())
    }

    fn rollback_on_failover(&self, outcome_known: bool) -> LumenResult<()> {
        self.rollback_with(false)?;
        if outcome_known {
            Err(SessionError::TransactionRolledBack(format!(
                "session {} was rolled back after failover",
                self.name()
            ))
            .into())
        } else {
            Err(SessionError::TransactionOutcomeUnknown(format!(
                "commit on session {} was interrupted by failover",
                self.name()
            ))
            .into())
        }
    }

    pub fn rollback(&self) -> LumenResult<()> {
        self.rollback_with(false)
    }

    /// Roll back the local transaction: stop delivery, drop buffered
    /// messages, flush acks, roll back on the broker and resume.
    pub fn rollback_with(&self, is_last_message_as_delivered: bool) -> LumenResult<()> {
        self.shared.check_closed()?;
        tracing::trace!(session = %self.name(), "sending rollback");

        let was_started = self.shared.is_started();
        if was_started {
            self.stop_with(true)?;
        }
        self.clear_consumers(true);
        // Acks go out only after every handler has finished.
        self.flush_acks()?;
        self.remote.simple_rollback(is_last_message_as_delivered)?;
        if was_started {
            self.start()?;
        }
        self.shared.set_rollback_only(false);
        Ok(())
    }

    /// Roll back if failover left the session rollback-only.
    pub fn reset_if_needed(&self) -> LumenResult<()> {
        if self.shared.is_rollback_only() {
            tracing::warn!(session = %self.name(), "resetting session after failure");
            self.rollback_with(false)?;
        }
        Ok(())
    }

    // ── Metadata ──

    pub fn add_metadata(&self, key: &str, value: &str) -> LumenResult<()> {
        self.shared.check_closed()?;
        self.metadata
            .lock()
            .insert(key.to_string(), value.to_string());
        self.remote.add_session_metadata(key, value)?;
        Ok(())
    }

    // ── Inbound from the connection ──

    pub fn handle_receive_message(&self, consumer: ConsumerId, message: ClientMessage) {
        match self.consumers.get(consumer) {
            Some(c) => c.handle_message(message),
            None => tracing::trace!(session = %self.name(), %consumer, "message for unknown consumer"),
        }
    }

    pub fn handle_receive_producer_credits(&self, address: &str, credits: u32) {
        self.credit_manager.receive_credits(address, credits);
    }

    pub fn handle_receive_producer_fail_credits(&self, address: &str, credits: u32) {
        self.credit_manager.receive_fail_credits(address, credits);
    }

    /// The broker closed a consumer; close it here off the caller's thread.
    pub fn handle_consumer_disconnect(&self, consumer: ConsumerId) {
        if let Some(c) = self.consumers.get(consumer) {
            let queued = self.executor.execute(move || {
                if let Err(e) = c.close() {
                    tracing::warn!(consumer = %c.id(), error = %e, "unable to close consumer");
                }
            });
            if !queued {
                tracing::debug!(%consumer, "executor stopped, consumer left for session cleanup");
            }
        }
    }

    // ── Failover ──

    /// Called before the transport swaps connections.
    pub fn pre_handle_failover(&self) {
        self.remote.lock_communications();
    }

    /// After `set_stop_signal` failover never re-creates the session.
    pub fn set_stop_signal(&self) {
        self.may_attempt_to_failover.store(false, Ordering::Release);
    }

    /// Move the session onto `connection` after a failure described by
    /// `cause`.
    pub fn handle_failover(&self, connection: &ConnectionInfo, cause: &TransportError) -> FailoverOutcome {
        let outcome = {
            let _lifecycle = self.lifecycle.lock();
            if self.shared.is_closed() {
                return FailoverOutcome::Skipped;
            }
            let mut reset_credits = false;
            let outcome = match self.failover_locked(connection, cause, &mut reset_credits) {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!(session = %self.name(), error = %e, "failed to handle failover");
                    FailoverOutcome::Failed
                }
            };
            self.remote.release_communications();
            if reset_credits {
                self.credit_manager.reset();
            }
            outcome
        };

        let metadata = self.metadata.lock().clone();
        if let Err(e) = self.remote.reset_metadata(&metadata) {
            tracing::warn!(session = %self.name(), error = %e, "failed to resend session metadata");
        }
        lumen_observability::record_failover(outcome.as_str());
        outcome
    }

    fn failover_locked(
        &self,
        connection: &ConnectionInfo,
        cause: &TransportError,
        reset_credits: &mut bool,
    ) -> LumenResult<FailoverOutcome> {
        if self.remote.reattach_on_new_connection(connection)? {
            tracing::info!(session = %self.name(), connection = connection.id, "session reattached");
            return Ok(FailoverOutcome::Reattached);
        }
        tracing::debug!(session = %self.name(), "session could not be reattached, creating a new one");

        for consumer in self.consumers.snapshot() {
            consumer.clear_at_failover();
        }

        let mut outcome = FailoverOutcome::UnblockedOnly;
        if !self.is_closing() && self.may_attempt_to_failover.load(Ordering::Acquire) {
            self.remote.recreate_session(&self.params())?;

            for consumer in self.consumers.snapshot() {
                self.remote
                    .recreate_consumer_on_server(consumer.id(), consumer.spec())?;
                let window = consumer.spec().window_size;
                if window != 0 {
                    self.remote.send_consumer_credits(consumer.id(), window)?;
                }
            }

            let config = &self.shared.config;
            if (!config.auto_commit_acks || !config.auto_commit_sends) && self.shared.is_work_done() {
                // Work done on the old broker is lost with it.
                self.shared.set_rollback_only(true);
            }
            if let Some(xid) = self.current_xid() {
                self.remote.xa_failed(&xid)?;
                self.shared.set_rollback_only(true);
            }

            if self.shared.is_started() {
                for consumer in self.consumers.snapshot() {
                    consumer.clear_at_failover();
                    consumer.start();
                }
                self.remote.restart_session()?;
            }

            *reset_credits = true;
            outcome = FailoverOutcome::Recreated;
            tracing::info!(
                session = %self.name(),
                consumers = self.consumers.len(),
                rollback_only = self.shared.is_rollback_only(),
                "session recreated on new connection"
            );
        }

        self.remote.return_blocking(cause);
        Ok(outcome)
    }

    // ── Close ──

    /// Close consumers and producers, close the broker session and release
    /// local resources. Never fails; errors are logged.
    pub fn close(&self) {
        if self.shared.is_closed() {
            tracing::debug!(session = %self.name(), "session was already closed");
            return;
        }
        tracing::trace!(session = %self.name(), "closing session");

        let result = (|| -> LumenResult<()> {
            self.close_children()?;
            {
                let _lifecycle = self.lifecycle.lock();
                self.credit_manager.close();
            }
            self.shared.in_close.store(true, Ordering::Release);
            self.remote.session_close()?;
            Ok(())
        })();
        if let Err(e) = result {
            // Nothing a caller could do about it.
            tracing::trace!(session = %self.name(), error = %e, "failed to close session");
        }

        {
            let _lifecycle = self.lifecycle.lock();
            self.mark_closed();
        }
        self.finish_cleanup(false);
    }

    fn close_children(&self) -> LumenResult<()> {
        for consumer in self.consumers.snapshot() {
            consumer.close()?;
        }
        for producer in self.producers.snapshot() {
            producer.close();
        }
        Ok(())
    }

    /// Tear down locally after the connection failed for good.
    pub fn cleanup(&self, failing_over: bool) {
        {
            let _lifecycle = self.lifecycle.lock();
            if self.shared.is_closed() {
                return;
            }
            self.credit_manager.close();
            for consumer in self.consumers.snapshot() {
                consumer.clean_up();
            }
            for producer in self.producers.snapshot() {
                producer.clean_up();
            }
            self.mark_closed();
        }
        self.finish_cleanup(failing_over);
    }

    fn mark_closed(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.remote.cleanup();
    }

    fn finish_cleanup(&self, failing_over: bool) {
        self.executor.shutdown();
        if let Some(factory) = self.factory.upgrade() {
            factory.remove_session(self.name(), failing_over);
        }
        tracing::debug!(session = %self.name(), failing_over, "session cleaned up");
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("name", &self.shared.name)
            .field("closed", &self.shared.is_closed())
            .field("started", &self.shared.is_started())
            .field("rollback_only", &self.shared.is_rollback_only())
            .finish()
    }
}

/// Sessions that are not owned by a factory.
pub fn detached_factory() -> Weak<dyn SessionFactory> {
    Weak::<crate::factory::ClientSessionFactory>::new()
}

