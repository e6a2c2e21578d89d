//! Session factory: creates sessions over a connector, tracks them, and
//! fans connection failure and failover out to every live session.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use lumen_common::config::{LumenConfig, SessionConfig};
use lumen_common::error::{LumenError, LumenResult, TransportError};

use crate::remote::{ConnectionInfo, SessionConnector, SessionParams};
use crate::session::{ClientSession, FailoverOutcome};

/// What a session needs from the factory that created it.
pub trait SessionFactory: Send + Sync {
    /// Node id of the broker currently serving the connection.
    fn live_node_id(&self) -> Option<String>;
    /// Process-unique id of this factory.
    fn factory_id(&self) -> u64;
    fn remove_session(&self, session_name: &str, failing_over: bool);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The connection failed and could not be failed over.
    Failed { cause: TransportError },
    /// Every session was moved onto `connection`.
    FailoverCompleted { connection: ConnectionInfo },
}

pub type ConnectionListener = Arc<dyn Fn(&ConnectionEvent) + Send + Sync>;

static NEXT_FACTORY_ID: AtomicU64 = AtomicU64::new(1);

pub struct ClientSessionFactory {
    id: u64,
    connector: Arc<dyn SessionConnector>,
    config: LumenConfig,
    sessions: Mutex<HashMap<String, Arc<ClientSession>>>,
    live_node_id: RwLock<Option<String>>,
    connection: RwLock<Option<ConnectionInfo>>,
    listeners: Mutex<Vec<(u64, ConnectionListener)>>,
    next_listener_id: AtomicU64,
    closed: AtomicBool,
}

impl ClientSessionFactory {
    pub fn new(connector: Arc<dyn SessionConnector>, config: LumenConfig) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_FACTORY_ID.fetch_add(1, Ordering::Relaxed),
            connector,
            config,
            sessions: Mutex::new(HashMap::new()),
            live_node_id: RwLock::new(None),
            connection: RwLock::new(None),
            listeners: Mutex::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &LumenConfig {
        &self.config
    }

    /// A session with the factory's default session configuration.
    pub fn create_session(
        self: &Arc<Self>,
        username: Option<&str>,
        password: Option<&str>,
    ) -> LumenResult<Arc<ClientSession>> {
        self.create_session_with(username, password, self.config.session.clone())
    }

    pub fn create_xa_session(
        self: &Arc<Self>,
        username: Option<&str>,
        password: Option<&str>,
    ) -> LumenResult<Arc<ClientSession>> {
        let config = SessionConfig {
            xa: true,
            auto_commit_sends: false,
            auto_commit_acks: false,
            ..self.config.session.clone()
        };
        self.create_session_with(username, password, config)
    }

    pub fn create_session_with(
        self: &Arc<Self>,
        username: Option<&str>,
        password: Option<&str>,
        config: SessionConfig,
    ) -> LumenResult<Arc<ClientSession>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(LumenError::closed());
        }
        let name = uuid::Uuid::new_v4().to_string();
        let params = SessionParams {
            name: name.clone(),
            username: username.map(str::to_string),
            password: password.map(str::to_string),
            xa: config.xa,
            auto_commit_sends: config.auto_commit_sends,
            auto_commit_acks: config.auto_commit_acks,
            pre_acknowledge: config.pre_acknowledge,
            min_large_message_size: config.min_large_message_size,
            default_address: None,
        };
        let remote = self.connector.connect_session(&params)?;
        let factory: Weak<dyn SessionFactory> = Arc::downgrade(self) as Weak<dyn SessionFactory>;
        let session = ClientSession::new(
            name.clone(),
            params.username,
            params.password,
            config,
            &self.config.credits,
            remote,
            factory,
        )?;
        self.sessions.lock().insert(name, session.clone());
        Ok(session)
    }

    pub fn set_live_node_id(&self, node_id: Option<String>) {
        *self.live_node_id.write() = node_id;
    }

    pub fn connection(&self) -> Option<ConnectionInfo> {
        self.connection.read().clone()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn sessions(&self) -> Vec<Arc<ClientSession>> {
        self.sessions.lock().values().cloned().collect()
    }

    pub fn add_connection_listener(&self, listener: ConnectionListener) -> u64 {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().push((id, listener));
        id
    }

    pub fn remove_connection_listener(&self, id: u64) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    fn notify(&self, event: &ConnectionEvent) {
        let listeners: Vec<ConnectionListener> =
            self.listeners.lock().iter().map(|(_, l)| l.clone()).collect();
        for listener in listeners {
            listener(event);
        }
    }

    /// Move every session onto `connection`. Communications of all sessions
    /// are locked before any of them starts failing over.
    pub fn fail_over(
        &self,
        connection: ConnectionInfo,
        cause: TransportError,
        new_node_id: Option<String>,
    ) -> Vec<(String, FailoverOutcome)> {
        let sessions = self.sessions();
        tracing::info!(
            factory = self.id,
            connection = connection.id,
            sessions = sessions.len(),
            cause = %cause,
            "failing over"
        );
        for session in &sessions {
            session.pre_handle_failover();
        }
        if new_node_id.is_some() {
            self.set_live_node_id(new_node_id);
        }
        *self.connection.write() = Some(connection.clone());

        let outcomes = sessions
            .iter()
            .map(|s| (s.name().to_string(), s.handle_failover(&connection, &cause)))
            .collect();
        self.notify(&ConnectionEvent::FailoverCompleted { connection });
        outcomes
    }

    /// The connection is gone and will not come back.
    pub fn connection_failed(&self, cause: TransportError) {
        tracing::warn!(factory = self.id, cause = %cause, "connection failed");
        for session in self.sessions() {
            session.cleanup(false);
        }
        self.notify(&ConnectionEvent::Failed { cause });
    }

    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for session in self.sessions() {
            session.close();
        }
        tracing::debug!(factory = self.id, "session factory closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl SessionFactory for ClientSessionFactory {
    fn live_node_id(&self) -> Option<String> {
        self.live_node_id.read().clone()
    }

    fn factory_id(&self) -> u64 {
        self.id
    }

    fn remove_session(&self, session_name: &str, failing_over: bool) {
        if self.sessions.lock().remove(session_name).is_some() {
            tracing::trace!(factory = self.id, session = session_name, failing_over, "session removed");
        }
    }
}
