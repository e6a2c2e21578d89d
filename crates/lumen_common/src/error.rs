use thiserror::Error;

use crate::types::Xid;

/// Convenience alias for `Result<T, LumenError>`.
pub type LumenResult<T> = Result<T, LumenError>;

/// Error classification used for retry / rollback decisions.
///
/// Callers dispatch over the kind instead of matching concrete variants:
///
/// - `SessionClosed`             : operation attempted after or during close
/// - `NotXa`                     : XA operation on a non-XA session
/// - `TransactionRolledBack`     : forced rollback, outcome known
/// - `TransactionOutcomeUnknown` : disconnect during commit, outcome ambiguous
/// - `Retryable`                 : the transaction manager must re-drive the call
/// - `RollbackOnOtherBranch`     : this branch was unilaterally rolled back
/// - `ResourceError`             : generic resource manager failure
/// - `FlowControlTimeout`        : credit acquisition exceeded its wait budget
/// - `TransportUnblocked`        : a blocking call was released by failover
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    SessionClosed,
    NotXa,
    TransactionRolledBack,
    TransactionOutcomeUnknown,
    Retryable,
    RollbackOnOtherBranch,
    ResourceError,
    FlowControlTimeout,
    TransportUnblocked,
    Transport,
    InvalidArgument,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::SessionClosed => "session_closed",
            ErrorKind::NotXa => "not_xa",
            ErrorKind::TransactionRolledBack => "transaction_rolled_back",
            ErrorKind::TransactionOutcomeUnknown => "transaction_outcome_unknown",
            ErrorKind::Retryable => "retryable",
            ErrorKind::RollbackOnOtherBranch => "rollback_on_other_branch",
            ErrorKind::ResourceError => "resource_error",
            ErrorKind::FlowControlTimeout => "flow_control_timeout",
            ErrorKind::TransportUnblocked => "transport_unblocked",
            ErrorKind::Transport => "transport",
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Top-level error type that all layer-specific errors convert into.
#[derive(Error, Debug)]
pub enum LumenError {
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("XA error: {0}")]
    Xa(#[from] XaError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Flow control error: {0}")]
    FlowControl(#[from] FlowControlError),

    #[error("Transaction error: {0}")]
    Txn(#[from] TxnError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

// ── Transport ───────────────────────────────────────────────────────────────

/// Classification of a failure reported by the wire boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// A blocking call was released because the connection failed over.
    /// The server response, if any, was never observed.
    Unblocked,
    /// The server shut down or dropped the connection.
    Disconnected,
    /// No live connection is available.
    NotConnected,
    /// No response arrived within the call timeout.
    ConnectionTimedOut,
    /// The broker rejected an XA call with this code.
    XaRejected(XaErrorCode),
    /// Anything else the transport could not classify.
    Internal,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportErrorKind::Unblocked => write!(f, "UNBLOCKED"),
            TransportErrorKind::Disconnected => write!(f, "DISCONNECTED"),
            TransportErrorKind::NotConnected => write!(f, "NOT_CONNECTED"),
            TransportErrorKind::ConnectionTimedOut => write!(f, "CONNECTION_TIMEDOUT"),
            TransportErrorKind::XaRejected(code) => write!(f, "XA_REJECTED({})", code),
            TransportErrorKind::Internal => write!(f, "INTERNAL"),
        }
    }
}

/// Error returned by every remote context call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn unblocked(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Unblocked, message)
    }

    pub fn disconnected(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Disconnected, message)
    }

    pub fn xa_rejected(code: XaErrorCode, message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::XaRejected(code), message)
    }

    pub fn is_unblocked(&self) -> bool {
        self.kind == TransportErrorKind::Unblocked
    }

    /// The broker-side XA code, if the broker rejected the call outright.
    pub fn xa_code(&self) -> Option<XaErrorCode> {
        match self.kind {
            TransportErrorKind::XaRejected(code) => Some(code),
            _ => None,
        }
    }
}

// ── Session ─────────────────────────────────────────────────────────────────

/// Session-level failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Session is closed")]
    Closed,

    #[error("Transaction rolled back: {0}")]
    TransactionRolledBack(String),

    #[error("Transaction outcome unknown: {0}")]
    TransactionOutcomeUnknown(String),

    #[error("Queue {0} cannot be both durable and temporary")]
    QueueMisconfigured(String),

    #[error("Consumer {0} is closed")]
    ConsumerClosed(u64),

    #[error("Producer {0} is closed")]
    ProducerClosed(u64),

    #[error("Session {0} is not an XA session")]
    NotXa(String),

    #[error("No destination address: producer is anonymous and the message carries none")]
    NoAddress,
}

// ── XA ──────────────────────────────────────────────────────────────────────

/// X/Open XA error and return codes surfaced to a transaction manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum XaErrorCode {
    /// XA_RETRY: routine returned with no effect and may be reissued.
    Retry,
    /// XA_HEURMIX: partially committed and partially rolled back.
    HeuristicMixed,
    /// XA_HEURRB: heuristically rolled back.
    HeuristicRollback,
    /// XA_HEURCOM: heuristically committed.
    HeuristicCommit,
    /// XA_HEURHAZ: may have been committed or rolled back.
    HeuristicHazard,
    /// XA_RBROLLBACK: rolled back for an unspecified reason.
    RollbackUnspecified,
    /// XA_RBCOMMFAIL: rolled back due to a communication failure.
    RollbackCommFail,
    /// XA_RBOTHER: the resource manager rolled back for a reason not listed.
    RollbackOther,
    /// XA_RBTIMEOUT: the transaction branch took too long.
    RollbackTimeout,
    /// XAER_RMERR: a resource manager error occurred.
    ResourceError,
    /// XAER_NOTA: the XID is not valid.
    NotA,
    /// XAER_INVAL: invalid arguments.
    Invalid,
    /// XAER_PROTO: routine invoked in an improper context.
    Protocol,
    /// XAER_RMFAIL: resource manager unavailable.
    ResourceFail,
    /// XAER_DUPID: the XID already exists.
    DuplicateId,
}

impl XaErrorCode {
    /// Integer value as defined by the X/Open XA specification.
    pub fn as_raw(self) -> i32 {
        match self {
            XaErrorCode::Retry => 4,
            XaErrorCode::HeuristicMixed => 5,
            XaErrorCode::HeuristicRollback => 6,
            XaErrorCode::HeuristicCommit => 7,
            XaErrorCode::HeuristicHazard => 8,
            XaErrorCode::RollbackUnspecified => 100,
            XaErrorCode::RollbackCommFail => 101,
            XaErrorCode::RollbackOther => 104,
            XaErrorCode::RollbackTimeout => 106,
            XaErrorCode::ResourceError => -3,
            XaErrorCode::NotA => -4,
            XaErrorCode::Invalid => -5,
            XaErrorCode::Protocol => -6,
            XaErrorCode::ResourceFail => -7,
            XaErrorCode::DuplicateId => -8,
        }
    }

    pub fn from_raw(raw: i32) -> Option<Self> {
        let code = match raw {
            4 => XaErrorCode::Retry,
            5 => XaErrorCode::HeuristicMixed,
            6 => XaErrorCode::HeuristicRollback,
            7 => XaErrorCode::HeuristicCommit,
            8 => XaErrorCode::HeuristicHazard,
            100 => XaErrorCode::RollbackUnspecified,
            101 => XaErrorCode::RollbackCommFail,
            104 => XaErrorCode::RollbackOther,
            106 => XaErrorCode::RollbackTimeout,
            -3 => XaErrorCode::ResourceError,
            -4 => XaErrorCode::NotA,
            -5 => XaErrorCode::Invalid,
            -6 => XaErrorCode::Protocol,
            -7 => XaErrorCode::ResourceFail,
            -8 => XaErrorCode::DuplicateId,
            _ => return None,
        };
        Some(code)
    }

    /// True for the XA_RB* range: the branch has been rolled back.
    pub fn is_rollback(self) -> bool {
        (100..=107).contains(&self.as_raw())
    }
}

impl std::fmt::Display for XaErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            XaErrorCode::Retry => "XA_RETRY",
            XaErrorCode::HeuristicMixed => "XA_HEURMIX",
            XaErrorCode::HeuristicRollback => "XA_HEURRB",
            XaErrorCode::HeuristicCommit => "XA_HEURCOM",
            XaErrorCode::HeuristicHazard => "XA_HEURHAZ",
            XaErrorCode::RollbackUnspecified => "XA_RBROLLBACK",
            XaErrorCode::RollbackCommFail => "XA_RBCOMMFAIL",
            XaErrorCode::RollbackOther => "XA_RBOTHER",
            XaErrorCode::RollbackTimeout => "XA_RBTIMEOUT",
            XaErrorCode::ResourceError => "XAER_RMERR",
            XaErrorCode::NotA => "XAER_NOTA",
            XaErrorCode::Invalid => "XAER_INVAL",
            XaErrorCode::Protocol => "XAER_PROTO",
            XaErrorCode::ResourceFail => "XAER_RMFAIL",
            XaErrorCode::DuplicateId => "XAER_DUPID",
        };
        write!(f, "{}({})", name, self.as_raw())
    }
}

/// An XA outcome reported to the transaction manager.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct XaError {
    pub code: XaErrorCode,
    pub message: String,
    /// Transport failure that triggered this outcome, if any.
    pub cause: Option<TransportError>,
}

impl XaError {
    pub fn new(code: XaErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            cause: None,
        }
    }

    pub fn with_cause(mut self, cause: TransportError) -> Self {
        self.cause = Some(cause);
        self
    }

    pub fn retry(message: impl Into<String>) -> Self {
        Self::new(XaErrorCode::Retry, message)
    }

    pub fn rollback_other(message: impl Into<String>) -> Self {
        Self::new(XaErrorCode::RollbackOther, message)
    }

    pub fn resource_error(message: impl Into<String>) -> Self {
        Self::new(XaErrorCode::ResourceError, message)
    }
}

// ── Flow control ────────────────────────────────────────────────────────────

/// Producer credit acquisition failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FlowControlError {
    #[error("timed out after {waited_ms}ms waiting for {credits_needed} credits on {address}")]
    Timeout {
        address: String,
        waited_ms: u64,
        credits_needed: u64,
    },

    #[error("credits for {0} were closed while waiting")]
    Closed(String),

    #[error("address {address} is full, {credits} credits refused")]
    AddressFull { address: String, credits: u64 },
}

// ── Broker-side transactions ────────────────────────────────────────────────

/// Resource manager / transaction engine errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TxnError {
    #[error("Transaction {0} already registered")]
    DuplicateXid(Xid),

    #[error("Transaction {0} not found")]
    NotFound(Xid),

    #[error("Transaction {xid} invalid state transition: {from} → {to}")]
    InvalidTransition { xid: Xid, from: String, to: String },

    #[error("Transaction {xid} rollback failed: {reason}")]
    RollbackFailed { xid: Xid, reason: String },
}

// ── Configuration ───────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

// ── LumenError classification & helpers ─────────────────────────────────────

impl LumenError {
    /// Classify this error for retry / rollback decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            LumenError::Session(SessionError::Closed) => ErrorKind::SessionClosed,
            LumenError::Session(SessionError::NotXa(_)) => ErrorKind::NotXa,
            LumenError::Session(SessionError::TransactionRolledBack(_)) => {
                ErrorKind::TransactionRolledBack
            }
            LumenError::Session(SessionError::TransactionOutcomeUnknown(_)) => {
                ErrorKind::TransactionOutcomeUnknown
            }
            LumenError::Session(SessionError::ConsumerClosed(_))
            | LumenError::Session(SessionError::ProducerClosed(_)) => ErrorKind::SessionClosed,
            LumenError::Session(SessionError::QueueMisconfigured(_))
            | LumenError::Session(SessionError::NoAddress) => ErrorKind::InvalidArgument,

            LumenError::Xa(e) => match e.code {
                XaErrorCode::Retry => ErrorKind::Retryable,
                XaErrorCode::RollbackOther => ErrorKind::RollbackOnOtherBranch,
                code if code.is_rollback() => ErrorKind::TransactionRolledBack,
                _ => ErrorKind::ResourceError,
            },

            LumenError::Transport(e) if e.is_unblocked() => ErrorKind::TransportUnblocked,
            LumenError::Transport(_) => ErrorKind::Transport,

            LumenError::FlowControl(FlowControlError::Timeout { .. }) => {
                ErrorKind::FlowControlTimeout
            }
            LumenError::FlowControl(FlowControlError::Closed(_)) => ErrorKind::SessionClosed,
            LumenError::FlowControl(FlowControlError::AddressFull { .. }) => {
                ErrorKind::ResourceError
            }

            LumenError::Txn(TxnError::DuplicateXid(_))
            | LumenError::Txn(TxnError::NotFound(_))
            | LumenError::Txn(TxnError::InvalidTransition { .. }) => ErrorKind::InvalidArgument,
            LumenError::Txn(TxnError::RollbackFailed { .. }) => ErrorKind::ResourceError,

            LumenError::Config(_) | LumenError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            LumenError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// The caller (typically a transaction manager) should re-drive the call.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Retryable)
    }

    /// The transaction may or may not have been applied on the broker.
    pub fn is_outcome_unknown(&self) -> bool {
        matches!(self.kind(), ErrorKind::TransactionOutcomeUnknown)
    }

    /// XA code to report to an external transaction manager.
    pub fn xa_code(&self) -> Option<XaErrorCode> {
        match self {
            LumenError::Xa(e) => Some(e.code),
            LumenError::Session(SessionError::NotXa(_)) => Some(XaErrorCode::ResourceError),
            _ => None,
        }
    }

    pub fn closed() -> Self {
        LumenError::Session(SessionError::Closed)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        LumenError::Internal(message.into())
    }
}
