//! Shared building blocks for the Lumen session-continuity and XA
//! coordination layer: the error taxonomy, transaction identifiers,
//! configuration and background-task shutdown signalling.

pub mod config;
pub mod error;
pub mod shutdown;
pub mod types;

pub use config::{CreditConfig, LumenConfig, ResourceManagerConfig, SessionConfig};
pub use error::{
    ConfigError, ErrorKind, FlowControlError, LumenError, LumenResult, SessionError,
    TransportError, TransportErrorKind, TxnError, XaError, XaErrorCode,
};
pub use shutdown::ShutdownSignal;
pub use types::{ConsumerId, MessageId, ProducerId, Xid};
