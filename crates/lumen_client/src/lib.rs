//! Client side of the Lumen messaging layer: sessions that survive broker
//! failover, producer credit flow control, and the XA bridge.

pub mod consumer;
pub mod credits;
pub mod executor;
pub mod factory;
pub mod message;
pub mod producer;
pub mod rate_limit;
pub mod registry;
pub mod remote;
pub mod session;
mod shared;
pub mod xa;

#[cfg(test)]
mod testing;
#[cfg(test)]
mod tests;

pub use consumer::{ClientConsumer, MessageHandler};
pub use credits::{CreditMode, CreditRequester, CreditSnapshot, ProducerCreditManager, ProducerCredits};
pub use factory::{ClientSessionFactory, ConnectionEvent, ConnectionListener, SessionFactory};
pub use message::ClientMessage;
pub use producer::ClientProducer;
pub use remote::{
    ConnectionInfo, ConsumerSpec, PrepareVote, RemoteContext, RemoteResult, SessionConnector,
    SessionParams,
};
pub use session::{detached_factory, ClientSession, ConsumerOptions, FailoverOutcome};
pub use xa::{ResourceIdentity, XaResource, XaSession};
