use std::collections::HashMap;

use lumen_common::types::{now_millis, MessageId};

/// Fixed per-message encoding overhead used for credit accounting.
pub const MESSAGE_HEADER_OVERHEAD: usize = 64;

/// A message as seen by the client session.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientMessage {
    /// Broker-assigned id; set on delivered messages only.
    pub id: Option<MessageId>,
    /// Destination. `None` on the wire means "the session default address".
    pub address: Option<String>,
    pub durable: bool,
    pub priority: u8,
    pub timestamp_ms: u64,
    pub expiration_ms: u64,
    pub delivery_count: u32,
    pub properties: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl ClientMessage {
    pub fn new(durable: bool) -> Self {
        Self::with_capacity(durable, 0)
    }

    /// A message whose body buffer is pre-sized to `capacity` bytes.
    pub fn with_capacity(durable: bool, capacity: usize) -> Self {
        Self {
            id: None,
            address: None,
            durable,
            priority: 4,
            timestamp_ms: now_millis(),
            expiration_ms: 0,
            delivery_count: 0,
            properties: HashMap::new(),
            body: Vec::with_capacity(capacity),
        }
    }

    /// A message as delivered by the broker.
    pub fn delivered(id: u64, body: impl Into<Vec<u8>>) -> Self {
        let mut msg = Self::new(true);
        msg.id = Some(MessageId(id));
        msg.body = body.into();
        msg.delivery_count = 1;
        msg
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.properties.insert(key.into(), value.into());
    }

    /// Approximate encoded size, used for producer and consumer credits.
    pub fn encode_size(&self) -> usize {
        let props: usize = self
            .properties
            .iter()
            .map(|(k, v)| k.len() + v.len() + 8)
            .sum();
        MESSAGE_HEADER_OVERHEAD
            + self.address.as_ref().map_or(0, |a| a.len())
            + props
            + self.body.len()
    }
}
