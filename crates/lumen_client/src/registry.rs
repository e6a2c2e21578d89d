//! Child registries of a session.
//!
//! Consumers are kept in insertion order because failover re-creates them on
//! the broker in that order. Both registries hand out snapshots so callers
//! iterate without holding the registry lock while children run wire calls.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use lumen_common::types::{ConsumerId, ProducerId};

use crate::consumer::ClientConsumer;
use crate::producer::ClientProducer;

#[derive(Default)]
pub struct ConsumerRegistry {
    entries: Mutex<Vec<Arc<ClientConsumer>>>,
}

impl ConsumerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a consumer. An entry with the same id is replaced in place.
    pub fn insert(&self, consumer: Arc<ClientConsumer>) {
        let mut entries = self.entries.lock();
        match entries.iter_mut().find(|c| c.id() == consumer.id()) {
            Some(slot) => *slot = consumer,
            None => entries.push(consumer),
        }
    }

    pub fn remove(&self, id: ConsumerId) -> Option<Arc<ClientConsumer>> {
        let mut entries = self.entries.lock();
        let pos = entries.iter().position(|c| c.id() == id)?;
        Some(entries.remove(pos))
    }

    pub fn get(&self, id: ConsumerId) -> Option<Arc<ClientConsumer>> {
        self.entries.lock().iter().find(|c| c.id() == id).cloned()
    }

    /// Consumers in insertion order.
    pub fn snapshot(&self) -> Vec<Arc<ClientConsumer>> {
        self.entries.lock().clone()
    }

    pub fn ids(&self) -> Vec<ConsumerId> {
        self.entries.lock().iter().map(|c| c.id()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[derive(Default)]
pub struct ProducerRegistry {
    entries: Mutex<HashMap<ProducerId, Arc<ClientProducer>>>,
}

impl ProducerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, producer: Arc<ClientProducer>) {
        self.entries.lock().insert(producer.id(), producer);
    }

    pub fn remove(&self, id: ProducerId) -> Option<Arc<ClientProducer>> {
        self.entries.lock().remove(&id)
    }

    pub fn snapshot(&self) -> Vec<Arc<ClientProducer>> {
        self.entries.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
