//! Retained message store
//!
//! topic -> last retained payload. A retained publish with an empty payload
//! deletes the entry, per the MQTT retain-clear rule, so every stored entry
//! has a non-empty payload.

use ahash::AHashMap;
use bytes::Bytes;

use crate::protocol::QoS;

/// A stored retained message
#[derive(Debug, Clone)]
pub struct RetainedMessage {
    pub payload: Bytes,
    /// QoS the message was published with; replay downgrades to the
    /// subscriber's granted QoS
    pub qos: QoS,
}

#[derive(Debug, Default)]
pub struct RetainedStore {
    messages: AHashMap<String, RetainedMessage>,
}

impl RetainedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store or clear the retained message for a topic
    pub fn set(&mut self, topic: String, payload: Bytes, qos: QoS) {
        if payload.is_empty() {
            self.messages.remove(&topic);
        } else {
            self.messages.insert(topic, RetainedMessage { payload, qos });
        }
    }

    pub fn get(&self, topic: &str) -> Option<&RetainedMessage> {
        self.messages.get(topic)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &RetainedMessage)> {
        self.messages.iter()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
