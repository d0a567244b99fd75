//! Persistent session state
//!
//! A session outlives its TCP connection when the client connected with
//! clean_session=false: stored subscriptions and unacknowledged high-QoS
//! packets are kept under the client id until a later CONNECT rebinds them.
//!
//! Locking: everything except the inflight maps is mutated only by the state
//! writer (which also holds the aggregate state lock). Connection tasks clear
//! inflight entries on PUBACK/PUBREC/PUBCOMP under the session mutex alone.

use std::sync::Arc;
use std::time::Instant;

use ahash::{AHashMap, AHashSet};
use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};

use crate::broker::ConnectionId;
use crate::protocol::QoS;

/// A subscription remembered across reconnects
#[derive(Debug, Clone)]
pub struct StoredSubscription {
    /// Topic filter as received
    pub filter: String,
    /// Granted maximum QoS
    pub qos: QoS,
}

/// Where an outbound high-QoS packet is in its acknowledgment exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InflightStage {
    /// QoS 1: PUBLISH sent, waiting for PUBACK
    AwaitingPuback,
    /// QoS 2: PUBLISH sent, waiting for PUBREC
    AwaitingPubrec,
    /// QoS 2: PUBREL sent, waiting for PUBCOMP
    AwaitingPubcomp,
}

/// An unacknowledged outbound QoS 1/2 publish
#[derive(Debug, Clone)]
pub struct InflightPacket {
    /// The encoded PUBLISH as sent
    pub bytes: Bytes,
    /// Delivery QoS
    pub qos: QoS,
    /// Exchange progress
    pub stage: InflightStage,
}

/// Mutable session state, guarded by the session mutex
#[derive(Debug)]
pub struct SessionState {
    /// Clean session flag from the binding CONNECT
    pub clean_session: bool,
    /// The connection currently bound to this session, if any
    pub current_connection: Option<ConnectionId>,
    /// When the last connection detached
    pub last_disconnect: Option<Instant>,
    /// Subscriptions mirrored from the subscription index
    pub subscriptions: Vec<StoredSubscription>,
    /// Outbound QoS 1/2 packets awaiting acknowledgment, by packet id
    pub sending_high_qos: AHashMap<u16, InflightPacket>,
    /// Inbound QoS 2 packet ids awaiting PUBREL
    pub receiving_qos2: AHashSet<u16>,
    next_packet_id: u16,
}

impl SessionState {
    fn new(clean_session: bool) -> Self {
        Self {
            clean_session,
            current_connection: None,
            last_disconnect: None,
            subscriptions: Vec::new(),
            sending_high_qos: AHashMap::with_capacity(16),
            receiving_qos2: AHashSet::with_capacity(8),
            next_packet_id: 1,
        }
    }

    /// Allocate the next outbound packet identifier.
    /// Wraps, never yields 0, and skips ids still awaiting acknowledgment.
    pub fn next_packet_id(&mut self) -> u16 {
        loop {
            let id = self.next_packet_id;
            self.next_packet_id = self.next_packet_id.wrapping_add(1);
            if self.next_packet_id == 0 {
                self.next_packet_id = 1;
            }

            if !self.sending_high_qos.contains_key(&id) {
                return id;
            }
        }
    }

    /// Remember a subscription; an identical filter replaces the old QoS
    pub fn store_subscription(&mut self, filter: &str, qos: QoS) {
        if let Some(existing) = self.subscriptions.iter_mut().find(|s| s.filter == filter) {
            existing.qos = qos;
        } else {
            self.subscriptions.push(StoredSubscription {
                filter: filter.to_string(),
                qos,
            });
        }
    }

    /// Forget a subscription
    pub fn remove_subscription(&mut self, filter: &str) {
        self.subscriptions.retain(|s| s.filter != filter);
    }
}

/// A persistent session entry, shared between the writer and its connection
#[derive(Debug)]
pub struct PersistentSession {
    client_id: String,
    state: Mutex<SessionState>,
}

impl PersistentSession {
    pub fn new(client_id: String, clean_session: bool) -> Self {
        Self {
            client_id,
            state: Mutex::new(SessionState::new(clean_session)),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock()
    }
}

/// client_id -> persistent session
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: AHashMap<String, Arc<PersistentSession>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, client_id: &str) -> Option<&Arc<PersistentSession>> {
        self.sessions.get(client_id)
    }

    pub fn contains(&self, client_id: &str) -> bool {
        self.sessions.contains_key(client_id)
    }

    /// Insert a fresh session, replacing any previous entry for the id
    pub fn insert(&mut self, client_id: String, clean_session: bool) -> Arc<PersistentSession> {
        let session = Arc::new(PersistentSession::new(client_id.clone(), clean_session));
        self.sessions.insert(client_id, session.clone());
        session
    }

    pub fn remove(&mut self, client_id: &str) {
        self.sessions.remove(client_id);
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_id_skips_inflight() {
        let mut state = SessionState::new(true);

        assert_eq!(state.next_packet_id(), 1);
        assert_eq!(state.next_packet_id(), 2);

        state.sending_high_qos.insert(
            3,
            InflightPacket {
                bytes: Bytes::new(),
                qos: QoS::AtLeastOnce,
                stage: InflightStage::AwaitingPuback,
            },
        );

        assert_eq!(state.next_packet_id(), 4);
    }

    #[test]
    fn test_packet_id_wraps_past_zero() {
        let mut state = SessionState::new(true);
        state.next_packet_id = u16::MAX;

        assert_eq!(state.next_packet_id(), u16::MAX);
        // 0 is never a valid packet id
        assert_eq!(state.next_packet_id(), 1);
    }

    #[test]
    fn test_store_subscription_replaces_qos() {
        let mut state = SessionState::new(false);

        state.store_subscription("a/+", QoS::AtMostOnce);
        state.store_subscription("a/+", QoS::AtLeastOnce);

        assert_eq!(state.subscriptions.len(), 1);
        assert_eq!(state.subscriptions[0].qos, QoS::AtLeastOnce);

        state.remove_subscription("a/+");
        assert!(state.subscriptions.is_empty());
    }
}
