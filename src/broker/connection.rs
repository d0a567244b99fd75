//! Client connections and the per-socket handler task
//!
//! `ClientConnection` holds one client's MQTT state: the state machine
//! position, identity, will, keep-alive bookkeeping, send queue, and the
//! link to its persistent session. It is shared (via `Arc`) between the
//! connection task that drives the socket and the state writer that
//! dispatches publishes to it.
//!
//! `ConnectionHandler` is the tokio task wrapped around one `TcpStream`:
//! it decodes inbound packets, applies the per-state packet rules, answers
//! the QoS handshakes, and forwards state mutations to the writer as
//! change requests.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::broker::send_queue::SendQueue;
use crate::broker::state::{AppState, ChangeRequest, RequestMode};
use crate::broker::BrokerConfig;
use crate::codec::Decoder;
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, DecodeError, Packet, ProtocolVersion, PubAck, PubComp,
    PubRec, PubRel, Publish, QoS, SubAck, SubAckCode, UnsubAck, Will,
};
use crate::session::{InflightPacket, InflightStage, PersistentSession};
use crate::topic::check_topic_filter;

/// Stable connection identifier.
///
/// Subscriptions and sessions refer to connections by id, never by
/// reference; the writer resolves ids against the client registry under the
/// state lock, so a reaped connection simply stops resolving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        ConnectionId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    #[cfg(test)]
    pub(crate) fn from_raw(raw: u64) -> Self {
        ConnectionId(raw)
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// MQTT connection state machine position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Accepted, nothing but CONNECT is legal
    Initial,
    /// CONNECT accepted, session bound
    Connected,
    /// Socket closed or closing, awaiting reap
    LoggedOut,
}

/// Mutable connection metadata, guarded by one mutex
#[derive(Debug)]
struct ConnectionInfo {
    state: ConnectionState,
    client_id: String,
    protocol_version: ProtocolVersion,
    keep_alive_secs: u16,
    last_recv: Instant,
    will: Option<Will>,
}

pub struct ClientConnection {
    id: ConnectionId,
    addr: SocketAddr,
    info: Mutex<ConnectionInfo>,
    session: Mutex<Option<Arc<PersistentSession>>>,
    send_queue: SendQueue,
}

impl ClientConnection {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            id: ConnectionId::next(),
            addr,
            info: Mutex::new(ConnectionInfo {
                state: ConnectionState::Initial,
                client_id: String::new(),
                protocol_version: ProtocolVersion::V311,
                keep_alive_secs: 0,
                last_recv: Instant::now(),
                will: None,
            }),
            session: Mutex::new(None),
            send_queue: SendQueue::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn send_queue(&self) -> &SendQueue {
        &self.send_queue
    }

    pub fn state(&self) -> ConnectionState {
        self.info.lock().state
    }

    pub fn set_state(&self, state: ConnectionState) {
        self.info.lock().state = state;
    }

    pub fn client_id(&self) -> String {
        self.info.lock().client_id.clone()
    }

    pub fn set_client_id(&self, client_id: &str) {
        self.info.lock().client_id = client_id.to_string();
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        self.info.lock().protocol_version
    }

    pub fn keep_alive_secs(&self) -> u16 {
        self.info.lock().keep_alive_secs
    }

    /// Record packet arrival for the keep-alive sweep
    pub fn touch_recv(&self) {
        self.info.lock().last_recv = Instant::now();
    }

    pub fn last_recv(&self) -> Instant {
        self.info.lock().last_recv
    }

    pub fn set_will(&self, will: Option<Will>) {
        self.info.lock().will = will;
    }

    /// Take the will out (publishing it, or discarding it on a graceful
    /// DISCONNECT)
    pub fn take_will(&self) -> Option<Will> {
        self.info.lock().will.take()
    }

    pub fn session(&self) -> Option<Arc<PersistentSession>> {
        self.session.lock().clone()
    }

    pub fn set_session(&self, session: Arc<PersistentSession>) {
        *self.session.lock() = Some(session);
    }

    pub fn clear_session(&self) -> Option<Arc<PersistentSession>> {
        self.session.lock().take()
    }

    fn apply_connect(&self, connect: &Connect, default_keep_alive: u16) {
        let mut info = self.info.lock();
        info.protocol_version = connect.protocol_version;
        info.keep_alive_secs = if connect.keep_alive == 0 {
            default_keep_alive
        } else {
            connect.keep_alive
        };
        info.last_recv = Instant::now();
        info.will = connect.will.clone();
    }

    /// Enqueue a non-PUBLISH packet for this connection
    pub fn send_packet(&self, packet: &Packet) {
        self.send_queue.push_packet(packet);
    }

    /// Deliver a publish to this connection at
    /// `min(publish QoS, granted QoS)`. QoS 1/2 deliveries allocate a packet
    /// id from the session and record the encoded packet until acked.
    pub fn publish(&self, topic: &str, payload: &Bytes, publish_qos: QoS, granted_qos: QoS, retained: bool) {
        let qos = publish_qos.min(granted_qos);

        let mut packet = Publish {
            dup: false,
            qos,
            retain: retained,
            topic: topic.to_string(),
            packet_id: None,
            payload: payload.clone(),
        };

        if qos == QoS::AtMostOnce {
            self.send_packet(&Packet::Publish(packet));
            return;
        }

        let Some(session) = self.session() else {
            // no session bound (connection mid-login); deliver best-effort
            packet.qos = QoS::AtMostOnce;
            self.send_packet(&Packet::Publish(packet));
            return;
        };

        let mut state = session.lock();
        let packet_id = state.next_packet_id();
        packet.packet_id = Some(packet_id);

        let mut buf = BytesMut::new();
        if crate::codec::Encoder::new()
            .encode(&Packet::Publish(packet), &mut buf)
            .is_err()
        {
            warn!(connection = %self.id, topic, "dropping undeliverable publish");
            return;
        }
        let bytes = buf.freeze();

        state.sending_high_qos.insert(
            packet_id,
            InflightPacket {
                bytes: bytes.clone(),
                qos,
                stage: if qos == QoS::AtLeastOnce {
                    InflightStage::AwaitingPuback
                } else {
                    InflightStage::AwaitingPubrec
                },
            },
        );
        drop(state);

        self.send_queue.push_bytes(&bytes);
    }
}

impl std::fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("state", &self.state())
            .finish()
    }
}

/// Connection task error
#[derive(Debug)]
pub(crate) enum ConnectionError {
    Io(std::io::Error),
    Decode(DecodeError),
    /// Packet illegal in the connection's current state
    Violation(&'static str),
    /// CONNECT did not arrive in time
    ConnectTimeout,
    /// Clean shutdown (DISCONNECT received or logout observed)
    Shutdown,
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::Io(e) => write!(f, "io error: {}", e),
            ConnectionError::Decode(e) => write!(f, "decode error: {}", e),
            ConnectionError::Violation(msg) => write!(f, "protocol violation: {}", msg),
            ConnectionError::ConnectTimeout => write!(f, "timed out waiting for CONNECT"),
            ConnectionError::Shutdown => write!(f, "shutdown"),
        }
    }
}

impl From<std::io::Error> for ConnectionError {
    fn from(e: std::io::Error) -> Self {
        ConnectionError::Io(e)
    }
}

impl From<DecodeError> for ConnectionError {
    fn from(e: DecodeError) -> Self {
        ConnectionError::Decode(e)
    }
}

/// Drives one accepted socket
pub(crate) struct ConnectionHandler {
    stream: TcpStream,
    conn: Arc<ClientConnection>,
    app: AppState,
    config: Arc<BrokerConfig>,
    decoder: Decoder,
    read_buf: BytesMut,
}

impl ConnectionHandler {
    pub(crate) fn new(
        stream: TcpStream,
        conn: Arc<ClientConnection>,
        app: AppState,
        config: Arc<BrokerConfig>,
    ) -> Self {
        let decoder = Decoder::new().with_max_packet_size(config.max_packet_size);
        Self {
            stream,
            conn,
            app,
            config,
            decoder,
            read_buf: BytesMut::with_capacity(4096),
        }
    }

    pub(crate) async fn run(mut self) {
        match self.drive().await {
            Ok(()) | Err(ConnectionError::Shutdown) => {}
            Err(e) => {
                debug!(connection = %self.conn.id(), addr = %self.conn.addr(), "connection error: {}", e);
            }
        }

        // Whatever ended the task, make sure the writer logs the client out
        // (idempotent when it already has).
        self.app.request_change(
            ChangeRequest::Disconnect {
                connection: self.conn.id(),
            },
            RequestMode::Async,
        );
    }

    async fn drive(&mut self) -> Result<(), ConnectionError> {
        match timeout(self.config.connect_timeout, self.read_connect()).await {
            Ok(result) => result?,
            Err(_) => {
                debug!(addr = %self.conn.addr(), "connect timeout");
                return Err(ConnectionError::ConnectTimeout);
            }
        }

        self.run_connected().await
    }

    /// Wait for the first packet, which must be a valid CONNECT
    async fn read_connect(&mut self) -> Result<(), ConnectionError> {
        loop {
            let decoded = match self.decoder.decode(&self.read_buf) {
                Ok(d) => d,
                Err(
                    e @ (DecodeError::UnsupportedProtocolVersion(_)
                    | DecodeError::InvalidProtocolName),
                ) => {
                    // only this class of CONNECT failure gets a response
                    self.reject_connect(ConnectReturnCode::UnacceptableProtocolVersion)
                        .await;
                    return Err(e.into());
                }
                Err(e) => return Err(e.into()),
            };

            if let Some((packet, consumed)) = decoded {
                self.read_buf.advance(consumed);

                let connect = match packet {
                    Packet::Connect(connect) => connect,
                    _ => return Err(ConnectionError::Violation("expected CONNECT")),
                };

                if connect.client_id.is_empty() && !connect.clean_session {
                    // [MQTT-3.1.3-8]: a zero-length client id requires a
                    // clean session
                    self.reject_connect(ConnectReturnCode::IdentifierRejected)
                        .await;
                    return Err(ConnectionError::Violation(
                        "empty client id without clean session",
                    ));
                }

                self.conn
                    .apply_connect(&connect, self.config.default_keep_alive);

                // The writer validates the session table, deposes any
                // previous holder of the client id, and sends CONNACK.
                // Executed synchronously so the state transition is visible
                // before we read the next packet.
                self.app.request_change(
                    ChangeRequest::Login {
                        connection: self.conn.clone(),
                        client_id: connect.client_id,
                        clean_session: connect.clean_session,
                    },
                    RequestMode::Sync,
                );

                return Ok(());
            }

            let n = self.stream.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(ConnectionError::Violation("closed before CONNECT"));
            }
        }
    }

    /// Write a CONNACK refusal straight to the socket and flush
    async fn reject_connect(&mut self, return_code: ConnectReturnCode) {
        let mut buf = BytesMut::new();
        let connack = Packet::ConnAck(ConnAck {
            session_present: false,
            return_code,
        });
        if crate::codec::Encoder::new().encode(&connack, &mut buf).is_ok() {
            let _ = self.stream.write_all(&buf).await;
            let _ = self.stream.flush().await;
        }
    }

    async fn run_connected(&mut self) -> Result<(), ConnectionError> {
        loop {
            tokio::select! {
                result = self.stream.read_buf(&mut self.read_buf) => {
                    match result {
                        Ok(0) => {
                            debug!(connection = %self.conn.id(), "connection closed by peer");
                            return Ok(());
                        }
                        Ok(_) => {
                            while let Some((packet, consumed)) = self.decoder.decode(&self.read_buf)? {
                                self.read_buf.advance(consumed);
                                self.conn.touch_recv();
                                self.handle_packet(packet)?;
                            }
                        }
                        Err(e) => {
                            debug!(connection = %self.conn.id(), "read error: {}", e);
                            return Err(e.into());
                        }
                    }
                }

                _ = self.conn.send_queue().notified() => {
                    let data = self.conn.send_queue().take_buffer();
                    if !data.is_empty() {
                        if let Err(e) = self.stream.write_all(&data).await {
                            debug!(connection = %self.conn.id(), "write error: {}", e);
                            // sticky; the writer reaps on its next cleanup
                            self.conn.send_queue().mark_send_error();
                        }
                    }
                    if !self.conn.send_queue().is_alive() {
                        return Err(ConnectionError::Shutdown);
                    }
                }
            }
        }
    }

    fn handle_packet(&mut self, packet: Packet) -> Result<(), ConnectionError> {
        match packet {
            Packet::Connect(_) => Err(ConnectionError::Violation("duplicate CONNECT")),
            Packet::Publish(publish) => {
                self.handle_publish(publish);
                Ok(())
            }
            Packet::PubAck(PubAck { packet_id }) => {
                self.ack_outbound(packet_id, InflightStage::AwaitingPuback);
                Ok(())
            }
            Packet::PubRec(PubRec { packet_id }) => {
                // advance the QoS 2 exchange and answer PUBREL
                if let Some(session) = self.conn.session() {
                    let mut state = session.lock();
                    if let Some(inflight) = state.sending_high_qos.get_mut(&packet_id) {
                        inflight.stage = InflightStage::AwaitingPubcomp;
                    }
                }
                self.conn.send_packet(&Packet::PubRel(PubRel { packet_id }));
                Ok(())
            }
            Packet::PubComp(PubComp { packet_id }) => {
                self.ack_outbound(packet_id, InflightStage::AwaitingPubcomp);
                Ok(())
            }
            Packet::PubRel(PubRel { packet_id }) => {
                if let Some(session) = self.conn.session() {
                    session.lock().receiving_qos2.remove(&packet_id);
                }
                self.conn
                    .send_packet(&Packet::PubComp(PubComp { packet_id }));
                Ok(())
            }
            Packet::Subscribe(subscribe) => {
                let mut return_codes = Vec::with_capacity(subscribe.filters.len());
                for f in &subscribe.filters {
                    if check_topic_filter(&f.filter).is_ok() {
                        return_codes.push(SubAckCode::granted(f.qos));
                    } else {
                        return_codes.push(SubAckCode::Failure);
                    }
                }

                // SUBACK goes onto the send queue first, so any retained
                // replay publishes follow it in FIFO order
                self.conn.send_packet(&Packet::SubAck(SubAck {
                    packet_id: subscribe.packet_id,
                    return_codes: return_codes.clone(),
                }));

                for (f, code) in subscribe.filters.into_iter().zip(return_codes) {
                    if code == SubAckCode::Failure {
                        continue;
                    }
                    self.app.request_change(
                        ChangeRequest::Subscribe {
                            subscriber: crate::broker::Subscriber::Connection(self.conn.id()),
                            filter: f.filter,
                            qos: Some(f.qos),
                        },
                        RequestMode::Async,
                    );
                }
                Ok(())
            }
            Packet::Unsubscribe(unsubscribe) => {
                self.conn.send_packet(&Packet::UnsubAck(UnsubAck {
                    packet_id: unsubscribe.packet_id,
                }));
                for filter in unsubscribe.filters {
                    self.app.request_change(
                        ChangeRequest::Unsubscribe {
                            subscriber: crate::broker::Subscriber::Connection(self.conn.id()),
                            filter,
                        },
                        RequestMode::Async,
                    );
                }
                Ok(())
            }
            Packet::PingReq => {
                self.conn.send_packet(&Packet::PingResp);
                Ok(())
            }
            Packet::Disconnect => {
                // graceful: the will is discarded, never published
                self.conn.take_will();
                Err(ConnectionError::Shutdown)
            }
            Packet::ConnAck(_) | Packet::SubAck(_) | Packet::UnsubAck(_) | Packet::PingResp => {
                Err(ConnectionError::Violation("server-only packet from client"))
            }
        }
    }

    fn handle_publish(&mut self, publish: Publish) {
        match publish.qos {
            QoS::AtMostOnce => {
                self.forward_publish(publish);
            }
            QoS::AtLeastOnce => {
                let packet_id = publish.packet_id;
                self.forward_publish(publish);
                if let Some(packet_id) = packet_id {
                    self.conn.send_packet(&Packet::PubAck(PubAck { packet_id }));
                }
            }
            QoS::ExactlyOnce => {
                let Some(packet_id) = publish.packet_id else {
                    return;
                };
                let fresh = match self.conn.session() {
                    Some(session) => session.lock().receiving_qos2.insert(packet_id),
                    None => true,
                };
                // a replayed packet id is acked again but dispatched once
                if fresh {
                    self.forward_publish(publish);
                }
                self.conn.send_packet(&Packet::PubRec(PubRec { packet_id }));
            }
        }
    }

    fn forward_publish(&self, publish: Publish) {
        self.app.request_change(
            ChangeRequest::Publish {
                topic: publish.topic,
                payload: publish.payload,
                qos: publish.qos,
                retain: publish.retain,
            },
            RequestMode::Async,
        );
    }

    /// Clear an outbound inflight entry once its final ack arrives
    fn ack_outbound(&self, packet_id: u16, expected: InflightStage) {
        if let Some(session) = self.conn.session() {
            let mut state = session.lock();
            if state
                .sending_high_qos
                .get(&packet_id)
                .is_some_and(|p| p.stage == expected)
            {
                state.sending_high_qos.remove(&packet_id);
            }
        }
    }
}
