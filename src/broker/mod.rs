//! MQTT Broker Core
//!
//! Wires the pieces together: the TCP accept loop, the application state
//! with its writer thread, the periodic cleanup timer, and the public
//! surface for registering scripts and publishing from the server side.

mod connection;
mod retained;
mod send_queue;
mod state;
mod subscriptions;

pub use connection::{ClientConnection, ConnectionId, ConnectionState};
pub use retained::{RetainedMessage, RetainedStore};
pub use send_queue::SendQueue;
pub use state::{AppState, ChangeRequest, RequestMode};
pub use subscriptions::{Subscriber, Subscription, SubscriptionIndex};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::protocol::QoS;
use crate::scripts::{ScriptCtor, ScriptInitOutputs};
use connection::ConnectionHandler;

/// Broker configuration
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// TCP bind address
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections
    pub max_connections: usize,
    /// Maximum accepted packet size
    pub max_packet_size: usize,
    /// Keep alive applied when a client asks for 0 (0 leaves it disabled)
    pub default_keep_alive: u16,
    /// How long a fresh connection may take to send CONNECT
    pub connect_timeout: Duration,
    /// Cadence of the writer's cleanup pass
    pub cleanup_interval: Duration,
    /// How long dispatch waits on an unresponsive Sync script
    pub sync_script_timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:1883".parse().expect("valid default bind addr"),
            max_connections: 100_000,
            max_packet_size: 1024 * 1024, // 1 MB
            default_keep_alive: 0,
            connect_timeout: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(2),
            sync_script_timeout: Duration::from_secs(10),
        }
    }
}

/// The MQTT broker
pub struct Broker {
    config: Arc<BrokerConfig>,
    state: AppState,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        let state = AppState::new(&config);
        Self {
            config: Arc::new(config),
            state,
        }
    }

    /// Handle to the application state (used by embedding code and tests)
    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    /// Run the accept loop. Does not return under normal operation.
    pub async fn run(&self) -> Result<(), std::io::Error> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        info!("MQTT listening on {}", self.config.bind_addr);

        // periodic cleanup: keep-alive sweep + reaping logged-out clients
        let cleanup_state = self.state.clone();
        let cleanup_interval = self.config.cleanup_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cleanup_interval);
            loop {
                ticker.tick().await;
                cleanup_state.request_change(ChangeRequest::Cleanup, RequestMode::Async);
            }
        });

        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    if self.state.connection_count() >= self.config.max_connections {
                        warn!(%addr, "connection limit reached, dropping");
                        continue;
                    }
                    self.handle_connection(stream, addr);
                }
                Err(e) => {
                    error!("failed to accept connection: {}", e);
                }
            }
        }
    }

    fn handle_connection(&self, stream: tokio::net::TcpStream, addr: SocketAddr) {
        let conn = Arc::new(ClientConnection::new(addr));
        self.state.register_connection(conn.clone());

        let handler = ConnectionHandler::new(stream, conn, self.state.clone(), self.config.clone());
        tokio::spawn(handler.run());
    }

    /// Register (or replace) a named script
    pub fn add_script(&self, name: &str, ctor: ScriptCtor) {
        self.state.request_change(
            ChangeRequest::AddScript {
                name: name.to_string(),
                ctor: parking_lot::Mutex::new(Some(ctor)),
                status: parking_lot::Mutex::new(Some(ScriptInitOutputs {
                    success: Box::new(|_| {}),
                    error: Box::new(|_| {}),
                })),
            },
            RequestMode::Async,
        );
    }

    /// Remove a named script, dropping its subscriptions
    pub fn remove_script(&self, name: &str) {
        self.state.request_change(
            ChangeRequest::RemoveScript {
                name: name.to_string(),
            },
            RequestMode::Async,
        );
    }

    /// Subscribe a registered script to a topic filter
    pub fn subscribe_script(&self, name: &str, filter: &str) {
        self.state.request_change(
            ChangeRequest::Subscribe {
                subscriber: Subscriber::Script(name.to_string()),
                filter: filter.to_string(),
                qos: None,
            },
            RequestMode::Async,
        );
    }

    /// Unsubscribe a script from a topic filter
    pub fn unsubscribe_script(&self, name: &str, filter: &str) {
        self.state.request_change(
            ChangeRequest::Unsubscribe {
                subscriber: Subscriber::Script(name.to_string()),
                filter: filter.to_string(),
            },
            RequestMode::Async,
        );
    }

    /// Publish a message from the server side
    pub fn publish(&self, topic: &str, payload: Bytes, qos: QoS, retain: bool) {
        self.state.request_change(
            ChangeRequest::Publish {
                topic: topic.to_string(),
                payload,
                qos,
                retain,
            },
            RequestMode::Async,
        );
    }

    pub fn connection_count(&self) -> usize {
        self.state.connection_count()
    }

    pub fn session_count(&self) -> usize {
        self.state.session_count()
    }

    pub fn retained_count(&self) -> usize {
        self.state.retained_count()
    }

    /// Stop the state writer thread
    pub fn shutdown(&self) {
        self.state.shutdown();
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}
