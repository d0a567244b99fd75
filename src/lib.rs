//! driftmq - MQTT v3.1.1 broker with scriptable subscribers
//!
//! A publish/subscribe broker that routes messages among TCP clients and
//! user-registered scripts. All broker state is owned by a single writer
//! draining a change-request queue; connection I/O runs on the tokio runtime.

pub mod broker;
pub mod codec;
pub mod config;
pub mod protocol;
pub mod scripts;
pub mod session;
pub mod topic;

pub use broker::{Broker, BrokerConfig};
pub use config::Config;
pub use protocol::{ProtocolVersion, QoS};
pub use scripts::{Script, ScriptRunType, SyncAction};
