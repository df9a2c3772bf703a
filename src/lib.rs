//! MQTT 3.1.1 client and broker with pluggable authentication and ACL.
//!
//! This crate provides a complete MQTT 3.1.1 implementation with QoS 0,
//! 1 and 2, persistent sessions, retained messages, wills, and full
//! control over authentication and topic access at every step:
//!
//! - **Connect**: authenticate client credentials
//! - **Publish**: check write permission for the topic
//! - **Subscribe / Receive**: check read permission for the topic
//!
//! ## Components
//!
//! - [`Client`]: MQTT client (mqtt3c)
//! - [`Broker`]: MQTT broker (mqtt3d)
//! - [`Plugin`]: event sink + filter votes on the broker bus
//!
//! ## Example
//!
//! ```no_run
//! use mqtt3::{Broker, BrokerConfig, Client, ClientConfig, QoS};
//!
//! #[tokio::main]
//! async fn main() -> mqtt3::Result<()> {
//!     // Start broker
//!     let broker = Broker::new(BrokerConfig::new("127.0.0.1:1883"));
//!     tokio::spawn(async move { broker.serve().await });
//!
//!     // Connect client
//!     let client = Client::connect(ClientConfig::new("127.0.0.1:1883", "client-1")).await?;
//!
//!     // Subscribe and publish
//!     client.subscribe(&[("test/topic", QoS::AtLeastOnce)]).await?;
//!     client.publish_qos("test/topic", b"hello", QoS::AtLeastOnce, false).await?;
//!
//!     // Receive message
//!     let msg = client.recv().await?;
//!     println!("Received: {:?}", msg);
//!
//!     Ok(())
//! }
//! ```

mod broker;
mod client;
pub mod config;
mod error;
mod handler;
pub mod plugin;
pub mod protocol;
mod session;
pub mod sys;
pub mod transport;
pub mod trie;
mod types;

pub use broker::{Broker, BrokerBuilder};
pub use client::{Client, ClientConfig, ReconnectConfig};
pub use config::{AuthConfig, BrokerConfig, ListenerConfig, ListenerKind, TopicCheckConfig};
pub use error::{Error, Result};
pub use plugin::{AuthContext, BrokerEvent, Plugin, PluginBus, TopicAction};
pub use protocol::v4::SubscribeReturnCode;
pub use transport::{TlsConfig, TransportType};
pub use types::{ConnectFlags, ConnectReturnCode, FixedHeader, Message, PacketType, QoS, Will};
