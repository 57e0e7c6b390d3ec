//! Lightweight MQTT 3.1.1 broker, client and wire codec.
//!
//! Topics are matched exactly; there are no wildcards, retained-message
//! replay or persistence.
//!
//! ## Components
//!
//! - [`protocol`]: frame codec and the [`Packet`](protocol::Packet) model
//! - [`registry`]: concurrent topic to subscriber index
//! - [`Broker`]: accept loop with one task per connection
//! - [`Client`]: connect, publish, subscribe and keep-alive
//!
//! ## Example
//!
//! ```no_run
//! use smqtt::{Broker, BrokerConfig, Client, ClientConfig};
//!
//! #[tokio::main]
//! async fn main() -> smqtt::Result<()> {
//!     // Start broker
//!     let broker = Broker::new(BrokerConfig::new("127.0.0.1", 1883));
//!     tokio::spawn(async move { broker.serve().await });
//!
//!     // Connect client
//!     let mut client = Client::connect(ClientConfig::new("127.0.0.1", 1883, "client-1")).await?;
//!
//!     // Subscribe and publish
//!     client.subscribe("test/topic").await?;
//!     client.publish("test/topic", "hello").await?;
//!
//!     // Receive message
//!     let msg = client.recv().await?;
//!     println!("Received: {:?}", msg);
//!
//!     client.disconnect().await
//! }
//! ```

mod broker;
mod client;
mod error;
mod handler;
pub mod protocol;
pub mod registry;
mod types;

pub use broker::{Broker, BrokerBuilder, BrokerConfig, DEFAULT_OUTBOUND_QUEUE, DEFAULT_PORT};
pub use client::{Client, ClientConfig};
pub use error::{Error, Result};
pub use types::{ConnectReturnCode, FixedHeader, Message, PacketIdGenerator, PacketType, QoS};
