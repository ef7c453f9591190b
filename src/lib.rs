//! mqttlink - asynchronous MQTT 3.1 / 3.1.1 client
//!
//! A tokio-based MQTT client core with broker failover, automatic protocol
//! fallback, reconnect with exponential backoff, keepalive supervision and a
//! durable store for unacknowledged packets.
//!
//! # Overview
//!
//! - [`Client`] connects, publishes, subscribes and unsubscribes; every
//!   operation returns a [`Token`] immediately
//! - [`store`] persists in-flight QoS 1/2 packets ([`FileStore`], [`MemoryStore`])
//! - [`packet`] is the MQTT 3.1/3.1.1 wire codec
//! - [`config`] holds runtime options and the TOML file format
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use mqttlink::{handler, Client, ClientOptions, Message, QoS};
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let client = Client::new(
//!     ClientOptions::new()
//!         .add_broker("tcp://localhost:1883")
//!         .client_id("sensor-7"),
//! )?;
//!
//! let connect = client.connect();
//! connect.wait().await;
//! if let Some(error) = connect.error() {
//!     eprintln!("connect failed: {error}");
//! }
//!
//! client.subscribe(
//!     "sensors/+/temp",
//!     QoS::AtLeastOnce,
//!     Some(handler(|_client: &Client, message: &Message| {
//!         println!("{} = {}", message.topic, message.payload_str());
//!     })),
//! );
//! client
//!     .publish("sensors/kitchen/temp", QoS::AtLeastOnce, false, "21.5")
//!     .wait_timeout(Duration::from_secs(5))
//!     .await;
//!
//! client.disconnect(Duration::from_millis(250)).await;
//! # Ok::<(), mqttlink::ClientError>(())
//! # });
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod observability;
pub mod packet;
pub mod store;
pub mod transport;

pub use client::{
    handler, Client, ConnectionState, Message, MessageHandler, Payload, Token, TokenKind,
};
pub use config::{ClientConfig, ClientOptions, ConfigError, TlsOptions};
pub use error::{ClientError, ClientResult};
pub use packet::{ConnectReturnCode, LastWill, ProtocolVersion, QoS};
pub use store::{FileStore, MemoryStore, Store, StoreError};
