//! MQTT client core
//!
//! [`Client`] is the caller-facing handle. The pure building blocks it is
//! made of (connection state, message ids, routing, tokens, keepalive
//! decisions) live in their own modules and are usable on their own.

pub mod connection;
mod coordinator;
pub mod keepalive;
pub mod message_ids;
mod net;
pub mod payload;
pub mod router;
pub mod token;

pub use connection::ConnectionState;
pub use coordinator::Client;
pub use payload::Payload;
pub use router::{handler, Message, MessageHandler};
pub use token::{Token, TokenKind};
