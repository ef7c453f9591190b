//! Error types for client operations
//!
//! Configuration errors (bad topic, qos or payload) surface synchronously on
//! the returned token. Connection errors surface on the connect token and
//! distinguish a broker rejection from an unreachable network. Liveness
//! errors never reach an operation token; they drive connection-lost handling.

use crate::packet::{ConnectReturnCode, PacketError};
use crate::store::StoreError;
use thiserror::Error;

pub type ClientResult<T> = Result<T, ClientError>;

/// Main error type for client operations
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Invalid topic: {topic}")]
    InvalidTopic { topic: String },

    #[error("Invalid QoS level: {0}")]
    InvalidQos(u8),

    #[error("Unsupported payload type: {kind}")]
    UnsupportedPayload { kind: String },

    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),

    #[error("Invalid client options: {0}")]
    InvalidOptions(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Already connected or connecting")]
    AlreadyConnected,

    #[error("Broker {broker} refused the connection: {code}")]
    ConnectionRefused {
        broker: String,
        code: ConnectReturnCode,
    },

    #[error("Network error connecting to {broker}: {message}")]
    NetworkError { broker: String, message: String },

    #[error("Timed out connecting to {broker}")]
    ConnectTimeout { broker: String },

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("No PINGRESP received within the keepalive interval")]
    PingTimeout,

    #[error("Subscription to {filter} rejected by broker")]
    SubscriptionRejected { filter: String },

    #[error("All message identifiers are in use")]
    MessageIdsExhausted,

    #[error("Outbound queue full")]
    QueueFull,

    #[error("TLS configuration error: {0}")]
    Tls(String),

    #[error("Codec error: {0}")]
    Codec(#[from] PacketError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    /// Whether this error came from the broker turning the client away, as
    /// opposed to the broker being unreachable
    pub fn is_rejection(&self) -> bool {
        matches!(self, ClientError::ConnectionRefused { .. })
    }

    /// Whether this error came from the transport failing to reach a broker
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            ClientError::NetworkError { .. } | ClientError::ConnectTimeout { .. }
        )
    }

    /// Refusal code carried by a [`ClientError::ConnectionRefused`]
    pub fn return_code(&self) -> Option<ConnectReturnCode> {
        match self {
            ClientError::ConnectionRefused { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn invalid_topic<S: Into<String>>(topic: S) -> Self {
        Self::InvalidTopic {
            topic: topic.into(),
        }
    }

    pub fn unsupported_payload<S: Into<String>>(kind: S) -> Self {
        Self::UnsupportedPayload { kind: kind.into() }
    }

    pub fn connection_lost<S: Into<String>>(reason: S) -> Self {
        Self::ConnectionLost(reason.into())
    }
}
