//! Durable storage for in-flight packets
//!
//! Any packet whose delivery is confirmed by an acknowledgement is written to
//! a [`Store`] before it goes on the wire and removed once the acknowledgement
//! arrives, so unacknowledged work survives a restart. Keys follow the
//! convention `o.<id>` for outbound and `i.<id>` for inbound packets.

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use crate::packet::{Packet, PacketError};
use thiserror::Error;

/// Store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store used before open() or after close()")]
    NotOpen,
    #[error("Store I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Stored record {key} is corrupt: {source}")]
    Corrupt {
        key: String,
        #[source]
        source: PacketError,
    },
    #[error("Failed to encode packet for {key}: {source}")]
    Encode {
        key: String,
        #[source]
        source: PacketError,
    },
}

/// Persistence for acknowledgement-pending packets
///
/// Implementations must take an exclusive lock for `put`, `del` and `reset`
/// and a shared lock for `get` and `all`. Every operation other than `open`
/// fails with [`StoreError::NotOpen`] unless the store is open.
pub trait Store: Send + Sync {
    /// Prepare the store for use, creating backing storage if absent
    fn open(&self) -> Result<(), StoreError>;

    /// Stop accepting operations
    fn close(&self);

    /// Persist `packet` under `key`, replacing any existing record
    fn put(&self, key: &str, packet: &Packet) -> Result<(), StoreError>;

    /// Fetch the record stored under `key`
    fn get(&self, key: &str) -> Result<Option<Packet>, StoreError>;

    /// Every key currently stored
    fn all(&self) -> Result<Vec<String>, StoreError>;

    /// Remove the record under `key`, a no-op if absent
    fn del(&self, key: &str) -> Result<(), StoreError>;

    /// Delete every record
    fn reset(&self) -> Result<(), StoreError>;
}

/// Key for a packet sent by this client
pub fn outbound_key(message_id: u16) -> String {
    format!("o.{message_id}")
}

/// Key for a packet received from the broker
pub fn inbound_key(message_id: u16) -> String {
    format!("i.{message_id}")
}

/// Message id of an outbound key, `None` for inbound or foreign keys
pub fn parse_outbound_key(key: &str) -> Option<u16> {
    key.strip_prefix("o.")?.parse().ok()
}
