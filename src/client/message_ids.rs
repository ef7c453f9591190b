//! Message identifier allocation
//!
//! Ids in `1..=65535` correlate outbound QoS 1/2 publishes, subscribes and
//! unsubscribes with their acknowledgements. An id is in use exactly while it
//! is present in the table.

use super::token::Token;
use crate::error::ClientError;
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::debug;

pub const MIN_MESSAGE_ID: u16 = 1;
pub const MAX_MESSAGE_ID: u16 = u16::MAX;

/// Thread-safe table of in-use message ids and their owning tokens
#[derive(Debug, Default)]
pub struct MessageIds {
    index: RwLock<HashMap<u16, Token>>,
}

impl MessageIds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind the lowest free id to `token`, `None` when every id is in use
    pub fn allocate(&self, token: Token) -> Option<u16> {
        let mut index = self.index.write().unwrap_or_else(|e| e.into_inner());
        let id = (MIN_MESSAGE_ID..=MAX_MESSAGE_ID).find(|id| !index.contains_key(id))?;
        index.insert(id, token);
        Some(id)
    }

    /// Bind a specific id, replacing any previous owner
    ///
    /// Used when resuming a session to reserve the ids of replayed records.
    pub fn claim(&self, id: u16, token: Token) {
        let mut index = self.index.write().unwrap_or_else(|e| e.into_inner());
        index.insert(id, token);
    }

    /// Release `id`; releasing a free id is a no-op
    pub fn free(&self, id: u16) {
        let mut index = self.index.write().unwrap_or_else(|e| e.into_inner());
        index.remove(&id);
    }

    pub fn lookup(&self, id: u16) -> Option<Token> {
        let index = self.index.read().unwrap_or_else(|e| e.into_inner());
        index.get(&id).cloned()
    }

    pub fn in_use(&self) -> usize {
        self.index.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Resolve every pending token with an error built by `reason` and empty
    /// the table
    pub fn clean_up(&self, reason: impl Fn() -> ClientError) {
        let drained: Vec<(u16, Token)> = {
            let mut index = self.index.write().unwrap_or_else(|e| e.into_inner());
            index.drain().collect()
        };
        if !drained.is_empty() {
            debug!(count = drained.len(), "Resolving pending tokens on teardown");
        }
        for (_, token) in drained {
            token.resolve_err(reason());
        }
    }
}
