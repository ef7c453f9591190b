use super::{Store, StoreError};
use crate::packet::Packet;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::RwLock;

#[derive(Debug, Default)]
struct Inner {
    opened: bool,
    records: BTreeMap<String, Bytes>,
}

/// In-memory store, the default when none is configured
///
/// Records are held in encoded form, matching [`super::FileStore`], but do
/// not survive a restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn open(&self) -> Result<(), StoreError> {
        self.inner.write().unwrap_or_else(|e| e.into_inner()).opened = true;
        Ok(())
    }

    fn close(&self) {
        self.inner.write().unwrap_or_else(|e| e.into_inner()).opened = false;
    }

    fn put(&self, key: &str, packet: &Packet) -> Result<(), StoreError> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if !inner.opened {
            return Err(StoreError::NotOpen);
        }
        let bytes = packet.to_bytes().map_err(|source| StoreError::Encode {
            key: key.to_string(),
            source,
        })?;
        inner.records.insert(key.to_string(), bytes);
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Packet>, StoreError> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        if !inner.opened {
            return Err(StoreError::NotOpen);
        }
        inner
            .records
            .get(key)
            .map(|raw| {
                Packet::from_bytes(raw).map_err(|source| StoreError::Corrupt {
                    key: key.to_string(),
                    source,
                })
            })
            .transpose()
    }

    fn all(&self) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        if !inner.opened {
            return Err(StoreError::NotOpen);
        }
        Ok(inner.records.keys().cloned().collect())
    }

    fn del(&self, key: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if !inner.opened {
            return Err(StoreError::NotOpen);
        }
        inner.records.remove(key);
        Ok(())
    }

    fn reset(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if !inner.opened {
            return Err(StoreError::NotOpen);
        }
        inner.records.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_contract() {
        let store = MemoryStore::new();
        assert!(matches!(store.all(), Err(StoreError::NotOpen)));

        store.open().unwrap();
        store.put("o.1", &Packet::PubRel { message_id: 1 }).unwrap();
        store.put("o.2", &Packet::PubRel { message_id: 2 }).unwrap();
        store.del("o.1").unwrap();
        store.del("o.1").unwrap();

        assert_eq!(store.all().unwrap(), vec!["o.2".to_string()]);
        assert_eq!(
            store.get("o.2").unwrap(),
            Some(Packet::PubRel { message_id: 2 })
        );
        assert_eq!(store.get("o.1").unwrap(), None);

        store.reset().unwrap();
        assert!(store.all().unwrap().is_empty());
    }
}
