//! In-memory document store.
//!
//! Used when no storage path is configured and throughout the tests, where
//! the write log makes "exactly one write of X" assertions easy.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{DocumentStore, StoreError};
use crate::protocol::DocumentId;

#[derive(Default)]
struct Inner {
    docs: HashMap<DocumentId, (u64, Vec<u8>)>,
    writes: Vec<(DocumentId, Vec<u8>)>,
    failing: bool,
}

/// `HashMap`-backed store that also records every write in order.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every successful write so far, oldest first.
    pub fn writes(&self) -> Vec<(DocumentId, Vec<u8>)> {
        self.inner.lock().writes.clone()
    }

    /// Writes recorded for one document, oldest first.
    pub fn writes_for(&self, id: &DocumentId) -> Vec<Vec<u8>> {
        self.inner
            .lock()
            .writes
            .iter()
            .filter(|(doc, _)| doc == id)
            .map(|(_, bytes)| bytes.clone())
            .collect()
    }

    /// Make subsequent writes fail (to exercise error paths).
    pub fn set_failing(&self, failing: bool) {
        self.inner.lock().failing = failing;
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn save_document(&self, id: &DocumentId, bytes: &[u8]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if inner.failing {
            return Err(StoreError::Database("store unavailable".into()));
        }
        let entry = inner.docs.entry(id.clone()).or_insert((0, Vec::new()));
        entry.0 += 1;
        entry.1 = bytes.to_vec();
        inner.writes.push((id.clone(), bytes.to_vec()));
        Ok(())
    }

    async fn load_document(&self, id: &DocumentId) -> Result<Vec<u8>, StoreError> {
        self.inner
            .lock()
            .docs
            .get(id)
            .map(|(_, bytes)| bytes.clone())
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    async fn document_version(&self, id: &DocumentId) -> Result<u64, StoreError> {
        Ok(self.inner.lock().docs.get(id).map_or(0, |(v, _)| *v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_is_upsert() {
        let store = MemoryStore::new();
        let id = DocumentId::from("doc1");

        store.save_document(&id, b"one").await.unwrap();
        store.save_document(&id, b"two").await.unwrap();

        assert_eq!(store.load_document(&id).await.unwrap(), b"two");
        assert_eq!(store.document_version(&id).await.unwrap(), 2);
        assert_eq!(store.writes_for(&id), vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[tokio::test]
    async fn test_missing_document() {
        let store = MemoryStore::new();
        let id = DocumentId::from("nope");
        assert_eq!(store.load_document(&id).await, Err(StoreError::NotFound(id.clone())));
        assert_eq!(store.document_version(&id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failing_store_records_nothing() {
        let store = MemoryStore::new();
        store.set_failing(true);
        assert!(store.save_document(&DocumentId::from("doc1"), b"x").await.is_err());
        assert!(store.writes().is_empty());
    }
}
