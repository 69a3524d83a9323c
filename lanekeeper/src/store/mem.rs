//! In-memory implementation of Store

use parking_lot::Mutex;
use std::collections::HashMap;

use super::{Document, Store, StoreError};
use crate::key::ResourceKey;

/// In-memory implementation of Store
///
/// Simple hash map based storage, useful for testing and single-process use.
pub struct MemStore {
    docs: Mutex<HashMap<ResourceKey, Document>>,
}

impl MemStore {
    /// Create a new empty MemStore
    #[must_use]
    pub fn new() -> Self {
        Self {
            docs: Mutex::new(HashMap::new()),
        }
    }

    /// Number of stored documents
    #[must_use]
    pub fn len(&self) -> usize {
        self.docs.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.docs.lock().is_empty()
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Store for MemStore {
    async fn fetch(&self, key: &ResourceKey) -> Result<Option<Document>, StoreError> {
        Ok(self.docs.lock().get(key).cloned())
    }

    async fn save(&self, key: &ResourceKey, doc: &Document) -> Result<(), StoreError> {
        self.docs.lock().insert(key.clone(), doc.clone());
        Ok(())
    }

    async fn remove(&self, key: &ResourceKey) -> Result<(), StoreError> {
        self.docs.lock().remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &[&str]) -> Result<Vec<ResourceKey>, StoreError> {
        let docs = self.docs.lock();
        let mut keys: Vec<ResourceKey> = docs
            .keys()
            .filter(|key| key.has_prefix(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}
