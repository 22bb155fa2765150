//! In-process blob store used by tests, demos and fixtures.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{BlobStore, Error, Metadata, Result};
use crate::key::ObjectKey;

/// A [`BlobStore`] over a process-local map.
#[derive(Default)]
pub struct MemoryStore {
    blocks: RwLock<HashMap<ObjectKey, (Vec<u8>, Metadata)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of blocks currently stored.
    pub async fn len(&self) -> usize {
        self.blocks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blocks.read().await.is_empty()
    }

    /// Snapshot of every stored key, for store-wide maintenance and tests.
    pub async fn keys(&self) -> Vec<ObjectKey> {
        self.blocks.read().await.keys().copied().collect()
    }

    /// Overwrites a single metadata field in place, for TTL-policy tests.
    pub async fn set_metadata_field(&self, key: &ObjectKey, field: &str, value: &str) -> Result<()> {
        let mut blocks = self.blocks.write().await;
        let (_, metadata) = blocks.get_mut(key).ok_or(Error::KeyNotFound)?;
        metadata.insert(field.to_owned(), value.to_owned());
        Ok(())
    }
}

#[async_trait]
impl BlobStore for MemoryStore {
    async fn insert(&self, key: &ObjectKey, bytes: &[u8], metadata: &Metadata) -> Result<()> {
        let mut blocks = self.blocks.write().await;
        blocks.insert(*key, (bytes.to_vec(), metadata.clone()));
        Ok(())
    }

    async fn get(&self, key: &ObjectKey) -> Result<(Vec<u8>, Metadata)> {
        let blocks = self.blocks.read().await;
        blocks.get(key).cloned().ok_or(Error::KeyNotFound)
    }

    async fn metadata(&self, key: &ObjectKey) -> Result<Metadata> {
        let blocks = self.blocks.read().await;
        blocks.get(key).map(|(_, metadata)| metadata.clone()).ok_or(Error::KeyNotFound)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<()> {
        let mut blocks = self.blocks.write().await;
        blocks.remove(key);
        Ok(())
    }
}
