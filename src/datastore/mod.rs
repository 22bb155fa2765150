//! The datastore contract the filesystem consumes, and its TTL adapter.

pub mod config;
mod freshen_cache;
pub mod ttl;

pub use config::{ConfigError, TtlConfig};
pub use ttl::TtlAdapter;

use async_trait::async_trait;

use crate::blobstore;
use crate::key::{KeyType, ObjectKey};

/// Datastore failures.
#[derive(Debug)]
pub enum Error {
    /// `freshen` found no block behind the key.
    BlockMissing,
    /// A `set` exceeded [`MAX_BLOCK_SIZE`]; carries the offending size.
    BlockTooLarge(usize),
    /// An underlying blob-store error, passed through verbatim.
    Store(blobstore::Error),
}

impl From<blobstore::Error> for Error {
    fn from(err: blobstore::Error) -> Self {
        Error::Store(err)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// An owned block image tagged with the storage class of its key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Buffer {
    data: Vec<u8>,
    key_type: KeyType,
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Buffer {
    pub fn new() -> Self {
        Self { data: Vec::new(), key_type: KeyType::Other }
    }

    pub fn with_contents(key_type: KeyType, data: Vec<u8>) -> Self {
        Self { data, key_type }
    }

    pub fn fill(&mut self, key_type: KeyType, data: Vec<u8>) {
        self.key_type = key_type;
        self.data = data;
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    pub fn key_type(&self) -> KeyType {
        self.key_type
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The content-addressed key of the current contents.
    pub fn key(&self) -> ObjectKey {
        ObjectKey::from_contents(self.key_type, &self.data)
    }
}

/// Block storage as the filesystem sees it: reads, idempotent writes, and
/// TTL freshening.
#[async_trait]
pub trait Datastore: Send + Sync {
    /// Reads the block behind `key` into `buffer`, tagged with the key's
    /// type.
    async fn get(&self, key: &ObjectKey, buffer: &mut Buffer) -> Result<()>;

    /// Writes `buffer` under `key`, refreshing the block's TTL if it is
    /// already present.
    async fn set(&self, key: &ObjectKey, buffer: &Buffer) -> Result<()>;

    /// Ensures the block behind `key` will live at least the refresh TTL.
    async fn freshen(&self, key: &ObjectKey) -> Result<()>;
}

/// Convenience: encode-and-set, returning the stored key.
pub async fn store_block(
    store: &dyn Datastore,
    key_type: KeyType,
    bytes: Vec<u8>,
) -> Result<ObjectKey> {
    let buffer = Buffer::with_contents(key_type, bytes);
    let key = buffer.key();
    store.set(&key, &buffer).await?;
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_key_tracks_contents() {
        let buffer = Buffer::with_contents(KeyType::Data, b"block".to_vec());
        assert_eq!(buffer.key(), ObjectKey::from_contents(KeyType::Data, b"block"));
        assert_eq!(buffer.len(), 5);
    }

    #[test]
    fn test_buffer_fill_replaces() {
        let mut buffer = Buffer::new();
        assert!(buffer.is_empty());
        buffer.fill(KeyType::Metadata, b"dir".to_vec());
        assert_eq!(buffer.key_type(), KeyType::Metadata);
        assert_eq!(buffer.data(), b"dir");
    }
}
