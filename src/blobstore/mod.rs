//! The minimal blob-store primitive the datastore layers on top of.

pub mod memory;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::key::ObjectKey;

/// Per-block string metadata. The only key this crate interprets is
/// [`TIME_TO_LIVE`].
pub type Metadata = HashMap<String, String>;

/// Metadata key holding the seconds of life a block has left, as decimal.
pub const TIME_TO_LIVE: &str = "TimeToLive";

/// Blob-store failures. `KeyNotFound` is first class and distinct from
/// transport trouble; nothing here retries.
#[derive(Debug)]
pub enum Error {
    KeyNotFound,
    Transport(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::KeyNotFound => write!(f, "key not found"),
            Error::Transport(msg) => write!(f, "transport failure: {msg}"),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// A store of immutable blobs addressed by object key.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Stores `bytes` under `key`, replacing the metadata wholesale.
    ///
    /// Idempotent with respect to `(key, bytes)` when `bytes` is the hash
    /// preimage of `key`.
    async fn insert(&self, key: &ObjectKey, bytes: &[u8], metadata: &Metadata) -> Result<()>;

    async fn get(&self, key: &ObjectKey) -> Result<(Vec<u8>, Metadata)>;

    /// Fetches only the metadata; cheaper than [`BlobStore::get`] on backends
    /// that support it.
    async fn metadata(&self, key: &ObjectKey) -> Result<Metadata>;

    /// Removes `key`. Absent keys succeed silently.
    async fn delete(&self, key: &ObjectKey) -> Result<()>;
}

/// Builds the metadata map for a block inserted with `ttl` seconds of life.
pub fn ttl_metadata(ttl_seconds: u64) -> Metadata {
    let mut metadata = Metadata::new();
    metadata.insert(TIME_TO_LIVE.to_owned(), ttl_seconds.to_string());
    metadata
}

/// Parses the remaining TTL out of a metadata map, if present and decimal.
pub fn parse_ttl(metadata: &Metadata) -> Option<u64> {
    metadata.get(TIME_TO_LIVE)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_metadata_roundtrip() {
        let metadata = ttl_metadata(86_400);
        assert_eq!(parse_ttl(&metadata), Some(86_400));
    }

    #[test]
    fn test_parse_ttl_absent_or_garbage() {
        assert_eq!(parse_ttl(&Metadata::new()), None);
        let mut metadata = Metadata::new();
        metadata.insert(TIME_TO_LIVE.to_owned(), "soon".to_owned());
        assert_eq!(parse_ttl(&metadata), None);
    }
}
