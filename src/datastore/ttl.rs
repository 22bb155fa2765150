//! The TTL adapter: datastore semantics over a plain blob store.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tracing::debug;

use super::freshen_cache::{FreshenCache, FRESHEN_CACHE_SIZE};
use super::{Buffer, Datastore, Error, Result, TtlConfig};
use crate::blobstore::{self, parse_ttl, ttl_metadata, BlobStore, Metadata};
use crate::codec::MAX_BLOCK_SIZE;
use crate::key::ObjectKey;

/// Concurrent blob-store operations allowed per adapter, sized to typical
/// backing-store capacity.
pub const BLOBSTORE_CONCURRENCY: usize = 100;

/// Wraps a [`BlobStore`] with the TTL policy and a bounded freshen cache.
///
/// The cache records which content keys have recently had their TTL checked
/// so that hot blocks are not re-examined on every write. Entries promise
/// freshness for half the refresh threshold, which bounds the skew between
/// the cache's view and the store's.
pub struct TtlAdapter {
    store: Arc<dyn BlobStore>,
    config: TtlConfig,
    cache: Mutex<FreshenCache>,
    semaphore: Semaphore,
}

impl TtlAdapter {
    pub fn new(store: Arc<dyn BlobStore>, config: TtlConfig) -> Self {
        Self::with_cache_size(store, config, FRESHEN_CACHE_SIZE)
    }

    /// Test hook: a smaller cache makes eviction observable.
    pub(crate) fn with_cache_size(
        store: Arc<dyn BlobStore>,
        config: TtlConfig,
        cache_size: usize,
    ) -> Self {
        Self {
            store,
            config,
            cache: Mutex::new(FreshenCache::new(cache_size)),
            semaphore: Semaphore::new(BLOBSTORE_CONCURRENCY),
        }
    }

    fn cache(&self) -> MutexGuard<'_, FreshenCache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cache_good(&self, key: &ObjectKey) -> bool {
        self.cache().good(key)
    }

    fn seed_cache(&self, key: &ObjectKey) {
        self.cache().insert(*key, self.config.refresh_time / 2);
    }

    async fn acquire(&self) -> Result<tokio::sync::SemaphorePermit<'_>> {
        self.semaphore
            .acquire()
            .await
            .map_err(|_| Error::Store(blobstore::Error::Transport("semaphore closed".to_owned())))
    }

    /// Re-inserts `bytes` with the refresh TTL unless the stored TTL is
    /// already at or above the refresh threshold.
    async fn refresh_if_needed(
        &self,
        key: &ObjectKey,
        bytes: &[u8],
        metadata: &Metadata,
    ) -> Result<()> {
        let remaining = parse_ttl(metadata).unwrap_or(0);
        if remaining >= self.config.refresh_time.as_secs() {
            return Ok(());
        }
        debug!(%key, remaining, "refreshing block ttl");
        let refreshed = ttl_metadata(self.config.refresh_value.as_secs());
        self.store.insert(key, bytes, &refreshed).await?;
        Ok(())
    }
}

#[async_trait]
impl Datastore for TtlAdapter {
    async fn get(&self, key: &ObjectKey, buffer: &mut Buffer) -> Result<()> {
        let _permit = self.acquire().await?;
        let (bytes, metadata) = self.store.get(key).await?;
        self.refresh_if_needed(key, &bytes, &metadata).await?;
        self.seed_cache(key);
        buffer.fill(key.key_type(), bytes);
        Ok(())
    }

    async fn set(&self, key: &ObjectKey, buffer: &Buffer) -> Result<()> {
        if buffer.len() > MAX_BLOCK_SIZE {
            return Err(Error::BlockTooLarge(buffer.len()));
        }
        if self.cache_good(key) {
            return Ok(());
        }
        let _permit = self.acquire().await?;
        match self.store.metadata(key).await {
            Err(blobstore::Error::KeyNotFound) => {
                let metadata = ttl_metadata(self.config.default_value.as_secs());
                self.store.insert(key, buffer.data(), &metadata).await?;
            }
            Ok(metadata) => self.refresh_if_needed(key, buffer.data(), &metadata).await?,
            Err(err) => return Err(Error::Store(err)),
        }
        self.seed_cache(key);
        Ok(())
    }

    async fn freshen(&self, key: &ObjectKey) -> Result<()> {
        if self.cache_good(key) {
            return Ok(());
        }
        debug!(%key, "freshening block");
        let mut buffer = Buffer::new();
        match self.get(key, &mut buffer).await {
            Ok(()) => {}
            Err(Error::Store(blobstore::Error::KeyNotFound)) => return Err(Error::BlockMissing),
            Err(err) => return Err(err),
        }
        self.set(key, &buffer).await
    }
}
