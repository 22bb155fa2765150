//! The per-process handle owning all backends.

use std::sync::Arc;
use std::time::Duration;

use crate::blobstore::memory::MemoryStore;
use crate::datastore::{Datastore, TtlAdapter, TtlConfig};
use crate::wsdb::cache::{CachedWorkspaceDb, DONT_EXPIRE_WSDB_CACHE};
use crate::wsdb::memory::MemoryWsdb;
use crate::wsdb::WorkspaceDb;

/// Owns the datastore and workspace database a process works against.
///
/// Passed explicitly wherever backends are needed; there is no process-wide
/// singleton.
pub struct Core {
    pub datastore: Arc<dyn Datastore>,
    pub wsdb: Arc<dyn WorkspaceDb>,
}

impl Core {
    pub fn new(datastore: Arc<dyn Datastore>, wsdb: Arc<dyn WorkspaceDb>) -> Self {
        Self { datastore, wsdb }
    }

    /// A fully in-process core: memory blob store behind the TTL adapter,
    /// memory workspace db behind the cache. Used by demos and tests; must
    /// be called inside a tokio runtime.
    pub fn in_memory() -> crate::wsdb::Result<Self> {
        let config = TtlConfig::new(
            Duration::from_secs(24 * 3600),
            Duration::from_secs(48 * 3600),
            Duration::from_secs(240 * 3600),
        )
        .map_err(|err| crate::wsdb::Error::Fatal(err.to_string()))?;
        let datastore = Arc::new(TtlAdapter::new(Arc::new(MemoryStore::new()), config));
        let wsdb =
            Arc::new(CachedWorkspaceDb::new(Arc::new(MemoryWsdb::new()), DONT_EXPIRE_WSDB_CACHE)?);
        Ok(Self { datastore, wsdb })
    }
}
