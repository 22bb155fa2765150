//! Reading and rewriting workspace directory trees.
//!
//! Every metadata edge is a content-addressed key, so an edit rebuilds the
//! spine from the changed record up to a new root while everything else is
//! shared with the old tree. Directories are kept sorted by filename so a
//! given logical tree always produces the same blocks.

use std::future::Future;
use std::pin::Pin;

use crate::codec::directory::{self, chain_chunks, DirectoryEntry};
use crate::codec::hardlink::{self, HardlinkEntry, HardlinkRecord};
use crate::codec::record::{DirectoryRecord, ObjectType};
use crate::codec::workspace_root::{self, WorkspaceRoot};
use crate::codec::MAX_DIRECTORY_RECORDS;
use crate::datastore::{store_block, Buffer, Datastore};
use crate::key::{empty_dir_key, empty_workspace_key, KeyType, ObjectKey};
use crate::{codec, datastore};

#[derive(Debug)]
pub enum Error {
    Store(datastore::Error),
    Codec(codec::Error),
    /// A path component other than the last resolved to a non-directory.
    NotADirectory(String),
    NotFound(String),
    BadPath(String),
}

impl From<datastore::Error> for Error {
    fn from(err: datastore::Error) -> Self {
        Error::Store(err)
    }
}

impl From<codec::Error> for Error {
    fn from(err: codec::Error) -> Self {
        Error::Codec(err)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Reads a whole directory chain into its records.
pub async fn read_directory(
    store: &dyn Datastore,
    key: &ObjectKey,
) -> Result<Vec<DirectoryRecord>> {
    let mut records = Vec::new();
    let mut current = *key;
    loop {
        if current.is_zero() || current == empty_dir_key() {
            return Ok(records);
        }
        let mut buffer = Buffer::new();
        store.get(&current, &mut buffer).await?;
        let entry = directory::decode(buffer.data())?;
        let has_next = entry.has_next();
        let next = entry.next;
        records.extend(entry.records);
        if !has_next {
            return Ok(records);
        }
        current = next;
    }
}

/// Stores `records` as a directory chain and returns the head key.
///
/// Records are sorted by filename first; an empty set maps to the
/// empty-directory constant without touching the store.
pub async fn write_directory(
    store: &dyn Datastore,
    mut records: Vec<DirectoryRecord>,
) -> Result<ObjectKey> {
    records.sort_by(|a, b| a.filename.cmp(&b.filename));
    let chunks = chain_chunks(records);
    if chunks.is_empty() {
        return Ok(empty_dir_key());
    }
    let mut next = empty_dir_key();
    for chunk in chunks.into_iter().rev() {
        let entry = DirectoryEntry { records: chunk, next };
        let bytes = directory::encode(&entry)?;
        next = store_block(store, KeyType::Metadata, bytes).await?;
    }
    Ok(next)
}

/// Fetches and decodes a workspace root; the empty-workspace constant is
/// resolved without a store round trip.
pub async fn read_root(store: &dyn Datastore, key: &ObjectKey) -> Result<WorkspaceRoot> {
    if *key == empty_workspace_key() {
        return Ok(WorkspaceRoot::empty());
    }
    let mut buffer = Buffer::new();
    store.get(key, &mut buffer).await?;
    Ok(workspace_root::decode(buffer.data())?)
}

pub async fn write_root(store: &dyn Datastore, root: &WorkspaceRoot) -> Result<ObjectKey> {
    let bytes = workspace_root::encode(root)?;
    Ok(store_block(store, KeyType::Metadata, bytes).await?)
}

/// Reads the full hardlink table of a root, following chained blocks.
pub async fn read_hardlink_table(
    store: &dyn Datastore,
    root: &WorkspaceRoot,
) -> Result<Vec<HardlinkRecord>> {
    let mut records = Vec::new();
    let mut entry = root.hardlinks.clone();
    loop {
        let has_next = entry.has_next();
        let next = entry.next;
        records.extend(entry.records);
        if !has_next {
            return Ok(records);
        }
        let mut buffer = Buffer::new();
        store.get(&next, &mut buffer).await?;
        entry = hardlink::decode_entry(buffer.data())?;
    }
}

/// Builds the embedded head entry for `records`, storing overflow blocks as
/// a chain.
pub async fn build_hardlink_entry(
    store: &dyn Datastore,
    mut records: Vec<HardlinkRecord>,
) -> Result<HardlinkEntry> {
    records.sort_by_key(|record| record.file_id);
    if records.len() <= MAX_DIRECTORY_RECORDS {
        return Ok(HardlinkEntry { records, next: ObjectKey::ZERO });
    }
    let overflow = records.split_off(MAX_DIRECTORY_RECORDS);
    let mut next = ObjectKey::ZERO;
    let mut chunks: Vec<Vec<HardlinkRecord>> =
        overflow.chunks(MAX_DIRECTORY_RECORDS).map(<[HardlinkRecord]>::to_vec).collect();
    while let Some(chunk) = chunks.pop() {
        let entry = HardlinkEntry { records: chunk, next };
        let bytes = hardlink::encode_entry(&entry)?;
        next = store_block(store, KeyType::Metadata, bytes).await?;
    }
    Ok(HardlinkEntry { records, next })
}

/// Resolves a `/`-separated path below a directory key.
pub async fn lookup_path(
    store: &dyn Datastore,
    dir_key: &ObjectKey,
    path: &[&str],
) -> Result<DirectoryRecord> {
    if path.is_empty() {
        return Err(Error::BadPath("empty path".to_owned()));
    }
    let mut current = *dir_key;
    for (depth, component) in path.iter().enumerate() {
        let records = read_directory(store, &current).await?;
        let record = records
            .into_iter()
            .find(|record| record.filename == *component)
            .ok_or_else(|| Error::NotFound(path[..=depth].join("/")))?;
        if depth == path.len() - 1 {
            return Ok(record);
        }
        if record.object_type != ObjectType::Directory {
            return Err(Error::NotADirectory(path[..=depth].join("/")));
        }
        current = record.id;
    }
    Err(Error::BadPath(path.join("/")))
}

/// Inserts (or replaces) `record` at `path` below `dir_key`, creating
/// intermediate directories, and returns the rebuilt directory's key.
pub fn insert_record<'a>(
    store: &'a dyn Datastore,
    dir_key: &'a ObjectKey,
    path: &'a [&'a str],
    record: DirectoryRecord,
) -> Pin<Box<dyn Future<Output = Result<ObjectKey>> + Send + 'a>> {
    Box::pin(async move {
        let Some((head, rest)) = path.split_first() else {
            return Err(Error::BadPath("empty path".to_owned()));
        };
        let mut records = read_directory(store, dir_key).await?;

        if rest.is_empty() {
            let mut record = record;
            record.filename = (*head).to_owned();
            match records.iter_mut().find(|existing| existing.filename == *head) {
                Some(existing) => *existing = record,
                None => records.push(record),
            }
            return write_directory(store, records).await;
        }

        let child_key = match records.iter().find(|existing| existing.filename == *head) {
            Some(existing) if existing.object_type == ObjectType::Directory => existing.id,
            Some(_) => return Err(Error::NotADirectory((*head).to_owned())),
            None => empty_dir_key(),
        };
        let rebuilt = insert_record(store, &child_key, rest, record).await?;

        match records.iter_mut().find(|existing| existing.filename == *head) {
            Some(existing) => existing.id = rebuilt,
            None => {
                let mut created =
                    DirectoryRecord::new(*head, ObjectType::Directory, rebuilt);
                created.permissions = 0o755;
                records.push(created);
            }
        }
        write_directory(store, records).await
    })
}

/// Inserts `record` at `path` inside the base layer of the workspace rooted
/// at `root_key`, returning the new root key.
pub async fn insert_into_workspace(
    store: &dyn Datastore,
    root_key: &ObjectKey,
    path: &[&str],
    record: DirectoryRecord,
) -> Result<ObjectKey> {
    let mut root = read_root(store, root_key).await?;
    root.base_layer = insert_record(store, &root.base_layer, path, record).await?;
    write_root(store, &root).await
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::blobstore::memory::MemoryStore;
    use crate::datastore::{TtlAdapter, TtlConfig};

    fn store() -> TtlAdapter {
        let config = TtlConfig::new(
            Duration::from_secs(3600),
            Duration::from_secs(7200),
            Duration::from_secs(600),
        )
        .unwrap();
        TtlAdapter::new(Arc::new(MemoryStore::new()), config)
    }

    fn file_record(name: &str) -> DirectoryRecord {
        let mut record = DirectoryRecord::new(
            name,
            ObjectType::SmallFile,
            ObjectKey::from_contents(KeyType::Data, name.as_bytes()),
        );
        record.size = name.len() as u64;
        record
    }

    #[tokio::test]
    async fn test_empty_directory_needs_no_store() {
        let store = store();
        let key = write_directory(&store, Vec::new()).await.unwrap();
        assert_eq!(key, empty_dir_key());
        assert!(read_directory(&store, &key).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_directory_roundtrip_sorted() {
        let store = store();
        let key = write_directory(
            &store,
            vec![file_record("zsh"), file_record("awk"), file_record("make")],
        )
        .await
        .unwrap();
        let names: Vec<_> = read_directory(&store, &key)
            .await
            .unwrap()
            .into_iter()
            .map(|record| record.filename)
            .collect();
        assert_eq!(names, vec!["awk", "make", "zsh"]);
    }

    #[tokio::test]
    async fn test_large_directory_chains() {
        let store = store();
        let records: Vec<_> =
            (0..MAX_DIRECTORY_RECORDS + 10).map(|i| file_record(&format!("file-{i:05}"))).collect();
        let key = write_directory(&store, records).await.unwrap();
        let read_back = read_directory(&store, &key).await.unwrap();
        assert_eq!(read_back.len(), MAX_DIRECTORY_RECORDS + 10);
    }

    #[tokio::test]
    async fn test_insert_creates_intermediates() {
        let store = store();
        let root = write_root(&store, &WorkspaceRoot::empty()).await.unwrap();
        let new_root = insert_into_workspace(
            &store,
            &root,
            &["usr", "include", "stdio.h"],
            file_record("ignored"),
        )
        .await
        .unwrap();

        let base = read_root(&store, &new_root).await.unwrap().base_layer;
        let found = lookup_path(&store, &base, &["usr", "include", "stdio.h"]).await.unwrap();
        assert_eq!(found.filename, "stdio.h");

        let usr = lookup_path(&store, &base, &["usr"]).await.unwrap();
        assert_eq!(usr.object_type, ObjectType::Directory);
        assert_eq!(usr.permissions, 0o755);
    }

    #[tokio::test]
    async fn test_insert_replaces_existing() {
        let store = store();
        let key = write_directory(&store, vec![file_record("conf")]).await.unwrap();
        let mut replacement = file_record("conf");
        replacement.size = 999;
        let rebuilt = insert_record(&store, &key, &["conf"], replacement).await.unwrap();

        let records = read_directory(&store, &rebuilt).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].size, 999);
    }

    #[tokio::test]
    async fn test_insert_through_file_fails() {
        let store = store();
        let key = write_directory(&store, vec![file_record("README")]).await.unwrap();
        let err = insert_record(&store, &key, &["README", "child"], file_record("child"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotADirectory(_)));
    }

    #[tokio::test]
    async fn test_identical_trees_share_keys() {
        let store = store();
        let a = write_directory(&store, vec![file_record("a"), file_record("b")]).await.unwrap();
        let b = write_directory(&store, vec![file_record("b"), file_record("a")]).await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_lookup_missing() {
        let store = store();
        let key = write_directory(&store, vec![file_record("present")]).await.unwrap();
        assert!(matches!(
            lookup_path(&store, &key, &["absent"]).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_hardlink_table_roundtrip() {
        let store = store();
        let records: Vec<_> = (0..MAX_DIRECTORY_RECORDS as u64 + 5)
            .map(|id| HardlinkRecord {
                file_id: id,
                nlinks: 2,
                record: file_record(&format!("link-{id}")),
            })
            .collect();
        let entry = build_hardlink_entry(&store, records).await.unwrap();
        assert!(entry.has_next());

        let mut root = WorkspaceRoot::empty();
        root.hardlinks = entry;
        let table = read_hardlink_table(&store, &root).await.unwrap();
        assert_eq!(table.len(), MAX_DIRECTORY_RECORDS + 5);
    }
}
