//! Walker traversal, error delivery and panic containment over an
//! in-memory workspace.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use quantumfs::blobstore::memory::MemoryStore;
use quantumfs::blobstore::BlobStore;
use quantumfs::codec::file::{encode_multi_block, encode_very_large, MultiBlockFile, VeryLargeFile};
use quantumfs::codec::hardlink::{leg_key, HardlinkEntry, HardlinkRecord};
use quantumfs::codec::record::{DirectoryRecord, ObjectType};
use quantumfs::codec::workspace_root::WorkspaceRoot;
use quantumfs::codec::xattr::{self, ExtendedAttributes};
use quantumfs::datastore::{store_block, Buffer, Datastore, TtlAdapter, TtlConfig};
use quantumfs::key::{KeyType, ObjectKey};
use quantumfs::tree::{build_hardlink_entry, write_directory, write_root};
use quantumfs::walker::{walk, ErrorKind, WalkControl, WalkMode, WalkerError};

fn adapter() -> TtlAdapter {
    let config = TtlConfig::new(
        Duration::from_secs(3600),
        Duration::from_secs(7200),
        Duration::from_secs(600),
    )
    .unwrap();
    TtlAdapter::new(Arc::new(MemoryStore::new()), config)
}

/// Datastore wrapper that fails `get` for chosen keys.
struct FailingStore {
    inner: TtlAdapter,
    failing: Mutex<HashSet<ObjectKey>>,
}

impl FailingStore {
    fn new(inner: TtlAdapter) -> Self {
        Self { inner, failing: Mutex::new(HashSet::new()) }
    }

    fn fail_key(&self, key: ObjectKey) {
        self.failing.lock().unwrap().insert(key);
    }
}

#[async_trait]
impl Datastore for FailingStore {
    async fn get(&self, key: &ObjectKey, buffer: &mut Buffer) -> quantumfs::datastore::Result<()> {
        if self.failing.lock().unwrap().contains(key) {
            return Err(quantumfs::datastore::Error::Store(
                quantumfs::blobstore::Error::Transport("injected failure".to_owned()),
            ));
        }
        self.inner.get(key, buffer).await
    }

    async fn set(&self, key: &ObjectKey, buffer: &Buffer) -> quantumfs::datastore::Result<()> {
        self.inner.set(key, buffer).await
    }

    async fn freshen(&self, key: &ObjectKey) -> quantumfs::datastore::Result<()> {
        self.inner.freshen(key).await
    }
}

fn small_file(name: &str, contents: &str) -> DirectoryRecord {
    let mut record = DirectoryRecord::new(
        name,
        ObjectType::SmallFile,
        ObjectKey::from_contents(KeyType::Data, contents.as_bytes()),
    );
    record.size = contents.len() as u64;
    record
}

struct Fixture {
    root_key: ObjectKey,
    dir1_key: ObjectKey,
}

/// Builds a workspace with two directories, a multi-block file, a very
/// large file, a symlink, an xattr table and one hardlinked file with two
/// legs.
async fn build_workspace(store: &dyn Datastore) -> Fixture {
    // dir-1: file-a (with one xattr) plus a hardlink leg.
    let xattr_key = store_block(
        store,
        KeyType::Metadata,
        xattr::encode(&ExtendedAttributes {
            attributes: vec![(
                "user.origin".to_owned(),
                ObjectKey::from_contents(KeyType::Data, b"attribute value"),
            )],
        })
        .unwrap(),
    )
    .await
    .unwrap();
    let mut file_a = small_file("file-a", "contents of a");
    file_a.extended_attributes = xattr_key;

    let mut leg1 = DirectoryRecord::new("leg1", ObjectType::Hardlink, leg_key(42));
    leg1.size = 0;
    let dir1_key =
        write_directory(store, vec![file_a, leg1]).await.unwrap();

    // dir-2: file-b plus the second leg.
    let mut leg2 = DirectoryRecord::new("leg2", ObjectType::Hardlink, leg_key(42));
    leg2.size = 0;
    let dir2_key =
        write_directory(store, vec![small_file("file-b", "contents of b"), leg2]).await.unwrap();

    // A medium file: three data blocks behind a descriptor.
    let medium = MultiBlockFile {
        block_size: 4096,
        size_of_last_block: 100,
        blocks: (0..3u8)
            .map(|n| ObjectKey::from_contents(KeyType::Data, &[n]))
            .collect(),
    };
    let medium_key =
        store_block(store, KeyType::Metadata, encode_multi_block(&medium).unwrap()).await.unwrap();
    let mut medium_record = DirectoryRecord::new("medium.bin", ObjectType::MediumFile, medium_key);
    medium_record.size = medium.file_size();

    // A very large file fanning out over two parts.
    let part = MultiBlockFile {
        block_size: 1 << 20,
        size_of_last_block: 512,
        blocks: vec![ObjectKey::from_contents(KeyType::Data, b"part block")],
    };
    let part_key =
        store_block(store, KeyType::Metadata, encode_multi_block(&part).unwrap()).await.unwrap();
    let huge = VeryLargeFile { parts: vec![part_key, part_key] };
    let huge_key =
        store_block(store, KeyType::Metadata, encode_very_large(&huge).unwrap()).await.unwrap();
    let huge_record = DirectoryRecord::new("huge.bin", ObjectType::VeryLargeFile, huge_key);

    let mut symlink = DirectoryRecord::new(
        "link",
        ObjectType::Symlink,
        ObjectKey::from_contents(KeyType::Data, b"/target/path"),
    );
    symlink.size = "/target/path".len() as u64;

    let base_key = write_directory(
        store,
        vec![
            DirectoryRecord::new("dir-1", ObjectType::Directory, dir1_key),
            DirectoryRecord::new("dir-2", ObjectType::Directory, dir2_key),
            medium_record,
            huge_record,
            symlink,
        ],
    )
    .await
    .unwrap();

    let mut root = WorkspaceRoot::empty();
    root.base_layer = base_key;
    root.hardlinks = build_hardlink_entry(
        store,
        vec![HardlinkRecord { file_id: 42, nlinks: 2, record: small_file("shared.bin", "shared") }],
    )
    .await
    .unwrap();
    let root_key = write_root(store, &root).await.unwrap();

    Fixture { root_key, dir1_key }
}

#[tokio::test]
async fn test_full_walk_visits_everything() {
    let store = adapter();
    let fixture = build_workspace(&store).await;

    let mut visited: Vec<(String, ObjectType, u64)> = Vec::new();
    let mut visitor = |item: &quantumfs::walker::WalkItem<'_>| {
        assert!(item.error.is_none(), "unexpected error at {}", item.path);
        visited.push((item.path.to_owned(), item.object_type, item.size));
        Ok(WalkControl::Continue)
    };
    walk(&store, &fixture.root_key, WalkMode::FailFast, &mut visitor).await.unwrap();

    let paths: HashSet<&str> = visited.iter().map(|(path, _, _)| path.as_str()).collect();
    assert!(paths.contains("/"));
    assert!(paths.contains("/dir-1"));
    assert!(paths.contains("/dir-1/file-a"));
    assert!(paths.contains("/dir-1/file-a/xattr/user.origin"));
    assert!(paths.contains("/dir-1/leg1"));
    assert!(paths.contains("/dir-2/file-b"));
    assert!(paths.contains("/dir-2/leg2"));
    assert!(paths.contains("/medium.bin"));
    assert!(paths.contains("/huge.bin"));
    assert!(paths.contains("/link"));
    assert!(paths.contains("/shared.bin"), "hardlink content is walked from the table");

    // Descriptor plus three data blocks, with per-block sizes.
    let medium: Vec<_> =
        visited.iter().filter(|(path, _, _)| path == "/medium.bin").collect();
    assert_eq!(medium.len(), 4);
    let block_sizes: Vec<u64> = medium.iter().skip(1).map(|(_, _, size)| *size).collect();
    assert_eq!(block_sizes, vec![4096, 4096, 100]);

    // Hardlinked content appears exactly once even with two legs.
    let shared = visited.iter().filter(|(path, _, _)| path == "/shared.bin").count();
    assert_eq!(shared, 1);

    // Legs report as hardlinks.
    let leg = visited.iter().find(|(path, _, _)| path == "/dir-1/leg1").unwrap();
    assert_eq!(leg.1, ObjectType::Hardlink);
}

#[tokio::test]
async fn test_best_effort_skips_failed_hierarchy() {
    let store = FailingStore::new(adapter());
    let fixture = build_workspace(&store).await;
    store.fail_key(fixture.dir1_key);

    let mut errors: Vec<WalkerError> = Vec::new();
    let mut visited: Vec<String> = Vec::new();
    let mut visitor = |item: &quantumfs::walker::WalkItem<'_>| {
        if let Some(err) = item.error {
            errors.push(err.clone());
            return Ok(WalkControl::SkipHierarchy);
        }
        visited.push(item.path.to_owned());
        Ok(WalkControl::Continue)
    };
    walk(&store, &fixture.root_key, WalkMode::BestEffort, &mut visitor).await.unwrap();

    assert_eq!(errors.len(), 1, "exactly the injected failure is delivered");
    assert_eq!(errors[0].kind, ErrorKind::Fetch);
    assert_eq!(errors[0].path, "/dir-1");

    assert!(visited.contains(&"/dir-2/file-b".to_owned()), "siblings continue after a skip");
    assert!(!visited.contains(&"/dir-1/file-a".to_owned()));
}

#[tokio::test]
async fn test_fail_fast_aborts_on_visitor_error() {
    let store = FailingStore::new(adapter());
    let fixture = build_workspace(&store).await;
    store.fail_key(fixture.dir1_key);

    let mut visitor = |item: &quantumfs::walker::WalkItem<'_>| {
        if let Some(err) = item.error {
            return Err(err.clone());
        }
        Ok(WalkControl::Continue)
    };
    let err = walk(&store, &fixture.root_key, WalkMode::FailFast, &mut visitor)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Fetch);
    assert_eq!(err.path, "/dir-1");
}

#[tokio::test]
async fn test_skip_hierarchy_prunes_subtree() {
    let store = adapter();
    let fixture = build_workspace(&store).await;

    let mut visited: Vec<String> = Vec::new();
    let mut visitor = |item: &quantumfs::walker::WalkItem<'_>| {
        visited.push(item.path.to_owned());
        if item.path == "/dir-1" {
            return Ok(WalkControl::SkipHierarchy);
        }
        Ok(WalkControl::Continue)
    };
    walk(&store, &fixture.root_key, WalkMode::FailFast, &mut visitor).await.unwrap();

    assert!(!visited.contains(&"/dir-1/file-a".to_owned()));
    assert!(visited.contains(&"/dir-2/file-b".to_owned()));
}

#[tokio::test]
async fn test_visitor_panic_fail_fast() {
    let store = adapter();
    let fixture = build_workspace(&store).await;

    let mut visitor = |item: &quantumfs::walker::WalkItem<'_>| {
        if item.path == "/dir-2/file-b" {
            panic!("visitor exploded");
        }
        Ok(WalkControl::Continue)
    };
    let err = walk(&store, &fixture.root_key, WalkMode::FailFast, &mut visitor)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Panic);
    assert!(err.message.contains("PANIC"));
}

#[tokio::test]
async fn test_visitor_panic_contained_in_best_effort() {
    let store = adapter();
    let fixture = build_workspace(&store).await;

    let mut visited: Vec<String> = Vec::new();
    let mut visitor = |item: &quantumfs::walker::WalkItem<'_>| {
        if item.path == "/dir-1" {
            panic!("visitor exploded");
        }
        visited.push(item.path.to_owned());
        Ok(WalkControl::Continue)
    };
    walk(&store, &fixture.root_key, WalkMode::BestEffort, &mut visitor).await.unwrap();

    assert!(!visited.contains(&"/dir-1/file-a".to_owned()), "panicked hierarchy is pruned");
    assert!(visited.contains(&"/dir-2/file-b".to_owned()), "walk continues past the panic");
}

#[tokio::test]
async fn test_poisoned_hardlink_table_reaches_every_leg() {
    let store = FailingStore::new(adapter());
    let fixture = build_workspace(&store).await;

    // Rebuild the root with the hardlink table continued in a chained
    // block, then make that block unreadable.
    let mut root = quantumfs::tree::read_root(&store, &fixture.root_key).await.unwrap();
    let chained = store_block(
        &store,
        KeyType::Metadata,
        quantumfs::codec::hardlink::encode_entry(&HardlinkEntry {
            records: vec![HardlinkRecord {
                file_id: 43,
                nlinks: 1,
                record: small_file("chained.bin", "chained"),
            }],
            next: ObjectKey::ZERO,
        })
        .unwrap(),
    )
    .await
    .unwrap();
    root.hardlinks.next = chained;
    let root_key = write_root(&store, &root).await.unwrap();
    store.fail_key(chained);

    let mut leg_errors: Vec<WalkerError> = Vec::new();
    let mut visitor = |item: &quantumfs::walker::WalkItem<'_>| {
        if let Some(err) = item.error {
            leg_errors.push(err.clone());
            return Ok(WalkControl::SkipHierarchy);
        }
        Ok(WalkControl::Continue)
    };
    walk(&store, &root_key, WalkMode::BestEffort, &mut visitor).await.unwrap();

    assert_eq!(leg_errors.len(), 2, "both legs report the table failure");
    assert!(leg_errors.iter().all(|err| err.kind == ErrorKind::HardlinkTable));
}

/// The production use of the walker: freshen the TTL of every reachable
/// block so long-lived workspaces never lose content.
#[tokio::test]
async fn test_walk_and_freshen_reaches_every_stored_block() {
    let blobs = Arc::new(MemoryStore::new());
    let config = TtlConfig::new(
        Duration::from_secs(3600),
        Duration::from_secs(7200),
        Duration::from_secs(600),
    )
    .unwrap();
    let store = TtlAdapter::new(blobs.clone(), config);
    let fixture = build_workspace(&store).await;

    // Decay every stored block to a TTL below the refresh threshold.
    for key in blobs.keys().await {
        blobs
            .set_metadata_field(&key, quantumfs::blobstore::TIME_TO_LIVE, "5")
            .await
            .unwrap();
    }

    // Freshen the root out of band (the walker reports it like any other
    // object), then freshen everything the walk can reach.
    let mut freshened: Vec<ObjectKey> = Vec::new();
    {
        let mut visitor = |item: &quantumfs::walker::WalkItem<'_>| {
            assert!(item.error.is_none());
            freshened.push(item.key);
            Ok(WalkControl::Continue)
        };
        walk(&store, &fixture.root_key, WalkMode::BestEffort, &mut visitor).await.unwrap();
    }
    for key in &freshened {
        // Content blocks were never stored in this fixture; only blocks
        // that exist can be freshened.
        match store.freshen(key).await {
            Ok(()) => {}
            Err(quantumfs::datastore::Error::BlockMissing) => {}
            Err(err) => panic!("unexpected freshen failure: {err:?}"),
        }
    }

    // Every stored metadata block was visited and therefore refreshed.
    for key in blobs.keys().await {
        let metadata = blobs.metadata(&key).await.unwrap();
        assert_eq!(
            quantumfs::blobstore::parse_ttl(&metadata),
            Some(7200),
            "block {key} was not freshened"
        );
    }
}
