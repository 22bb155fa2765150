//! Cache reconciliation: refresh merging, ancestor invalidation, and
//! subscription notifications.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use quantumfs::key::{KeyType, ObjectKey};
use quantumfs::wsdb::cache::{CachedWorkspaceDb, DONT_EXPIRE_WSDB_CACHE};
use quantumfs::wsdb::memory::MemoryWsdb;
use quantumfs::wsdb::subscriptions::WorkspaceState;
use quantumfs::wsdb::{Result, WorkspaceDb, WorkspaceNonce, NULL_SPACE_NAME};

const NULL: &str = NULL_SPACE_NAME;

fn root_key(bytes: &[u8]) -> ObjectKey {
    ObjectKey::from_contents(KeyType::Metadata, bytes)
}

/// Delegating store whose `workspace_list` for one chosen group snapshots
/// its answer, then parks until the test releases it. This makes "a refresh
/// is in flight" a deterministic state.
struct GatedWsdb {
    inner: MemoryWsdb,
    gated: Mutex<Option<(String, String)>>,
    entered: async_channel::Sender<()>,
    release: async_channel::Receiver<()>,
}

struct Gate {
    entered: async_channel::Receiver<()>,
    release: async_channel::Sender<()>,
}

fn gated_wsdb(typespace: &str, namespace: &str) -> (Arc<GatedWsdb>, Gate) {
    let (entered_tx, entered_rx) = async_channel::unbounded();
    let (release_tx, release_rx) = async_channel::unbounded();
    let wsdb = Arc::new(GatedWsdb {
        inner: MemoryWsdb::new(),
        gated: Mutex::new(Some((typespace.to_owned(), namespace.to_owned()))),
        entered: entered_tx,
        release: release_rx,
    });
    (wsdb, Gate { entered: entered_rx, release: release_tx })
}

impl GatedWsdb {
    fn is_gated(&self, typespace: &str, namespace: &str) -> bool {
        matches!(
            &*self.gated.lock().unwrap(),
            Some((t, n)) if t.as_str() == typespace && n.as_str() == namespace
        )
    }
}

#[async_trait]
impl WorkspaceDb for GatedWsdb {
    async fn num_typespaces(&self) -> Result<usize> {
        self.inner.num_typespaces().await
    }

    async fn typespace_list(&self) -> Result<Vec<String>> {
        self.inner.typespace_list().await
    }

    async fn num_namespaces(&self, typespace: &str) -> Result<usize> {
        self.inner.num_namespaces(typespace).await
    }

    async fn namespace_list(&self, typespace: &str) -> Result<Vec<String>> {
        self.inner.namespace_list(typespace).await
    }

    async fn num_workspaces(&self, typespace: &str, namespace: &str) -> Result<usize> {
        self.inner.num_workspaces(typespace, namespace).await
    }

    async fn workspace_list(
        &self,
        typespace: &str,
        namespace: &str,
    ) -> Result<HashMap<String, WorkspaceNonce>> {
        let snapshot = self.inner.workspace_list(typespace, namespace).await;
        if self.is_gated(typespace, namespace) {
            let _ = self.entered.send(()).await;
            let _ = self.release.recv().await;
        }
        snapshot
    }

    async fn workspace(
        &self,
        typespace: &str,
        namespace: &str,
        workspace: &str,
    ) -> Result<(ObjectKey, WorkspaceNonce)> {
        self.inner.workspace(typespace, namespace, workspace).await
    }

    async fn branch_workspace(
        &self,
        src_typespace: &str,
        src_namespace: &str,
        src_workspace: &str,
        dst_typespace: &str,
        dst_namespace: &str,
        dst_workspace: &str,
    ) -> Result<(WorkspaceNonce, ObjectKey)> {
        self.inner
            .branch_workspace(
                src_typespace,
                src_namespace,
                src_workspace,
                dst_typespace,
                dst_namespace,
                dst_workspace,
            )
            .await
    }

    async fn advance_workspace(
        &self,
        typespace: &str,
        namespace: &str,
        workspace: &str,
        expected_nonce: WorkspaceNonce,
        expected_root: &ObjectKey,
        new_root: &ObjectKey,
    ) -> Result<(ObjectKey, WorkspaceNonce)> {
        self.inner
            .advance_workspace(
                typespace,
                namespace,
                workspace,
                expected_nonce,
                expected_root,
                new_root,
            )
            .await
    }

    async fn delete_workspace(
        &self,
        typespace: &str,
        namespace: &str,
        workspace: &str,
    ) -> Result<()> {
        self.inner.delete_workspace(typespace, namespace, workspace).await
    }

    async fn create_workspace(
        &self,
        typespace: &str,
        namespace: &str,
        workspace: &str,
        nonce: WorkspaceNonce,
        root: &ObjectKey,
    ) -> Result<()> {
        self.inner.create_workspace(typespace, namespace, workspace, nonce, root).await
    }

    async fn set_workspace_immutable(
        &self,
        typespace: &str,
        namespace: &str,
        workspace: &str,
    ) -> Result<()> {
        self.inner.set_workspace_immutable(typespace, namespace, workspace).await
    }

    async fn workspace_is_immutable(
        &self,
        typespace: &str,
        namespace: &str,
        workspace: &str,
    ) -> Result<bool> {
        self.inner.workspace_is_immutable(typespace, namespace, workspace).await
    }

    async fn workspace_last_write_time(
        &self,
        typespace: &str,
        namespace: &str,
        workspace: &str,
    ) -> Result<SystemTime> {
        self.inner.workspace_last_write_time(typespace, namespace, workspace).await
    }
}

/// A local insert made while a refresh is in flight survives the refresh:
/// the merged set is the fetched set plus the local delta.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_local_insert_merges_into_inflight_refresh() {
    let (backing, gate) = gated_wsdb(NULL, NULL);
    // Pre-populate the _/_ group with specialWS before the cache exists.
    backing
        .inner
        .create_workspace(NULL, NULL, "specialWS", WorkspaceNonce::new(7, 1), &root_key(b"special"))
        .await
        .unwrap();

    let cache = Arc::new(
        CachedWorkspaceDb::new(backing.clone(), DONT_EXPIRE_WSDB_CACHE).unwrap(),
    );

    // Start the list; its leaf refresh parks inside the gated backing call.
    let lister = cache.clone();
    let listing = tokio::spawn(async move { lister.workspace_list(NULL, NULL).await });
    gate.entered.recv().await.unwrap();

    // Local insert during the refresh window.
    let ws1_nonce = WorkspaceNonce::new(901, 1);
    cache.create_workspace(NULL, NULL, "ws1", ws1_nonce, &root_key(b"ws1")).await.unwrap();

    gate.release.send(()).await.unwrap();
    let listed = listing.await.unwrap().unwrap();

    assert_eq!(listed.len(), 3, "merged set must be fetched + local insert");
    assert_eq!(listed.get(NULL), Some(&WorkspaceNonce::INVALID));
    assert_eq!(listed.get("specialWS").map(|nonce| nonce.id), Some(7));
    assert_eq!(listed.get("ws1"), Some(&ws1_nonce));
}

/// A local delete during the refresh window wins over the stale fetched
/// set.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_local_delete_merges_into_inflight_refresh() {
    let (backing, gate) = gated_wsdb("some", "test");
    backing.inner.branch_workspace(NULL, NULL, NULL, "some", "test", "doomed").await.unwrap();
    backing.inner.branch_workspace(NULL, NULL, NULL, "some", "test", "kept").await.unwrap();

    let cache = Arc::new(
        CachedWorkspaceDb::new(backing.clone(), DONT_EXPIRE_WSDB_CACHE).unwrap(),
    );

    let lister = cache.clone();
    let listing = tokio::spawn(async move { lister.workspace_list("some", "test").await });
    gate.entered.recv().await.unwrap();

    cache.delete_workspace("some", "test", "doomed").await.unwrap();

    gate.release.send(()).await.unwrap();
    let listed = listing.await.unwrap().unwrap();
    assert!(listed.contains_key("kept"));
    assert!(!listed.contains_key("doomed"), "local delete must not be resurrected");
}

/// An in-flight workspace-list refresh is discarded when the whole
/// typespace disappears underneath it; afterwards the list is empty.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_ancestor_delete_invalidates_inflight_refresh() {
    let (backing, gate) = gated_wsdb("some", "test");
    backing.inner.branch_workspace(NULL, NULL, NULL, "some", "test", "a").await.unwrap();

    let cache = Arc::new(CachedWorkspaceDb::new(backing.clone(), 1).unwrap());

    let lister = cache.clone();
    let listing = tokio::spawn(async move { lister.workspace_list("some", "test").await });
    gate.entered.recv().await.unwrap();

    // The typespace dies remotely while the leaf refresh holds its stale
    // snapshot: deleting the only workspace prunes "some" entirely.
    backing.inner.delete_workspace("some", "test", "a").await.unwrap();

    // Let the cached typespace list expire and observe the removal, which
    // detaches the namespace subtree.
    tokio::time::sleep(Duration::from_millis(1100)).await;
    let typespaces = cache.typespace_list().await.unwrap();
    assert!(!typespaces.contains(&"some".to_owned()));

    gate.release.send(()).await.unwrap();
    let listed = listing.await.unwrap().unwrap();
    assert!(listed.is_empty(), "stale refresh must not resurrect the dead namespace");
    assert!(cache.workspace_list("some", "test").await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_subscription_notifications() {
    let backing = Arc::new(MemoryWsdb::new());
    let cache = Arc::new(CachedWorkspaceDb::new(backing.clone(), 1).unwrap());

    let (nonce, root) =
        cache.branch_workspace(NULL, NULL, NULL, "some", "test", "watched").await.unwrap();
    // A second workspace keeps the namespace alive once "watched" dies, so
    // its deletion is observed by a leaf refresh rather than by pruning.
    cache.branch_workspace(NULL, NULL, NULL, "some", "test", "other").await.unwrap();
    cache.workspace_list("some", "test").await.unwrap();

    cache.subscribe_to("some/test/watched");
    let (notify_tx, notify_rx) = async_channel::unbounded::<HashMap<String, WorkspaceState>>();
    cache.set_callback(Arc::new(move |states| {
        let _ = notify_tx.try_send(states);
    }));

    // Advance behind the cache's back, then let the group expire so the
    // next list observes the change.
    let advanced = root_key(b"advanced remotely");
    backing
        .advance_workspace("some", "test", "watched", nonce, &root, &advanced)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(1100)).await;
    cache.workspace_list("some", "test").await.unwrap();

    let states = tokio::time::timeout(Duration::from_secs(5), notify_rx.recv())
        .await
        .expect("notification must arrive")
        .unwrap();
    let state = states.get("some/test/watched").expect("watched workspace in delta");
    assert_eq!(state.root, Some(advanced));
    assert!(!state.deleted);

    // Deletion is reported too.
    backing.delete_workspace("some", "test", "watched").await.unwrap();
    tokio::time::sleep(Duration::from_millis(1100)).await;
    cache.workspace_list("some", "test").await.unwrap();

    let states = tokio::time::timeout(Duration::from_secs(5), notify_rx.recv())
        .await
        .expect("deletion notification must arrive")
        .unwrap();
    assert!(states.get("some/test/watched").unwrap().deleted);
}

#[tokio::test]
async fn test_unsubscribed_changes_are_silent() {
    let backing = Arc::new(MemoryWsdb::new());
    let cache = Arc::new(CachedWorkspaceDb::new(backing.clone(), 1).unwrap());

    cache.branch_workspace(NULL, NULL, NULL, "some", "test", "quiet").await.unwrap();
    cache.workspace_list("some", "test").await.unwrap();

    cache.subscribe_to("some/test/quiet");
    cache.unsubscribe_from("some/test/quiet");
    let (notify_tx, notify_rx) = async_channel::unbounded::<usize>();
    cache.set_callback(Arc::new(move |states| {
        let _ = notify_tx.try_send(states.len());
    }));

    let (root, nonce) = backing.workspace("some", "test", "quiet").await.unwrap();
    backing
        .advance_workspace("some", "test", "quiet", nonce, &root, &root_key(b"unseen"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(1100)).await;
    cache.workspace_list("some", "test").await.unwrap();

    let outcome =
        tokio::time::timeout(Duration::from_millis(300), notify_rx.recv()).await;
    assert!(outcome.is_err(), "no notification expected after unsubscribe");
}

/// Opposing local operations on the same name during one refresh window
/// resolve last-writer-wins.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_insert_then_delete_during_refresh() {
    let (backing, gate) = gated_wsdb("some", "test");
    backing.inner.branch_workspace(NULL, NULL, NULL, "some", "test", "anchor").await.unwrap();

    let cache = Arc::new(
        CachedWorkspaceDb::new(backing.clone(), DONT_EXPIRE_WSDB_CACHE).unwrap(),
    );

    let lister = cache.clone();
    let listing = tokio::spawn(async move { lister.workspace_list("some", "test").await });
    gate.entered.recv().await.unwrap();

    cache
        .create_workspace("some", "test", "flash", WorkspaceNonce::new(11, 1), &root_key(b"f"))
        .await
        .unwrap();
    cache.delete_workspace("some", "test", "flash").await.unwrap();

    gate.release.send(()).await.unwrap();
    let listed = listing.await.unwrap().unwrap();
    assert!(listed.contains_key("anchor"));
    assert!(!listed.contains_key("flash"), "the delete came last and must win");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_delete_then_recreate_during_refresh() {
    let (backing, gate) = gated_wsdb("some", "test");
    backing.inner.branch_workspace(NULL, NULL, NULL, "some", "test", "phoenix").await.unwrap();
    backing.inner.branch_workspace(NULL, NULL, NULL, "some", "test", "anchor").await.unwrap();

    let cache = Arc::new(
        CachedWorkspaceDb::new(backing.clone(), DONT_EXPIRE_WSDB_CACHE).unwrap(),
    );

    let lister = cache.clone();
    let listing = tokio::spawn(async move { lister.workspace_list("some", "test").await });
    gate.entered.recv().await.unwrap();

    cache.delete_workspace("some", "test", "phoenix").await.unwrap();
    let (reborn, _) =
        cache.branch_workspace(NULL, NULL, NULL, "some", "test", "phoenix").await.unwrap();

    gate.release.send(()).await.unwrap();
    let listed = listing.await.unwrap().unwrap();
    assert_eq!(
        listed.get("phoenix"),
        Some(&reborn),
        "the recreation came last and must win with its fresh nonce"
    );
}
