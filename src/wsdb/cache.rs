//! Cached overlay over a [`WorkspaceDb`].
//!
//! The cache is a three-level entity tree: the root group holds typespaces,
//! each typespace holds its namespaces, each namespace holds its workspaces.
//! Each group runs a small state machine: Stale, Fresh, or Refreshing with
//! an accumulating local delta. Refresh never holds the tree lock across the
//! backing call; local inserts and deletes during the window mutate the
//! children *and* the delta, and completion applies the merged-set rule
//! `apply(delta, fetched)` atomically, so neither local nor remote changes
//! are silently dropped.

use std::collections::{HashMap, HashSet};
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use tracing::debug;

use super::subscriptions::{Notifier, SubscriptionCallback};
use super::{Error, Result, WorkspaceDb, WorkspaceNonce};
use crate::key::ObjectKey;

/// Timeout value meaning the cache never refreshes once populated.
pub const DONT_EXPIRE_WSDB_CACHE: i64 = -1;

enum Child {
    Node(Group),
    Leaf(WorkspaceNonce),
}

enum GroupState {
    Stale,
    Fresh { expires_at: Instant },
    Refreshing { delta: Vec<DeltaOp> },
}

enum DeltaOp {
    /// Leaf inserts carry the nonce; node inserts carry `None`.
    Insert(String, Option<WorkspaceNonce>),
    Delete(String),
}

struct Group {
    /// Incarnation id: a completing refresh only applies when the node it
    /// started on is still the one at its path.
    id: u64,
    state: GroupState,
    children: HashMap<String, Child>,
}

impl Group {
    fn new(id: u64) -> Self {
        Self { id, state: GroupState::Stale, children: HashMap::new() }
    }
}

fn group_at<'a>(root: &'a mut Group, path: &[&str]) -> Option<&'a mut Group> {
    let mut group = root;
    for component in path {
        match group.children.get_mut(*component) {
            Some(Child::Node(next)) => group = next,
            _ => return None,
        }
    }
    Some(group)
}

fn child_node<'a>(group: &'a mut Group, name: &str) -> Option<&'a mut Group> {
    match group.children.get_mut(name) {
        Some(Child::Node(next)) => Some(next),
        _ => None,
    }
}

fn record_insert(group: &mut Group, name: &str, nonce: Option<WorkspaceNonce>) {
    if let GroupState::Refreshing { delta } = &mut group.state {
        delta.push(DeltaOp::Insert(name.to_owned(), nonce));
    }
}

fn record_delete(group: &mut Group, name: &str) {
    if let GroupState::Refreshing { delta } = &mut group.state {
        delta.push(DeltaOp::Delete(name.to_owned()));
    }
}

fn ensure_node<'a>(group: &'a mut Group, name: &str, ids: &AtomicU64) -> &'a mut Group {
    if !matches!(group.children.get(name), Some(Child::Node(_))) {
        let id = ids.fetch_add(1, Ordering::Relaxed);
        group.children.insert(name.to_owned(), Child::Node(Group::new(id)));
    }
    match group.children.get_mut(name) {
        Some(Child::Node(next)) => next,
        _ => unreachable!("node was just inserted"),
    }
}

enum Fetched {
    Names(Vec<String>),
    Workspaces(HashMap<String, WorkspaceNonce>),
}

/// Resets an interrupted refresh to Stale so the next caller retries.
struct RefreshGuard<'a> {
    cache: &'a CachedWorkspaceDb,
    path: Vec<String>,
    id: u64,
    armed: bool,
}

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut tree = self.cache.lock_tree();
        let path: Vec<&str> = self.path.iter().map(String::as_str).collect();
        if let Some(group) = group_at(&mut tree, &path) {
            if group.id == self.id && matches!(group.state, GroupState::Refreshing { .. }) {
                group.state = GroupState::Stale;
            }
        }
    }
}

/// [`WorkspaceDb`] with the entity-group cache, background reconciliation
/// and subscribe/notify on top of a backing store.
pub struct CachedWorkspaceDb {
    backing: Arc<dyn WorkspaceDb>,
    /// `None` means groups never expire once fetched.
    timeout: Option<Duration>,
    tree: Mutex<Group>,
    next_node_id: AtomicU64,
    subscriptions: Mutex<HashSet<String>>,
    notifier: Notifier,
}

impl CachedWorkspaceDb {
    /// Builds the cache. `cache_timeout_secs` is either positive or
    /// [`DONT_EXPIRE_WSDB_CACHE`]; anything else is rejected. Must be called
    /// inside a tokio runtime, which hosts the notification dispatcher.
    pub fn new(backing: Arc<dyn WorkspaceDb>, cache_timeout_secs: i64) -> Result<Self> {
        let timeout = match cache_timeout_secs {
            DONT_EXPIRE_WSDB_CACHE => None,
            secs if secs > 0 => Some(Duration::from_secs(secs as u64)),
            other => {
                return Err(Error::BadArguments(format!("cache timeout {other} is invalid")))
            }
        };
        let notifier = Notifier::spawn(backing.clone());
        Ok(Self {
            backing,
            timeout,
            tree: Mutex::new(Group::new(0)),
            next_node_id: AtomicU64::new(1),
            subscriptions: Mutex::new(HashSet::new()),
            notifier,
        })
    }

    /// Starts tracking `name` (`typespace/namespace/workspace`) for change
    /// notifications.
    pub fn subscribe_to(&self, name: &str) {
        self.lock_subscriptions().insert(name.to_owned());
    }

    pub fn unsubscribe_from(&self, name: &str) {
        self.lock_subscriptions().remove(name);
    }

    /// Registers the function invoked with workspace-state deltas. The
    /// callback runs on the dispatcher task, never on the refresh path.
    pub fn set_callback(&self, callback: SubscriptionCallback) {
        self.notifier.set_callback(callback);
    }

    fn lock_tree(&self) -> MutexGuard<'_, Group> {
        self.tree.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_subscriptions(&self) -> MutexGuard<'_, HashSet<String>> {
        self.subscriptions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn refresh_due(&self, state: &GroupState) -> bool {
        match state {
            GroupState::Stale => true,
            GroupState::Fresh { expires_at } => {
                self.timeout.is_some() && Instant::now() >= *expires_at
            }
            GroupState::Refreshing { .. } => false,
        }
    }

    fn fresh_state(&self) -> GroupState {
        GroupState::Fresh { expires_at: Instant::now() + self.timeout.unwrap_or(Duration::ZERO) }
    }

    /// Refreshes the group at `path` from the backing store if its state
    /// machine calls for it. Errors surface to the caller; the group goes
    /// back to Stale so a later call retries.
    async fn ensure_fresh(&self, path: &[&str]) -> Result<()> {
        let id = {
            let mut tree = self.lock_tree();
            let Some(group) = group_at(&mut tree, path) else { return Ok(()) };
            if !self.refresh_due(&group.state) {
                return Ok(());
            }
            group.state = GroupState::Refreshing { delta: Vec::new() };
            group.id
        };

        let mut guard = RefreshGuard {
            cache: self,
            path: path.iter().map(|s| (*s).to_owned()).collect(),
            id,
            armed: true,
        };

        let fetched = match path {
            [] => Fetched::Names(self.backing.typespace_list().await?),
            [typespace] => Fetched::Names(self.backing.namespace_list(typespace).await?),
            [typespace, namespace] => {
                Fetched::Workspaces(self.backing.workspace_list(typespace, namespace).await?)
            }
            _ => return Err(Error::Fatal("cache path deeper than workspaces".to_owned())),
        };

        let mut tree = self.lock_tree();
        guard.armed = false;
        let Some(group) = group_at(&mut tree, path) else {
            debug!(?path, "discarding refresh results for a detached group");
            return Ok(());
        };
        if group.id != id {
            debug!(?path, "discarding refresh results for a replaced group");
            return Ok(());
        }
        let delta = match mem::replace(&mut group.state, GroupState::Stale) {
            GroupState::Refreshing { delta } => delta,
            other => {
                group.state = other;
                return Ok(());
            }
        };
        match fetched {
            Fetched::Names(names) => self.merge_names(group, names, delta),
            Fetched::Workspaces(workspaces) => {
                let prefix = format!("{}/{}/", path[0], path[1]);
                self.merge_leaf(group, workspaces, delta, &prefix);
            }
        }
        Ok(())
    }

    /// Merged-set rule at the typespace and namespace levels. Surviving
    /// names keep their subtree; names the store no longer reports are
    /// dropped along with everything below them unless the local delta
    /// re-inserted them.
    fn merge_names(&self, group: &mut Group, names: Vec<String>, delta: Vec<DeltaOp>) {
        let mut merged: HashMap<String, Child> = HashMap::new();
        for name in names {
            let child = group
                .children
                .remove(&name)
                .unwrap_or_else(|| Child::Node(Group::new(self.mint_id())));
            merged.insert(name, child);
        }
        for op in delta {
            match op {
                DeltaOp::Insert(name, _) => {
                    if !merged.contains_key(&name) {
                        let child = group
                            .children
                            .remove(&name)
                            .unwrap_or_else(|| Child::Node(Group::new(self.mint_id())));
                        merged.insert(name, child);
                    }
                }
                DeltaOp::Delete(name) => {
                    merged.remove(&name);
                }
            }
        }
        group.children = merged;
        group.state = self.fresh_state();
    }

    /// Merged-set rule at the workspace level, plus notification deltas for
    /// subscribed names whose backing state differs from what the cache
    /// held.
    fn merge_leaf(
        &self,
        group: &mut Group,
        fetched: HashMap<String, WorkspaceNonce>,
        delta: Vec<DeltaOp>,
        prefix: &str,
    ) {
        let mut changes = Vec::new();
        {
            let subscriptions = self.lock_subscriptions();
            if !subscriptions.is_empty() {
                for (name, nonce) in &fetched {
                    let full = format!("{prefix}{name}");
                    if !subscriptions.contains(&full) {
                        continue;
                    }
                    let known = match group.children.get(name) {
                        Some(Child::Leaf(known)) => Some(*known),
                        _ => None,
                    };
                    if known != Some(*nonce) {
                        changes.push((full, Some(*nonce)));
                    }
                }
                for (name, child) in &group.children {
                    if matches!(child, Child::Leaf(_)) && !fetched.contains_key(name) {
                        let full = format!("{prefix}{name}");
                        if subscriptions.contains(&full) {
                            changes.push((full, None));
                        }
                    }
                }
            }
        }
        self.notifier.publish(changes);

        let mut merged: HashMap<String, Child> =
            fetched.into_iter().map(|(name, nonce)| (name, Child::Leaf(nonce))).collect();
        for op in delta {
            match op {
                DeltaOp::Insert(name, Some(nonce)) => {
                    merged.insert(name, Child::Leaf(nonce));
                }
                DeltaOp::Insert(name, None) => {
                    if !merged.contains_key(&name) {
                        if let Some(child) = group.children.remove(&name) {
                            merged.insert(name, child);
                        }
                    }
                }
                DeltaOp::Delete(name) => {
                    merged.remove(&name);
                }
            }
        }
        group.children = merged;
        group.state = self.fresh_state();
    }

    fn mint_id(&self) -> u64 {
        self.next_node_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Reconciles a successful write-through insert or update into the
    /// cache, recording it in any refresh window it races with.
    fn cache_insert(&self, typespace: &str, namespace: &str, workspace: &str, nonce: WorkspaceNonce) {
        let mut tree = self.lock_tree();
        record_insert(&mut tree, typespace, None);
        let group_t = ensure_node(&mut tree, typespace, &self.next_node_id);
        record_insert(group_t, namespace, None);
        let group_n = ensure_node(group_t, namespace, &self.next_node_id);
        record_insert(group_n, workspace, Some(nonce));
        group_n.children.insert(workspace.to_owned(), Child::Leaf(nonce));
    }

    /// Reconciles a successful write-through delete. Only the leaf goes; an
    /// emptied parent group stays.
    fn cache_remove(&self, typespace: &str, namespace: &str, workspace: &str) {
        let mut tree = self.lock_tree();
        let Some(group_t) = child_node(&mut tree, typespace) else { return };
        let Some(group_n) = child_node(group_t, namespace) else { return };
        group_n.children.remove(workspace);
        record_delete(group_n, workspace);
    }

    /// True when the cache currently knows `name` as a node at the root or
    /// typespace level.
    fn has_node(&self, path: &[&str]) -> bool {
        let mut tree = self.lock_tree();
        group_at(&mut tree, path).is_some()
    }
}

#[async_trait]
impl WorkspaceDb for CachedWorkspaceDb {
    async fn num_typespaces(&self) -> Result<usize> {
        self.ensure_fresh(&[]).await?;
        Ok(self.lock_tree().children.len())
    }

    async fn typespace_list(&self) -> Result<Vec<String>> {
        self.ensure_fresh(&[]).await?;
        Ok(self.lock_tree().children.keys().cloned().collect())
    }

    async fn num_namespaces(&self, typespace: &str) -> Result<usize> {
        Ok(self.namespace_list(typespace).await?.len())
    }

    async fn namespace_list(&self, typespace: &str) -> Result<Vec<String>> {
        self.ensure_fresh(&[]).await?;
        if !self.has_node(&[typespace]) {
            return Ok(Vec::new());
        }
        self.ensure_fresh(&[typespace]).await?;
        let mut tree = self.lock_tree();
        match group_at(&mut tree, &[typespace]) {
            Some(group) => Ok(group.children.keys().cloned().collect()),
            None => Ok(Vec::new()),
        }
    }

    async fn num_workspaces(&self, typespace: &str, namespace: &str) -> Result<usize> {
        Ok(self.workspace_list(typespace, namespace).await?.len())
    }

    async fn workspace_list(
        &self,
        typespace: &str,
        namespace: &str,
    ) -> Result<HashMap<String, WorkspaceNonce>> {
        self.ensure_fresh(&[]).await?;
        if !self.has_node(&[typespace]) {
            return Ok(HashMap::new());
        }
        self.ensure_fresh(&[typespace]).await?;
        if !self.has_node(&[typespace, namespace]) {
            return Ok(HashMap::new());
        }
        self.ensure_fresh(&[typespace, namespace]).await?;

        let mut tree = self.lock_tree();
        let Some(group) = group_at(&mut tree, &[typespace, namespace]) else {
            return Ok(HashMap::new());
        };
        Ok(group
            .children
            .iter()
            .filter_map(|(name, child)| match child {
                Child::Leaf(nonce) => Some((name.clone(), *nonce)),
                Child::Node(_) => None,
            })
            .collect())
    }

    async fn workspace(
        &self,
        typespace: &str,
        namespace: &str,
        workspace: &str,
    ) -> Result<(ObjectKey, WorkspaceNonce)> {
        self.backing.workspace(typespace, namespace, workspace).await
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
        let (nonce, root) = self
            .backing
            .branch_workspace(
                src_typespace,
                src_namespace,
                src_workspace,
                dst_typespace,
                dst_namespace,
                dst_workspace,
            )
            .await?;
        self.cache_insert(dst_typespace, dst_namespace, dst_workspace, nonce);
        Ok((nonce, root))
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
        let (root, nonce) = self
            .backing
            .advance_workspace(
                typespace,
                namespace,
                workspace,
                expected_nonce,
                expected_root,
                new_root,
            )
            .await?;
        self.cache_insert(typespace, namespace, workspace, nonce);
        Ok((root, nonce))
    }

    async fn delete_workspace(
        &self,
        typespace: &str,
        namespace: &str,
        workspace: &str,
    ) -> Result<()> {
        self.backing.delete_workspace(typespace, namespace, workspace).await?;
        self.cache_remove(typespace, namespace, workspace);
        Ok(())
    }

    async fn create_workspace(
        &self,
        typespace: &str,
        namespace: &str,
        workspace: &str,
        nonce: WorkspaceNonce,
        root: &ObjectKey,
    ) -> Result<()> {
        self.backing.create_workspace(typespace, namespace, workspace, nonce, root).await?;
        self.cache_insert(typespace, namespace, workspace, nonce);
        Ok(())
    }

    async fn set_workspace_immutable(
        &self,
        typespace: &str,
        namespace: &str,
        workspace: &str,
    ) -> Result<()> {
        self.backing.set_workspace_immutable(typespace, namespace, workspace).await
    }

    async fn workspace_is_immutable(
        &self,
        typespace: &str,
        namespace: &str,
        workspace: &str,
    ) -> Result<bool> {
        self.backing.workspace_is_immutable(typespace, namespace, workspace).await
    }

    async fn workspace_last_write_time(
        &self,
        typespace: &str,
        namespace: &str,
        workspace: &str,
    ) -> Result<SystemTime> {
        self.backing.workspace_last_write_time(typespace, namespace, workspace).await
    }
}
