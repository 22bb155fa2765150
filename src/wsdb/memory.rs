//! Process-local workspace database engine.
//!
//! The durable-KV stand-in used by tests and as the backing store behind the
//! cache. Namespaces and typespaces emptied by deletion are pruned so lists
//! reflect only live workspaces.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use super::{valid_component, Error, Result, WorkspaceDb, WorkspaceNonce, NULL_SPACE_NAME};
use crate::key::{empty_workspace_key, ObjectKey};

#[derive(Clone)]
struct Record {
    root: ObjectKey,
    nonce: WorkspaceNonce,
    immutable: bool,
    last_write_micros: u64,
}

type Spaces = HashMap<String, HashMap<String, HashMap<String, Record>>>;

/// In-memory [`WorkspaceDb`], seeded with the null workspace.
pub struct MemoryWsdb {
    spaces: RwLock<Spaces>,
    next_lineage: AtomicU64,
}

fn now_micros() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_micros() as u64
}

fn validate(typespace: &str, namespace: &str, workspace: &str) -> Result<()> {
    for component in [typespace, namespace, workspace] {
        if !valid_component(component) {
            return Err(Error::BadArguments(format!("bad name component {component:?}")));
        }
    }
    Ok(())
}

fn lookup<'a>(
    spaces: &'a Spaces,
    typespace: &str,
    namespace: &str,
    workspace: &str,
) -> Result<&'a Record> {
    spaces
        .get(typespace)
        .and_then(|namespaces| namespaces.get(namespace))
        .and_then(|workspaces| workspaces.get(workspace))
        .ok_or(Error::WorkspaceNotFound)
}

fn is_null_workspace(typespace: &str, namespace: &str, workspace: &str) -> bool {
    typespace == NULL_SPACE_NAME && namespace == NULL_SPACE_NAME && workspace == NULL_SPACE_NAME
}

impl Default for MemoryWsdb {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryWsdb {
    pub fn new() -> Self {
        let mut spaces = Spaces::new();
        let null = Record {
            root: empty_workspace_key(),
            nonce: WorkspaceNonce::INVALID,
            immutable: false,
            last_write_micros: now_micros(),
        };
        spaces
            .entry(NULL_SPACE_NAME.to_owned())
            .or_default()
            .entry(NULL_SPACE_NAME.to_owned())
            .or_default()
            .insert(NULL_SPACE_NAME.to_owned(), null);
        Self { spaces: RwLock::new(spaces), next_lineage: AtomicU64::new(1) }
    }

    fn mint_nonce(&self) -> WorkspaceNonce {
        WorkspaceNonce::new(self.next_lineage.fetch_add(1, Ordering::Relaxed), now_micros())
    }
}

#[async_trait]
impl WorkspaceDb for MemoryWsdb {
    async fn num_typespaces(&self) -> Result<usize> {
        Ok(self.spaces.read().await.len())
    }

    async fn typespace_list(&self) -> Result<Vec<String>> {
        Ok(self.spaces.read().await.keys().cloned().collect())
    }

    async fn num_namespaces(&self, typespace: &str) -> Result<usize> {
        Ok(self.spaces.read().await.get(typespace).map_or(0, HashMap::len))
    }

    async fn namespace_list(&self, typespace: &str) -> Result<Vec<String>> {
        let spaces = self.spaces.read().await;
        Ok(spaces.get(typespace).map_or_else(Vec::new, |n| n.keys().cloned().collect()))
    }

    async fn num_workspaces(&self, typespace: &str, namespace: &str) -> Result<usize> {
        let spaces = self.spaces.read().await;
        Ok(spaces.get(typespace).and_then(|n| n.get(namespace)).map_or(0, HashMap::len))
    }

    async fn workspace_list(
        &self,
        typespace: &str,
        namespace: &str,
    ) -> Result<HashMap<String, WorkspaceNonce>> {
        let spaces = self.spaces.read().await;
        Ok(spaces.get(typespace).and_then(|n| n.get(namespace)).map_or_else(HashMap::new, |w| {
            w.iter().map(|(name, record)| (name.clone(), record.nonce)).collect()
        }))
    }

    async fn workspace(
        &self,
        typespace: &str,
        namespace: &str,
        workspace: &str,
    ) -> Result<(ObjectKey, WorkspaceNonce)> {
        let spaces = self.spaces.read().await;
        let record = lookup(&spaces, typespace, namespace, workspace)?;
        Ok((record.root, record.nonce))
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
        validate(src_typespace, src_namespace, src_workspace)?;
        validate(dst_typespace, dst_namespace, dst_workspace)?;
        if dst_typespace == NULL_SPACE_NAME {
            return Err(Error::Locked);
        }

        let mut spaces = self.spaces.write().await;
        let root = lookup(&spaces, src_typespace, src_namespace, src_workspace)?.root;

        let namespaces = spaces.entry(dst_typespace.to_owned()).or_default();
        let workspaces = namespaces.entry(dst_namespace.to_owned()).or_default();
        if workspaces.contains_key(dst_workspace) {
            return Err(Error::WorkspaceExists);
        }

        let nonce = self.mint_nonce();
        let src = format!("{src_typespace}/{src_namespace}/{src_workspace}");
        let dst = format!("{dst_typespace}/{dst_namespace}/{dst_workspace}");
        debug!(%src, %dst, %nonce, "branching workspace");
        workspaces.insert(
            dst_workspace.to_owned(),
            Record { root, nonce, immutable: false, last_write_micros: now_micros() },
        );
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
        let mut spaces = self.spaces.write().await;
        let record = spaces
            .get_mut(typespace)
            .and_then(|namespaces| namespaces.get_mut(namespace))
            .and_then(|workspaces| workspaces.get_mut(workspace))
            .ok_or(Error::WorkspaceNotFound)?;

        if record.immutable {
            return Err(Error::WorkspaceOutOfDate);
        }
        // The null workspace is write-once: after it first gains a real
        // root, no advance can succeed, matching nonces or not.
        if is_null_workspace(typespace, namespace, workspace)
            && record.root != empty_workspace_key()
        {
            return Err(Error::WorkspaceOutOfDate);
        }
        if record.nonce != expected_nonce || record.root != *expected_root {
            return Err(Error::WorkspaceOutOfDate);
        }

        let now = now_micros().max(record.nonce.publish_time + 1);
        record.root = *new_root;
        record.nonce.publish_time = now;
        record.last_write_micros = now;
        Ok((record.root, record.nonce))
    }

    async fn delete_workspace(
        &self,
        typespace: &str,
        namespace: &str,
        workspace: &str,
    ) -> Result<()> {
        if typespace == NULL_SPACE_NAME {
            return Err(Error::Locked);
        }
        let mut spaces = self.spaces.write().await;
        let Some(namespaces) = spaces.get_mut(typespace) else { return Ok(()) };
        let Some(workspaces) = namespaces.get_mut(namespace) else { return Ok(()) };
        workspaces.remove(workspace);
        if workspaces.is_empty() {
            namespaces.remove(namespace);
        }
        if namespaces.is_empty() {
            spaces.remove(typespace);
        }
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
        validate(typespace, namespace, workspace)?;
        let mut spaces = self.spaces.write().await;
        let workspaces = spaces
            .entry(typespace.to_owned())
            .or_default()
            .entry(namespace.to_owned())
            .or_default();
        match workspaces.get(workspace) {
            None => {
                workspaces.insert(
                    workspace.to_owned(),
                    Record { root: *root, nonce, immutable: false, last_write_micros: now_micros() },
                );
                Ok(())
            }
            Some(existing) if existing.root == *root => Ok(()),
            Some(_) => Err(Error::WorkspaceOutOfDate),
        }
    }

    async fn set_workspace_immutable(
        &self,
        typespace: &str,
        namespace: &str,
        workspace: &str,
    ) -> Result<()> {
        let mut spaces = self.spaces.write().await;
        let record = spaces
            .get_mut(typespace)
            .and_then(|namespaces| namespaces.get_mut(namespace))
            .and_then(|workspaces| workspaces.get_mut(workspace))
            .ok_or(Error::WorkspaceNotFound)?;
        record.immutable = true;
        Ok(())
    }

    async fn workspace_is_immutable(
        &self,
        typespace: &str,
        namespace: &str,
        workspace: &str,
    ) -> Result<bool> {
        let spaces = self.spaces.read().await;
        Ok(lookup(&spaces, typespace, namespace, workspace)?.immutable)
    }

    async fn workspace_last_write_time(
        &self,
        typespace: &str,
        namespace: &str,
        workspace: &str,
    ) -> Result<SystemTime> {
        let spaces = self.spaces.read().await;
        let record = lookup(&spaces, typespace, namespace, workspace)?;
        Ok(UNIX_EPOCH + Duration::from_micros(record.last_write_micros))
    }
}
