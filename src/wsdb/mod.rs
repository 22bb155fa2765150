//! The workspace database: named mutable pointers to immutable roots.
//!
//! A workspace is a `(typespace, namespace, workspace)` triple mapping to a
//! root object key plus a nonce. The trait here is the uncached contract
//! (§core); [`cache::CachedWorkspaceDb`] overlays the refresh/merge cache.

pub mod cache;
pub mod memory;
pub mod subscriptions;

use std::collections::HashMap;
use std::fmt;
use std::time::SystemTime;

use async_trait::async_trait;

use crate::key::ObjectKey;

/// The distinguished empty name component. `_/_/_` is the null workspace.
pub const NULL_SPACE_NAME: &str = "_";

/// Reserved path of the api special file inside a mount.
pub const API_PATH: &str = "api";

/// Identity and publication counter of a workspace lineage.
///
/// `id` is minted fresh whenever a workspace name is (re)created, so a
/// deleted-and-recreated workspace is distinguishable from its predecessor.
/// `publish_time` advances on every successful advance of the root.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct WorkspaceNonce {
    pub id: u64,
    pub publish_time: u64,
}

impl WorkspaceNonce {
    pub const INVALID: WorkspaceNonce = WorkspaceNonce { id: 0, publish_time: 0 };

    pub fn new(id: u64, publish_time: u64) -> Self {
        Self { id, publish_time }
    }

    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }

    /// True when both nonces name the same workspace lineage.
    pub fn same_lineage(&self, other: &WorkspaceNonce) -> bool {
        self.id == other.id
    }
}

impl fmt::Display for WorkspaceNonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.id, self.publish_time)
    }
}

/// Workspace database failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    WorkspaceExists,
    WorkspaceNotFound,
    /// A compare-and-set saw a root or nonce other than expected.
    WorkspaceOutOfDate,
    /// Mutation of a reserved name.
    Locked,
    BadArguments(String),
    Fatal(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::WorkspaceExists => write!(f, "workspace already exists"),
            Error::WorkspaceNotFound => write!(f, "workspace not found"),
            Error::WorkspaceOutOfDate => write!(f, "workspace out of date"),
            Error::Locked => write!(f, "workspace name is reserved"),
            Error::BadArguments(msg) => write!(f, "bad arguments: {msg}"),
            Error::Fatal(msg) => write!(f, "fatal workspace db failure: {msg}"),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// True for strings usable as one component of a workspace name.
pub fn valid_component(component: &str) -> bool {
    !component.is_empty() && !component.contains('/')
}

/// Store of workspace names. Readers take a shared lock; `branch`,
/// `advance`, `delete` and `set_workspace_immutable` are exclusive.
#[async_trait]
pub trait WorkspaceDb: Send + Sync {
    async fn num_typespaces(&self) -> Result<usize>;
    async fn typespace_list(&self) -> Result<Vec<String>>;

    /// Lists namespaces under `typespace`; empty when the typespace is
    /// unknown.
    async fn num_namespaces(&self, typespace: &str) -> Result<usize>;
    async fn namespace_list(&self, typespace: &str) -> Result<Vec<String>>;

    async fn num_workspaces(&self, typespace: &str, namespace: &str) -> Result<usize>;
    async fn workspace_list(
        &self,
        typespace: &str,
        namespace: &str,
    ) -> Result<HashMap<String, WorkspaceNonce>>;

    /// Resolves a workspace to its current root and nonce.
    async fn workspace(
        &self,
        typespace: &str,
        namespace: &str,
        workspace: &str,
    ) -> Result<(ObjectKey, WorkspaceNonce)>;

    /// Creates `dst` pointing at `src`'s current root, with a fresh nonce
    /// lineage.
    #[allow(clippy::too_many_arguments)]
    async fn branch_workspace(
        &self,
        src_typespace: &str,
        src_namespace: &str,
        src_workspace: &str,
        dst_typespace: &str,
        dst_namespace: &str,
        dst_workspace: &str,
    ) -> Result<(WorkspaceNonce, ObjectKey)>;

    /// Atomically replaces the root, conditional on the stored root and
    /// nonce both matching expectations. Returns the stored root and nonce
    /// after the operation.
    #[allow(clippy::too_many_arguments)]
    async fn advance_workspace(
        &self,
        typespace: &str,
        namespace: &str,
        workspace: &str,
        expected_nonce: WorkspaceNonce,
        expected_root: &ObjectKey,
        new_root: &ObjectKey,
    ) -> Result<(ObjectKey, WorkspaceNonce)>;

    /// Removes a workspace name. Reserved typespaces are locked; absent
    /// names succeed silently.
    async fn delete_workspace(&self, typespace: &str, namespace: &str, workspace: &str)
        -> Result<()>;

    /// Writes a mapping directly. Succeeds idempotently when the stored
    /// root equals `root`, fails out-of-date when it differs.
    async fn create_workspace(
        &self,
        typespace: &str,
        namespace: &str,
        workspace: &str,
        nonce: WorkspaceNonce,
        root: &ObjectKey,
    ) -> Result<()>;

    /// Marks a workspace immutable; later advances fail.
    async fn set_workspace_immutable(
        &self,
        typespace: &str,
        namespace: &str,
        workspace: &str,
    ) -> Result<()>;

    async fn workspace_is_immutable(
        &self,
        typespace: &str,
        namespace: &str,
        workspace: &str,
    ) -> Result<bool>;

    /// Instant of the last mutation, at microsecond resolution.
    async fn workspace_last_write_time(
        &self,
        typespace: &str,
        namespace: &str,
        workspace: &str,
    ) -> Result<SystemTime>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nonce_validity() {
        assert!(!WorkspaceNonce::INVALID.is_valid());
        assert!(WorkspaceNonce::new(1, 0).is_valid());
        assert!(WorkspaceNonce::default() == WorkspaceNonce::INVALID);
    }

    #[test]
    fn test_nonce_lineage() {
        let a = WorkspaceNonce::new(5, 100);
        let b = WorkspaceNonce::new(5, 200);
        let c = WorkspaceNonce::new(6, 100);
        assert!(a.same_lineage(&b));
        assert!(!a.same_lineage(&c));
    }

    #[test]
    fn test_component_validation() {
        assert!(valid_component("build"));
        assert!(valid_component(NULL_SPACE_NAME));
        assert!(!valid_component(""));
        assert!(!valid_component("a/b"));
    }
}
