//! Server side of the api protocol: request dispatch and the core-backed
//! command handler.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use super::{
    command, error_code, parse_workspace_name, parse_workspace_path, AccessListResponse,
    AccessedRequest, ApiError, BranchRequest, CommandCommon, DeleteWorkspaceRequest,
    EnableRootWriteRequest, ErrorResponse, ExtendedKey, GetBlockRequest, GetBlockResponse,
    InsertInodeRequest, MergeRequest, PathsAccessed, SetBlockRequest,
    SetWorkspaceImmutableRequest, SyncAllRequest,
};
use crate::codec::record::{DirectoryRecord, IdClass};
use crate::datastore::{Buffer, Datastore};
use crate::key::{content_hash, empty_workspace_key, KeyType, ObjectKey};
use crate::merge::{merge_workspace_roots, MergePreference};
use crate::tree::insert_into_workspace;
use crate::wsdb::{WorkspaceDb, NULL_SPACE_NAME};
use crate::Core;

/// The operations a daemon exposes through the api file. [`dispatch`]
/// performs envelope parsing and argument validation; implementations see
/// only well-formed commands.
#[async_trait]
pub trait ApiHandler: Send + Sync {
    async fn branch_workspace(&self, src: &str, dst: &str) -> Result<(), ApiError>;
    async fn get_accessed(&self, workspace: &str) -> Result<PathsAccessed, ApiError>;
    async fn clear_accessed(&self, workspace: &str) -> Result<(), ApiError>;
    async fn sync_all(&self) -> Result<(), ApiError>;
    async fn insert_inode(
        &self,
        dst_path: &str,
        key: ExtendedKey,
        uid: u32,
        gid: u32,
        permissions: u32,
    ) -> Result<(), ApiError>;
    async fn delete_workspace(&self, workspace: &str) -> Result<(), ApiError>;
    async fn set_block(&self, key: &[u8], data: &[u8]) -> Result<(), ApiError>;
    async fn get_block(&self, key: &[u8]) -> Result<Vec<u8>, ApiError>;
    async fn enable_root_write(&self, workspace: &str) -> Result<(), ApiError>;
    async fn set_workspace_immutable(&self, workspace: &str) -> Result<(), ApiError>;
    async fn merge_workspaces(
        &self,
        base: &str,
        remote: &str,
        local: &str,
        prefer: MergePreference,
    ) -> Result<(), ApiError>;
}

fn encode<T: Serialize>(response: &T) -> Vec<u8> {
    serde_json::to_vec(response).unwrap_or_else(|_| {
        br#"{"CommandId":1,"ErrorCode":4,"Message":"response encoding failed"}"#.to_vec()
    })
}

fn error_bytes(err: &ApiError) -> Vec<u8> {
    encode(&ErrorResponse::from_error(err))
}

fn ok_bytes() -> Vec<u8> {
    encode(&ErrorResponse::ok())
}

fn parse<T: serde::de::DeserializeOwned>(request: &[u8]) -> Result<T, ApiError> {
    serde_json::from_slice(request)
        .map_err(|err| ApiError::new(error_code::BAD_JSON, err.to_string()))
}

/// Executes one api request against `handler`, returning the response
/// bytes. Every failure becomes an [`ErrorResponse`]; this function never
/// fails.
pub async fn dispatch(handler: &dyn ApiHandler, request: &[u8]) -> Vec<u8> {
    match dispatch_inner(handler, request).await {
        Ok(response) => response,
        Err(err) => error_bytes(&err),
    }
}

async fn dispatch_inner(handler: &dyn ApiHandler, request: &[u8]) -> Result<Vec<u8>, ApiError> {
    let common: CommandCommon = parse(request)?;
    debug!(command_id = common.command_id, "api command");
    match common.command_id {
        command::BRANCH_REQUEST => {
            let args: BranchRequest = parse(request)?;
            parse_workspace_name(&args.src)?;
            parse_workspace_name(&args.dst)?;
            handler.branch_workspace(&args.src, &args.dst).await?;
            Ok(ok_bytes())
        }
        command::GET_ACCESSED => {
            let args: AccessedRequest = parse(request)?;
            parse_workspace_name(&args.workspace_root)?;
            let paths = handler.get_accessed(&args.workspace_root).await?;
            Ok(encode(&AccessListResponse { err: ErrorResponse::ok(), paths }))
        }
        command::CLEAR_ACCESSED => {
            let args: AccessedRequest = parse(request)?;
            parse_workspace_name(&args.workspace_root)?;
            handler.clear_accessed(&args.workspace_root).await?;
            Ok(ok_bytes())
        }
        command::SYNC_ALL => {
            let _args: SyncAllRequest = parse(request)?;
            handler.sync_all().await?;
            Ok(ok_bytes())
        }
        command::INSERT_INODE => {
            let args: InsertInodeRequest = parse(request)?;
            let (_, rest) = parse_workspace_path(&args.dst_path)?;
            if rest.is_empty() {
                return Err(ApiError::bad_args("destination path names no file"));
            }
            let key = ExtendedKey::from_hex(&args.key)
                .ok_or_else(|| ApiError::bad_args("malformed extended key"))?;
            handler
                .insert_inode(&args.dst_path, key, args.uid, args.gid, args.permissions)
                .await?;
            Ok(ok_bytes())
        }
        command::DELETE_WORKSPACE => {
            let args: DeleteWorkspaceRequest = parse(request)?;
            parse_workspace_name(&args.workspace_path)?;
            handler.delete_workspace(&args.workspace_path).await?;
            Ok(ok_bytes())
        }
        command::SET_BLOCK => {
            let args: SetBlockRequest = parse(request)?;
            if args.key.is_empty() {
                return Err(ApiError::bad_args("empty block key"));
            }
            handler.set_block(&args.key, &args.data).await?;
            Ok(ok_bytes())
        }
        command::GET_BLOCK => {
            let args: GetBlockRequest = parse(request)?;
            if args.key.is_empty() {
                return Err(ApiError::bad_args("empty block key"));
            }
            let data = handler.get_block(&args.key).await?;
            Ok(encode(&GetBlockResponse { err: ErrorResponse::ok(), data }))
        }
        command::ENABLE_ROOT_WRITE => {
            let args: EnableRootWriteRequest = parse(request)?;
            parse_workspace_name(&args.workspace)?;
            handler.enable_root_write(&args.workspace).await?;
            Ok(ok_bytes())
        }
        command::SET_WORKSPACE_IMMUTABLE => {
            let args: SetWorkspaceImmutableRequest = parse(request)?;
            parse_workspace_name(&args.workspace_path)?;
            handler.set_workspace_immutable(&args.workspace_path).await?;
            Ok(ok_bytes())
        }
        command::MERGE_WORKSPACES => {
            let args: MergeRequest = parse(request)?;
            if !args.base_workspace.is_empty() {
                parse_workspace_name(&args.base_workspace)?;
            }
            parse_workspace_name(&args.remote_workspace)?;
            parse_workspace_name(&args.local_workspace)?;
            let prefer = MergePreference::from_name(&args.prefer)
                .ok_or_else(|| ApiError::bad_args(format!("unknown preference {:?}", args.prefer)))?;
            handler
                .merge_workspaces(
                    &args.base_workspace,
                    &args.remote_workspace,
                    &args.local_workspace,
                    prefer,
                )
                .await?;
            Ok(ok_bytes())
        }
        other => Err(ApiError::new(
            error_code::BAD_COMMAND_ID,
            format!("unknown command id {other}"),
        )),
    }
}

/// The reference [`ApiHandler`], executing commands directly against a
/// [`Core`]. The mount daemon substitutes its own handler for the commands
/// that need live inode state.
pub struct CoreHandler {
    core: Arc<Core>,
    accessed: Mutex<HashMap<String, PathsAccessed>>,
}

impl CoreHandler {
    pub fn new(core: Arc<Core>) -> Self {
        Self { core, accessed: Mutex::new(HashMap::new()) }
    }

    fn lock_accessed(&self) -> MutexGuard<'_, HashMap<String, PathsAccessed>> {
        self.accessed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records that `path` in `workspace` was touched with `flags`; the
    /// daemon calls this from its read/write paths.
    pub fn record_access(&self, workspace: &str, path: &str, flags: u32) {
        let mut accessed = self.lock_accessed();
        *accessed.entry(workspace.to_owned()).or_default().entry(path.to_owned()).or_insert(0) |=
            flags;
    }

    /// Resolves a workspace name to its current root, mapping the empty
    /// base spelling to the null workspace.
    async fn resolve_root(&self, name: &str) -> Result<ObjectKey, ApiError> {
        if name.is_empty() {
            return Ok(empty_workspace_key());
        }
        let (typespace, namespace, workspace) = parse_workspace_name(name)?;
        let (root, _) = self.core.wsdb.workspace(typespace, namespace, workspace).await?;
        Ok(root)
    }

    /// The block-command namespace: user keys are hashed into Buildable
    /// keys, disjoint from content-addressed metadata and data.
    fn block_key(raw: &[u8]) -> ObjectKey {
        ObjectKey::new(KeyType::Buildable, content_hash(raw))
    }
}

#[async_trait]
impl ApiHandler for CoreHandler {
    async fn branch_workspace(&self, src: &str, dst: &str) -> Result<(), ApiError> {
        let (src_t, src_n, src_w) = parse_workspace_name(src)?;
        let (dst_t, dst_n, dst_w) = parse_workspace_name(dst)?;
        self.core.wsdb.branch_workspace(src_t, src_n, src_w, dst_t, dst_n, dst_w).await?;
        Ok(())
    }

    async fn get_accessed(&self, workspace: &str) -> Result<PathsAccessed, ApiError> {
        Ok(self.lock_accessed().get(workspace).cloned().unwrap_or_default())
    }

    async fn clear_accessed(&self, workspace: &str) -> Result<(), ApiError> {
        self.lock_accessed().remove(workspace);
        Ok(())
    }

    async fn sync_all(&self) -> Result<(), ApiError> {
        // The core writes through on every operation; there is nothing
        // buffered to flush.
        Ok(())
    }

    async fn insert_inode(
        &self,
        dst_path: &str,
        key: ExtendedKey,
        uid: u32,
        gid: u32,
        permissions: u32,
    ) -> Result<(), ApiError> {
        let ((typespace, namespace, workspace), rest) = parse_workspace_path(dst_path)?;
        let Some(filename) = rest.last() else {
            return Err(ApiError::bad_args("destination path names no file"));
        };
        let (root, nonce) = self.core.wsdb.workspace(typespace, namespace, workspace).await?;

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
        let mut record = DirectoryRecord::new(*filename, key.object_type, key.key);
        record.size = key.size;
        record.permissions = permissions;
        record.owner = IdClass::from_raw(uid);
        record.group = IdClass::from_raw(gid);
        record.modification_time = now;
        record.content_time = now;

        let new_root =
            insert_into_workspace(self.core.datastore.as_ref(), &root, &rest, record).await?;
        self.core
            .wsdb
            .advance_workspace(typespace, namespace, workspace, nonce, &root, &new_root)
            .await?;

        let name = format!("{typespace}/{namespace}/{workspace}");
        self.record_access(&name, &format!("/{}", rest.join("/")), super::path_flags::CREATED);
        Ok(())
    }

    async fn delete_workspace(&self, workspace: &str) -> Result<(), ApiError> {
        let (typespace, namespace, name) = parse_workspace_name(workspace)?;
        self.core.wsdb.delete_workspace(typespace, namespace, name).await?;
        Ok(())
    }

    async fn set_block(&self, key: &[u8], data: &[u8]) -> Result<(), ApiError> {
        let block_key = Self::block_key(key);
        let buffer = Buffer::with_contents(KeyType::Buildable, data.to_vec());
        self.core.datastore.set(&block_key, &buffer).await?;
        Ok(())
    }

    async fn get_block(&self, key: &[u8]) -> Result<Vec<u8>, ApiError> {
        let block_key = Self::block_key(key);
        let mut buffer = Buffer::new();
        self.core.datastore.get(&block_key, &mut buffer).await?;
        Ok(buffer.into_data())
    }

    async fn enable_root_write(&self, workspace: &str) -> Result<(), ApiError> {
        // Root write-permission lives in the mount daemon's inode state;
        // the core's part is confirming the workspace exists.
        let (typespace, namespace, name) = parse_workspace_name(workspace)?;
        self.core.wsdb.workspace(typespace, namespace, name).await?;
        Ok(())
    }

    async fn set_workspace_immutable(&self, workspace: &str) -> Result<(), ApiError> {
        let (typespace, namespace, name) = parse_workspace_name(workspace)?;
        self.core.wsdb.set_workspace_immutable(typespace, namespace, name).await?;
        Ok(())
    }

    async fn merge_workspaces(
        &self,
        base: &str,
        remote: &str,
        local: &str,
        prefer: MergePreference,
    ) -> Result<(), ApiError> {
        let base_root = if base.is_empty() {
            let (root, _) = self
                .core
                .wsdb
                .workspace(NULL_SPACE_NAME, NULL_SPACE_NAME, NULL_SPACE_NAME)
                .await?;
            root
        } else {
            self.resolve_root(base).await?
        };
        let remote_root = self.resolve_root(remote).await?;

        let (local_t, local_n, local_w) = parse_workspace_name(local)?;
        let (local_root, local_nonce) =
            self.core.wsdb.workspace(local_t, local_n, local_w).await?;

        let merged = merge_workspace_roots(
            self.core.datastore.as_ref(),
            &base_root,
            &remote_root,
            &local_root,
            prefer,
        )
        .await?;

        if merged != local_root {
            self.core
                .wsdb
                .advance_workspace(local_t, local_n, local_w, local_nonce, &local_root, &merged)
                .await?;
        }
        Ok(())
    }
}
