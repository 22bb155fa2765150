//! The command/response protocol spoken over the api special file.
//!
//! Requests and responses are JSON envelopes carrying a `CommandId`; error
//! responses add an `ErrorCode` and `Message`. The numeric ids and codes are
//! the wire contract relied on by out-of-tree clients and must never be
//! renumbered.

pub mod client;
pub mod server;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::codec::record::ObjectType;
use crate::key::{ObjectKey, OBJECT_KEY_SIZE};
use crate::{datastore, tree, wsdb};

use num_traits::FromPrimitive;

/// Name of the filesystem in the mount table, used for api discovery.
pub const FILESYSTEM_NAME: &str = "quantumfs";

/// File name of the api special file inside a mount.
pub const API_PATH_NAME: &str = crate::wsdb::API_PATH;

/// Environment variable overriding api-file discovery.
pub const ENV_API_PATH: &str = "QUANTUMFS_API_PATH";

/// Inode number identifying the api special file inside a mount.
pub const API_INODE: u64 = 2;

/// Read granularity for responses; clients read until a short read.
pub const BUFFER_SIZE: usize = 4096;

pub mod command {
    //! Command ids. Wire contract; do not reorder.
    pub const INVALID: u32 = 0;
    pub const ERROR: u32 = 1;
    pub const BRANCH_REQUEST: u32 = 2;
    pub const GET_ACCESSED: u32 = 3;
    pub const CLEAR_ACCESSED: u32 = 4;
    pub const SYNC_ALL: u32 = 5;
    pub const INSERT_INODE: u32 = 6;
    pub const DELETE_WORKSPACE: u32 = 7;
    pub const SET_BLOCK: u32 = 8;
    pub const GET_BLOCK: u32 = 9;
    pub const ENABLE_ROOT_WRITE: u32 = 10;
    pub const SET_WORKSPACE_IMMUTABLE: u32 = 11;
    pub const MERGE_WORKSPACES: u32 = 12;
}

pub mod error_code {
    //! Error codes. Wire contract; do not reorder.
    pub const OK: u32 = 0;
    pub const BAD_ARGS: u32 = 1;
    pub const BAD_JSON: u32 = 2;
    pub const BAD_COMMAND_ID: u32 = 3;
    pub const COMMAND_FAILED: u32 = 4;
    pub const KEY_NOT_FOUND: u32 = 5;
    pub const BLOCK_TOO_LARGE: u32 = 6;
    pub const WORKSPACE_NOT_FOUND: u32 = 7;
}

/// Bit flags of the per-path access list.
pub mod path_flags {
    pub const CREATED: u32 = 0b0001;
    pub const READ: u32 = 0b0010;
    pub const UPDATED: u32 = 0b0100;
    pub const DELETED: u32 = 0b1000;
}

/// Paths touched in a workspace, each with its access flag bits.
pub type PathsAccessed = HashMap<String, u32>;

/// A typed api failure: wire error code plus human-readable message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub code: u32,
    pub message: String,
}

impl ApiError {
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    pub fn bad_args(message: impl Into<String>) -> Self {
        Self::new(error_code::BAD_ARGS, message)
    }

    pub fn command_failed(message: impl Into<String>) -> Self {
        Self::new(error_code::COMMAND_FAILED, message)
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "api error {}: {}", self.code, self.message)
    }
}

impl From<wsdb::Error> for ApiError {
    fn from(err: wsdb::Error) -> Self {
        match err {
            wsdb::Error::WorkspaceNotFound => {
                Self::new(error_code::WORKSPACE_NOT_FOUND, "workspace not found")
            }
            wsdb::Error::BadArguments(message) => Self::bad_args(message),
            other => Self::command_failed(other.to_string()),
        }
    }
}

impl From<datastore::Error> for ApiError {
    fn from(err: datastore::Error) -> Self {
        match err {
            datastore::Error::BlockMissing
            | datastore::Error::Store(crate::blobstore::Error::KeyNotFound) => {
                Self::new(error_code::KEY_NOT_FOUND, "key not found")
            }
            datastore::Error::BlockTooLarge(size) => {
                Self::new(error_code::BLOCK_TOO_LARGE, format!("block of {size} bytes"))
            }
            datastore::Error::Store(other) => Self::command_failed(other.to_string()),
        }
    }
}

impl From<tree::Error> for ApiError {
    fn from(err: tree::Error) -> Self {
        match err {
            tree::Error::Store(inner) => inner.into(),
            tree::Error::NotFound(path) => {
                Self::new(error_code::KEY_NOT_FOUND, format!("{path} not found"))
            }
            tree::Error::BadPath(path) => Self::bad_args(format!("bad path {path}")),
            tree::Error::NotADirectory(path) => {
                Self::command_failed(format!("{path} is not a directory"))
            }
            tree::Error::Codec(inner) => Self::command_failed(format!("{inner:?}")),
        }
    }
}

/// Splits a workspace name with exactly two `/` into its components.
pub fn parse_workspace_name(name: &str) -> Result<(&str, &str, &str), ApiError> {
    let parts: Vec<&str> = name.split('/').collect();
    match parts.as_slice() {
        [typespace, namespace, workspace]
            if parts.iter().all(|part| !part.is_empty()) =>
        {
            Ok((*typespace, *namespace, *workspace))
        }
        _ => Err(ApiError::bad_args(format!(
            "workspace name {name:?} must have exactly two \"/\""
        ))),
    }
}

/// Splits a workspace-relative path with at least two `/` into the workspace
/// triple and the remaining in-workspace components.
pub fn parse_workspace_path(path: &str) -> Result<((&str, &str, &str), Vec<&str>), ApiError> {
    let parts: Vec<&str> = path.split('/').filter(|part| !part.is_empty()).collect();
    if parts.len() < 3 {
        return Err(ApiError::bad_args(format!(
            "path {path:?} must have at least two \"/\""
        )));
    }
    Ok(((parts[0], parts[1], parts[2]), parts[3..].to_vec()))
}

/// A 30-byte extended key: object key, object type, and size, hex encoded
/// on the wire so it can travel through JSON and shell pipelines.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ExtendedKey {
    pub key: ObjectKey,
    pub object_type: ObjectType,
    pub size: u64,
}

impl ExtendedKey {
    pub const HEX_LENGTH: usize = (OBJECT_KEY_SIZE + 1 + 8) * 2;

    pub fn to_hex(&self) -> String {
        let mut bytes = Vec::with_capacity(OBJECT_KEY_SIZE + 1 + 8);
        bytes.extend_from_slice(&self.key.to_bytes());
        bytes.push(self.object_type as u8);
        bytes.extend_from_slice(&self.size.to_be_bytes());
        bytes.iter().map(|byte| format!("{byte:02x}")).collect()
    }

    pub fn from_hex(text: &str) -> Option<Self> {
        if text.len() != Self::HEX_LENGTH {
            return None;
        }
        let mut bytes = Vec::with_capacity(Self::HEX_LENGTH / 2);
        for chunk in text.as_bytes().chunks(2) {
            let hi = (chunk[0] as char).to_digit(16)?;
            let lo = (chunk[1] as char).to_digit(16)?;
            bytes.push((hi * 16 + lo) as u8);
        }
        let key = ObjectKey::from_bytes(&bytes[..OBJECT_KEY_SIZE])?;
        let object_type = ObjectType::from_u8(bytes[OBJECT_KEY_SIZE])?;
        let mut size_bytes = [0u8; 8];
        size_bytes.copy_from_slice(&bytes[OBJECT_KEY_SIZE + 1..]);
        Some(Self { key, object_type, size: u64::from_be_bytes(size_bytes) })
    }
}

// Request and response shapes. Field names are the wire contract.

#[derive(Debug, Serialize, Deserialize)]
pub struct CommandCommon {
    #[serde(rename = "CommandId")]
    pub command_id: u32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    #[serde(rename = "CommandId")]
    pub command_id: u32,
    #[serde(rename = "ErrorCode")]
    pub error_code: u32,
    #[serde(rename = "Message")]
    pub message: String,
}

impl ErrorResponse {
    pub fn ok() -> Self {
        Self { command_id: command::ERROR, error_code: error_code::OK, message: String::new() }
    }

    pub fn from_error(err: &ApiError) -> Self {
        Self { command_id: command::ERROR, error_code: err.code, message: err.message.clone() }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BranchRequest {
    #[serde(rename = "CommandId")]
    pub command_id: u32,
    #[serde(rename = "Src")]
    pub src: String,
    #[serde(rename = "Dst")]
    pub dst: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AccessedRequest {
    #[serde(rename = "CommandId")]
    pub command_id: u32,
    #[serde(rename = "WorkspaceRoot")]
    pub workspace_root: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AccessListResponse {
    #[serde(flatten)]
    pub err: ErrorResponse,
    #[serde(rename = "PathList")]
    pub paths: PathsAccessed,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SyncAllRequest {
    #[serde(rename = "CommandId")]
    pub command_id: u32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InsertInodeRequest {
    #[serde(rename = "CommandId")]
    pub command_id: u32,
    #[serde(rename = "DstPath")]
    pub dst_path: String,
    #[serde(rename = "Key")]
    pub key: String,
    #[serde(rename = "Uid")]
    pub uid: u32,
    #[serde(rename = "Gid")]
    pub gid: u32,
    #[serde(rename = "Permissions")]
    pub permissions: u32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteWorkspaceRequest {
    #[serde(rename = "CommandId")]
    pub command_id: u32,
    #[serde(rename = "WorkspacePath")]
    pub workspace_path: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SetBlockRequest {
    #[serde(rename = "CommandId")]
    pub command_id: u32,
    #[serde(rename = "Key")]
    pub key: Vec<u8>,
    #[serde(rename = "Data")]
    pub data: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GetBlockRequest {
    #[serde(rename = "CommandId")]
    pub command_id: u32,
    #[serde(rename = "Key")]
    pub key: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GetBlockResponse {
    #[serde(flatten)]
    pub err: ErrorResponse,
    #[serde(rename = "Data")]
    pub data: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EnableRootWriteRequest {
    #[serde(rename = "CommandId")]
    pub command_id: u32,
    #[serde(rename = "Workspace")]
    pub workspace: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SetWorkspaceImmutableRequest {
    #[serde(rename = "CommandId")]
    pub command_id: u32,
    #[serde(rename = "WorkspacePath")]
    pub workspace_path: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MergeRequest {
    #[serde(rename = "CommandId")]
    pub command_id: u32,
    /// `Newer`, `Local` or `Remote`; empty selects `Newer`.
    #[serde(rename = "Prefer", default)]
    pub prefer: String,
    /// Empty selects the null workspace.
    #[serde(rename = "BaseWorkspace", default)]
    pub base_workspace: String,
    #[serde(rename = "RemoteWorkspace")]
    pub remote_workspace: String,
    #[serde(rename = "LocalWorkspace")]
    pub local_workspace: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::KeyType;

    #[test]
    fn test_command_ids_are_wire_stable() {
        assert_eq!(command::INVALID, 0);
        assert_eq!(command::BRANCH_REQUEST, 2);
        assert_eq!(command::INSERT_INODE, 6);
        assert_eq!(command::MERGE_WORKSPACES, 12);
        assert_eq!(error_code::OK, 0);
        assert_eq!(error_code::BLOCK_TOO_LARGE, 6);
        assert_eq!(error_code::WORKSPACE_NOT_FOUND, 7);
    }

    #[test]
    fn test_workspace_name_validation() {
        assert!(parse_workspace_name("a/b/c").is_ok());
        assert!(parse_workspace_name("a/b").is_err());
        assert!(parse_workspace_name("a/b/c/d").is_err());
        assert!(parse_workspace_name("a//c").is_err());
    }

    #[test]
    fn test_workspace_path_validation() {
        let ((t, n, w), rest) = parse_workspace_path("a/b/c/usr/bin/cc").unwrap();
        assert_eq!((t, n, w), ("a", "b", "c"));
        assert_eq!(rest, vec!["usr", "bin", "cc"]);

        let ((t, _, _), rest) = parse_workspace_path("a/b/c").unwrap();
        assert_eq!(t, "a");
        assert!(rest.is_empty());

        assert!(parse_workspace_path("a/b").is_err());
    }

    #[test]
    fn test_extended_key_roundtrip() {
        let extended = ExtendedKey {
            key: ObjectKey::from_contents(KeyType::Data, b"contents"),
            object_type: ObjectType::MediumFile,
            size: 5 * 1024 * 1024,
        };
        let hex = extended.to_hex();
        assert_eq!(hex.len(), ExtendedKey::HEX_LENGTH);
        assert_eq!(ExtendedKey::from_hex(&hex), Some(extended));
        assert_eq!(ExtendedKey::from_hex("abcd"), None);
    }

    #[test]
    fn test_request_wire_shape() {
        let request = BranchRequest {
            command_id: command::BRANCH_REQUEST,
            src: "_/_/_".to_owned(),
            dst: "build/ci/run1".to_owned(),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["CommandId"], 2);
        assert_eq!(json["Src"], "_/_/_");
        assert_eq!(json["Dst"], "build/ci/run1");
    }

    #[test]
    fn test_error_response_flattening() {
        let response = GetBlockResponse {
            err: ErrorResponse::ok(),
            data: vec![1, 2, 3],
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["ErrorCode"], 0);
        assert_eq!(json["Data"], serde_json::json!([1, 2, 3]));
    }
}
