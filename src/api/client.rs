//! Client handle for the api special file.
//!
//! Tools find the api file by, in order: the `QUANTUMFS_API_PATH`
//! environment variable, a mount-table entry whose filesystem type is
//! `quantumfs` (exactly one must match), and finally upward traversal from
//! the current directory looking for an `api` entry carrying the sentinel
//! inode number 2.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use super::{
    command, error_code, AccessListResponse, AccessedRequest, ApiError, BranchRequest,
    DeleteWorkspaceRequest, EnableRootWriteRequest, ErrorResponse, ExtendedKey, GetBlockRequest,
    GetBlockResponse, InsertInodeRequest, MergeRequest, PathsAccessed, SetBlockRequest,
    SetWorkspaceImmutableRequest, SyncAllRequest, API_INODE, API_PATH_NAME, BUFFER_SIZE,
    ENV_API_PATH, FILESYSTEM_NAME,
};

/// Client-side failures.
#[derive(Debug)]
pub enum ClientError {
    /// The api file could not be found or spoken to.
    Io(io::Error),
    /// The daemon answered with a non-ok error code.
    Api(ApiError),
    /// The daemon's response did not parse.
    BadResponse(serde_json::Error),
}

impl From<io::Error> for ClientError {
    fn from(err: io::Error) -> Self {
        ClientError::Io(err)
    }
}

impl From<ApiError> for ClientError {
    fn from(err: ApiError) -> Self {
        ClientError::Api(err)
    }
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Io(err) => write!(f, "api io failure: {err}"),
            ClientError::Api(err) => write!(f, "{err}"),
            ClientError::BadResponse(err) => write!(f, "unparseable api response: {err}"),
        }
    }
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Locates the api file.
pub fn find_api_path() -> io::Result<PathBuf> {
    if let Ok(path) = std::env::var(ENV_API_PATH) {
        return Ok(PathBuf::from(path));
    }
    if let Some(path) = api_path_from_mounts(Path::new("/proc/self/mounts"))? {
        return Ok(path);
    }
    if let Some(path) = api_path_by_ascent(&std::env::current_dir()?) {
        return Ok(path);
    }
    Err(io::Error::new(io::ErrorKind::NotFound, "no quantumfs api file found"))
}

/// Scans a mounts table for quantumfs entries; a unique match yields its api
/// path, several matches yield none (ambiguous).
fn api_path_from_mounts(mounts: &Path) -> io::Result<Option<PathBuf>> {
    let table = match std::fs::read_to_string(mounts) {
        Ok(table) => table,
        Err(_) => return Ok(None),
    };
    let mut found = None;
    for line in table.lines() {
        let mut fields = line.split_whitespace();
        let (Some(_device), Some(mountpoint), Some(fstype)) =
            (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        if fstype != FILESYSTEM_NAME {
            continue;
        }
        if found.is_some() {
            debug!("multiple quantumfs mounts, refusing to guess");
            return Ok(None);
        }
        found = Some(PathBuf::from(mountpoint).join(API_PATH_NAME));
    }
    Ok(found)
}

/// Walks from `start` toward `/`, returning the first `api` entry with the
/// sentinel inode.
fn api_path_by_ascent(start: &Path) -> Option<PathBuf> {
    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(API_PATH_NAME);
        if let Ok(metadata) = std::fs::metadata(&candidate) {
            if metadata.ino() == API_INODE {
                return Some(candidate);
            }
        }
        if !dir.pop() {
            return None;
        }
    }
}

/// A connection to the daemon through the api file.
pub struct Api {
    file: File,
}

impl Api {
    /// Connects via the discovery order documented on [`find_api_path`].
    pub fn connect() -> io::Result<Self> {
        Self::connect_at(&find_api_path()?)
    }

    pub fn connect_at(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self { file })
    }

    /// Writes one request and reads the full response in
    /// [`BUFFER_SIZE`]-sized chunks until a short read.
    fn send(&mut self, request: &[u8]) -> io::Result<Vec<u8>> {
        self.file.write_all(request)?;
        let mut response = Vec::new();
        let mut chunk = [0u8; BUFFER_SIZE];
        loop {
            let n = self.file.read(&mut chunk)?;
            response.extend_from_slice(&chunk[..n]);
            if n < BUFFER_SIZE {
                return Ok(response);
            }
        }
    }

    fn round_trip<Req: Serialize, Resp: DeserializeOwned>(
        &mut self,
        request: &Req,
    ) -> ClientResult<Resp> {
        let bytes = serde_json::to_vec(request).map_err(ClientError::BadResponse)?;
        let response = self.send(&bytes)?;
        let envelope: ErrorResponse =
            serde_json::from_slice(&response).map_err(ClientError::BadResponse)?;
        if envelope.error_code != error_code::OK {
            return Err(ClientError::Api(ApiError::new(envelope.error_code, envelope.message)));
        }
        serde_json::from_slice(&response).map_err(ClientError::BadResponse)
    }

    fn round_trip_ok<Req: Serialize>(&mut self, request: &Req) -> ClientResult<()> {
        let _: ErrorResponse = self.round_trip(request)?;
        Ok(())
    }

    /// Branches `src` into the not-yet-existing workspace `dst`.
    pub fn branch(&mut self, src: &str, dst: &str) -> ClientResult<()> {
        self.round_trip_ok(&BranchRequest {
            command_id: command::BRANCH_REQUEST,
            src: src.to_owned(),
            dst: dst.to_owned(),
        })
    }

    /// Fetches the accessed-path list of a workspace.
    pub fn get_accessed(&mut self, workspace: &str) -> ClientResult<PathsAccessed> {
        let response: AccessListResponse = self.round_trip(&AccessedRequest {
            command_id: command::GET_ACCESSED,
            workspace_root: workspace.to_owned(),
        })?;
        Ok(response.paths)
    }

    pub fn clear_accessed(&mut self, workspace: &str) -> ClientResult<()> {
        self.round_trip_ok(&AccessedRequest {
            command_id: command::CLEAR_ACCESSED,
            workspace_root: workspace.to_owned(),
        })
    }

    /// Flushes all dirty state to the object store.
    pub fn sync_all(&mut self) -> ClientResult<()> {
        self.round_trip_ok(&SyncAllRequest { command_id: command::SYNC_ALL })
    }

    /// Places an existing object at `dst_path` (`t/n/w/path...`).
    pub fn insert_inode(
        &mut self,
        dst_path: &str,
        key: &ExtendedKey,
        uid: u32,
        gid: u32,
        permissions: u32,
    ) -> ClientResult<()> {
        self.round_trip_ok(&InsertInodeRequest {
            command_id: command::INSERT_INODE,
            dst_path: dst_path.to_owned(),
            key: key.to_hex(),
            uid,
            gid,
            permissions,
        })
    }

    pub fn delete_workspace(&mut self, workspace: &str) -> ClientResult<()> {
        self.round_trip_ok(&DeleteWorkspaceRequest {
            command_id: command::DELETE_WORKSPACE,
            workspace_path: workspace.to_owned(),
        })
    }

    /// Stores a block in the tool-visible key namespace.
    pub fn set_block(&mut self, key: &[u8], data: &[u8]) -> ClientResult<()> {
        self.round_trip_ok(&SetBlockRequest {
            command_id: command::SET_BLOCK,
            key: key.to_vec(),
            data: data.to_vec(),
        })
    }

    pub fn get_block(&mut self, key: &[u8]) -> ClientResult<Vec<u8>> {
        let response: GetBlockResponse = self.round_trip(&GetBlockRequest {
            command_id: command::GET_BLOCK,
            key: key.to_vec(),
        })?;
        Ok(response.data)
    }

    pub fn enable_root_write(&mut self, workspace: &str) -> ClientResult<()> {
        self.round_trip_ok(&EnableRootWriteRequest {
            command_id: command::ENABLE_ROOT_WRITE,
            workspace: workspace.to_owned(),
        })
    }

    pub fn set_workspace_immutable(&mut self, workspace: &str) -> ClientResult<()> {
        self.round_trip_ok(&SetWorkspaceImmutableRequest {
            command_id: command::SET_WORKSPACE_IMMUTABLE,
            workspace_path: workspace.to_owned(),
        })
    }

    /// Three-way merge of `remote` into `local` against `base` (empty base
    /// selects the null workspace).
    pub fn merge_workspaces(
        &mut self,
        base: &str,
        remote: &str,
        local: &str,
        prefer: &str,
    ) -> ClientResult<()> {
        self.round_trip_ok(&MergeRequest {
            command_id: command::MERGE_WORKSPACES,
            prefer: prefer.to_owned(),
            base_workspace: base.to_owned(),
            remote_workspace: remote.to_owned(),
            local_workspace: local.to_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mount_scan_single_match() {
        let dir = tempfile::tempdir().unwrap();
        let mounts = dir.path().join("mounts");
        std::fs::write(
            &mounts,
            "proc /proc proc rw 0 0\n\
             qfs /mnt/quantumfs quantumfs rw 0 0\n\
             tmpfs /tmp tmpfs rw 0 0\n",
        )
        .unwrap();
        let found = api_path_from_mounts(&mounts).unwrap();
        assert_eq!(found, Some(PathBuf::from("/mnt/quantumfs/api")));
    }

    #[test]
    fn test_mount_scan_ambiguous() {
        let dir = tempfile::tempdir().unwrap();
        let mounts = dir.path().join("mounts");
        std::fs::write(
            &mounts,
            "qfs /mnt/a quantumfs rw 0 0\nqfs /mnt/b quantumfs rw 0 0\n",
        )
        .unwrap();
        assert_eq!(api_path_from_mounts(&mounts).unwrap(), None);
    }

    #[test]
    fn test_mount_scan_no_match() {
        let dir = tempfile::tempdir().unwrap();
        let mounts = dir.path().join("mounts");
        std::fs::write(&mounts, "proc /proc proc rw 0 0\n").unwrap();
        assert_eq!(api_path_from_mounts(&mounts).unwrap(), None);
    }

    #[test]
    fn test_ascent_requires_sentinel_inode() {
        // A regular file named "api" almost never lands on inode 2, so the
        // ascent must walk past it.
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(dir.path().join("api"), b"decoy").unwrap();

        let found = api_path_by_ascent(&nested);
        if let Some(path) = found {
            assert_eq!(std::fs::metadata(&path).unwrap().ino(), API_INODE);
        }
    }
}
