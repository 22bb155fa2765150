//! Workspace graph traversal.
//!
//! [`walk`] drives a visitor over every reachable object of a workspace,
//! starting from its root key. Metadata blocks are fetched and decoded by
//! expected kind; content blocks are reported but never fetched. The visitor
//! sees every per-object error and chooses between aborting the walk and
//! pruning the failed hierarchy, which is what makes best-effort scans (TTL
//! freshening, disk accounting) possible over partially-damaged workspaces.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;

use tracing::warn;

use crate::codec::directory::DirectoryEntry;
use crate::codec::hardlink::{self, HardlinkRecord};
use crate::codec::record::{DirectoryRecord, ObjectType};
use crate::codec::workspace_root::WorkspaceRoot;
use crate::codec::{self, directory, file, workspace_root, xattr};
use crate::datastore::{Buffer, Datastore};
use crate::key::{is_constant_or_embedded, ObjectKey};

/// Classification of walker failures.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// The datastore could not produce the block.
    Fetch,
    /// The block decoded as something other than the expected kind.
    Malformed,
    /// The workspace hardlink table could not be read, poisoning all legs.
    HardlinkTable,
    /// A panic was caught in the visitor or the walker itself.
    Panic,
}

/// A walker failure, cheap to clone so it can both be delivered to the
/// visitor and returned from the walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkerError {
    pub kind: ErrorKind,
    pub path: String,
    pub message: String,
}

impl WalkerError {
    fn fetch(path: &str, err: crate::datastore::Error) -> Self {
        Self { kind: ErrorKind::Fetch, path: path.to_owned(), message: format!("{err:?}") }
    }

    fn malformed(path: &str, err: &codec::Error) -> Self {
        Self { kind: ErrorKind::Malformed, path: path.to_owned(), message: format!("{err:?}") }
    }

    fn hardlink_table(path: &str, message: String) -> Self {
        Self { kind: ErrorKind::HardlinkTable, path: path.to_owned(), message }
    }

    fn panic(path: &str, message: String) -> Self {
        Self { kind: ErrorKind::Panic, path: path.to_owned(), message: format!("PANIC: {message}") }
    }
}

impl fmt::Display for WalkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} at {}: {}", self.kind, self.path, self.message)
    }
}

/// What the visitor wants done with the current hierarchy.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WalkControl {
    Continue,
    /// Prune everything below the current object and move to its siblings.
    SkipHierarchy,
}

/// Panic-containment policy. A visitor returning an error always aborts in
/// either mode; the mode decides what a *panicking* visitor does. Panics in
/// the walker's own decode path abort regardless.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WalkMode {
    FailFast,
    BestEffort,
}

/// One visited object.
#[derive(Debug)]
pub struct WalkItem<'a> {
    pub path: &'a str,
    pub key: ObjectKey,
    pub size: u64,
    pub object_type: ObjectType,
    /// The failure being reported, if the object could not be read.
    pub error: Option<&'a WalkerError>,
}

pub type WalkResult<T> = std::result::Result<T, WalkerError>;

pub type WalkFunc<'a> = dyn FnMut(&WalkItem<'_>) -> WalkResult<WalkControl> + 'a;

/// True for keys that have no block behind them: embedded keys and the
/// startup constants. Such keys are neither fetched nor visited.
pub fn skip_key(key: &ObjectKey) -> bool {
    is_constant_or_embedded(key)
}

/// Walks the workspace rooted at `root_key`, invoking `visitor` for every
/// reachable object.
pub async fn walk(
    datastore: &dyn Datastore,
    root_key: &ObjectKey,
    mode: WalkMode,
    visitor: &mut WalkFunc<'_>,
) -> WalkResult<()> {
    let mut walker = Walker {
        datastore,
        mode,
        visitor,
        hardlinks: HashMap::new(),
        hardlink_error: None,
    };
    walker.run(root_key).await
}

fn join(path: &str, name: &str) -> String {
    if path.ends_with('/') {
        format!("{path}{name}")
    } else {
        format!("{path}/{name}")
    }
}

fn panic_text(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        (*text).to_owned()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "opaque panic payload".to_owned()
    }
}

/// Runs a decode, separating malformed input (delivered to the visitor)
/// from decoder panics (fatal to the walk in every mode).
fn guarded_decode<T>(
    path: &str,
    decode: impl FnOnce() -> codec::Result<T>,
) -> WalkResult<Result<T, WalkerError>> {
    match catch_unwind(AssertUnwindSafe(decode)) {
        Ok(Ok(value)) => Ok(Ok(value)),
        Ok(Err(err)) => Ok(Err(WalkerError::malformed(path, &err))),
        Err(panic) => Err(WalkerError::panic(path, panic_text(panic))),
    }
}

struct Walker<'a, 'b> {
    datastore: &'a dyn Datastore,
    mode: WalkMode,
    visitor: &'a mut WalkFunc<'b>,
    hardlinks: HashMap<u64, HardlinkRecord>,
    hardlink_error: Option<WalkerError>,
}

impl Walker<'_, '_> {
    async fn run(&mut self, root_key: &ObjectKey) -> WalkResult<()> {
        let bytes = match self.fetch(root_key, "/").await {
            Ok(bytes) => bytes,
            Err(err) => {
                self.visit("/", *root_key, 0, ObjectType::WorkspaceRoot, Some(&err))?;
                return Ok(());
            }
        };
        let root = match guarded_decode("/", || workspace_root::decode(&bytes))? {
            Ok(root) => root,
            Err(err) => {
                self.visit("/", *root_key, 0, ObjectType::WorkspaceRoot, Some(&err))?;
                return Ok(());
            }
        };
        let control =
            self.visit("/", *root_key, bytes.len() as u64, ObjectType::WorkspaceRoot, None)?;
        if control == WalkControl::SkipHierarchy {
            return Ok(());
        }

        self.build_hardlink_table(&root).await?;

        for (_, layer) in root.layers() {
            self.walk_directory(layer, "/".to_owned()).await?;
        }

        // Hardlinked content is walked exactly once, from the table, no
        // matter how many legs reference it. A poisoned table walks
        // nothing; the legs have already reported the failure.
        if self.hardlink_error.is_none() {
            let mut table: Vec<HardlinkRecord> = self.hardlinks.values().cloned().collect();
            table.sort_by_key(|entry| entry.file_id);
            for entry in table {
                let path = join("/", &entry.record.filename);
                self.walk_record(&path, entry.record).await?;
            }
        }
        Ok(())
    }

    /// Collects the hardlink table embedded in the root plus its chained
    /// blocks. A fetch or decode failure leaves the table poisoned: every
    /// hardlink leg will be reported with the failure instead of resolving.
    async fn build_hardlink_table(&mut self, root: &WorkspaceRoot) -> WalkResult<()> {
        let mut entry = root.hardlinks.clone();
        loop {
            for record in entry.records {
                self.hardlinks.insert(record.file_id, record);
            }
            if !entry_continues(&entry.next) {
                return Ok(());
            }
            let next_key = entry.next;
            let bytes = match self.fetch(&next_key, "/").await {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!(%next_key, "hardlink table unavailable: {err}");
                    self.hardlink_error =
                        Some(WalkerError::hardlink_table("/", err.to_string()));
                    return Ok(());
                }
            };
            entry = match guarded_decode("/", || hardlink::decode_entry(&bytes))? {
                Ok(next) => next,
                Err(err) => {
                    self.hardlink_error = Some(WalkerError::hardlink_table("/", err.to_string()));
                    return Ok(());
                }
            };
        }
    }

    fn visit(
        &mut self,
        path: &str,
        key: ObjectKey,
        size: u64,
        object_type: ObjectType,
        error: Option<&WalkerError>,
    ) -> WalkResult<WalkControl> {
        let item = WalkItem { path, key, size, object_type, error };
        match catch_unwind(AssertUnwindSafe(|| (self.visitor)(&item))) {
            Ok(result) => result,
            Err(panic) => {
                let err = WalkerError::panic(path, panic_text(panic));
                match self.mode {
                    WalkMode::FailFast => Err(err),
                    WalkMode::BestEffort => {
                        warn!("contained visitor panic: {err}");
                        Ok(WalkControl::SkipHierarchy)
                    }
                }
            }
        }
    }

    async fn fetch(&self, key: &ObjectKey, path: &str) -> Result<Vec<u8>, WalkerError> {
        let mut buffer = Buffer::new();
        match self.datastore.get(key, &mut buffer).await {
            Ok(()) => Ok(buffer.into_data()),
            Err(err) => Err(WalkerError::fetch(path, err)),
        }
    }

    /// Walks a directory and its chain blocks. Boxed because directories
    /// recurse through [`Walker::walk_record`].
    fn walk_directory<'s>(
        &'s mut self,
        key: ObjectKey,
        path: String,
    ) -> Pin<Box<dyn Future<Output = WalkResult<()>> + 's>> {
        Box::pin(async move {
            let mut current = key;
            loop {
                if skip_key(&current) {
                    return Ok(());
                }
                let bytes = match self.fetch(&current, &path).await {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        self.visit(&path, current, 0, ObjectType::Directory, Some(&err))?;
                        return Ok(());
                    }
                };
                let entry: DirectoryEntry =
                    match guarded_decode(&path, || directory::decode(&bytes))? {
                        Ok(entry) => entry,
                        Err(err) => {
                            self.visit(&path, current, 0, ObjectType::Directory, Some(&err))?;
                            return Ok(());
                        }
                    };
                let control = self.visit(
                    &path,
                    current,
                    bytes.len() as u64,
                    ObjectType::Directory,
                    None,
                )?;
                if control == WalkControl::SkipHierarchy {
                    return Ok(());
                }
                for record in entry.records {
                    let child = join(&path, &record.filename);
                    self.walk_record(&child, record).await?;
                }
                if !entry_continues(&entry.next) {
                    return Ok(());
                }
                current = entry.next;
            }
        })
    }

    async fn walk_record(&mut self, path: &str, record: DirectoryRecord) -> WalkResult<()> {
        match record.object_type {
            ObjectType::Directory => {
                self.walk_directory(record.id, path.to_owned()).await?;
            }
            ObjectType::SmallFile
            | ObjectType::Symlink
            | ObjectType::Special
            | ObjectType::WorkspaceRoot => {
                if !skip_key(&record.id) {
                    self.visit(path, record.id, record.size, record.object_type, None)?;
                }
            }
            ObjectType::MediumFile | ObjectType::LargeFile => {
                self.walk_multi_block(record.id, path, record.object_type).await?;
            }
            ObjectType::VeryLargeFile => {
                self.walk_very_large(record.id, path).await?;
            }
            ObjectType::Hardlink => {
                self.walk_hardlink_leg(path, &record)?;
            }
            ObjectType::ExtendedAttribute => {
                self.walk_attributes(record.id, path).await?;
            }
        }
        if !record.extended_attributes.is_zero() {
            self.walk_attributes(record.extended_attributes, path).await?;
        }
        Ok(())
    }

    fn walk_hardlink_leg(&mut self, path: &str, record: &DirectoryRecord) -> WalkResult<()> {
        if let Some(err) = self.hardlink_error.clone() {
            self.visit(path, record.id, 0, ObjectType::Hardlink, Some(&err))?;
            return Ok(());
        }
        let resolved = hardlink::leg_file_id(&record.id)
            .and_then(|file_id| self.hardlinks.get(&file_id).cloned());
        match resolved {
            Some(entry) => {
                self.visit(path, entry.record.id, entry.record.size, ObjectType::Hardlink, None)?;
            }
            None => {
                let err = WalkerError::hardlink_table(
                    path,
                    format!("no table entry for leg {}", record.id),
                );
                self.visit(path, record.id, 0, ObjectType::Hardlink, Some(&err))?;
            }
        }
        Ok(())
    }

    async fn walk_multi_block(
        &mut self,
        key: ObjectKey,
        path: &str,
        object_type: ObjectType,
    ) -> WalkResult<()> {
        if skip_key(&key) {
            return Ok(());
        }
        let bytes = match self.fetch(&key, path).await {
            Ok(bytes) => bytes,
            Err(err) => {
                self.visit(path, key, 0, object_type, Some(&err))?;
                return Ok(());
            }
        };
        let descriptor = match guarded_decode(path, || file::decode_multi_block(&bytes))? {
            Ok(descriptor) => descriptor,
            Err(err) => {
                self.visit(path, key, 0, object_type, Some(&err))?;
                return Ok(());
            }
        };
        let control = self.visit(path, key, bytes.len() as u64, object_type, None)?;
        if control == WalkControl::SkipHierarchy {
            return Ok(());
        }
        let last = descriptor.blocks.len().saturating_sub(1);
        for (index, block) in descriptor.blocks.iter().enumerate() {
            if skip_key(block) {
                continue;
            }
            let size = if index == last {
                descriptor.size_of_last_block as u64
            } else {
                descriptor.block_size as u64
            };
            self.visit(path, *block, size, object_type, None)?;
        }
        Ok(())
    }

    async fn walk_very_large(&mut self, key: ObjectKey, path: &str) -> WalkResult<()> {
        if skip_key(&key) {
            return Ok(());
        }
        let bytes = match self.fetch(&key, path).await {
            Ok(bytes) => bytes,
            Err(err) => {
                self.visit(path, key, 0, ObjectType::VeryLargeFile, Some(&err))?;
                return Ok(());
            }
        };
        let descriptor = match guarded_decode(path, || file::decode_very_large(&bytes))? {
            Ok(descriptor) => descriptor,
            Err(err) => {
                self.visit(path, key, 0, ObjectType::VeryLargeFile, Some(&err))?;
                return Ok(());
            }
        };
        let control =
            self.visit(path, key, bytes.len() as u64, ObjectType::VeryLargeFile, None)?;
        if control == WalkControl::SkipHierarchy {
            return Ok(());
        }
        for part in descriptor.parts {
            self.walk_multi_block(part, path, ObjectType::VeryLargeFile).await?;
        }
        Ok(())
    }

    async fn walk_attributes(&mut self, key: ObjectKey, path: &str) -> WalkResult<()> {
        if skip_key(&key) {
            return Ok(());
        }
        let bytes = match self.fetch(&key, path).await {
            Ok(bytes) => bytes,
            Err(err) => {
                self.visit(path, key, 0, ObjectType::ExtendedAttribute, Some(&err))?;
                return Ok(());
            }
        };
        let table = match guarded_decode(path, || xattr::decode(&bytes))? {
            Ok(table) => table,
            Err(err) => {
                self.visit(path, key, 0, ObjectType::ExtendedAttribute, Some(&err))?;
                return Ok(());
            }
        };
        let control =
            self.visit(path, key, bytes.len() as u64, ObjectType::ExtendedAttribute, None)?;
        if control == WalkControl::SkipHierarchy {
            return Ok(());
        }
        for (name, value_key) in table.attributes {
            if skip_key(&value_key) {
                continue;
            }
            let value_path = format!("{path}/xattr/{name}");
            self.visit(&value_path, value_key, 0, ObjectType::ExtendedAttribute, None)?;
        }
        Ok(())
    }
}

/// True when a chain `next` key points at a further block.
fn entry_continues(next: &ObjectKey) -> bool {
    !next.is_zero() && *next != crate::key::empty_dir_key()
}
