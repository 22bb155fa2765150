//! Record-level three-way merge of workspace trees.
//!
//! Each directory is merged name by name against the common base: a side
//! that did not change a record adopts the other side's change, including
//! deletion. When both sides changed the same name, two directories recurse;
//! anything else is a conflict resolved by the caller's preference. Files
//! are taken wholesale from the winning side, never merged internally.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use tracing::debug;

use crate::codec::hardlink::HardlinkRecord;
use crate::codec::record::{DirectoryRecord, ObjectType};
use crate::datastore::Datastore;
use crate::key::{empty_dir_key, ObjectKey};
use crate::tree::{
    self, build_hardlink_entry, read_directory, read_hardlink_table, read_root, write_directory,
    write_root,
};

/// Conflict resolution when both sides changed the same record.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MergePreference {
    /// Take the side with the larger modification time; ties go local.
    Newer,
    Local,
    Remote,
}

impl MergePreference {
    /// Parses the wire spelling used by the merge command.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "Newer" | "" => Some(MergePreference::Newer),
            "Local" => Some(MergePreference::Local),
            "Remote" => Some(MergePreference::Remote),
            _ => None,
        }
    }
}

pub type Result<T> = tree::Result<T>;

/// Merges `remote` and `local` workspace roots against `base`, returning the
/// key of the merged root.
pub async fn merge_workspace_roots(
    store: &dyn Datastore,
    base_key: &ObjectKey,
    remote_key: &ObjectKey,
    local_key: &ObjectKey,
    prefer: MergePreference,
) -> Result<ObjectKey> {
    let base = read_root(store, base_key).await?;
    let remote = read_root(store, remote_key).await?;
    let local = read_root(store, local_key).await?;

    let mut merged = local.clone();
    merged.base_layer =
        merge_directories(store, base.base_layer, remote.base_layer, local.base_layer, prefer)
            .await?;
    merged.vcs_layer =
        merge_directories(store, base.vcs_layer, remote.vcs_layer, local.vcs_layer, prefer)
            .await?;
    merged.build_layer =
        merge_directories(store, base.build_layer, remote.build_layer, local.build_layer, prefer)
            .await?;
    merged.user_layer =
        merge_directories(store, base.user_layer, remote.user_layer, local.user_layer, prefer)
            .await?;

    let base_links = read_hardlink_table(store, &base).await?;
    let remote_links = read_hardlink_table(store, &remote).await?;
    let local_links = read_hardlink_table(store, &local).await?;
    let links = merge_hardlink_tables(base_links, remote_links, local_links);
    merged.hardlinks = build_hardlink_entry(store, links).await?;

    write_root(store, &merged).await
}

fn to_map(records: Vec<DirectoryRecord>) -> HashMap<String, DirectoryRecord> {
    records.into_iter().map(|record| (record.filename.clone(), record)).collect()
}

fn both_directories(a: &DirectoryRecord, b: &DirectoryRecord) -> bool {
    a.object_type == ObjectType::Directory && b.object_type == ObjectType::Directory
}

/// Picks a conflict winner between two present records.
fn pick<'a>(
    local: &'a DirectoryRecord,
    remote: &'a DirectoryRecord,
    prefer: MergePreference,
) -> &'a DirectoryRecord {
    match prefer {
        MergePreference::Local => local,
        MergePreference::Remote => remote,
        MergePreference::Newer => {
            if remote.modification_time > local.modification_time {
                remote
            } else {
                local
            }
        }
    }
}

fn merge_directories<'a>(
    store: &'a dyn Datastore,
    base_key: ObjectKey,
    remote_key: ObjectKey,
    local_key: ObjectKey,
    prefer: MergePreference,
) -> Pin<Box<dyn Future<Output = Result<ObjectKey>> + Send + 'a>> {
    Box::pin(async move {
        if remote_key == local_key {
            return Ok(local_key);
        }
        let base = to_map(read_directory(store, &base_key).await?);
        let remote = to_map(read_directory(store, &remote_key).await?);
        let local = to_map(read_directory(store, &local_key).await?);

        let mut names: Vec<&String> = remote.keys().chain(local.keys()).collect();
        names.sort();
        names.dedup();

        let mut merged = Vec::new();
        for name in names {
            let b = base.get(name);
            let r = remote.get(name);
            let l = local.get(name);

            let winner = match (r, l) {
                (r, l) if r == l => l.cloned(),
                // Only one side diverged from the base; its change wins,
                // deletion included.
                (r, l) if l == b => r.cloned(),
                (r, l) if r == b => l.cloned(),
                (Some(r), Some(l)) if both_directories(r, l) => {
                    let base_child = match b {
                        Some(record) if record.object_type == ObjectType::Directory => record.id,
                        _ => empty_dir_key(),
                    };
                    let child =
                        merge_directories(store, base_child, r.id, l.id, prefer).await?;
                    let mut record = pick(l, r, prefer).clone();
                    record.id = child;
                    record.object_type = ObjectType::Directory;
                    Some(record)
                }
                (Some(r), Some(l)) => {
                    debug!(name, "merge conflict, resolving by preference");
                    Some(pick(l, r, prefer).clone())
                }
                // Deleted on one side, modified on the other: the surviving
                // copy wins.
                (Some(r), None) => Some(r.clone()),
                (None, Some(l)) => Some(l.clone()),
                (None, None) => None,
            };
            if let Some(record) = winner {
                merged.push(record);
            }
        }
        write_directory(store, merged).await
    })
}

/// Hardlink tables merge by file id; a both-changed entry keeps the local
/// side.
fn merge_hardlink_tables(
    base: Vec<HardlinkRecord>,
    remote: Vec<HardlinkRecord>,
    local: Vec<HardlinkRecord>,
) -> Vec<HardlinkRecord> {
    let base: HashMap<u64, HardlinkRecord> =
        base.into_iter().map(|record| (record.file_id, record)).collect();
    let remote_map: HashMap<u64, HardlinkRecord> =
        remote.into_iter().map(|record| (record.file_id, record)).collect();
    let local_map: HashMap<u64, HardlinkRecord> =
        local.into_iter().map(|record| (record.file_id, record)).collect();

    let mut ids: Vec<u64> = remote_map.keys().chain(local_map.keys()).copied().collect();
    ids.sort_unstable();
    ids.dedup();

    let mut merged = Vec::new();
    for id in ids {
        let b = base.get(&id);
        let r = remote_map.get(&id);
        let l = local_map.get(&id);
        let winner = match (r, l) {
            (r, l) if r == l => l.cloned(),
            (r, l) if l == b => r.cloned(),
            (r, l) if r == b => l.cloned(),
            (Some(_), Some(l)) => Some(l.clone()),
            (Some(r), None) => Some(r.clone()),
            (None, Some(l)) => Some(l.clone()),
            (None, None) => None,
        };
        if let Some(record) = winner {
            merged.push(record);
        }
    }
    merged
}
