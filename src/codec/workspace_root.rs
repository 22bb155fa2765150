//! Workspace root blocks.

use std::io::Cursor;

use super::hardlink::{self, HardlinkEntry};
use super::primitive::{read_key, write_key};
use super::{read_header, write_header, BlockKind, Result};
use crate::key::ObjectKey;

/// The immutable object a workspace name points at.
///
/// Each layer key references a directory entry block (possibly the empty
/// one). The head of the workspace-wide hardlink table is embedded here
/// rather than addressed, so every root fetch also yields the table's first
/// block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceRoot {
    pub base_layer: ObjectKey,
    pub vcs_layer: ObjectKey,
    pub build_layer: ObjectKey,
    pub user_layer: ObjectKey,
    pub hardlinks: HardlinkEntry,
}

impl WorkspaceRoot {
    /// The root with all layers empty and no hardlinks.
    pub fn empty() -> Self {
        let empty = crate::key::empty_dir_key();
        Self {
            base_layer: empty,
            vcs_layer: empty,
            build_layer: empty,
            user_layer: empty,
            hardlinks: HardlinkEntry::empty(),
        }
    }

    pub fn layers(&self) -> [(&'static str, ObjectKey); 4] {
        [
            ("base", self.base_layer),
            ("vcs", self.vcs_layer),
            ("build", self.build_layer),
            ("user", self.user_layer),
        ]
    }
}

pub fn encode(root: &WorkspaceRoot) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    write_header(&mut out, BlockKind::WorkspaceRoot)?;
    write_key(&mut out, &root.base_layer)?;
    write_key(&mut out, &root.vcs_layer)?;
    write_key(&mut out, &root.build_layer)?;
    write_key(&mut out, &root.user_layer)?;
    hardlink::write_entry_body(&mut out, &root.hardlinks)?;
    Ok(out)
}

pub fn decode(bytes: &[u8]) -> Result<WorkspaceRoot> {
    let mut src = Cursor::new(bytes);
    read_header(&mut src, BlockKind::WorkspaceRoot)?;
    Ok(WorkspaceRoot {
        base_layer: read_key(&mut src)?,
        vcs_layer: read_key(&mut src)?,
        build_layer: read_key(&mut src)?,
        user_layer: read_key(&mut src)?,
        hardlinks: hardlink::read_entry_body(&mut src)?,
    })
}
