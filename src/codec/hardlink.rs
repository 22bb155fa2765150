//! The workspace-wide hardlink table.
//!
//! Hardlinked content is stored once, in a table of records keyed by a u64
//! file id. Directory records of type Hardlink carry the file id embedded in
//! their `id` key rather than a content address.

use std::io::{Cursor, Read, Write};

use byteorder::{BigEndian, ByteOrder};

use super::primitive::{read_key, read_u32, read_u64, write_key, write_u32, write_u64};
use super::record::{read_record, write_record, DirectoryRecord};
use super::{read_header, write_header, BlockKind, Error, Result, MAX_DIRECTORY_RECORDS};
use crate::key::{KeyType, ObjectKey, HASH_SIZE};

/// One entry of the hardlink table.
///
/// `nlinks` counts the legs actually present in the workspace, which may be
/// fewer than the link count on the filesystem the content came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardlinkRecord {
    pub file_id: u64,
    pub record: DirectoryRecord,
    pub nlinks: u32,
}

/// One block of the hardlink table, chained like a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardlinkEntry {
    pub records: Vec<HardlinkRecord>,
    pub next: ObjectKey,
}

impl HardlinkEntry {
    pub fn empty() -> Self {
        Self { records: Vec::new(), next: ObjectKey::ZERO }
    }

    pub fn has_next(&self) -> bool {
        !self.next.is_zero() && self.next != crate::key::empty_dir_key()
    }
}

/// Builds the embedded key a Hardlink-typed directory record carries.
pub fn leg_key(file_id: u64) -> ObjectKey {
    let mut hash = [0u8; HASH_SIZE];
    BigEndian::write_u64(&mut hash[..8], file_id);
    ObjectKey::new(KeyType::Embedded, hash)
}

/// Extracts the file id from a hardlink leg's key.
///
/// Returns `None` for keys that are not embedded.
pub fn leg_file_id(key: &ObjectKey) -> Option<u64> {
    if key.key_type() != KeyType::Embedded {
        return None;
    }
    Some(BigEndian::read_u64(&key.hash()[..8]))
}

fn write_hardlink_record(dest: &mut impl Write, record: &HardlinkRecord) -> Result<()> {
    write_u64(dest, record.file_id)?;
    write_u32(dest, record.nlinks)?;
    write_record(dest, &record.record)
}

fn read_hardlink_record(src: &mut impl Read) -> Result<HardlinkRecord> {
    let file_id = read_u64(src)?;
    let nlinks = read_u32(src)?;
    Ok(HardlinkRecord { file_id, nlinks, record: read_record(src)? })
}

pub(super) fn write_entry_body(dest: &mut impl Write, entry: &HardlinkEntry) -> Result<()> {
    if entry.records.len() > MAX_DIRECTORY_RECORDS {
        return Err(Error::TooManyRecords);
    }
    write_u32(dest, entry.records.len() as u32)?;
    for record in &entry.records {
        write_hardlink_record(dest, record)?;
    }
    write_key(dest, &entry.next)
}

pub(super) fn read_entry_body(src: &mut impl Read) -> Result<HardlinkEntry> {
    let count = read_u32(src)? as usize;
    if count > MAX_DIRECTORY_RECORDS {
        return Err(Error::TooManyRecords);
    }
    let mut records = Vec::with_capacity(count);
    for _ in 0..count {
        records.push(read_hardlink_record(src)?);
    }
    Ok(HardlinkEntry { records, next: read_key(src)? })
}

pub fn encode_entry(entry: &HardlinkEntry) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    write_header(&mut out, BlockKind::HardlinkEntry)?;
    write_entry_body(&mut out, entry)?;
    Ok(out)
}

pub fn decode_entry(bytes: &[u8]) -> Result<HardlinkEntry> {
    let mut src = Cursor::new(bytes);
    read_header(&mut src, BlockKind::HardlinkEntry)?;
    read_entry_body(&mut src)
}

pub fn encode_record(record: &HardlinkRecord) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    write_header(&mut out, BlockKind::HardlinkRecord)?;
    write_hardlink_record(&mut out, record)?;
    Ok(out)
}

pub fn decode_record(bytes: &[u8]) -> Result<HardlinkRecord> {
    let mut src = Cursor::new(bytes);
    read_header(&mut src, BlockKind::HardlinkRecord)?;
    read_hardlink_record(&mut src)
}
