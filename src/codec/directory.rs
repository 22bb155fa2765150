//! Directory entry blocks and record chaining.

use std::io::{Cursor, Read, Write};

use super::primitive::{read_key, read_u32, write_key, write_u32};
use super::record::{read_record, write_record, DirectoryRecord};
use super::{read_header, write_header, BlockKind, Error, Result, MAX_DIRECTORY_RECORDS};
use crate::key::ObjectKey;

/// One block of a directory.
///
/// Directories with more than [`MAX_DIRECTORY_RECORDS`] children are stored
/// as a chain of blocks linked through `next`; the terminal block's `next`
/// is the empty-directory key. The empty directory itself terminates with
/// [`ObjectKey::ZERO`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub records: Vec<DirectoryRecord>,
    pub next: ObjectKey,
}

impl DirectoryEntry {
    pub fn empty() -> Self {
        Self { records: Vec::new(), next: ObjectKey::ZERO }
    }

    /// True when `next` continues the chain rather than terminating it.
    pub fn has_next(&self) -> bool {
        !self.next.is_zero() && self.next != crate::key::empty_dir_key()
    }
}

pub(super) fn write_entry_body(dest: &mut impl Write, entry: &DirectoryEntry) -> Result<()> {
    if entry.records.len() > MAX_DIRECTORY_RECORDS {
        return Err(Error::TooManyRecords);
    }
    write_u32(dest, entry.records.len() as u32)?;
    for record in &entry.records {
        write_record(dest, record)?;
    }
    write_key(dest, &entry.next)
}

pub(super) fn read_entry_body(src: &mut impl Read) -> Result<DirectoryEntry> {
    let count = read_u32(src)? as usize;
    if count > MAX_DIRECTORY_RECORDS {
        return Err(Error::TooManyRecords);
    }
    let mut records = Vec::with_capacity(count);
    for _ in 0..count {
        records.push(read_record(src)?);
    }
    Ok(DirectoryEntry { records, next: read_key(src)? })
}

pub fn encode(entry: &DirectoryEntry) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    write_header(&mut out, BlockKind::DirectoryEntry)?;
    write_entry_body(&mut out, entry)?;
    Ok(out)
}

pub fn decode(bytes: &[u8]) -> Result<DirectoryEntry> {
    let mut src = Cursor::new(bytes);
    read_header(&mut src, BlockKind::DirectoryEntry)?;
    read_entry_body(&mut src)
}

/// Splits records into per-block chunks ready for chaining.
///
/// Callers write the chunks in reverse, threading each block's key into the
/// previous chunk's `next`. An empty input yields no chunks; the caller uses
/// the empty-directory constant instead.
pub fn chain_chunks(records: Vec<DirectoryRecord>) -> Vec<Vec<DirectoryRecord>> {
    let mut chunks = Vec::new();
    let mut rest = records;
    while rest.len() > MAX_DIRECTORY_RECORDS {
        let tail = rest.split_off(MAX_DIRECTORY_RECORDS);
        chunks.push(rest);
        rest = tail;
    }
    if !rest.is_empty() {
        chunks.push(rest);
    }
    chunks
}
