//! Directory records: the per-child metadata stored in directory blocks.

use std::io::{Cursor, Read, Write};

use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;

use super::primitive::{
    read_key, read_string, read_u32, read_u64, read_u8, write_key, write_string, write_u32,
    write_u64, write_u8,
};
use super::{read_header, write_header, BlockKind, Error, Result, MAX_FILENAME_LENGTH};
use crate::key::ObjectKey;

/// System ids at or above this value are coarsened to the accessor class.
pub const SYSTEM_ID_LIMIT: u32 = 1000;

/// How a record's `id` key is to be interpreted. Persisted; do not renumber.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum ObjectType {
    Directory = 1,
    /// Content fits a single data block; `id` addresses it directly.
    SmallFile = 2,
    /// `id` addresses a MultiBlockFile descriptor.
    MediumFile = 3,
    /// `id` addresses a MultiBlockFile descriptor with a larger block list.
    LargeFile = 4,
    /// `id` addresses a VeryLargeFile descriptor fanning out to parts.
    VeryLargeFile = 5,
    /// `id` addresses a block holding the link target path.
    Symlink = 6,
    /// Device nodes, sockets, fifos; `id` embeds the device numbers.
    Special = 7,
    /// `id` embeds a file id resolved through the workspace hardlink table.
    Hardlink = 8,
    ExtendedAttribute = 9,
    WorkspaceRoot = 10,
}

/// Owner or group of a record.
///
/// Ids below [`SYSTEM_ID_LIMIT`] are system accounts and kept verbatim so the
/// content address stays workload-independent; everything else is the
/// abstract accessor class, resolved to the reading user at access time.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum IdClass {
    System(u32),
    User,
}

impl IdClass {
    /// Coarsens a concrete filesystem id into its persisted class.
    pub fn from_raw(id: u32) -> Self {
        if id < SYSTEM_ID_LIMIT {
            IdClass::System(id)
        } else {
            IdClass::User
        }
    }

    /// Resolves the class back to a concrete id for `accessor`.
    pub fn resolve(&self, accessor: u32) -> u32 {
        match self {
            IdClass::System(id) => *id,
            IdClass::User => accessor,
        }
    }

    fn to_wire(self) -> u32 {
        match self {
            IdClass::System(id) => id,
            IdClass::User => SYSTEM_ID_LIMIT,
        }
    }

    fn from_wire(raw: u32) -> Result<Self> {
        if raw < SYSTEM_ID_LIMIT {
            Ok(IdClass::System(raw))
        } else if raw == SYSTEM_ID_LIMIT {
            Ok(IdClass::User)
        } else {
            Err(Error::BadOwnerClass(raw))
        }
    }
}

/// One child of a directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DirectoryRecord {
    pub filename: String,
    pub object_type: ObjectType,
    pub id: ObjectKey,
    pub size: u64,
    /// Content modification time, nanoseconds since the epoch.
    pub modification_time: u64,
    /// Metadata change time, nanoseconds since the epoch.
    pub content_time: u64,
    pub permissions: u32,
    pub owner: IdClass,
    pub group: IdClass,
    /// Attribute table key, [`ObjectKey::ZERO`] when the record has none.
    pub extended_attributes: ObjectKey,
}

impl DirectoryRecord {
    /// A minimally-populated record, useful as a starting point.
    pub fn new(filename: impl Into<String>, object_type: ObjectType, id: ObjectKey) -> Self {
        Self {
            filename: filename.into(),
            object_type,
            id,
            size: 0,
            modification_time: 0,
            content_time: 0,
            permissions: 0o644,
            owner: IdClass::User,
            group: IdClass::User,
            extended_attributes: ObjectKey::ZERO,
        }
    }
}

/// Writes a record without framing, for embedding in directory and hardlink
/// blocks.
pub(super) fn write_record(dest: &mut impl Write, record: &DirectoryRecord) -> Result<()> {
    write_string(dest, &record.filename, MAX_FILENAME_LENGTH)?;
    write_u8(dest, record.object_type as u8)?;
    write_key(dest, &record.id)?;
    write_u64(dest, record.size)?;
    write_u64(dest, record.modification_time)?;
    write_u64(dest, record.content_time)?;
    write_u32(dest, record.permissions)?;
    write_u32(dest, record.owner.to_wire())?;
    write_u32(dest, record.group.to_wire())?;
    write_key(dest, &record.extended_attributes)
}

pub(super) fn read_record(src: &mut impl Read) -> Result<DirectoryRecord> {
    let filename = read_string(src, MAX_FILENAME_LENGTH)?;
    let tag = read_u8(src)?;
    let object_type = ObjectType::from_u8(tag).ok_or(Error::UnknownTag(tag))?;
    Ok(DirectoryRecord {
        filename,
        object_type,
        id: read_key(src)?,
        size: read_u64(src)?,
        modification_time: read_u64(src)?,
        content_time: read_u64(src)?,
        permissions: read_u32(src)?,
        owner: IdClass::from_wire(read_u32(src)?)?,
        group: IdClass::from_wire(read_u32(src)?)?,
        extended_attributes: read_key(src)?,
    })
}

/// Encodes a standalone framed record block.
pub fn encode(record: &DirectoryRecord) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    write_header(&mut out, BlockKind::DirectoryRecord)?;
    write_record(&mut out, record)?;
    Ok(out)
}

/// Decodes a standalone framed record block.
pub fn decode(bytes: &[u8]) -> Result<DirectoryRecord> {
    let mut src = Cursor::new(bytes);
    read_header(&mut src, BlockKind::DirectoryRecord)?;
    read_record(&mut src)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::KeyType;

    fn sample_record(name: &str) -> DirectoryRecord {
        DirectoryRecord {
            filename: name.to_owned(),
            object_type: ObjectType::SmallFile,
            id: ObjectKey::from_contents(KeyType::Data, name.as_bytes()),
            size: 42,
            modification_time: 1_700_000_000_000_000_000,
            content_time: 1_700_000_000_000_000_001,
            permissions: 0o755,
            owner: IdClass::System(0),
            group: IdClass::User,
            extended_attributes: ObjectKey::ZERO,
        }
    }

    #[test]
    fn test_record_roundtrip() {
        let record = sample_record("main.o");
        let decoded = decode(&encode(&record).unwrap()).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let record = sample_record("libfoo.so");
        assert_eq!(encode(&record).unwrap(), encode(&record).unwrap());
    }

    #[test]
    fn test_filename_bound() {
        let mut record = sample_record("x");
        record.filename = "n".repeat(MAX_FILENAME_LENGTH + 1);
        assert!(matches!(encode(&record), Err(Error::NameTooLong)));
    }

    #[test]
    fn test_unknown_object_type_rejected() {
        let record = sample_record("a.txt");
        let mut bytes = encode(&record).unwrap();
        // The type tag sits right after the header and the counted filename.
        let tag_offset = 4 + 4 + record.filename.len();
        bytes[tag_offset] = 0xee;
        assert!(matches!(decode(&bytes), Err(Error::UnknownTag(0xee))));
    }

    #[test]
    fn test_id_class_coarsening() {
        assert_eq!(IdClass::from_raw(0), IdClass::System(0));
        assert_eq!(IdClass::from_raw(999), IdClass::System(999));
        assert_eq!(IdClass::from_raw(1000), IdClass::User);
        assert_eq!(IdClass::from_raw(52_000), IdClass::User);
        assert_eq!(IdClass::User.resolve(1234), 1234);
        assert_eq!(IdClass::System(33).resolve(1234), 33);
    }

    #[test]
    fn test_bad_owner_class() {
        let record = sample_record("b.txt");
        let mut bytes = encode(&record).unwrap();
        let owner_offset = bytes.len() - 21 - 4 - 4;
        bytes[owner_offset..owner_offset + 4].copy_from_slice(&5000u32.to_be_bytes());
        assert!(matches!(decode(&bytes), Err(Error::BadOwnerClass(5000))));
    }
}
