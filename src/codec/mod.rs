//! Binary codecs for the metadata block kinds.
//!
//! Every metadata block is a framed buffer: a two-byte magic, a format
//! version, a kind tag, then the body. A logical value has exactly one byte
//! image, so content addressing over encoded blocks is stable. Decoders read
//! the fields they know and ignore trailing bytes, which is how newer writers
//! stay readable by older decoders; anything else wrong with a block is a
//! malformed-block error, never a panic.

pub mod directory;
pub mod file;
pub mod hardlink;
pub mod primitive;
pub mod record;
pub mod workspace_root;
pub mod xattr;

use std::io::{self, Read, Write};

use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;

/// Largest block the datastore accepts, encoded metadata included.
pub const MAX_BLOCK_SIZE: usize = 1024 * 1024;

/// Directory records per DirectoryEntry block before chaining.
pub const MAX_DIRECTORY_RECORDS: usize = 1024;

/// Longest permitted filename, in bytes.
pub const MAX_FILENAME_LENGTH: usize = 255;

/// Extended attributes per attribute table.
pub const MAX_NUM_EXTENDED_ATTRIBUTES: usize = 32;

/// Leading magic of every framed metadata block.
pub const BLOCK_MAGIC: [u8; 2] = *b"QB";

/// Current framing version.
pub const FORMAT_VERSION: u8 = 1;

/// Kind tag carried in the frame header. Persisted; do not renumber.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum BlockKind {
    WorkspaceRoot = 1,
    DirectoryEntry = 2,
    DirectoryRecord = 3,
    MultiBlockFile = 4,
    VeryLargeFile = 5,
    HardlinkEntry = 6,
    HardlinkRecord = 7,
    ExtendedAttributes = 8,
}

/// Codec failures. Everything except [`Error::NameTooLong`],
/// [`Error::TooManyRecords`] and [`Error::TooManyAttributes`] (encode-side
/// bound violations) is the malformed-block class.
#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    BadMagic,
    BadVersion(u8),
    WrongKind { expected: BlockKind, found: u8 },
    UnknownTag(u8),
    BadString(std::string::FromUtf8Error),
    BadOwnerClass(u32),
    NameTooLong,
    TooManyRecords,
    TooManyAttributes,
}

impl Error {
    /// True when the error describes undecodable input rather than an
    /// encode-side bound violation.
    pub fn is_malformed(&self) -> bool {
        !matches!(self, Error::NameTooLong | Error::TooManyRecords | Error::TooManyAttributes)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

pub(crate) fn write_header(dest: &mut impl Write, kind: BlockKind) -> Result<()> {
    dest.write_all(&BLOCK_MAGIC).map_err(Error::Io)?;
    dest.write_all(&[FORMAT_VERSION, kind as u8]).map_err(Error::Io)
}

/// Consumes and validates a frame header, failing unless it names `kind`.
pub(crate) fn read_header(src: &mut impl Read, kind: BlockKind) -> Result<()> {
    let mut header = [0u8; 4];
    src.read_exact(&mut header).map_err(Error::Io)?;
    if header[..2] != BLOCK_MAGIC {
        return Err(Error::BadMagic);
    }
    if header[2] != FORMAT_VERSION {
        return Err(Error::BadVersion(header[2]));
    }
    match BlockKind::from_u8(header[3]) {
        Some(found) if found == kind => Ok(()),
        _ => Err(Error::WrongKind { expected: kind, found: header[3] }),
    }
}

/// Reads the kind tag of an encoded block without decoding the body.
pub fn peek_kind(bytes: &[u8]) -> Result<BlockKind> {
    if bytes.len() < 4 {
        return Err(Error::BadMagic);
    }
    if bytes[..2] != BLOCK_MAGIC {
        return Err(Error::BadMagic);
    }
    if bytes[2] != FORMAT_VERSION {
        return Err(Error::BadVersion(bytes[2]));
    }
    BlockKind::from_u8(bytes[3]).ok_or(Error::UnknownTag(bytes[3]))
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let mut buf = Vec::new();
        write_header(&mut buf, BlockKind::DirectoryEntry).unwrap();
        read_header(&mut Cursor::new(&buf), BlockKind::DirectoryEntry).unwrap();
    }

    #[test]
    fn test_header_kind_mismatch() {
        let mut buf = Vec::new();
        write_header(&mut buf, BlockKind::DirectoryEntry).unwrap();
        let err = read_header(&mut Cursor::new(&buf), BlockKind::MultiBlockFile).unwrap_err();
        assert!(matches!(err, Error::WrongKind { .. }));
        assert!(err.is_malformed());
    }

    #[test]
    fn test_header_bad_magic() {
        let buf = [b'X', b'Y', FORMAT_VERSION, BlockKind::VeryLargeFile as u8];
        let err = read_header(&mut Cursor::new(&buf), BlockKind::VeryLargeFile).unwrap_err();
        assert!(matches!(err, Error::BadMagic));
    }

    #[test]
    fn test_peek_kind() {
        let mut buf = Vec::new();
        write_header(&mut buf, BlockKind::HardlinkEntry).unwrap();
        assert_eq!(peek_kind(&buf).unwrap(), BlockKind::HardlinkEntry);
    }
}
