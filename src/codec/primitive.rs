//! Primitive field codecs shared by the block kinds.
//!
//! All multibyte values are big-endian. Counted collections carry a `u32`
//! length prefix; strings are UTF-8 counted bytes.

use std::io::{Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use super::{Error, Result};
use crate::key::{ObjectKey, OBJECT_KEY_SIZE};

pub fn read_u8(src: &mut impl Read) -> Result<u8> {
    src.read_u8().map_err(Error::Io)
}

pub fn read_u32(src: &mut impl Read) -> Result<u32> {
    src.read_u32::<BigEndian>().map_err(Error::Io)
}

pub fn read_u64(src: &mut impl Read) -> Result<u64> {
    src.read_u64::<BigEndian>().map_err(Error::Io)
}

pub fn write_u8(dest: &mut impl Write, n: u8) -> Result<()> {
    dest.write_u8(n).map_err(Error::Io)
}

pub fn write_u32(dest: &mut impl Write, n: u32) -> Result<()> {
    dest.write_u32::<BigEndian>(n).map_err(Error::Io)
}

pub fn write_u64(dest: &mut impl Write, n: u64) -> Result<()> {
    dest.write_u64::<BigEndian>(n).map_err(Error::Io)
}

/// Reads a 21-byte object key, rejecting unknown type bytes.
pub fn read_key(src: &mut impl Read) -> Result<ObjectKey> {
    let mut buf = [0u8; OBJECT_KEY_SIZE];
    src.read_exact(&mut buf).map_err(Error::Io)?;
    ObjectKey::from_bytes(&buf).ok_or(Error::UnknownTag(buf[0]))
}

pub fn write_key(dest: &mut impl Write, key: &ObjectKey) -> Result<()> {
    dest.write_all(&key.to_bytes()).map_err(Error::Io)
}

/// Reads a counted UTF-8 string, failing when the count exceeds `max_len`.
pub fn read_string(src: &mut impl Read, max_len: usize) -> Result<String> {
    let len = read_u32(src)? as usize;
    if len > max_len {
        return Err(Error::NameTooLong);
    }
    let mut buf = vec![0u8; len];
    src.read_exact(&mut buf).map_err(Error::Io)?;
    String::from_utf8(buf).map_err(Error::BadString)
}

/// Writes a counted UTF-8 string, failing when it exceeds `max_len`.
pub fn write_string(dest: &mut impl Write, text: &str, max_len: usize) -> Result<()> {
    if text.len() > max_len {
        return Err(Error::NameTooLong);
    }
    write_u32(dest, text.len() as u32)?;
    dest.write_all(text.as_bytes()).map_err(Error::Io)
}
