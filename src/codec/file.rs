//! Multi-block and very-large file descriptors.

use std::io::Cursor;

use super::primitive::{read_key, read_u32, write_key, write_u32};
use super::{read_header, write_header, BlockKind, Result};
use crate::key::ObjectKey;

/// Descriptor of a medium or large file: fixed-size blocks plus a short
/// final block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiBlockFile {
    pub block_size: u32,
    pub size_of_last_block: u32,
    pub blocks: Vec<ObjectKey>,
}

impl MultiBlockFile {
    /// Total content length described by the descriptor.
    pub fn file_size(&self) -> u64 {
        match self.blocks.len() {
            0 => 0,
            n => (n as u64 - 1) * self.block_size as u64 + self.size_of_last_block as u64,
        }
    }
}

/// Descriptor of a very large file: a fan-out over MultiBlockFile parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VeryLargeFile {
    pub parts: Vec<ObjectKey>,
}

pub fn encode_multi_block(file: &MultiBlockFile) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    write_header(&mut out, BlockKind::MultiBlockFile)?;
    write_u32(&mut out, file.block_size)?;
    write_u32(&mut out, file.blocks.len() as u32)?;
    write_u32(&mut out, file.size_of_last_block)?;
    for key in &file.blocks {
        write_key(&mut out, key)?;
    }
    Ok(out)
}

pub fn decode_multi_block(bytes: &[u8]) -> Result<MultiBlockFile> {
    let mut src = Cursor::new(bytes);
    read_header(&mut src, BlockKind::MultiBlockFile)?;
    let block_size = read_u32(&mut src)?;
    let count = read_u32(&mut src)? as usize;
    let size_of_last_block = read_u32(&mut src)?;
    let mut blocks = Vec::with_capacity(count.min(4096));
    for _ in 0..count {
        blocks.push(read_key(&mut src)?);
    }
    Ok(MultiBlockFile { block_size, size_of_last_block, blocks })
}

pub fn encode_very_large(file: &VeryLargeFile) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    write_header(&mut out, BlockKind::VeryLargeFile)?;
    write_u32(&mut out, file.parts.len() as u32)?;
    for key in &file.parts {
        write_key(&mut out, key)?;
    }
    Ok(out)
}

pub fn decode_very_large(bytes: &[u8]) -> Result<VeryLargeFile> {
    let mut src = Cursor::new(bytes);
    read_header(&mut src, BlockKind::VeryLargeFile)?;
    let count = read_u32(&mut src)? as usize;
    let mut parts = Vec::with_capacity(count.min(4096));
    for _ in 0..count {
        parts.push(read_key(&mut src)?);
    }
    Ok(VeryLargeFile { parts })
}
