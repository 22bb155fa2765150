//! Extended attribute tables.

use std::io::Cursor;

use super::primitive::{read_key, read_string, read_u32, write_key, write_string, write_u32};
use super::{
    read_header, write_header, BlockKind, Error, Result, MAX_FILENAME_LENGTH,
    MAX_NUM_EXTENDED_ATTRIBUTES,
};
use crate::key::ObjectKey;

/// Named references to opaque attribute-value blocks.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExtendedAttributes {
    pub attributes: Vec<(String, ObjectKey)>,
}

impl ExtendedAttributes {
    pub fn get(&self, name: &str) -> Option<&ObjectKey> {
        self.attributes.iter().find(|(n, _)| n == name).map(|(_, key)| key)
    }
}

pub fn encode(table: &ExtendedAttributes) -> Result<Vec<u8>> {
    if table.attributes.len() > MAX_NUM_EXTENDED_ATTRIBUTES {
        return Err(Error::TooManyAttributes);
    }
    let mut out = Vec::new();
    write_header(&mut out, BlockKind::ExtendedAttributes)?;
    write_u32(&mut out, table.attributes.len() as u32)?;
    for (name, key) in &table.attributes {
        write_string(&mut out, name, MAX_FILENAME_LENGTH)?;
        write_key(&mut out, key)?;
    }
    Ok(out)
}

pub fn decode(bytes: &[u8]) -> Result<ExtendedAttributes> {
    let mut src = Cursor::new(bytes);
    read_header(&mut src, BlockKind::ExtendedAttributes)?;
    let count = read_u32(&mut src)? as usize;
    if count > MAX_NUM_EXTENDED_ATTRIBUTES {
        return Err(Error::TooManyAttributes);
    }
    let mut attributes = Vec::with_capacity(count);
    for _ in 0..count {
        let name = read_string(&mut src, MAX_FILENAME_LENGTH)?;
        attributes.push((name, read_key(&mut src)?));
    }
    Ok(ExtendedAttributes { attributes })
}
