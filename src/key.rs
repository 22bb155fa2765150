//! Content-addressed object keys.
//!
//! Every block in the object store is addressed by a 21-byte key: one type
//! byte followed by a 20-byte content hash. Keys of type [`KeyType::Embedded`]
//! carry their payload directly in the hash bytes and have no backing block.

use std::fmt;
use std::sync::OnceLock;

use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;
use sha1::{Digest, Sha1};

/// Width of the content hash in bytes.
pub const HASH_SIZE: usize = 20;

/// Total serialized size of an [`ObjectKey`].
pub const OBJECT_KEY_SIZE: usize = HASH_SIZE + 1;

/// Storage class of the block a key refers to.
///
/// The discriminants are part of the persisted format and must not change.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum KeyType {
    /// Well-known blocks computed at startup (empty directory etc).
    Constant = 0,
    /// Blocks with no particular retention class.
    Other = 1,
    /// Filesystem metadata blocks (directories, file descriptors).
    Metadata = 2,
    /// Build artifacts.
    Buildable = 3,
    /// File content blocks.
    Data = 4,
    /// Version-control content.
    Vcs = 5,
    /// No block exists; the hash bytes are the payload itself.
    Embedded = 6,
}

/// A 21-byte content-addressed key: type byte plus 20-byte hash.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    key_type: KeyType,
    hash: [u8; HASH_SIZE],
}

impl ObjectKey {
    /// The "absent" sentinel: embedded type, all-zero payload.
    pub const ZERO: ObjectKey = ObjectKey { key_type: KeyType::Embedded, hash: [0; HASH_SIZE] };

    pub const fn new(key_type: KeyType, hash: [u8; HASH_SIZE]) -> Self {
        Self { key_type, hash }
    }

    /// Builds a key of `key_type` addressing `bytes` by content hash.
    pub fn from_contents(key_type: KeyType, bytes: &[u8]) -> Self {
        Self { key_type, hash: content_hash(bytes) }
    }

    pub fn key_type(&self) -> KeyType {
        self.key_type
    }

    pub fn hash(&self) -> &[u8; HASH_SIZE] {
        &self.hash
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    /// Serializes the key to its fixed 21-byte wire image.
    pub fn to_bytes(&self) -> [u8; OBJECT_KEY_SIZE] {
        let mut out = [0u8; OBJECT_KEY_SIZE];
        out[0] = self.key_type as u8;
        out[1..].copy_from_slice(&self.hash);
        out
    }

    /// Parses a key from its 21-byte wire image.
    ///
    /// Returns `None` when the slice has the wrong length or an unknown type
    /// byte.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != OBJECT_KEY_SIZE {
            return None;
        }
        let key_type = KeyType::from_u8(bytes[0])?;
        let mut hash = [0u8; HASH_SIZE];
        hash.copy_from_slice(&bytes[1..]);
        Some(Self { key_type, hash })
    }

    /// Parses a key from the lowercase hex form produced by [`fmt::Display`].
    pub fn from_hex(text: &str) -> Option<Self> {
        if text.len() != OBJECT_KEY_SIZE * 2 {
            return None;
        }
        let mut bytes = [0u8; OBJECT_KEY_SIZE];
        for (i, chunk) in text.as_bytes().chunks(2).enumerate() {
            let hi = (chunk[0] as char).to_digit(16)?;
            let lo = (chunk[1] as char).to_digit(16)?;
            bytes[i] = (hi * 16 + lo) as u8;
        }
        Self::from_bytes(&bytes)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.to_bytes() {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// Hashes `bytes` to the fixed 20-byte digest used for content addressing.
///
/// Stable across processes and dependent only on the input bytes.
pub fn content_hash(bytes: &[u8]) -> [u8; HASH_SIZE] {
    let mut hasher = Sha1::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

static EMPTY_BLOCK_KEY: OnceLock<ObjectKey> = OnceLock::new();
static EMPTY_DIR_KEY: OnceLock<ObjectKey> = OnceLock::new();
static EMPTY_WORKSPACE_KEY: OnceLock<ObjectKey> = OnceLock::new();

/// Key of the zero-length data block.
pub fn empty_block_key() -> ObjectKey {
    *EMPTY_BLOCK_KEY.get_or_init(|| ObjectKey::from_contents(KeyType::Constant, &[]))
}

/// Key of the encoded empty directory block.
pub fn empty_dir_key() -> ObjectKey {
    *EMPTY_DIR_KEY.get_or_init(|| {
        let entry = crate::codec::directory::DirectoryEntry::empty();
        let bytes = crate::codec::directory::encode(&entry)
            .expect("empty directory must always encode");
        ObjectKey::from_contents(KeyType::Constant, &bytes)
    })
}

/// Key of the workspace root whose layers are all the empty directory.
pub fn empty_workspace_key() -> ObjectKey {
    *EMPTY_WORKSPACE_KEY.get_or_init(|| {
        let root = crate::codec::workspace_root::WorkspaceRoot::empty();
        let bytes = crate::codec::workspace_root::encode(&root)
            .expect("empty workspace root must always encode");
        ObjectKey::from_contents(KeyType::Constant, &bytes)
    })
}

/// True for keys that have no corresponding block in the store: embedded
/// keys and the three startup constants.
pub fn is_constant_or_embedded(key: &ObjectKey) -> bool {
    key.key_type() == KeyType::Embedded
        || *key == empty_dir_key()
        || *key == empty_block_key()
        || *key == empty_workspace_key()
}
