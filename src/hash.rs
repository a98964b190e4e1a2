//! Content-addressed object IDs.
//!
//! Every stored object (blob, tree, commit) is identified by the SHA-1 of
//! `"<kind> <len>\0<payload>"`. IDs are opaque to the public API; the
//! repository layer always speaks in revisions and translates through the
//! commit index.

use std::{fmt::Display, str::FromStr};

use sha1::{Digest, Sha1};

use crate::errors::StoreError;

/// Kind of a stored object. The kind participates in the ID computation so
/// that a blob and a tree with identical payload bytes never collide.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Blob,
    Tree,
    Commit,
}

impl ObjectKind {
    /// Lowercase name used in the on-disk object header.
    pub const fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Blob => "blob",
            ObjectKind::Tree => "tree",
            ObjectKind::Commit => "commit",
        }
    }
}

impl Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObjectKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "blob" => Ok(ObjectKind::Blob),
            "tree" => Ok(ObjectKind::Tree),
            "commit" => Ok(ObjectKind::Commit),
            _ => Err(StoreError::Storage(format!("invalid object kind `{s}`"))),
        }
    }
}

/// Concrete object ID value. 20 raw SHA-1 bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId([u8; 20]);

impl ObjectId {
    /// Byte length of an ID.
    pub const SIZE: usize = 20;

    /// Hex string length of an ID.
    pub const HEX_LEN: usize = 40;

    /// Compute the ID of an object from its kind and payload.
    pub fn from_type_and_data(kind: ObjectKind, data: &[u8]) -> ObjectId {
        let mut hasher = Sha1::new();
        hasher.update(kind.as_str().as_bytes());
        hasher.update(b" ");
        hasher.update(data.len().to_string().as_bytes());
        hasher.update([0x00]);
        hasher.update(data);
        let digest = hasher.finalize();
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(digest.as_ref());
        ObjectId(bytes)
    }

    /// Build an ID from raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<ObjectId, StoreError> {
        if bytes.len() != Self::SIZE {
            return Err(StoreError::Storage(format!(
                "invalid object id length: {}",
                bytes.len()
            )));
        }
        let mut h = [0u8; 20];
        h.copy_from_slice(bytes);
        Ok(ObjectId(h))
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Lowercase hex rendering, as stored in refs.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl AsRef<[u8]> for ObjectId {
    fn as_ref(&self) -> &[u8] {
        self.0.as_slice()
    }
}

/// Parse 40 hex characters into an `ObjectId`.
impl FromStr for ObjectId {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != Self::HEX_LEN {
            return Err(StoreError::Storage(format!(
                "invalid object id `{s}`: expected {} hex chars",
                Self::HEX_LEN
            )));
        }
        let bytes = hex::decode(s)
            .map_err(|e| StoreError::Storage(format!("invalid object id `{s}`: {e}")))?;
        ObjectId::from_bytes(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_is_deterministic() {
        let a = ObjectId::from_type_and_data(ObjectKind::Blob, b"hello");
        let b = ObjectId::from_type_and_data(ObjectKind::Blob, b"hello");
        assert_eq!(a, b);
    }

    #[test]
    fn test_kind_participates_in_id() {
        let blob = ObjectId::from_type_and_data(ObjectKind::Blob, b"payload");
        let tree = ObjectId::from_type_and_data(ObjectKind::Tree, b"payload");
        assert_ne!(blob, tree);
    }

    /// Known git blob hash: `echo -n "hello" | git hash-object --stdin`.
    #[test]
    fn test_blob_id_matches_git() {
        let id = ObjectId::from_type_and_data(ObjectKind::Blob, b"hello");
        assert_eq!(id.to_hex(), "b6fc4c620b67d95f953a5c1c1230aaab5db5a1b0");
    }

    #[test]
    fn test_hex_round_trip() {
        let id = ObjectId::from_type_and_data(ObjectKind::Commit, b"x");
        let parsed: ObjectId = id.to_hex().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_rejects_bad_hex() {
        assert!("zz".parse::<ObjectId>().is_err());
        assert!(
            "zzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzz"
                .parse::<ObjectId>()
                .is_err()
        );
    }
}
