//! On-disk content-addressed object store.
//!
//! Layout of one sub-repository directory:
//!
//! ```text
//! {root}/
//!   format.json                       stamped at creation, verified on open
//!   objects/{hex[0..2]}/{hex[2..]}    zlib-deflated `"<kind> <len>\0<payload>"`
//!   refs/heads/main                   hex id of the tip commit
//! ```
//!
//! Object writes are idempotent and atomic (temp file + rename). The head
//! ref is updated through a compare-and-swap guarded by a store-level mutex,
//! and the rename is the last step of every commit, so a crash at any point
//! leaves at worst orphan objects.

use std::{
    collections::BTreeMap,
    fs,
    io::{Read, Write},
    path::{Path, PathBuf},
    sync::Mutex,
};

use bstr::ByteSlice;
use flate2::{Compression, read::ZlibDecoder, write::ZlibEncoder};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::{
    errors::{Result, StoreError},
    hash::{ObjectId, ObjectKind},
    storage::object::{CommitObject, EntryMode, Tree},
};

const FORMAT_FILE: &str = "format.json";
const HEAD_REF: &str = "refs/heads/main";

/// Format stamp written at creation time. The version must match on open;
/// the flags record the normalization this store relies on for commit
/// determinism.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
struct FormatStamp {
    format_version: u32,
    file_mode: bool,
    symlinks: bool,
    rename_detection: bool,
    diff_algorithm: String,
    gpg_sign: bool,
}

impl Default for FormatStamp {
    fn default() -> Self {
        FormatStamp {
            format_version: 1,
            file_mode: false,
            symlinks: false,
            rename_detection: false,
            diff_algorithm: "histogram".to_string(),
            gpg_sign: false,
        }
    }
}

/// One sub-repository's object storage.
pub struct ObjectStore {
    root: PathBuf,
    ref_lock: Mutex<()>,
}

impl ObjectStore {
    /// Initialize a fresh store directory. Fails if a format stamp is
    /// already present.
    pub fn create(root: impl Into<PathBuf>) -> Result<ObjectStore> {
        let root = root.into();
        let stamp_path = root.join(FORMAT_FILE);
        if stamp_path.exists() {
            return Err(StoreError::Storage(format!(
                "object store already initialized: {}",
                root.display()
            )));
        }
        fs::create_dir_all(root.join("objects"))?;
        fs::create_dir_all(root.join("refs/heads"))?;
        let stamp = serde_json::to_vec_pretty(&FormatStamp::default())
            .map_err(|e| StoreError::Storage(format!("format stamp: {e}")))?;
        fs::write(&stamp_path, stamp)?;
        Ok(ObjectStore {
            root,
            ref_lock: Mutex::new(()),
        })
    }

    /// Open an existing store, verifying the format stamp.
    pub fn open(root: impl Into<PathBuf>) -> Result<ObjectStore> {
        let root = root.into();
        let raw = fs::read(root.join(FORMAT_FILE)).map_err(|e| {
            StoreError::Storage(format!("missing format stamp in {}: {e}", root.display()))
        })?;
        let stamp: FormatStamp = serde_json::from_slice(&raw)
            .map_err(|e| StoreError::Storage(format!("corrupt format stamp: {e}")))?;
        if stamp.format_version != 1 {
            return Err(StoreError::Storage(format!(
                "unsupported repository format version {}",
                stamp.format_version
            )));
        }
        Ok(ObjectStore {
            root,
            ref_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, id: &ObjectId) -> PathBuf {
        let hex = id.to_hex();
        self.root.join("objects").join(&hex[..2]).join(&hex[2..])
    }

    fn put_object(&self, kind: ObjectKind, payload: &[u8]) -> Result<ObjectId> {
        let id = ObjectId::from_type_and_data(kind, payload);
        let path = self.object_path(&id);
        if path.exists() {
            return Ok(id);
        }
        let parent = path.parent().expect("object path has a parent");
        fs::create_dir_all(parent)?;

        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(format!("{} {}", kind, payload.len()).as_bytes())?;
        encoder.write_all(&[0x00])?;
        encoder.write_all(payload)?;
        let compressed = encoder.finish()?;

        let tmp = NamedTempFile::new_in(parent)?;
        fs::write(tmp.path(), compressed)?;
        tmp.persist(&path)
            .map_err(|e| StoreError::Storage(format!("persist object {id}: {e}")))?;
        Ok(id)
    }

    fn read_object(&self, id: &ObjectId, expected: ObjectKind) -> Result<Vec<u8>> {
        let path = self.object_path(id);
        let compressed = fs::read(&path)
            .map_err(|_| StoreError::Storage(format!("object not found: {id}")))?;
        let mut decoder = ZlibDecoder::new(compressed.as_slice());
        let mut raw = Vec::new();
        decoder
            .read_to_end(&mut raw)
            .map_err(|e| StoreError::Storage(format!("inflate object {id}: {e}")))?;

        let nul = raw
            .find_byte(0x00)
            .ok_or_else(|| StoreError::Storage(format!("corrupt object header: {id}")))?;
        let header = std::str::from_utf8(&raw[..nul])
            .map_err(|_| StoreError::Storage(format!("corrupt object header: {id}")))?;
        let (kind_str, len_str) = header
            .split_once(' ')
            .ok_or_else(|| StoreError::Storage(format!("corrupt object header: {id}")))?;
        let kind: ObjectKind = kind_str.parse()?;
        if kind != expected {
            return Err(StoreError::Storage(format!(
                "object {id} is a {kind}, expected {expected}"
            )));
        }
        let len: usize = len_str
            .parse()
            .map_err(|_| StoreError::Storage(format!("corrupt object header: {id}")))?;
        let payload = raw[nul + 1..].to_vec();
        if payload.len() != len {
            return Err(StoreError::Storage(format!(
                "object {id} length mismatch: header {len}, payload {}",
                payload.len()
            )));
        }
        Ok(payload)
    }

    pub fn put_blob(&self, data: &[u8]) -> Result<ObjectId> {
        self.put_object(ObjectKind::Blob, data)
    }

    pub fn put_tree(&self, tree: &Tree) -> Result<ObjectId> {
        self.put_object(ObjectKind::Tree, &tree.to_data())
    }

    pub fn put_commit(&self, commit: &CommitObject) -> Result<ObjectId> {
        self.put_object(ObjectKind::Commit, &commit.to_data())
    }

    pub fn read_blob(&self, id: &ObjectId) -> Result<Vec<u8>> {
        self.read_object(id, ObjectKind::Blob)
    }

    pub fn read_tree(&self, id: &ObjectId) -> Result<Tree> {
        Tree::from_bytes(&self.read_object(id, ObjectKind::Tree)?)
    }

    pub fn read_commit(&self, id: &ObjectId) -> Result<CommitObject> {
        CommitObject::from_bytes(&self.read_object(id, ObjectKind::Commit)?)
    }

    pub fn has(&self, id: &ObjectId) -> bool {
        self.object_path(id).exists()
    }

    /// Read the head ref, or `None` when no commit exists yet.
    pub fn read_ref(&self) -> Result<Option<ObjectId>> {
        let path = self.root.join(HEAD_REF);
        match fs::read_to_string(&path) {
            Ok(text) => Ok(Some(text.trim().parse()?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Compare-and-swap the head ref. `expected_old` must match the current
    /// ref exactly (`None` for a ref that must not exist yet).
    pub fn update_ref(&self, expected_old: Option<ObjectId>, new: ObjectId) -> Result<()> {
        let _guard = self.ref_lock.lock().expect("ref lock poisoned");
        let current = self.read_ref()?;
        if current != expected_old {
            return Err(StoreError::Storage(format!(
                "ref moved: expected {:?}, found {:?}",
                expected_old.map(|id| id.to_hex()),
                current.map(|id| id.to_hex()),
            )));
        }
        let path = self.root.join(HEAD_REF);
        let parent = path.parent().expect("ref path has a parent");
        let tmp = NamedTempFile::new_in(parent)?;
        fs::write(tmp.path(), format!("{}\n", new.to_hex()))?;
        tmp.persist(&path)
            .map_err(|e| StoreError::Storage(format!("persist ref: {e}")))?;
        Ok(())
    }

    /// Flatten the tree at `tree_id` into a snapshot of absolute file paths.
    pub fn snapshot(&self, tree_id: ObjectId) -> Result<TreeSnapshot> {
        let mut files = BTreeMap::new();
        self.walk_tree(tree_id, "", &mut files)?;
        Ok(TreeSnapshot { tree_id, files })
    }

    fn walk_tree(
        &self,
        tree_id: ObjectId,
        prefix: &str,
        files: &mut BTreeMap<String, ObjectId>,
    ) -> Result<()> {
        let tree = self.read_tree(&tree_id)?;
        for entry in tree.entries() {
            let path = format!("{prefix}/{}", entry.name);
            match entry.mode {
                EntryMode::File => {
                    files.insert(path, entry.id);
                }
                EntryMode::Tree => self.walk_tree(entry.id, &path, files)?,
            }
        }
        Ok(())
    }
}

/// Read access to blob content, abstracted so diffs can run against either
/// the store alone or a store plus uncommitted in-memory blobs.
pub trait ContentSource {
    fn read_content(&self, id: &ObjectId) -> Result<Vec<u8>>;
}

impl ContentSource for ObjectStore {
    fn read_content(&self, id: &ObjectId) -> Result<Vec<u8>> {
        self.read_blob(id)
    }
}

/// The flattened view of one revision's tree: every file path mapped to its
/// blob ID, plus the root tree ID the snapshot came from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TreeSnapshot {
    pub tree_id: ObjectId,
    pub files: BTreeMap<String, ObjectId>,
}

impl TreeSnapshot {
    /// Snapshot of the empty tree.
    pub fn empty() -> TreeSnapshot {
        TreeSnapshot {
            tree_id: Tree::default().id(),
            files: BTreeMap::new(),
        }
    }

    /// All directory paths implied by the files, always including `/`.
    pub fn directories(&self) -> std::collections::BTreeSet<String> {
        let mut dirs = std::collections::BTreeSet::new();
        dirs.insert("/".to_string());
        for path in self.files.keys() {
            let mut end = path.len();
            while let Some(cut) = path[..end].rfind('/') {
                if cut == 0 {
                    break;
                }
                dirs.insert(path[..cut].to_string());
                end = cut;
            }
        }
        dirs
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn test_blob_round_trip() {
        let dir = tempdir().unwrap();
        let store = ObjectStore::create(dir.path()).unwrap();
        let id = store.put_blob(b"content").unwrap();
        assert!(store.has(&id));
        assert_eq!(store.read_blob(&id).unwrap(), b"content");
        // Idempotent.
        assert_eq!(store.put_blob(b"content").unwrap(), id);
    }

    #[test]
    fn test_kind_mismatch_is_storage_error() {
        let dir = tempdir().unwrap();
        let store = ObjectStore::create(dir.path()).unwrap();
        let id = store.put_blob(b"x").unwrap();
        assert!(matches!(
            store.read_tree(&id),
            Err(StoreError::Storage(_))
        ));
    }

    #[test]
    fn test_format_stamp_verified_on_open() {
        let dir = tempdir().unwrap();
        ObjectStore::create(dir.path()).unwrap();
        assert!(ObjectStore::open(dir.path()).is_ok());

        fs::write(
            dir.path().join(FORMAT_FILE),
            br#"{"formatVersion":2,"fileMode":false,"symlinks":false,"renameDetection":false,"diffAlgorithm":"histogram","gpgSign":false}"#,
        )
        .unwrap();
        assert!(matches!(
            ObjectStore::open(dir.path()),
            Err(StoreError::Storage(_))
        ));
    }

    #[test]
    fn test_double_create_fails() {
        let dir = tempdir().unwrap();
        ObjectStore::create(dir.path()).unwrap();
        assert!(ObjectStore::create(dir.path()).is_err());
    }

    #[test]
    fn test_ref_compare_and_swap() {
        let dir = tempdir().unwrap();
        let store = ObjectStore::create(dir.path()).unwrap();
        assert_eq!(store.read_ref().unwrap(), None);

        let a = store.put_blob(b"a").unwrap();
        let b = store.put_blob(b"b").unwrap();
        store.update_ref(None, a).unwrap();
        assert_eq!(store.read_ref().unwrap(), Some(a));

        // Stale expectation loses.
        assert!(store.update_ref(None, b).is_err());
        store.update_ref(Some(a), b).unwrap();
        assert_eq!(store.read_ref().unwrap(), Some(b));
    }

    #[test]
    fn test_snapshot_walks_nested_trees() {
        let dir = tempdir().unwrap();
        let store = ObjectStore::create(dir.path()).unwrap();
        let blob_a = store.put_blob(b"a").unwrap();
        let blob_b = store.put_blob(b"b").unwrap();
        let mut files = BTreeMap::new();
        files.insert("/a.json".to_string(), blob_a);
        files.insert("/conf/b.txt".to_string(), blob_b);
        let root = crate::storage::object::write_trees(&files, |tree| store.put_tree(tree))
            .unwrap();

        let snapshot = store.snapshot(root).unwrap();
        assert_eq!(snapshot.files, files);
        let dirs = snapshot.directories();
        assert!(dirs.contains("/"));
        assert!(dirs.contains("/conf"));
        assert_eq!(dirs.len(), 2);
    }

    #[test]
    fn test_empty_snapshot_directories() {
        let snapshot = TreeSnapshot::empty();
        assert_eq!(snapshot.directories().len(), 1);
        assert_eq!(
            snapshot.tree_id.to_hex(),
            "4b825dc642cb6eb9a060e54bf8d69288fbee4904"
        );
    }
}
