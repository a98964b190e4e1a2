//! Application of change batches to a working tree.
//!
//! The applier hydrates the previous revision's snapshot into a mutable
//! in-memory tree, applies each change in order, and reports how many of
//! them actually modified content. Nothing is persisted here: the caller
//! decides whether to hash the result (preview), or to flush it to the
//! object store (commit).

use std::collections::{BTreeMap, HashMap};

use serde_json::Value;

use crate::{
    errors::{Result, StoreError},
    hash::{ObjectId, ObjectKind},
    model::{Change, ChangeContent},
    storage::{
        object,
        store::{ContentSource, ObjectStore, TreeSnapshot},
    },
    tree_diff::sanitize_text,
};

#[derive(Clone, Debug)]
enum FileNode {
    /// Unchanged since the base snapshot; content lives in the store.
    Stored(ObjectId),
    /// Modified in this batch; canonical content bytes held in memory.
    Dirty(Vec<u8>),
}

impl FileNode {
    fn blob_id(&self) -> ObjectId {
        match self {
            FileNode::Stored(id) => *id,
            FileNode::Dirty(bytes) => ObjectId::from_type_and_data(ObjectKind::Blob, bytes),
        }
    }
}

/// A mutable tree under change application.
pub struct WorkTree {
    files: BTreeMap<String, FileNode>,
}

impl WorkTree {
    pub fn from_snapshot(base: &TreeSnapshot) -> WorkTree {
        WorkTree {
            files: base
                .files
                .iter()
                .map(|(path, id)| (path.clone(), FileNode::Stored(*id)))
                .collect(),
        }
    }

    fn content(&self, store: &ObjectStore, path: &str) -> Result<Option<Vec<u8>>> {
        match self.files.get(path) {
            None => Ok(None),
            Some(FileNode::Dirty(bytes)) => Ok(Some(bytes.clone())),
            Some(FileNode::Stored(id)) => Ok(Some(store.read_blob(id)?)),
        }
    }

    /// Reject paths that would turn an existing file into a directory or
    /// nest under an existing file.
    fn check_path_free(&self, path: &str) -> Result<()> {
        let dir_prefix = format!("{path}/");
        if self
            .files
            .range(dir_prefix.clone()..)
            .next()
            .is_some_and(|(existing, _)| existing.starts_with(&dir_prefix))
        {
            return Err(StoreError::conflict(format!(
                "`{path}` conflicts with an existing directory"
            )));
        }
        let mut end = path.len();
        while let Some(cut) = path[..end].rfind('/') {
            if cut == 0 {
                break;
            }
            if self.files.contains_key(&path[..cut]) {
                return Err(StoreError::conflict(format!(
                    "`{path}` nests under the existing file `{}`",
                    &path[..cut]
                )));
            }
            end = cut;
        }
        Ok(())
    }

    fn insert(&mut self, path: &str, bytes: Vec<u8>) -> Result<()> {
        if !self.files.contains_key(path) {
            self.check_path_free(path)?;
        }
        self.files.insert(path.to_string(), FileNode::Dirty(bytes));
        Ok(())
    }

    /// Blob IDs of every file, computing dirty blob IDs in memory.
    pub fn file_ids(&self) -> BTreeMap<String, ObjectId> {
        self.files
            .iter()
            .map(|(path, node)| (path.clone(), node.blob_id()))
            .collect()
    }

    /// Root tree ID of the current state, computed without persisting.
    pub fn tree_id(&self) -> ObjectId {
        object::tree_id_of(&self.file_ids())
    }

    /// A snapshot view of the current state (nothing persisted).
    pub fn to_snapshot(&self) -> TreeSnapshot {
        let files = self.file_ids();
        TreeSnapshot {
            tree_id: object::tree_id_of(&files),
            files,
        }
    }

    /// Flush dirty blobs and all tree objects to the store, returning the
    /// root tree ID.
    pub fn persist(&self, store: &ObjectStore) -> Result<ObjectId> {
        for node in self.files.values() {
            if let FileNode::Dirty(bytes) = node {
                store.put_blob(bytes)?;
            }
        }
        object::write_trees(&self.file_ids(), |tree| store.put_tree(tree))
    }

    fn dirty_blobs(&self) -> HashMap<ObjectId, Vec<u8>> {
        self.files
            .values()
            .filter_map(|node| match node {
                FileNode::Dirty(bytes) => Some((node.blob_id(), bytes.clone())),
                FileNode::Stored(_) => None,
            })
            .collect()
    }
}

/// Content reader over the store plus a work tree's unflushed blobs, used
/// by preview diffs.
pub struct OverlaySource<'a> {
    store: &'a ObjectStore,
    dirty: HashMap<ObjectId, Vec<u8>>,
}

impl<'a> OverlaySource<'a> {
    pub fn new(store: &'a ObjectStore, worktree: &WorkTree) -> OverlaySource<'a> {
        OverlaySource {
            store,
            dirty: worktree.dirty_blobs(),
        }
    }
}

impl ContentSource for OverlaySource<'_> {
    fn read_content(&self, id: &ObjectId) -> Result<Vec<u8>> {
        match self.dirty.get(id) {
            Some(bytes) => Ok(bytes.clone()),
            None => self.store.read_blob(id),
        }
    }
}

fn parse_json(path: &str, bytes: &[u8]) -> Result<Value> {
    serde_json::from_slice(bytes)
        .map_err(|e| StoreError::conflict(format!("`{path}` does not hold valid JSON: {e}")))
}

/// Canonical byte form of a JSON value: compact, sorted keys. Equal values
/// always produce identical blob bytes regardless of input formatting.
fn canonical_json(value: &Value) -> Vec<u8> {
    serde_json::to_vec(value).expect("JSON value serialization")
}

fn content_str(path: &str, bytes: &[u8]) -> Result<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|_| StoreError::conflict(format!("`{path}` does not hold UTF-8 text")))
}

/// Apply `changes` on top of `base`, in order. Returns the resulting work
/// tree and the number of changes that had any effect.
pub fn apply_changes(
    store: &ObjectStore,
    base: &TreeSnapshot,
    changes: &[Change],
) -> Result<(WorkTree, usize)> {
    let mut worktree = WorkTree::from_snapshot(base);
    let mut num_edits = 0usize;
    for change in changes {
        change.validate()?;
        if apply_one(store, &mut worktree, change)? {
            num_edits += 1;
        }
    }
    Ok((worktree, num_edits))
}

fn apply_one(store: &ObjectStore, worktree: &mut WorkTree, change: &Change) -> Result<bool> {
    let path = change.path.as_str();
    match &change.content {
        ChangeContent::UpsertJson(value) => {
            if !path.ends_with(".json") {
                return Err(StoreError::conflict(format!(
                    "JSON upsert requires a .json path: {path}"
                )));
            }
            upsert(store, worktree, path, canonical_json(value))
        }
        ChangeContent::UpsertText(text) => {
            let bytes = if path.ends_with(".json") {
                // Text upserts to a JSON path store the canonical JSON form.
                canonical_json(&parse_json(path, text.as_bytes())?)
            } else {
                sanitize_text(text).into_bytes()
            };
            upsert(store, worktree, path, bytes)
        }
        ChangeContent::ApplyJsonPatch(patch) => {
            if !path.ends_with(".json") {
                return Err(StoreError::conflict(format!(
                    "JSON patch requires a .json path: {path}"
                )));
            }
            let current = worktree.content(store, path)?.ok_or_else(|| {
                StoreError::conflict(format!("cannot patch missing entry: {path}"))
            })?;
            let patched = crate::jsonpatch::apply(&parse_json(path, &current)?, patch)?;
            upsert(store, worktree, path, canonical_json(&patched))
        }
        ChangeContent::ApplyTextPatch { old, new } => {
            if path.ends_with(".json") {
                return Err(StoreError::conflict(format!(
                    "text patch on a JSON path: {path}"
                )));
            }
            let current = worktree.content(store, path)?.ok_or_else(|| {
                StoreError::conflict(format!("cannot patch missing entry: {path}"))
            })?;
            let current = sanitize_text(&content_str(path, &current)?);
            if current != sanitize_text(old) {
                return Err(StoreError::conflict(format!(
                    "text patch base mismatch at {path}"
                )));
            }
            upsert(store, worktree, path, sanitize_text(new).into_bytes())
        }
        ChangeContent::Rename(to) => {
            if worktree.files.contains_key(to) {
                return Err(StoreError::conflict(format!(
                    "rename target already exists: {to}"
                )));
            }
            let node = worktree.files.remove(path).ok_or_else(|| {
                StoreError::conflict(format!("cannot rename missing entry: {path}"))
            })?;
            if to.ends_with(".json") && !path.ends_with(".json") {
                let content = match &node {
                    FileNode::Dirty(bytes) => bytes.clone(),
                    FileNode::Stored(id) => store.read_blob(id)?,
                };
                if serde_json::from_slice::<Value>(&content).is_err() {
                    worktree.files.insert(path.to_string(), node);
                    return Err(StoreError::conflict(format!(
                        "cannot rename non-JSON content to {to}"
                    )));
                }
            }
            if let Err(e) = worktree.check_path_free(to) {
                worktree.files.insert(path.to_string(), node);
                return Err(e);
            }
            worktree.files.insert(to.clone(), node);
            Ok(true)
        }
        ChangeContent::Remove => {
            if worktree.files.remove(path).is_none() {
                return Err(StoreError::conflict(format!(
                    "cannot remove missing entry: {path}"
                )));
            }
            Ok(true)
        }
        ChangeContent::RemoveIfExists => Ok(worktree.files.remove(path).is_some()),
    }
}

fn upsert(
    store: &ObjectStore,
    worktree: &mut WorkTree,
    path: &str,
    bytes: Vec<u8>,
) -> Result<bool> {
    if worktree.content(store, path)?.as_deref() == Some(bytes.as_slice()) {
        return Ok(false);
    }
    worktree.insert(path, bytes)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tempfile::tempdir;

    use super::*;
    use crate::model::Change;

    fn store() -> (tempfile::TempDir, ObjectStore) {
        let dir = tempdir().unwrap();
        let store = ObjectStore::create(dir.path()).unwrap();
        (dir, store)
    }

    fn committed(store: &ObjectStore, changes: &[Change]) -> TreeSnapshot {
        let (worktree, _) = apply_changes(store, &TreeSnapshot::empty(), changes).unwrap();
        let root = worktree.persist(store).unwrap();
        store.snapshot(root).unwrap()
    }

    #[test]
    fn test_upsert_json_canonicalizes() {
        let (_dir, store) = store();
        let a = committed(
            &store,
            &[Change::upsert_json("/a.json", json!({"b": 1, "a": 2}))],
        );
        let b = committed(
            &store,
            &[Change::upsert_json("/a.json", json!({"a": 2, "b": 1}))],
        );
        assert_eq!(a.tree_id, b.tree_id);
    }

    #[test]
    fn test_equal_upsert_counts_no_edit() {
        let (_dir, store) = store();
        let base = committed(&store, &[Change::upsert_json("/a.json", json!({"k": "v"}))]);
        let (worktree, edits) = apply_changes(
            &store,
            &base,
            &[Change::upsert_json("/a.json", json!({"k": "v"}))],
        )
        .unwrap();
        assert_eq!(edits, 0);
        assert_eq!(worktree.tree_id(), base.tree_id);
    }

    #[test]
    fn test_text_is_sanitized() {
        let (_dir, store) = store();
        let base = committed(&store, &[Change::upsert_text("/a.txt", "one\r\ntwo")]);
        let id = base.files.get("/a.txt").unwrap();
        assert_eq!(store.read_blob(id).unwrap(), b"one\ntwo\n");
    }

    #[test]
    fn test_json_patch_applies_and_conflicts() {
        let (_dir, store) = store();
        let base = committed(&store, &[Change::upsert_json("/a.json", json!({"k": "v"}))]);

        let patch = json!([{"op": "replace", "path": "/k", "value": "w"}]);
        let (worktree, edits) =
            apply_changes(&store, &base, &[Change::apply_json_patch("/a.json", patch)]).unwrap();
        assert_eq!(edits, 1);
        let snapshot = worktree.to_snapshot();
        assert_ne!(snapshot.tree_id, base.tree_id);

        let bad = json!([{"op": "test", "path": "/k", "value": "zzz"}]);
        assert!(matches!(
            apply_changes(&store, &base, &[Change::apply_json_patch("/a.json", bad)]),
            Err(StoreError::ChangeConflict(_))
        ));

        let missing = json!([{"op": "add", "path": "/x", "value": 1}]);
        assert!(matches!(
            apply_changes(&store, &base, &[Change::apply_json_patch("/nope.json", missing)]),
            Err(StoreError::ChangeConflict(_))
        ));
    }

    #[test]
    fn test_noop_patch_counts_no_edit() {
        let (_dir, store) = store();
        let base = committed(&store, &[Change::upsert_json("/a.json", json!({"k": "v"}))]);
        let patch = json!([{"op": "test", "path": "/k", "value": "v"}]);
        let (_, edits) =
            apply_changes(&store, &base, &[Change::apply_json_patch("/a.json", patch)]).unwrap();
        assert_eq!(edits, 0);
    }

    #[test]
    fn test_text_patch_base_mismatch() {
        let (_dir, store) = store();
        let base = committed(&store, &[Change::upsert_text("/a.txt", "hello\n")]);

        let good = Change::apply_text_patch("/a.txt", "hello\n", "world\n");
        let (worktree, edits) = apply_changes(&store, &base, &[good]).unwrap();
        assert_eq!(edits, 1);
        assert_eq!(
            worktree.content(&store, "/a.txt").unwrap().unwrap(),
            b"world\n"
        );

        let stale = Change::apply_text_patch("/a.txt", "other\n", "world\n");
        assert!(matches!(
            apply_changes(&store, &base, &[stale]),
            Err(StoreError::ChangeConflict(_))
        ));
    }

    #[test]
    fn test_rename() {
        let (_dir, store) = store();
        let base = committed(&store, &[Change::upsert_text("/a.txt", "x\n")]);

        let (worktree, edits) =
            apply_changes(&store, &base, &[Change::rename("/a.txt", "/b.txt")]).unwrap();
        assert_eq!(edits, 1);
        let snapshot = worktree.to_snapshot();
        assert!(snapshot.files.contains_key("/b.txt"));
        assert!(!snapshot.files.contains_key("/a.txt"));

        assert!(matches!(
            apply_changes(&store, &base, &[Change::rename("/missing.txt", "/b.txt")]),
            Err(StoreError::ChangeConflict(_))
        ));
        let two = committed(
            &store,
            &[
                Change::upsert_text("/a.txt", "x\n"),
                Change::upsert_text("/b.txt", "y\n"),
            ],
        );
        assert!(matches!(
            apply_changes(&store, &two, &[Change::rename("/a.txt", "/b.txt")]),
            Err(StoreError::ChangeConflict(_))
        ));
    }

    #[test]
    fn test_remove_variants() {
        let (_dir, store) = store();
        let base = committed(&store, &[Change::upsert_text("/a.txt", "x\n")]);

        let (_, edits) = apply_changes(&store, &base, &[Change::remove("/a.txt")]).unwrap();
        assert_eq!(edits, 1);

        assert!(matches!(
            apply_changes(&store, &base, &[Change::remove("/missing.txt")]),
            Err(StoreError::ChangeConflict(_))
        ));

        let (_, edits) =
            apply_changes(&store, &base, &[Change::remove_if_exists("/missing.txt")]).unwrap();
        assert_eq!(edits, 0);
    }

    #[test]
    fn test_file_directory_conflicts() {
        let (_dir, store) = store();
        let base = committed(&store, &[Change::upsert_text("/a/b.txt", "x\n")]);

        // `/a` is a directory; it cannot become a file.
        assert!(matches!(
            apply_changes(&store, &base, &[Change::upsert_text("/a", "x\n")]),
            Err(StoreError::ChangeConflict(_))
        ));
        // `/a/b.txt` is a file; nothing can nest under it.
        assert!(matches!(
            apply_changes(&store, &base, &[Change::upsert_text("/a/b.txt/c.txt", "x\n")]),
            Err(StoreError::ChangeConflict(_))
        ));
    }

    #[test]
    fn test_changes_apply_in_order() {
        let (_dir, store) = store();
        let (worktree, edits) = apply_changes(
            &store,
            &TreeSnapshot::empty(),
            &[
                Change::upsert_text("/a.txt", "one\n"),
                Change::rename("/a.txt", "/b.txt"),
                Change::upsert_text("/a.txt", "two\n"),
            ],
        )
        .unwrap();
        assert_eq!(edits, 3);
        assert_eq!(
            worktree.content(&store, "/b.txt").unwrap().unwrap(),
            b"one\n"
        );
        assert_eq!(
            worktree.content(&store, "/a.txt").unwrap().unwrap(),
            b"two\n"
        );
    }
}
