//! The commit index: a dense, append-only map between revisions and commit
//! IDs for one sub-repository.
//!
//! The index is pure derived state. It is built by walking parent links
//! from the head ref and reading each commit's embedded revision, and it is
//! rebuilt from scratch whenever the recomputed head disagrees with what
//! the index believes, so a process restart or an externally moved ref can
//! never leave it permanently wrong.

use std::{
    collections::{BTreeMap, HashMap},
    sync::RwLock,
};

use tracing::warn;

use crate::{
    errors::{Result, StoreError},
    hash::ObjectId,
    model::commit::decode_message,
    storage::store::ObjectStore,
};

#[derive(Default)]
struct IndexState {
    by_revision: BTreeMap<i64, ObjectId>,
    by_id: HashMap<ObjectId, i64>,
    first: i64,
    head: i64,
}

/// Bidirectional `revision <-> commit id` map with first/head pointers.
pub struct CommitIndex {
    inner: RwLock<IndexState>,
}

impl CommitIndex {
    /// Build the index by walking commits from the head ref.
    pub fn build(store: &ObjectStore) -> Result<CommitIndex> {
        let index = CommitIndex {
            inner: RwLock::new(IndexState::default()),
        };
        index.rebuild(store)?;
        Ok(index)
    }

    /// Rebuild from scratch by walking parent links from the ref.
    pub fn rebuild(&self, store: &ObjectStore) -> Result<()> {
        let mut state = IndexState::default();
        let mut cursor = store.read_ref()?;
        while let Some(id) = cursor {
            let commit = store.read_commit(&id)?;
            let (_, revision) = decode_message(&commit.body)?;
            let revision = revision.as_i64();
            if state.by_revision.insert(revision, id).is_some() {
                return Err(StoreError::Storage(format!(
                    "duplicate revision {revision} in commit walk"
                )));
            }
            state.by_id.insert(id, revision);
            state.first = revision;
            if state.head == 0 {
                state.head = revision;
            }
            cursor = commit.parent_id;
        }
        let mut inner = self.inner.write().expect("index lock poisoned");
        *inner = state;
        Ok(())
    }

    /// 0 when the sub-repository has no commits yet.
    pub fn head_revision(&self) -> i64 {
        self.inner.read().expect("index lock poisoned").head
    }

    /// 0 when the sub-repository has no commits yet.
    pub fn first_revision(&self) -> i64 {
        self.inner.read().expect("index lock poisoned").first
    }

    pub fn id_of(&self, revision: i64) -> Option<ObjectId> {
        self.inner
            .read()
            .expect("index lock poisoned")
            .by_revision
            .get(&revision)
            .copied()
    }

    pub fn revision_of(&self, id: &ObjectId) -> Option<i64> {
        self.inner
            .read()
            .expect("index lock poisoned")
            .by_id
            .get(id)
            .copied()
    }

    /// Record a new head commit. Called after the ref update succeeded, so
    /// the ref is always at least as new as the index.
    pub fn put(&self, revision: i64, id: ObjectId) -> Result<()> {
        let mut inner = self.inner.write().expect("index lock poisoned");
        if inner.head != 0 && revision != inner.head + 1 {
            return Err(StoreError::Storage(format!(
                "non-contiguous index put: head {}, put {revision}",
                inner.head
            )));
        }
        inner.by_revision.insert(revision, id);
        inner.by_id.insert(id, revision);
        inner.head = revision;
        if inner.first == 0 {
            inner.first = revision;
        }
        Ok(())
    }

    /// Verify the cached head against the ref; rebuild on disagreement.
    pub fn verify_against(&self, store: &ObjectStore) -> Result<()> {
        let ref_head = match store.read_ref()? {
            Some(id) => {
                let commit = store.read_commit(&id)?;
                decode_message(&commit.body)?.1.as_i64()
            }
            None => 0,
        };
        let cached = self.head_revision();
        if ref_head != cached {
            warn!(cached, ref_head, "commit index stale, rebuilding from ref");
            self.rebuild(store)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use tempfile::tempdir;

    use super::*;
    use crate::{
        model::{Author, CommitMessage, Revision, commit::encode_message},
        storage::object::{CommitObject, Tree},
    };

    fn append_commit(store: &ObjectStore, revision: i64, parent: Option<ObjectId>) -> ObjectId {
        let commit = CommitObject {
            tree_id: store.put_tree(&Tree::default()).unwrap(),
            parent_id: parent,
            author: Author::new("t", "t@example.com"),
            when: Utc.timestamp_millis_opt(revision * 1000).unwrap(),
            body: encode_message(&CommitMessage::new(format!("c{revision}")), Revision::from(revision)),
        };
        let id = store.put_commit(&commit).unwrap();
        store.update_ref(parent, id).unwrap();
        id
    }

    #[test]
    fn test_build_from_ref_walk() {
        let dir = tempdir().unwrap();
        let store = ObjectStore::create(dir.path()).unwrap();
        let c1 = append_commit(&store, 1, None);
        let c2 = append_commit(&store, 2, Some(c1));
        let c3 = append_commit(&store, 3, Some(c2));

        let index = CommitIndex::build(&store).unwrap();
        assert_eq!(index.first_revision(), 1);
        assert_eq!(index.head_revision(), 3);
        assert_eq!(index.id_of(2), Some(c2));
        assert_eq!(index.revision_of(&c3), Some(3));
        assert_eq!(index.id_of(4), None);
    }

    #[test]
    fn test_empty_store() {
        let dir = tempdir().unwrap();
        let store = ObjectStore::create(dir.path()).unwrap();
        let index = CommitIndex::build(&store).unwrap();
        assert_eq!(index.head_revision(), 0);
        assert_eq!(index.first_revision(), 0);
    }

    #[test]
    fn test_put_must_be_contiguous() {
        let dir = tempdir().unwrap();
        let store = ObjectStore::create(dir.path()).unwrap();
        let c1 = append_commit(&store, 1, None);
        let index = CommitIndex::build(&store).unwrap();
        assert!(index.put(3, c1).is_err());
    }

    #[test]
    fn test_stale_index_rebuilds() {
        let dir = tempdir().unwrap();
        let store = ObjectStore::create(dir.path()).unwrap();
        let c1 = append_commit(&store, 1, None);
        let index = CommitIndex::build(&store).unwrap();

        // The ref moves behind the index's back.
        let c2 = append_commit(&store, 2, Some(c1));
        assert_eq!(index.head_revision(), 1);
        index.verify_against(&store).unwrap();
        assert_eq!(index.head_revision(), 2);
        assert_eq!(index.id_of(2), Some(c2));
    }

    #[test]
    fn test_first_revision_above_one() {
        // A compacted secondary starts at its snapshot revision.
        let dir = tempdir().unwrap();
        let store = ObjectStore::create(dir.path()).unwrap();
        let c7 = append_commit(&store, 7, None);
        let _c8 = append_commit(&store, 8, Some(c7));
        let index = CommitIndex::build(&store).unwrap();
        assert_eq!(index.first_revision(), 7);
        assert_eq!(index.head_revision(), 8);
    }
}
