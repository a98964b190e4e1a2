//! The per-repository engine: normalization, reads, the atomic commit
//! pipeline, and long-poll watches.
//!
//! Every repository owns a reader-writer lock over its mutable state and a
//! bounded worker pool for blocking I/O; public operations submit a closure
//! to the pool and hand back a future. Commits run entirely under the
//! writer lock up to and including the head ref update, and watcher
//! notification happens strictly after the lock is released.

pub mod compact;
pub mod manager;
pub mod watch;

use std::{
    collections::BTreeMap,
    fs,
    future::Future,
    path::{Path, PathBuf},
    pin::Pin,
    sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard},
    task::{Context, Poll},
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use threadpool::ThreadPool;
use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::{
    apply::{OverlaySource, apply_changes},
    cache::{CacheKey, CachedData, ComputationCache},
    config::StoreConfig,
    errors::{Result, StoreError},
    hash::ObjectId,
    jsonpatch, jsonpath,
    model::{
        Author, Change, Commit, CommitMessage, Entry, EntryContent, Query, Revision,
        RevisionRange,
        commit::{decode_message, encode_message},
    },
    pattern::PathPattern,
    storage::{
        index::CommitIndex,
        object::CommitObject,
        store::{ObjectStore, TreeSnapshot},
    },
    tree_diff::{self, diff_snapshots, sanitize_text},
};

use watch::WatchCoordinator;

const METADATA_DIR: &str = "metadata";
const METADATA_FILE: &str = "metadata.json";

/// Names the active sub-repository directories under a repository root.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RepoMetadata {
    pub primary_repo_dir: String,
    pub secondary_repo_dir: Option<String>,
}

pub(crate) fn read_metadata(root: &Path) -> Result<RepoMetadata> {
    let raw = fs::read(root.join(METADATA_DIR).join(METADATA_FILE))
        .map_err(|e| StoreError::Storage(format!("missing repository metadata: {e}")))?;
    serde_json::from_slice(&raw)
        .map_err(|e| StoreError::Storage(format!("corrupt repository metadata: {e}")))
}

pub(crate) fn write_metadata(root: &Path, metadata: &RepoMetadata) -> Result<()> {
    let dir = root.join(METADATA_DIR);
    fs::create_dir_all(&dir)?;
    let tmp = NamedTempFile::new_in(&dir)?;
    let raw = serde_json::to_vec_pretty(metadata)
        .map_err(|e| StoreError::Storage(format!("metadata serialization: {e}")))?;
    fs::write(tmp.path(), raw)?;
    tmp.persist(dir.join(METADATA_FILE))
        .map_err(|e| StoreError::Storage(format!("persist metadata: {e}")))?;
    Ok(())
}

/// One sub-repository: an object store plus its commit index. A repository
/// has one primary and, while compaction is underway, one secondary.
pub(crate) struct SubRepo {
    pub dir_name: String,
    pub store: ObjectStore,
    pub index: CommitIndex,
}

impl SubRepo {
    pub(crate) fn create(root: &Path, dir_name: &str) -> Result<SubRepo> {
        let store = ObjectStore::create(root.join(dir_name))?;
        let index = CommitIndex::build(&store)?;
        Ok(SubRepo {
            dir_name: dir_name.to_string(),
            store,
            index,
        })
    }

    pub(crate) fn open(root: &Path, dir_name: &str) -> Result<SubRepo> {
        let store = ObjectStore::open(root.join(dir_name))?;
        let index = CommitIndex::build(&store)?;
        Ok(SubRepo {
            dir_name: dir_name.to_string(),
            store,
            index,
        })
    }

    pub(crate) fn commit_object_at(&self, revision: i64) -> Result<CommitObject> {
        let id = self
            .index
            .id_of(revision)
            .ok_or(StoreError::RevisionNotFound(revision))?;
        self.store.read_commit(&id)
    }

    pub(crate) fn snapshot_at(&self, revision: i64) -> Result<TreeSnapshot> {
        let commit = self.commit_object_at(revision)?;
        self.store.snapshot(commit.tree_id)
    }

    /// Write the parentless commit a sub-repository starts from. `files`
    /// must already name blobs present in this store.
    pub(crate) fn root_commit(
        &self,
        revision: i64,
        files: &BTreeMap<String, ObjectId>,
        author: &Author,
        when: DateTime<Utc>,
        message: &CommitMessage,
    ) -> Result<ObjectId> {
        let tree_id =
            crate::storage::object::write_trees(files, |tree| self.store.put_tree(tree))?;
        let commit = CommitObject {
            tree_id,
            parent_id: None,
            author: author.clone(),
            when,
            body: encode_message(message, Revision::from(revision)),
        };
        let id = self.store.put_commit(&commit)?;
        self.store.update_ref(None, id)?;
        self.index.put(revision, id)?;
        Ok(id)
    }
}

/// A commit captured while a secondary was being built, replayed into it at
/// attach time.
pub(crate) struct LaggedCommit {
    pub base: i64,
    pub revision: i64,
    pub author: Author,
    pub when: DateTime<Utc>,
    pub message: CommitMessage,
    pub changes: Vec<Change>,
}

pub(crate) struct RepoState {
    pub primary: Arc<SubRepo>,
    pub secondary: Option<Arc<SubRepo>>,
    pub creating_secondary: bool,
    pub lag: Vec<LaggedCommit>,
    /// Cached head revision; authoritative for the process lifetime.
    pub head: i64,
    pub closed: bool,
}

pub(crate) struct RepoInner {
    pub project: String,
    pub name: String,
    pub root: PathBuf,
    pub cfg: StoreConfig,
    pub cache: Arc<ComputationCache>,
    pub pool: ThreadPool,
    pub state: RwLock<RepoState>,
    pub watch: WatchCoordinator,
    /// Serializes secondary attach and promotion against each other.
    pub attach_lock: Mutex<()>,
}

impl RepoInner {
    pub(crate) fn repo_id(&self) -> String {
        format!("{}/{}", self.project, self.name)
    }
}

/// Options for [`Repository::find`].
#[derive(Clone, Copy, Debug)]
pub struct FindOptions {
    /// When false, entries carry a type-appropriate placeholder instead of
    /// their content.
    pub fetch_content: bool,
    /// Strict upper bound on the number of returned entries.
    pub max_entries: usize,
}

impl Default for FindOptions {
    fn default() -> Self {
        FindOptions {
            fetch_content: true,
            max_entries: 100_000,
        }
    }
}

/// Result of a successful commit.
#[derive(Debug)]
pub struct CommitResult {
    pub revision: Revision,
    /// The changes as materialized by the pipeline (upserts normalized,
    /// no-ops elided).
    pub changes: BTreeMap<String, Change>,
}

/// Handle to one repository. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Repository {
    inner: Arc<RepoInner>,
}

fn closed_error() -> StoreError {
    StoreError::Cancelled("repository is closing".to_string())
}

fn read_state(inner: &RepoInner) -> Result<RwLockReadGuard<'_, RepoState>> {
    let guard = inner.state.read().expect("repository state poisoned");
    if guard.closed {
        return Err(closed_error());
    }
    Ok(guard)
}

fn write_state(inner: &RepoInner) -> Result<RwLockWriteGuard<'_, RepoState>> {
    let guard = inner.state.write().expect("repository state poisoned");
    if guard.closed {
        return Err(closed_error());
    }
    Ok(guard)
}

impl Repository {
    /// Create a repository on disk with its synthetic initial commit at
    /// revision 1, and return the opened handle.
    pub fn create(
        root: impl Into<PathBuf>,
        project: &str,
        name: &str,
        author: Author,
        when: DateTime<Utc>,
        cfg: StoreConfig,
        cache: Arc<ComputationCache>,
    ) -> Result<Repository> {
        let root = root.into();
        if root.join(METADATA_DIR).join(METADATA_FILE).exists() {
            return Err(StoreError::RepositoryExists(name.to_string()));
        }
        fs::create_dir_all(&root)?;
        let dir_name = store_dir_name(1);
        write_metadata(
            &root,
            &RepoMetadata {
                primary_repo_dir: dir_name.clone(),
                secondary_repo_dir: None,
            },
        )?;
        let primary = SubRepo::create(&root, &dir_name)?;
        primary.root_commit(
            1,
            &BTreeMap::new(),
            &author,
            when,
            &CommitMessage::new("Create a new repository."),
        )?;
        info!(project, name, "created repository");
        Ok(Repository::assemble(root, project, name, primary, None, cfg, cache))
    }

    /// Open an existing repository from its metadata database.
    pub fn open(
        root: impl Into<PathBuf>,
        project: &str,
        name: &str,
        cfg: StoreConfig,
        cache: Arc<ComputationCache>,
    ) -> Result<Repository> {
        let root = root.into();
        let metadata = read_metadata(&root)?;
        let primary = SubRepo::open(&root, &metadata.primary_repo_dir)?;
        primary.index.verify_against(&primary.store)?;
        let mut secondary = None;
        if let Some(dir) = &metadata.secondary_repo_dir {
            match SubRepo::open(&root, dir) {
                Ok(sub) if sub.index.head_revision() == primary.index.head_revision() => {
                    secondary = Some(sub);
                }
                // A secondary that lags the primary (or fails to open) is
                // dropped; the next compaction cycle rebuilds it.
                _ => {
                    info!(project, name, dir = dir.as_str(), "discarding stale secondary");
                    let _ = fs::remove_dir_all(root.join(dir));
                    let mut fixed = metadata.clone();
                    fixed.secondary_repo_dir = None;
                    write_metadata(&root, &fixed)?;
                }
            }
        }
        Ok(Repository::assemble(root, project, name, primary, secondary, cfg, cache))
    }

    fn assemble(
        root: PathBuf,
        project: &str,
        name: &str,
        primary: SubRepo,
        secondary: Option<SubRepo>,
        cfg: StoreConfig,
        cache: Arc<ComputationCache>,
    ) -> Repository {
        let head = primary.index.head_revision();
        let workers = cfg.num_repository_workers.max(1);
        Repository {
            inner: Arc::new(RepoInner {
                project: project.to_string(),
                name: name.to_string(),
                root,
                cfg,
                cache,
                pool: ThreadPool::new(workers),
                state: RwLock::new(RepoState {
                    primary: Arc::new(primary),
                    secondary: secondary.map(Arc::new),
                    creating_secondary: false,
                    lag: Vec::new(),
                    head,
                    closed: false,
                }),
                watch: WatchCoordinator::new(),
                attach_lock: Mutex::new(()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn project(&self) -> &str {
        &self.inner.project
    }

    pub fn head_revision(&self) -> i64 {
        self.inner.state.read().expect("repository state poisoned").head
    }

    pub fn first_revision(&self) -> i64 {
        self.inner
            .state
            .read()
            .expect("repository state poisoned")
            .primary
            .index
            .first_revision()
    }

    /// Fail all new operations and complete all pending watches with the
    /// close error.
    pub fn close(&self) {
        {
            let mut state = self.inner.state.write().expect("repository state poisoned");
            if state.closed {
                return;
            }
            state.closed = true;
        }
        self.inner.watch.close();
        info!(repo = %self.inner.repo_id(), "closed repository");
    }

    fn deadline(&self) -> Option<Instant> {
        let millis = self.inner.cfg.request_timeout_millis;
        (millis > 0).then(|| Instant::now() + Duration::from_millis(millis))
    }

    /// Run a blocking closure on the repository's worker pool.
    async fn execute<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&RepoInner) -> Result<T> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let deadline = self.deadline();
        let (tx, rx) = oneshot::channel();
        self.inner.pool.execute(move || {
            let result = if deadline.is_some_and(|d| Instant::now() > d) {
                Err(StoreError::RequestTimeout)
            } else {
                f(&inner)
            };
            let _ = tx.send(result);
        });
        rx.await
            .map_err(|_| StoreError::Cancelled("operation dropped by worker".to_string()))?
    }

    /// Convert a possibly relative revision to an absolute one.
    pub async fn normalize(&self, revision: Revision) -> Result<Revision> {
        self.execute(move |inner| {
            let state = read_state(inner)?;
            normalize_in(&state, revision)
        })
        .await
    }

    /// List entries at `revision` matching `pattern`, path-ordered.
    pub async fn find(
        &self,
        revision: Revision,
        pattern: &str,
        options: FindOptions,
    ) -> Result<BTreeMap<String, Entry>> {
        let pattern = pattern.to_string();
        self.execute(move |inner| find_in(inner, revision, &pattern, options))
            .await
    }

    /// Run a query against one file. Fails with `EntryNotFound` when the
    /// path is absent.
    pub async fn get(&self, revision: Revision, query: Query) -> Result<Entry> {
        self.execute(move |inner| get_in(inner, revision, &query)).await
    }

    /// `get`, with `EntryNotFound` mapped to `None`.
    pub async fn get_or_null(&self, revision: Revision, query: Query) -> Result<Option<Entry>> {
        match self.get(revision, query).await {
            Ok(entry) => Ok(Some(entry)),
            Err(StoreError::EntryNotFound(..)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Changes between two revisions under a pattern. The range is
    /// normalized ascending, so argument order does not matter.
    pub async fn diff(
        &self,
        from: Revision,
        to: Revision,
        pattern: &str,
    ) -> Result<BTreeMap<String, Change>> {
        let pattern = pattern.to_string();
        self.execute(move |inner| diff_in(inner, from, to, &pattern))
            .await
    }

    /// The change to a single queried file between two revisions.
    pub async fn diff_query(
        &self,
        from: Revision,
        to: Revision,
        query: Query,
    ) -> Result<Change> {
        self.execute(move |inner| diff_query_in(inner, from, to, &query))
            .await
    }

    /// The changes a commit of `changes` against `base` would materialize,
    /// without persisting anything.
    pub async fn preview_diff(
        &self,
        base: Revision,
        changes: Vec<Change>,
    ) -> Result<BTreeMap<String, Change>> {
        self.execute(move |inner| {
            let state = read_state(inner)?;
            let base = normalize_in(&state, base)?;
            let snapshot = state.primary.snapshot_at(base.as_i64())?;
            preview_changes(&state.primary.store, &snapshot, &changes)
        })
        .await
    }

    /// Commits whose tree affects `pattern`, walked in the `from -> to`
    /// direction and truncated to `max_commits` (further capped by the
    /// server-wide maximum).
    pub async fn history(
        &self,
        from: Revision,
        to: Revision,
        pattern: &str,
        max_commits: usize,
    ) -> Result<Vec<Commit>> {
        let pattern = pattern.to_string();
        self.execute(move |inner| history_in(inner, from, to, &pattern, max_commits))
            .await
    }

    /// Most recent revision newer than `last_known` touching `pattern`,
    /// or `None` when nothing newer matches.
    pub async fn find_latest_revision(
        &self,
        last_known: Revision,
        pattern: &str,
    ) -> Result<Option<Revision>> {
        let pattern = pattern.to_string();
        self.execute(move |inner| {
            let filter = PathPattern::compile(&pattern)?;
            let state = read_state(inner)?;
            let last_known = normalize_in(&state, last_known)?;
            find_latest_in(inner, &state, last_known.as_i64(), &filter)
        })
        .await
    }

    /// Wait for a revision newer than `last_known` that touches `pattern`.
    /// Resolves immediately when one already exists.
    pub async fn watch(&self, last_known: Revision, pattern: &str) -> Result<WatchFuture> {
        let pattern = pattern.to_string();
        let inner = Arc::clone(&self.inner);
        let outcome = self
            .execute(move |inner| {
                let filter = PathPattern::compile(&pattern)?;
                let state = read_state(inner)?;
                let last_known = normalize_in(&state, last_known)?;
                match find_latest_in(inner, &state, last_known.as_i64(), &filter)? {
                    Some(revision) => Ok(WatchOutcome::Ready(revision)),
                    None => {
                        let (id, receiver) =
                            inner.watch.register(last_known.as_i64(), filter);
                        Ok(WatchOutcome::Pending(id, receiver))
                    }
                }
            })
            .await?;
        Ok(match outcome {
            WatchOutcome::Ready(revision) => WatchFuture {
                inner,
                id: None,
                state: WatchFutureState::Ready(Some(Ok(revision))),
            },
            WatchOutcome::Pending(id, receiver) => WatchFuture {
                inner,
                id: Some(id),
                state: WatchFutureState::Waiting(receiver),
            },
        })
    }

    /// Commit `changes` against `base`. With `direct_execution` the
    /// pipeline first materializes a preview diff and commits that instead,
    /// normalizing upserts and eliding no-ops.
    #[allow(clippy::too_many_arguments)]
    pub async fn commit(
        &self,
        base: Revision,
        when: DateTime<Utc>,
        author: Author,
        message: CommitMessage,
        changes: Vec<Change>,
        direct_execution: bool,
    ) -> Result<CommitResult> {
        self.execute(move |inner| {
            commit_in(inner, base, when, author, message, changes, direct_execution, false)
        })
        .await
    }

    pub(crate) fn inner(&self) -> &Arc<RepoInner> {
        &self.inner
    }
}

pub(crate) fn store_dir_name(revision: i64) -> String {
    format!("store-{revision:010}")
}

enum WatchOutcome {
    Ready(Revision),
    Pending(u64, oneshot::Receiver<Result<Revision>>),
}

enum WatchFutureState {
    Ready(Option<Result<Revision>>),
    Waiting(oneshot::Receiver<Result<Revision>>),
}

/// A pending watch. Dropping it (or calling [`WatchFuture::cancel`])
/// removes the registration.
pub struct WatchFuture {
    inner: Arc<RepoInner>,
    id: Option<u64>,
    state: WatchFutureState,
}

impl WatchFuture {
    /// Withdraw the registration. The future will never resolve after
    /// this.
    pub fn cancel(&mut self) {
        if let Some(id) = self.id.take() {
            self.inner.watch.cancel(id);
        }
    }
}

impl Future for WatchFuture {
    type Output = Result<Revision>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &mut this.state {
            WatchFutureState::Ready(slot) => {
                let result = slot.take().expect("watch future polled after completion");
                this.id = None;
                Poll::Ready(result)
            }
            WatchFutureState::Waiting(receiver) => match Pin::new(receiver).poll(cx) {
                Poll::Pending => Poll::Pending,
                Poll::Ready(Ok(result)) => {
                    this.id = None;
                    Poll::Ready(result)
                }
                Poll::Ready(Err(_)) => {
                    this.id = None;
                    Poll::Ready(Err(closed_error()))
                }
            },
        }
    }
}

impl Drop for WatchFuture {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            self.inner.watch.cancel(id);
        }
    }
}

fn normalize_in(state: &RepoState, revision: Revision) -> Result<Revision> {
    revision.normalize(state.primary.index.first_revision(), state.head)
}

fn find_in(
    inner: &RepoInner,
    revision: Revision,
    pattern: &str,
    options: FindOptions,
) -> Result<BTreeMap<String, Entry>> {
    if options.max_entries == 0 {
        return Err(StoreError::InvalidArgument(
            "max_entries must be positive".to_string(),
        ));
    }
    let filter = PathPattern::compile(pattern)?;
    let state = read_state(inner)?;
    // A revision past the head yields an empty listing rather than an
    // error, unlike the other read operations.
    if revision.as_i64() > state.head {
        return Ok(BTreeMap::new());
    }
    let revision = normalize_in(&state, revision)?;
    let key = CacheKey::Find {
        repo: inner.repo_id(),
        revision: revision.as_i64(),
        pattern: filter.as_str().to_string(),
        fetch_content: options.fetch_content,
        max_entries: options.max_entries,
    };
    let data = inner.cache.get_or_compute(key, || {
        let snapshot = state.primary.snapshot_at(revision.as_i64())?;
        let mut entries = BTreeMap::new();
        for dir in snapshot.directories() {
            if filter.matches(&dir) {
                entries.insert(dir.clone(), Entry::directory(revision, dir));
            }
        }
        for (path, id) in &snapshot.files {
            if !filter.matches(path) {
                continue;
            }
            let entry = if options.fetch_content {
                entry_from_blob(&state.primary.store, revision, path, id)?
            } else {
                Entry::placeholder(revision, path)
            };
            entries.insert(path.clone(), entry);
        }
        while entries.len() > options.max_entries {
            entries.pop_last();
        }
        Ok(CachedData::Entries(Arc::new(entries)))
    })?;
    match data {
        CachedData::Entries(map) => Ok(map.as_ref().clone()),
        _ => Err(StoreError::Storage("cache value kind mismatch".to_string())),
    }
}

fn entry_from_blob(
    store: &ObjectStore,
    revision: Revision,
    path: &str,
    id: &ObjectId,
) -> Result<Entry> {
    let content = store.read_blob(id)?;
    if path.ends_with(".json") {
        let value = serde_json::from_slice(&content)
            .map_err(|e| StoreError::Storage(format!("stored entry `{path}` is not JSON: {e}")))?;
        Ok(Entry::json(revision, path, value))
    } else {
        let text = String::from_utf8(content)
            .map_err(|_| StoreError::Storage(format!("stored entry `{path}` is not UTF-8")))?;
        Ok(Entry::text(revision, path, text))
    }
}

fn get_in(inner: &RepoInner, revision: Revision, query: &Query) -> Result<Entry> {
    let state = read_state(inner)?;
    let revision = normalize_in(&state, revision)?;
    let key = CacheKey::Query {
        repo: inner.repo_id(),
        revision: revision.as_i64(),
        query: query.cache_key(),
    };
    let data = inner.cache.get_or_compute(key, || {
        let snapshot = state.primary.snapshot_at(revision.as_i64())?;
        let entry = query_snapshot(&state.primary.store, &snapshot, revision, query)?;
        let mut map = BTreeMap::new();
        map.insert(entry.path.clone(), entry);
        Ok(CachedData::Entries(Arc::new(map)))
    })?;
    match data {
        CachedData::Entries(map) => map
            .values()
            .next()
            .cloned()
            .ok_or_else(|| StoreError::Storage("empty cached query result".to_string())),
        _ => Err(StoreError::Storage("cache value kind mismatch".to_string())),
    }
}

fn query_snapshot(
    store: &ObjectStore,
    snapshot: &TreeSnapshot,
    revision: Revision,
    query: &Query,
) -> Result<Entry> {
    let path = query.path();
    let id = snapshot
        .files
        .get(path)
        .ok_or_else(|| StoreError::EntryNotFound(revision.as_i64(), path.to_string()))?;
    let entry = entry_from_blob(store, revision, path, id)?;
    match query {
        Query::Identity { .. } => Ok(entry),
        Query::Text { .. } => {
            let text = match entry.content {
                EntryContent::Text(text) => text,
                EntryContent::Json(value) => value.to_string(),
                EntryContent::Directory => unreachable!("blob entries are files"),
            };
            Ok(Entry::text(revision, path, text))
        }
        Query::Json { .. } => {
            let value = match entry.content {
                EntryContent::Json(value) => value,
                EntryContent::Text(text) => serde_json::from_str(&text).map_err(|e| {
                    StoreError::InvalidArgument(format!(
                        "`{path}` does not hold valid JSON: {e}"
                    ))
                })?,
                EntryContent::Directory => unreachable!("blob entries are files"),
            };
            Ok(Entry::json(revision, path, value))
        }
        Query::JsonPath { expressions, .. } => {
            let EntryContent::Json(mut value) = entry.content else {
                return Err(StoreError::InvalidArgument(format!(
                    "JSON path query on non-JSON entry: {path}"
                )));
            };
            for expression in expressions {
                value = jsonpath::evaluate(&value, expression)?.ok_or_else(|| {
                    StoreError::EntryNotFound(
                        revision.as_i64(),
                        format!("{path} (JSON path `{expression}` selected nothing)"),
                    )
                })?;
            }
            Ok(Entry::json(revision, path, value))
        }
    }
}

fn diff_in(
    inner: &RepoInner,
    from: Revision,
    to: Revision,
    pattern: &str,
) -> Result<BTreeMap<String, Change>> {
    let filter = PathPattern::compile(pattern)?;
    let state = read_state(inner)?;
    let range = RevisionRange::new(from, to)
        .normalize(state.primary.index.first_revision(), state.head)?
        .ascending();
    if range.from == range.to {
        return Ok(BTreeMap::new());
    }
    let key = CacheKey::Diff {
        repo: inner.repo_id(),
        from: range.from.as_i64(),
        to: range.to.as_i64(),
        pattern: filter.as_str().to_string(),
    };
    let data = inner.cache.get_or_compute(key, || {
        let old = state.primary.snapshot_at(range.from.as_i64())?;
        let new = state.primary.snapshot_at(range.to.as_i64())?;
        let entries = diff_snapshots(&old, &new, &filter);
        let changes = tree_diff::to_changes(&state.primary.store, &entries)?;
        Ok(CachedData::Changes(Arc::new(changes)))
    })?;
    match data {
        CachedData::Changes(map) => Ok(map.as_ref().clone()),
        _ => Err(StoreError::Storage("cache value kind mismatch".to_string())),
    }
}

fn diff_query_in(
    inner: &RepoInner,
    from: Revision,
    to: Revision,
    query: &Query,
) -> Result<Change> {
    let state = read_state(inner)?;
    let range = RevisionRange::new(from, to)
        .normalize(state.primary.index.first_revision(), state.head)?
        .ascending();
    let path = query.path().to_string();
    let old = query_or_none(&state, range.from, query)?;
    let new = query_or_none(&state, range.to, query)?;
    match (old, new) {
        (None, None) => Err(StoreError::EntryNotFound(range.to.as_i64(), path)),
        (None, Some(entry)) => Ok(match entry.content {
            EntryContent::Json(value) => Change::upsert_json(&path, value),
            EntryContent::Text(text) => Change::upsert_text(&path, text),
            EntryContent::Directory => unreachable!("queries address files"),
        }),
        (Some(_), None) => Ok(Change::remove(&path)),
        (Some(old), Some(new)) => Ok(match (old.content, new.content) {
            (EntryContent::Json(old), EntryContent::Json(new)) => {
                Change::apply_json_patch(&path, jsonpatch::generate(&old, &new))
            }
            (EntryContent::Text(old), EntryContent::Text(new)) => {
                Change::apply_text_patch(&path, sanitize_text(&old), sanitize_text(&new))
            }
            _ => {
                return Err(StoreError::InvalidArgument(format!(
                    "entry type changed between revisions: {path}"
                )));
            }
        }),
    }
}

fn query_or_none(state: &RepoState, revision: Revision, query: &Query) -> Result<Option<Entry>> {
    let snapshot = state.primary.snapshot_at(revision.as_i64())?;
    match query_snapshot(&state.primary.store, &snapshot, revision, query) {
        Ok(entry) => Ok(Some(entry)),
        Err(StoreError::EntryNotFound(..)) => Ok(None),
        Err(e) => Err(e),
    }
}

fn history_in(
    inner: &RepoInner,
    from: Revision,
    to: Revision,
    pattern: &str,
    max_commits: usize,
) -> Result<Vec<Commit>> {
    if max_commits == 0 {
        return Err(StoreError::InvalidArgument(
            "max_commits must be positive".to_string(),
        ));
    }
    let max_commits = max_commits.min(inner.cfg.max_num_commits_per_history);
    let filter = PathPattern::compile(pattern)?;
    let state = read_state(inner)?;
    let first = state.primary.index.first_revision();
    let range = RevisionRange::new(from, to).normalize(first, state.head)?;
    let key = CacheKey::History {
        repo: inner.repo_id(),
        from: range.from.as_i64(),
        to: range.to.as_i64(),
        pattern: filter.as_str().to_string(),
        max_commits,
    };
    let data = inner.cache.get_or_compute(key, || {
        let ascending = range.from.as_i64() <= range.to.as_i64();
        let span = range.ascending();
        let (lo, hi) = (span.from.as_i64(), span.to.as_i64());
        let revisions: Box<dyn Iterator<Item = i64>> = if ascending {
            Box::new(lo..=hi)
        } else {
            Box::new((lo..=hi).rev())
        };
        let mut commits = Vec::new();
        for revision in revisions {
            if commits.len() == max_commits {
                break;
            }
            let commit = state.primary.commit_object_at(revision)?;
            let touched = if filter.matches_all() {
                true
            } else {
                let new = state.primary.store.snapshot(commit.tree_id)?;
                let old = if revision > first {
                    state.primary.snapshot_at(revision - 1)?
                } else {
                    TreeSnapshot::empty()
                };
                !diff_snapshots(&old, &new, &filter).is_empty()
            };
            if touched {
                let (message, stored_revision) = decode_message(&commit.body)?;
                if stored_revision.as_i64() != revision {
                    return Err(StoreError::Storage(format!(
                        "commit at revision {revision} claims revision {stored_revision}"
                    )));
                }
                commits.push(Commit {
                    revision: Revision::from(revision),
                    author: commit.author,
                    when: commit.when,
                    message,
                });
            }
        }
        Ok(CachedData::History(Arc::new(commits)))
    })?;
    match data {
        CachedData::History(commits) => Ok(commits.as_ref().clone()),
        _ => Err(StoreError::Storage("cache value kind mismatch".to_string())),
    }
}

fn find_latest_in(
    inner: &RepoInner,
    state: &RepoState,
    last_known: i64,
    filter: &PathPattern,
) -> Result<Option<Revision>> {
    let head = state.head;
    if head <= last_known {
        return Ok(None);
    }
    let first = state.primary.index.first_revision();
    // Fast path: a watcher that only ever saw the empty initial revision
    // is satisfied by any matching file at the head.
    if last_known == 1 && first == 1 {
        let snapshot = state.primary.snapshot_at(head)?;
        let any = snapshot.files.keys().any(|path| filter.matches(path));
        return Ok(any.then(|| Revision::from(head)));
    }
    let old = state.primary.snapshot_at(last_known)?;
    let new = state.primary.snapshot_at(head)?;
    let key = CacheKey::TreeCompare {
        repo: inner.repo_id(),
        old_tree: old.tree_id,
        new_tree: new.tree_id,
        pattern: filter.as_str().to_string(),
    };
    let data = inner.cache.get_or_compute(key, || {
        Ok(CachedData::TreeDiffers(
            !diff_snapshots(&old, &new, filter).is_empty(),
        ))
    })?;
    match data {
        CachedData::TreeDiffers(differs) => Ok(differs.then(|| Revision::from(head))),
        _ => Err(StoreError::Storage("cache value kind mismatch".to_string())),
    }
}

/// Materialize the changes a commit would produce, without persisting.
fn preview_changes(
    store: &ObjectStore,
    base: &TreeSnapshot,
    changes: &[Change],
) -> Result<BTreeMap<String, Change>> {
    let (worktree, _) = apply_changes(store, base, changes)?;
    let new = worktree.to_snapshot();
    let entries = diff_snapshots(base, &new, &PathPattern::all());
    let overlay = OverlaySource::new(store, &worktree);
    tree_diff::to_changes(&overlay, &entries)
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn commit_in(
    inner: &RepoInner,
    base: Revision,
    when: DateTime<Utc>,
    author: Author,
    message: CommitMessage,
    changes: Vec<Change>,
    direct_execution: bool,
    allow_empty: bool,
) -> Result<CommitResult> {
    let mut state = write_state(inner)?;
    let primary = Arc::clone(&state.primary);
    let head = state.head;
    let base = normalize_in(&state, base)?;
    if base.as_i64() != head {
        return Err(StoreError::ChangeConflict(format!(
            "base revision {} is not the head revision {head}",
            base.as_i64()
        )));
    }
    let new_revision = head + 1;
    let base_snapshot = primary.snapshot_at(head)?;

    let effective: Vec<Change> = if direct_execution {
        preview_changes(&primary.store, &base_snapshot, &changes)?
            .into_values()
            .collect()
    } else {
        changes
    };

    let (worktree, num_edits) = apply_changes(&primary.store, &base_snapshot, &effective)?;
    if num_edits == 0 && !allow_empty {
        return Err(StoreError::RedundantChange);
    }
    let new_snapshot = worktree.to_snapshot();
    let entries = diff_snapshots(&base_snapshot, &new_snapshot, &PathPattern::all());
    if entries.is_empty() && !allow_empty {
        return Err(StoreError::RedundantChange);
    }

    let overlay = OverlaySource::new(&primary.store, &worktree);
    let materialized = tree_diff::to_changes(&overlay, &entries)?;
    let changed_paths: Vec<String> = entries
        .iter()
        .map(|entry| entry.changed_path().to_string())
        .collect();

    // Replay into an attached secondary first: a replay failure must abort
    // the commit before the primary ref swings.
    if let Some(secondary) = state.secondary.clone() {
        replay_commit(
            &secondary,
            head,
            new_revision,
            &author,
            when,
            &message,
            &effective,
        )?;
    }

    let tree_id = worktree.persist(&primary.store)?;
    let parent_id = primary
        .index
        .id_of(head)
        .ok_or_else(|| StoreError::Storage(format!("missing head commit {head}")))?;
    let commit_object = CommitObject {
        tree_id,
        parent_id: Some(parent_id),
        author: author.clone(),
        when,
        body: encode_message(&message, Revision::from(new_revision)),
    };
    let commit_id = primary.store.put_commit(&commit_object)?;
    primary.store.update_ref(Some(parent_id), commit_id)?;
    primary.index.put(new_revision, commit_id)?;
    state.head = new_revision;

    if state.secondary.is_none() && state.creating_secondary {
        state.lag.push(LaggedCommit {
            base: head,
            revision: new_revision,
            author,
            when,
            message,
            changes: effective,
        });
    }
    drop(state);

    inner.watch.notify(Revision::from(new_revision), &changed_paths);
    debug!(
        repo = %inner.repo_id(),
        revision = new_revision,
        changes = materialized.len(),
        "committed"
    );
    Ok(CommitResult {
        revision: Revision::from(new_revision),
        changes: materialized,
    })
}


/// Apply one primary commit to a secondary sub-repository. Any failure is
/// a `Storage` error: the mirrors must never diverge.
pub(crate) fn replay_commit(
    secondary: &SubRepo,
    base: i64,
    revision: i64,
    author: &Author,
    when: DateTime<Utc>,
    message: &CommitMessage,
    changes: &[Change],
) -> Result<()> {
    let replay = || -> Result<()> {
        if secondary.index.head_revision() != base {
            return Err(StoreError::Storage(format!(
                "secondary head {} does not match base {base}",
                secondary.index.head_revision()
            )));
        }
        let base_snapshot = secondary.snapshot_at(base)?;
        let (worktree, _) = apply_changes(&secondary.store, &base_snapshot, changes)?;
        let tree_id = worktree.persist(&secondary.store)?;
        let parent_id = secondary
            .index
            .id_of(base)
            .ok_or_else(|| StoreError::Storage(format!("missing secondary commit {base}")))?;
        let commit = CommitObject {
            tree_id,
            parent_id: Some(parent_id),
            author: author.clone(),
            when,
            body: encode_message(message, Revision::from(revision)),
        };
        let id = secondary.store.put_commit(&commit)?;
        secondary.store.update_ref(Some(parent_id), id)?;
        secondary.index.put(revision, id)?;
        Ok(())
    };
    replay().map_err(|e| StoreError::Storage(format!("secondary replay failed: {e}")))
}
