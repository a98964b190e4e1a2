//! dogma-storage is the per-repository storage and watch engine of a
//! versioned, replicated configuration store: revision-addressed
//! content-addressed object storage, an atomic commit pipeline, path
//! pattern queries and diffs, long-poll watches, a weighted computation
//! cache, and online history compaction.
pub mod apply;
pub mod cache;
pub mod config;
pub mod errors;
pub mod hash;
pub mod jsonpatch;
pub mod jsonpath;
pub mod model;
pub mod pattern;
pub mod repository;
pub mod storage;
pub mod tree_diff;

pub use cache::{CacheStats, ComputationCache};
pub use config::StoreConfig;
pub use errors::{Result, StoreError};
pub use model::{
    Author, Change, ChangeContent, Commit, CommitMessage, Entry, EntryContent, EntryType, Markup,
    Query, Revision, RevisionRange,
};
pub use pattern::PathPattern;
pub use repository::{
    CommitResult, FindOptions, Repository, WatchFuture,
    compact::RetentionPolicy,
    manager::RepositoryManager,
};
