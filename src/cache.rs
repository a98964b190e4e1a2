//! The process-wide computation cache.
//!
//! Caches derived read results (file listings, single-entry queries, diffs,
//! history slices, tree comparisons) under keys that embed the repository
//! identity and the revision or tree IDs the result was computed from.
//! Because every key pins down immutable inputs, there is no explicit
//! invalidation: a new revision simply produces new keys and old entries
//! age out of the weight-bounded LRU.
//!
//! Misses are de-stampeded with a striped lock keyed by the key hash: two
//! concurrent misses on the same key compute once, while unrelated keys
//! proceed in parallel.

use std::{
    cell::Cell,
    collections::BTreeMap,
    hash::{DefaultHasher, Hash, Hasher},
    sync::{
        Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use lru_mem::{HeapSize, LruCache};
use std::sync::Arc;
use tracing::warn;

use crate::{
    errors::{Result, StoreError},
    hash::ObjectId,
    model::{Change, Commit, Entry},
};

const STRIPES: usize = 64;

/// Cacheable computation identity. Every variant embeds the repository
/// identity plus enough immutable context to make the result a pure
/// function of the key.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum CacheKey {
    Find {
        repo: String,
        revision: i64,
        pattern: String,
        fetch_content: bool,
        max_entries: usize,
    },
    Query {
        repo: String,
        revision: i64,
        query: String,
    },
    Diff {
        repo: String,
        from: i64,
        to: i64,
        pattern: String,
    },
    TreeCompare {
        repo: String,
        old_tree: ObjectId,
        new_tree: ObjectId,
        pattern: String,
    },
    History {
        repo: String,
        from: i64,
        to: i64,
        pattern: String,
        max_commits: usize,
    },
}

impl HeapSize for CacheKey {
    fn heap_size(&self) -> usize {
        match self {
            CacheKey::Find { repo, pattern, .. } => repo.len() + pattern.len(),
            CacheKey::Query { repo, query, .. } => repo.len() + query.len(),
            CacheKey::Diff { repo, pattern, .. } => repo.len() + pattern.len(),
            CacheKey::TreeCompare { repo, pattern, .. } => repo.len() + pattern.len(),
            CacheKey::History { repo, pattern, .. } => repo.len() + pattern.len(),
        }
    }
}

/// Cached result payload. Shared maps are behind `Arc` so a hit is a
/// pointer clone.
#[derive(Clone, Debug)]
pub enum CachedData {
    Entries(Arc<BTreeMap<String, Entry>>),
    Changes(Arc<BTreeMap<String, Change>>),
    History(Arc<Vec<Commit>>),
    TreeDiffers(bool),
}

impl CachedData {
    /// Serialized size as the cache weight. An estimate is enough; the
    /// point is that a 10 MB listing weighs vastly more than a boolean.
    fn estimate(&self) -> usize {
        let serialized = match self {
            CachedData::Entries(map) => serde_json::to_vec(map.as_ref()).map(|v| v.len()),
            CachedData::Changes(map) => serde_json::to_vec(map.as_ref()).map(|v| v.len()),
            CachedData::History(commits) => serde_json::to_vec(commits.as_ref()).map(|v| v.len()),
            CachedData::TreeDiffers(_) => Ok(std::mem::size_of::<bool>()),
        };
        serialized.unwrap_or(256).max(16)
    }
}

struct CacheValue {
    data: CachedData,
    weight: usize,
    last_access: Cell<Instant>,
}

impl HeapSize for CacheValue {
    fn heap_size(&self) -> usize {
        self.weight
    }
}

/// Hit/miss/weight statistics snapshot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub weight: usize,
}

/// Weight-bounded cache of derived read results.
pub struct ComputationCache {
    inner: Mutex<LruCache<CacheKey, CacheValue>>,
    stripes: [Mutex<()>; STRIPES],
    expire_after_access: Option<Duration>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ComputationCache {
    /// Build a cache from a spec string such as
    /// `"maximumWeight=134217728,expireAfterAccess=300s"`.
    pub fn new(spec: &str) -> Result<ComputationCache> {
        let (max_weight, ttl) = parse_spec(spec)?;
        Ok(ComputationCache {
            inner: Mutex::new(LruCache::new(max_weight)),
            stripes: std::array::from_fn(|_| Mutex::new(())),
            expire_after_access: ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }

    /// Look up `key`, running `compute` under the key's stripe lock on a
    /// miss. Errors from `compute` are never cached.
    pub fn get_or_compute<F>(&self, key: CacheKey, compute: F) -> Result<CachedData>
    where
        F: FnOnce() -> Result<CachedData>,
    {
        let stripe = {
            let mut hasher = DefaultHasher::new();
            key.hash(&mut hasher);
            (hasher.finish() as usize) % STRIPES
        };
        let _guard = self.stripes[stripe].lock().expect("cache stripe poisoned");
        if let Some(found) = self.lookup(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(found);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        let data = compute()?;
        let value = CacheValue {
            weight: data.estimate(),
            data: data.clone(),
            last_access: Cell::new(Instant::now()),
        };
        let mut cache = self.inner.lock().expect("cache poisoned");
        // An entry heavier than the whole cache is simply not retained.
        let _ = cache.insert(key, value);
        Ok(data)
    }

    fn lookup(&self, key: &CacheKey) -> Option<CachedData> {
        let mut cache = self.inner.lock().expect("cache poisoned");
        let expired = match cache.get(key) {
            None => return None,
            Some(value) => {
                let stale = self
                    .expire_after_access
                    .is_some_and(|ttl| value.last_access.get().elapsed() > ttl);
                if !stale {
                    value.last_access.set(Instant::now());
                    return Some(value.data.clone());
                }
                true
            }
        };
        if expired {
            cache.remove(key);
        }
        None
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            weight: self.inner.lock().expect("cache poisoned").current_size(),
        }
    }
}

fn parse_spec(spec: &str) -> Result<(usize, Option<Duration>)> {
    let mut max_weight = 128 * 1024 * 1024;
    let mut ttl = None;
    for part in spec.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let (key, value) = part.split_once('=').ok_or_else(|| {
            StoreError::InvalidArgument(format!("invalid cache spec entry `{part}`"))
        })?;
        match key.trim() {
            "maximumWeight" => {
                max_weight = value.trim().parse().map_err(|_| {
                    StoreError::InvalidArgument(format!("invalid maximumWeight `{value}`"))
                })?;
            }
            "expireAfterAccess" => {
                ttl = Some(parse_duration(value.trim())?);
            }
            other => {
                warn!(key = other, "ignoring unknown cache spec key");
            }
        }
    }
    Ok((max_weight, ttl))
}

fn parse_duration(value: &str) -> Result<Duration> {
    let bad = || StoreError::InvalidArgument(format!("invalid duration `{value}`"));
    let (digits, unit) = value.split_at(value.len().saturating_sub(1));
    let (digits, multiplier) = match unit {
        "s" => (digits, 1u64),
        "m" => (digits, 60),
        "h" => (digits, 3600),
        "d" => (digits, 86_400),
        _ if unit.chars().all(|c| c.is_ascii_digit()) => (value, 1),
        _ => return Err(bad()),
    };
    let count: u64 = digits.parse().map_err(|_| bad())?;
    Ok(Duration::from_secs(count * multiplier))
}
