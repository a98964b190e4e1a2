//! Repository lifecycle for one project: creation, opening, removal,
//! restoration, purging, and the per-project directory layout.
//!
//! Repositories live under `<data>/<project>/<repository>/`. Removal is a
//! tombstone rename to `.removed.<repository>` so the content survives
//! until an explicit purge; names always start with an alphanumeric, so a
//! tombstone can never collide with a live repository.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{info, warn};

use crate::{
    cache::{CacheStats, ComputationCache},
    config::StoreConfig,
    errors::{Result, StoreError},
    model::Author,
    repository::{Repository, compact::RetentionPolicy},
};

const REMOVED_PREFIX: &str = ".removed.";
const PURGE_MARKER: &str = ".purge";
const MAX_NAME_LEN: usize = 100;

/// Validate a project or repository name.
pub fn validate_name(name: &str) -> Result<()> {
    let invalid = |detail: &str| {
        Err(StoreError::InvalidArgument(format!(
            "invalid repository name `{name}`: {detail}"
        )))
    };
    if name.is_empty() {
        return invalid("empty");
    }
    if name.len() > MAX_NAME_LEN {
        return invalid("too long");
    }
    let bytes = name.as_bytes();
    if !bytes[0].is_ascii_alphanumeric() || !bytes[bytes.len() - 1].is_ascii_alphanumeric() {
        return invalid("must start and end with an alphanumeric");
    }
    for &b in bytes {
        if !(b.is_ascii_alphanumeric() || matches!(b, b'-' | b'+' | b'_' | b'.')) {
            return invalid("disallowed character");
        }
    }
    Ok(())
}

/// Manages the repositories of one project.
pub struct RepositoryManager {
    project_dir: PathBuf,
    project: String,
    cfg: StoreConfig,
    cache: Arc<ComputationCache>,
    repos: DashMap<String, Repository>,
}

impl RepositoryManager {
    /// Open the manager for `project`, loading every live repository found
    /// under its directory.
    pub fn new(
        data_dir: impl Into<PathBuf>,
        project: &str,
        cfg: StoreConfig,
        cache: Arc<ComputationCache>,
    ) -> Result<RepositoryManager> {
        validate_name(project)?;
        let project_dir = data_dir.into().join(project);
        fs::create_dir_all(&project_dir)?;
        let manager = RepositoryManager {
            project_dir,
            project: project.to_string(),
            cfg,
            cache,
            repos: DashMap::new(),
        };
        manager.open_all()?;
        Ok(manager)
    }

    fn open_all(&self) -> Result<()> {
        for entry in fs::read_dir(&self.project_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            match Repository::open(
                entry.path(),
                &self.project,
                &name,
                self.cfg.clone(),
                Arc::clone(&self.cache),
            ) {
                Ok(repo) => {
                    self.repos.insert(name, repo);
                }
                Err(e) => {
                    warn!(project = %self.project, name = %name, error = %e, "failed to open repository");
                    return Err(e);
                }
            }
        }
        info!(
            project = %self.project,
            repositories = self.repos.len(),
            "opened project"
        );
        Ok(())
    }

    fn repo_dir(&self, name: &str) -> PathBuf {
        self.project_dir.join(name)
    }

    fn tombstone_dir(&self, name: &str) -> PathBuf {
        self.project_dir.join(format!("{REMOVED_PREFIX}{name}"))
    }

    /// Create a repository with its initial commit authored by `author`.
    pub fn create(
        &self,
        name: &str,
        author: Author,
        when: DateTime<Utc>,
    ) -> Result<Repository> {
        validate_name(name)?;
        if self.repos.contains_key(name)
            || self.repo_dir(name).exists()
            || self.tombstone_dir(name).exists()
        {
            return Err(StoreError::RepositoryExists(name.to_string()));
        }
        let repo = Repository::create(
            self.repo_dir(name),
            &self.project,
            name,
            author,
            when,
            self.cfg.clone(),
            Arc::clone(&self.cache),
        )?;
        self.repos.insert(name.to_string(), repo.clone());
        Ok(repo)
    }

    /// Look up a live repository.
    pub fn get(&self, name: &str) -> Result<Repository> {
        self.repos
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StoreError::RepositoryNotFound(name.to_string()))
    }

    /// Names of live repositories, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.repos.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Names of removed (tombstoned) repositories, sorted.
    pub fn list_removed(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.project_dir)? {
            let entry = entry?;
            let file_name = entry.file_name().to_string_lossy().to_string();
            if let Some(name) = file_name.strip_prefix(REMOVED_PREFIX) {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Close a repository and tombstone its directory.
    pub fn remove(&self, name: &str) -> Result<()> {
        let (_, repo) = self
            .repos
            .remove(name)
            .ok_or_else(|| StoreError::RepositoryNotFound(name.to_string()))?;
        repo.close();
        fs::rename(self.repo_dir(name), self.tombstone_dir(name))?;
        info!(project = %self.project, name, "removed repository");
        Ok(())
    }

    /// Restore a tombstoned repository.
    pub fn unremove(&self, name: &str) -> Result<Repository> {
        validate_name(name)?;
        let tombstone = self.tombstone_dir(name);
        if !tombstone.exists() {
            return Err(StoreError::RepositoryNotFound(name.to_string()));
        }
        if self.repos.contains_key(name) {
            return Err(StoreError::RepositoryExists(name.to_string()));
        }
        // A pending purge mark does not survive restoration.
        let _ = fs::remove_file(tombstone.join(PURGE_MARKER));
        fs::rename(&tombstone, self.repo_dir(name))?;
        let repo = Repository::open(
            self.repo_dir(name),
            &self.project,
            name,
            self.cfg.clone(),
            Arc::clone(&self.cache),
        )?;
        self.repos.insert(name.to_string(), repo.clone());
        info!(project = %self.project, name, "restored repository");
        Ok(repo)
    }

    /// Irreversibly delete a removed repository.
    pub fn purge(&self, name: &str) -> Result<()> {
        let tombstone = self.tombstone_dir(name);
        if !tombstone.exists() {
            return Err(StoreError::RepositoryNotFound(name.to_string()));
        }
        fs::remove_dir_all(&tombstone)?;
        info!(project = %self.project, name, "purged repository");
        Ok(())
    }

    /// Mark a removed repository for deferred deletion by
    /// [`RepositoryManager::purge_marked`].
    pub fn mark_for_purge(&self, name: &str) -> Result<()> {
        let tombstone = self.tombstone_dir(name);
        if !tombstone.exists() {
            return Err(StoreError::RepositoryNotFound(name.to_string()));
        }
        fs::write(tombstone.join(PURGE_MARKER), b"")?;
        Ok(())
    }

    /// Delete every tombstone carrying a purge mark. Returns the purged
    /// names.
    pub fn purge_marked(&self) -> Result<Vec<String>> {
        let mut purged = Vec::new();
        for name in self.list_removed()? {
            if self.tombstone_dir(&name).join(PURGE_MARKER).exists() {
                self.purge(&name)?;
                purged.push(name);
            }
        }
        Ok(purged)
    }

    /// Run one compaction cycle over every live repository.
    pub fn compact_all(&self, now: DateTime<Utc>) -> Result<()> {
        let policy = RetentionPolicy::from_config(&self.cfg);
        if !policy.enabled() {
            return Ok(());
        }
        for entry in self.repos.iter() {
            entry.value().remove_old_commits(&policy, now)?;
        }
        Ok(())
    }

    /// Process-wide cache statistics.
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Close every repository; pending watches fail with the close error.
    pub fn close_all(&self) {
        for entry in self.repos.iter() {
            entry.value().close();
        }
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }
}

impl Drop for RepositoryManager {
    fn drop(&mut self) {
        self.close_all();
    }
}
